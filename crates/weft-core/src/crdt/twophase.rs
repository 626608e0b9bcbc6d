use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::gset::GSet;
use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, decode, element_arg, encode,
};

/// Two-phase set: an element may be added and later removed, but a removal
/// is permanent. Re-adding a removed element has no visible effect.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwoPhaseSet {
    pub added: GSet,
    pub removed: GSet,
}

impl TwoPhaseSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        self.added.contains(element) && !self.removed.contains(element)
    }

    #[must_use]
    pub fn elements(&self) -> BTreeSet<String> {
        self.added
            .elements
            .difference(&self.removed.elements)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TwoPhaseSetPolicy;

const NAME: &str = "2p-set";

impl TypePolicy for TwoPhaseSetPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::TwoPhaseSet(TwoPhaseSet::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let op: Phase = decode(message)?;
        let Accumulator::TwoPhaseSet(set) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        match op {
            Phase::Add(element) => set.added.insert(element),
            Phase::Remove(element) => set.removed.insert(element),
        }
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::TwoPhaseSet(set) => Value::Set(set.elements()),
            _ => Value::Set(BTreeSet::new()),
        }
    }

    fn mutators(&self) -> &[&'static str] {
        &["add", "remove"]
    }

    fn mutate(
        &self,
        mutator: &str,
        args: &[Json],
        _ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError> {
        let op = match mutator {
            "add" => Phase::Add(element_arg(mutator, args)?),
            "remove" => Phase::Remove(element_arg(mutator, args)?),
            other => return Err(PolicyError::UnknownMutator(other.to_string())),
        };
        encode(&op)
    }
}
