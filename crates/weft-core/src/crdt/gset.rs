use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, decode, element_arg, encode,
};

/// Grow-only set. Merge is union, so elements can never be removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GSet {
    pub elements: BTreeSet<String>,
}

impl GSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, element: String) {
        self.elements.insert(element);
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        self.elements.contains(element)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Add {
    pub add: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GSetPolicy;

const NAME: &str = "g-set";

impl TypePolicy for GSetPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::GSet(GSet::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let op: Add = decode(message)?;
        let Accumulator::GSet(set) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        set.insert(op.add);
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::GSet(set) => Value::Set(set.elements.clone()),
            _ => Value::Set(BTreeSet::new()),
        }
    }

    fn mutators(&self) -> &[&'static str] {
        &["add"]
    }

    fn mutate(
        &self,
        mutator: &str,
        args: &[Json],
        _ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError> {
        match mutator {
            "add" => encode(&Add {
                add: element_arg(mutator, args)?,
            }),
            other => Err(PolicyError::UnknownMutator(other.to_string())),
        }
    }
}
