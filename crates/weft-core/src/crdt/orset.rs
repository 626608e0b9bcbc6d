//! Observed-remove set with add-wins semantics.
//!
//! Each add carries a fresh unique tag. A remove tombstones only the tags its
//! author had observed for the element, so an add that was concurrent with
//! the remove introduces a tag the remove never saw and survives.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, decode, element_arg, encode,
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrSet {
    /// `(element, tag)` pairs ever added.
    pub elements: BTreeSet<(String, String)>,
    /// `(element, tag)` pairs removed.
    pub tombstone: BTreeSet<(String, String)>,
}

impl OrSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: String, tag: String) {
        self.elements.insert((element, tag));
    }

    /// Tombstone the given tags of `element`. Tags that were never added are
    /// tombstoned anyway so a late add cannot resurrect them.
    pub fn remove(&mut self, element: &str, tags: impl IntoIterator<Item = String>) {
        for tag in tags {
            self.tombstone.insert((element.to_string(), tag));
        }
    }

    /// Tags of `element` that are added and not tombstoned.
    #[must_use]
    pub fn active_tags(&self, element: &str) -> Vec<String> {
        self.elements
            .iter()
            .filter(|pair| pair.0 == element && !self.tombstone.contains(*pair))
            .map(|(_, tag)| tag.clone())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        !self.active_tags(element).is_empty()
    }

    #[must_use]
    pub fn values(&self) -> BTreeSet<String> {
        self.elements
            .iter()
            .filter(|pair| !self.tombstone.contains(*pair))
            .map(|(element, _)| element.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrSetOp {
    Add { element: String, tag: String },
    Remove { element: String, tags: Vec<String> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrSetPolicy;

const NAME: &str = "or-set";

impl TypePolicy for OrSetPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::OrSet(OrSet::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let op: OrSetOp = decode(message)?;
        let Accumulator::OrSet(set) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        match op {
            OrSetOp::Add { element, tag } => set.add(element, tag),
            OrSetOp::Remove { element, tags } => set.remove(&element, tags),
        }
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::OrSet(set) => Value::Set(set.values()),
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
        ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError> {
        let op = match mutator {
            "add" => OrSetOp::Add {
                element: element_arg(mutator, args)?,
                tag: Uuid::new_v4().to_string(),
            },
            "remove" => {
                let element = element_arg(mutator, args)?;
                let tags = match ctx.accumulator {
                    Accumulator::OrSet(set) => set.active_tags(&element),
                    _ => Vec::new(),
                };
                OrSetOp::Remove { element, tags }
            }
            other => return Err(PolicyError::UnknownMutator(other.to_string())),
        };
        encode(&op)
    }
}
