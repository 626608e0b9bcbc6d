//! Last-writer-wins element set.
//!
//! Every element carries the latest add timestamp and the latest remove
//! timestamp seen for it. The element is present iff its add timestamp is
//! strictly greater than its remove timestamp, so a remove wins a tie.
//!
//! Timestamps come from the injected [`Clock`](crate::clock::Clock) in
//! microseconds. A mutation never stamps an element at or below a timestamp
//! already folded for that element, so a local add followed by a local
//! remove within the same clock tick still takes effect in order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, decode, element_arg, encode,
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LwwSet {
    pub adds: BTreeMap<String, i64>,
    pub removes: BTreeMap<String, i64>,
}

impl LwwSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, element: String, at: i64) {
        keep_latest(&mut self.adds, element, at);
    }

    pub fn remove(&mut self, element: String, at: i64) {
        keep_latest(&mut self.removes, element, at);
    }

    #[must_use]
    pub fn contains(&self, element: &str) -> bool {
        match (self.adds.get(element), self.removes.get(element)) {
            (Some(added), Some(removed)) => added > removed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    #[must_use]
    pub fn elements(&self) -> BTreeSet<String> {
        self.adds
            .keys()
            .filter(|element| self.contains(element))
            .cloned()
            .collect()
    }

    /// Latest timestamp of any kind recorded for `element`.
    #[must_use]
    pub fn latest(&self, element: &str) -> Option<i64> {
        let added = self.adds.get(element).copied();
        let removed = self.removes.get(element).copied();
        added.max(removed)
    }
}

fn keep_latest(map: &mut BTreeMap<String, i64>, element: String, at: i64) {
    map.entry(element)
        .and_modify(|current| *current = (*current).max(at))
        .or_insert(at);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped {
    pub element: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LwwOp {
    Add(Stamped),
    Remove(Stamped),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LwwSetPolicy;

const NAME: &str = "lww-set";

impl TypePolicy for LwwSetPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::LwwSet(LwwSet::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let op: LwwOp = decode(message)?;
        let Accumulator::LwwSet(set) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        match op {
            LwwOp::Add(Stamped { element, at }) => set.add(element, at),
            LwwOp::Remove(Stamped { element, at }) => set.remove(element, at),
        }
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::LwwSet(set) => Value::Set(set.elements()),
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
        if !matches!(mutator, "add" | "remove") {
            return Err(PolicyError::UnknownMutator(mutator.to_string()));
        }
        let element = element_arg(mutator, args)?;
        let now = ctx.clock.now_micros();
        let at = match ctx.accumulator {
            Accumulator::LwwSet(set) => set
                .latest(&element)
                .map_or(now, |seen| now.max(seen.saturating_add(1))),
            _ => now,
        };
        let stamped = Stamped { element, at };
        let op = if mutator == "add" {
            LwwOp::Add(stamped)
        } else {
            LwwOp::Remove(stamped)
        };
        encode(&op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crdt::testing::{apply, fold, message, set};
    use serde_json::json;

    #[test]
    fn later_timestamp_wins() {
        let clock = ManualClock::new(100);
        let mut acc = LwwSetPolicy.first();
        apply(&LwwSetPolicy, &mut acc, "a", &clock, "add", &[json!("x")]);
        clock.advance(10);
        apply(&LwwSetPolicy, &mut acc, "a", &clock, "remove", &[json!("x")]);
        clock.advance(10);
        apply(&LwwSetPolicy, &mut acc, "a", &clock, "add", &[json!("x")]);
        assert_eq!(LwwSetPolicy.value_of(&acc), set(&["x"]));
    }

    #[test]
    fn concurrent_tie_goes_to_remove() {
        let clock = ManualClock::new(500);
        let empty = LwwSetPolicy.first();
        let add = message(&LwwSetPolicy, &empty, "a", &clock, "add", &[json!("x")]);
        let remove = message(&LwwSetPolicy, &empty, "b", &clock, "remove", &[json!("x")]);
        assert_eq!(add["add"]["at"], remove["remove"]["at"]);

        let forward = fold(&LwwSetPolicy, &[add.clone(), remove.clone()]);
        let backward = fold(&LwwSetPolicy, &[remove, add]);
        assert_eq!(forward, set(&[]));
        assert_eq!(forward, backward);
    }

    #[test]
    fn local_sequence_within_one_tick_is_ordered() {
        let clock = ManualClock::new(7);
        let mut acc = LwwSetPolicy.first();
        apply(&LwwSetPolicy, &mut acc, "a", &clock, "add", &[json!("x")]);
        let removal = apply(&LwwSetPolicy, &mut acc, "a", &clock, "remove", &[json!("x")]);
        assert_eq!(removal["remove"]["at"], json!(8));
        assert_eq!(LwwSetPolicy.value_of(&acc), set(&[]));
    }

    #[test]
    fn remove_of_unknown_element_blocks_older_add() {
        let msgs = [
            json!({"remove": {"element": "d", "at": 20}}),
            json!({"add": {"element": "d", "at": 10}}),
            json!({"add": {"element": "e", "at": 10}}),
        ];
        assert_eq!(fold(&LwwSetPolicy, &msgs), set(&["e"]));
    }

    #[test]
    fn absent_iff_remove_not_older() {
        for (added, removed, present) in [(1, 2, false), (2, 2, false), (3, 2, true)] {
            let mut s = LwwSet::new();
            s.add("k".into(), added);
            s.remove("k".into(), removed);
            assert_eq!(s.contains("k"), present, "add={added} remove={removed}");
        }
    }
}
