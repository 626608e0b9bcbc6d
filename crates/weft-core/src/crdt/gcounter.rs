use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, amount_arg, decode, encode,
};

/// Grow-only counter: one monotonically increasing sum per replica.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GCounter {
    pub counts: BTreeMap<String, u64>,
}

impl GCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, replica: &str, amount: u64) {
        let count = self.counts.entry(replica.to_string()).or_insert(0);
        *count = count.saturating_add(amount);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0, |acc, n| acc.saturating_add(*n))
    }
}

/// Payload of one increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Increment {
    pub replica: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GCounterPolicy;

const NAME: &str = "g-counter";

impl TypePolicy for GCounterPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::GCounter(GCounter::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let op: Increment = decode(message)?;
        let Accumulator::GCounter(counter) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        counter.increment(&op.replica, op.amount);
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::GCounter(counter) => {
                Value::Counter(i64::try_from(counter.total()).unwrap_or(i64::MAX))
            }
            _ => Value::Counter(0),
        }
    }

    fn mutators(&self) -> &[&'static str] {
        &["increment"]
    }

    fn mutate(
        &self,
        mutator: &str,
        args: &[Json],
        ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError> {
        match mutator {
            "increment" => encode(&Increment {
                replica: ctx.replica.to_string(),
                amount: amount_arg(mutator, args)?,
            }),
            other => Err(PolicyError::UnknownMutator(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crdt::testing::{apply, fold, message};
    use serde_json::json;

    #[test]
    fn sums_increments_across_replicas() {
        let clock = ManualClock::new(0);
        let mut acc = GCounterPolicy.first();
        for _ in 0..3 {
            apply(&GCounterPolicy, &mut acc, "a", &clock, "increment", &[]);
        }
        apply(&GCounterPolicy, &mut acc, "b", &clock, "increment", &[json!(4)]);
        assert_eq!(GCounterPolicy.value_of(&acc), Value::Counter(7));

        let Accumulator::GCounter(counter) = &acc else {
            panic!("wrong accumulator");
        };
        assert_eq!(counter.counts.get("a"), Some(&3));
        assert_eq!(counter.counts.get("b"), Some(&4));
    }

    #[test]
    fn concurrent_increments_commute() {
        let clock = ManualClock::new(0);
        let first = GCounterPolicy.first();
        let a = message(&GCounterPolicy, &first, "a", &clock, "increment", &[json!(2)]);
        let b = message(&GCounterPolicy, &first, "b", &clock, "increment", &[]);
        assert_eq!(
            fold(&GCounterPolicy, &[a.clone(), b.clone()]),
            fold(&GCounterPolicy, &[b, a])
        );
    }

    #[test]
    fn rejects_unknown_mutators_and_bad_messages() {
        let clock = ManualClock::new(0);
        let acc = GCounterPolicy.first();
        let ctx = MutationContext {
            replica: "a",
            accumulator: &acc,
            clock: &clock,
        };
        assert!(matches!(
            GCounterPolicy.mutate("decrement", &[], &ctx),
            Err(PolicyError::UnknownMutator(_))
        ));

        let mut acc = GCounterPolicy.first();
        let before = acc.clone();
        assert!(GCounterPolicy.reduce(&json!({"bogus": true}), &mut acc).is_err());
        assert_eq!(acc, before);
    }
}
