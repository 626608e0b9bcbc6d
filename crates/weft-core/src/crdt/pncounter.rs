use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::gcounter::GCounter;
use super::{
    Accumulator, MutationContext, PolicyError, TypePolicy, Value, amount_arg, decode, encode,
};

/// Counter supporting both directions, kept as two grow-only halves.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PnCounter {
    pub positive: GCounter,
    pub negative: GCounter,
}

impl PnCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn value(&self) -> i64 {
        let up = i128::from(self.positive.total());
        let down = i128::from(self.negative.total());
        let net = up - down;
        i64::try_from(net).unwrap_or(if net > 0 { i64::MAX } else { i64::MIN })
    }
}

/// Payload of one step, tagged by direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Increment { replica: String, amount: u64 },
    Decrement { replica: String, amount: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PnCounterPolicy;

const NAME: &str = "pn-counter";

impl TypePolicy for PnCounterPolicy {
    fn first(&self) -> Accumulator {
        Accumulator::PnCounter(PnCounter::new())
    }

    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError> {
        let step: Step = decode(message)?;
        let Accumulator::PnCounter(counter) = accumulator else {
            return Err(PolicyError::AccumulatorMismatch { expected: NAME });
        };
        match step {
            Step::Increment { replica, amount } => counter.positive.increment(&replica, amount),
            Step::Decrement { replica, amount } => counter.negative.increment(&replica, amount),
        }
        Ok(())
    }

    fn value_of(&self, accumulator: &Accumulator) -> Value {
        match accumulator {
            Accumulator::PnCounter(counter) => Value::Counter(counter.value()),
            _ => Value::Counter(0),
        }
    }

    fn mutators(&self) -> &[&'static str] {
        &["increment", "decrement"]
    }

    fn mutate(
        &self,
        mutator: &str,
        args: &[Json],
        ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError> {
        let replica = ctx.replica.to_string();
        let step = match mutator {
            "increment" => Step::Increment {
                replica,
                amount: amount_arg(mutator, args)?,
            },
            "decrement" => Step::Decrement {
                replica,
                amount: amount_arg(mutator, args)?,
            },
            other => return Err(PolicyError::UnknownMutator(other.to_string())),
        };
        encode(&step)
    }
}
