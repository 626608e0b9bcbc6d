//! Type policies: the pluggable CRDT contract and the built-in policies.
//!
//! A [`TypePolicy`] is a stateless bundle of pure functions:
//!
//! - [`first`](TypePolicy::first) builds the initial accumulator,
//! - [`reduce`](TypePolicy::reduce) folds one entry payload into it,
//! - [`value_of`](TypePolicy::value_of) projects the materialized value,
//! - [`mutate`](TypePolicy::mutate) turns a named mutator call into a payload.
//!
//! The merge engine folds every distinct entry exactly once, parents before
//! children, but concurrent entries in arbitrary order. A policy must make
//! `reduce` commute over concurrent entries so that replicas folding the same
//! set of entries agree on the value.
//!
//! # Built-in policies
//!
//! | name         | state                              | mutators                |
//! |--------------|------------------------------------|-------------------------|
//! | `g-counter`  | per-replica sums                   | `increment`             |
//! | `pn-counter` | two g-counters                     | `increment`, `decrement`|
//! | `g-set`      | union                              | `add`                   |
//! | `2p-set`     | add set minus permanent remove set | `add`, `remove`         |
//! | `lww-set`    | latest add/remove timestamp each   | `add`, `remove`         |
//! | `or-set`     | tagged adds, observed tombstones   | `add`, `remove`         |

pub mod gcounter;
pub mod gset;
pub mod lww;
pub mod orset;
pub mod pncounter;
pub mod twophase;

pub use gcounter::{GCounter, GCounterPolicy};
pub use gset::{GSet, GSetPolicy};
pub use lww::{LwwSet, LwwSetPolicy};
pub use orset::{OrSet, OrSetPolicy};
pub use pncounter::{PnCounter, PnCounterPolicy};
pub use twophase::{TwoPhaseSet, TwoPhaseSetPolicy};

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::clock::Clock;
use crate::error::ErrorCode;

/// Errors raised by type policies.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown mutator {0}")]
    UnknownMutator(String),

    #[error("invalid arguments to {mutator}: {reason}")]
    InvalidArguments { mutator: String, reason: String },

    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("accumulator does not belong to a {expected} policy")]
    AccumulatorMismatch { expected: &'static str },
}

impl PolicyError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownMutator(_) => ErrorCode::UnknownMutator,
            Self::InvalidArguments { .. } => ErrorCode::InvalidArguments,
            Self::MalformedMessage(_) => ErrorCode::MalformedMessage,
            Self::AccumulatorMismatch { .. } => ErrorCode::AccumulatorMismatch,
        }
    }

    fn invalid(mutator: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            mutator: mutator.to_string(),
            reason: reason.into(),
        }
    }
}

/// Folded state of one instance. One variant per built-in policy; custom
/// policies keep their state as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "kebab-case")]
pub enum Accumulator {
    GCounter(GCounter),
    PnCounter(PnCounter),
    GSet(GSet),
    TwoPhaseSet(TwoPhaseSet),
    LwwSet(LwwSet),
    OrSet(OrSet),
    Custom(Json),
}

/// Materialized value of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Counter(i64),
    Set(BTreeSet<String>),
    Custom(Json),
}

impl Value {
    #[must_use]
    pub const fn as_counter(&self) -> Option<i64> {
        match self {
            Self::Counter(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Set(set) => Some(set),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter(n) => write!(f, "{n}"),
            Self::Set(set) => {
                f.write_str("{")?;
                for (i, element) in set.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(element)?;
                }
                f.write_str("}")
            }
            Self::Custom(json) => write!(f, "{json}"),
        }
    }
}

/// What a mutator may consult while building its message.
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    /// Replica performing the mutation.
    pub replica: &'a str,
    /// Current local accumulator, e.g. for observed-remove tags.
    pub accumulator: &'a Accumulator,
    pub clock: &'a dyn Clock,
}

/// A CRDT policy that can be registered under a type name.
pub trait TypePolicy: Send + Sync + fmt::Debug {
    fn first(&self) -> Accumulator;

    /// Fold one payload into the accumulator.
    ///
    /// Implementations decode the whole message before touching the
    /// accumulator, so an error leaves it unchanged.
    fn reduce(&self, message: &Json, accumulator: &mut Accumulator) -> Result<(), PolicyError>;

    fn value_of(&self, accumulator: &Accumulator) -> Value;

    /// Names accepted by [`mutate`](TypePolicy::mutate).
    fn mutators(&self) -> &[&'static str];

    fn mutate(
        &self,
        mutator: &str,
        args: &[Json],
        ctx: &MutationContext<'_>,
    ) -> Result<Json, PolicyError>;
}

/// Every built-in policy with its registry name.
#[must_use]
pub fn builtins() -> Vec<(&'static str, Arc<dyn TypePolicy>)> {
    vec![
        ("g-counter", Arc::new(GCounterPolicy)),
        ("pn-counter", Arc::new(PnCounterPolicy)),
        ("g-set", Arc::new(GSetPolicy)),
        ("2p-set", Arc::new(TwoPhaseSetPolicy)),
        ("lww-set", Arc::new(LwwSetPolicy)),
        ("or-set", Arc::new(OrSetPolicy)),
    ]
}

fn decode<T: DeserializeOwned>(message: &Json) -> Result<T, PolicyError> {
    Ok(T::deserialize(message)?)
}

fn encode<T: Serialize>(op: &T) -> Result<Json, PolicyError> {
    Ok(serde_json::to_value(op)?)
}

/// Exactly one string argument.
fn element_arg(mutator: &str, args: &[Json]) -> Result<String, PolicyError> {
    match args {
        [Json::String(element)] => Ok(element.clone()),
        [other] => Err(PolicyError::invalid(
            mutator,
            format!("expected a string element, got {other}"),
        )),
        _ => Err(PolicyError::invalid(
            mutator,
            format!("expected 1 argument, got {}", args.len()),
        )),
    }
}

/// Optional positive integer argument, defaulting to 1.
fn amount_arg(mutator: &str, args: &[Json]) -> Result<u64, PolicyError> {
    match args {
        [] => Ok(1),
        [amount] => match amount.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => Err(PolicyError::invalid(
                mutator,
                format!("expected a positive integer, got {amount}"),
            )),
        },
        _ => Err(PolicyError::invalid(
            mutator,
            format!("expected at most 1 argument, got {}", args.len()),
        )),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;

    /// Build and immediately fold a mutation, as the engine does locally.
    pub fn apply(
        policy: &dyn TypePolicy,
        acc: &mut Accumulator,
        replica: &str,
        clock: &ManualClock,
        mutator: &str,
        args: &[Json],
    ) -> Json {
        let message = {
            let ctx = MutationContext {
                replica,
                accumulator: acc,
                clock,
            };
            policy.mutate(mutator, args, &ctx).expect("mutate")
        };
        policy.reduce(&message, acc).expect("reduce");
        message
    }

    pub fn message(
        policy: &dyn TypePolicy,
        acc: &Accumulator,
        replica: &str,
        clock: &ManualClock,
        mutator: &str,
        args: &[Json],
    ) -> Json {
        let ctx = MutationContext {
            replica,
            accumulator: acc,
            clock,
        };
        policy.mutate(mutator, args, &ctx).expect("mutate")
    }

    pub fn fold(policy: &dyn TypePolicy, messages: &[Json]) -> Value {
        let mut acc = policy.first();
        for message in messages {
            policy.reduce(message, &mut acc).expect("reduce");
        }
        policy.value_of(&acc)
    }

    pub fn set(elements: &[&str]) -> Value {
        Value::Set(elements.iter().map(|e| (*e).to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn element_arg_requires_one_string() {
        assert_eq!(element_arg("add", &[json!("a")]).expect("ok"), "a");
        let err = element_arg("add", &[json!(1)]).expect_err("not a string");
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
        assert!(element_arg("add", &[]).is_err());
        assert!(element_arg("add", &[json!("a"), json!("b")]).is_err());
    }

    #[test]
    fn amount_arg_defaults_to_one() {
        assert_eq!(amount_arg("increment", &[]).expect("ok"), 1);
        assert_eq!(amount_arg("increment", &[json!(5)]).expect("ok"), 5);
        assert!(amount_arg("increment", &[json!(0)]).is_err());
        assert!(amount_arg("increment", &[json!(-2)]).is_err());
        assert!(amount_arg("increment", &[json!("x")]).is_err());
    }

    #[test]
    fn builtin_names_are_unique() {
        let names: BTreeSet<_> = builtins().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn every_builtin_starts_empty() {
        for (name, policy) in builtins() {
            let value = policy.value_of(&policy.first());
            match value {
                Value::Counter(n) => assert_eq!(n, 0, "{name}"),
                Value::Set(set) => assert!(set.is_empty(), "{name}"),
                Value::Custom(_) => panic!("{name} has a custom value"),
            }
        }
    }

    #[test]
    fn value_display_is_compact() {
        assert_eq!(Value::Counter(-3).to_string(), "-3");
        assert_eq!(testing::set(&["b", "a"]).to_string(), "{a, b}");
    }
}
