//! Boundary to the host simulator.
//!
//! The host exposes plain `read`/`write` access to its variables with no push
//! notifications and unknown latency. Everything in this crate treats both
//! calls as fallible and possibly slow.

pub mod memory;
pub mod simulation;

pub use memory::MemorySource;
pub use simulation::SimulatedPanelSource;

use crate::registry::Key;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A simulator variable value.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Bool(b) => *b,
        }
    }
}

/// Exact equality. Displays receive pre-rounded values, so no epsilon is
/// applied; two NaNs compare equal so a stuck NaN is not reported as a change.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Error types for host variable access.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
    /// The host does not know this variable.
    #[error("variable not available: {0}")]
    Unavailable(String),

    /// The host could not answer right now.
    #[error("host busy: {0}")]
    Busy(String),

    /// The host rejected the value.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Host interface for simulator variables.
///
/// Implementations must be cheap to share; the poll loop holds one behind an
/// `Arc` for the lifetime of the engine.
#[async_trait]
pub trait ExternalStateSource: Send + Sync {
    /// Read the current value of `key`.
    async fn read(&self, key: &Key) -> Result<Value, ReadError>;

    /// Write `value` to `key`.
    async fn write(&self, key: &Key, value: Value) -> Result<(), ReadError>;
}
