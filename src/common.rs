//! Types shared by the store, the aggregator and the algorithms.

use std::fmt;

use derive_more::{Display, From};
use ndarray::Array1;
use thiserror::Error;

/// The identifier of a simulated client.
pub type ClientId = usize;

/// A flattened parameter (or gradient) vector.
pub type Params = Array1<f64>;

#[derive(Debug, Clone, PartialEq, From)]
/// A value held in a store namespace or accumulated by the aggregator.
pub enum Value {
    /// A single number, e.g. a score or a dataset statistic.
    Scalar(f64),
    /// A flattened vector, e.g. model parameters or a dual variable.
    Vector(Params),
}

#[derive(Debug, Clone, Copy, Display, PartialEq, Eq)]
/// The kind of a [`Value`].
pub enum ValueKind {
    #[display(fmt = "scalar")]
    Scalar,
    #[display(fmt = "vector of length {}", _0)]
    Vector(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected a {expected} but found a {found}")]
/// Error returned when a value does not have the expected kind.
pub struct ValueKindError {
    pub expected: &'static str,
    pub found: ValueKind,
}

impl Value {
    /// Gets the kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::Vector(v) => ValueKind::Vector(v.len()),
        }
    }

    /// Checks whether this value has the same kind (and length) as `other`.
    pub fn is_compatible(&self, other: &Value) -> bool {
        self.kind() == other.kind()
    }

    /// Checks whether every number in this value is finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Scalar(s) => s.is_finite(),
            Value::Vector(v) => v.iter().all(|x| x.is_finite()),
        }
    }

    /// Returns `self * factor`.
    pub fn scaled(&self, factor: f64) -> Value {
        match self {
            Value::Scalar(s) => Value::Scalar(s * factor),
            Value::Vector(v) => Value::Vector(v * factor),
        }
    }

    /// Adds `factor * other` to this value in place.
    ///
    /// The caller must make sure that both values are compatible.
    pub(crate) fn scaled_add(&mut self, factor: f64, other: &Value) {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => *a += factor * b,
            (Value::Vector(a), Value::Vector(b)) => a.scaled_add(factor, b),
            _ => unreachable!("scaled_add on incompatible values"),
        }
    }

    pub fn as_scalar(&self) -> Result<f64, ValueKindError> {
        match self {
            Value::Scalar(s) => Ok(*s),
            other => Err(ValueKindError {
                expected: "scalar",
                found: other.kind(),
            }),
        }
    }

    pub fn as_vector(&self) -> Result<&Params, ValueKindError> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(ValueKindError {
                expected: "vector",
                found: other.kind(),
            }),
        }
    }

    pub fn into_vector(self) -> Result<Params, ValueKindError> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(ValueKindError {
                expected: "vector",
                found: other.kind(),
            }),
        }
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Scalar(n as f64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => write!(f, "{}", s),
            Value::Vector(v) => write!(f, "vector[{}]", v.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_scaled_add() {
        let mut acc = Value::Vector(array![1.0, 2.0]);
        acc.scaled_add(2.0, &Value::Vector(array![1.0, -1.0]));
        assert_eq!(acc, Value::Vector(array![3.0, 0.0]));

        let mut acc = Value::Scalar(1.0);
        acc.scaled_add(0.5, &Value::Scalar(4.0));
        assert_eq!(acc, Value::Scalar(3.0));
    }

    #[test]
    fn test_compatibility() {
        let v2 = Value::Vector(array![1.0, 2.0]);
        assert!(v2.is_compatible(&Value::Vector(array![0.0, 0.0])));
        assert!(!v2.is_compatible(&Value::Vector(array![0.0])));
        assert!(!v2.is_compatible(&Value::Scalar(1.0)));
    }

    #[test]
    fn test_kind_errors() {
        assert!(Value::Scalar(1.0).as_vector().is_err());
        assert_eq!(Value::Scalar(1.5).as_scalar(), Ok(1.5));
        assert!(Value::Vector(array![1.0]).as_scalar().is_err());
        assert!(!Value::Scalar(f64::NAN).is_finite());
    }
}
