//! Weighted aggregation of client messages.
//!
//! An [`Aggregator`] lives for exactly one round. Every field of the client messages (the trained
//! parameters, the local scores, ...) gets its own bucket holding a running weighted sum and the
//! total weight. The algorithm consumes the buckets with [`Aggregator::pop()`] and
//! [`Aggregator::pop_all()`] during the global update.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::common::{ClientId, Value, ValueKind};

/// Errors of the [`Aggregator`].
#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("no contribution was aggregated into `{0}`")]
    NotFound(String),

    #[error("`{0}` was already popped in this round")]
    AlreadyPopped(String),

    #[error("client {client_id} sent a {found} for `{field}` but the aggregate holds a {expected}")]
    ShapeMismatch {
        client_id: ClientId,
        field: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("client {client_id} sent the invalid weight {weight} for `{field}`")]
    InvalidWeight {
        client_id: ClientId,
        field: String,
        weight: f64,
    },

    #[error("the total weight of `{0}` is zero")]
    ZeroWeight(String),
}

#[derive(Debug)]
struct Bucket {
    sum: Value,
    weight: f64,
}

#[derive(Debug, Default)]
struct Buckets {
    open: HashMap<String, Bucket>,
    popped: HashSet<String>,
}

/// A per-round accumulator of weighted client contributions.
///
/// Contributions are accumulated through a shared reference, so that several client tasks may
/// feed the same aggregator.
#[derive(Debug, Default)]
pub struct Aggregator {
    buckets: Mutex<Buckets>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `weight * value` to the weighted sum of `field` and `weight` to its total weight.
    ///
    /// # Errors
    /// Fails if `field` was already popped, if `value` does not have the shape of the previous
    /// contributions or if `weight` is negative or not finite.
    pub fn accumulate(
        &self,
        client_id: ClientId,
        field: &str,
        value: &Value,
        weight: f64,
    ) -> Result<(), AggregationError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(AggregationError::InvalidWeight {
                client_id,
                field: field.to_string(),
                weight,
            });
        }

        let mut buckets = self.buckets.lock();
        if buckets.popped.contains(field) {
            return Err(AggregationError::AlreadyPopped(field.to_string()));
        }

        trace!(client_id, field, weight, "accumulating");
        match buckets.open.get_mut(field) {
            Some(bucket) => {
                if !bucket.sum.is_compatible(value) {
                    return Err(AggregationError::ShapeMismatch {
                        client_id,
                        field: field.to_string(),
                        expected: bucket.sum.kind(),
                        found: value.kind(),
                    });
                }
                bucket.sum.scaled_add(weight, value);
                bucket.weight += weight;
            }
            None => {
                let bucket = Bucket {
                    sum: value.scaled(weight),
                    weight,
                };
                buckets.open.insert(field.to_string(), bucket);
            }
        }
        Ok(())
    }

    /// Gets the total weight accumulated for `field`.
    pub fn get_weight(&self, field: &str) -> Result<f64, AggregationError> {
        let buckets = self.buckets.lock();
        match buckets.open.get(field) {
            Some(bucket) => Ok(bucket.weight),
            None if buckets.popped.contains(field) => {
                Err(AggregationError::AlreadyPopped(field.to_string()))
            }
            None => Err(AggregationError::NotFound(field.to_string())),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.buckets.lock().open.contains_key(field)
    }

    /// Removes `field` and returns its weighted average.
    ///
    /// # Errors
    /// Fails if nothing was accumulated into `field`, if it was popped before or if its total
    /// weight is zero.
    pub fn pop(&self, field: &str) -> Result<Value, AggregationError> {
        let mut buckets = self.buckets.lock();
        let bucket = match buckets.open.remove(field) {
            Some(bucket) => bucket,
            None if buckets.popped.contains(field) => {
                return Err(AggregationError::AlreadyPopped(field.to_string()))
            }
            None => return Err(AggregationError::NotFound(field.to_string())),
        };
        buckets.popped.insert(field.to_string());
        average(field, bucket)
    }

    /// Removes all remaining fields and returns their weighted averages.
    ///
    /// Fields with a total weight of zero have no average. They are popped but left out of the
    /// result.
    pub fn pop_all(&self) -> BTreeMap<String, Value> {
        let mut buckets = self.buckets.lock();
        let open: Vec<(String, Bucket)> = buckets.open.drain().collect();
        open.into_iter()
            .filter_map(|(field, bucket)| {
                buckets.popped.insert(field.clone());
                match average(&field, bucket) {
                    Ok(avg) => Some((field, avg)),
                    Err(err) => {
                        debug!("dropping field {} from the aggregates: {}", field, err);
                        None
                    }
                }
            })
            .collect()
    }
}

fn average(field: &str, bucket: Bucket) -> Result<Value, AggregationError> {
    if bucket.weight == 0.0 {
        return Err(AggregationError::ZeroWeight(field.to_string()));
    }
    Ok(match bucket.sum {
        Value::Scalar(sum) => Value::Scalar(sum / bucket.weight),
        Value::Vector(sum) => Value::Vector(sum / bucket.weight),
    })
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_weighted_average() {
        let agg = Aggregator::new();
        agg.accumulate(0, "local_params", &Value::Vector(array![3.0, 1.0, 0.0]), 1.0)
            .unwrap();
        agg.accumulate(1, "local_params", &Value::Vector(array![0.0, 1.0, 3.0]), 2.0)
            .unwrap();
        assert_eq!(agg.get_weight("local_params"), Ok(3.0));
        assert_eq!(
            agg.pop("local_params"),
            Ok(Value::Vector(array![1.0, 1.0, 2.0]))
        );
    }

    #[test]
    fn test_equal_weights() {
        let agg = Aggregator::new();
        for client_id in 0..4 {
            let params = Value::Vector(Array1::from_elem(4, 1.0));
            agg.accumulate(client_id, "local_params", &params, 1.0)
                .unwrap();
        }
        assert_eq!(
            agg.pop("local_params"),
            Ok(Value::Vector(Array1::from_elem(4, 1.0)))
        );
    }

    #[test]
    fn test_double_pop() {
        let agg = Aggregator::new();
        agg.accumulate(0, "loss", &Value::Scalar(0.5), 10.0).unwrap();
        assert_eq!(agg.pop("loss"), Ok(Value::Scalar(0.5)));
        assert_eq!(
            agg.pop("loss"),
            Err(AggregationError::AlreadyPopped("loss".to_string()))
        );
        assert_eq!(
            agg.accumulate(1, "loss", &Value::Scalar(0.1), 1.0),
            Err(AggregationError::AlreadyPopped("loss".to_string()))
        );
        assert_eq!(
            agg.pop("accuracy"),
            Err(AggregationError::NotFound("accuracy".to_string()))
        );
    }

    #[test]
    fn test_invalid_contributions() {
        let agg = Aggregator::new();
        agg.accumulate(0, "local_params", &Value::Vector(array![1.0, 2.0]), 1.0)
            .unwrap();
        assert!(matches!(
            agg.accumulate(1, "local_params", &Value::Vector(array![1.0]), 1.0),
            Err(AggregationError::ShapeMismatch { client_id: 1, .. })
        ));
        assert!(matches!(
            agg.accumulate(1, "local_params", &Value::Scalar(1.0), 1.0),
            Err(AggregationError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            agg.accumulate(1, "local_params", &Value::Vector(array![1.0, 2.0]), -1.0),
            Err(AggregationError::InvalidWeight { .. })
        ));
        assert!(matches!(
            agg.accumulate(1, "local_params", &Value::Vector(array![1.0, 2.0]), f64::NAN),
            Err(AggregationError::InvalidWeight { .. })
        ));
        // the rejected contributions left no trace
        assert_eq!(agg.get_weight("local_params"), Ok(1.0));
    }

    #[test]
    fn test_zero_weight() {
        let agg = Aggregator::new();
        agg.accumulate(0, "local_params", &Value::Vector(array![1.0]), 0.0)
            .unwrap();
        assert_eq!(
            agg.pop("local_params"),
            Err(AggregationError::ZeroWeight("local_params".to_string()))
        );
    }

    #[test]
    fn test_pop_all() {
        let agg = Aggregator::new();
        agg.accumulate(0, "local_params", &Value::Vector(array![1.0]), 1.0)
            .unwrap();
        agg.accumulate(0, "clients.train.loss", &Value::Scalar(1.0), 30.0)
            .unwrap();
        agg.accumulate(1, "clients.train.loss", &Value::Scalar(3.0), 10.0)
            .unwrap();
        agg.accumulate(1, "empty", &Value::Scalar(3.0), 0.0).unwrap();
        agg.pop("local_params").unwrap();

        let rest = agg.pop_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest["clients.train.loss"], Value::Scalar(1.5));
        assert!(!agg.contains("clients.train.loss"));
        // the zero weight field is popped without an average
        assert_eq!(
            agg.pop("empty"),
            Err(AggregationError::AlreadyPopped("empty".to_string()))
        );
        assert!(agg.pop_all().is_empty());
    }
}
