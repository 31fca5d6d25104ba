//! Transform stages placed between a fan-out branch and its loader
//!
//! - [`StreamingAggregator`]: bounded-memory group-by driven by LRU eviction
//! - [`GroupingAggregator`]: unbounded map flushed once it holds too many groups
//!
//! Both take a key projection and an associative merge function.
//! [`FieldAggregation`] builds both from configuration for [`UntypedRow`]s.

pub mod cache;
pub mod grouping;
pub mod streaming;

pub use cache::EvictingCache;
pub use grouping::GroupingAggregator;
pub use streaming::StreamingAggregator;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{EtlError, Result};
use crate::load::Staged;
use crate::row::{EtlRow, UntypedRow};

/// A stream-to-stream stage.
///
/// Failures, panics included, are reported in-band as `Err` items; the loader
/// stops at the first one. Stages that hold rows back tag their output with
/// the timestamp up to which the input has been fully emitted.
pub trait Transformer<R: EtlRow>: Send + Sync {
    fn name(&self) -> &str;

    fn transform(
        &self,
        group_id: &str,
        input: BoxStream<'static, Result<R>>,
    ) -> BoxStream<'static, Result<Staged<R>>>;
}

/// A resident group and the latest input timestamp strictly before its
/// first row
struct Pending<R> {
    row: R,
    floor: DateTime<Utc>,
}

/// Multiset of the floors of resident groups
#[derive(Default)]
struct Floors(BTreeMap<DateTime<Utc>, usize>);

impl Floors {
    fn hold(&mut self, floor: DateTime<Utc>) {
        *self.0.entry(floor).or_default() += 1;
    }

    fn release(&mut self, floor: DateTime<Utc>) {
        if let Some(count) = self.0.get_mut(&floor) {
            *count -= 1;
            if *count == 0 {
                self.0.remove(&floor);
            }
        }
    }

    /// Every input row at or before this has left the stage
    fn settled(&self) -> Option<DateTime<Utc>> {
        self.0.keys().next().copied()
    }
}

/// Tracks the latest input timestamp strictly before the current one
struct InputClock {
    previous: Option<DateTime<Utc>>,
    before_current: DateTime<Utc>,
}

impl InputClock {
    fn new() -> Self {
        Self {
            previous: None,
            before_current: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Record the next input timestamp, rejecting descending input
    fn advance(&mut self, current: DateTime<Utc>) -> Result<()> {
        if let Some(previous) = self.previous {
            if current < previous {
                return Err(EtlError::ordering(current, previous));
            }
            if current > previous {
                self.before_current = previous;
            }
        }
        self.previous = Some(current);
        Ok(())
    }

    /// Floor for a group whose first row is the current input row
    fn floor(&self) -> DateTime<Utc> {
        self.before_current
    }
}

/// Group-by over named fields of an [`UntypedRow`].
///
/// Fields listed in `sum` are added, fields in `max` keep the largest value,
/// every other field takes the value of the latest row in the group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAggregation {
    pub group_by: Vec<String>,
    #[serde(default)]
    pub sum: Vec<String>,
    #[serde(default)]
    pub max: Vec<String>,
}

impl FieldAggregation {
    pub fn key(&self, row: &UntypedRow) -> String {
        Value::Array(row.project(&self.group_by)).to_string()
    }

    pub fn merge(&self, current: UntypedRow, next: UntypedRow) -> Result<UntypedRow> {
        let mut merged = next;
        for field in &self.sum {
            let value = sum_values(
                field,
                current.get(field).unwrap_or(&Value::Null),
                merged.get(field).unwrap_or(&Value::Null),
            )?;
            merged.fields.insert(field.clone(), value);
        }
        for field in &self.max {
            let value = max_value(
                field,
                current.get(field).unwrap_or(&Value::Null),
                merged.get(field).unwrap_or(&Value::Null),
            )?;
            merged.fields.insert(field.clone(), value);
        }
        merged.timestamp = merged.timestamp.max(current.timestamp);
        Ok(merged)
    }
}

fn sum_values(field: &str, a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Null, v) | (v, Value::Null) => Ok(v.clone()),
        (Value::Number(x), Value::Number(y)) => {
            if let Some(sum) = x.as_i64().zip(y.as_i64()).and_then(|(x, y)| x.checked_add(y)) {
                return Ok(Value::from(sum));
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok(Value::from(x + y)),
                _ => Err(EtlError::Transform(format!("cannot sum field '{field}': {a} + {b}"))),
            }
        }
        _ => Err(EtlError::Transform(format!(
            "cannot sum non-numeric values of field '{field}': {a} + {b}"
        ))),
    }
}

fn max_value(field: &str, a: &Value, b: &Value) -> Result<Value> {
    let ordering = match (a, b) {
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => {
            return Err(EtlError::Transform(format!(
                "cannot compare values of field '{field}': {a} and {b}"
            )))
        }
    };
    Ok(if ordering == Ordering::Greater { a.clone() } else { b.clone() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn row(secs: i64, fields: Value) -> UntypedRow {
        UntypedRow::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            fields.as_object().unwrap().clone(),
        )
    }

    fn aggregation() -> FieldAggregation {
        FieldAggregation {
            group_by: vec!["build".into()],
            sum: vec!["hits".into(), "ratio".into()],
            max: vec!["last_seen".into()],
        }
    }

    #[test]
    fn floors_report_the_oldest_resident_group() {
        let t = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        let mut floors = Floors::default();
        assert_eq!(floors.settled(), None);
        floors.hold(t(3));
        floors.hold(t(1));
        floors.hold(t(1));
        floors.release(t(1));
        assert_eq!(floors.settled(), Some(t(1)));
        floors.release(t(1));
        assert_eq!(floors.settled(), Some(t(3)));
    }

    #[test]
    fn clock_floor_is_the_previous_distinct_timestamp() {
        let t = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        let mut clock = InputClock::new();
        clock.advance(t(1)).unwrap();
        assert_eq!(clock.floor(), DateTime::<Utc>::MIN_UTC);
        clock.advance(t(2)).unwrap();
        clock.advance(t(2)).unwrap();
        assert_eq!(clock.floor(), t(1));
        assert!(matches!(clock.advance(t(1)), Err(EtlError::OrderingViolation { .. })));
    }

    #[test]
    fn key_depends_only_on_group_by_fields() {
        let agg = aggregation();
        let a = row(1, json!({"build": "b1", "hits": 1}));
        let b = row(2, json!({"build": "b1", "hits": 7}));
        let c = row(2, json!({"build": "b2", "hits": 7}));
        assert_eq!(agg.key(&a), agg.key(&b));
        assert_ne!(agg.key(&a), agg.key(&c));
    }

    #[test]
    fn merge_sums_maxes_and_keeps_latest_values() {
        let agg = aggregation();
        let current = row(
            1,
            json!({"build": "b1", "hits": 2, "ratio": 0.5, "last_seen": "2026-01-02", "label": "old"}),
        );
        let next = row(
            3,
            json!({"build": "b1", "hits": 3, "ratio": 0.25, "last_seen": "2026-01-01", "label": "new"}),
        );

        let merged = agg.merge(current, next).unwrap();
        assert_eq!(merged.timestamp.timestamp(), 3);
        assert_eq!(merged.get("hits"), Some(&json!(5)));
        assert_eq!(merged.get("ratio"), Some(&json!(0.75)));
        assert_eq!(merged.get("last_seen"), Some(&json!("2026-01-02")));
        assert_eq!(merged.get("label"), Some(&json!("new")));
    }

    #[test]
    fn missing_values_count_as_absent() {
        let agg = aggregation();
        let merged = agg
            .merge(row(1, json!({"build": "b1"})), row(2, json!({"build": "b1", "hits": 4})))
            .unwrap();
        assert_eq!(merged.get("hits"), Some(&json!(4)));
    }

    #[test]
    fn summing_text_is_a_transform_error() {
        let agg = aggregation();
        let err = agg
            .merge(
                row(1, json!({"build": "b1", "hits": "many"})),
                row(2, json!({"build": "b1", "hits": 1})),
            )
            .unwrap_err();
        assert!(matches!(err, EtlError::Transform(msg) if msg.contains("hits")));
    }
}
