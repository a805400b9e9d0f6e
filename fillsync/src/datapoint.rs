use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Stable identity of a tracked stream, e.g. `HPM2C561:count`.
pub type Entity = String;

/// What a source query returns: points per returned key. A single query can return more than the
/// queried entity (a counter and its paired status for example).
pub type SourceData = HashMap<Entity, Vec<DataPoint>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Numeric(f64),
    Text(String),
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Numeric(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Numeric(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A single observation. The entity is the key it is stored under in [SourceData] and [Batch].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// Points accumulated for one flush, grouped by entity. No ordering is implied across entities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    points: HashMap<Entity, Vec<DataPoint>>,
    len: usize,
}

impl Batch {
    pub fn push(&mut self, entity: Entity, mut points: Vec<DataPoint>) {
        self.len += points.len();
        self.points.entry(entity).or_default().append(&mut points);
    }

    /// Total number of points across all entities.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn points(&self, entity: &str) -> Option<&[DataPoint]> {
        self.points.get(entity).map(Vec::as_slice)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.points.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Entity, &Vec<DataPoint>)> {
        self.points.iter()
    }

    pub(crate) fn take(&mut self) -> Batch {
        std::mem::take(self)
    }
}
