use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FieldConfig, FrameError};

/// Labels attached to a field, e.g. `host=a`. Ordered so encoding is stable.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Time,
    #[serde(alias = "number")]
    Float64,
    Int64,
    #[serde(alias = "boolean")]
    Bool,
    String,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Time => "time",
            FieldType::Float64 => "float64",
            FieldType::Int64 => "int64",
            FieldType::Bool => "bool",
            FieldType::String => "string",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        match raw.to_ascii_lowercase().as_str() {
            "time" => Ok(FieldType::Time),
            "float64" | "number" => Ok(FieldType::Float64),
            "int64" => Ok(FieldType::Int64),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "string" => Ok(FieldType::String),
            other => Err(FrameError::UnknownFieldType(other.to_string())),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Float64 | FieldType::Int64)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Time(DateTime<Utc>),
    Float64(f64),
    Int64(i64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Time(_) => Some(FieldType::Time),
            FieldValue::Float64(_) => Some(FieldType::Float64),
            FieldValue::Int64(_) => Some(FieldType::Int64),
            FieldValue::Bool(_) => Some(FieldType::Bool),
            FieldValue::String(_) => Some(FieldType::String),
        }
    }

    /// Numeric view used by conditions, thresholds and remote write.
    /// Booleans count as 0/1, times as epoch milliseconds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float64(v) => Some(*v),
            FieldValue::Int64(v) => Some(*v as f64),
            FieldValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            FieldValue::Time(t) => Some(t.timestamp_millis() as f64),
            FieldValue::Null | FieldValue::String(_) => None,
        }
    }

    /// Wire representation. Times become epoch milliseconds and non-finite
    /// floats become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Time(t) => Value::from(t.timestamp_millis()),
            FieldValue::Float64(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Int64(v) => Value::from(*v),
            FieldValue::Bool(v) => Value::Bool(*v),
            FieldValue::String(v) => Value::String(v.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("null"),
            FieldValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
            FieldValue::Float64(v) => write!(f, "{v}"),
            FieldValue::Int64(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::String(v) => f.write_str(v),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float64(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Time(v)
    }
}

/// Column storage, one typed vector per field type.
#[derive(Debug, Clone, PartialEq)]
pub enum Vector {
    Time(Vec<Option<DateTime<Utc>>>),
    Float64(Vec<Option<f64>>),
    Int64(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    String(Vec<Option<String>>),
}

impl Vector {
    pub fn new(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Time => Vector::Time(Vec::new()),
            FieldType::Float64 => Vector::Float64(Vec::new()),
            FieldType::Int64 => Vector::Int64(Vec::new()),
            FieldType::Bool => Vector::Bool(Vec::new()),
            FieldType::String => Vector::String(Vec::new()),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Vector::Time(_) => FieldType::Time,
            Vector::Float64(_) => FieldType::Float64,
            Vector::Int64(_) => FieldType::Int64,
            Vector::Bool(_) => FieldType::Bool,
            Vector::String(_) => FieldType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Vector::Time(v) => v.len(),
            Vector::Float64(v) => v.len(),
            Vector::Int64(v) => v.len(),
            Vector::Bool(v) => v.len(),
            Vector::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at(&self, idx: usize) -> FieldValue {
        let value = match self {
            Vector::Time(v) => v.get(idx).cloned().flatten().map(FieldValue::Time),
            Vector::Float64(v) => v.get(idx).cloned().flatten().map(FieldValue::Float64),
            Vector::Int64(v) => v.get(idx).cloned().flatten().map(FieldValue::Int64),
            Vector::Bool(v) => v.get(idx).cloned().flatten().map(FieldValue::Bool),
            Vector::String(v) => v.get(idx).cloned().flatten().map(FieldValue::String),
        };
        value.unwrap_or(FieldValue::Null)
    }

    fn push_null(&mut self) {
        match self {
            Vector::Time(v) => v.push(None),
            Vector::Float64(v) => v.push(None),
            Vector::Int64(v) => v.push(None),
            Vector::Bool(v) => v.push(None),
            Vector::String(v) => v.push(None),
        }
    }

    /// Pushes a value of the vector's own type. Ints widen into float
    /// columns; anything else is a mismatch.
    fn push(&mut self, value: FieldValue) -> Result<(), FieldValue> {
        match (self, value) {
            (vector, FieldValue::Null) => vector.push_null(),
            (Vector::Time(v), FieldValue::Time(t)) => v.push(Some(t)),
            (Vector::Float64(v), FieldValue::Float64(f)) => v.push(Some(f)),
            (Vector::Float64(v), FieldValue::Int64(i)) => v.push(Some(i as f64)),
            (Vector::Int64(v), FieldValue::Int64(i)) => v.push(Some(i)),
            (Vector::Bool(v), FieldValue::Bool(b)) => v.push(Some(b)),
            (Vector::String(v), FieldValue::String(s)) => v.push(Some(s)),
            (_, other) => return Err(other),
        }
        Ok(())
    }

    pub fn has_nulls(&self) -> bool {
        match self {
            Vector::Time(v) => v.iter().any(Option::is_none),
            Vector::Float64(v) => v.iter().any(Option::is_none),
            Vector::Int64(v) => v.iter().any(Option::is_none),
            Vector::Bool(v) => v.iter().any(Option::is_none),
            Vector::String(v) => v.iter().any(Option::is_none),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub labels: Labels,
    pub config: Option<FieldConfig>,
    pub nullable: bool,
    pub values: Vector,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            labels: Labels::new(),
            config: None,
            nullable: false,
            values: Vector::new(field_type),
        }
    }

    pub fn new_nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, field_type)
        }
    }

    pub fn from_vector(name: impl Into<String>, values: Vector) -> Self {
        let nullable = values.has_nulls();
        Self {
            name: name.into(),
            labels: Labels::new(),
            config: None,
            nullable,
            values,
        }
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_config(mut self, config: FieldConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn field_type(&self) -> FieldType {
        self.values.field_type()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn at(&self, idx: usize) -> FieldValue {
        self.values.at(idx)
    }

    pub fn append(&mut self, value: impl Into<FieldValue>) -> Result<(), FrameError> {
        let value = value.into();
        if value.is_null() && !self.nullable {
            return Err(FrameError::NullNotAllowed(self.name.clone()));
        }
        let expected = self.field_type().as_str();
        self.values.push(value).map_err(|got| FrameError::TypeMismatch {
            field: self.name.clone(),
            expected,
            got: got.field_type().map(|t| t.to_string()).unwrap_or_default(),
        })
    }

    /// Wire form of every value in this column.
    pub fn json_values(&self) -> Vec<Value> {
        (0..self.len()).map(|i| self.at(i).to_json()).collect()
    }

    /// Rebuilds a column from wire values.
    pub fn push_json(&mut self, raw: &Value) -> Result<(), FrameError> {
        let value = match (self.field_type(), raw) {
            (_, Value::Null) if self.field_type() == FieldType::Float64 && !self.nullable => {
                FieldValue::Float64(f64::NAN)
            }
            (_, Value::Null) => FieldValue::Null,
            (FieldType::Time, Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(DateTime::from_timestamp_millis)
                .map(FieldValue::Time)
                .unwrap_or(FieldValue::Null),
            (FieldType::Time, Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| FieldValue::Time(t.with_timezone(&Utc)))
                .map_err(|_| self.mismatch(raw))?,
            (FieldType::Float64, Value::Number(n)) => {
                FieldValue::Float64(n.as_f64().ok_or_else(|| self.mismatch(raw))?)
            }
            (FieldType::Int64, Value::Number(n)) => {
                FieldValue::Int64(n.as_i64().ok_or_else(|| self.mismatch(raw))?)
            }
            (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
            (FieldType::String, Value::String(s)) => FieldValue::String(s.clone()),
            _ => return Err(self.mismatch(raw)),
        };
        self.append(value)
    }

    fn mismatch(&self, raw: &Value) -> FrameError {
        FrameError::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type().as_str(),
            got: raw.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_checks_type_and_nullability() {
        let mut f = Field::new("value", FieldType::Float64);
        f.append(1.5).unwrap();
        f.append(2_i64).unwrap();
        assert!(matches!(
            f.append("x"),
            Err(FrameError::TypeMismatch { .. })
        ));
        assert!(matches!(
            f.append(FieldValue::Null),
            Err(FrameError::NullNotAllowed(_))
        ));
        assert_eq!(f.len(), 2);
        assert_eq!(f.at(1), FieldValue::Float64(2.0));
    }

    #[test]
    fn nullable_field_keeps_nulls() {
        let mut f = Field::new_nullable("host", FieldType::String);
        f.append(FieldValue::Null).unwrap();
        f.append("a").unwrap();
        assert_eq!(f.at(0), FieldValue::Null);
        assert_eq!(f.json_values(), vec![Value::Null, Value::from("a")]);
    }

    #[test]
    fn time_values_are_epoch_millis_on_the_wire() {
        let t = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let mut f = Field::new("time", FieldType::Time);
        f.append(t).unwrap();
        assert_eq!(f.json_values(), vec![Value::from(1_700_000_000_123_i64)]);

        let mut back = Field::new("time", FieldType::Time);
        back.push_json(&Value::from(1_700_000_000_123_i64)).unwrap();
        assert_eq!(back.at(0), FieldValue::Time(t));
    }

    #[test]
    fn non_finite_float_encodes_as_null() {
        assert_eq!(FieldValue::Float64(f64::NAN).to_json(), Value::Null);
    }

    #[test]
    fn parse_field_type_names() {
        assert_eq!(FieldType::parse("Float64").unwrap(), FieldType::Float64);
        assert_eq!(FieldType::parse("number").unwrap(), FieldType::Float64);
        assert!(FieldType::parse("complex").is_err());
    }
}
