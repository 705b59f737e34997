//! Converters turn a raw payload into frames.

pub mod auto_json;
pub mod exact_json;
pub mod expr;
pub mod influx;
pub mod json_frame;
pub mod json_path;
pub mod line_protocol;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stream_frame::{FieldType, FieldValue, FrameError};
use thiserror::Error;

use crate::pipeline::{ChannelFrame, Vars};
use crate::rule::ConverterConfig;

pub use auto_json::AutoJsonConverter;
pub use exact_json::ExactJsonConverter;
pub use expr::{Expr, ExprError};
pub use influx::AutoInfluxConverter;
pub use json_frame::JsonFrameConverter;
pub use json_path::JsonPath;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not utf-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("json path `{path}`: {reason}")]
    Path { path: String, reason: String },
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("line protocol, line {line}: {reason}")]
    LineProtocol { line: usize, reason: String },
    #[error("`{path}`: cannot convert {got} to {expected}")]
    Coerce {
        path: String,
        expected: &'static str,
        got: String,
    },
}

#[derive(Debug)]
pub enum Converter {
    AutoJson(AutoJsonConverter),
    ExactJson(ExactJsonConverter),
    AutoInflux(AutoInfluxConverter),
    JsonFrame(JsonFrameConverter),
}

impl Converter {
    /// Paths and expressions are compiled here so a broken rule fails at
    /// build time rather than per message.
    pub fn from_config(config: &ConverterConfig) -> Result<Self, ConvertError> {
        Ok(match config {
            ConverterConfig::JsonAuto(c) => Converter::AutoJson(AutoJsonConverter::new(c.clone())),
            ConverterConfig::JsonExact(c) => Converter::ExactJson(ExactJsonConverter::new(c)?),
            ConverterConfig::InfluxAuto(c) => Converter::AutoInflux(AutoInfluxConverter::new(c.clone())),
            ConverterConfig::JsonFrame => Converter::JsonFrame(JsonFrameConverter),
        })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Converter::AutoJson(_) => "jsonAuto",
            Converter::ExactJson(_) => "jsonExact",
            Converter::AutoInflux(_) => "influxAuto",
            Converter::JsonFrame(_) => "jsonFrame",
        }
    }

    pub fn convert(&self, vars: &Vars, body: &[u8]) -> Result<Vec<ChannelFrame>, ConvertError> {
        match self {
            Converter::AutoJson(c) => c.convert(vars, body),
            Converter::ExactJson(c) => c.convert(vars, body),
            Converter::AutoInflux(c) => c.convert(vars, body),
            Converter::JsonFrame(c) => c.convert(vars, body),
        }
    }
}

/// Reads a JSON value as a cell of `field_type`. Nulls pass through.
pub(crate) fn coerce(path: &str, raw: &Value, field_type: FieldType) -> Result<FieldValue, ConvertError> {
    let mismatch = || ConvertError::Coerce {
        path: path.to_string(),
        expected: field_type.as_str(),
        got: raw.to_string(),
    };
    let value = match (field_type, raw) {
        (_, Value::Null) => FieldValue::Null,
        (FieldType::Float64, Value::Number(n)) => FieldValue::Float64(n.as_f64().ok_or_else(mismatch)?),
        (FieldType::Float64, Value::String(s)) => FieldValue::Float64(
            s.trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .ok_or_else(mismatch)?,
        ),
        (FieldType::Float64, Value::Bool(b)) => FieldValue::Float64(if *b { 1.0 } else { 0.0 }),
        (FieldType::Int64, Value::Number(n)) => FieldValue::Int64(
            n.as_i64()
                .or_else(|| n.as_f64().and_then(exact_i64))
                .ok_or_else(mismatch)?,
        ),
        (FieldType::Int64, Value::String(s)) => FieldValue::Int64(s.trim().parse().map_err(|_| mismatch())?),
        (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
        (FieldType::Bool, Value::String(s)) => FieldValue::Bool(s.trim().parse().map_err(|_| mismatch())?),
        (FieldType::String, Value::String(s)) => FieldValue::String(s.clone()),
        (FieldType::String, Value::Number(_) | Value::Bool(_)) => FieldValue::String(raw.to_string()),
        (FieldType::Time, Value::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(FieldValue::Time)
            .ok_or_else(mismatch)?,
        (FieldType::Time, Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| FieldValue::Time(t.with_timezone(&Utc)))
            .map_err(|_| mismatch())?,
        _ => return Err(mismatch()),
    };
    Ok(value)
}

/// A whole float inside the i64 range; `as` would saturate anything else.
fn exact_i64(f: f64) -> Option<i64> {
    // 2^63
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-BOUND..BOUND).contains(&f)).then_some(f as i64)
}
