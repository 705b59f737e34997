use chrono::Utc;
use serde_json::Value;
use stream_frame::{Field, FieldType, FieldValue, Frame};

use super::{ConvertError, coerce};
use crate::pipeline::{ChannelFrame, Vars};
use crate::rule::{AutoJsonConverterConfig, FieldTip};

/// Flattens any JSON document into a single-row frame, one column per
/// scalar leaf.
#[derive(Debug, Clone, Default)]
pub struct AutoJsonConverter {
    config: AutoJsonConverterConfig,
}

impl AutoJsonConverter {
    pub fn new(config: AutoJsonConverterConfig) -> Self {
        Self { config }
    }

    pub fn convert(&self, vars: &Vars, body: &[u8]) -> Result<Vec<ChannelFrame>, ConvertError> {
        let doc: Value = serde_json::from_slice(body)?;

        let mut time = Field::new("time", FieldType::Time);
        time.append(Utc::now())?;
        let mut frame = Frame::new(vars.path.clone()).with_field(time);

        let mut leaves = Vec::new();
        flatten(String::new(), &doc, &mut leaves);
        for (path, raw) in leaves {
            if let Some(field) = self.leaf_field(&path, raw)? {
                frame.fields.push(field);
            }
        }
        Ok(vec![ChannelFrame::here(frame)])
    }

    fn leaf_field(&self, path: &str, raw: &Value) -> Result<Option<Field>, ConvertError> {
        let tip = self.config.field_tips.get(path);
        let Some(field_type) = tip.map(|t| t.field_type).or_else(|| natural_type(raw)) else {
            return Ok(None);
        };
        let value = match tip {
            Some(_) => coerce(path, raw, field_type)?,
            None => natural_value(raw),
        };

        let mut field = Field::new_nullable(field_name(path, tip), field_type);
        if let Some(config) = tip.and_then(|t| t.config.clone()) {
            field = field.with_config(config);
        }
        field.append(value)?;
        Ok(Some(field))
    }
}

fn field_name(path: &str, tip: Option<&FieldTip>) -> String {
    tip.and_then(|t| t.name.clone())
        .unwrap_or_else(|| path.to_string())
}

fn natural_type(raw: &Value) -> Option<FieldType> {
    match raw {
        Value::Number(_) => Some(FieldType::Float64),
        Value::String(_) => Some(FieldType::String),
        Value::Bool(_) => Some(FieldType::Bool),
        _ => None,
    }
}

fn natural_value(raw: &Value) -> FieldValue {
    match raw {
        Value::Number(n) => n.as_f64().map(FieldValue::Float64).unwrap_or(FieldValue::Null),
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Bool(b) => FieldValue::Bool(*b),
        _ => FieldValue::Null,
    }
}

/// Collects every scalar (and null) leaf with its path: `a.b`, `items[0]`.
fn flatten<'v>(prefix: String, value: &'v Value, out: &mut Vec<(String, &'v Value)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(path, child, out);
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten(format!("{prefix}[{idx}]"), child, out);
            }
        }
        scalar => out.push((prefix, scalar)),
    }
}
