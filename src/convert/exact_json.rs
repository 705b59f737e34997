use chrono::Utc;
use serde_json::Value;
use stream_frame::{Field, FieldConfig, FieldType, Frame, Labels};

use super::{ConvertError, Expr, JsonPath, coerce};
use crate::pipeline::{ChannelFrame, Vars};
use crate::rule::ExactJsonConverterConfig;

const NOW: &str = "#{now}";

/// Where a field or label value comes from.
#[derive(Debug, Clone, PartialEq)]
enum Extractor {
    Now,
    Path(JsonPath),
    Expr(Expr),
    Literal(String),
}

impl Extractor {
    fn parse(raw: &str) -> Result<Self, ConvertError> {
        let trimmed = raw.trim();
        if trimmed == NOW {
            return Ok(Extractor::Now);
        }
        if trimmed.starts_with('$') {
            return Ok(Extractor::Path(JsonPath::parse(trimmed)?));
        }
        if let Some(body) = trimmed.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            return Ok(Extractor::Expr(Expr::parse(body)?));
        }
        Ok(Extractor::Literal(raw.to_string()))
    }

    fn extract(&self, doc: &Value, now_ms: i64) -> Result<Value, ConvertError> {
        Ok(match self {
            Extractor::Now => Value::from(now_ms),
            Extractor::Path(path) => path.lookup(doc).cloned().unwrap_or(Value::Null),
            Extractor::Expr(expr) => expr.eval(doc)?,
            Extractor::Literal(text) => Value::String(text.clone()),
        })
    }
}

#[derive(Debug, Clone)]
struct ExactField {
    name: String,
    field_type: FieldType,
    value: Extractor,
    labels: Vec<(String, Extractor)>,
    config: Option<FieldConfig>,
}

/// Builds a single-row frame from an explicit list of fields.
#[derive(Debug, Clone)]
pub struct ExactJsonConverter {
    fields: Vec<ExactField>,
}

impl ExactJsonConverter {
    pub fn new(config: &ExactJsonConverterConfig) -> Result<Self, ConvertError> {
        let fields = config
            .fields
            .iter()
            .map(|f| {
                let labels = f
                    .labels
                    .iter()
                    .map(|l| Ok((l.name.clone(), Extractor::parse(&l.value)?)))
                    .collect::<Result<Vec<_>, ConvertError>>()?;
                Ok(ExactField {
                    name: f.name.clone(),
                    field_type: f.field_type,
                    value: Extractor::parse(&f.value)?,
                    labels,
                    config: f.config.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConvertError>>()?;
        Ok(Self { fields })
    }

    pub fn convert(&self, vars: &Vars, body: &[u8]) -> Result<Vec<ChannelFrame>, ConvertError> {
        let doc: Value = serde_json::from_slice(body)?;
        let now_ms = Utc::now().timestamp_millis();

        let mut frame = Frame::new(vars.path.clone());
        for column in &self.fields {
            let raw = column.value.extract(&doc, now_ms)?;
            let value = coerce(&column.name, &raw, column.field_type)?;

            let mut labels = Labels::new();
            for (name, extractor) in &column.labels {
                match extractor.extract(&doc, now_ms)? {
                    Value::Null => {}
                    Value::String(s) => {
                        labels.insert(name.clone(), s);
                    }
                    other => {
                        labels.insert(name.clone(), other.to_string());
                    }
                }
            }

            let mut field = Field::new_nullable(column.name.clone(), column.field_type).with_labels(labels);
            if let Some(config) = &column.config {
                field = field.with_config(config.clone());
            }
            field.append(value)?;
            frame.fields.push(field);
        }
        Ok(vec![ChannelFrame::here(frame)])
    }
}
