//! Frame wire format.
//!
//! A frame travels as `{"schema": {...}, "data": {"values": [[...], ...]}}`.
//! Schema and data are encoded separately so a stream that already sent the
//! schema to its subscribers can follow up with data-only payloads.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Field, FieldConfig, FieldType, Frame, FrameError, Labels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    All,
    SchemaOnly,
    DataOnly,
}

/// Structural hash of an encoded schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SchemaFingerprint(pub u64);

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypeInfo {
    #[serde(default)]
    nullable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    type_info: Option<TypeInfo>,
    #[serde(default, skip_serializing_if = "Labels::is_empty")]
    labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<FieldConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Schema {
    #[serde(default)]
    name: String,
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Data {
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    schema: Option<Value>,
    data: Option<Value>,
}

/// An encoded frame, schema and data kept apart.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameJson {
    schema: String,
    data: String,
}

impl FrameJson {
    pub fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        frame.validate()?;
        let schema = Schema {
            name: frame.name.clone(),
            fields: frame
                .fields
                .iter()
                .map(|f| FieldSchema {
                    name: f.name.clone(),
                    field_type: f.field_type().as_str().to_string(),
                    type_info: Some(TypeInfo {
                        nullable: f.nullable,
                    }),
                    labels: f.labels.clone(),
                    config: f.config.clone(),
                })
                .collect(),
        };
        let data = Data {
            values: frame.fields.iter().map(Field::json_values).collect(),
        };
        Ok(Self {
            schema: serde_json::to_string(&schema)?,
            data: serde_json::to_string(&data)?,
        })
    }

    /// Parses an encoded frame. Either section may be missing, e.g. for
    /// data-only payloads; `to_frame` needs both.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        Ok(Self {
            schema: envelope
                .schema
                .map(|v| v.to_string())
                .unwrap_or_default(),
            data: envelope.data.map(|v| v.to_string()).unwrap_or_default(),
        })
    }

    pub fn to_frame(&self) -> Result<Frame, FrameError> {
        if self.schema.is_empty() {
            return Err(FrameError::MissingSection("schema"));
        }
        let schema: Schema = serde_json::from_str(&self.schema)?;
        let data: Option<Data> = if self.data.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&self.data)?)
        };

        let mut frame = Frame::new(schema.name);
        for (idx, fs) in schema.fields.into_iter().enumerate() {
            let field_type = FieldType::parse(&fs.field_type)?;
            let mut field = Field::new(fs.name, field_type).with_labels(fs.labels);
            field.nullable = fs.type_info.map(|t| t.nullable).unwrap_or(false);
            field.config = fs.config;
            if let Some(column) = data.as_ref().and_then(|d| d.values.get(idx)) {
                for raw in column {
                    field.push_json(raw)?;
                }
            }
            frame.fields.push(field);
        }
        frame.validate()?;
        Ok(frame)
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn bytes(&self, include: Include) -> Vec<u8> {
        let body = match include {
            Include::All => format!(r#"{{"schema":{},"data":{}}}"#, self.schema, self.data),
            Include::SchemaOnly => format!(r#"{{"schema":{}}}"#, self.schema),
            Include::DataOnly => format!(r#"{{"data":{}}}"#, self.data),
        };
        body.into_bytes()
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        let mut hasher = DefaultHasher::new();
        self.schema.hash(&mut hasher);
        SchemaFingerprint(hasher.finish())
    }
}
