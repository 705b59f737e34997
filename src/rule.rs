//! Rule configuration as it is stored: a pattern plus the declarative list
//! of stages bound to it. Every stage config is a `{"type": ..., ...}`
//! object; the runtime counterparts are built in `builder`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stream_frame::{FieldConfig, FieldType};
use thiserror::Error;

use crate::auth::Role;
use crate::pattern::PatternError;
use crate::registry;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown {category} type `{type_name}`")]
    UnknownType {
        category: &'static str,
        type_name: String,
    },
    #[error("{category} entry is missing a `type`")]
    MissingType { category: &'static str },
    #[error("invalid rule `{pattern}`: {reason}")]
    InvalidRule { pattern: String, reason: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("rule `{pattern}` conflicts with `{existing}` in org {org_id}")]
    Conflict {
        org_id: i64,
        pattern: String,
        existing: String,
    },
    #[error("write config `{0}` not found")]
    WriteConfigNotFound(String),
    #[error("write config `{uid}`: {reason}")]
    InvalidWriteConfig { uid: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRule {
    /// 0 marks a default rule, applied to org 1.
    #[serde(default)]
    pub org_id: i64,
    pub pattern: String,
    #[serde(default)]
    pub settings: ChannelRuleSettings,
}

impl ChannelRule {
    /// Checks stage types on the raw document first so an unknown type is
    /// reported by name instead of as a generic decode failure.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let pattern = value
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(settings) = value.get("settings") {
            registry::check_settings(settings)?;
        }
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidRule {
            pattern,
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRuleSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converter: Option<ConverterConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<SubscriberConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frame_processors: Vec<FrameProcessorConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frame_outputters: Vec<FrameOutputterConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_outputters: Vec<DataOutputterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RuleAuthConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<RoleCheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<RoleCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleCheckConfig {
    pub require_role: Role,
}

// converters

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConverterConfig {
    JsonAuto(AutoJsonConverterConfig),
    JsonExact(ExactJsonConverterConfig),
    InfluxAuto(AutoInfluxConverterConfig),
    JsonFrame,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoJsonConverterConfig {
    /// Keyed by JSON path, e.g. `a.b` or `items[0]`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_tips: BTreeMap<String, FieldTip>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldTip {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<FieldConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExactJsonConverterConfig {
    pub fields: Vec<ExactJsonField>,
}

/// `value` is a JSON path (`$.a.b`), an expression over the document `x`
/// wrapped in braces (`{x.a * 2}`), or `#{now}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExactJsonField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelExtractor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<FieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LabelExtractor {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InfluxFrameFormat {
    #[default]
    Wide,
    LabelsColumn,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoInfluxConverterConfig {
    #[serde(default)]
    pub frame_format: InfluxFrameFormat,
    #[serde(default)]
    pub float64_numbers: bool,
}

// processors

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrameProcessorConfig {
    KeepFields(FieldNamesConfig),
    DropFields(FieldNamesConfig),
    Multiple(MultipleProcessorConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldNamesConfig {
    pub field_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MultipleProcessorConfig {
    pub processors: Vec<FrameProcessorConfig>,
}

// conditions

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConditionCheckerConfig {
    NumberCompare(NumberCompareConfig),
    Multiple(MultipleConditionConfig),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NumberCompareOp {
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NumberCompareConfig {
    pub field_name: String,
    pub op: NumberCompareOp,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MultipleConditionConfig {
    #[serde(default)]
    pub mode: ConditionMode,
    pub conditions: Vec<ConditionCheckerConfig>,
}

// outputters

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FrameOutputterConfig {
    ManagedStream,
    LocalSubscribers,
    Redirect(RedirectConfig),
    Conditional(ConditionalOutputConfig),
    Threshold(DerivedOutputConfig),
    ChangeLog(DerivedOutputConfig),
    RemoteWrite(RemoteWriteOutputConfig),
    Loki(LokiOutputConfig),
    Multiple(MultipleOutputterConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataOutputterConfig {
    Redirect(RedirectConfig),
    LocalSubscribers,
    Loki(LokiOutputConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RedirectConfig {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConditionalOutputConfig {
    pub condition: ConditionCheckerConfig,
    pub outputter: Box<FrameOutputterConfig>,
}

/// Threshold and change-log outputters watch `field_name` and emit derived
/// rows to `channel`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedOutputConfig {
    pub field_name: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteWriteOutputConfig {
    pub uid: String,
    #[serde(default)]
    pub sample_milliseconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LokiOutputConfig {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MultipleOutputterConfig {
    pub outputters: Vec<FrameOutputterConfig>,
}

// subscribers

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubscriberConfig {
    Builtin,
    ManagedStream,
    Multiple(MultipleSubscriberConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MultipleSubscriberConfig {
    pub subscribers: Vec<SubscriberConfig>,
}

// write configs

/// Connection settings for remote-write and Loki sinks, referenced by `uid`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteConfig {
    #[serde(default)]
    pub org_id: i64,
    pub uid: String,
    pub settings: WriteSettings,
    /// Encrypted values, e.g. `basicAuthPassword`.
    #[serde(default, skip_serializing)]
    pub secure_settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteSettings {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BasicAuth {
    pub user: String,
}

pub const BASIC_AUTH_PASSWORD: &str = "basicAuthPassword";

/// On-disk rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<ChannelRule>,
    #[serde(default)]
    pub write_configs: Vec<WriteConfig>,
}
