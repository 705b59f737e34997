//! Catalog of stage types a rule may reference.

use serde::Serialize;
use serde_json::{Value, json};

use crate::rule::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCategory {
    Converter,
    FrameProcessor,
    ConditionChecker,
    FrameOutputter,
    DataOutputter,
    Subscriber,
}

impl StageCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageCategory::Converter => "converter",
            StageCategory::FrameProcessor => "frameProcessor",
            StageCategory::ConditionChecker => "conditionChecker",
            StageCategory::FrameOutputter => "frameOutputter",
            StageCategory::DataOutputter => "dataOutputter",
            StageCategory::Subscriber => "subscriber",
        }
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.entities().iter().map(|e| e.entity_type).collect()
    }

    pub fn entities(&self) -> Vec<EntityInfo> {
        match self {
            StageCategory::Converter => vec![
                EntityInfo::new(
                    "jsonAuto",
                    "Flattens any JSON document into one row, one column per leaf path.",
                    json!({"type": "jsonAuto", "fieldTips": {"value": {"type": "float64"}}}),
                ),
                EntityInfo::new(
                    "jsonExact",
                    "Extracts declared fields from JSON with paths or expressions.",
                    json!({"type": "jsonExact", "fields": [
                        {"name": "time", "type": "time", "value": "#{now}"},
                        {"name": "value", "type": "float64", "value": "$.value"}
                    ]}),
                ),
                EntityInfo::new(
                    "influxAuto",
                    "Parses Influx line protocol into frames per measurement.",
                    json!({"type": "influxAuto", "frameFormat": "labels_column"}),
                ),
                EntityInfo::new(
                    "jsonFrame",
                    "Decodes an already encoded frame.",
                    json!({"type": "jsonFrame"}),
                ),
            ],
            StageCategory::FrameProcessor => vec![
                EntityInfo::new(
                    "keepFields",
                    "Keeps only the listed fields.",
                    json!({"type": "keepFields", "fieldNames": ["time", "value"]}),
                ),
                EntityInfo::new(
                    "dropFields",
                    "Removes the listed fields.",
                    json!({"type": "dropFields", "fieldNames": ["debug"]}),
                ),
                EntityInfo::new(
                    "multiple",
                    "Runs processors in order.",
                    json!({"type": "multiple", "processors": []}),
                ),
            ],
            StageCategory::ConditionChecker => vec![
                EntityInfo::new(
                    "numberCompare",
                    "Compares the first value of a numeric field.",
                    json!({"type": "numberCompare", "fieldName": "value", "op": "gt", "value": 10}),
                ),
                EntityInfo::new(
                    "multiple",
                    "Combines conditions with all/any.",
                    json!({"type": "multiple", "mode": "any", "conditions": []}),
                ),
            ],
            StageCategory::FrameOutputter => vec![
                EntityInfo::new(
                    "managedStream",
                    "Publishes to subscribers, sending the schema only when it changes.",
                    json!({"type": "managedStream"}),
                ),
                EntityInfo::new(
                    "localSubscribers",
                    "Publishes the full frame to local subscribers of the channel.",
                    json!({"type": "localSubscribers"}),
                ),
                EntityInfo::new(
                    "redirect",
                    "Processes the frame again under another channel.",
                    json!({"type": "redirect", "channel": "stream/other/path"}),
                ),
                EntityInfo::new(
                    "conditional",
                    "Runs an outputter only when a condition holds.",
                    json!({"type": "conditional",
                           "condition": {"type": "numberCompare", "fieldName": "value", "op": "gt", "value": 10},
                           "outputter": {"type": "redirect", "channel": "stream/alerts/high"}}),
                ),
                EntityInfo::new(
                    "threshold",
                    "Emits a row whenever a field crosses into another threshold step.",
                    json!({"type": "threshold", "fieldName": "value", "channel": "stream/states/value"}),
                ),
                EntityInfo::new(
                    "changeLog",
                    "Emits old and new values whenever a field changes.",
                    json!({"type": "changeLog", "fieldName": "value", "channel": "stream/changes/value"}),
                ),
                EntityInfo::new(
                    "remoteWrite",
                    "Buffers numeric fields and flushes them with Prometheus remote write.",
                    json!({"type": "remoteWrite", "uid": "prom", "sampleMilliseconds": 1000}),
                ),
                EntityInfo::new(
                    "loki",
                    "Pushes the encoded frame to Loki as a log line.",
                    json!({"type": "loki", "uid": "loki"}),
                ),
                EntityInfo::new(
                    "multiple",
                    "Runs outputters in order.",
                    json!({"type": "multiple", "outputters": []}),
                ),
            ],
            StageCategory::DataOutputter => vec![
                EntityInfo::new(
                    "redirect",
                    "Processes the raw payload again under another channel.",
                    json!({"type": "redirect", "channel": "stream/other/path"}),
                ),
                EntityInfo::new(
                    "localSubscribers",
                    "Publishes the raw payload to local subscribers.",
                    json!({"type": "localSubscribers"}),
                ),
                EntityInfo::new(
                    "loki",
                    "Pushes the raw payload to Loki as a log line.",
                    json!({"type": "loki", "uid": "loki"}),
                ),
            ],
            StageCategory::Subscriber => vec![
                EntityInfo::new(
                    "builtin",
                    "Accepts subscriptions with presence enabled.",
                    json!({"type": "builtin"}),
                ),
                EntityInfo::new(
                    "managedStream",
                    "Accepts subscriptions and sends the last cached frame.",
                    json!({"type": "managedStream"}),
                ),
                EntityInfo::new(
                    "multiple",
                    "Runs subscribers in order until one refuses.",
                    json!({"type": "multiple", "subscribers": []}),
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityInfo {
    #[serde(rename = "type")]
    pub entity_type: &'static str,
    pub description: &'static str,
    pub example: Value,
}

impl EntityInfo {
    fn new(entity_type: &'static str, description: &'static str, example: Value) -> Self {
        Self {
            entity_type,
            description,
            example,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitiesInfo {
    pub converters: Vec<EntityInfo>,
    pub frame_processors: Vec<EntityInfo>,
    pub condition_checkers: Vec<EntityInfo>,
    pub frame_outputters: Vec<EntityInfo>,
    pub data_outputters: Vec<EntityInfo>,
    pub subscribers: Vec<EntityInfo>,
}

pub fn entities() -> EntitiesInfo {
    EntitiesInfo {
        converters: StageCategory::Converter.entities(),
        frame_processors: StageCategory::FrameProcessor.entities(),
        condition_checkers: StageCategory::ConditionChecker.entities(),
        frame_outputters: StageCategory::FrameOutputter.entities(),
        data_outputters: StageCategory::DataOutputter.entities(),
        subscribers: StageCategory::Subscriber.entities(),
    }
}

/// Walks raw rule settings and rejects the first stage whose `type` is not
/// in the catalog, including nested outputters and conditions.
pub fn check_settings(settings: &Value) -> Result<(), ConfigError> {
    if let Some(converter) = settings.get("converter") {
        if !converter.is_null() {
            check_entry(StageCategory::Converter, converter)?;
        }
    }
    for (key, category) in [
        ("subscribers", StageCategory::Subscriber),
        ("frameProcessors", StageCategory::FrameProcessor),
        ("frameOutputters", StageCategory::FrameOutputter),
        ("dataOutputters", StageCategory::DataOutputter),
    ] {
        for entry in array(settings, key) {
            check_entry(category, entry)?;
        }
    }
    Ok(())
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn check_entry(category: StageCategory, entry: &Value) -> Result<(), ConfigError> {
    let type_name = entry
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ConfigError::MissingType {
            category: category.as_str(),
        })?;
    if !category.types().contains(&type_name) {
        return Err(ConfigError::UnknownType {
            category: category.as_str(),
            type_name: type_name.to_string(),
        });
    }

    match (category, type_name) {
        (StageCategory::FrameProcessor, "multiple") => {
            for nested in array(entry, "processors") {
                check_entry(StageCategory::FrameProcessor, nested)?;
            }
        }
        (StageCategory::ConditionChecker, "multiple") => {
            for nested in array(entry, "conditions") {
                check_entry(StageCategory::ConditionChecker, nested)?;
            }
        }
        (StageCategory::FrameOutputter, "multiple") => {
            for nested in array(entry, "outputters") {
                check_entry(StageCategory::FrameOutputter, nested)?;
            }
        }
        (StageCategory::FrameOutputter, "conditional") => {
            if let Some(condition) = entry.get("condition") {
                check_entry(StageCategory::ConditionChecker, condition)?;
            }
            if let Some(outputter) = entry.get("outputter") {
                check_entry(StageCategory::FrameOutputter, outputter)?;
            }
        }
        (StageCategory::Subscriber, "multiple") => {
            for nested in array(entry, "subscribers") {
                check_entry(StageCategory::Subscriber, nested)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_example_passes_its_own_check() {
        let all = entities();
        for entity in all.frame_outputters.iter() {
            check_entry(StageCategory::FrameOutputter, &entity.example).unwrap();
        }
        for entity in all.converters.iter() {
            check_entry(StageCategory::Converter, &entity.example).unwrap();
        }
    }

    #[test]
    fn nested_unknown_condition_is_reported() {
        let settings = json!({
            "frameOutputters": [{
                "type": "multiple",
                "outputters": [{
                    "type": "conditional",
                    "condition": {"type": "multiple", "conditions": [{"type": "regexMatch"}]},
                    "outputter": {"type": "managedStream"}
                }]
            }]
        });
        assert_eq!(
            check_settings(&settings).unwrap_err(),
            ConfigError::UnknownType {
                category: "conditionChecker",
                type_name: "regexMatch".to_string(),
            }
        );
    }

    #[test]
    fn data_outputters_have_their_own_catalog() {
        let settings = json!({"dataOutputters": [{"type": "threshold"}]});
        assert!(matches!(
            check_settings(&settings),
            Err(ConfigError::UnknownType { category: "dataOutputter", .. })
        ));
    }

    #[test]
    fn missing_type_is_rejected() {
        let settings = json!({"converter": {"fieldTips": {}}});
        assert_eq!(
            check_settings(&settings).unwrap_err(),
            ConfigError::MissingType {
                category: "converter"
            }
        );
    }

    #[test]
    fn entities_serialize_with_type_key() {
        let value = serde_json::to_value(entities()).unwrap();
        assert_eq!(value["converters"][0]["type"], "jsonAuto");
        assert_eq!(value["subscribers"].as_array().unwrap().len(), 3);
    }
}
