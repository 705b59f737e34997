use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Display configuration attached to a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<ThresholdsConfig>,
}

impl FieldConfig {
    pub fn with_thresholds(thresholds: ThresholdsConfig) -> Self {
        Self {
            thresholds: Some(thresholds),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdsMode {
    #[default]
    Absolute,
    Percentage,
}

/// One band of a threshold ladder. A `value` of `None` is the base step and
/// matches everything (negative infinity).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Threshold {
    pub value: Option<f64>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub color: String,
}

impl Threshold {
    pub fn new(value: Option<f64>, state: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            value,
            state: state.into(),
            color: color.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ThresholdsConfig {
    #[serde(default)]
    pub mode: ThresholdsMode,
    pub steps: Vec<Threshold>,
}

impl ThresholdsConfig {
    pub fn absolute(steps: Vec<Threshold>) -> Self {
        Self {
            mode: ThresholdsMode::Absolute,
            steps,
        }
    }

    /// Largest step whose value is less than or equal to `value`.
    ///
    /// Steps do not need to be sorted; `None` is returned when the value sits
    /// below every step and no base step exists.
    pub fn step_for(&self, value: f64) -> Option<&Threshold> {
        let mut best: Option<&Threshold> = None;
        for step in &self.steps {
            let bound = step.value.unwrap_or(f64::NEG_INFINITY);
            if bound > value {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => bound >= current.value.unwrap_or(f64::NEG_INFINITY),
            };
            if better {
                best = Some(step);
            }
        }
        best
    }
}
