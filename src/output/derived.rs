//! Outputters that compare each row with the previous one and emit derived
//! rows to another channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use stream_frame::{Field, FieldType, FieldValue, Frame, ThresholdsMode};
use tracing::debug;

use super::OutputError;
use crate::pipeline::{ChannelFrame, Vars};
use crate::stream::FrameCache;

fn row_time(frame: &Frame, row: usize) -> DateTime<Utc> {
    match frame.time_field().map(|f| f.at(row)) {
        Some(FieldValue::Time(t)) => t,
        _ => Utc::now(),
    }
}

/// Last non-null value of `field_name` in the frame stored for `channel`.
fn previous_value(store: &FrameCache, org_id: i64, channel: &str, field_name: &str) -> FieldValue {
    let Some(frame) = store.get(org_id, channel).and_then(|json| json.to_frame().ok()) else {
        return FieldValue::Null;
    };
    let Some(field) = frame.field_by_name(field_name) else {
        return FieldValue::Null;
    };
    (0..field.len())
        .rev()
        .map(|i| field.at(i))
        .find(|v| !v.is_null())
        .unwrap_or(FieldValue::Null)
}

/// Emits `{time, value, state, color}` whenever the threshold band of a
/// field changes.
#[derive(Debug)]
pub struct ThresholdOutput {
    field_name: String,
    channel: String,
    store: Arc<FrameCache>,
}

impl ThresholdOutput {
    pub fn new(field_name: impl Into<String>, channel: impl Into<String>, store: Arc<FrameCache>) -> Self {
        Self {
            field_name: field_name.into(),
            channel: channel.into(),
            store,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub(super) fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        let Some(field) = frame.field_by_name(&self.field_name) else {
            debug!(field = %self.field_name, "threshold field not in frame");
            return Ok(Vec::new());
        };
        let Some(thresholds) = field.config.as_ref().and_then(|c| c.thresholds.as_ref()) else {
            return Ok(Vec::new());
        };
        if thresholds.mode != ThresholdsMode::Absolute {
            return Err(OutputError::Unsupported {
                field: self.field_name.clone(),
                reason: "only absolute thresholds are supported".to_string(),
            });
        }
        if thresholds.steps.is_empty() {
            return Ok(Vec::new());
        }

        let state_of = |value: f64| -> (String, String) {
            thresholds
                .step_for(value)
                .map(|s| (s.state.clone(), s.color.clone()))
                .unwrap_or_default()
        };

        let mut previous = previous_value(&self.store, vars.org_id, &self.channel, &self.field_name)
            .as_f64()
            .map(|v| state_of(v).0)
            .unwrap_or_default();

        let mut out = Frame::new(frame.name.clone())
            .with_field(Field::new("time", FieldType::Time))
            .with_field(Field::new("value", FieldType::Float64))
            .with_field(Field::new("state", FieldType::String))
            .with_field(Field::new("color", FieldType::String));

        for row in 0..field.len() {
            let Some(value) = field.at(row).as_f64() else {
                continue;
            };
            let (state, color) = state_of(value);
            if state == previous {
                continue;
            }
            out.append_row(vec![
                row_time(frame, row).into(),
                value.into(),
                state.clone().into(),
                color.into(),
            ])?;
            previous = state;
        }

        self.store.update_frame(vars.org_id, &self.channel, frame)?;
        if out.rows() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![ChannelFrame::to(self.channel.clone(), out)])
    }
}

/// Emits `{time, old, new}` whenever a field's value changes.
#[derive(Debug)]
pub struct ChangeLogOutput {
    field_name: String,
    channel: String,
    store: Arc<FrameCache>,
}

impl ChangeLogOutput {
    pub fn new(field_name: impl Into<String>, channel: impl Into<String>, store: Arc<FrameCache>) -> Self {
        Self {
            field_name: field_name.into(),
            channel: channel.into(),
            store,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub(super) fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        let Some(field) = frame.field_by_name(&self.field_name) else {
            return Ok(Vec::new());
        };
        let field_type = field.field_type();

        let mut previous = previous_value(&self.store, vars.org_id, &self.channel, &self.field_name);
        if previous.field_type().is_some_and(|t| t != field_type) {
            previous = FieldValue::Null;
        }

        let mut out = Frame::new(frame.name.clone())
            .with_field(Field::new("time", FieldType::Time))
            .with_field(Field::new_nullable("old", field_type))
            .with_field(Field::new_nullable("new", field_type));

        for row in 0..field.len() {
            let current = field.at(row);
            if current == previous {
                continue;
            }
            out.append_row(vec![
                row_time(frame, row).into(),
                previous.clone(),
                current.clone(),
            ])?;
            previous = current;
        }

        self.store.update_frame(vars.org_id, &self.channel, frame)?;
        if out.rows() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![ChannelFrame::to(self.channel.clone(), out)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_frame::{FieldConfig, Threshold, ThresholdsConfig};

    fn vars() -> Vars {
        Vars::new(1, "stream/sensors/temp").unwrap()
    }

    fn thresholds() -> ThresholdsConfig {
        ThresholdsConfig::absolute(vec![
            Threshold::new(Some(5.0), "warn", "orange"),
            Threshold::new(Some(10.0), "crit", "red"),
        ])
    }

    fn frame(values: &[f64], config: Option<FieldConfig>) -> Frame {
        let mut value = Field::new("value", FieldType::Float64);
        if let Some(config) = config {
            value = value.with_config(config);
        }
        for v in values {
            value.append(*v).unwrap();
        }
        Frame::new("temp").with_field(value)
    }

    fn states(out: &[ChannelFrame]) -> Vec<FieldValue> {
        let field = out[0].frame.field_by_name("state").unwrap();
        (0..field.len()).map(|i| field.at(i)).collect()
    }

    #[test]
    fn threshold_emits_only_transitions() {
        let out = ThresholdOutput::new("value", "stream/sensors/temp_state", FrameCache::new());
        let config = FieldConfig::with_thresholds(thresholds());
        let emitted = out
            .output(&vars(), &frame(&[3.0, 6.0, 6.0, 11.0, 4.0], Some(config)))
            .unwrap();

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].channel, "stream/sensors/temp_state");
        assert_eq!(emitted[0].frame.rows(), 3);
        assert_eq!(
            states(&emitted),
            vec![
                FieldValue::from("warn"),
                FieldValue::from("crit"),
                FieldValue::from(""),
            ]
        );
        let values = emitted[0].frame.field_by_name("value").unwrap();
        assert_eq!(values.at(0), FieldValue::Float64(6.0));
        assert_eq!(values.at(2), FieldValue::Float64(4.0));
    }

    #[test]
    fn threshold_remembers_state_across_calls() {
        let out = ThresholdOutput::new("value", "stream/sensors/temp_state", FrameCache::new());
        let config = FieldConfig::with_thresholds(thresholds());
        assert_eq!(
            out.output(&vars(), &frame(&[7.0], Some(config.clone())))
                .unwrap()
                .len(),
            1
        );
        assert!(
            out.output(&vars(), &frame(&[8.0], Some(config.clone())))
                .unwrap()
                .is_empty()
        );
        let emitted = out.output(&vars(), &frame(&[12.0], Some(config))).unwrap();
        assert_eq!(states(&emitted), vec![FieldValue::from("crit")]);
    }

    #[test]
    fn threshold_without_config_emits_nothing() {
        let store = FrameCache::new();
        let out = ThresholdOutput::new("value", "stream/sensors/temp_state", store.clone());
        assert!(out.output(&vars(), &frame(&[50.0], None)).unwrap().is_empty());
        assert!(store.get(1, "stream/sensors/temp_state").is_none());
    }

    #[test]
    fn threshold_rejects_percentage_mode() {
        let mut config = thresholds();
        config.mode = ThresholdsMode::Percentage;
        let out = ThresholdOutput::new("value", "stream/sensors/temp_state", FrameCache::new());
        let err = out
            .output(&vars(), &frame(&[1.0], Some(FieldConfig::with_thresholds(config))))
            .unwrap_err();
        assert!(matches!(err, OutputError::Unsupported { .. }));
    }

    #[test]
    fn change_log_tracks_old_and_new() {
        let store = FrameCache::new();
        let out = ChangeLogOutput::new("value", "stream/sensors/temp_changes", store);

        let emitted = out.output(&vars(), &frame(&[1.0, 1.0, 2.0], None)).unwrap();
        let log = &emitted[0].frame;
        assert_eq!(log.rows(), 2);
        assert_eq!(log.field_by_name("old").unwrap().at(0), FieldValue::Null);
        assert_eq!(log.field_by_name("new").unwrap().at(0), FieldValue::Float64(1.0));
        assert_eq!(log.field_by_name("old").unwrap().at(1), FieldValue::Float64(1.0));
        assert_eq!(log.field_by_name("new").unwrap().at(1), FieldValue::Float64(2.0));

        assert!(out.output(&vars(), &frame(&[2.0], None)).unwrap().is_empty());
        let emitted = out.output(&vars(), &frame(&[3.0], None)).unwrap();
        assert_eq!(
            emitted[0].frame.field_by_name("old").unwrap().at(0),
            FieldValue::Float64(2.0)
        );
    }
}
