//! Frame processors: pure frame-to-frame transforms run in declared order.

use stream_frame::{Frame, FrameError};
use thiserror::Error;

use crate::pipeline::Vars;
use crate::rule::FrameProcessorConfig;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processor `{stage}` produced an invalid frame: {source}")]
    InvalidFrame {
        stage: &'static str,
        #[source]
        source: FrameError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameProcessor {
    KeepFields(KeepFieldsProcessor),
    DropFields(DropFieldsProcessor),
    Multiple(MultipleProcessor),
}

impl FrameProcessor {
    pub fn from_config(config: &FrameProcessorConfig) -> Self {
        match config {
            FrameProcessorConfig::KeepFields(c) => {
                FrameProcessor::KeepFields(KeepFieldsProcessor::new(c.field_names.clone()))
            }
            FrameProcessorConfig::DropFields(c) => {
                FrameProcessor::DropFields(DropFieldsProcessor::new(c.field_names.clone()))
            }
            FrameProcessorConfig::Multiple(c) => FrameProcessor::Multiple(MultipleProcessor::new(
                c.processors.iter().map(FrameProcessor::from_config).collect(),
            )),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FrameProcessor::KeepFields(_) => "keepFields",
            FrameProcessor::DropFields(_) => "dropFields",
            FrameProcessor::Multiple(_) => "multiple",
        }
    }

    /// `Ok(None)` drops the frame: nothing downstream runs.
    pub fn process(&self, vars: &Vars, frame: Frame) -> Result<Option<Frame>, ProcessError> {
        match self {
            FrameProcessor::KeepFields(p) => checked(self.type_name(), p.process(frame)),
            FrameProcessor::DropFields(p) => checked(self.type_name(), p.process(frame)),
            FrameProcessor::Multiple(p) => p.process(vars, frame),
        }
    }
}

/// Projections keep columns as they are, so mismatched row counts survive
/// them and must not reach outputters.
fn checked(stage: &'static str, frame: Option<Frame>) -> Result<Option<Frame>, ProcessError> {
    if let Some(frame) = &frame {
        frame
            .validate()
            .map_err(|source| ProcessError::InvalidFrame { stage, source })?;
    }
    Ok(frame)
}

/// Keeps only the named fields, in the frame's own order.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepFieldsProcessor {
    field_names: Vec<String>,
}

impl KeepFieldsProcessor {
    pub fn new(field_names: Vec<String>) -> Self {
        Self { field_names }
    }

    fn process(&self, mut frame: Frame) -> Option<Frame> {
        frame.fields.retain(|f| self.field_names.contains(&f.name));
        (!frame.fields.is_empty()).then_some(frame)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropFieldsProcessor {
    field_names: Vec<String>,
}

impl DropFieldsProcessor {
    pub fn new(field_names: Vec<String>) -> Self {
        Self { field_names }
    }

    fn process(&self, mut frame: Frame) -> Option<Frame> {
        frame.fields.retain(|f| !self.field_names.contains(&f.name));
        (!frame.fields.is_empty()).then_some(frame)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipleProcessor {
    processors: Vec<FrameProcessor>,
}

impl MultipleProcessor {
    pub fn new(processors: Vec<FrameProcessor>) -> Self {
        Self { processors }
    }

    fn process(&self, vars: &Vars, frame: Frame) -> Result<Option<Frame>, ProcessError> {
        let mut current = frame;
        for processor in &self.processors {
            match processor.process(vars, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{FieldNamesConfig, MultipleProcessorConfig};
    use stream_frame::{Field, FieldType, Vector};

    fn frame() -> Frame {
        Frame::new("m")
            .with_field(Field::new("time", FieldType::Time))
            .with_field(Field::new("a", FieldType::Float64))
            .with_field(Field::new("b", FieldType::String))
    }

    fn names(frame: &Frame) -> Vec<&str> {
        frame.fields.iter().map(|f| f.name.as_str()).collect()
    }

    fn vars() -> Vars {
        Vars::new(1, "stream/test/m").unwrap()
    }

    fn names_config(names: &[&str]) -> FieldNamesConfig {
        FieldNamesConfig {
            field_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn keep_fields_preserves_frame_order() {
        let p = FrameProcessor::from_config(&FrameProcessorConfig::KeepFields(names_config(&["b", "time"])));
        let out = p.process(&vars(), frame()).unwrap().unwrap();
        assert_eq!(names(&out), vec!["time", "b"]);
    }

    #[test]
    fn drop_fields_removes_named() {
        let p = FrameProcessor::from_config(&FrameProcessorConfig::DropFields(names_config(&["a"])));
        let out = p.process(&vars(), frame()).unwrap().unwrap();
        assert_eq!(names(&out), vec!["time", "b"]);
    }

    #[test]
    fn emptied_frame_is_dropped() {
        let p = FrameProcessor::from_config(&FrameProcessorConfig::KeepFields(names_config(&["nope"])));
        assert!(p.process(&vars(), frame()).unwrap().is_none());
    }

    #[test]
    fn ragged_frame_is_rejected() {
        let ragged = Frame::new("m")
            .with_field(Field::from_vector("a", Vector::Float64(vec![Some(1.0)])))
            .with_field(Field::from_vector("b", Vector::Float64(vec![Some(1.0), Some(2.0)])))
            .with_field(Field::from_vector("c", Vector::Float64(vec![Some(3.0)])));
        let p = FrameProcessor::from_config(&FrameProcessorConfig::Multiple(MultipleProcessorConfig {
            processors: vec![
                FrameProcessorConfig::DropFields(names_config(&["c"])),
                FrameProcessorConfig::KeepFields(names_config(&["a"])),
            ],
        }));
        let err = p.process(&vars(), ragged.clone()).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidFrame { stage: "dropFields", .. }));

        // projecting the offending column away yields a valid frame
        let keep = FrameProcessor::from_config(&FrameProcessorConfig::KeepFields(names_config(&["a", "c"])));
        assert_eq!(names(&keep.process(&vars(), ragged).unwrap().unwrap()), vec!["a", "c"]);
    }

    #[test]
    fn multiple_runs_in_order() {
        let p = FrameProcessor::from_config(&FrameProcessorConfig::Multiple(MultipleProcessorConfig {
            processors: vec![
                FrameProcessorConfig::DropFields(names_config(&["b"])),
                FrameProcessorConfig::KeepFields(names_config(&["a", "b"])),
            ],
        }));
        assert_eq!(p.type_name(), "multiple");
        let out = p.process(&vars(), frame()).unwrap().unwrap();
        assert_eq!(names(&out), vec!["a"]);
    }
}
