//! Condition checkers gate conditional outputters on a frame's first row.

use stream_frame::Frame;

use crate::pipeline::Vars;
use crate::rule::{ConditionCheckerConfig, ConditionMode, NumberCompareOp};

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionChecker {
    NumberCompare(NumberCompareCondition),
    Multiple(MultipleConditionChecker),
}

impl ConditionChecker {
    pub fn from_config(config: &ConditionCheckerConfig) -> Self {
        match config {
            ConditionCheckerConfig::NumberCompare(c) => ConditionChecker::NumberCompare(
                NumberCompareCondition::new(c.field_name.clone(), c.op, c.value),
            ),
            ConditionCheckerConfig::Multiple(c) => {
                ConditionChecker::Multiple(MultipleConditionChecker {
                    mode: c.mode,
                    conditions: c.conditions.iter().map(ConditionChecker::from_config).collect(),
                })
            }
        }
    }

    pub fn check(&self, vars: &Vars, frame: &Frame) -> bool {
        match self {
            ConditionChecker::NumberCompare(c) => c.check(frame),
            ConditionChecker::Multiple(c) => c.check(vars, frame),
        }
    }
}

/// Compares the first value of a field against a constant. A missing field,
/// an empty frame or a non-numeric value never matches.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberCompareCondition {
    field_name: String,
    op: NumberCompareOp,
    value: f64,
}

impl NumberCompareCondition {
    pub fn new(field_name: String, op: NumberCompareOp, value: f64) -> Self {
        Self {
            field_name,
            op,
            value,
        }
    }

    fn check(&self, frame: &Frame) -> bool {
        let Some(field) = frame.field_by_name(&self.field_name) else {
            return false;
        };
        if field.is_empty() {
            return false;
        }
        let Some(v) = field.at(0).as_f64() else {
            return false;
        };
        match self.op {
            NumberCompareOp::Lt => v < self.value,
            NumberCompareOp::Gt => v > self.value,
            NumberCompareOp::Lte => v <= self.value,
            NumberCompareOp::Gte => v >= self.value,
            NumberCompareOp::Eq => v == self.value,
            NumberCompareOp::Ne => v != self.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipleConditionChecker {
    mode: ConditionMode,
    conditions: Vec<ConditionChecker>,
}

impl MultipleConditionChecker {
    fn check(&self, vars: &Vars, frame: &Frame) -> bool {
        match self.mode {
            ConditionMode::All => self.conditions.iter().all(|c| c.check(vars, frame)),
            ConditionMode::Any => self.conditions.iter().any(|c| c.check(vars, frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{MultipleConditionConfig, NumberCompareConfig};
    use stream_frame::{Field, FieldType, FieldValue};

    fn frame(values: &[Option<f64>]) -> Frame {
        let mut cpu = Field::new_nullable("cpu", FieldType::Float64);
        for v in values {
            cpu.append(v.map(FieldValue::Float64).unwrap_or(FieldValue::Null))
                .unwrap();
        }
        Frame::new("m").with_field(cpu)
    }

    fn compare(op: NumberCompareOp, value: f64) -> ConditionCheckerConfig {
        ConditionCheckerConfig::NumberCompare(NumberCompareConfig {
            field_name: "cpu".to_string(),
            op,
            value,
        })
    }

    fn vars() -> Vars {
        Vars::new(1, "stream/test/m").unwrap()
    }

    #[test]
    fn number_compare_uses_first_row() {
        let f = frame(&[Some(95.0), Some(10.0)]);
        let gt = ConditionChecker::from_config(&compare(NumberCompareOp::Gt, 90.0));
        let lte = ConditionChecker::from_config(&compare(NumberCompareOp::Lte, 95.0));
        let ne = ConditionChecker::from_config(&compare(NumberCompareOp::Ne, 95.0));
        assert!(gt.check(&vars(), &f));
        assert!(lte.check(&vars(), &f));
        assert!(!ne.check(&vars(), &f));
    }

    #[test]
    fn missing_or_null_never_matches() {
        let ne = ConditionChecker::from_config(&compare(NumberCompareOp::Ne, 1.0));
        assert!(!ne.check(&vars(), &frame(&[])));
        assert!(!ne.check(&vars(), &frame(&[None])));
        assert!(!ne.check(&vars(), &Frame::new("empty")));
    }

    #[test]
    fn multiple_all_and_any() {
        let f = frame(&[Some(50.0)]);
        let build = |mode| {
            ConditionChecker::from_config(&ConditionCheckerConfig::Multiple(MultipleConditionConfig {
                mode,
                conditions: vec![
                    compare(NumberCompareOp::Gt, 10.0),
                    compare(NumberCompareOp::Gt, 80.0),
                ],
            }))
        };
        assert!(!build(ConditionMode::All).check(&vars(), &f));
        assert!(build(ConditionMode::Any).check(&vars(), &f));
    }
}
