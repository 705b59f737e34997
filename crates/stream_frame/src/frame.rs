use crate::json::FrameJson;
use crate::{Field, FieldType, FieldValue, FrameError};

/// A columnar table. All fields hold the same number of rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn rows(&self) -> usize {
        self.fields.first().map(Field::len).unwrap_or(0)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_name_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// The first time-typed field, if any.
    pub fn time_field(&self) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.field_type() == FieldType::Time)
    }

    pub fn row(&self, idx: usize) -> Vec<FieldValue> {
        self.fields.iter().map(|f| f.at(idx)).collect()
    }

    /// Appends one value per field, in field order.
    pub fn append_row(&mut self, row: Vec<FieldValue>) -> Result<(), FrameError> {
        if row.len() != self.fields.len() {
            return Err(FrameError::RowWidthMismatch {
                expected: self.fields.len(),
                got: row.len(),
            });
        }
        for (field, value) in self.fields.iter_mut().zip(row) {
            field.append(value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), FrameError> {
        let expected = self.rows();
        for field in &self.fields {
            if field.len() != expected {
                return Err(FrameError::RowCountMismatch {
                    field: field.name.clone(),
                    expected,
                    got: field.len(),
                });
            }
        }
        Ok(())
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self, FrameError> {
        FrameJson::from_bytes(raw)?.to_frame()
    }

    pub fn to_json(&self) -> Result<FrameJson, FrameError> {
        FrameJson::from_frame(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample() -> Frame {
        Frame::new("cpu")
            .with_field(Field::new("time", FieldType::Time))
            .with_field(Field::new("value", FieldType::Float64))
            .with_field(Field::new_nullable("host", FieldType::String))
    }

    #[test]
    fn append_rows_and_read_back() {
        let mut frame = sample();
        let now = Utc::now();
        frame
            .append_row(vec![now.into(), 1.0.into(), "a".into()])
            .unwrap();
        frame
            .append_row(vec![now.into(), 2.0.into(), FieldValue::Null])
            .unwrap();

        assert_eq!(frame.rows(), 2);
        assert_eq!(frame.field_index("host"), Some(2));
        assert_eq!(frame.row(1)[1], FieldValue::Float64(2.0));
        assert_eq!(frame.time_field().unwrap().name, "time");
        frame.validate().unwrap();
    }

    #[test]
    fn rejects_short_rows() {
        let mut frame = sample();
        let err = frame.append_row(vec![1.0.into()]).unwrap_err();
        assert!(matches!(
            err,
            FrameError::RowWidthMismatch {
                expected: 3,
                got: 1
            }
        ));
    }

    #[test]
    fn validate_detects_ragged_columns() {
        let mut frame = sample();
        frame.fields[1].append(1.0).unwrap();
        assert!(matches!(
            frame.validate(),
            Err(FrameError::RowCountMismatch { .. })
        ));
    }
}
