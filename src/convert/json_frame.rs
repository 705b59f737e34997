use stream_frame::Frame;

use super::ConvertError;
use crate::pipeline::{ChannelFrame, Vars};

/// Accepts payloads that are already encoded frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFrameConverter;

impl JsonFrameConverter {
    pub fn convert(&self, _vars: &Vars, body: &[u8]) -> Result<Vec<ChannelFrame>, ConvertError> {
        let frame = Frame::from_json_bytes(body)?;
        frame.validate()?;
        Ok(vec![ChannelFrame::here(frame)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_frame::{Field, FieldType, FieldValue, Include};

    #[test]
    fn decodes_an_encoded_frame() {
        let mut value = Field::new("value", FieldType::Float64);
        value.append(4.5).unwrap();
        let original = Frame::new("cpu").with_field(value);
        let body = original.to_json().unwrap().bytes(Include::All);

        let vars = Vars::new(1, "stream/frames/cpu").unwrap();
        let out = JsonFrameConverter.convert(&vars, &body).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame.name, "cpu");
        assert_eq!(out[0].frame.fields[0].at(0), FieldValue::Float64(4.5));
    }

    #[test]
    fn data_only_payload_is_rejected() {
        let value = Field::new("value", FieldType::Float64);
        let body = Frame::new("cpu")
            .with_field(value)
            .to_json()
            .unwrap()
            .bytes(Include::DataOnly);
        let vars = Vars::new(1, "stream/frames/cpu").unwrap();
        assert!(JsonFrameConverter.convert(&vars, &body).is_err());
    }
}
