use std::sync::Arc;

use dashmap::DashMap;
use stream_frame::{Frame, FrameError, FrameJson, SchemaFingerprint};

#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub json: FrameJson,
    pub fingerprint: SchemaFingerprint,
}

/// Last encoded frame per `(org, channel)`.
#[derive(Debug, Default)]
pub struct FrameCache {
    frames: DashMap<(i64, String), CachedFrame>,
}

impl FrameCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `json` and reports whether its schema differs from the one
    /// cached before (or nothing was cached).
    pub fn update(&self, org_id: i64, channel: &str, json: FrameJson) -> bool {
        let fingerprint = json.fingerprint();
        let entry = CachedFrame { json, fingerprint };
        match self.frames.insert((org_id, channel.to_string()), entry) {
            Some(previous) => previous.fingerprint != fingerprint,
            None => true,
        }
    }

    pub fn update_frame(&self, org_id: i64, channel: &str, frame: &Frame) -> Result<bool, FrameError> {
        Ok(self.update(org_id, channel, FrameJson::from_frame(frame)?))
    }

    pub fn get(&self, org_id: i64, channel: &str) -> Option<FrameJson> {
        self.frames
            .get(&(org_id, channel.to_string()))
            .map(|c| c.json.clone())
    }

    pub fn fingerprint(&self, org_id: i64, channel: &str) -> Option<SchemaFingerprint> {
        self.frames
            .get(&(org_id, channel.to_string()))
            .map(|c| c.fingerprint)
    }

    pub fn channels(&self, org_id: i64) -> Vec<String> {
        self.frames
            .iter()
            .filter(|e| e.key().0 == org_id)
            .map(|e| e.key().1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_frame::{Field, FieldType};

    fn frame(field_type: FieldType) -> Frame {
        let mut f = Field::new("value", field_type);
        match field_type {
            FieldType::Float64 => f.append(1.0).unwrap(),
            _ => f.append(1_i64).unwrap(),
        }
        Frame::new("f").with_field(f)
    }

    #[test]
    fn identical_schema_is_not_a_change() {
        let cache = FrameCache::new();
        assert!(cache.update_frame(1, "stream/a/b", &frame(FieldType::Float64)).unwrap());
        assert!(!cache.update_frame(1, "stream/a/b", &frame(FieldType::Float64)).unwrap());
        assert!(cache.update_frame(1, "stream/a/b", &frame(FieldType::Int64)).unwrap());
    }

    #[test]
    fn added_field_is_a_change() {
        let cache = FrameCache::new();
        cache.update_frame(1, "c", &frame(FieldType::Float64)).unwrap();
        let mut wider = frame(FieldType::Float64);
        let mut extra = Field::new("host", FieldType::String);
        extra.append("a").unwrap();
        wider.fields.push(extra);
        assert!(cache.update_frame(1, "c", &wider).unwrap());
    }

    #[test]
    fn orgs_do_not_share_entries() {
        let cache = FrameCache::new();
        cache.update_frame(1, "c", &frame(FieldType::Float64)).unwrap();
        assert!(cache.get(2, "c").is_none());
        assert!(cache.update_frame(2, "c", &frame(FieldType::Float64)).unwrap());
        assert_eq!(cache.channels(1), vec!["c".to_string()]);
    }
}
