//! Managed streams: per-namespace publishers that only ship a frame's schema
//! to subscribers when it changes.

pub mod frame_cache;

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use stream_frame::{Frame, FrameError, FrameJson, Include};
use thiserror::Error;
use tracing::debug;

use crate::broadcast::{PublishError, SharedPublisher};
use crate::channel::Channel;

pub use frame_cache::{CachedFrame, FrameCache};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedChannel {
    pub channel: String,
    pub minute_rate: u64,
    pub data: Value,
}

#[derive(Debug)]
pub struct ManagedStreamRunner {
    streams: DashMap<(i64, String, String), Arc<NamespaceStream>>,
    frame_cache: Arc<FrameCache>,
    publisher: SharedPublisher,
}

impl ManagedStreamRunner {
    pub fn new(frame_cache: Arc<FrameCache>, publisher: SharedPublisher) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            frame_cache,
            publisher,
        })
    }

    /// Streams live for the lifetime of the runner.
    pub fn get_or_create_stream(&self, org_id: i64, scope: &str, namespace: &str) -> Arc<NamespaceStream> {
        self.streams
            .entry((org_id, scope.to_string(), namespace.to_string()))
            .or_insert_with(|| {
                debug!(org_id, scope, namespace, "creating managed stream");
                Arc::new(NamespaceStream {
                    org_id,
                    scope: scope.to_string(),
                    namespace: namespace.to_string(),
                    frame_cache: self.frame_cache.clone(),
                    publisher: self.publisher.clone(),
                    rates: DashMap::new(),
                })
            })
            .clone()
    }

    pub fn list_channels(&self, org_id: i64) -> Vec<ManagedChannel> {
        let mut out: Vec<ManagedChannel> = self
            .streams
            .iter()
            .filter(|e| e.key().0 == org_id)
            .flat_map(|e| e.value().list_channels())
            .collect();
        out.sort_by(|a, b| a.channel.cmp(&b.channel));
        out
    }

    pub fn frame_cache(&self) -> &Arc<FrameCache> {
        &self.frame_cache
    }
}

const RATE_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
struct RateSlot {
    second: i64,
    count: u64,
}

#[derive(Debug)]
pub struct NamespaceStream {
    org_id: i64,
    scope: String,
    namespace: String,
    frame_cache: Arc<FrameCache>,
    publisher: SharedPublisher,
    rates: DashMap<String, [RateSlot; RATE_WINDOW]>,
}

impl NamespaceStream {
    pub fn channel(&self, path: &str) -> String {
        Channel::new(&self.scope, &self.namespace, path).to_string()
    }

    /// Caches and publishes `frame`. Subscribers get schema and data when
    /// the schema changed, data only otherwise. Returns whether the schema
    /// changed.
    pub async fn push(&self, path: &str, frame: &Frame) -> Result<bool, StreamError> {
        let channel = self.channel(path);
        let json = FrameJson::from_frame(frame)?;
        let schema_changed = self.frame_cache.update(self.org_id, &channel, json.clone());
        self.inc_rate(path, Utc::now().timestamp());

        let include = if schema_changed {
            Include::All
        } else {
            Include::DataOnly
        };
        let payload = json.bytes(include);
        debug!(org_id = self.org_id, %channel, schema_changed, "managed stream push");
        self.publisher.publish(self.org_id, &channel, payload).await?;
        Ok(schema_changed)
    }

    /// Initial data for a new subscriber: the last full frame, if any.
    pub fn on_subscribe(&self, path: &str) -> Option<Vec<u8>> {
        self.frame_cache
            .get(self.org_id, &self.channel(path))
            .map(|json| json.bytes(Include::All))
    }

    fn inc_rate(&self, path: &str, now: i64) {
        let mut slots = self
            .rates
            .entry(path.to_string())
            .or_insert_with(|| [RateSlot::default(); RATE_WINDOW]);
        let slot = &mut slots[now.rem_euclid(RATE_WINDOW as i64) as usize];
        if slot.second != now {
            *slot = RateSlot {
                second: now,
                count: 0,
            };
        }
        slot.count += 1;
    }

    pub fn minute_rate(&self, path: &str) -> u64 {
        self.minute_rate_at(path, Utc::now().timestamp())
    }

    fn minute_rate_at(&self, path: &str, now: i64) -> u64 {
        self.rates
            .get(path)
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| s.count > 0 && now - s.second < RATE_WINDOW as i64)
                    .map(|s| s.count)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn list_channels(&self) -> Vec<ManagedChannel> {
        let paths: Vec<String> = self.rates.iter().map(|e| e.key().clone()).collect();
        paths
            .into_iter()
            .map(|path| {
                let channel = self.channel(&path);
                let data = self
                    .frame_cache
                    .get(self.org_id, &channel)
                    .and_then(|json| serde_json::from_slice(&json.bytes(Include::SchemaOnly)).ok())
                    .unwrap_or(Value::Null);
                ManagedChannel {
                    minute_rate: self.minute_rate(&path),
                    channel,
                    data,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use stream_frame::{Field, FieldType};

    fn frame(v: f64) -> Frame {
        let mut value = Field::new("value", FieldType::Float64);
        value.append(v).unwrap();
        Frame::new("cpu").with_field(value)
    }

    #[tokio::test]
    async fn sends_schema_only_when_it_changes() {
        let hub = BroadcastHub::new();
        let runner = ManagedStreamRunner::new(FrameCache::new(), hub.clone());
        let mut rx = hub.subscribe(1, "stream/telegraf/cpu");

        let stream = runner.get_or_create_stream(1, "stream", "telegraf");
        assert!(stream.push("cpu", &frame(1.0)).await.unwrap());
        assert!(!stream.push("cpu", &frame(2.0)).await.unwrap());

        let first: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert!(first.get("schema").is_some());
        let second: Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert!(second.get("schema").is_none());
        assert_eq!(second["data"]["values"][0][0], 2.0);
    }

    #[tokio::test]
    async fn late_subscriber_gets_last_frame() {
        let runner = ManagedStreamRunner::new(FrameCache::new(), BroadcastHub::new());
        let stream = runner.get_or_create_stream(1, "stream", "json");
        assert!(stream.on_subscribe("auto").is_none());
        stream.push("auto", &frame(3.5)).await.unwrap();

        let initial: Value = serde_json::from_slice(&stream.on_subscribe("auto").unwrap()).unwrap();
        assert_eq!(initial["schema"]["name"], "cpu");
        assert_eq!(initial["data"]["values"][0][0], 3.5);
    }

    #[tokio::test]
    async fn lists_channels_with_rates() {
        let runner = ManagedStreamRunner::new(FrameCache::new(), BroadcastHub::new());
        let stream = runner.get_or_create_stream(1, "stream", "telegraf");
        stream.push("cpu", &frame(1.0)).await.unwrap();
        stream.push("cpu", &frame(2.0)).await.unwrap();
        runner
            .get_or_create_stream(2, "stream", "telegraf")
            .push("mem", &frame(1.0))
            .await
            .unwrap();

        let channels = runner.list_channels(1);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel, "stream/telegraf/cpu");
        assert_eq!(channels[0].minute_rate, 2);
        assert_eq!(channels[0].data["schema"]["fields"][0]["name"], "value");
    }

    #[test]
    fn stale_rate_slots_are_ignored() {
        let runner = ManagedStreamRunner::new(FrameCache::new(), BroadcastHub::new());
        let stream = runner.get_or_create_stream(1, "stream", "x");
        stream.inc_rate("p", 1_000);
        stream.inc_rate("p", 1_000);
        stream.inc_rate("p", 1_030);
        assert_eq!(stream.minute_rate_at("p", 1_030), 3);
        assert_eq!(stream.minute_rate_at("p", 1_070), 1);
        assert_eq!(stream.minute_rate_at("p", 1_100), 0);
    }
}
