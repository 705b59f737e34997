use std::sync::Arc;

use stream_frame::Frame;

use crate::auth::{PublishAuthorizer, SubscribeAuthorizer};
use crate::channel::{Channel, ChannelError};
use crate::convert::Converter;
use crate::output::{DataOutputter, FrameOutputter};
use crate::process::FrameProcessor;
use crate::subscribe::Subscriber;

/// Per-invocation context handed to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vars {
    pub org_id: i64,
    pub channel: String,
    pub scope: String,
    pub namespace: String,
    pub path: String,
}

impl Vars {
    pub fn new(org_id: i64, channel: &str) -> Result<Self, ChannelError> {
        let parsed = Channel::parse(channel)?;
        Ok(Self {
            org_id,
            channel: channel.to_string(),
            scope: parsed.scope,
            namespace: parsed.namespace,
            path: parsed.path,
        })
    }
}

/// A frame plus the channel it should be processed under. An empty channel
/// means the channel currently being processed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    pub channel: String,
    pub frame: Frame,
}

impl ChannelFrame {
    pub fn here(frame: Frame) -> Self {
        Self {
            channel: String::new(),
            frame,
        }
    }

    pub fn to(channel: impl Into<String>, frame: Frame) -> Self {
        Self {
            channel: channel.into(),
            frame,
        }
    }
}

/// Raw payload counterpart of [`ChannelFrame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: String,
    pub data: Vec<u8>,
}

/// A rule with its stages built and ready to run.
#[derive(Debug, Default)]
pub struct LiveChannelRule {
    pub org_id: i64,
    pub pattern: String,
    pub converter: Option<Converter>,
    pub subscribers: Vec<Subscriber>,
    pub frame_processors: Vec<FrameProcessor>,
    pub frame_outputters: Vec<FrameOutputter>,
    pub data_outputters: Vec<DataOutputter>,
    pub subscribe_auth: Option<Arc<dyn SubscribeAuthorizer>>,
    pub publish_auth: Option<Arc<dyn PublishAuthorizer>>,
}

impl LiveChannelRule {
    pub fn new(org_id: i64, pattern: impl Into<String>) -> Self {
        Self {
            org_id,
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    /// Channels this rule can forward to through literal redirects.
    pub fn redirect_targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .frame_outputters
            .iter()
            .flat_map(FrameOutputter::redirect_targets)
            .collect();
        out.extend(
            self.data_outputters
                .iter()
                .filter_map(DataOutputter::redirect_target),
        );
        out
    }
}
