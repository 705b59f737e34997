//! Frame and data outputters: the side-effecting tail of a rule.

pub mod derived;
pub mod loki;
pub mod remote_write;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use stream_frame::{Frame, FrameError, Include};
use thiserror::Error;
use tracing::debug;

use crate::broadcast::{PublishError, SharedPublisher};
use crate::condition::ConditionChecker;
use crate::pipeline::{ChannelData, ChannelFrame, RoutingError, Vars};
use crate::secret::SecretsError;
use crate::stream::{ManagedStreamRunner, StreamError};

pub use derived::{ChangeLogOutput, ThresholdOutput};
pub use loki::{LokiClient, LokiOutput};
pub use remote_write::{RemoteWriteOutput, RemoteWriteRegistry, RemoteWriteSink};

/// Failure talking to an external system.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("snappy compression failed: {0}")]
    Compress(#[from] snap::Error),
    #[error(transparent)]
    Secrets(#[from] SecretsError),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("field `{field}`: {reason}")]
    Unsupported { field: String, reason: String },
}

/// An outputter error together with the frames routed before it happened.
/// Those frames are still delivered.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OutputFailure {
    pub routed: Vec<ChannelFrame>,
    pub error: OutputError,
}

impl From<OutputError> for OutputFailure {
    fn from(error: OutputError) -> Self {
        Self {
            routed: Vec::new(),
            error,
        }
    }
}

#[derive(Debug)]
pub enum FrameOutputter {
    ManagedStream(ManagedStreamOutput),
    LocalSubscribers(LocalSubscribersOutput),
    Redirect(RedirectOutput),
    Conditional(ConditionalOutput),
    Threshold(ThresholdOutput),
    ChangeLog(ChangeLogOutput),
    RemoteWrite(RemoteWriteOutput),
    Loki(LokiOutput),
    Multiple(MultipleOutput),
}

impl FrameOutputter {
    pub fn type_name(&self) -> &'static str {
        match self {
            FrameOutputter::ManagedStream(_) => "managedStream",
            FrameOutputter::LocalSubscribers(_) => "localSubscribers",
            FrameOutputter::Redirect(_) => "redirect",
            FrameOutputter::Conditional(_) => "conditional",
            FrameOutputter::Threshold(_) => "threshold",
            FrameOutputter::ChangeLog(_) => "changeLog",
            FrameOutputter::RemoteWrite(_) => "remoteWrite",
            FrameOutputter::Loki(_) => "loki",
            FrameOutputter::Multiple(_) => "multiple",
        }
    }

    /// Literal channels this outputter can hand frames to.
    pub fn redirect_targets(&self) -> Vec<&str> {
        match self {
            FrameOutputter::Redirect(o) => vec![o.channel.as_str()],
            FrameOutputter::Threshold(o) => vec![o.channel()],
            FrameOutputter::ChangeLog(o) => vec![o.channel()],
            FrameOutputter::Conditional(o) => o.outputter.redirect_targets(),
            FrameOutputter::Multiple(o) => o
                .outputters
                .iter()
                .flat_map(FrameOutputter::redirect_targets)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Returned frames are routed by the pipeline; an empty channel means
    /// the current one.
    pub fn output<'a>(
        &'a self,
        vars: &'a Vars,
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<Vec<ChannelFrame>, OutputFailure>> {
        async move {
            let leaf = match self {
                FrameOutputter::Conditional(o) => return o.output(vars, frame).await,
                FrameOutputter::Multiple(o) => return o.output(vars, frame).await,
                FrameOutputter::ManagedStream(o) => o.output(vars, frame).await,
                FrameOutputter::LocalSubscribers(o) => o.output(vars, frame).await,
                FrameOutputter::Redirect(o) => o.output(vars, frame),
                FrameOutputter::Threshold(o) => o.output(vars, frame),
                FrameOutputter::ChangeLog(o) => o.output(vars, frame),
                FrameOutputter::RemoteWrite(o) => o.output(vars, frame).await,
                FrameOutputter::Loki(o) => o.output(vars, frame).await,
            };
            leaf.map_err(OutputFailure::from)
        }
        .boxed()
    }
}

#[derive(Debug)]
pub enum DataOutputter {
    Redirect(RedirectOutput),
    LocalSubscribers(LocalSubscribersOutput),
    Loki(LokiOutput),
}

impl DataOutputter {
    pub fn type_name(&self) -> &'static str {
        match self {
            DataOutputter::Redirect(_) => "redirect",
            DataOutputter::LocalSubscribers(_) => "localSubscribers",
            DataOutputter::Loki(_) => "loki",
        }
    }

    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            DataOutputter::Redirect(o) => Some(o.channel.as_str()),
            _ => None,
        }
    }

    pub async fn output(&self, vars: &Vars, data: &[u8]) -> Result<Vec<ChannelData>, OutputError> {
        match self {
            DataOutputter::Redirect(o) => o.output_data(vars, data),
            DataOutputter::LocalSubscribers(o) => o.output_data(vars, data).await,
            DataOutputter::Loki(o) => o.output_data(vars, data).await,
        }
    }
}

/// Pushes frames into the managed stream of the channel's namespace.
#[derive(Debug)]
pub struct ManagedStreamOutput {
    runner: Arc<ManagedStreamRunner>,
}

impl ManagedStreamOutput {
    pub fn new(runner: Arc<ManagedStreamRunner>) -> Self {
        Self { runner }
    }

    async fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        let stream = self
            .runner
            .get_or_create_stream(vars.org_id, &vars.scope, &vars.namespace);
        stream.push(&vars.path, frame).await?;
        Ok(Vec::new())
    }
}

/// Broadcasts to connections subscribed to the current channel.
#[derive(Debug)]
pub struct LocalSubscribersOutput {
    publisher: SharedPublisher,
}

impl LocalSubscribersOutput {
    pub fn new(publisher: SharedPublisher) -> Self {
        Self { publisher }
    }

    async fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        let payload = frame.to_json()?.bytes(Include::All);
        self.publisher
            .publish(vars.org_id, &vars.channel, payload)
            .await?;
        Ok(Vec::new())
    }

    async fn output_data(&self, vars: &Vars, data: &[u8]) -> Result<Vec<ChannelData>, OutputError> {
        self.publisher
            .publish(vars.org_id, &vars.channel, data.to_vec())
            .await?;
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct RedirectOutput {
    channel: String,
}

impl RedirectOutput {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        if self.channel == vars.channel {
            return Err(RoutingError::SameChannel.into());
        }
        debug!(from = %vars.channel, to = %self.channel, "redirecting frame");
        Ok(vec![ChannelFrame::to(self.channel.clone(), frame.clone())])
    }

    fn output_data(&self, vars: &Vars, data: &[u8]) -> Result<Vec<ChannelData>, OutputError> {
        if self.channel == vars.channel {
            return Err(RoutingError::SameChannel.into());
        }
        Ok(vec![ChannelData {
            channel: self.channel.clone(),
            data: data.to_vec(),
        }])
    }
}

#[derive(Debug)]
pub struct ConditionalOutput {
    condition: ConditionChecker,
    outputter: Box<FrameOutputter>,
}

impl ConditionalOutput {
    pub fn new(condition: ConditionChecker, outputter: FrameOutputter) -> Self {
        Self {
            condition,
            outputter: Box::new(outputter),
        }
    }

    async fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputFailure> {
        if !self.condition.check(vars, frame) {
            return Ok(Vec::new());
        }
        self.outputter.output(vars, frame).await
    }
}

/// Runs outputters in order; the first error stops the rest. Frames routed
/// before the error travel with it.
#[derive(Debug)]
pub struct MultipleOutput {
    outputters: Vec<FrameOutputter>,
}

impl MultipleOutput {
    pub fn new(outputters: Vec<FrameOutputter>) -> Self {
        Self { outputters }
    }

    async fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputFailure> {
        let mut out = Vec::new();
        for outputter in &self.outputters {
            match outputter.output(vars, frame).await {
                Ok(routed) => out.extend(routed),
                Err(mut failure) => {
                    out.append(&mut failure.routed);
                    failure.routed = out;
                    return Err(failure);
                }
            }
        }
        Ok(out)
    }
}
