//! The pipeline engine: resolves a channel to its rule and drives payloads
//! through converter, processors and outputters.

pub mod stage;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use stream_frame::Frame;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::auth::{Role, SignedUser};
use crate::cache::CacheError;
use crate::channel::ChannelError;
use crate::convert::ConvertError;
use crate::logger::Telemetry;
use crate::output::OutputError;
use crate::pattern::Params;
use crate::process::ProcessError;
use crate::subscribe::{SubscribeReply, SubscribeStatus};

pub use stage::{ChannelData, ChannelFrame, LiveChannelRule, Vars};

pub const DEFAULT_MAX_REDIRECT_DEPTH: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("redirect to the same channel")]
    SameChannel,
    #[error("redirect loop through `{channel}`")]
    Loop { channel: String },
    #[error("redirect chain exceeds {depth} hops")]
    TooDeep { depth: usize },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

/// Resolves a concrete channel of an org to its live rule.
#[async_trait]
pub trait RuleGetter: Send + Sync + Debug {
    async fn get(
        &self,
        org_id: i64,
        channel: &str,
    ) -> Result<Option<(Arc<LiveChannelRule>, Params)>, CacheError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// No rule matched; the transport falls back to its own handler.
    NoRule,
    Replied {
        reply: SubscribeReply,
        status: SubscribeStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    NoRule,
    PermissionDenied,
    Published,
}

/// Runs the converter of `rule` only, for dry runs. Frames without a
/// channel override are labelled with `channel`.
pub fn data_to_channel_frames(
    rule: &LiveChannelRule,
    org_id: i64,
    channel: &str,
    data: &[u8],
) -> Result<Vec<ChannelFrame>, PipelineError> {
    let Some(converter) = &rule.converter else {
        return Ok(Vec::new());
    };
    let vars = Vars::new(org_id, channel)?;
    let frames = converter.convert(&vars, data)?;
    Ok(frames
        .into_iter()
        .map(|cf| {
            if cf.channel.is_empty() {
                ChannelFrame::to(channel, cf.frame)
            } else {
                cf
            }
        })
        .collect())
}

/// Stateless apart from what its stages hold; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Pipeline {
    rules: Arc<dyn RuleGetter>,
    telemetry: Telemetry,
    max_redirect_depth: usize,
}

impl Pipeline {
    pub fn new(rules: Arc<dyn RuleGetter>, telemetry: Telemetry, max_redirect_depth: usize) -> Self {
        Self {
            rules,
            telemetry,
            max_redirect_depth,
        }
    }

    pub async fn get(
        &self,
        org_id: i64,
        channel: &str,
    ) -> Result<Option<(Arc<LiveChannelRule>, Params)>, PipelineError> {
        Ok(self.rules.get(org_id, channel).await?)
    }

    /// Returns `false` when no rule matches the channel.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn process_input(&self, org_id: i64, channel: &str, data: &[u8]) -> Result<bool, PipelineError> {
        let started = Instant::now();
        let result = self.input_at(org_id, channel, data, &[]).await;
        self.telemetry.finish("input", started, &result);
        result
    }

    /// A missing rule for `channel` is a normal terminal condition.
    #[instrument(skip(self, frame), fields(frame = %frame.name))]
    pub async fn process_frame(&self, org_id: i64, channel: &str, frame: Frame) -> Result<(), PipelineError> {
        let started = Instant::now();
        let result = self.frame_at(org_id, channel, frame, &[]).await;
        self.telemetry.finish("frame", started, &result);
        result
    }

    #[instrument(skip(self, user, data), fields(user_id = user.id))]
    pub async fn subscribe(
        &self,
        org_id: i64,
        channel: &str,
        user: &SignedUser,
        data: &[u8],
    ) -> Result<SubscribeOutcome, PipelineError> {
        let Some((rule, _)) = self.rules.get(org_id, channel).await? else {
            return Ok(SubscribeOutcome::NoRule);
        };
        if user.org_id != org_id {
            return Ok(denied());
        }
        if let Some(auth) = &rule.subscribe_auth {
            if !auth.can_subscribe(user).await {
                debug!("subscribe rejected by rule auth");
                return Ok(denied());
            }
        }

        let vars = Vars::new(org_id, channel)?;
        let mut reply = SubscribeReply::default();
        let mut status = SubscribeStatus::Ok;
        for subscriber in &rule.subscribers {
            (reply, status) = subscriber.subscribe(&vars, user, data).await;
            if status != SubscribeStatus::Ok {
                debug!(subscriber = subscriber.type_name(), ?status, "subscriber declined");
                break;
            }
        }
        Ok(SubscribeOutcome::Replied { reply, status })
    }

    /// Without a publish check on the rule only admins may publish.
    #[instrument(skip(self, user, data), fields(user_id = user.id, bytes = data.len()))]
    pub async fn publish(
        &self,
        org_id: i64,
        channel: &str,
        user: &SignedUser,
        data: &[u8],
    ) -> Result<PublishOutcome, PipelineError> {
        let Some((rule, _)) = self.rules.get(org_id, channel).await? else {
            return Ok(PublishOutcome::NoRule);
        };
        if user.org_id != org_id {
            return Ok(PublishOutcome::PermissionDenied);
        }
        let allowed = match &rule.publish_auth {
            Some(auth) => auth.can_publish(user).await,
            None => user.has_role(Role::Admin),
        };
        if !allowed {
            return Ok(PublishOutcome::PermissionDenied);
        }
        if !self.process_input(org_id, channel, data).await? {
            return Ok(PublishOutcome::NoRule);
        }
        Ok(PublishOutcome::Published)
    }

    /// Appends `channel` to the redirect trail, refusing re-entry and
    /// chains longer than the configured depth.
    fn enter(&self, trail: &[String], channel: &str) -> Result<Vec<String>, RoutingError> {
        if trail.last().is_some_and(|c| c == channel) {
            return Err(RoutingError::SameChannel);
        }
        if trail.iter().any(|c| c == channel) {
            return Err(RoutingError::Loop {
                channel: channel.to_string(),
            });
        }
        if trail.len() >= self.max_redirect_depth {
            return Err(RoutingError::TooDeep {
                depth: self.max_redirect_depth,
            });
        }
        let mut next = trail.to_vec();
        next.push(channel.to_string());
        Ok(next)
    }

    fn input_at<'a>(
        &'a self,
        org_id: i64,
        channel: &'a str,
        data: &'a [u8],
        trail: &'a [String],
    ) -> BoxFuture<'a, Result<bool, PipelineError>> {
        async move {
            let Some((rule, _)) = self.rules.get(org_id, channel).await? else {
                debug!(org_id, %channel, "no rule for input");
                return Ok(false);
            };
            let here = self.enter(trail, channel)?;
            let vars = Vars::new(org_id, channel)?;
            self.telemetry.input(org_id);

            for outputter in &rule.data_outputters {
                let routed = outputter.output(&vars, data).await?;
                for out in routed {
                    let target = if out.channel.is_empty() { channel } else { out.channel.as_str() };
                    debug!(org_id, from = %channel, to = %target, stage = outputter.type_name(), "routing data");
                    self.telemetry.redirect(org_id);
                    if !self.input_at(org_id, target, &out.data, &here).await? {
                        debug!(org_id, channel = %target, "redirected data has no rule");
                    }
                }
            }

            let Some(converter) = &rule.converter else {
                return Ok(true);
            };
            let frames = converter.convert(&vars, data)?;
            debug!(org_id, %channel, converter = converter.type_name(), frames = frames.len(), "converted input");
            for cf in frames {
                let target = if cf.channel.is_empty() { channel } else { cf.channel.as_str() };
                self.frame_at(org_id, target, cf.frame, trail).await?;
            }
            Ok(true)
        }
        .boxed()
    }

    fn frame_at<'a>(
        &'a self,
        org_id: i64,
        channel: &'a str,
        frame: Frame,
        trail: &'a [String],
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        async move {
            let here = self.enter(trail, channel)?;
            let Some((rule, _)) = self.rules.get(org_id, channel).await? else {
                debug!(org_id, %channel, "no rule for frame");
                return Ok(());
            };
            let vars = Vars::new(org_id, channel)?;
            self.telemetry.frame(org_id);

            let mut frame = frame;
            for processor in &rule.frame_processors {
                match processor.process(&vars, frame)? {
                    Some(next) => frame = next,
                    None => {
                        debug!(org_id, %channel, stage = processor.type_name(), "frame dropped");
                        return Ok(());
                    }
                }
            }

            for outputter in &rule.frame_outputters {
                let (routed, failed) = match outputter.output(&vars, &frame).await {
                    Ok(routed) => (routed, None),
                    Err(failure) => {
                        warn!(
                            org_id,
                            %channel,
                            stage = outputter.type_name(),
                            error = %failure.error,
                            routed = failure.routed.len(),
                            "outputter failed"
                        );
                        (failure.routed, Some(failure.error))
                    }
                };
                for out in routed {
                    let target = if out.channel.is_empty() { channel } else { out.channel.as_str() };
                    self.telemetry.redirect(org_id);
                    self.frame_at(org_id, target, out.frame, &here).await?;
                }
                if let Some(error) = failed {
                    return Err(error.into());
                }
            }
            Ok(())
        }
        .boxed()
    }
}

fn denied() -> SubscribeOutcome {
    SubscribeOutcome::Replied {
        reply: SubscribeReply::default(),
        status: SubscribeStatus::PermissionDenied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RoleAuthorizer;
    use crate::broadcast::BroadcastHub;
    use crate::convert::{AutoJsonConverter, Converter};
    use crate::output::{FrameOutputter, LocalSubscribersOutput, RedirectOutput};
    use crate::pattern::PatternTree;
    use crate::rule::AutoJsonConverterConfig;
    use crate::subscribe::{BuiltinSubscriber, Subscriber};
    use stream_frame::{Field, FieldType};

    #[derive(Debug, Default)]
    struct StaticRules {
        tree: PatternTree<Arc<LiveChannelRule>>,
    }

    impl StaticRules {
        fn with(rules: Vec<LiveChannelRule>) -> Arc<Self> {
            let mut tree = PatternTree::new();
            for rule in rules {
                let pattern = rule.pattern.clone();
                tree.insert(&pattern, Arc::new(rule)).unwrap();
            }
            Arc::new(Self { tree })
        }
    }

    #[async_trait]
    impl RuleGetter for StaticRules {
        async fn get(
            &self,
            _org_id: i64,
            channel: &str,
        ) -> Result<Option<(Arc<LiveChannelRule>, Params)>, CacheError> {
            Ok(self
                .tree
                .get(channel)
                .map(|(rule, _, params)| (rule.clone(), params)))
        }
    }

    fn pipeline(rules: Vec<LiveChannelRule>, depth: usize) -> Pipeline {
        Pipeline::new(StaticRules::with(rules), Telemetry::noop(), depth)
    }

    fn redirect(pattern: &str, to: &str) -> LiveChannelRule {
        let mut rule = LiveChannelRule::new(1, pattern);
        rule.frame_outputters
            .push(FrameOutputter::Redirect(RedirectOutput::new(to)));
        rule
    }

    fn frame() -> Frame {
        let mut value = Field::new("value", FieldType::Float64);
        value.append(1.0).unwrap();
        Frame::new("test").with_field(value)
    }

    #[tokio::test]
    async fn missing_rule_is_not_an_error() {
        let p = pipeline(Vec::new(), DEFAULT_MAX_REDIRECT_DEPTH);
        assert!(!p.process_input(1, "stream/none/x", b"{}").await.unwrap());
        p.process_frame(1, "stream/none/x", frame()).await.unwrap();
    }

    #[tokio::test]
    async fn rule_without_converter_accepts_input() {
        let p = pipeline(vec![LiveChannelRule::new(1, "stream/sub/only")], 16);
        assert!(p.process_input(1, "stream/sub/only", b"not json").await.unwrap());
    }

    #[tokio::test]
    async fn two_hop_cycle_is_detected() {
        let p = pipeline(vec![redirect("stream/a/x", "stream/b/x"), redirect("stream/b/x", "stream/a/x")], 16);
        let err = p.process_frame(1, "stream/a/x", frame()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Routing(RoutingError::Loop { ref channel }) if channel == "stream/a/x"
        ));
    }

    #[tokio::test]
    async fn redirect_depth_is_capped() {
        let rules = (0..5)
            .map(|i| redirect(&format!("stream/hop/{i}"), &format!("stream/hop/{}", i + 1)))
            .collect();
        let p = pipeline(rules, 3);
        let err = p.process_frame(1, "stream/hop/0", frame()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Routing(RoutingError::TooDeep { depth: 3 })));
    }

    #[tokio::test]
    async fn redirected_frame_reaches_target_subscribers() {
        let hub = BroadcastHub::new();
        let mut target = LiveChannelRule::new(1, "stream/b/x");
        target
            .frame_outputters
            .push(FrameOutputter::LocalSubscribers(LocalSubscribersOutput::new(hub.clone())));
        let p = pipeline(vec![redirect("stream/a/x", "stream/b/x"), target], 16);

        let mut rx = hub.subscribe(1, "stream/b/x");
        p.process_frame(1, "stream/a/x", frame()).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(payload["schema"]["name"], "test");
    }

    #[tokio::test]
    async fn dry_run_labels_frames_with_the_channel() {
        let mut rule = LiveChannelRule::new(1, "stream/json/auto");
        rule.converter = Some(Converter::AutoJson(AutoJsonConverter::new(
            AutoJsonConverterConfig::default(),
        )));
        let frames = data_to_channel_frames(&rule, 1, "stream/json/auto", br#"{"a": 1}"#).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, "stream/json/auto");
        assert!(frames[0].frame.field_by_name("a").is_some());
    }

    #[tokio::test]
    async fn publish_requires_admin_without_rule_auth() {
        let p = pipeline(vec![LiveChannelRule::new(1, "stream/pub/x")], 16);
        let editor = SignedUser::new(1, 1, Role::Editor);
        let admin = SignedUser::new(2, 1, Role::Admin);
        assert_eq!(
            p.publish(1, "stream/pub/x", &editor, b"").await.unwrap(),
            PublishOutcome::PermissionDenied
        );
        assert_eq!(
            p.publish(1, "stream/pub/x", &admin, b"").await.unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(
            p.publish(1, "stream/pub/other", &admin, b"").await.unwrap(),
            PublishOutcome::NoRule
        );
    }

    #[tokio::test]
    async fn subscribe_checks_org_and_rule_auth() {
        let mut rule = LiveChannelRule::new(1, "stream/sub/x");
        rule.subscribe_auth = Some(Arc::new(RoleAuthorizer::new(Role::Editor)));
        rule.subscribers.push(Subscriber::Builtin(BuiltinSubscriber));
        let p = pipeline(vec![rule], 16);

        let foreign = SignedUser::new(1, 2, Role::Admin);
        let viewer = SignedUser::new(2, 1, Role::Viewer);
        let editor = SignedUser::new(3, 1, Role::Editor);
        for user in [&foreign, &viewer] {
            let outcome = p.subscribe(1, "stream/sub/x", user, b"").await.unwrap();
            assert!(matches!(
                outcome,
                SubscribeOutcome::Replied { status: SubscribeStatus::PermissionDenied, .. }
            ));
        }
        match p.subscribe(1, "stream/sub/x", &editor, b"").await.unwrap() {
            SubscribeOutcome::Replied { reply, status } => {
                assert_eq!(status, SubscribeStatus::Ok);
                assert!(reply.presence);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
