//! Turns stored rule configs into live rules with runtime stages.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use petgraph::prelude::StableDiGraph;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::auth::RoleAuthorizer;
use crate::broadcast::SharedPublisher;
use crate::condition::ConditionChecker;
use crate::convert::Converter;
use crate::output::{
    ChangeLogOutput, ConditionalOutput, DataOutputter, FrameOutputter, LocalSubscribersOutput, LokiClient,
    LokiOutput, ManagedStreamOutput, MultipleOutput, RedirectOutput, RemoteWriteOutput, RemoteWriteRegistry,
    ThresholdOutput, remote_write::RemoteWriteTarget,
};
use crate::pattern::PatternTree;
use crate::pipeline::LiveChannelRule;
use crate::process::FrameProcessor;
use crate::rule::{
    BASIC_AUTH_PASSWORD, ChannelRule, ConfigError, DataOutputterConfig, FrameOutputterConfig, WriteConfig,
};
use crate::secret::SharedSecrets;
use crate::storage::{Storage, StorageError};
use crate::stream::{FrameCache, ManagedStreamRunner};
use crate::subscribe::Subscriber;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[async_trait]
pub trait RuleBuilder: Send + Sync + Debug {
    async fn build_rules(&self, org_id: i64) -> Result<Vec<LiveChannelRule>, BuildError>;
}

/// Endpoint and credentials of a write config, secrets decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedWrite {
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
}

struct BuildCtx<'a> {
    org_id: i64,
    pattern: &'a str,
    write_configs: &'a [WriteConfig],
}

#[derive(Debug)]
pub struct StorageRuleBuilder {
    storage: Arc<dyn Storage>,
    runner: Arc<ManagedStreamRunner>,
    /// Previous frames for threshold and change-log outputters, kept apart
    /// from the managed-stream cache so derived state never reaches
    /// subscribers.
    last_frames: Arc<FrameCache>,
    publisher: SharedPublisher,
    secrets: SharedSecrets,
    remote_write: Arc<RemoteWriteRegistry>,
    client: Client,
    http_timeout: Duration,
}

impl StorageRuleBuilder {
    pub fn new(
        storage: Arc<dyn Storage>,
        runner: Arc<ManagedStreamRunner>,
        publisher: SharedPublisher,
        secrets: SharedSecrets,
        remote_write: Arc<RemoteWriteRegistry>,
        client: Client,
        http_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            runner,
            last_frames: FrameCache::new(),
            publisher,
            secrets,
            remote_write,
            client,
            http_timeout,
        }
    }

    async fn resolve_write(&self, ctx: &BuildCtx<'_>, uid: &str) -> Result<ResolvedWrite, ConfigError> {
        let config = ctx
            .write_configs
            .iter()
            .find(|w| w.uid == uid)
            .ok_or_else(|| ConfigError::WriteConfigNotFound(uid.to_string()))?;
        let invalid = |reason: String| ConfigError::InvalidWriteConfig {
            uid: uid.to_string(),
            reason,
        };

        let endpoint = Url::parse(&config.settings.endpoint).map_err(|e| invalid(e.to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme `{}`", endpoint.scheme())));
        }

        let (user, password) = match &config.settings.basic_auth {
            Some(auth) => {
                let password = match config.secure_settings.get(BASIC_AUTH_PASSWORD) {
                    Some(cipher) => Some(
                        self.secrets
                            .decrypt(cipher)
                            .await
                            .map_err(|e| invalid(e.to_string()))?,
                    ),
                    None => None,
                };
                (Some(auth.user.clone()), password)
            }
            None => (None, None),
        };
        Ok(ResolvedWrite {
            endpoint: config.settings.endpoint.clone(),
            user,
            password,
        })
    }

    async fn loki_client(&self, ctx: &BuildCtx<'_>, uid: &str) -> Result<LokiClient, ConfigError> {
        let write = self.resolve_write(ctx, uid).await?;
        Ok(LokiClient::new(
            write.endpoint,
            write.user,
            write.password,
            self.http_timeout,
            self.client.clone(),
        ))
    }

    fn frame_outputter<'a>(
        &'a self,
        ctx: &'a BuildCtx<'a>,
        config: &'a FrameOutputterConfig,
    ) -> BoxFuture<'a, Result<FrameOutputter, ConfigError>> {
        async move {
            Ok(match config {
                FrameOutputterConfig::ManagedStream => {
                    FrameOutputter::ManagedStream(ManagedStreamOutput::new(self.runner.clone()))
                }
                FrameOutputterConfig::LocalSubscribers => {
                    FrameOutputter::LocalSubscribers(LocalSubscribersOutput::new(self.publisher.clone()))
                }
                FrameOutputterConfig::Redirect(c) => FrameOutputter::Redirect(RedirectOutput::new(&c.channel)),
                FrameOutputterConfig::Conditional(c) => {
                    let inner = self.frame_outputter(ctx, &c.outputter).await?;
                    FrameOutputter::Conditional(ConditionalOutput::new(
                        ConditionChecker::from_config(&c.condition),
                        inner,
                    ))
                }
                FrameOutputterConfig::Threshold(c) => FrameOutputter::Threshold(ThresholdOutput::new(
                    &c.field_name,
                    &c.channel,
                    self.last_frames.clone(),
                )),
                FrameOutputterConfig::ChangeLog(c) => FrameOutputter::ChangeLog(ChangeLogOutput::new(
                    &c.field_name,
                    &c.channel,
                    self.last_frames.clone(),
                )),
                FrameOutputterConfig::RemoteWrite(c) => {
                    let write = self.resolve_write(ctx, &c.uid).await?;
                    let sink = self.remote_write.get_or_create(
                        ctx.org_id,
                        &c.uid,
                        RemoteWriteTarget {
                            endpoint: write.endpoint,
                            user: write.user,
                            password: write.password,
                        },
                        c.sample_milliseconds,
                    );
                    FrameOutputter::RemoteWrite(RemoteWriteOutput::new(sink))
                }
                FrameOutputterConfig::Loki(c) => {
                    FrameOutputter::Loki(LokiOutput::new(self.loki_client(ctx, &c.uid).await?))
                }
                FrameOutputterConfig::Multiple(c) => {
                    let mut outputters = Vec::with_capacity(c.outputters.len());
                    for inner in &c.outputters {
                        outputters.push(self.frame_outputter(ctx, inner).await?);
                    }
                    FrameOutputter::Multiple(MultipleOutput::new(outputters))
                }
            })
        }
        .boxed()
    }

    async fn data_outputter(
        &self,
        ctx: &BuildCtx<'_>,
        config: &DataOutputterConfig,
    ) -> Result<DataOutputter, ConfigError> {
        Ok(match config {
            DataOutputterConfig::Redirect(c) => DataOutputter::Redirect(RedirectOutput::new(&c.channel)),
            DataOutputterConfig::LocalSubscribers => {
                DataOutputter::LocalSubscribers(LocalSubscribersOutput::new(self.publisher.clone()))
            }
            DataOutputterConfig::Loki(c) => DataOutputter::Loki(LokiOutput::new(self.loki_client(ctx, &c.uid).await?)),
        })
    }

    /// Builds one rule for `org_id`, which replaces a stored org 0.
    pub async fn build_rule(
        &self,
        org_id: i64,
        rule: &ChannelRule,
        write_configs: &[WriteConfig],
    ) -> Result<LiveChannelRule, ConfigError> {
        let ctx = BuildCtx {
            org_id,
            pattern: &rule.pattern,
            write_configs,
        };
        let settings = &rule.settings;
        let mut live = LiveChannelRule::new(org_id, rule.pattern.clone());

        if let Some(converter) = &settings.converter {
            live.converter = Some(Converter::from_config(converter).map_err(|e| ConfigError::InvalidRule {
                pattern: ctx.pattern.to_string(),
                reason: e.to_string(),
            })?);
        }
        live.subscribers = settings
            .subscribers
            .iter()
            .map(|s| Subscriber::from_config(s, &self.runner))
            .collect();
        live.frame_processors = settings
            .frame_processors
            .iter()
            .map(FrameProcessor::from_config)
            .collect();
        for config in &settings.frame_outputters {
            live.frame_outputters.push(self.frame_outputter(&ctx, config).await?);
        }
        for config in &settings.data_outputters {
            live.data_outputters.push(self.data_outputter(&ctx, config).await?);
        }
        if let Some(auth) = &settings.auth {
            if let Some(check) = &auth.subscribe {
                live.subscribe_auth = Some(Arc::new(RoleAuthorizer::new(check.require_role)));
            }
            if let Some(check) = &auth.publish {
                live.publish_auth = Some(Arc::new(RoleAuthorizer::new(check.require_role)));
            }
        }
        Ok(live)
    }
}

#[async_trait]
impl RuleBuilder for StorageRuleBuilder {
    #[instrument(skip(self))]
    async fn build_rules(&self, org_id: i64) -> Result<Vec<LiveChannelRule>, BuildError> {
        let rules = self.storage.list_channel_rules(org_id).await?;
        let write_configs = self.storage.list_write_configs(org_id).await?;

        let mut live = Vec::with_capacity(rules.len());
        for rule in &rules {
            let built = self
                .build_rule(org_id, rule, &write_configs)
                .await
                .inspect_err(|e| warn!(org_id, pattern = %rule.pattern, error = %e, "rule rejected"))?;
            live.push(built);
        }
        if has_redirect_cycle(&live) {
            warn!(org_id, "channel rules redirect in a cycle; frames on it will be rejected at runtime");
        }

        let mut used = HashSet::new();
        for rule in &rules {
            for config in &rule.settings.frame_outputters {
                collect_remote_writes(config, &mut used);
            }
        }
        let evicted = self.remote_write.retain_org(org_id, &used);
        if evicted > 0 {
            debug!(org_id, evicted, "dropped unused remote write sinks");
        }
        debug!(org_id, rules = live.len(), "built channel rules");
        Ok(live)
    }
}

/// `(uid, sampleMilliseconds)` of every remote-write outputter, nested ones
/// included.
fn collect_remote_writes(config: &FrameOutputterConfig, used: &mut HashSet<(String, i64)>) {
    match config {
        FrameOutputterConfig::RemoteWrite(c) => {
            used.insert((c.uid.clone(), c.sample_milliseconds));
        }
        FrameOutputterConfig::Conditional(c) => collect_remote_writes(&c.outputter, used),
        FrameOutputterConfig::Multiple(c) => {
            for inner in &c.outputters {
                collect_remote_writes(inner, used);
            }
        }
        _ => {}
    }
}

/// True when literal redirect targets lead from a rule back to itself.
pub fn has_redirect_cycle(rules: &[LiveChannelRule]) -> bool {
    let mut tree = PatternTree::new();
    for (idx, rule) in rules.iter().enumerate() {
        if tree.insert(&rule.pattern, idx).is_err() {
            debug!(pattern = %rule.pattern, "skipping conflicting pattern in redirect graph");
        }
    }

    let mut graph = StableDiGraph::<&str, ()>::new();
    let index_of: HashMap<usize, _> = rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| (idx, graph.add_node(rule.pattern.as_str())))
        .collect();

    for (from, rule) in rules.iter().enumerate() {
        for target in rule.redirect_targets() {
            if let Some((to, _, _)) = tree.get(target) {
                graph.add_edge(index_of[&from], index_of[to], ());
            }
        }
    }
    petgraph::algo::is_cyclic_directed(&graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::rule::{BasicAuth, WriteSettings};
    use crate::secret::{EnvSecrets, PlainSecrets};
    use crate::storage::{FileStorage, InMemoryStorage};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    fn rule(value: serde_json::Value) -> ChannelRule {
        ChannelRule::from_value(value).unwrap()
    }

    fn write_config(uid: &str, endpoint: &str, password: Option<&str>) -> WriteConfig {
        let mut secure_settings = BTreeMap::new();
        if let Some(p) = password {
            secure_settings.insert(BASIC_AUTH_PASSWORD.to_string(), p.to_string());
        }
        WriteConfig {
            org_id: 1,
            uid: uid.to_string(),
            settings: WriteSettings {
                endpoint: endpoint.to_string(),
                basic_auth: password.map(|_| BasicAuth {
                    user: "writer".to_string(),
                }),
            },
            secure_settings,
        }
    }

    fn builder(rules: Vec<ChannelRule>, write_configs: Vec<WriteConfig>, secrets: SharedSecrets) -> StorageRuleBuilder {
        let hub = BroadcastHub::new();
        StorageRuleBuilder::new(
            Arc::new(InMemoryStorage::new(rules, write_configs)),
            ManagedStreamRunner::new(FrameCache::new(), hub.clone()),
            hub,
            secrets,
            RemoteWriteRegistry::new(
                Duration::from_secs(15),
                1000,
                Duration::from_secs(2),
                Client::new(),
                CancellationToken::new(),
            ),
            Client::new(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn builds_every_stage_kind() {
        let b = builder(
            vec![rule(json!({
                "orgId": 0,
                "pattern": "stream/telegraf/:metric",
                "settings": {
                    "converter": {"type": "influxAuto", "frameFormat": "labels_column"},
                    "subscribers": [{"type": "builtin"}, {"type": "managedStream"}],
                    "frameProcessors": [{"type": "dropFields", "fieldNames": ["debug"]}],
                    "frameOutputters": [
                        {"type": "managedStream"},
                        {"type": "conditional",
                         "condition": {"type": "numberCompare", "fieldName": "cpu", "op": "gt", "value": 90},
                         "outputter": {"type": "redirect", "channel": "stream/alerts/cpu"}},
                        {"type": "remoteWrite", "uid": "prom", "sampleMilliseconds": 1000},
                        {"type": "loki", "uid": "logs"}
                    ],
                    "dataOutputters": [{"type": "localSubscribers"}],
                    "auth": {"subscribe": {"requireRole": "Viewer"}}
                }
            }))],
            vec![
                write_config("prom", "http://localhost:9090/api/v1/write", Some("pw")),
                write_config("logs", "http://localhost:3100", None),
            ],
            Arc::new(PlainSecrets),
        );

        let rules = b.build_rules(1).await.unwrap();
        assert_eq!(rules.len(), 1);
        let live = &rules[0];
        assert_eq!(live.org_id, 1);
        assert_eq!(live.converter.as_ref().unwrap().type_name(), "influxAuto");
        assert_eq!(live.subscribers.len(), 2);
        assert_eq!(live.frame_processors.len(), 1);
        assert_eq!(live.frame_outputters.len(), 4);
        assert_eq!(live.data_outputters.len(), 1);
        assert!(live.subscribe_auth.is_some());
        assert!(live.publish_auth.is_none());
        assert_eq!(live.redirect_targets(), vec!["stream/alerts/cpu"]);
        assert_eq!(b.remote_write.len(), 1);

        b.build_rules(1).await.unwrap();
        assert_eq!(b.remote_write.len(), 1);
        assert!(b.build_rules(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuilds_keep_one_sink_per_write_config() {
        let dir = tempfile::tempdir().unwrap();
        let write_rules = |endpoint: &str, outputters: serde_json::Value| {
            let file = json!({
                "rules": [{
                    "orgId": 1,
                    "pattern": "stream/telegraf/:metric",
                    "settings": {"frameOutputters": outputters}
                }],
                "writeConfigs": [{"orgId": 1, "uid": "prom", "settings": {"endpoint": endpoint}}]
            });
            std::fs::write(dir.path().join("rules.json"), file.to_string()).unwrap();
        };
        let hub = BroadcastHub::new();
        let b = StorageRuleBuilder::new(
            Arc::new(FileStorage::new(dir.path())),
            ManagedStreamRunner::new(FrameCache::new(), hub.clone()),
            hub,
            Arc::new(PlainSecrets),
            RemoteWriteRegistry::new(
                Duration::from_secs(15),
                1000,
                Duration::from_secs(2),
                Client::new(),
                CancellationToken::new(),
            ),
            Client::new(),
            Duration::from_secs(2),
        );
        let nested = json!([{"type": "multiple", "outputters": [{"type": "remoteWrite", "uid": "prom"}]}]);

        write_rules("http://a:9090/api/v1/write", nested.clone());
        b.build_rules(1).await.unwrap();
        write_rules("http://b:9090/api/v1/write", nested);
        b.build_rules(1).await.unwrap();
        assert_eq!(b.remote_write.len(), 1);

        write_rules("http://b:9090/api/v1/write", json!([{"type": "managedStream"}]));
        b.build_rules(1).await.unwrap();
        assert!(b.remote_write.is_empty());
    }

    #[tokio::test]
    async fn missing_write_config_names_the_uid() {
        let b = builder(
            vec![rule(json!({
                "orgId": 1,
                "pattern": "stream/a/b",
                "settings": {"frameOutputters": [{"type": "loki", "uid": "nope"}]}
            }))],
            Vec::new(),
            Arc::new(PlainSecrets),
        );
        let err = b.build_rules(1).await.unwrap_err();
        assert!(matches!(err, BuildError::Config(ConfigError::WriteConfigNotFound(ref uid)) if uid == "nope"));
    }

    #[tokio::test]
    async fn bad_endpoint_and_missing_secret_are_rejected() {
        let ws = vec![
            write_config("bad", "not a url", None),
            write_config("secret", "http://localhost:3100", Some("env:STREAMROUTE_TEST_UNSET_SECRET")),
        ];
        let b = builder(Vec::new(), ws.clone(), Arc::new(EnvSecrets));
        for uid in ["bad", "secret"] {
            let r = rule(json!({
                "orgId": 1,
                "pattern": "stream/a/b",
                "settings": {"dataOutputters": [{"type": "loki", "uid": uid}]}
            }));
            let err = b.build_rule(1, &r, &ws).await.unwrap_err();
            assert!(matches!(err, ConfigError::InvalidWriteConfig { uid: ref u, .. } if u == uid));
        }
    }

    #[tokio::test]
    async fn invalid_expression_fails_the_rule() {
        let b = builder(Vec::new(), Vec::new(), Arc::new(PlainSecrets));
        let r = rule(json!({
            "orgId": 1,
            "pattern": "stream/a/b",
            "settings": {"converter": {"type": "jsonExact", "fields": [
                {"name": "v", "type": "float64", "value": "{x.a +}"}
            ]}}
        }));
        let err = b.build_rule(1, &r, &[]).await.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule { ref pattern, .. } if pattern == "stream/a/b"));
    }

    #[test]
    fn detects_redirect_cycles() {
        let mut a = LiveChannelRule::new(1, "stream/a/:x");
        a.frame_outputters
            .push(FrameOutputter::Redirect(RedirectOutput::new("stream/b/1")));
        let mut b = LiveChannelRule::new(1, "stream/b/:x");
        b.frame_outputters
            .push(FrameOutputter::Redirect(RedirectOutput::new("stream/c/1")));
        let c = LiveChannelRule::new(1, "stream/c/1");
        assert!(!has_redirect_cycle(&[a, b, c]));

        let mut a = LiveChannelRule::new(1, "stream/a/:x");
        a.frame_outputters
            .push(FrameOutputter::Redirect(RedirectOutput::new("stream/b/1")));
        let mut b = LiveChannelRule::new(1, "stream/b/:x");
        b.data_outputters
            .push(DataOutputter::Redirect(RedirectOutput::new("stream/a/2")));
        assert!(has_redirect_cycle(&[a, b]));
    }
}
