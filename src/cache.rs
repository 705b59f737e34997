//! Per-org cache of compiled pattern trees with a background refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::builder::RuleBuilder;
use crate::pattern::{Params, PatternError, PatternTree};
use crate::pipeline::{LiveChannelRule, RuleGetter};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("loading rules for org {org_id} timed out after {timeout:?}")]
    Timeout { org_id: i64, timeout: Duration },
    #[error("loading rules for org {org_id} failed: {reason}")]
    Build { org_id: i64, reason: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

pub type RuleTree = PatternTree<Arc<LiveChannelRule>>;

#[derive(Debug)]
pub struct RuleCache {
    builder: Arc<dyn RuleBuilder>,
    trees: Cache<i64, Arc<RuleTree>>,
    fetch_timeout: Duration,
    refresh_interval: Duration,
}

impl RuleCache {
    pub fn new(builder: Arc<dyn RuleBuilder>, fetch_timeout: Duration, refresh_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            builder,
            trees: Cache::builder().build(),
            fetch_timeout,
            refresh_interval,
        })
    }

    /// Builds and compiles the rule set of one org. Any failure leaves the
    /// caller's current tree untouched.
    async fn load(&self, org_id: i64) -> Result<Arc<RuleTree>, CacheError> {
        let rules = timeout(self.fetch_timeout, self.builder.build_rules(org_id))
            .await
            .map_err(|_| CacheError::Timeout {
                org_id,
                timeout: self.fetch_timeout,
            })?
            .map_err(|e| CacheError::Build {
                org_id,
                reason: e.to_string(),
            })?;

        let mut tree = PatternTree::new();
        for rule in rules {
            let pattern = rule.pattern.clone();
            tree.insert(&pattern, Arc::new(rule))?;
        }
        debug!(org_id, rules = tree.len(), "compiled rule tree");
        Ok(Arc::new(tree))
    }

    /// Cold orgs are loaded synchronously; failures are not cached.
    pub async fn tree(&self, org_id: i64) -> Result<Arc<RuleTree>, CacheError> {
        self.trees
            .try_get_with(org_id, self.load(org_id))
            .await
            .map_err(|e| (*e).clone())
    }

    /// Orgs that have been loaded at least once.
    pub fn warm_orgs(&self) -> Vec<i64> {
        self.trees.iter().map(|(org_id, _)| *org_id).collect()
    }

    /// Rebuilds every warm org, keeping the stale tree of any org whose
    /// rebuild fails.
    #[instrument(skip(self))]
    pub async fn refresh(&self) {
        for org_id in self.warm_orgs() {
            match self.load(org_id).await {
                Ok(tree) => self.trees.insert(org_id, tree).await,
                Err(e) => error!(org_id, error = %e, "rule refresh failed, keeping previous rules"),
            }
        }
    }

    /// Refreshes on every tick until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!(interval = ?self.refresh_interval, "rule cache refresh started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rule cache refresh stopped");
                    return;
                }
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(cancel))
    }
}

#[async_trait]
impl RuleGetter for RuleCache {
    async fn get(
        &self,
        org_id: i64,
        channel: &str,
    ) -> Result<Option<(Arc<LiveChannelRule>, Params)>, CacheError> {
        let tree = self.tree(org_id).await?;
        Ok(tree.get(channel).map(|(rule, _, params)| (rule.clone(), params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildError;
    use crate::rule::ConfigError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeBuilder {
        patterns: Mutex<Vec<String>>,
        calls: AtomicUsize,
        fail: Mutex<bool>,
        delay: Option<Duration>,
    }

    impl FakeBuilder {
        fn with(patterns: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                patterns: Mutex::new(patterns.iter().map(|p| p.to_string()).collect()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl RuleBuilder for FakeBuilder {
        async fn build_rules(&self, org_id: i64) -> Result<Vec<LiveChannelRule>, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail.lock().unwrap() {
                return Err(ConfigError::WriteConfigNotFound("prom".to_string()).into());
            }
            Ok(self
                .patterns
                .lock()
                .unwrap()
                .iter()
                .map(|p| LiveChannelRule::new(org_id, p.as_str()))
                .collect())
        }
    }

    fn cache(builder: Arc<FakeBuilder>) -> Arc<RuleCache> {
        RuleCache::new(builder, Duration::from_millis(200), Duration::from_secs(20))
    }

    #[tokio::test]
    async fn literal_wins_over_param() {
        let cache = cache(FakeBuilder::with(&["a/:x", "a/b"]));
        let (rule, params) = cache.get(1, "a/b").await.unwrap().unwrap();
        assert_eq!(rule.pattern, "a/b");
        assert!(params.is_empty());
        let (rule, params) = cache.get(1, "a/c").await.unwrap().unwrap();
        assert_eq!(rule.pattern, "a/:x");
        assert_eq!(params.get("x"), Some("c"));
    }

    #[tokio::test]
    async fn loads_each_org_once() {
        let builder = FakeBuilder::with(&["stream/json/auto"]);
        let cache = cache(builder.clone());
        assert!(cache.get(1, "stream/json/auto").await.unwrap().is_some());
        assert!(cache.get(1, "stream/json/other").await.unwrap().is_none());
        assert!(cache.get(2, "stream/json/auto").await.unwrap().is_some());
        assert_eq!(builder.calls.load(Ordering::SeqCst), 2);
        let mut warm = cache.warm_orgs();
        warm.sort();
        assert_eq!(warm, vec![1, 2]);
    }

    #[tokio::test]
    async fn refresh_swaps_in_new_rules() {
        let builder = FakeBuilder::with(&["stream/a/x"]);
        let cache = cache(builder.clone());
        assert!(cache.get(1, "stream/b/x").await.unwrap().is_none());

        builder.patterns.lock().unwrap().push("stream/b/x".to_string());
        cache.refresh().await;
        assert!(cache.get(1, "stream/b/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_rules() {
        let builder = FakeBuilder::with(&["stream/a/x"]);
        let cache = cache(builder.clone());
        cache.get(1, "stream/a/x").await.unwrap();

        *builder.fail.lock().unwrap() = true;
        cache.refresh().await;
        assert!(cache.get(1, "stream/a/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cold_start_failure_is_surfaced_and_not_cached() {
        let builder = FakeBuilder::with(&["stream/a/x"]);
        *builder.fail.lock().unwrap() = true;
        let cache = cache(builder.clone());
        let err = cache.get(1, "stream/a/x").await.unwrap_err();
        assert!(matches!(err, CacheError::Build { org_id: 1, .. }));

        *builder.fail.lock().unwrap() = false;
        assert!(cache.get(1, "stream/a/x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflicting_patterns_fail_the_whole_org() {
        let cache = cache(FakeBuilder::with(&["stream/:a/x", "stream/:b/x"]));
        let err = cache.get(1, "stream/a/x").await.unwrap_err();
        assert!(matches!(err, CacheError::Pattern(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_builds_time_out() {
        let builder = Arc::new(FakeBuilder {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let err = cache(builder).get(1, "stream/a/x").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { org_id: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_stops_on_cancel() {
        let builder = FakeBuilder::with(&["stream/a/x"]);
        let cache = RuleCache::new(builder.clone(), Duration::from_secs(1), Duration::from_secs(20));
        cache.get(1, "stream/a/x").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = cache.spawn_refresh(cancel.clone());
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(builder.calls.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
        handle.await.unwrap();
    }
}
