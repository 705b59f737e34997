//! Prometheus remote write: frames become time series, buffered and shipped
//! as snappy-compressed protobuf on a timer.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prost::Message;
use regex::Regex;
use reqwest::Client;
use stream_frame::{FieldType, FieldValue, Frame};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{OutputError, SinkError};
use crate::pipeline::{ChannelFrame, Vars};

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since the epoch.
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

static INVALID_METRIC_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_:]").ok());

/// Maps a name onto `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn sanitize_metric_name(raw: &str) -> String {
    let mut name = match INVALID_METRIC_CHARS.as_ref() {
        Some(re) => re.replace_all(raw, "_").into_owned(),
        None => raw
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == ':' { c } else { '_' })
            .collect(),
    };
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Parses a labels-column cell: `k=v,k2=v2`.
fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// One series per metric name and label set. Numeric and bool fields are
/// exported; a string `labels` column adds per-row labels.
pub fn frame_to_series(frame: &Frame) -> Vec<TimeSeries> {
    let rows = frame.rows();
    let time_idx = frame
        .fields
        .iter()
        .position(|f| f.field_type() == FieldType::Time);
    let labels_column = frame
        .field_by_name("labels")
        .filter(|f| f.field_type() == FieldType::String);
    let now = Utc::now().timestamp_millis();

    let mut series: Vec<(BTreeMap<String, String>, Vec<Sample>)> = Vec::new();
    for (idx, field) in frame.fields.iter().enumerate() {
        if Some(idx) == time_idx || field.name == "labels" {
            continue;
        }
        if !(field.field_type().is_numeric() || field.field_type() == FieldType::Bool) {
            continue;
        }
        let metric = if frame.name.is_empty() {
            sanitize_metric_name(&field.name)
        } else {
            sanitize_metric_name(&format!("{}_{}", frame.name, field.name))
        };

        for row in 0..rows {
            let Some(value) = field.at(row).as_f64() else {
                continue;
            };
            let timestamp = match time_idx.map(|i| frame.fields[i].at(row)) {
                Some(FieldValue::Time(t)) => t.timestamp_millis(),
                _ => now,
            };
            let mut labels = field.labels.clone();
            if let Some(FieldValue::String(raw)) = labels_column.map(|f| f.at(row)) {
                labels.extend(parse_labels(&raw));
            }
            labels.insert("__name__".to_string(), metric.clone());

            let sample = Sample { value, timestamp };
            match series.iter_mut().find(|(l, _)| *l == labels) {
                Some((_, samples)) => samples.push(sample),
                None => series.push((labels, vec![sample])),
            }
        }
    }

    series
        .into_iter()
        .map(|(labels, samples)| TimeSeries {
            labels: labels
                .into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
            samples,
        })
        .collect()
}

fn series_key(ts: &TimeSeries) -> String {
    ts.labels
        .iter()
        .map(|l| format!("{}={}", l.name, l.value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolved connection settings for a remote-write endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWriteTarget {
    pub endpoint: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default)]
struct Buffer {
    series: VecDeque<TimeSeries>,
    samples: usize,
    last_kept: HashMap<String, i64>,
}

impl Buffer {
    /// Drops the oldest samples until at most `max` remain.
    fn enforce_bound(&mut self, max: usize) -> usize {
        let mut dropped = 0;
        while self.samples > max {
            let overflow = self.samples - max;
            let Some(front) = self.series.front_mut() else {
                break;
            };
            if front.samples.len() <= overflow {
                let n = front.samples.len();
                self.series.pop_front();
                self.samples -= n;
                dropped += n;
            } else {
                front.samples.drain(..overflow);
                self.samples -= overflow;
                dropped += overflow;
            }
        }
        dropped
    }

    /// Forgets series whose last kept sample can no longer suppress a
    /// sample stamped at or after `now`.
    fn prune_last_kept(&mut self, now: i64, interval: i64) -> usize {
        let before = self.last_kept.len();
        self.last_kept.retain(|_, last| now - *last < interval);
        before - self.last_kept.len()
    }
}

/// Buffered writer for one endpoint.
#[derive(Debug)]
pub struct RemoteWriteSink {
    target: RemoteWriteTarget,
    sample_milliseconds: i64,
    max_buffered_samples: usize,
    timeout: Duration,
    client: Client,
    buffer: Mutex<Buffer>,
}

impl RemoteWriteSink {
    pub fn new(
        target: RemoteWriteTarget,
        sample_milliseconds: i64,
        max_buffered_samples: usize,
        timeout: Duration,
        client: Client,
    ) -> Self {
        Self {
            target,
            sample_milliseconds,
            max_buffered_samples,
            timeout,
            client,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.target.endpoint
    }

    pub async fn buffered_samples(&self) -> usize {
        self.buffer.lock().await.samples
    }

    /// Queues the frame's series. With a sample interval set, a series keeps
    /// the earliest sample of each interval.
    pub async fn push(&self, frame: &Frame) {
        let mut buffer = self.buffer.lock().await;
        for mut ts in frame_to_series(frame) {
            if self.sample_milliseconds > 0 {
                let key = series_key(&ts);
                let interval = self.sample_milliseconds;
                let mut last = buffer.last_kept.get(&key).copied();
                ts.samples.retain(|s| match last {
                    Some(prev) if s.timestamp - prev < interval => false,
                    _ => {
                        last = Some(s.timestamp);
                        true
                    }
                });
                if let Some(last) = last {
                    buffer.last_kept.insert(key, last);
                }
            }
            if ts.samples.is_empty() {
                continue;
            }
            buffer.samples += ts.samples.len();
            buffer.series.push_back(ts);
        }
        let dropped = buffer.enforce_bound(self.max_buffered_samples);
        if dropped > 0 {
            warn!(endpoint = %self.target.endpoint, dropped, "remote write buffer full, dropped oldest samples");
        }
    }

    /// Sends everything buffered. On failure the batch goes back in front
    /// of anything queued since.
    pub async fn flush(&self) -> Result<usize, SinkError> {
        let batch: Vec<TimeSeries> = {
            let mut buffer = self.buffer.lock().await;
            if self.sample_milliseconds > 0 {
                let pruned = buffer.prune_last_kept(Utc::now().timestamp_millis(), self.sample_milliseconds);
                if pruned > 0 {
                    debug!(endpoint = %self.target.endpoint, pruned, "forgot idle series");
                }
            }
            buffer.samples = 0;
            buffer.series.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let count: usize = batch.iter().map(|ts| ts.samples.len()).sum();

        match self.send(&batch).await {
            Ok(()) => {
                debug!(endpoint = %self.target.endpoint, samples = count, "remote write flushed");
                Ok(count)
            }
            Err(err) => {
                let mut buffer = self.buffer.lock().await;
                for ts in batch.into_iter().rev() {
                    buffer.series.push_front(ts);
                }
                buffer.samples += count;
                let dropped = buffer.enforce_bound(self.max_buffered_samples);
                if dropped > 0 {
                    warn!(endpoint = %self.target.endpoint, dropped, "remote write buffer full, dropped oldest samples");
                }
                Err(err)
            }
        }
    }

    async fn send(&self, batch: &[TimeSeries]) -> Result<(), SinkError> {
        let request = WriteRequest {
            timeseries: batch.to_vec(),
        };
        let body = snap::raw::Encoder::new().compress_vec(&request.encode_to_vec())?;

        let mut req = self
            .client
            .post(&self.target.endpoint)
            .timeout(self.timeout)
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .body(body);
        if let Some(user) = &self.target.user {
            req = req.basic_auth(user, self.target.password.as_ref());
        }
        let resp = req.send().await.map_err(|source| SinkError::Http {
            endpoint: self.target.endpoint.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                endpoint: self.target.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RemoteWriteOutput {
    sink: Arc<RemoteWriteSink>,
}

impl RemoteWriteOutput {
    pub fn new(sink: Arc<RemoteWriteSink>) -> Self {
        Self { sink }
    }

    pub(super) async fn output(&self, _vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        self.sink.push(frame).await;
        Ok(Vec::new())
    }
}

type SinkKey = (i64, String, i64);

#[derive(Debug)]
struct SinkEntry {
    sink: Arc<RemoteWriteSink>,
    cancel: CancellationToken,
    _task: JoinHandle<()>,
}

impl SinkEntry {
    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Shares sinks across rule rebuilds so each write config has one buffer
/// and one flush task per org and sample interval.
#[derive(Debug)]
pub struct RemoteWriteRegistry {
    sinks: DashMap<SinkKey, SinkEntry>,
    flush_interval: Duration,
    max_buffered_samples: usize,
    timeout: Duration,
    client: Client,
    cancel: CancellationToken,
}

impl RemoteWriteRegistry {
    pub fn new(
        flush_interval: Duration,
        max_buffered_samples: usize,
        timeout: Duration,
        client: Client,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sinks: DashMap::new(),
            flush_interval,
            max_buffered_samples,
            timeout,
            client,
            cancel,
        })
    }

    fn start(&self, target: RemoteWriteTarget, sample_milliseconds: i64) -> SinkEntry {
        let sink = Arc::new(RemoteWriteSink::new(
            target,
            sample_milliseconds,
            self.max_buffered_samples,
            self.timeout,
            self.client.clone(),
        ));
        let cancel = self.cancel.child_token();
        let task = spawn_flush_loop(sink.clone(), self.flush_interval, cancel.clone());
        SinkEntry {
            sink,
            cancel,
            _task: task,
        }
    }

    /// Returns the sink for this write config, creating it and its flush
    /// task on first use. A changed target replaces the sink and stops the
    /// old flush task. Must be called inside a tokio runtime.
    pub fn get_or_create(
        &self,
        org_id: i64,
        uid: &str,
        target: RemoteWriteTarget,
        sample_milliseconds: i64,
    ) -> Arc<RemoteWriteSink> {
        match self.sinks.entry((org_id, uid.to_string(), sample_milliseconds)) {
            Entry::Occupied(mut slot) => {
                if slot.get().sink.target != target {
                    info!(
                        org_id,
                        uid,
                        old = %slot.get().sink.endpoint(),
                        new = %target.endpoint,
                        "remote write target changed, replacing sink"
                    );
                    let old = slot.insert(self.start(target, sample_milliseconds));
                    old.stop();
                }
                slot.get().sink.clone()
            }
            Entry::Vacant(slot) => slot.insert(self.start(target, sample_milliseconds)).sink.clone(),
        }
    }

    /// Stops and drops the org's sinks whose `(uid, sampleMilliseconds)` is
    /// not in `keep`. Returns how many were evicted.
    pub fn retain_org(&self, org_id: i64, keep: &HashSet<(String, i64)>) -> usize {
        let mut evicted = 0;
        self.sinks.retain(|(org, uid, sample_ms), entry| {
            if *org != org_id || keep.contains(&(uid.clone(), *sample_ms)) {
                return true;
            }
            debug!(org_id, uid = %uid, endpoint = %entry.sink.endpoint(), "remote write sink no longer used");
            entry.stop();
            evicted += 1;
            false
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Flushes every sink once, logging failures.
    pub async fn flush_all(&self) {
        let sinks: Vec<Arc<RemoteWriteSink>> = self.sinks.iter().map(|e| e.value().sink.clone()).collect();
        for sink in sinks {
            if let Err(err) = sink.flush().await {
                warn!(endpoint = %sink.endpoint(), error = %err, "remote write flush failed");
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn spawn_flush_loop(sink: Arc<RemoteWriteSink>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = sink.flush().await {
                        warn!(endpoint = %sink.endpoint(), error = %err, "final remote write flush failed");
                    }
                    info!(endpoint = %sink.endpoint(), "remote write flush loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = sink.flush().await {
                        warn!(endpoint = %sink.endpoint(), error = %err, "remote write flush failed, will retry");
                    }
                }
            }
        }
    })
}
