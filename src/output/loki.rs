use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use stream_frame::{Frame, Include};
use tracing::debug;

use super::{OutputError, SinkError};
use crate::pipeline::{ChannelData, ChannelFrame, Vars};

const PUSH_PATH: &str = "/loki/api/v1/push";

/// Pushes single log lines to a Loki endpoint.
#[derive(Debug, Clone)]
pub struct LokiClient {
    endpoint: String,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
    client: Client,
}

impl LokiClient {
    pub fn new(
        endpoint: impl Into<String>,
        user: Option<String>,
        password: Option<String>,
        timeout: Duration,
        client: Client,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            user,
            password,
            timeout,
            client,
        }
    }

    fn push_url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), PUSH_PATH)
    }

    pub async fn push(&self, channel: &str, line: String) -> Result<(), SinkError> {
        let ts = Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string();
        let body = json!({
            "streams": [{
                "stream": {"channel": channel},
                "values": [[ts, line]],
            }]
        });

        let url = self.push_url();
        let mut req = self.client.post(&url).timeout(self.timeout).json(&body);
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.as_ref());
        }
        let resp = req.send().await.map_err(|source| SinkError::Http {
            endpoint: url.clone(),
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::Status {
                endpoint: url,
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        debug!(%channel, "pushed log line to loki");
        Ok(())
    }
}

/// Logs each frame (or raw payload) as one line, labelled with the channel.
#[derive(Debug, Clone)]
pub struct LokiOutput {
    client: LokiClient,
}

impl LokiOutput {
    pub fn new(client: LokiClient) -> Self {
        Self { client }
    }

    pub(super) async fn output(&self, vars: &Vars, frame: &Frame) -> Result<Vec<ChannelFrame>, OutputError> {
        let payload = frame.to_json()?.bytes(Include::All);
        let line = String::from_utf8_lossy(&payload).into_owned();
        self.client.push(&vars.channel, line).await?;
        Ok(Vec::new())
    }

    pub(super) async fn output_data(&self, vars: &Vars, data: &[u8]) -> Result<Vec<ChannelData>, OutputError> {
        let line = String::from_utf8_lossy(data).into_owned();
        self.client.push(&vars.channel, line).await?;
        Ok(Vec::new())
    }
}
