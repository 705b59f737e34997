use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_CHANNEL_LENGTH: usize = 160;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is empty")]
    Empty,
    #[error("channel `{0}` is longer than {MAX_CHANNEL_LENGTH} characters")]
    TooLong(String),
    #[error("channel `{channel}` contains invalid character `{ch}`")]
    InvalidChar { channel: String, ch: char },
    #[error("channel `{0}` needs a scope and a namespace")]
    Incomplete(String),
    #[error("`{0}` is not an org-qualified channel")]
    NotOrgQualified(String),
}

/// Address of a stream of frames inside one org: `scope/namespace/path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub scope: String,
    pub namespace: String,
    pub path: String,
}

impl Channel {
    pub fn new(
        scope: impl Into<String>,
        namespace: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            namespace: namespace.into(),
            path: path.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        check_chars(raw)?;
        let mut parts = raw.splitn(3, '/');
        let scope = parts.next().unwrap_or_default();
        let namespace = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        if scope.is_empty() || namespace.is_empty() {
            return Err(ChannelError::Incomplete(raw.to_string()));
        }
        Ok(Self::new(scope, namespace, path))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}/{}", self.scope, self.namespace)
        } else {
            write!(f, "{}/{}/{}", self.scope, self.namespace, self.path)
        }
    }
}

fn check_chars(raw: &str) -> Result<(), ChannelError> {
    if raw.is_empty() {
        return Err(ChannelError::Empty);
    }
    if raw.len() > MAX_CHANNEL_LENGTH {
        return Err(ChannelError::TooLong(raw.to_string()));
    }
    if let Some(ch) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '=' | '.')))
    {
        return Err(ChannelError::InvalidChar {
            channel: raw.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Org-qualified transport key, `"<org>/<channel>"`.
pub fn prepend_org_id(org_id: i64, channel: &str) -> String {
    format!("{org_id}/{channel}")
}

pub fn strip_org_id(qualified: &str) -> Result<(i64, String), ChannelError> {
    let (org, channel) = qualified
        .split_once('/')
        .ok_or_else(|| ChannelError::NotOrgQualified(qualified.to_string()))?;
    let org_id = org
        .parse::<i64>()
        .map_err(|_| ChannelError::NotOrgQualified(qualified.to_string()))?;
    Ok((org_id, channel.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_scope_namespace_and_path() {
        let ch = Channel::parse("stream/telegraf/cpu/host=a").unwrap();
        assert_eq!(ch.scope, "stream");
        assert_eq!(ch.namespace, "telegraf");
        assert_eq!(ch.path, "cpu/host=a");
        assert_eq!(ch.to_string(), "stream/telegraf/cpu/host=a");
    }

    #[test]
    fn parse_allows_empty_path() {
        let ch = Channel::parse("plugin/testdata").unwrap();
        assert_eq!(ch.path, "");
        assert_eq!(ch.to_string(), "plugin/testdata");
    }

    #[test]
    fn parse_rejects_bad_channels() {
        assert_eq!(Channel::parse(""), Err(ChannelError::Empty));
        assert!(matches!(
            Channel::parse("stream"),
            Err(ChannelError::Incomplete(_))
        ));
        assert!(matches!(
            Channel::parse("stream/a b/c"),
            Err(ChannelError::InvalidChar { ch: ' ', .. })
        ));
        let long = format!("stream/ns/{}", "x".repeat(MAX_CHANNEL_LENGTH));
        assert!(matches!(Channel::parse(&long), Err(ChannelError::TooLong(_))));
    }

    #[test]
    fn org_prefix_round_trips() {
        let key = prepend_org_id(3, "stream/a/b");
        assert_eq!(key, "3/stream/a/b");
        assert_eq!(strip_org_id(&key).unwrap(), (3, "stream/a/b".to_string()));
        assert!(strip_org_id("stream/a/b").is_err());
    }
}
