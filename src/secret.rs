use std::env;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretsError {
    #[error("secret `{0}` not found")]
    NotFound(String),
    #[error("secret backend failed: {0}")]
    Upstream(String),
}

/// Turns stored secure settings (e.g. a write config's
/// `basicAuthPassword`) into plain text.
#[async_trait]
pub trait SecretsDecryptor: Send + Sync + Debug {
    async fn decrypt(&self, cipher: &str) -> Result<String, SecretsError>;
}

pub type SharedSecrets = Arc<dyn SecretsDecryptor>;

/// Stored values are already plain text. Fine for local rule files.
#[derive(Debug, Clone, Default)]
pub struct PlainSecrets;

#[async_trait]
impl SecretsDecryptor for PlainSecrets {
    async fn decrypt(&self, cipher: &str) -> Result<String, SecretsError> {
        Ok(cipher.to_string())
    }
}

/// `env:NAME` resolves to the environment variable `NAME`; any other value
/// is returned unchanged.
#[derive(Debug, Clone, Default)]
pub struct EnvSecrets;

pub const ENV_PREFIX: &str = "env:";

#[async_trait]
impl SecretsDecryptor for EnvSecrets {
    async fn decrypt(&self, cipher: &str) -> Result<String, SecretsError> {
        match cipher.strip_prefix(ENV_PREFIX) {
            Some(name) => env::var(name).map_err(|_| SecretsError::NotFound(name.to_string())),
            None => Ok(cipher.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_secrets_pass_through() {
        assert_eq!(PlainSecrets.decrypt("hunter2").await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn env_secrets_resolve_variables() {
        let key = "STREAMROUTE_TEST_SECRET_PASSWORD";
        unsafe { env::set_var(key, "s3cret") };
        let secrets = EnvSecrets;
        assert_eq!(
            secrets.decrypt(&format!("env:{key}")).await.unwrap(),
            "s3cret"
        );
        assert_eq!(secrets.decrypt("literal").await.unwrap(), "literal");
        unsafe { env::remove_var(key) };

        assert_eq!(
            secrets.decrypt("env:STREAMROUTE_TEST_SECRET_MISSING").await,
            Err(SecretsError::NotFound(
                "STREAMROUTE_TEST_SECRET_MISSING".to_string()
            ))
        );
    }
}
