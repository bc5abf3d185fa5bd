// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use consul::types::canonical_namespace;
use consul::AclClient;
use grpc_util::retry::{retry_constant, RetryConfig, RetryError};
use tokio_util::sync::CancellationToken;

/// Metadata key carrying the gateway's identity in the login request.
pub const LOGIN_META_KEY: &str = "component";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read bearer token from {path}: {message}")]
    TokenFile { path: PathBuf, message: String },

    #[error("authentication failed: {0}")]
    Login(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct AuthenticatorConfig {
    pub auth_method: String,
    /// Empty or `default` means no namespace qualifier.
    pub namespace: Option<String>,
    /// File holding the bearer token; re-read on every attempt so a rotated
    /// token is picked up mid-retry.
    pub bearer_token_path: PathBuf,
    pub retry: RetryConfig,
}

impl AuthenticatorConfig {
    pub fn new(auth_method: impl Into<String>, bearer_token_path: impl Into<PathBuf>) -> Self {
        AuthenticatorConfig {
            auth_method: auth_method.into(),
            namespace: None,
            bearer_token_path: bearer_token_path.into(),
            retry: RetryConfig::new(30, Duration::from_secs(1)),
        }
    }
}

/// Exchanges the mounted bearer token for a control-plane session token.
pub struct Authenticator<C> {
    client: Arc<C>,
    config: AuthenticatorConfig,
}

impl<C> Authenticator<C>
where
    C: AclClient + Send + Sync,
{
    pub fn new(client: Arc<C>, config: AuthenticatorConfig) -> Self {
        Authenticator { client, config }
    }

    fn namespace(&self) -> Option<&str> {
        self.config
            .namespace
            .as_deref()
            .map(canonical_namespace)
            .filter(|ns| !ns.is_empty())
    }

    /// The metadata value identifying this gateway: `namespace/service`,
    /// or just `service` when un-namespaced.
    fn login_meta(&self, gateway_service: &str) -> HashMap<String, String> {
        let value = match self.namespace() {
            Some(ns) => format!("{ns}/{gateway_service}"),
            None => gateway_service.to_owned(),
        };
        HashMap::from([(LOGIN_META_KEY.to_owned(), value)])
    }

    /// Exchange the bearer token for a session token, retrying transport
    /// failures at a constant interval. Returns the token's secret.
    pub async fn authenticate(
        &self,
        cancel: &CancellationToken,
        gateway_service: &str,
    ) -> Result<String, Error> {
        let meta = self.login_meta(gateway_service);
        let result = retry_constant(cancel, self.config.retry, "acl login", || {
            let meta = meta.clone();
            async move {
                let bearer_token =
                    tokio::fs::read_to_string(&self.config.bearer_token_path)
                        .await
                        .map_err(|err| Error::TokenFile {
                            path: self.config.bearer_token_path.clone(),
                            message: err.to_string(),
                        })?;
                self.client
                    .login(
                        &self.config.auth_method,
                        self.namespace(),
                        bearer_token.trim(),
                        &meta,
                    )
                    .await
                    .map_err(|err| Error::Login(err.to_string()))
            }
        })
        .await;
        match result {
            Ok(token) => Ok(token.secret_id),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::Exhausted { source, .. }) => Err(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use consul::testutil::MemoryConsul;
    use grpc_util::retry::RetryConfig;
    use tokio_util::sync::CancellationToken;

    use super::{Authenticator, AuthenticatorConfig, Error, LOGIN_META_KEY};

    fn token_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bearer-token\n").unwrap();
        file
    }

    fn authenticator(
        consul: &Arc<MemoryConsul>,
        namespace: Option<&str>,
        path: &std::path::Path,
        tries: u32,
    ) -> Authenticator<MemoryConsul> {
        let mut config = AuthenticatorConfig::new("gateway-auth", path);
        config.namespace = namespace.map(str::to_owned);
        config.retry = RetryConfig::new(tries, Duration::from_millis(1));
        Authenticator::new(consul.clone(), config)
    }

    #[tokio::test]
    async fn login_meta_carries_gateway_identity() {
        let consul = Arc::new(MemoryConsul::new());
        let file = token_file();
        let auth = authenticator(&consul, Some("team1"), file.path(), 3);
        let cancel = CancellationToken::new();

        let token = auth.authenticate(&cancel, "gateway").await.unwrap();
        assert_eq!(token, "test-secret");

        let logins = consul.logins();
        assert_eq!(logins.len(), 1);
        assert_eq!(logins[0].0, "gateway-auth");
        assert_eq!(logins[0].1.get(LOGIN_META_KEY).unwrap(), "team1/gateway");
    }

    #[tokio::test]
    async fn default_namespace_drops_qualifier() {
        let consul = Arc::new(MemoryConsul::new());
        let file = token_file();
        let auth = authenticator(&consul, Some("default"), file.path(), 3);
        auth.authenticate(&CancellationToken::new(), "gateway")
            .await
            .unwrap();
        assert_eq!(
            consul.logins()[0].1.get(LOGIN_META_KEY).unwrap(),
            "gateway"
        );
    }

    #[tokio::test]
    async fn retries_transient_login_failures() {
        let consul = Arc::new(MemoryConsul::new());
        consul.fail_next_logins(2);
        let file = token_file();
        let auth = authenticator(&consul, None, file.path(), 5);
        let token = auth
            .authenticate(&CancellationToken::new(), "gateway")
            .await
            .unwrap();
        assert_eq!(token, "test-secret");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let consul = Arc::new(MemoryConsul::new());
        consul.fail_next_logins(10);
        let file = token_file();
        let auth = authenticator(&consul, None, file.path(), 2);
        let err = auth
            .authenticate(&CancellationToken::new(), "gateway")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Login(_)));
    }

    #[tokio::test]
    async fn cancellation_returns_immediately() {
        let consul = Arc::new(MemoryConsul::new());
        consul.fail_next_logins(u32::MAX);
        let file = token_file();
        let auth = authenticator(&consul, None, file.path(), 30);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = auth.authenticate(&cancel, "gateway").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn missing_token_file_is_reported() {
        let consul = Arc::new(MemoryConsul::new());
        let auth = authenticator(&consul, None, std::path::Path::new("/nonexistent"), 1);
        let err = auth
            .authenticate(&CancellationToken::new(), "gateway")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenFile { .. }));
    }
}
