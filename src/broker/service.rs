use backon::{ExponentialBuilder, Retryable};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials::{ConnectionFacts, LeasedCredential};
use super::endpoints::{BrokerEndpoints, SecretResponse};
use crate::config::BrokerConfig;
use crate::error::{CredentialError, IsRetryable};

const APPROLE_LOGIN_PATH: &str = "auth/approle/login";

/// Broker settings after environment defaults and explicit options are
/// applied (explicit wins).
#[derive(Clone)]
pub struct BrokerSettings {
    pub address: Url,
    pub token: Option<String>,
    pub approle: Option<String>,
    pub role_base: String,
    pub namespace: Option<String>,
    pub request_timeout: Duration,
    pub max_retries: usize,
}

impl std::fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("address", &self.address.as_str())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("approle", &self.approle)
            .field("role_base", &self.role_base)
            .field("namespace", &self.namespace)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl BrokerSettings {
    /// Resolve from the process environment, then `options`.
    pub fn from_env(options: &BrokerConfig) -> Result<Self, CredentialError> {
        Self::resolve(|key| std::env::var(key).ok(), options)
    }

    pub fn resolve(
        env: impl Fn(&str) -> Option<String>,
        options: &BrokerConfig,
    ) -> Result<Self, CredentialError> {
        let pick = |explicit: &Option<String>, key: &str| {
            explicit
                .clone()
                .or_else(|| env(key))
                .filter(|v| !v.trim().is_empty())
        };

        let address = pick(&options.address, "VAULT_ADDR").ok_or(CredentialError::MissingAddress)?;
        // A trailing slash keeps `Url::join` from dropping the last path segment.
        let address = if address.ends_with('/') {
            Url::parse(&address)?
        } else {
            Url::parse(&format!("{address}/"))?
        };

        Ok(Self {
            address,
            token: pick(&options.token, "VAULT_TOKEN"),
            approle: pick(&options.approle, "VAULT_APPROLE"),
            role_base: options.role_base.trim_matches('/').to_string(),
            namespace: pick(&options.namespace, "VAULT_NAMESPACE"),
            request_timeout: Duration::from_secs(options.request_timeout_secs.max(1)),
            max_retries: options.max_retries,
        })
    }

    fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_max_times(self.max_retries)
            .with_jitter()
    }

    fn http_client(&self) -> Result<reqwest::Client, CredentialError> {
        Ok(reqwest::Client::builder()
            .user_agent(concat!("vaultdump/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(self.request_timeout)
            .build()?)
    }
}

/// Authenticated broker session. Written once by [`BrokerSession::authenticate`]
/// and read-only afterwards, so it can be shared across tasks behind an `Arc`.
pub struct BrokerSession {
    endpoints: BrokerEndpoints,
    token: String,
    retry_policy: ExponentialBuilder,
}

impl BrokerSession {
    /// AppRole takes precedence when configured; otherwise the static token is
    /// used as-is without any network round-trip.
    pub async fn authenticate(settings: BrokerSettings) -> Result<Self, CredentialError> {
        let endpoints = BrokerEndpoints::new(
            settings.http_client()?,
            settings.address.clone(),
            settings.namespace.clone(),
        );
        let retry_policy = settings.retry_policy();

        let token = match settings.approle.as_deref() {
            Some(role) => {
                app_role_login(
                    &endpoints,
                    retry_policy,
                    settings.token.as_deref(),
                    &settings.role_base,
                    role,
                )
                .await?
            }
            None => {
                let token = settings.token.ok_or(CredentialError::MissingAuthMethod)?;
                debug!(address = %settings.address, "using static broker token");
                token
            }
        };

        Ok(Self {
            endpoints,
            token,
            retry_policy,
        })
    }

    /// Lease one dynamic credential at `role_path` (e.g. `database/creds/pg-db1`).
    pub async fn lease_dynamic_credential(
        &self,
        role_path: &str,
    ) -> Result<LeasedCredential, CredentialError> {
        let resp = self.read(role_path).await?;
        let data = resp
            .data
            .as_ref()
            .ok_or_else(|| CredentialError::NoData(role_path.to_string()))?;
        let cred =
            LeasedCredential::from_secret(role_path, data, resp.lease_id, resp.lease_duration)?;
        info!(
            role_path,
            ttl_secs = cred.ttl.as_secs(),
            "dynamic credential leased"
        );
        Ok(cred)
    }

    /// Read static connection facts (host, port, database) from a KV secret.
    pub async fn read_connection_facts(
        &self,
        path: &str,
    ) -> Result<ConnectionFacts, CredentialError> {
        let resp = self.read(path).await?;
        let data = resp
            .data
            .as_ref()
            .ok_or_else(|| CredentialError::NoData(path.to_string()))?;
        Ok(ConnectionFacts::from_secret(data))
    }

    async fn read(&self, path: &str) -> Result<SecretResponse, CredentialError> {
        (|| async { self.endpoints.read(Some(&self.token), path).await })
            .retry(self.retry_policy)
            .when(|e: &CredentialError| e.is_retryable())
            .notify(|err, dur: Duration| {
                warn!(path, error = %err, delay = ?dur, "broker read retrying");
            })
            .await
    }
}

async fn app_role_login(
    endpoints: &BrokerEndpoints,
    retry_policy: ExponentialBuilder,
    bootstrap_token: Option<&str>,
    role_base: &str,
    role: &str,
) -> Result<String, CredentialError> {
    let login_failed = |reason: &str| CredentialError::AppRoleLogin {
        role: role.to_string(),
        reason: reason.to_string(),
    };

    let role_id_path = format!("{role_base}/{role}/role-id");
    let role_id = (|| async { endpoints.read(bootstrap_token, &role_id_path).await })
        .retry(retry_policy)
        .when(|e: &CredentialError| e.is_retryable())
        .await?
        .data
        .and_then(|d| d.get("role_id").and_then(|v| v.as_str()).map(str::to_string))
        .ok_or_else(|| login_failed("role-id response has no role_id"))?;

    let secret_id_path = format!("{role_base}/{role}/secret-id");
    let secret_id = (|| async {
        endpoints
            .write(bootstrap_token, &secret_id_path, &json!({}))
            .await
    })
    .retry(retry_policy)
    .when(|e: &CredentialError| e.is_retryable())
    .await?
    .data
    .and_then(|d| d.get("secret_id").and_then(|v| v.as_str()).map(str::to_string))
    .ok_or_else(|| login_failed("secret-id response has no secret_id"))?;

    let body = json!({ "role_id": role_id, "secret_id": secret_id });
    let auth = (|| async { endpoints.write(None, APPROLE_LOGIN_PATH, &body).await })
        .retry(retry_policy)
        .when(|e: &CredentialError| e.is_retryable())
        .await?
        .auth
        .ok_or_else(|| login_failed("login response has no auth block"))?;

    info!(
        role,
        token_ttl_secs = auth.lease_duration,
        "approle login succeeded"
    );
    Ok(auth.client_token)
}
