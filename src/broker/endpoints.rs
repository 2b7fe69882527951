use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::CredentialError;

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const MAX_ERROR_BODY: usize = 512;

/// Generic broker response envelope.
#[derive(Debug, Default, Deserialize)]
pub(super) struct SecretResponse {
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub auth: Option<AuthBlock>,
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthBlock {
    pub client_token: String,
    #[serde(default)]
    pub lease_duration: u64,
}

/// Stateless broker endpoints. Holds only transport settings, never a token.
#[derive(Clone)]
pub(super) struct BrokerEndpoints {
    http: reqwest::Client,
    address: Url,
    namespace: Option<String>,
}

impl BrokerEndpoints {
    pub(super) fn new(http: reqwest::Client, address: Url, namespace: Option<String>) -> Self {
        Self {
            http,
            address,
            namespace,
        }
    }

    pub(super) async fn read(
        &self,
        token: Option<&str>,
        path: &str,
    ) -> Result<SecretResponse, CredentialError> {
        self.call(Method::GET, token, path, None).await
    }

    pub(super) async fn write(
        &self,
        token: Option<&str>,
        path: &str,
        body: &Value,
    ) -> Result<SecretResponse, CredentialError> {
        self.call(Method::POST, token, path, Some(body)).await
    }

    async fn call(
        &self,
        method: Method,
        token: Option<&str>,
        path: &str,
        body: Option<&Value>,
    ) -> Result<SecretResponse, CredentialError> {
        let path = path.trim_matches('/');
        let url = self.address.join(&format!("v1/{path}"))?;
        let mut req = self.http.request(method.clone(), url);
        if let Some(token) = token {
            req = req.header(TOKEN_HEADER, token);
        }
        if let Some(ns) = self.namespace.as_deref() {
            req = req.header(NAMESPACE_HEADER, ns);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        debug!(method = %method, path, status = status.as_u16(), "broker call");
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(CredentialError::Status {
                path: path.to_string(),
                status,
                body: text,
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(SecretResponse::default());
        }
        Ok(resp.json::<SecretResponse>().await?)
    }
}
