use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::error::CredentialError;

/// Short-lived username/password pair issued by the broker.
///
/// Single lease: valid for `ttl` from `issued_at`, never renewed.
#[derive(Clone)]
pub struct LeasedCredential {
    pub username: String,
    password: String,
    pub lease_id: Option<String>,
    pub ttl: Duration,
    pub issued_at: DateTime<Utc>,
    pub role_path: String,
}

impl LeasedCredential {
    pub fn new(
        role_path: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            lease_id: None,
            ttl,
            issued_at: Utc::now(),
            role_path: role_path.into(),
        }
    }

    pub fn with_lease_id(mut self, lease_id: Option<String>) -> Self {
        self.lease_id = lease_id.filter(|id| !id.is_empty());
        self
    }

    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// `None` when the broker advertised no lease duration.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl.is_zero() {
            return None;
        }
        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        Some(
            self.issued_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at().is_some_and(|at| Utc::now() >= at)
    }

    pub fn ensure_valid(&self) -> Result<(), CredentialError> {
        match self.expires_at() {
            Some(expired_at) if Utc::now() >= expired_at => Err(CredentialError::LeaseExpired {
                role_path: self.role_path.clone(),
                expired_at,
            }),
            _ => Ok(()),
        }
    }

    pub(super) fn from_secret(
        role_path: &str,
        data: &Map<String, Value>,
        lease_id: Option<String>,
        lease_duration: u64,
    ) -> Result<Self, CredentialError> {
        let field = |name: &'static str| {
            data.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CredentialError::MalformedSecret {
                    path: role_path.to_string(),
                    field: name,
                })
        };
        let username = field("username")?;
        let password = field("password")?;
        Ok(
            Self::new(role_path, username, password, Duration::from_secs(lease_duration))
                .with_lease_id(lease_id),
        )
    }
}

impl fmt::Debug for LeasedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("lease_id", &self.lease_id)
            .field("ttl", &self.ttl)
            .field("issued_at", &self.issued_at)
            .field("role_path", &self.role_path)
            .finish()
    }
}

/// Static connection facts kept in a KV secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectionFacts {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
}

impl ConnectionFacts {
    /// Accepts KV v1 payloads and KV v2 payloads (nested under `data`).
    /// Ports may be stored as strings or numbers.
    pub(super) fn from_secret(data: &Map<String, Value>) -> Self {
        let raw = match data.get("data") {
            Some(Value::Object(inner)) => inner,
            _ => data,
        };
        let text = |name: &str| {
            raw.get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let port = match raw.get("port") {
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Self {
            host: text("host"),
            port,
            database: text("database"),
        }
    }
}
