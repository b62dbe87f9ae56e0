use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TokenDecodeError;

/// Access/refresh credential pair held for the current session.
///
/// `expires_at` is decoded from the access secret's `exp` claim once, when the
/// credential is built, and never recomputed afterwards.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Short-lived secret sent with every API call and channel handshake
    pub access_secret: String,
    /// Longer-lived secret used only against the renewal endpoint
    pub refresh_secret: Option<String>,
    /// Expiry decoded from the access secret, `None` when it could not be read
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential, decoding the expiry claim of the access secret
    pub fn new(access_secret: impl Into<String>, refresh_secret: Option<String>) -> Self {
        let access_secret = access_secret.into();
        let expires_at = match decode_expiry(&access_secret) {
            Ok(expiry) => Some(expiry),
            Err(e) => {
                tracing::warn!(error = %e, "Access secret has no readable expiry, treating as expired");
                None
            }
        };
        Self {
            access_secret,
            refresh_secret,
            expires_at,
        }
    }

    /// Apply a renewal response: a missing refresh secret keeps the current one
    pub fn renewed(&self, access_secret: impl Into<String>, refresh_secret: Option<String>) -> Self {
        Self::new(
            access_secret,
            refresh_secret.or_else(|| self.refresh_secret.clone()),
        )
    }

    /// Unknown expiry counts as expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp <= now)
    }

    pub fn is_valid(&self) -> bool {
        !self.access_secret.is_empty() && !self.is_expired()
    }

    /// Remaining lifetime, `None` when the expiry is unknown
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|exp| exp - now)
    }

    /// True when the remaining lifetime is positive but below `threshold`
    pub fn needs_proactive_renewal(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.remaining(now) {
            Some(remaining) => remaining > chrono::Duration::zero() && remaining < threshold,
            None => false,
        }
    }

    pub fn can_renew(&self) -> bool {
        self.refresh_secret
            .as_deref()
            .map_or(false, |secret| !secret.is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_secret", &redact(&self.access_secret))
            .field(
                "refresh_secret",
                &self.refresh_secret.as_deref().map(redact),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Shorten a secret for log output
pub fn redact(secret: &str) -> String {
    if secret.len() <= 6 {
        return "…".to_string();
    }
    let prefix: String = secret.chars().take(6).collect();
    format!("{}…", prefix)
}

/// Read the `exp` claim out of a JWT-shaped access secret.
///
/// The signature is not verified; the server does that. The client only needs
/// to know when to renew.
pub fn decode_expiry(access_secret: &str) -> Result<DateTime<Utc>, TokenDecodeError> {
    let mut parts = access_secret.split('.');
    let (Some(_header), Some(claims), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenDecodeError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .map_err(|e| TokenDecodeError::Encoding(e.to_string()))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| TokenDecodeError::Claims(e.to_string()))?;

    let exp = match claims.get("exp") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or(TokenDecodeError::MissingExpiry)?;

    Utc.timestamp_opt(exp, 0)
        .single()
        .ok_or(TokenDecodeError::MissingExpiry)
}

/// The authenticated user, opaque to the core apart from a few common fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Everything else the server returned for the user
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Identity {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(_) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    /// Name used in logs
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .or_else(|| self.id.as_ref().map(|id| id.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SessionEndReason {
    /// The user logged out
    Logout,
    /// The refresh secret was rejected; forced logout
    RenewalFailed(String),
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEndReason::Logout => f.write_str("logged out"),
            SessionEndReason::RenewalFailed(reason) => write!(f, "renewal failed: {}", reason),
        }
    }
}

/// Build an unsigned JWT-shaped secret with the given expiry; used by tests
#[cfg(test)]
pub(crate) fn make_test_secret(subject: &str, expires_at: DateTime<Utc>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": subject, "exp": expires_at.timestamp() })
            .to_string()
            .as_bytes(),
    );
    format!("{}.{}.sig", header, claims)
}
