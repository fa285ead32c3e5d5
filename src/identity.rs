//! Device identity derived from the access token
//!
//! The token is a JWT issued to the device during registration. Its claims are
//! read without verifying the signature; the device service verifies the token
//! it receives as call metadata, so the token is carried unmodified.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("access token is not a JWT (expected three dot-separated parts)")]
    Malformed,
    #[error("access token payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("access token claims are invalid: {0}")]
    Claims(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Claims {
    device_id: Uuid,
    /// Project id travels in `sub`.
    sub: Uuid,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    project_name: Option<String>,
    #[serde(default)]
    app_url: Option<String>,
}

/// Immutable identity shared read-only by both uplink sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: Uuid,
    pub project_id: Uuid,
    pub device_name: Option<String>,
    pub project_name: Option<String>,
    pub app_url: Option<String>,
    access_token: String,
}

impl DeviceIdentity {
    /// Parse the claims of a device access token.
    pub fn from_access_token(token: &str) -> Result<Self, IdentityError> {
        let token = token.trim();
        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(IdentityError::Malformed);
        };

        let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        let claims: Claims = serde_json::from_slice(&decoded)?;

        Ok(Self {
            device_id: claims.device_id,
            project_id: claims.sub,
            device_name: claims.device_name,
            project_name: claims.project_name,
            app_url: claims.app_url,
            access_token: token.to_string(),
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Value of the `authorization` call metadata.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

// Never print the token itself.
impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("project_id", &self.project_id)
            .field("device_name", &self.device_name)
            .field("project_name", &self.project_name)
            .field("app_url", &self.app_url)
            .finish_non_exhaustive()
    }
}
