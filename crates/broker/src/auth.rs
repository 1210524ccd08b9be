//! Auth headers for outbound broker and registry requests

use publisher_core::AuthError;

pub const AUTHORIZATION_HEADER: &str = "Authorization";

pub trait AuthSigner: Send + Sync {
    /// Headers to attach to an outbound handshake or request
    fn auth_headers(&self) -> Result<Vec<(String, String)>, AuthError>;
}

/// Sends the configured token as `Authorization: Basic <token>`.
/// The token is used as-is, it is expected to be pre-encoded.
#[derive(Debug, Clone, Default)]
pub struct BasicAuthSigner {
    token: String,
}

impl BasicAuthSigner {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthSigner for BasicAuthSigner {
    fn auth_headers(&self) -> Result<Vec<(String, String)>, AuthError> {
        if self.token.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![(
            AUTHORIZATION_HEADER.to_string(),
            format!("Basic {}", self.token),
        )])
    }
}
