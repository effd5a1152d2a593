//! Kiwoom WebSocket Login
//!
//! The feed authenticates twice with the same bearer token: once as an
//! `Authorization` header on the HTTP upgrade, then with a `LOGIN` frame
//! that the server acknowledges with a return code.
//!
//! # Login Flow
//!
//! 1. Open the WebSocket with `Authorization: Bearer <token>`
//! 2. Send `{"trnm":"LOGIN","token":"<token>"}`
//! 3. Receive `{"trnm":"LOGIN","return_code":0,...}` or a non-zero code
//!
//! Token issuance and refresh happen elsewhere; this module only carries
//! an already-valid token.

use std::time::Duration;

use thiserror::Error;

use crate::infrastructure::kiwoom::codec::{Ack, CodecError, KiwoomCodec};

// =============================================================================
// Constants
// =============================================================================

/// Default time allowed between sending `LOGIN` and receiving its ack.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Error Types
// =============================================================================

/// Login failures. Retrying with the same token cannot fix these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token was empty.
    #[error("access token must not be empty")]
    EmptyToken,

    /// Server rejected the login.
    #[error("login rejected (code {code:?}): {message}")]
    Rejected {
        /// Server return code; `None` when the ack carried none.
        code: Option<i64>,
        /// Server message.
        message: String,
    },
}

// =============================================================================
// Access Token
// =============================================================================

/// Bearer access token.
///
/// `Debug` and `Display` never print the token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wrap a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::EmptyToken`] if the token is empty or blank.
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(AuthError::EmptyToken);
        }
        Ok(Self(token))
    }

    /// Raw token value. Avoid logging it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl std::fmt::Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

// =============================================================================
// Login State
// =============================================================================

/// Where a connection is in the login exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginState {
    /// `LOGIN` not yet sent.
    #[default]
    NotStarted,
    /// `LOGIN` sent, waiting for the ack.
    Pending,
    /// Ack received with code 0.
    Authenticated,
    /// Ack received with a failure code.
    Rejected,
}

/// Tracks the login exchange for one connection.
#[derive(Debug)]
pub struct LoginHandler {
    token: AccessToken,
    state: LoginState,
}

impl LoginHandler {
    /// Create a handler for a fresh connection.
    #[must_use]
    pub const fn new(token: AccessToken) -> Self {
        Self {
            token,
            state: LoginState::NotStarted,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LoginState {
        self.state
    }

    /// Check if the login was acknowledged.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, LoginState::Authenticated)
    }

    /// Build the `LOGIN` frame and move to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be encoded.
    pub fn login_frame(&mut self, codec: &KiwoomCodec) -> Result<String, CodecError> {
        let frame = codec.encode_login(self.token.expose())?;
        self.state = LoginState::Pending;
        Ok(frame)
    }

    /// Apply the server's `LOGIN` ack.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Rejected`] unless the return code is `0`.
    pub fn on_ack(&mut self, ack: &Ack) -> Result<(), AuthError> {
        if ack.is_success() {
            self.state = LoginState::Authenticated;
            return Ok(());
        }

        self.state = LoginState::Rejected;
        Err(AuthError::Rejected {
            code: ack.code,
            message: ack.message.clone(),
        })
    }
}
