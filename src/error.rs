//! Unified application error model and mapping helpers.
//! This module provides the common error enum used across the HTTP surface,
//! the reconciler and the store/provider adapters, along with helpers to map
//! each kind onto an HTTP status.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    /// Malformed or rejected user input (bad registration payload, zero transfer).
    UserInput { code: String, message: String },
    /// A username or profile the caller named does not exist.
    NotFound { code: String, message: String },
    /// Store-side uniqueness violation (username or referral code already taken).
    Conflict { code: String, message: String },
    /// Credential verification failed at the identity provider.
    Auth { code: String, message: String },
    /// The username-to-email resolution query failed at the store.
    Lookup { code: String, message: String },
    /// Profile insertion failed after the referral-code retry.
    ProfileCreation { code: String, message: String },
    Io { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::UserInput { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Auth { code, .. }
            | AppError::Lookup { code, .. }
            | AppError::ProfileCreation { code, .. }
            | AppError::Io { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::UserInput { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Auth { message, .. }
            | AppError::Lookup { message, .. }
            | AppError::ProfileCreation { message, .. }
            | AppError::Io { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn user(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::UserInput { code: code.into(), message: msg.into() } }
    pub fn not_found(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn auth(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Auth { code: code.into(), message: msg.into() } }
    pub fn lookup(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Lookup { code: code.into(), message: msg.into() } }
    pub fn profile_creation(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::ProfileCreation { code: code.into(), message: msg.into() } }
    pub fn io(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Io { code: code.into(), message: msg.into() } }
    pub fn internal(code: impl Into<String>, msg: impl Into<String>) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// True when the error is a store-side uniqueness collision; profile
    /// creation treats this as retryable, not as a defect.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict { .. })
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::UserInput { .. } => 400,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Auth { .. } => 401,
            AppError::Lookup { .. } => 502,
            AppError::ProfileCreation { .. } => 500,
            AppError::Io { .. } => 503,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as Internal unless downcasted elsewhere
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io { code: "io_error".into(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::user("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::not_found("username_not_found", "missing").http_status(), 404);
        assert_eq!(AppError::conflict("conflict", "dup").http_status(), 409);
        assert_eq!(AppError::auth("invalid_credentials", "no").http_status(), 401);
        assert_eq!(AppError::lookup("lookup_failed", "store down").http_status(), 502);
        assert_eq!(AppError::profile_creation("insert_failed", "dup code").http_status(), 500);
        assert_eq!(AppError::io("io", "io").http_status(), 503);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn conflict_is_retryable() {
        assert!(AppError::conflict("conflict", "username taken").is_conflict());
        assert!(!AppError::profile_creation("insert_failed", "gave up").is_conflict());
    }

    #[test]
    fn display_carries_code_and_message() {
        let e = AppError::auth("email_unconfirmed", "Email not confirmed");
        assert_eq!(e.to_string(), "email_unconfirmed: Email not confirmed");
    }
}
