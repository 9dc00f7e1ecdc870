//! Error types for the acknowledgment subsystem
//!
//! Errors raised by collaborators (transport, hash oracle, render state) are
//! typed by cause so they can be classified into an [`AckErrorCode`] without
//! ever inspecting message text. Those codes drive the retry policy and are
//! what metrics and peer state record.

use crate::config::ConfigError;
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{AsRefStr, EnumIter};
use thiserror::Error;

/// Result type for subsystem operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Classification of a failed acknowledgment exchange.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum AckErrorCode {
    Timeout,
    NetworkError,
    InvalidData,
    UserNotFound,
    ServerError,
    RateLimited,
    AuthenticationFailed,
    DataCorrupted,
    InsufficientPermissions,
    ServiceUnavailable,
    HashVerificationFailed,
}

impl AckErrorCode {
    /// Codes the coordinator retries on its own with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AckErrorCode::Timeout | AckErrorCode::NetworkError)
    }

    /// Codes that are surfaced once to the user and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AckErrorCode::AuthenticationFailed
                | AckErrorCode::InsufficientPermissions
                | AckErrorCode::DataCorrupted
        )
    }
}

impl std::fmt::Display for AckErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Failure reported by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection to the sync server is down")]
    Disconnected,
    #[error("Payload rejected: {reason}")]
    Rejected { reason: String },
    #[error("Rate limited by the server")]
    RateLimited,
    #[error("Not authenticated")]
    Unauthorized,
    #[error("Missing permissions to send to {0}")]
    Forbidden(PeerId),
    #[error("Payload failed integrity checks")]
    Corrupted,
    #[error("Service unavailable")]
    Unavailable,
    #[error("Unknown recipient {0}")]
    UnknownRecipient(PeerId),
    #[error("Hash {hash} could not be verified for {owner}")]
    HashMismatch { owner: PeerId, hash: String },
    #[error("Server error: {0}")]
    Server(String),
}

impl TransportError {
    /// Maps the failure cause onto the acknowledgment taxonomy.
    pub fn code(&self) -> AckErrorCode {
        match self {
            TransportError::Timeout(_) => AckErrorCode::Timeout,
            TransportError::Disconnected => AckErrorCode::NetworkError,
            TransportError::Rejected { .. } => AckErrorCode::InvalidData,
            TransportError::RateLimited => AckErrorCode::RateLimited,
            TransportError::Unauthorized => AckErrorCode::AuthenticationFailed,
            TransportError::Forbidden(_) => AckErrorCode::InsufficientPermissions,
            TransportError::Corrupted => AckErrorCode::DataCorrupted,
            TransportError::Unavailable => AckErrorCode::ServiceUnavailable,
            TransportError::UnknownRecipient(_) => AckErrorCode::UserNotFound,
            TransportError::HashMismatch { .. } => AckErrorCode::HashVerificationFailed,
            TransportError::Server(_) => AckErrorCode::ServerError,
        }
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Invalid state transition for {subject}: from {from} to {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("No snapshot has been published yet")]
    NoSnapshot,
    #[error("Subsystem is shutting down")]
    Shutdown,
}

impl SyncError {
    /// Classification used when the error ends an exchange.
    pub fn code(&self) -> AckErrorCode {
        match self {
            SyncError::Transport(e) => e.code(),
            SyncError::UnknownPeer(_) => AckErrorCode::UserNotFound,
            SyncError::Shutdown => AckErrorCode::ServiceUnavailable,
            SyncError::Config(_) | SyncError::InvalidTransition { .. } | SyncError::NoSnapshot => {
                AckErrorCode::InvalidData
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn only_timeout_and_network_errors_retry() {
        let retryable: Vec<_> = AckErrorCode::iter().filter(|c| c.is_retryable()).collect();
        assert_eq!(
            retryable,
            vec![AckErrorCode::Timeout, AckErrorCode::NetworkError]
        );
    }

    #[test]
    fn terminal_codes_are_never_retryable() {
        for code in AckErrorCode::iter().filter(|c| c.is_terminal()) {
            assert!(!code.is_retryable(), "{code} must not retry");
        }
        assert!(AckErrorCode::DataCorrupted.is_terminal());
        assert!(!AckErrorCode::RateLimited.is_terminal());
    }

    #[test]
    fn classification_follows_the_cause() {
        let peer = PeerId::from("peer-a");
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).code(),
            AckErrorCode::Timeout
        );
        assert_eq!(TransportError::Disconnected.code(), AckErrorCode::NetworkError);
        assert_eq!(
            TransportError::Forbidden(peer.clone()).code(),
            AckErrorCode::InsufficientPermissions
        );
        assert_eq!(
            TransportError::UnknownRecipient(peer).code(),
            AckErrorCode::UserNotFound
        );
        // Message text has no influence on the code.
        assert_eq!(
            TransportError::Server("timeout while talking to db".into()).code(),
            AckErrorCode::ServerError
        );
    }

    #[test]
    fn code_display_is_snake_case() {
        assert_eq!(AckErrorCode::HashVerificationFailed.to_string(), "hash_verification_failed");
    }
}
