//! Error types for the potato relay
//!
//! Covers:
//! - Chain calls (reads, writes, confirmation waits, timeouts)
//! - Locker-open authorization
//! - Buyer lookups and mail delivery on the event side
//! - Event decoding, API requests and configuration

use ethers::types::{Address, H256};
use thiserror::Error;
use warp::http::StatusCode;

/// Result alias used across the library
pub type RelayResult<T> = Result<T, RelayError>;

/// Reasons a locker-open request is refused before anything is sent on-chain
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The claimed signer is not the buyer the contract has on record for the locker
    #[error("Locker {locker} not assigned to this address (assignee {assignee:?}, signer {signer:?})")]
    NotAssigned {
        locker: u8,
        assignee: Address,
        signer: Address,
    },

    /// The client hashed something other than the locker number the contract will hash
    #[error("Invalid message hash for locker {locker}: expected {expected:?}, received {received:?}")]
    HashMismatch {
        locker: u8,
        expected: H256,
        received: H256,
    },

    /// Recovery failed or produced an address other than the claimed signer
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
}

/// Every failure the relay can produce
#[derive(Error, Debug)]
pub enum RelayError {
    /// An on-chain read/write reverted, timed out or the node was unreachable
    #[error("Chain call `{operation}` failed: {reason}")]
    ChainCallFailed {
        operation: &'static str,
        reason: String,
    },

    /// Locker-open authorization failure
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// A lifecycle event for a buyer that never produced a Purchase in this process
    #[error("No buyer info recorded for {0:?}")]
    MissingBuyerInfo(Address),

    /// The mail relay refused or never acknowledged the message
    #[error("Failed to send mail: {0}")]
    MailSendFailed(String),

    /// A vendor-contract log whose topic0 matches none of the handled events
    #[error("Unknown vendor event with topic {0:?}")]
    UnknownEvent(Option<H256>),

    /// A known event whose payload could not be decoded
    #[error("Malformed vendor event: {0}")]
    MalformedEvent(String),

    /// Bad input on the HTTP API
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Shorthand for wrapping any displayable chain error
    pub fn chain(operation: &'static str, reason: impl std::fmt::Display) -> Self {
        RelayError::ChainCallFailed {
            operation,
            reason: reason.to_string(),
        }
    }

    /// HTTP status the API answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Verification(_) | RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::ChainCallFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::ChainCallFailed { .. } => "chain_call_failed",
            RelayError::Verification(VerificationError::NotAssigned { .. }) => "not_assigned",
            RelayError::Verification(VerificationError::HashMismatch { .. }) => "hash_mismatch",
            RelayError::Verification(VerificationError::InvalidSignature(_)) => "invalid_signature",
            RelayError::MissingBuyerInfo(_) => "missing_buyer_info",
            RelayError::MailSendFailed(_) => "mail_send_failed",
            RelayError::UnknownEvent(_) => "unknown_event",
            RelayError::MalformedEvent(_) => "malformed_event",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Config(_) => "config",
        }
    }
}

impl warp::reject::Reject for RelayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_errors_map_to_bad_request() {
        let err: RelayError = VerificationError::InvalidSignature("bad v".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "invalid_signature");

        let err: RelayError = VerificationError::NotAssigned {
            locker: 3,
            assignee: Address::zero(),
            signer: Address::repeat_byte(0xaa),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("not assigned"));
    }

    #[test]
    fn test_chain_error_maps_to_bad_gateway() {
        let err = RelayError::chain("reserveLocker", "execution reverted");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.to_string(), "Chain call `reserveLocker` failed: execution reverted");
    }

    #[test]
    fn test_other_errors_are_internal() {
        assert_eq!(
            RelayError::Config("missing key".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayError::MissingBuyerInfo(Address::zero()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
