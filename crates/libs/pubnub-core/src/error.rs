use serde::{Deserialize, Serialize};
use std::io;

/// Errors returned by context, parser, engine and client operations.
///
/// Format and parse failures never leave a context half-updated: when one of
/// these comes back, every field the operation would have touched still holds
/// its previous value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PubnubError {
    #[error("reply buffer cannot grow to {requested} bytes (limit {limit})")]
    Allocation { requested: usize, limit: usize },

    #[error("request buffer full: {needed} bytes needed, {capacity} available")]
    BufferFull { needed: usize, capacity: usize },

    #[error("cannot encode {what}: {reason}")]
    Encoding { what: &'static str, reason: String },

    #[error("invalid response: {reason}")]
    InvalidResponse { reason: &'static str },

    #[error("publish failed: {description}")]
    PublishFailed { description: String },

    #[error("initialization failed: {reason}")]
    Init { reason: String },

    #[error("i/o error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("operation '{operation}' not legal while {state}")]
    InvalidState { operation: &'static str, state: &'static str },

    #[error("transaction cancelled")]
    Cancelled,
}

impl PubnubError {
    /// Returns `true` for transient errors that may succeed on retry.
    ///
    /// Nothing in this crate retries on its own; this is for higher-level policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { kind, .. } => !matches!(
                kind,
                io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied
            ),
            Self::Allocation { .. } => true,
            _ => false,
        }
    }

    pub fn invalid_response(reason: &'static str) -> Self {
        Self::InvalidResponse { reason }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    pub fn init(reason: impl Into<String>) -> Self {
        Self::Init { reason: reason.into() }
    }
}

impl From<io::Error> for PubnubError {
    fn from(err: io::Error) -> Self {
        Self::Io { kind: err.kind(), message: err.to_string() }
    }
}

/// Outcome code of the most recent transaction on a context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransactionResult {
    /// No transaction has been started yet.
    #[default]
    Idle,
    Started,
    Ok,
    Timeout,
    Cancelled,
    IoError,
    ConnectionClosed,
    InvalidResponse,
    PublishFailed,
    FormatFailed,
    AllocationFailed,
    InvalidArgument,
}

impl TransactionResult {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::IoError => "io_error",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidResponse => "invalid_response",
            Self::PublishFailed => "publish_failed",
            Self::FormatFailed => "format_failed",
            Self::AllocationFailed => "allocation_failed",
            Self::InvalidArgument => "invalid_argument",
        }
    }

    /// `true` once the transaction has reached a final outcome.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Idle | Self::Started)
    }
}

impl From<&PubnubError> for TransactionResult {
    fn from(err: &PubnubError) -> Self {
        match err {
            PubnubError::Allocation { .. } => Self::AllocationFailed,
            PubnubError::BufferFull { .. } | PubnubError::Encoding { .. } => Self::FormatFailed,
            PubnubError::InvalidResponse { .. } => Self::InvalidResponse,
            PubnubError::PublishFailed { .. } => Self::PublishFailed,
            PubnubError::Cancelled => Self::Cancelled,
            PubnubError::Io { kind: io::ErrorKind::TimedOut, .. } => Self::Timeout,
            PubnubError::Io { kind: io::ErrorKind::UnexpectedEof, .. } => Self::ConnectionClosed,
            PubnubError::Io { .. } | PubnubError::Init { .. } => Self::IoError,
            PubnubError::Config { .. }
            | PubnubError::InvalidArgument { .. }
            | PubnubError::InvalidState { .. } => Self::InvalidArgument,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_kind_and_map_to_transaction_codes() {
        let err = PubnubError::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_retryable());
        assert_eq!(TransactionResult::from(&err), TransactionResult::Timeout);

        let closed = PubnubError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(TransactionResult::from(&closed), TransactionResult::ConnectionClosed);
    }

    #[test]
    fn parse_and_format_errors_are_not_retryable() {
        assert!(!PubnubError::invalid_response("missing bracket").is_retryable());
        assert!(!PubnubError::BufferFull { needed: 10, capacity: 4 }.is_retryable());
        let failed = PubnubError::PublishFailed { description: "Invalid Key".to_owned() };
        assert_eq!(failed.to_string(), "publish failed: Invalid Key");
        assert_eq!(TransactionResult::from(&failed), TransactionResult::PublishFailed);
    }

    #[test]
    fn only_terminal_results_are_final() {
        assert!(!TransactionResult::Idle.is_final());
        assert!(!TransactionResult::Started.is_final());
        assert!(TransactionResult::Ok.is_final());
        assert!(TransactionResult::Cancelled.is_final());
        assert_eq!(TransactionResult::PublishFailed.as_str(), "publish_failed");
    }
}
