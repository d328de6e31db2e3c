//! Error types and handling for LanSync
//!
//! Every fallible operation in the workspace returns [`Error`]. Variants are
//! grouped by [`ErrorKind`] and carry an [`ErrorSeverity`] so callers can
//! decide whether to skip a file, abort a connection or stop the node.

use std::path::PathBuf;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - retry on the next scheduled sync
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - the node cannot run
    Critical,
}

/// Main error type for LanSync operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path to the file with permission issues
        path: PathBuf,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Transport level failure (connect, read, write)
    #[error("Network error: {message}")]
    Network {
        /// Error message describing the network issue
        message: String,
    },

    /// Peer violated the wire protocol
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was malformed or unexpected
        message: String,
    },

    /// Received content does not match the advertised digest
    #[error("Integrity check failed for '{path}': expected {expected}, got {actual}")]
    Integrity {
        /// Relative path of the file
        path: String,
        /// Digest announced by the sender
        expected: String,
        /// Digest computed over the received bytes
        actual: String,
    },

    /// Compression error
    #[error("Compression error: {message}")]
    Compression {
        /// Error message describing the compression issue
        message: String,
    },

    /// A socket could not be bound
    #[error("Failed to bind {address}: {message}")]
    Bind {
        /// Address that was requested
        address: String,
        /// Underlying failure
        message: String,
    },

    /// Peer id is not in the directory
    #[error("Peer not found: {peer_id}")]
    PeerNotFound {
        /// Requested peer id
        peer_id: String,
    },

    /// Peer is known but not alive
    #[error("Peer {peer_id} is not available (state: {state})")]
    PeerUnavailable {
        /// Requested peer id
        peer_id: String,
        /// Current discovery state
        state: String,
    },

    /// Synchronization error
    #[error("Synchronization error: {message}")]
    Sync {
        /// Error message describing the synchronization issue
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out after {millis} ms")]
    Timeout {
        /// Elapsed milliseconds
        millis: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local I/O errors
    Io,
    /// Configuration errors
    Config,
    /// Transport errors
    Network,
    /// Wire protocol violations
    Protocol,
    /// Digest mismatches
    Integrity,
    /// Compression errors
    Compression,
    /// Socket binding
    Bind,
    /// Peer lookup failures
    Peer,
    /// Synchronization errors
    Sync,
    /// Cancellation
    Cancelled,
    /// Timeout
    Timeout,
    /// Other errors
    Other,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::FileNotFound { .. } | Self::PermissionDenied { .. } => {
                ErrorKind::Io
            }
            Self::Config { .. } => ErrorKind::Config,
            Self::Network { .. } => ErrorKind::Network,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Compression { .. } => ErrorKind::Compression,
            Self::Bind { .. } => ErrorKind::Bind,
            Self::PeerNotFound { .. } | Self::PeerUnavailable { .. } => ErrorKind::Peer,
            Self::Sync { .. } => ErrorKind::Sync,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { .. } => ErrorSeverity::Medium,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } => ErrorSeverity::High,
            Self::Config { .. } => ErrorSeverity::High,
            Self::Network { .. } => ErrorSeverity::Medium,
            Self::Protocol { .. } => ErrorSeverity::High,
            Self::Integrity { .. } => ErrorSeverity::Medium,
            Self::Compression { .. } => ErrorSeverity::Medium,
            Self::Bind { .. } => ErrorSeverity::Critical,
            Self::PeerNotFound { .. } | Self::PeerUnavailable { .. } => ErrorSeverity::Low,
            Self::Sync { .. } => ErrorSeverity::Medium,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Timeout { .. } => ErrorSeverity::Medium,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { message } => {
                message.contains("Interrupted")
                    || message.contains("WouldBlock")
                    || message.contains("timed out")
            }
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Integrity { .. }
            | Self::Compression { .. }
            | Self::PeerUnavailable { .. } => true,
            Self::Cancelled | Self::Bind { .. } | Self::Protocol { .. } => false,
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } | Self::Config { .. } => {
                false
            }
            Self::PeerNotFound { .. } | Self::Sync { .. } | Self::Other { .. } => true,
        }
    }

    /// Check if this error should trigger a retry on the next sync cycle
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && self.severity() <= ErrorSeverity::Medium
    }

    /// Whether the stream that produced this error can no longer be trusted.
    ///
    /// Framing and transport failures leave the connection at an unknown
    /// offset, so the remaining transfer queue has to be abandoned.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Protocol { .. } | Self::Timeout { .. } | Self::Cancelled
        )
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(message: S) -> Self {
        Self::Compression {
            message: message.into(),
        }
    }

    /// Create a new bind error
    pub fn bind<A: ToString, S: Into<String>>(address: A, message: S) -> Self {
        Self::Bind {
            address: address.to_string(),
            message: message.into(),
        }
    }

    /// Create a new sync error
    pub fn sync<S: Into<String>>(message: S) -> Self {
        Self::Sync {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_error_kind_mapping(message in ".*") {
            let errors = vec![
                (Error::io(message.clone()), ErrorKind::Io),
                (Error::config(message.clone()), ErrorKind::Config),
                (Error::network(message.clone()), ErrorKind::Network),
                (Error::protocol(message.clone()), ErrorKind::Protocol),
                (Error::compression(message.clone()), ErrorKind::Compression),
                (Error::sync(message.clone()), ErrorKind::Sync),
                (Error::other(message.clone()), ErrorKind::Other),
            ];

            for (error, kind) in errors {
                prop_assert_eq!(error.kind(), kind);
                if error.should_retry() {
                    prop_assert!(error.is_recoverable());
                    prop_assert!(error.severity() <= ErrorSeverity::Medium);
                }
            }
        }
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "notes.txt");
        let error = Error::from(io_error);

        assert_eq!(error.kind(), ErrorKind::Io);
        assert!(error.to_string().contains("notes.txt"));
        assert!(!error.is_connection_fatal());
    }

    #[test]
    fn test_integrity_error_is_retried() {
        let error = Error::Integrity {
            path: "a.bin".to_string(),
            expected: "00".to_string(),
            actual: "ff".to_string(),
        };

        assert_eq!(error.kind(), ErrorKind::Integrity);
        assert!(error.should_retry());
        assert!(!error.is_connection_fatal());
        assert!(error.to_string().contains("a.bin"));
    }

    #[test]
    fn test_bind_error_is_critical() {
        let error = Error::bind("0.0.0.0:42421", "address in use");

        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(!error.should_retry());
        assert!(error.to_string().contains("0.0.0.0:42421"));
    }

    #[test]
    fn test_connection_fatal_classification() {
        assert!(Error::protocol("bad magic").is_connection_fatal());
        assert!(Error::network("reset").is_connection_fatal());
        assert!(Error::Timeout { millis: 5 }.is_connection_fatal());
        assert!(!Error::compression("corrupt deflate stream").is_connection_fatal());
        assert!(!Error::io("disk full").is_connection_fatal());
    }

    #[test]
    fn test_peer_errors() {
        let missing = Error::PeerNotFound {
            peer_id: "abc".to_string(),
        };
        let stale = Error::PeerUnavailable {
            peer_id: "abc".to_string(),
            state: "stale".to_string(),
        };

        assert_eq!(missing.kind(), ErrorKind::Peer);
        assert_eq!(stale.kind(), ErrorKind::Peer);
        assert!(stale.to_string().contains("stale"));
    }
}
