//! Error types for tern

use std::fmt;

/// Unified error type for all tern operations.
///
/// Variants fall into two groups. Fatal errors (`Io`, `Protocol`, `Security`,
/// `Disconnected`, `Negotiation`) mean the transport can no longer be used.
/// Everything else is recoverable and leaves the session usable.
#[derive(Debug)]
pub enum TernError {
    /// I/O error on the underlying stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed or unexpected protocol data
    Protocol(String),

    /// Security failure (MAC mismatch, host key rejection, bad signature)
    Security(String),

    /// The peer sent SSH_MSG_DISCONNECT, or the stream closed
    Disconnected {
        /// Disconnect reason code (RFC 4253 Section 11.1)
        reason: u32,
        /// Human readable description sent by the peer
        description: String,
    },

    /// No algorithm in common for a mandatory negotiation category
    Negotiation {
        /// Negotiation category, e.g. "kex" or "cipher client->server"
        category: String,
        /// Disconnect reason code sent to the peer
        reason: u32,
    },

    /// Authentication failed; the caller may retry
    Auth(String),

    /// A channel could not be opened or a channel request was refused
    Channel(String),

    /// SFTP status other than SSH_FX_OK
    Sftp {
        /// SFTP status code
        code: u32,
        /// Diagnostic text sent by the server
        message: String,
    },

    /// SCP negative acknowledgement or malformed control line
    Scp(String),

    /// A soft timeout expired before the awaited data arrived
    Timeout,

    /// The session is not connected (never connected, disconnected, or dead)
    NotConnected,

    /// Not implemented
    NotImplemented(String),

    /// I/O error on a local file, such as the source of an upload
    LocalIo(std::io::Error),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl TernError {
    /// Returns true when the error leaves the transport unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TernError::Io(_)
                | TernError::Protocol(_)
                | TernError::Security(_)
                | TernError::Disconnected { .. }
                | TernError::Negotiation { .. }
        )
    }

    /// Returns true for the soft timeout signal.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TernError::Timeout)
    }
}

impl fmt::Display for TernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TernError::Io(e) => write!(f, "IO error: {}", e),
            TernError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TernError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TernError::Security(msg) => write!(f, "Security error: {}", msg),
            TernError::Disconnected {
                reason,
                description,
            } => write!(f, "Disconnected (reason {}): {}", reason, description),
            TernError::Negotiation { category, reason } => write!(
                f,
                "No common algorithm for {} (disconnect reason {})",
                category, reason
            ),
            TernError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            TernError::Channel(msg) => write!(f, "Channel error: {}", msg),
            TernError::Sftp { code, message } => {
                write!(f, "SFTP error (status {}): {}", code, message)
            }
            TernError::Scp(msg) => write!(f, "SCP error: {}", msg),
            TernError::Timeout => write!(f, "Operation timed out"),
            TernError::NotConnected => write!(f, "Session is not connected"),
            TernError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            TernError::LocalIo(e) => write!(f, "Local I/O error: {}", e),
            TernError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for TernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TernError::Io(e) | TernError::LocalIo(e) => Some(e),
            TernError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TernError {
    fn from(err: std::io::Error) -> Self {
        TernError::Io(err)
    }
}

/// Result type for tern operations
pub type TernResult<T> = Result<T, TernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TernError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = TernError::Sftp {
            code: 2,
            message: "No such file".to_string(),
        };
        assert_eq!(err.to_string(), "SFTP error (status 2): No such file");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TernError = io_err.into();
        assert!(matches!(err, TernError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TernError::Security("MAC mismatch".into()).is_fatal());
        assert!(TernError::Negotiation {
            category: "kex".into(),
            reason: 3
        }
        .is_fatal());
        assert!(!TernError::Auth("denied".into()).is_fatal());
        assert!(!TernError::Timeout.is_fatal());
        assert!(TernError::Timeout.is_timeout());
        assert!(!TernError::Channel("refused".into()).is_fatal());
    }

    #[test]
    fn test_local_io_is_not_fatal() {
        let err = TernError::LocalIo(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such directory",
        ));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Local I/O error: no such directory");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_result_type() {
        fn example() -> TernResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
