//! Error types for Tern

use std::fmt;

/// Unified error type for all Tern operations
#[derive(Debug)]
pub enum TernError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Peer violated the protocol (unexpected message, bad state, oversized data)
    Protocol(String),

    /// A negotiation category had no algorithm in common
    NoCommonAlgorithm {
        /// Negotiation category (e.g. "kex", "cipher c2s")
        category: String,
        /// Client preference list
        client: Vec<String>,
        /// Server preference list
        server: Vec<String>,
    },

    /// Key exchange failed (bad signature, agreement failure, rekey failure)
    KeyExchangeFailed(String),

    /// Host key rejected by the verification policy
    HostKeyVerification(String),

    /// Malformed data received from the wire
    InvalidEncoding(String),

    /// A point does not belong to the curve it was built for
    InvalidPoint(String),

    /// MAC check failed on an inbound packet
    MacVerification {
        /// Inbound sequence number of the rejected packet
        sequence: u32,
    },

    /// Peer refused to open a channel
    ChannelOpenFailure {
        /// SSH_OPEN_* reason code
        reason_code: u32,
        /// Description sent by the peer
        description: String,
    },

    /// Peer answered a channel or global request with failure
    RequestFailed(String),

    /// Operation on a channel that is closed or closing
    ChannelClosed(u32),

    /// Operation did not complete in time
    Timeout(String),

    /// The transport is gone
    TransportClosed(String),

    /// Source ended before the requested number of bytes was copied
    PrematureEof {
        /// Bytes actually copied
        copied: u64,
        /// Bytes requested
        expected: u64,
    },
}

impl TernError {
    /// Returns true if the error must tear down the whole transport.
    ///
    /// Channel open failures, timeouts and stream pump errors stay local to
    /// the operation that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TernError::Protocol(_)
                | TernError::NoCommonAlgorithm { .. }
                | TernError::KeyExchangeFailed(_)
                | TernError::HostKeyVerification(_)
                | TernError::InvalidEncoding(_)
                | TernError::MacVerification { .. }
                | TernError::TransportClosed(_)
        )
    }
}

impl fmt::Display for TernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TernError::Io(e) => write!(f, "IO error: {}", e),
            TernError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TernError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TernError::NoCommonAlgorithm {
                category,
                client,
                server,
            } => write!(
                f,
                "No common {} algorithm: client={:?}, server={:?}",
                category, client, server
            ),
            TernError::KeyExchangeFailed(msg) => write!(f, "Key exchange failed: {}", msg),
            TernError::HostKeyVerification(msg) => {
                write!(f, "Host key verification failed: {}", msg)
            }
            TernError::InvalidEncoding(msg) => write!(f, "Invalid encoding: {}", msg),
            TernError::InvalidPoint(msg) => write!(f, "Invalid point: {}", msg),
            TernError::MacVerification { sequence } => {
                write!(f, "MAC verification failed for packet {}", sequence)
            }
            TernError::ChannelOpenFailure {
                reason_code,
                description,
            } => write!(
                f,
                "Channel open failed (reason {}): {}",
                reason_code, description
            ),
            TernError::RequestFailed(msg) => write!(f, "Request failed: {}", msg),
            TernError::ChannelClosed(id) => write!(f, "Channel {} is closed", id),
            TernError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            TernError::TransportClosed(msg) => write!(f, "Transport closed: {}", msg),
            TernError::PrematureEof { expected, .. } => write!(
                f,
                "Encountered EOF, could not transfer {} bytes",
                expected
            ),
        }
    }
}

impl std::error::Error for TernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TernError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TernError {
    fn from(err: std::io::Error) -> Self {
        TernError::Io(err)
    }
}

/// Result type for Tern operations
pub type TernResult<T> = Result<T, TernError>;
