//! SSH protocol message numbers (RFC 4250 Section 4.1).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service
//! - **Algorithm Negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **Connection Protocol** (80-127): Global requests and channels
//!
//! User authentication (50-79) belongs to the authentication collaborator
//! and is passed through untouched.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert_eq!(msg_type.to_string(), "SSH_MSG_KEXINIT(20)");
//! ```

macro_rules! message_types {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $name:literal,)*) => {
        /// SSH message types used by the client stack.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum MessageType {
            $($(#[$doc])* $variant = $value,)*
        }

        impl MessageType {
            /// Converts a byte to a message type.
            ///
            /// ```rust
            /// use tern_proto::ssh::message::MessageType;
            ///
            /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
            /// assert_eq!(MessageType::from_u8(255), None);
            /// ```
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// RFC 4250 symbolic name.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

message_types! {
    /// Terminates the connection.
    Disconnect = 1 => "SSH_MSG_DISCONNECT",
    /// Padding; also the keep-alive payload.
    Ignore = 2 => "SSH_MSG_IGNORE",
    /// Peer did not understand the packet with the given sequence number.
    Unimplemented = 3 => "SSH_MSG_UNIMPLEMENTED",
    /// Diagnostic text.
    Debug = 4 => "SSH_MSG_DEBUG",
    /// Asks for a service such as `ssh-userauth`.
    ServiceRequest = 5 => "SSH_MSG_SERVICE_REQUEST",
    /// Grants the requested service.
    ServiceAccept = 6 => "SSH_MSG_SERVICE_ACCEPT",
    /// Algorithm lists for negotiation.
    KexInit = 20 => "SSH_MSG_KEXINIT",
    /// Switches a direction to the freshly derived keys.
    NewKeys = 21 => "SSH_MSG_NEWKEYS",
    /// Ephemeral public key of the client. Group14, ECDH and Curve25519 share the number.
    KexdhInit = 30 => "SSH_MSG_KEX_ECDH_INIT",
    /// Host key, server ephemeral key and exchange hash signature.
    KexdhReply = 31 => "SSH_MSG_KEX_ECDH_REPLY",
    /// Connection-wide request such as `tcpip-forward`.
    GlobalRequest = 80 => "SSH_MSG_GLOBAL_REQUEST",
    /// Global request granted.
    RequestSuccess = 81 => "SSH_MSG_REQUEST_SUCCESS",
    /// Global request refused.
    RequestFailure = 82 => "SSH_MSG_REQUEST_FAILURE",
    /// Opens a channel.
    ChannelOpen = 90 => "SSH_MSG_CHANNEL_OPEN",
    /// Channel accepted.
    ChannelOpenConfirmation = 91 => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
    /// Channel refused.
    ChannelOpenFailure = 92 => "SSH_MSG_CHANNEL_OPEN_FAILURE",
    /// Grants more send window.
    ChannelWindowAdjust = 93 => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
    /// Ordinary channel bytes.
    ChannelData = 94 => "SSH_MSG_CHANNEL_DATA",
    /// Typed channel bytes; type 1 is stderr.
    ChannelExtendedData = 95 => "SSH_MSG_CHANNEL_EXTENDED_DATA",
    /// Sender will write no more.
    ChannelEof = 96 => "SSH_MSG_CHANNEL_EOF",
    /// First or second half of the close handshake.
    ChannelClose = 97 => "SSH_MSG_CHANNEL_CLOSE",
    /// Per-channel request such as `exec`.
    ChannelRequest = 98 => "SSH_MSG_CHANNEL_REQUEST",
    /// Channel request granted.
    ChannelSuccess = 99 => "SSH_MSG_CHANNEL_SUCCESS",
    /// Channel request refused.
    ChannelFailure = 100 => "SSH_MSG_CHANNEL_FAILURE",
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Returns true for message numbers allowed while a key exchange is in
/// flight (RFC 4253 Section 7.1): transport generic 1-4 and 20-49.
pub fn is_kex_message(byte: u8) -> bool {
    matches!(byte, 1..=4 | 20..=49)
}

/// SSH_MSG_DISCONNECT reason codes (RFC 4250 Section 4.2.2).
pub mod disconnect {
    /// Protocol error.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Key exchange failed.
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// MAC error.
    pub const MAC_ERROR: u32 = 5;
    /// Host key not verifiable.
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// Connection lost.
    pub const CONNECTION_LOST: u32 = 10;
    /// Disconnected by application.
    pub const BY_APPLICATION: u32 = 11;
}
