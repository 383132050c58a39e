//! SSH connection protocol messages (RFC 4254).
//!
//! Typed encode/decode for global requests (80-82) and channel messages
//! (90-100). Channel state lives in [`crate::ssh::multiplexer`]; this module
//! only knows the wire layout.
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::connection::{ChannelOpen, ChannelType};
//! use tern_proto::ssh::forwarding::Parameters;
//!
//! let open = ChannelOpen {
//!     channel_type: ChannelType::DirectTcpip(Parameters::new("127.0.0.1", 40000, "db", 5432)),
//!     sender_channel: 3,
//!     initial_window: 2 * 1024 * 1024,
//!     max_packet: 32 * 1024,
//! };
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed, open);
//! ```

use crate::ssh::forwarding::Parameters;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    expect_message, read_bool, read_bytes, read_string, read_u32, write_bool, write_bytes,
    write_string,
};
use bytes::{BufMut, BytesMut};
use std::fmt;
use tern_platform::{TernError, TernResult};

/// Default initial window advertised for new channels (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum data packet advertised for new channels (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Reads the recipient channel of any channel message (91-100).
pub fn recipient_channel(payload: &[u8]) -> TernResult<u32> {
    let mut offset = 1;
    read_u32(payload, &mut offset)
}

fn read_port(data: &[u8], offset: &mut usize) -> TernResult<u16> {
    let port = read_u32(data, offset)?;
    u16::try_from(port)
        .map_err(|_| TernError::InvalidEncoding(format!("Port {} out of range", port)))
}

fn write_endpoint(buf: &mut BytesMut, host: &str, port: u16) {
    write_string(buf, host);
    buf.put_u32(u32::from(port));
}

/// Channel type named in SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Session (exec, shell, subsystem).
    Session,
    /// Client-initiated TCP forward. The remote endpoint is the target the
    /// server connects to; the local endpoint is the originator.
    DirectTcpip(Parameters),
    /// Server-initiated TCP forward. The remote endpoint is the address the
    /// server accepted on; the local endpoint is the originator.
    ForwardedTcpip(Parameters),
    /// Any other type, answered with UNKNOWN_CHANNEL_TYPE.
    Other(String),
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip(_) => "direct-tcpip",
            ChannelType::ForwardedTcpip(_) => "forwarded-tcpip",
            ChannelType::Other(name) => name,
        }
    }

    /// Endpoint identity for TCP/IP channel types.
    pub fn parameters(&self) -> Option<&Parameters> {
        match self {
            ChannelType::DirectTcpip(p) | ChannelType::ForwardedTcpip(p) => Some(p),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and its type-specific data
    pub channel_type: ChannelType,
    /// Sender's channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window: u32,
    /// Maximum packet size
    pub max_packet: u32,
}

impl ChannelOpen {
    /// Serializes the message.
    ///
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);

        match &self.channel_type {
            ChannelType::DirectTcpip(p) | ChannelType::ForwardedTcpip(p) => {
                write_endpoint(&mut buf, p.remote_host(), p.remote_port());
                write_endpoint(&mut buf, p.local_host(), p.local_port());
            }
            ChannelType::Session | ChannelType::Other(_) => {}
        }
        buf.to_vec()
    }

    /// Parses the message.
    ///
    /// Unknown channel types parse as [`ChannelType::Other`] so the caller
    /// can refuse them politely.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::ChannelOpen as u8, "SSH_MSG_CHANNEL_OPEN")?;
        let mut offset = 1;
        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window = read_u32(data, &mut offset)?;
        let max_packet = read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" | "forwarded-tcpip" => {
                let remote_host = read_string(data, &mut offset)?;
                let remote_port = read_port(data, &mut offset)?;
                let local_host = read_string(data, &mut offset)?;
                let local_port = read_port(data, &mut offset)?;
                let params = Parameters::new(local_host, local_port, remote_host, remote_port);
                if type_name == "direct-tcpip" {
                    ChannelType::DirectTcpip(params)
                } else {
                    ChannelType::ForwardedTcpip(params)
                }
            }
            _ => ChannelType::Other(type_name),
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window,
            max_packet,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Channel number chosen by the confirming side
    pub sender_channel: u32,
    /// Initial window size of the confirming side
    pub initial_window: u32,
    /// Maximum packet size of the confirming side
    pub max_packet: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(
            data,
            MessageType::ChannelOpenConfirmation as u8,
            "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
        )?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            sender_channel: read_u32(data, &mut offset)?,
            initial_window: read_u32(data, &mut offset)?,
            max_packet: read_u32(data, &mut offset)?,
        })
    }
}

/// Reason codes of SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts a wire code.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Wire code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ChannelOpenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number of the side that sent the open
    pub recipient_channel: u32,
    /// Reason code; peers may send codes outside the standard four
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
}

impl ChannelOpenFailure {
    /// Builds a failure with the reason's default description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code: reason.code(),
            description: reason.to_string(),
        }
    }

    /// Typed reason, when the code is a standard one.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses the message. The language tag is ignored.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(
            data,
            MessageType::ChannelOpenFailure as u8,
            "SSH_MSG_CHANNEL_OPEN_FAILURE",
        )?;
        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
        })
    }

    /// Converts into the error reported to the opener.
    pub fn into_error(self) -> TernError {
        TernError::ChannelOpenFailure {
            reason_code: self.reason_code,
            description: self.description,
        }
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel
    pub recipient_channel: u32,
    /// Bytes added to the window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(
            data,
            MessageType::ChannelWindowAdjust as u8,
            "SSH_MSG_CHANNEL_WINDOW_ADJUST",
        )?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            bytes_to_add: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel
    pub recipient_channel: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(MessageType::ChannelData, self.recipient_channel, None, &self.data)
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::ChannelData as u8, "SSH_MSG_CHANNEL_DATA")?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel
    pub recipient_channel: u32,
    /// Data type code ([`EXTENDED_DATA_STDERR`] is the only one defined)
    pub data_type: u32,
    /// Data bytes
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(
            MessageType::ChannelExtendedData,
            self.recipient_channel,
            Some(self.data_type),
            &self.data,
        )
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(
            data,
            MessageType::ChannelExtendedData as u8,
            "SSH_MSG_CHANNEL_EXTENDED_DATA",
        )?;
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data_type: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

fn encode_data(msg: MessageType, channel: u32, data_type: Option<u32>, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(13 + data.len());
    buf.put_u8(msg as u8);
    buf.put_u32(channel);
    if let Some(code) = data_type {
        buf.put_u32(code);
    }
    write_bytes(&mut buf, data);
    buf.to_vec()
}

/// Messages that carry only a recipient channel: EOF, CLOSE, SUCCESS, FAILURE.
macro_rules! channel_signal {
    ($(#[$doc:meta])* $name:ident, $msg:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Recipient channel
            pub recipient_channel: u32,
        }

        impl $name {
            /// Serializes the message.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($msg as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Parses the message.
            pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
                expect_message(data, $msg as u8, $label)?;
                let mut offset = 1;
                Ok(Self {
                    recipient_channel: read_u32(data, &mut offset)?,
                })
            }
        }
    };
}

channel_signal!(
    /// SSH_MSG_CHANNEL_EOF: the sender will send no more data.
    ChannelEof,
    MessageType::ChannelEof,
    "SSH_MSG_CHANNEL_EOF"
);
channel_signal!(
    /// SSH_MSG_CHANNEL_CLOSE: one half of the two-phase close.
    ChannelClose,
    MessageType::ChannelClose,
    "SSH_MSG_CHANNEL_CLOSE"
);
channel_signal!(
    /// SSH_MSG_CHANNEL_SUCCESS.
    ChannelSuccess,
    MessageType::ChannelSuccess,
    "SSH_MSG_CHANNEL_SUCCESS"
);
channel_signal!(
    /// SSH_MSG_CHANNEL_FAILURE.
    ChannelFailure,
    MessageType::ChannelFailure,
    "SSH_MSG_CHANNEL_FAILURE"
);

/// Channel request type (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Set an environment variable
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Execute a command
    Exec {
        /// Command line
        command: String,
    },
    /// Start the user's shell
    Shell,
    /// Start a subsystem such as `sftp`
    Subsystem {
        /// Subsystem name
        name: String,
    },
    /// Remote command exit status
    ExitStatus {
        /// Exit code
        exit_status: u32,
    },
    /// Remote command killed by a signal
    ExitSignal {
        /// Signal name without the "SIG" prefix
        signal_name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message
        error_message: String,
    },
    /// Anything else; the type-specific data is kept raw.
    Other {
        /// Request name
        name: String,
        /// Raw request-specific bytes
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Env { .. } => "env",
            ChannelRequestType::Exec { .. } => "exec",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Subsystem { .. } => "subsystem",
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::ExitSignal { .. } => "exit-signal",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel
    pub recipient_channel: u32,
    /// Whether the sender expects SUCCESS/FAILURE
    pub want_reply: bool,
    /// Request and its data
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, self.request.name());
        write_bool(&mut buf, self.want_reply);

        match &self.request {
            ChannelRequestType::Env { name, value } => {
                write_string(&mut buf, name);
                write_string(&mut buf, value);
            }
            ChannelRequestType::Exec { command } => write_string(&mut buf, command),
            ChannelRequestType::Shell => {}
            ChannelRequestType::Subsystem { name } => write_string(&mut buf, name),
            ChannelRequestType::ExitStatus { exit_status } => buf.put_u32(*exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => {
                write_string(&mut buf, signal_name);
                write_bool(&mut buf, *core_dumped);
                write_string(&mut buf, error_message);
                write_string(&mut buf, "");
            }
            ChannelRequestType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::ChannelRequest as u8, "SSH_MSG_CHANNEL_REQUEST")?;
        let mut offset = 1;
        let recipient_channel = read_u32(data, &mut offset)?;
        let name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;

        let request = match name.as_str() {
            "env" => ChannelRequestType::Env {
                name: read_string(data, &mut offset)?,
                value: read_string(data, &mut offset)?,
            },
            "exec" => ChannelRequestType::Exec {
                command: read_string(data, &mut offset)?,
            },
            "shell" => ChannelRequestType::Shell,
            "subsystem" => ChannelRequestType::Subsystem {
                name: read_string(data, &mut offset)?,
            },
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: read_u32(data, &mut offset)?,
            },
            "exit-signal" => ChannelRequestType::ExitSignal {
                signal_name: read_string(data, &mut offset)?,
                core_dumped: read_bool(data, &mut offset)?,
                error_message: read_string(data, &mut offset)?,
            },
            _ => ChannelRequestType::Other {
                name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// Global request type (RFC 4254 Sections 4 and 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestType {
    /// Ask the server to listen and forward accepted connections back.
    TcpipForward {
        /// Address to bind on the server
        bind_host: String,
        /// Port to bind; 0 lets the server choose
        bind_port: u32,
    },
    /// Stop a previous `tcpip-forward`.
    CancelTcpipForward {
        /// Address that was bound
        bind_host: String,
        /// Port that was bound
        bind_port: u32,
    },
    /// Anything else.
    Other {
        /// Request name
        name: String,
        /// Raw request-specific bytes
        data: Vec<u8>,
    },
}

impl GlobalRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            GlobalRequestType::TcpipForward { .. } => "tcpip-forward",
            GlobalRequestType::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            GlobalRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Whether a reply is expected
    pub want_reply: bool,
    /// Request and its data
    pub request: GlobalRequestType,
}

impl GlobalRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, self.request.name());
        write_bool(&mut buf, self.want_reply);
        match &self.request {
            GlobalRequestType::TcpipForward {
                bind_host,
                bind_port,
            }
            | GlobalRequestType::CancelTcpipForward {
                bind_host,
                bind_port,
            } => {
                write_string(&mut buf, bind_host);
                buf.put_u32(*bind_port);
            }
            GlobalRequestType::Other { data, .. } => buf.put_slice(data),
        }
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::GlobalRequest as u8, "SSH_MSG_GLOBAL_REQUEST")?;
        let mut offset = 1;
        let name = read_string(data, &mut offset)?;
        let want_reply = read_bool(data, &mut offset)?;
        let request = match name.as_str() {
            "tcpip-forward" => GlobalRequestType::TcpipForward {
                bind_host: read_string(data, &mut offset)?,
                bind_port: read_u32(data, &mut offset)?,
            },
            "cancel-tcpip-forward" => GlobalRequestType::CancelTcpipForward {
                bind_host: read_string(data, &mut offset)?,
                bind_port: read_u32(data, &mut offset)?,
            },
            _ => GlobalRequestType::Other {
                name,
                data: data[offset..].to_vec(),
            },
        };
        Ok(Self {
            want_reply,
            request,
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS with its optional response data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestSuccess {
    /// Request-specific data (the bound port for `tcpip-forward` with port 0)
    pub data: Vec<u8>,
}

impl RequestSuccess {
    /// Port chosen by the server, if the response carries one.
    pub fn bound_port(&self) -> Option<u32> {
        let mut offset = 0;
        read_u32(&self.data, &mut offset).ok()
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(MessageType::RequestSuccess as u8);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::RequestSuccess as u8, "SSH_MSG_REQUEST_SUCCESS")?;
        Ok(Self {
            data: data[1..].to_vec(),
        })
    }
}
