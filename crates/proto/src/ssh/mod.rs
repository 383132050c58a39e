//! SSH (Secure Shell) client protocol implementation.
//!
//! This module implements the client side of the SSH protocol according to
//! RFC 4251-4254, with ECDH key exchange per RFC 5656.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Codecs** ([`wire`], [`ec_point`], [`packet`]) - Wire primitives, SEC1 curve points, binary packets
//! 2. **Transport Layer** ([`transport`], [`connection_mgr`]) - Version exchange, key exchange, rekeying
//! 3. **Connection Layer** ([`connection`], [`multiplexer`], [`channel`]) - Channels, flow control, requests
//! 4. **Utilities** ([`stream_pump`], [`forwarding`], [`session`]) - Byte relays, port forwarding, keep-alive
//! 5. **Client API** ([`client`]) - Ties the layers together
//!
//! # Security Considerations
//!
//! - **Input Validation**: Packet parsing enforces size limits (max 35000 bytes)
//! - **Host Key Verification**: Every key exchange is checked by a [`HostKeyVerifier`]
//! - **Constant-Time Operations**: MAC comparison uses [`subtle`]
//! - **Memory Safety**: Session keys are zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: Pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec());
//! let bytes = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 5656](https://datatracker.ietf.org/doc/html/rfc5656) - Elliptic Curve Algorithm Integration

pub mod channel;
pub mod client;
pub mod connection;
pub mod connection_mgr;
pub mod crypto;
pub mod ec_point;
pub mod forwarding;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod multiplexer;
pub mod packet;
pub mod session;
pub mod stream_pump;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use channel::{Channel, ChannelOutput, ChannelReader, ChannelWriter, ExitStatus};
pub use client::{Authenticator, ExecOutput, NoneAuthenticator, SshClient, SshClientConfig};
pub use connection::{
    ChannelOpenFailureReason, ChannelRequestType, ChannelType, GlobalRequestType,
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
pub use connection_mgr::{PacketTransport, SshConnection};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use ec_point::{Curve, EcPoint};
pub use forwarding::{ForwardAddr, LocalForward, Parameters, RemoteForward};
pub use hostkey::{HostKeyAlgorithm, HostKeyVerifier, PinnedHostKeys, PublicHostKey};
pub use kex::{negotiate_algorithm, AlgorithmPreferences, KexInit, KexMethod, NegotiatedAlgorithms};
pub use message::MessageType;
pub use multiplexer::{Multiplexer, MultiplexerConfig};
pub use packet::Packet;
pub use stream_pump::{FlushPolicy, PumpConfig};
pub use transport::{RekeyReason, State, TransportConfig};
pub use version::Version;
