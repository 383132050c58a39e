//! Protocol implementations for the Tern SSH client stack.
//!
//! - **SSH** (Secure Shell) - RFC 4251-4254 client: transport with ECDH key
//!   exchange and rekeying, channel multiplexing, port forwarding
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::ec_point::{decode, Curve};
//!
//! // A peer's ECDH public key must be 0x04 || X || Y with fixed-width coordinates
//! let mut bytes = vec![0x04];
//! bytes.extend_from_slice(&[0x11; 64]);
//! let point = decode(&bytes, Curve::NistP256).unwrap();
//! assert_eq!(point.curve(), Curve::NistP256);
//!
//! assert!(decode(&bytes[..64], Curve::NistP256).is_err());
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`, RustCrypto)
//! - Constant-time MAC verification
//! - Secure memory handling with `zeroize`
//! - Fuzz targets for the packet and point decoders
//!
//! # References
//!
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 5656](https://datatracker.ietf.org/doc/html/rfc5656) - Elliptic Curve Algorithm Integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
