//! SSH key exchange negotiation (RFC 4253 Section 7).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT message
//! - SSH_MSG_NEWKEYS message
//! - Algorithm negotiation for every category
//!
//! The key agreement itself lives in [`crate::ssh::kex_dh`].
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports wins)
//! 3. Key exchange (DH, ECDH or Curve25519)
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Switch to the new keys
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"ecdh-sha2-nistp256".to_string()));
//!
//! let client = vec!["ecdh-sha2-nistp256".to_string(), "diffie-hellman-group14-sha1".to_string()];
//! let server = vec!["diffie-hellman-group14-sha1".to_string()];
//! assert_eq!(
//!     negotiate_algorithm("kex", &client, &server).unwrap(),
//!     "diffie-hellman-group14-sha1"
//! );
//!
//! assert_eq!(NewKeys::new().to_bytes(), vec![21]);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use crate::ssh::ec_point::Curve;
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexHash;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{expect_message, read_bool, read_name_list, read_u32, write_bool, write_name_list};
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use std::fmt;
use tern_platform::{TernError, TernResult};

/// Key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexMethod {
    /// ecdh-sha2-nistp256 (RFC 5656)
    EcdhSha2Nistp256,
    /// ecdh-sha2-nistp384 (RFC 5656)
    EcdhSha2Nistp384,
    /// ecdh-sha2-nistp521 (RFC 5656)
    EcdhSha2Nistp521,
    /// curve25519-sha256 (RFC 8731)
    Curve25519Sha256,
    /// curve25519-sha256@libssh.org, identical to curve25519-sha256
    Curve25519Sha256Libssh,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
    /// diffie-hellman-group14-sha1 (RFC 4253)
    DhGroup14Sha1,
}

impl KexMethod {
    /// Wire name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::EcdhSha2Nistp256 => "ecdh-sha2-nistp256",
            KexMethod::EcdhSha2Nistp384 => "ecdh-sha2-nistp384",
            KexMethod::EcdhSha2Nistp521 => "ecdh-sha2-nistp521",
            KexMethod::Curve25519Sha256 => "curve25519-sha256",
            KexMethod::Curve25519Sha256Libssh => "curve25519-sha256@libssh.org",
            KexMethod::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
            KexMethod::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ecdh-sha2-nistp256" => Some(KexMethod::EcdhSha2Nistp256),
            "ecdh-sha2-nistp384" => Some(KexMethod::EcdhSha2Nistp384),
            "ecdh-sha2-nistp521" => Some(KexMethod::EcdhSha2Nistp521),
            "curve25519-sha256" => Some(KexMethod::Curve25519Sha256),
            "curve25519-sha256@libssh.org" => Some(KexMethod::Curve25519Sha256Libssh),
            "diffie-hellman-group14-sha256" => Some(KexMethod::DhGroup14Sha256),
            "diffie-hellman-group14-sha1" => Some(KexMethod::DhGroup14Sha1),
            _ => None,
        }
    }

    /// Hash used for the exchange hash and key derivation.
    pub fn hash(&self) -> KexHash {
        match self {
            KexMethod::EcdhSha2Nistp256
            | KexMethod::Curve25519Sha256
            | KexMethod::Curve25519Sha256Libssh
            | KexMethod::DhGroup14Sha256 => KexHash::Sha256,
            KexMethod::EcdhSha2Nistp384 => KexHash::Sha384,
            KexMethod::EcdhSha2Nistp521 => KexHash::Sha512,
            KexMethod::DhGroup14Sha1 => KexHash::Sha1,
        }
    }

    /// Curve for the NIST ECDH methods.
    pub fn curve(&self) -> Option<Curve> {
        match self {
            KexMethod::EcdhSha2Nistp256 => Some(Curve::NistP256),
            KexMethod::EcdhSha2Nistp384 => Some(Curve::NistP384),
            KexMethod::EcdhSha2Nistp521 => Some(Curve::NistP521),
            _ => None,
        }
    }
}

impl fmt::Display for KexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Preference-ordered algorithm lists announced in KEXINIT.
///
/// The same cipher, MAC and compression lists are used for both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange methods
    pub kex: Vec<String>,
    /// Host key algorithms
    pub host_key: Vec<String>,
    /// Ciphers
    pub cipher: Vec<String>,
    /// MACs
    pub mac: Vec<String>,
    /// Compression
    pub compression: Vec<String>,
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            kex: names(&[
                "curve25519-sha256",
                "curve25519-sha256@libssh.org",
                "ecdh-sha2-nistp256",
                "ecdh-sha2-nistp384",
                "ecdh-sha2-nistp521",
                "diffie-hellman-group14-sha256",
                "diffie-hellman-group14-sha1",
            ]),
            host_key: names(&[
                "ssh-ed25519",
                "ecdsa-sha2-nistp256",
                "ecdsa-sha2-nistp384",
                "ecdsa-sha2-nistp521",
                "rsa-sha2-512",
                "rsa-sha2-256",
            ]),
            cipher: names(&[
                "aes256-gcm@openssh.com",
                "aes128-gcm@openssh.com",
                "aes256-ctr",
                "aes128-ctr",
            ]),
            mac: names(&[
                "hmac-sha2-256-etm@openssh.com",
                "hmac-sha2-512-etm@openssh.com",
                "hmac-sha2-256",
                "hmac-sha2-512",
                "hmac-sha1",
            ]),
            compression: names(&["none"]),
        }
    }
}

impl AlgorithmPreferences {
    /// Checks that every list is non-empty and names only supported algorithms.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::Config`] naming the first offending entry.
    pub fn validate(&self) -> TernResult<()> {
        fn check(category: &str, list: &[String], known: impl Fn(&str) -> bool) -> TernResult<()> {
            if list.is_empty() {
                return Err(TernError::Config(format!("No {} algorithms configured", category)));
            }
            match list.iter().find(|name| !known(name)) {
                Some(name) => Err(TernError::Config(format!(
                    "Unsupported {} algorithm: {}",
                    category, name
                ))),
                None => Ok(()),
            }
        }

        check("kex", &self.kex, |n| KexMethod::from_name(n).is_some())?;
        check("host key", &self.host_key, |n| {
            HostKeyAlgorithm::from_name(n).is_some()
        })?;
        check("cipher", &self.cipher, |n| CipherAlgorithm::from_name(n).is_some())?;
        check("mac", &self.mac, |n| MacAlgorithm::from_name(n).is_some())?;
        check("compression", &self.compression, |n| {
            CompressionAlgorithm::from_name(n).is_some()
        })
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT with a fresh random cookie from `preferences`.
    pub fn new(preferences: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: preferences.kex.clone(),
            server_host_key_algorithms: preferences.host_key.clone(),
            encryption_algorithms_client_to_server: preferences.cipher.clone(),
            encryption_algorithms_server_to_client: preferences.cipher.clone(),
            mac_algorithms_client_to_server: preferences.mac.clone(),
            mac_algorithms_server_to_client: preferences.mac.clone(),
            compression_algorithms_client_to_server: preferences.compression.clone(),
            compression_algorithms_server_to_client: preferences.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT with the default preferences.
    ///
    /// ```rust
    /// use tern_proto::ssh::kex::KexInit;
    ///
    /// let kexinit = KexInit::new_default();
    /// assert_eq!(kexinit.cookie().len(), 16);
    /// ```
    pub fn new_default() -> Self {
        Self::new(&AlgorithmPreferences::default())
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns the compression algorithms (client to server).
    pub fn compression_algorithms_client_to_server(&self) -> &[String] {
        &self.compression_algorithms_client_to_server
    }

    /// Returns the compression algorithms (server to client).
    pub fn compression_algorithms_server_to_client(&self) -> &[String] {
        &self.compression_algorithms_server_to_client
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie (random bytes)
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms_client_to_server
    /// name-list    encryption_algorithms_server_to_client
    /// name-list    mac_algorithms_client_to_server
    /// name-list    mac_algorithms_server_to_client
    /// name-list    compression_algorithms_client_to_server
    /// name-list    compression_algorithms_server_to_client
    /// name-list    languages_client_to_server
    /// name-list    languages_server_to_client
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved for future extension)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::InvalidEncoding`] if the message type is wrong or
    /// any field is truncated.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh::kex::KexInit;
    ///
    /// let original = KexInit::new_default();
    /// let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();
    /// assert_eq!(parsed, original);
    /// ```
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::KexInit as u8, "SSH_MSG_KEXINIT")?;

        if data.len() < 17 {
            return Err(TernError::InvalidEncoding(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);

        let mut offset = 17;
        let kex_algorithms = read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = read_name_list(data, &mut offset)?;
        let languages_client_to_server = read_name_list(data, &mut offset)?;
        let languages_server_to_client = read_name_list(data, &mut offset)?;
        let first_kex_packet_follows = read_bool(data, &mut offset)?;
        read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// After both sides send and receive SSH_MSG_NEWKEYS, all packets in that
/// direction use the new keys. The packet sequence number is NOT reset.
///
/// ```rust
/// use tern_proto::ssh::kex::NewKeys;
///
/// let bytes = NewKeys::new().to_bytes();
/// assert_eq!(bytes, vec![21]);
/// assert_eq!(NewKeys::from_bytes(&bytes).unwrap(), NewKeys::new());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a new SSH_MSG_NEWKEYS message.
    pub const fn new() -> Self {
        Self
    }

    /// Serializes the message: a single byte 21.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        expect_message(data, MessageType::NewKeys as u8, "SSH_MSG_NEWKEYS")?;
        Ok(Self)
    }
}

/// Negotiates one algorithm category.
///
/// Uses the first algorithm in the client's list that also appears in the
/// server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`TernError::NoCommonAlgorithm`] if the lists do not intersect.
///
/// ```rust
/// use tern_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
/// assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(
    category: &str,
    client_list: &[String],
    server_list: &[String],
) -> TernResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| TernError::NoCommonAlgorithm {
            category: category.to_string(),
            client: client_list.to_vec(),
            server: server_list.to_vec(),
        })
}

fn negotiate_typed<T>(
    category: &str,
    client_list: &[String],
    server_list: &[String],
    parse: impl Fn(&str) -> Option<T>,
) -> TernResult<T> {
    let name = negotiate_algorithm(category, client_list, server_list)?;
    parse(&name).ok_or_else(|| {
        TernError::Config(format!("Unsupported {} algorithm: {}", category, name))
    })
}

/// The algorithm suite agreed by one key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method
    pub kex: KexMethod,
    /// Host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_c2s: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_s2c: CipherAlgorithm,
    /// MAC client to server (`None` with an AEAD cipher)
    pub mac_c2s: Option<MacAlgorithm>,
    /// MAC server to client (`None` with an AEAD cipher)
    pub mac_s2c: Option<MacAlgorithm>,
    /// Compression client to server
    pub compression_c2s: CompressionAlgorithm,
    /// Compression server to client
    pub compression_s2c: CompressionAlgorithm,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category of `client` against `server`.
    ///
    /// MACs are not negotiated for a direction whose cipher is AEAD.
    /// Languages are ignored.
    pub fn negotiate(client: &KexInit, server: &KexInit) -> TernResult<Self> {
        let kex = negotiate_typed(
            "kex",
            client.kex_algorithms(),
            server.kex_algorithms(),
            KexMethod::from_name,
        )?;
        let host_key = negotiate_typed(
            "host key",
            client.server_host_key_algorithms(),
            server.server_host_key_algorithms(),
            HostKeyAlgorithm::from_name,
        )?;
        let cipher_c2s = negotiate_typed(
            "cipher client to server",
            client.encryption_algorithms_client_to_server(),
            server.encryption_algorithms_client_to_server(),
            CipherAlgorithm::from_name,
        )?;
        let cipher_s2c = negotiate_typed(
            "cipher server to client",
            client.encryption_algorithms_server_to_client(),
            server.encryption_algorithms_server_to_client(),
            CipherAlgorithm::from_name,
        )?;

        let mac_c2s = if cipher_c2s.is_aead() {
            None
        } else {
            Some(negotiate_typed(
                "mac client to server",
                client.mac_algorithms_client_to_server(),
                server.mac_algorithms_client_to_server(),
                MacAlgorithm::from_name,
            )?)
        };
        let mac_s2c = if cipher_s2c.is_aead() {
            None
        } else {
            Some(negotiate_typed(
                "mac server to client",
                client.mac_algorithms_server_to_client(),
                server.mac_algorithms_server_to_client(),
                MacAlgorithm::from_name,
            )?)
        };

        let compression_c2s = negotiate_typed(
            "compression client to server",
            client.compression_algorithms_client_to_server(),
            server.compression_algorithms_client_to_server(),
            CompressionAlgorithm::from_name,
        )?;
        let compression_s2c = negotiate_typed(
            "compression server to client",
            client.compression_algorithms_server_to_client(),
            server.compression_algorithms_server_to_client(),
            CompressionAlgorithm::from_name,
        )?;

        Ok(Self {
            kex,
            host_key,
            cipher_c2s,
            cipher_s2c,
            mac_c2s,
            mac_s2c,
            compression_c2s,
            compression_s2c,
        })
    }
}

impl fmt::Display for NegotiatedAlgorithms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mac = |m: Option<MacAlgorithm>| m.map_or("<implicit>", |m| m.name());
        write!(
            f,
            "kex={} hostkey={} c2s={}/{}/{} s2c={}/{}/{}",
            self.kex,
            self.host_key,
            self.cipher_c2s.name(),
            mac(self.mac_c2s),
            self.compression_c2s.name(),
            self.cipher_s2c.name(),
            mac(self.mac_s2c),
            self.compression_s2c.name(),
        )
    }
}
