//! Symmetric algorithms for the SSH transport (RFC 4253 Section 6.3, 6.4).
//!
//! This module implements the ciphers and MACs the client negotiates:
//!
//! - **Ciphers**: aes128-ctr, aes256-ctr, aes128-gcm@openssh.com, aes256-gcm@openssh.com
//! - **MACs**: hmac-sha2-256, hmac-sha2-512, hmac-sha1 and the
//!   encrypt-then-MAC variants hmac-sha2-256-etm@openssh.com, hmac-sha2-512-etm@openssh.com
//! - **Compression**: none
//!
//! # Security
//!
//! - AES-GCM goes through `ring`; AES-CTR through the RustCrypto `aes` + `ctr` crates
//! - MAC comparison is constant-time
//! - Key material is zeroized on drop and redacted from `Debug`

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tern_platform::{TernError, TernResult};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Supported cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode
    Aes128Ctr,
    /// AES-256 in counter mode
    Aes256Ctr,
    /// AES-128-GCM (aes128-gcm@openssh.com)
    Aes128Gcm,
    /// AES-256-GCM (aes256-gcm@openssh.com)
    Aes256Gcm,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Gcm => 16,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Gcm => 32,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
        }
    }

    /// Returns the cipher block size used for packet alignment.
    pub fn block_size(&self) -> usize {
        16
    }

    /// Returns the authentication tag size (0 for non-AEAD).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns whether this is an AEAD cipher.
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm)
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            _ => None,
        }
    }
}

/// Supported MAC algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    /// HMAC-SHA1
    HmacSha1,
    /// HMAC-SHA-256
    HmacSha256,
    /// HMAC-SHA-512
    HmacSha512,
    /// HMAC-SHA-256, encrypt-then-MAC
    HmacSha256Etm,
    /// HMAC-SHA-512, encrypt-then-MAC
    HmacSha512Etm,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        self.mac_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
        }
    }

    /// Returns whether the MAC covers the ciphertext (encrypt-then-MAC).
    pub fn is_etm(&self) -> bool {
        matches!(self, MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm)
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha2-256-etm@openssh.com" => Some(MacAlgorithm::HmacSha256Etm),
            "hmac-sha2-512-etm@openssh.com" => Some(MacAlgorithm::HmacSha512Etm),
            _ => None,
        }
    }
}

/// Supported compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        "none"
    }

    /// Parses from algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            _ => None,
        }
    }
}

enum CipherInner {
    Aes128Ctr(Box<Aes128Ctr>),
    Aes256Ctr(Box<Aes256Ctr>),
    Gcm {
        key: LessSafeKey,
        fixed: [u8; 4],
        invocation: u64,
    },
}

/// Keyed cipher instance for one direction.
///
/// CTR ciphers keep their keystream position across packets; GCM keeps the
/// 64-bit invocation counter of the nonce (RFC 5647 Section 7.1).
pub struct CipherKey {
    algorithm: CipherAlgorithm,
    inner: CipherInner,
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CipherKey {
    /// Creates a cipher from derived key and IV material.
    ///
    /// Extra bytes beyond the algorithm's key and IV sizes are ignored.
    pub fn new(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> TernResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(TernError::KeyExchangeFailed(format!(
                "Insufficient key material for {}: key {} of {}, iv {} of {}",
                algorithm.name(),
                key.len(),
                algorithm.key_size(),
                iv.len(),
                algorithm.iv_size()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let inner = match algorithm {
            CipherAlgorithm::Aes128Ctr => CipherInner::Aes128Ctr(Box::new(
                Aes128Ctr::new_from_slices(key, iv)
                    .map_err(|_| TernError::KeyExchangeFailed("Invalid AES-128 key".to_string()))?,
            )),
            CipherAlgorithm::Aes256Ctr => CipherInner::Aes256Ctr(Box::new(
                Aes256Ctr::new_from_slices(key, iv)
                    .map_err(|_| TernError::KeyExchangeFailed("Invalid AES-256 key".to_string()))?,
            )),
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => {
                let aead = if algorithm == CipherAlgorithm::Aes128Gcm {
                    &AES_128_GCM
                } else {
                    &AES_256_GCM
                };
                let unbound = UnboundKey::new(aead, key).map_err(|_| {
                    TernError::KeyExchangeFailed(format!("Invalid {} key", algorithm.name()))
                })?;
                let mut fixed = [0u8; 4];
                fixed.copy_from_slice(&iv[..4]);
                let mut counter = [0u8; 8];
                counter.copy_from_slice(&iv[4..12]);
                CipherInner::Gcm {
                    key: LessSafeKey::new(unbound),
                    fixed,
                    invocation: u64::from_be_bytes(counter),
                }
            }
        };

        Ok(Self { algorithm, inner })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// XORs the keystream into `data` (CTR ciphers only).
    pub fn apply_keystream(&mut self, data: &mut [u8]) -> TernResult<()> {
        match &mut self.inner {
            CipherInner::Aes128Ctr(c) => c.apply_keystream(data),
            CipherInner::Aes256Ctr(c) => c.apply_keystream(data),
            CipherInner::Gcm { .. } => {
                return Err(TernError::Protocol(
                    "Keystream requested from an AEAD cipher".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Encrypts `data` in place and appends the tag (AEAD only).
    pub fn seal(&mut self, aad: &[u8], data: &mut Vec<u8>) -> TernResult<()> {
        let (key, nonce) = self.next_nonce()?;
        key.seal_in_place_append_tag(nonce, Aad::from(aad), data)
            .map_err(|_| TernError::Protocol("AEAD encryption failed".to_string()))
    }

    /// Verifies the trailing tag and decrypts in place (AEAD only).
    ///
    /// On success `data` is truncated to the plaintext. A bad tag is reported
    /// as `None` so the caller can raise a MAC error with the sequence number.
    pub fn open(&mut self, aad: &[u8], data: &mut Vec<u8>) -> TernResult<Option<()>> {
        let (key, nonce) = self.next_nonce()?;
        match key.open_in_place(nonce, Aad::from(aad), &mut data[..]) {
            Ok(plain) => {
                let len = plain.len();
                data.truncate(len);
                Ok(Some(()))
            }
            Err(_) => Ok(None),
        }
    }

    fn next_nonce(&mut self) -> TernResult<(&LessSafeKey, Nonce)> {
        match &mut self.inner {
            CipherInner::Gcm {
                key,
                fixed,
                invocation,
            } => {
                let mut nonce = [0u8; 12];
                nonce[..4].copy_from_slice(fixed);
                nonce[4..].copy_from_slice(&invocation.to_be_bytes());
                *invocation = invocation.wrapping_add(1);
                Ok((key, Nonce::assume_unique_for_key(nonce)))
            }
            _ => Err(TernError::Protocol(
                "AEAD operation requested from a stream cipher".to_string(),
            )),
        }
    }
}

/// MAC key for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl MacKey {
    /// Creates a new MAC key.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TernResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(TernError::KeyExchangeFailed(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: Zeroizing::new(key_material[..algorithm.key_size()].to_vec()),
        })
    }

    /// Computes `MAC(key, sequence || parts...)`.
    pub fn compute(&self, sequence: u32, parts: &[&[u8]]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha1 => hmac_digest::<Hmac<Sha1>>(&self.key, sequence, parts),
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                hmac_digest::<Hmac<Sha256>>(&self.key, sequence, parts)
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                hmac_digest::<Hmac<Sha512>>(&self.key, sequence, parts)
            }
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, sequence: u32, parts: &[&[u8]], received: &[u8]) -> bool {
        let computed = self.compute(sequence, parts);
        computed.len() == received.len() && bool::from(computed.ct_eq(received))
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

fn hmac_digest<M>(key: &[u8], sequence: u32, parts: &[&[u8]]) -> Vec<u8>
where
    M: Mac + hmac::digest::KeyInit,
{
    let mut mac = <M as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&sequence.to_be_bytes());
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Keys installed for one direction after NEWKEYS.
#[derive(Debug)]
pub struct DirectionKeys {
    /// Cipher instance
    pub cipher: CipherKey,
    /// MAC key; `None` for AEAD ciphers
    pub mac: Option<MacKey>,
    /// Compression in effect
    pub compression: CompressionAlgorithm,
}

impl DirectionKeys {
    /// Builds direction keys from derived material.
    ///
    /// The MAC is ignored when the cipher is AEAD.
    pub fn new(
        cipher: CipherAlgorithm,
        mac: Option<MacAlgorithm>,
        compression: CompressionAlgorithm,
        iv: &[u8],
        key: &[u8],
        mac_key: &[u8],
    ) -> TernResult<Self> {
        let mac = match (cipher.is_aead(), mac) {
            (true, _) => None,
            (false, Some(mac)) => Some(MacKey::new(mac, mac_key)?),
            (false, None) => {
                return Err(TernError::KeyExchangeFailed(format!(
                    "Cipher {} requires a MAC",
                    cipher.name()
                )))
            }
        };
        Ok(Self {
            cipher: CipherKey::new(cipher, key, iv)?,
            mac,
            compression,
        })
    }

    /// Returns whether the MAC covers the ciphertext with the length in clear.
    pub fn is_etm(&self) -> bool {
        self.mac.as_ref().is_some_and(|m| m.algorithm().is_etm())
    }

    /// Number of MAC or tag bytes trailing each packet.
    pub fn trailer_len(&self) -> usize {
        match &self.mac {
            Some(mac) => mac.algorithm().mac_size(),
            None => self.cipher.algorithm().tag_size(),
        }
    }
}
