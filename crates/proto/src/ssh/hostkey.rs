//! Server host keys (RFC 4253 Section 6.6, RFC 5656, RFC 8709, RFC 8332).
//!
//! The client only ever holds the server's *public* host key: it parses the
//! `K_S` blob from the key exchange reply, verifies the signature over the
//! exchange hash, and hands the key to a [`HostKeyVerifier`] which decides
//! whether the key is trusted for the host being contacted.
//!
//! # Supported Algorithms
//!
//! - `ssh-ed25519`
//! - `ecdsa-sha2-nistp256`, `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521`
//! - `rsa-sha2-256`, `rsa-sha2-512` (key blob type `ssh-rsa`)
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::hostkey::{HostKeyVerifier, PinnedHostKeys, PublicHostKey};
//!
//! # fn example(blob: &[u8]) -> tern_platform::TernResult<()> {
//! let key = PublicHostKey::parse(blob)?;
//! let pinned = PinnedHostKeys::new([key.fingerprint()]);
//! assert!(pinned.verify(&key, "example.com:22"));
//! # Ok(())
//! # }
//! ```

use crate::ssh::ec_point::Curve;
use crate::ssh::wire::{read_bytes, read_mpint, read_string};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use tern_platform::{TernError, TernResult};

/// Host key algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521
    EcdsaSha2Nistp521,
    /// rsa-sha2-256
    RsaSha2_256,
    /// rsa-sha2-512
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as specified in the RFCs
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaSha2Nistp384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaSha2Nistp521),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }

    /// Key blob type this signature algorithm works with.
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => "ssh-rsa",
            other => other.name(),
        }
    }
}

impl fmt::Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Eq)]
enum KeyMaterial {
    Ed25519([u8; 32]),
    Ecdsa { curve: Curve, point: Vec<u8> },
    Rsa { e: Vec<u8>, n: Vec<u8> },
}

/// A server public host key as received in `K_S`.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicHostKey {
    blob: Vec<u8>,
    material: KeyMaterial,
}

impl PublicHostKey {
    /// Parses an SSH public key blob.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::InvalidEncoding`] for truncated blobs and
    /// [`TernError::HostKeyVerification`] for unsupported key types.
    pub fn parse(blob: &[u8]) -> TernResult<Self> {
        let mut offset = 0;
        let key_type = read_string(blob, &mut offset)?;

        let material = match key_type.as_str() {
            "ssh-ed25519" => {
                let key = read_bytes(blob, &mut offset)?;
                let key: [u8; 32] = key.as_slice().try_into().map_err(|_| {
                    TernError::InvalidEncoding(format!(
                        "Ed25519 public key must be 32 bytes, got {}",
                        key.len()
                    ))
                })?;
                KeyMaterial::Ed25519(key)
            }
            "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" | "ecdsa-sha2-nistp521" => {
                let curve = match read_string(blob, &mut offset)?.as_str() {
                    "nistp256" => Curve::NistP256,
                    "nistp384" => Curve::NistP384,
                    "nistp521" => Curve::NistP521,
                    other => {
                        return Err(TernError::InvalidEncoding(format!(
                            "Unknown ECDSA curve: {}",
                            other
                        )))
                    }
                };
                if !key_type.ends_with(curve.ssh_name()) {
                    return Err(TernError::InvalidEncoding(format!(
                        "Curve {} does not match key type {}",
                        curve, key_type
                    )));
                }
                let point = read_bytes(blob, &mut offset)?;
                // Validates the SEC 1 framing.
                crate::ssh::ec_point::decode(&point, curve)?;
                KeyMaterial::Ecdsa { curve, point }
            }
            "ssh-rsa" => {
                let e = read_mpint(blob, &mut offset)?;
                let n = read_mpint(blob, &mut offset)?;
                KeyMaterial::Rsa { e, n }
            }
            other => {
                return Err(TernError::HostKeyVerification(format!(
                    "Unsupported host key type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            blob: blob.to_vec(),
            material,
        })
    }

    /// Key blob type, e.g. `ssh-ed25519` or `ssh-rsa`.
    pub fn key_type(&self) -> &'static str {
        match &self.material {
            KeyMaterial::Ed25519(_) => "ssh-ed25519",
            KeyMaterial::Ecdsa { curve, .. } => match curve {
                Curve::NistP256 => "ecdsa-sha2-nistp256",
                Curve::NistP384 => "ecdsa-sha2-nistp384",
                Curve::NistP521 => "ecdsa-sha2-nistp521",
            },
            KeyMaterial::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Raw blob as received.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// OpenSSH-style fingerprint: `SHA256:` followed by unpadded base64.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }

    /// Verifies an SSH signature blob over `data`.
    ///
    /// The blob must be `string algorithm ‖ string signature` and the algorithm
    /// must be the negotiated one and match this key's type.
    pub fn verify(
        &self,
        algorithm: HostKeyAlgorithm,
        data: &[u8],
        signature_blob: &[u8],
    ) -> TernResult<bool> {
        if algorithm.key_type() != self.key_type() {
            return Err(TernError::KeyExchangeFailed(format!(
                "Host key type {} cannot produce {} signatures",
                self.key_type(),
                algorithm
            )));
        }

        let mut offset = 0;
        let sig_alg = read_string(signature_blob, &mut offset)?;
        if sig_alg != algorithm.name() {
            return Err(TernError::KeyExchangeFailed(format!(
                "Signature algorithm mismatch: expected {}, got {}",
                algorithm, sig_alg
            )));
        }
        let signature = read_bytes(signature_blob, &mut offset)?;

        match (&self.material, algorithm) {
            (KeyMaterial::Ed25519(key), _) => verify_ed25519(key, data, &signature),
            (KeyMaterial::Ecdsa { curve, point }, _) => {
                verify_ecdsa(*curve, point, data, &signature)
            }
            (KeyMaterial::Rsa { e, n }, HostKeyAlgorithm::RsaSha2_512) => Ok(verify_rsa(
                &ring::signature::RSA_PKCS1_2048_8192_SHA512,
                e,
                n,
                data,
                &signature,
            )),
            (KeyMaterial::Rsa { e, n }, _) => Ok(verify_rsa(
                &ring::signature::RSA_PKCS1_2048_8192_SHA256,
                e,
                n,
                data,
                &signature,
            )),
        }
    }
}

impl fmt::Debug for PublicHostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicHostKey")
            .field("type", &self.key_type())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

fn verify_ed25519(key: &[u8; 32], data: &[u8], signature: &[u8]) -> TernResult<bool> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let verifying_key = VerifyingKey::from_bytes(key)
        .map_err(|e| TernError::KeyExchangeFailed(format!("Invalid Ed25519 public key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| TernError::KeyExchangeFailed(format!("Invalid Ed25519 signature: {}", e)))?;

    Ok(verifying_key.verify(data, &signature).is_ok())
}

fn verify_ecdsa(curve: Curve, point: &[u8], data: &[u8], signature: &[u8]) -> TernResult<bool> {
    use signature::Verifier;

    // The SSH signature is `mpint r ‖ mpint s`; the RustCrypto types want r ‖ s
    // each left-padded to the scalar width.
    let mut offset = 0;
    let r = read_mpint(signature, &mut offset)?;
    let s = read_mpint(signature, &mut offset)?;
    let width = curve.element_size();
    if r.len() > width || s.len() > width {
        return Ok(false);
    }
    let mut fixed = vec![0u8; 2 * width];
    fixed[width - r.len()..width].copy_from_slice(&r);
    fixed[2 * width - s.len()..].copy_from_slice(&s);

    let invalid_key =
        |e: &dyn fmt::Display| TernError::KeyExchangeFailed(format!("Invalid {} public key: {}", curve, e));

    Ok(match curve {
        Curve::NistP256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| invalid_key(&e))?;
            match p256::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        Curve::NistP384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| invalid_key(&e))?;
            match p384::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
        Curve::NistP521 => {
            let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(|e| invalid_key(&e))?;
            match p521::ecdsa::Signature::from_slice(&fixed) {
                Ok(sig) => key.verify(data, &sig).is_ok(),
                Err(_) => false,
            }
        }
    })
}

fn verify_rsa(
    params: &'static ring::signature::RsaParameters,
    e: &[u8],
    n: &[u8],
    data: &[u8],
    signature: &[u8],
) -> bool {
    let key = ring::signature::RsaPublicKeyComponents { n, e };
    key.verify(params, data, signature).is_ok()
}

/// Host key trust policy.
///
/// `identity` names the endpoint being contacted (usually `host:port`).
/// Returning `false` aborts the key exchange with
/// [`TernError::HostKeyVerification`].
pub trait HostKeyVerifier: Send + Sync {
    /// Decides whether `host_key` is trusted for `identity`.
    fn verify(&self, host_key: &PublicHostKey, identity: &str) -> bool;
}

impl<F> HostKeyVerifier for F
where
    F: Fn(&PublicHostKey, &str) -> bool + Send + Sync,
{
    fn verify(&self, host_key: &PublicHostKey, identity: &str) -> bool {
        self(host_key, identity)
    }
}

/// Accepts only keys whose fingerprint was pinned in advance.
#[derive(Debug, Clone, Default)]
pub struct PinnedHostKeys {
    fingerprints: HashSet<String>,
}

impl PinnedHostKeys {
    /// Creates a pin set from `SHA256:...` fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds a fingerprint.
    pub fn pin(&mut self, fingerprint: impl Into<String>) {
        self.fingerprints.insert(fingerprint.into());
    }
}

impl HostKeyVerifier for PinnedHostKeys {
    fn verify(&self, host_key: &PublicHostKey, _identity: &str) -> bool {
        self.fingerprints.contains(&host_key.fingerprint())
    }
}
