//! Key agreement, exchange hash and key derivation (RFC 4253, RFC 5656, RFC 8731).
//!
//! This module implements:
//! - ecdh-sha2-nistp256/384/521 (RFC 5656), points carried by [`crate::ssh::ec_point`]
//! - curve25519-sha256 and curve25519-sha256@libssh.org (RFC 8731)
//! - diffie-hellman-group14-sha256 (RFC 8268) and diffie-hellman-group14-sha1
//!
//! # Security
//!
//! - DH Group14 rejects peer values outside `1 < f < p-1`
//! - ECDH peer points are decoded through the SEC 1 codec, then checked
//!   for curve membership by the agreement
//! - Private DH exponents are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use tern_proto::ssh::kex::KexMethod;
//! use tern_proto::ssh::kex_dh::KexAgreement;
//!
//! let client = KexAgreement::start(KexMethod::EcdhSha2Nistp256).unwrap();
//! let server = KexAgreement::start(KexMethod::EcdhSha2Nistp256).unwrap();
//!
//! let q_c = client.local_public();
//! let q_s = server.local_public();
//! assert_eq!(q_c.len(), 65);
//!
//! let k_client = client.finish(&q_s).unwrap();
//! let k_server = server.finish(&q_c).unwrap();
//! assert_eq!(k_client, k_server);
//! ```

use crate::ssh::crypto::{CipherAlgorithm, CompressionAlgorithm, DirectionKeys, MacAlgorithm};
use crate::ssh::ec_point::{self, Curve, EcPoint};
use crate::ssh::kex::KexMethod;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{encode_mpint, expect_message, read_bytes, read_mpint, write_bytes, write_mpint};
use bytes::{BufMut, BytesMut};
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use sha2::Digest;
use tern_platform::{TernError, TernResult};
use zeroize::{Zeroize, Zeroizing};

/// Hash function of a key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KexHash {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl KexHash {
    /// Output length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            KexHash::Sha1 => 20,
            KexHash::Sha256 => 32,
            KexHash::Sha384 => 48,
            KexHash::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn digest(&self, parts: &[&[u8]]) -> Vec<u8> {
        fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
            let mut hasher = D::new();
            for part in parts {
                hasher.update(part);
            }
            hasher.finalize().to_vec()
        }

        match self {
            KexHash::Sha1 => run::<sha1::Sha1>(parts),
            KexHash::Sha256 => run::<sha2::Sha256>(parts),
            KexHash::Sha384 => run::<sha2::Sha384>(parts),
            KexHash::Sha512 => run::<sha2::Sha512>(parts),
        }
    }
}

/// Diffie-Hellman Group 14 parameters (RFC 3526).
///
/// This is a 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// DH Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::parse_bytes(
            b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
              29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
              EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
              E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
              EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
              C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
              83655D23DCA3AD961C62F356208552BB9ED529077096966D\
              670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
              E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
              DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
              15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            16,
        )
        .expect("Group 14 prime is valid hex")
    });

    /// DH Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Diffie-Hellman Group 14 key exchange.
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// Public value e = g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh ephemeral exponent.
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};

        let mut rng = rand::thread_rng();

        // 1 < x < p-1
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let e = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: e.to_bytes_be(),
        }
    }

    /// Returns the public value as unsigned big-endian bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes `K = f^x mod p`.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::KeyExchangeFailed`] if `f` is not in `(1, p-1)`.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TernResult<Vec<u8>> {
        use num_bigint::BigUint;

        let f = BigUint::from_bytes_be(peer_public);
        let p_minus_one = dh_group14::P.clone() - 1u32;
        if f <= BigUint::from(1u32) || f >= p_minus_one {
            return Err(TernError::KeyExchangeFailed(
                "DH peer value out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(f.modpow(&x, &dh_group14::P).to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange.
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    pub fn new() -> TernResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| {
            TernError::KeyExchangeFailed("Failed to generate Curve25519 key".to_string())
        })?;

        let public_key = private_key.compute_public_key().map_err(|_| {
            TernError::KeyExchangeFailed("Failed to compute Curve25519 public key".to_string())
        })?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral key.
    pub fn compute_shared_secret(self, peer_public: &[u8]) -> TernResult<Vec<u8>> {
        if peer_public.len() != 32 {
            return Err(TernError::InvalidEncoding(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                peer_public.len()
            )));
        }
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| TernError::KeyExchangeFailed("Curve25519 key agreement failed".to_string()))
    }
}

enum EcdhSecret {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
    P521(p521::ecdh::EphemeralSecret),
}

/// NIST-curve ECDH key exchange (RFC 5656).
pub struct EcdhExchange {
    secret: EcdhSecret,
    public: EcPoint,
}

impl EcdhExchange {
    /// Generates a fresh ephemeral key pair on `curve`.
    pub fn new(curve: Curve) -> TernResult<Self> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let mut rng = rand::thread_rng();
        let (secret, encoded) = match curve {
            Curve::NistP256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut rng);
                let encoded = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P256(secret), encoded)
            }
            Curve::NistP384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut rng);
                let encoded = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P384(secret), encoded)
            }
            Curve::NistP521 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut rng);
                let encoded = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P521(secret), encoded)
            }
        };

        Ok(Self {
            secret,
            public: ec_point::decode(&encoded, curve)?,
        })
    }

    /// Curve in use.
    pub fn curve(&self) -> Curve {
        self.public.curve()
    }

    /// Our ephemeral public point.
    pub fn public_point(&self) -> &EcPoint {
        &self.public
    }

    /// Our ephemeral public key as a SEC 1 octet string (`Q_C`).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        ec_point::encode(&self.public)
    }

    /// Computes the shared secret from the peer's encoded point (`Q_S`).
    ///
    /// # Errors
    ///
    /// - [`TernError::InvalidEncoding`] if the octet string is malformed
    /// - [`TernError::KeyExchangeFailed`] if the point is not on the curve
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TernResult<Vec<u8>> {
        let curve = self.curve();
        let peer = ec_point::decode(peer_public, curve)?;
        let sec1 = ec_point::encode(&peer);
        let off_curve =
            || TernError::KeyExchangeFailed(format!("Peer point is not on {}", curve));

        let shared = match &self.secret {
            EcdhSecret::P256(secret) => {
                let key = p256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| off_curve())?;
                secret.diffie_hellman(&key).raw_secret_bytes().to_vec()
            }
            EcdhSecret::P384(secret) => {
                let key = p384::PublicKey::from_sec1_bytes(&sec1).map_err(|_| off_curve())?;
                secret.diffie_hellman(&key).raw_secret_bytes().to_vec()
            }
            EcdhSecret::P521(secret) => {
                let key = p521::PublicKey::from_sec1_bytes(&sec1).map_err(|_| off_curve())?;
                secret.diffie_hellman(&key).raw_secret_bytes().to_vec()
            }
        };
        Ok(shared)
    }
}

/// One side of a key agreement for any negotiated method.
pub enum KexAgreement {
    /// NIST ECDH
    Ecdh(EcdhExchange),
    /// Curve25519
    Curve25519(Curve25519Exchange),
    /// DH group 14
    Group14(DhGroup14Exchange),
}

impl KexAgreement {
    /// Generates the ephemeral key for `method`.
    pub fn start(method: KexMethod) -> TernResult<Self> {
        Ok(match method {
            KexMethod::EcdhSha2Nistp256 => Self::Ecdh(EcdhExchange::new(Curve::NistP256)?),
            KexMethod::EcdhSha2Nistp384 => Self::Ecdh(EcdhExchange::new(Curve::NistP384)?),
            KexMethod::EcdhSha2Nistp521 => Self::Ecdh(EcdhExchange::new(Curve::NistP521)?),
            KexMethod::Curve25519Sha256 | KexMethod::Curve25519Sha256Libssh => {
                Self::Curve25519(Curve25519Exchange::new()?)
            }
            KexMethod::DhGroup14Sha256 | KexMethod::DhGroup14Sha1 => {
                Self::Group14(DhGroup14Exchange::new())
            }
        })
    }

    /// Whether public values travel as `mpint` (DH) rather than `string`.
    pub fn uses_mpint(&self) -> bool {
        matches!(self, Self::Group14(_))
    }

    /// Our public value: SEC 1 point, raw X25519 key, or DH `e` magnitude.
    pub fn local_public(&self) -> Vec<u8> {
        match self {
            Self::Ecdh(ecdh) => ecdh.public_key_bytes(),
            Self::Curve25519(x) => x.public_key().to_vec(),
            Self::Group14(dh) => dh.public_key().to_vec(),
        }
    }

    /// Completes the agreement and returns the shared secret `K` magnitude.
    pub fn finish(self, peer_public: &[u8]) -> TernResult<Zeroizing<Vec<u8>>> {
        let shared = match self {
            Self::Ecdh(ecdh) => ecdh.compute_shared_secret(peer_public)?,
            Self::Curve25519(x) => x.compute_shared_secret(peer_public)?,
            Self::Group14(dh) => dh.compute_shared_secret(peer_public)?,
        };
        Ok(Zeroizing::new(shared))
    }
}

/// SSH_MSG_KEX_ECDH_INIT / SSH_MSG_KEXDH_INIT (30).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhInit {
    /// Client public value (`Q_C` or `e`)
    pub public: Vec<u8>,
}

impl KexdhInit {
    /// Serializes; `mpint` selects the DH encoding.
    pub fn to_bytes(&self, mpint: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhInit as u8);
        write_public(&mut buf, &self.public, mpint);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8], mpint: bool) -> TernResult<Self> {
        expect_message(data, MessageType::KexdhInit as u8, "SSH_MSG_KEX_ECDH_INIT")?;
        let mut offset = 1;
        Ok(Self {
            public: read_public(data, &mut offset, mpint)?,
        })
    }
}

/// SSH_MSG_KEX_ECDH_REPLY / SSH_MSG_KEXDH_REPLY (31).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexdhReply {
    /// Server host key blob `K_S`
    pub host_key: Vec<u8>,
    /// Server public value (`Q_S` or `f`)
    pub public: Vec<u8>,
    /// Signature blob over the exchange hash
    pub signature: Vec<u8>,
}

impl KexdhReply {
    /// Serializes; `mpint` selects the DH encoding.
    pub fn to_bytes(&self, mpint: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::KexdhReply as u8);
        write_bytes(&mut buf, &self.host_key);
        write_public(&mut buf, &self.public, mpint);
        write_bytes(&mut buf, &self.signature);
        buf.to_vec()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8], mpint: bool) -> TernResult<Self> {
        expect_message(data, MessageType::KexdhReply as u8, "SSH_MSG_KEX_ECDH_REPLY")?;
        let mut offset = 1;
        Ok(Self {
            host_key: read_bytes(data, &mut offset)?,
            public: read_public(data, &mut offset, mpint)?,
            signature: read_bytes(data, &mut offset)?,
        })
    }
}

fn write_public(buf: &mut BytesMut, public: &[u8], mpint: bool) {
    if mpint {
        write_mpint(buf, public);
    } else {
        write_bytes(buf, public);
    }
}

fn read_public(data: &[u8], offset: &mut usize, mpint: bool) -> TernResult<Vec<u8>> {
    if mpint {
        read_mpint(data, offset)
    } else {
        read_bytes(data, offset)
    }
}

/// Inputs of the exchange hash (RFC 4253 Section 8, RFC 5656 Section 4).
#[derive(Debug, Clone, Copy)]
pub struct ExchangeHashInput<'a> {
    /// Client identification string without CR LF (`V_C`)
    pub client_version: &'a str,
    /// Server identification string without CR LF (`V_S`)
    pub server_version: &'a str,
    /// Client KEXINIT payload (`I_C`)
    pub client_kexinit: &'a [u8],
    /// Server KEXINIT payload (`I_S`)
    pub server_kexinit: &'a [u8],
    /// Server host key blob (`K_S`)
    pub host_key: &'a [u8],
    /// Client public value (`Q_C` or `e`)
    pub client_public: &'a [u8],
    /// Server public value (`Q_S` or `f`)
    pub server_public: &'a [u8],
    /// Shared secret magnitude (`K`)
    pub shared_secret: &'a [u8],
    /// Encode public values as `mpint` (DH) instead of `string`
    pub public_as_mpint: bool,
}

/// Computes `H = HASH(V_C ‖ V_S ‖ I_C ‖ I_S ‖ K_S ‖ Q_C ‖ Q_S ‖ K)`.
pub fn exchange_hash(hash: KexHash, input: &ExchangeHashInput<'_>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, input.client_version.as_bytes());
    write_bytes(&mut buf, input.server_version.as_bytes());
    write_bytes(&mut buf, input.client_kexinit);
    write_bytes(&mut buf, input.server_kexinit);
    write_bytes(&mut buf, input.host_key);
    write_public(&mut buf, input.client_public, input.public_as_mpint);
    write_public(&mut buf, input.server_public, input.public_as_mpint);
    write_mpint(&mut buf, input.shared_secret);
    hash.digest(&[&buf[..]])
}

/// Derives one key (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// K2 = HASH(K || H || K1)
/// K3 = HASH(K || H || K1 || K2)
/// ```
///
/// `letter` is `A`..`F`: IVs, encryption keys and integrity keys, client to
/// server first.
///
/// ```rust
/// use tern_proto::ssh::kex_dh::{derive_key, KexHash};
///
/// let key = derive_key(KexHash::Sha256, &[0x42; 32], &[1; 32], &[2; 32], b'C', 64);
/// assert_eq!(key.len(), 64);
/// ```
pub fn derive_key(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Zeroizing<Vec<u8>> {
    let k = Zeroizing::new(encode_mpint(shared_secret));
    let mut key = Zeroizing::new(hash.digest(&[k.as_slice(), exchange_hash, &[letter], session_id]));

    while key.len() < key_length {
        let block = hash.digest(&[k.as_slice(), exchange_hash, key.as_slice()]);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

/// Derives the keys for one direction.
///
/// `letters` is `(iv, key, mac)`: `(b'A', b'C', b'E')` for client to server,
/// `(b'B', b'D', b'F')` for server to client.
#[allow(clippy::too_many_arguments)]
pub fn derive_direction_keys(
    hash: KexHash,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    letters: (u8, u8, u8),
    cipher: CipherAlgorithm,
    mac: Option<MacAlgorithm>,
    compression: CompressionAlgorithm,
) -> TernResult<DirectionKeys> {
    let derive = |letter, len| derive_key(hash, shared_secret, exchange_hash, session_id, letter, len);

    let iv = derive(letters.0, cipher.iv_size());
    let key = derive(letters.1, cipher.key_size());
    let mac_key = derive(letters.2, mac.map_or(0, |m| m.key_size()));

    DirectionKeys::new(cipher, mac, compression, &iv, &key, &mac_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_group14_key_exchange() {
        let client = DhGroup14Exchange::new();
        let server = DhGroup14Exchange::new();

        let client_secret = client.compute_shared_secret(server.public_key()).unwrap();
        let server_secret = server.compute_shared_secret(client.public_key()).unwrap();

        assert_eq!(client_secret, server_secret);
        assert!(!client_secret.is_empty());
    }

    #[test]
    fn test_dh_group14_rejects_out_of_range() {
        let exchange = DhGroup14Exchange::new();
        assert!(exchange.compute_shared_secret(&[1u8]).is_err());
        assert!(exchange.compute_shared_secret(&[]).is_err());

        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
    }

    #[test]
    fn test_curve25519_key_exchange() {
        let client = Curve25519Exchange::new().unwrap();
        let server = Curve25519Exchange::new().unwrap();

        let client_public = *client.public_key();
        let server_public = *server.public_key();

        let client_secret = client.compute_shared_secret(&server_public).unwrap();
        let server_secret = server.compute_shared_secret(&client_public).unwrap();

        assert_eq!(client_secret, server_secret);
        assert_eq!(client_secret.len(), 32);
    }

    #[test]
    fn test_curve25519_rejects_short_key() {
        let exchange = Curve25519Exchange::new().unwrap();
        assert!(matches!(
            exchange.compute_shared_secret(&[9u8; 31]),
            Err(TernError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_ecdh_all_curves_agree() {
        for curve in [Curve::NistP256, Curve::NistP384, Curve::NistP521] {
            let client = EcdhExchange::new(curve).unwrap();
            let server = EcdhExchange::new(curve).unwrap();

            let q_c = client.public_key_bytes();
            assert_eq!(q_c.len(), curve.encoded_len());
            assert_eq!(q_c[0], 0x04);

            let k1 = client.compute_shared_secret(&server.public_key_bytes()).unwrap();
            let k2 = server.compute_shared_secret(&q_c).unwrap();
            assert_eq!(k1, k2);
            assert_eq!(k1.len(), curve.element_size());
        }
    }

    #[test]
    fn test_ecdh_rejects_malformed_peer_point() {
        let client = EcdhExchange::new(Curve::NistP256).unwrap();

        let mut wrong_tag = client.public_key_bytes();
        wrong_tag[0] = 0x02;
        assert!(matches!(
            client.compute_shared_secret(&wrong_tag),
            Err(TernError::InvalidEncoding(_))
        ));

        assert!(matches!(
            client.compute_shared_secret(&[0x04; 10]),
            Err(TernError::InvalidEncoding(_))
        ));

        // Well framed but not on the curve.
        let mut off_curve = vec![0u8; 65];
        off_curve[0] = 0x04;
        off_curve[32] = 1;
        off_curve[64] = 1;
        assert!(matches!(
            client.compute_shared_secret(&off_curve),
            Err(TernError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn test_agreement_for_every_method() {
        for method in [
            KexMethod::EcdhSha2Nistp384,
            KexMethod::Curve25519Sha256Libssh,
            KexMethod::DhGroup14Sha1,
        ] {
            let client = KexAgreement::start(method).unwrap();
            let server = KexAgreement::start(method).unwrap();
            assert_eq!(client.uses_mpint(), method == KexMethod::DhGroup14Sha1);

            let q_c = client.local_public();
            let q_s = server.local_public();
            assert_eq!(*client.finish(&q_s).unwrap(), *server.finish(&q_c).unwrap());
        }
    }

    #[test]
    fn test_kexdh_messages() {
        let init = KexdhInit {
            public: vec![0x80, 0x01],
        };
        let bytes = init.to_bytes(true);
        assert_eq!(&bytes[..8], &[30, 0, 0, 0, 3, 0, 0x80, 0x01]);
        assert_eq!(KexdhInit::from_bytes(&bytes, true).unwrap(), init);

        let reply = KexdhReply {
            host_key: vec![1, 2, 3],
            public: vec![4; 65],
            signature: vec![5; 10],
        };
        let bytes = reply.to_bytes(false);
        assert_eq!(KexdhReply::from_bytes(&bytes, false).unwrap(), reply);
        assert!(KexdhReply::from_bytes(&bytes[..bytes.len() - 1], false).is_err());
    }

    #[test]
    fn test_exchange_hash_depends_on_encoding() {
        let input = ExchangeHashInput {
            client_version: "SSH-2.0-Tern_0.1.0",
            server_version: "SSH-2.0-OpenSSH_9.6",
            client_kexinit: &[20, 1],
            server_kexinit: &[20, 2],
            host_key: &[0, 0, 0, 1, 7],
            client_public: &[0x80],
            server_public: &[0x81],
            shared_secret: &[0x42; 32],
            public_as_mpint: false,
        };
        let h_string = exchange_hash(KexHash::Sha256, &input);
        let h_mpint = exchange_hash(
            KexHash::Sha256,
            &ExchangeHashInput {
                public_as_mpint: true,
                ..input
            },
        );
        assert_eq!(h_string.len(), 32);
        assert_ne!(h_string, h_mpint);
        assert_eq!(exchange_hash(KexHash::Sha512, &input).len(), 64);
    }

    #[test]
    fn test_derive_key() {
        let k = [0x42; 32];
        let h = [0x01; 32];
        let sid = [0x02; 32];

        let key_a = derive_key(KexHash::Sha256, &k, &h, &sid, b'A', 32);
        let key_c = derive_key(KexHash::Sha256, &k, &h, &sid, b'C', 32);
        assert_eq!(key_a.len(), 32);
        assert_ne!(*key_a, *key_c);

        // Extension blocks hash K || H || K1 || ... and keep the prefix.
        let long = derive_key(KexHash::Sha1, &k, &h, &sid, b'C', 64);
        let short = derive_key(KexHash::Sha1, &k, &h, &sid, b'C', 20);
        assert_eq!(long.len(), 64);
        assert_eq!(&long[..20], &short[..]);
        let k2 = KexHash::Sha1.digest(&[encode_mpint(&k).as_slice(), &h[..], short.as_slice()]);
        assert_eq!(&long[20..40], &k2[..]);
    }

    #[test]
    fn test_derive_direction_keys() {
        let keys = derive_direction_keys(
            KexHash::Sha256,
            &[0x42; 32],
            &[1; 32],
            &[1; 32],
            (b'A', b'C', b'E'),
            CipherAlgorithm::Aes256Ctr,
            Some(MacAlgorithm::HmacSha512),
            CompressionAlgorithm::None,
        )
        .unwrap();
        assert_eq!(keys.trailer_len(), 64);
    }
}
