//! Elliptic-curve point codec (SEC 1 Sections 2.3.3 and 2.3.4).
//!
//! ECDH key exchange (RFC 5656) carries ephemeral public keys as SEC 1
//! uncompressed octet strings:
//!
//! ```text
//! 0x04 || X || Y
//! ```
//!
//! where `X` and `Y` are big-endian, left-zero-padded to
//! `L = ceil(field_size_bits / 8)` bytes.
//!
//! Only affine points are supported; the point at infinity has no
//! representation here.
//!
//! # Example
//!
//! ```rust
//! use num_bigint::BigUint;
//! use tern_proto::ssh::ec_point::{decode, encode, Curve, EcPoint};
//!
//! let point = EcPoint::new(Curve::NistP256, BigUint::from(7u32), BigUint::from(9u32)).unwrap();
//! let bytes = encode(&point);
//! assert_eq!(bytes.len(), 65);
//! assert_eq!(bytes[0], 0x04);
//!
//! assert_eq!(decode(&bytes, Curve::NistP256).unwrap(), point);
//! ```

use num_bigint::BigUint;
use std::fmt;
use tern_platform::{TernError, TernResult};

/// Leading octet of an uncompressed point.
pub const UNCOMPRESSED_TAG: u8 = 0x04;

/// Curves the key exchange can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    /// NIST P-256 (secp256r1)
    NistP256,
    /// NIST P-384 (secp384r1)
    NistP384,
    /// NIST P-521 (secp521r1)
    NistP521,
}

impl Curve {
    /// Field size in bits.
    pub fn field_size_bits(&self) -> usize {
        match self {
            Curve::NistP256 => 256,
            Curve::NistP384 => 384,
            Curve::NistP521 => 521,
        }
    }

    /// Width of one encoded coordinate in bytes.
    pub fn element_size(&self) -> usize {
        self.field_size_bits().div_ceil(8)
    }

    /// Length of an uncompressed encoding: `1 + 2 * L`.
    pub fn encoded_len(&self) -> usize {
        1 + 2 * self.element_size()
    }

    /// SSH curve identifier (RFC 5656 Section 10.1).
    pub fn ssh_name(&self) -> &'static str {
        match self {
            Curve::NistP256 => "nistp256",
            Curve::NistP384 => "nistp384",
            Curve::NistP521 => "nistp521",
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ssh_name())
    }
}

/// An affine point on a known curve.
///
/// Both coordinates are guaranteed to fit in the curve's element size, so
/// [`encode`] cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EcPoint {
    curve: Curve,
    x: BigUint,
    y: BigUint,
}

impl EcPoint {
    /// Builds a point from affine coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::InvalidPoint`] if either coordinate is wider than
    /// the curve's field.
    pub fn new(curve: Curve, x: BigUint, y: BigUint) -> TernResult<Self> {
        let max_bits = curve.field_size_bits() as u64;
        for (name, value) in [("x", &x), ("y", &y)] {
            if value.bits() > max_bits {
                return Err(TernError::InvalidPoint(format!(
                    "{} coordinate has {} bits, {} allows at most {}",
                    name,
                    value.bits(),
                    curve,
                    max_bits
                )));
            }
        }
        Ok(Self { curve, x, y })
    }

    /// Returns the curve.
    pub fn curve(&self) -> Curve {
        self.curve
    }

    /// Returns the affine x coordinate.
    pub fn x(&self) -> &BigUint {
        &self.x
    }

    /// Returns the affine y coordinate.
    pub fn y(&self) -> &BigUint {
        &self.y
    }
}

/// Encodes a point as a SEC 1 uncompressed octet string.
pub fn encode(point: &EcPoint) -> Vec<u8> {
    let size = point.curve.element_size();
    let mut out = vec![0u8; point.curve.encoded_len()];
    out[0] = UNCOMPRESSED_TAG;
    put_element(&mut out[1..1 + size], &point.x);
    put_element(&mut out[1 + size..], &point.y);
    out
}

/// Decodes a SEC 1 uncompressed octet string received from the peer.
///
/// Only the framing is checked; curve membership is enforced by the key
/// agreement that consumes the point.
///
/// # Errors
///
/// Returns [`TernError::InvalidEncoding`] if the length is not `1 + 2 * L`
/// or the leading byte is not `0x04`.
pub fn decode(bytes: &[u8], curve: Curve) -> TernResult<EcPoint> {
    let expected = curve.encoded_len();
    if bytes.len() != expected {
        return Err(TernError::InvalidEncoding(format!(
            "Invalid point length for {}: expected {} bytes, got {}",
            curve,
            expected,
            bytes.len()
        )));
    }
    if bytes[0] != UNCOMPRESSED_TAG {
        return Err(TernError::InvalidEncoding(format!(
            "Invalid point tag for {}: expected 0x04, got {:#04x}",
            curve, bytes[0]
        )));
    }

    let size = curve.element_size();
    let x = BigUint::from_bytes_be(&bytes[1..1 + size]);
    let y = BigUint::from_bytes_be(&bytes[1 + size..]);
    // Coordinates read from L bytes may still exceed the field for P-521.
    EcPoint::new(curve, x, y).map_err(|e| TernError::InvalidEncoding(e.to_string()))
}

fn put_element(dest: &mut [u8], value: &BigUint) {
    let bytes = value.to_bytes_be();
    // to_bytes_be has no leading zeros except for the value zero itself.
    let bytes = match bytes.iter().position(|&b| b != 0) {
        Some(start) => &bytes[start..],
        None => &[][..],
    };
    let offset = dest.len() - bytes.len();
    dest[offset..].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURVES: [Curve; 3] = [Curve::NistP256, Curve::NistP384, Curve::NistP521];

    #[test]
    fn test_element_sizes() {
        assert_eq!(Curve::NistP256.element_size(), 32);
        assert_eq!(Curve::NistP384.element_size(), 48);
        assert_eq!(Curve::NistP521.element_size(), 66);
        assert_eq!(Curve::NistP521.encoded_len(), 133);
    }

    #[test]
    fn test_round_trip_all_curves() {
        for curve in CURVES {
            let max = (BigUint::from(1u32) << curve.field_size_bits()) - 1u32;
            let samples = [
                (BigUint::from(0u32), BigUint::from(1u32)),
                (BigUint::from(0x0102u32), max.clone()),
                (max.clone(), BigUint::from(0xffu32)),
            ];
            for (x, y) in samples {
                let point = EcPoint::new(curve, x, y).unwrap();
                let bytes = encode(&point);
                assert_eq!(bytes.len(), curve.encoded_len());
                assert_eq!(decode(&bytes, curve).unwrap(), point);
            }
        }
    }

    #[test]
    fn test_small_coordinates_left_padded() {
        let point =
            EcPoint::new(Curve::NistP256, BigUint::from(0xabu32), BigUint::from(0xcdu32)).unwrap();
        let bytes = encode(&point);

        assert_eq!(bytes[0], 0x04);
        assert!(bytes[1..32].iter().all(|&b| b == 0));
        assert_eq!(bytes[32], 0xab);
        assert!(bytes[33..64].iter().all(|&b| b == 0));
        assert_eq!(bytes[64], 0xcd);
    }

    #[test]
    fn test_decode_wrong_length() {
        for curve in CURVES {
            let good = curve.encoded_len();
            for len in [0, 1, good - 1, good + 1, 2 * good] {
                let mut bytes = vec![0u8; len];
                if let Some(first) = bytes.first_mut() {
                    *first = 0x04;
                }
                assert!(matches!(
                    decode(&bytes, curve),
                    Err(TernError::InvalidEncoding(_))
                ));
            }
        }
    }

    #[test]
    fn test_decode_wrong_tag() {
        for curve in CURVES {
            for tag in [0x00, 0x02, 0x03, 0x05, 0xff] {
                let mut bytes = vec![0u8; curve.encoded_len()];
                bytes[0] = tag;
                assert!(matches!(
                    decode(&bytes, curve),
                    Err(TernError::InvalidEncoding(_))
                ));
            }
        }
    }

    #[test]
    fn test_decode_p521_coordinate_too_wide() {
        // 66 bytes hold 528 bits; anything above 521 is not a field element.
        let mut bytes = vec![0u8; Curve::NistP521.encoded_len()];
        bytes[0] = 0x04;
        bytes[1] = 0xff;
        assert!(matches!(
            decode(&bytes, Curve::NistP521),
            Err(TernError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_new_rejects_oversized_coordinate() {
        let too_big = BigUint::from(1u32) << 256;
        let result = EcPoint::new(Curve::NistP256, too_big, BigUint::from(1u32));
        assert!(matches!(result, Err(TernError::InvalidPoint(_))));
    }

    #[test]
    fn test_matches_p256_sec1_encoding() {
        use p256::elliptic_curve::sec1::ToEncodedPoint;

        let secret = p256::ecdh::EphemeralSecret::random(&mut rand::thread_rng());
        let public = p256::PublicKey::from(&secret);
        let sec1 = public.to_encoded_point(false);

        let point = decode(sec1.as_bytes(), Curve::NistP256).unwrap();
        assert_eq!(encode(&point), sec1.as_bytes());
    }
}
