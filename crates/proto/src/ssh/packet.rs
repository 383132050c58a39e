//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac
//! ```
//!
//! # Framing modes
//!
//! | Mode | Length field | MAC / tag input |
//! |------|--------------|-----------------|
//! | plaintext | clear | none |
//! | CTR + MAC | encrypted | `seq ‖ plaintext packet` |
//! | CTR + `*-etm@openssh.com` | clear | `seq ‖ length ‖ ciphertext` |
//! | AES-GCM | clear, used as AAD | GCM tag |
//!
//! Sequence numbers are 32-bit, increment by one per packet per direction,
//! wrap at 2^32 and are never reset by a key exchange.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use tern_proto::ssh::packet::{PacketOpener, PacketSealer};
//!
//! let mut sealer = PacketSealer::new();
//! let mut opener = PacketOpener::new();
//!
//! let wire = sealer.seal(b"\x05payload").unwrap();
//! let mut buf = BytesMut::from(&wire[..]);
//! assert_eq!(opener.open(&mut buf).unwrap().unwrap(), b"\x05payload");
//! assert_eq!(opener.sequence(), 1);
//! ```

use crate::ssh::crypto::DirectionKeys;
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tern_platform::{TernError, TernResult};

/// Maximum `packet_length` accepted or produced (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Block size used before any cipher is installed.
const PLAIN_BLOCK_SIZE: usize = 8;

/// SSH binary packet without MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet padded for the unencrypted transport (8-byte blocks).
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"Hello, SSH!".to_vec());
    /// assert_eq!(packet.payload(), b"Hello, SSH!");
    /// assert_eq!(packet.to_bytes().len() % 8, 0);
    /// ```
    pub fn new(payload: Vec<u8>) -> Self {
        Self::aligned(payload, PLAIN_BLOCK_SIZE, false)
    }

    /// Creates a packet padded to `block_size`.
    ///
    /// When `length_in_clear` is set (AEAD and encrypt-then-MAC), the 4-byte
    /// length field is excluded from the alignment.
    pub fn aligned(payload: Vec<u8>, block_size: usize, length_in_clear: bool) -> Self {
        let header = if length_in_clear { 1 } else { 5 };
        let unpadded = header + payload.len();

        let mut padding_len = block_size - unpadded % block_size;
        if padding_len < MIN_PADDING_LEN as usize {
            padding_len += block_size;
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes to `packet_length ‖ padding_length ‖ payload ‖ padding`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses an unencrypted packet.
    ///
    /// # Errors
    ///
    /// Returns [`TernError::InvalidEncoding`] if:
    /// - Data is shorter than the header or the declared length
    /// - `packet_length` exceeds [`MAX_PACKET_SIZE`]
    /// - Padding is shorter than 4 bytes or longer than the packet
    ///
    /// # Example
    ///
    /// ```rust
    /// use tern_proto::ssh::Packet;
    ///
    /// let bytes = Packet::new(b"test".to_vec()).to_bytes();
    /// let parsed = Packet::from_bytes(&bytes).unwrap();
    /// assert_eq!(parsed.payload(), b"test");
    /// ```
    pub fn from_bytes(data: &[u8]) -> TernResult<Self> {
        if data.len() < 5 {
            return Err(TernError::InvalidEncoding(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        check_length(packet_length)?;

        if buf.len() < packet_length {
            return Err(TernError::InvalidEncoding(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let (payload, padding) = split_body(&buf[..packet_length])?;
        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

fn check_length(packet_length: usize) -> TernResult<()> {
    if packet_length > MAX_PACKET_SIZE {
        return Err(TernError::InvalidEncoding(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    if packet_length < 1 + MIN_PADDING_LEN as usize {
        return Err(TernError::InvalidEncoding(format!(
            "Packet too small: {} bytes",
            packet_length
        )));
    }
    Ok(())
}

fn check_alignment(packet_length: usize, block_size: usize, length_in_clear: bool) -> TernResult<()> {
    let aligned = if length_in_clear {
        packet_length
    } else {
        packet_length + 4
    };
    if aligned % block_size != 0 {
        return Err(TernError::InvalidEncoding(format!(
            "Packet length {} not aligned to block size {}",
            packet_length, block_size
        )));
    }
    Ok(())
}

/// Splits `padding_length ‖ payload ‖ padding` into payload and padding.
fn split_body(body: &[u8]) -> TernResult<(&[u8], &[u8])> {
    let padding_length = *body
        .first()
        .ok_or_else(|| TernError::InvalidEncoding("Empty packet body".to_string()))?
        as usize;

    if padding_length < MIN_PADDING_LEN as usize {
        return Err(TernError::InvalidEncoding(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if 1 + padding_length > body.len() {
        return Err(TernError::InvalidEncoding(format!(
            "Padding length {} exceeds packet length {}",
            padding_length,
            body.len()
        )));
    }

    let payload_end = body.len() - padding_length;
    Ok((&body[1..payload_end], &body[payload_end..]))
}

/// Outbound half of the packet protocol: frames, encrypts and MACs.
#[derive(Debug, Default)]
pub struct PacketSealer {
    keys: Option<DirectionKeys>,
    sequence: u32,
}

impl PacketSealer {
    /// Creates a sealer in plaintext mode with sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns whether keys are installed.
    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    /// Switches to new keys. The sequence number carries on.
    pub fn install(&mut self, keys: DirectionKeys) {
        self.keys = Some(keys);
    }

    /// Frames `payload` under the active keys and advances the sequence number.
    pub fn seal(&mut self, payload: &[u8]) -> TernResult<Vec<u8>> {
        // Worst case padding is 4 + block_size - 1 bytes.
        if 1 + payload.len() + MIN_PADDING_LEN as usize + 16 > MAX_PACKET_SIZE {
            return Err(TernError::Protocol(format!(
                "Payload too large: {} bytes",
                payload.len()
            )));
        }

        let sequence = self.sequence;
        let wire = match &mut self.keys {
            None => Packet::new(payload.to_vec()).to_bytes(),
            Some(keys) if keys.cipher.algorithm().is_aead() => {
                let block = keys.cipher.algorithm().block_size();
                let frame = Packet::aligned(payload.to_vec(), block, true).to_bytes();
                let mut body = frame[4..].to_vec();
                keys.cipher.seal(&frame[..4], &mut body)?;

                let mut wire = Vec::with_capacity(4 + body.len());
                wire.extend_from_slice(&frame[..4]);
                wire.extend_from_slice(&body);
                wire
            }
            Some(keys) => {
                let block = keys.cipher.algorithm().block_size();
                let etm = keys.is_etm();
                let mac_key = keys
                    .mac
                    .as_ref()
                    .ok_or_else(|| TernError::Protocol("Stream cipher without MAC".to_string()))?;

                let mut frame = Packet::aligned(payload.to_vec(), block, etm).to_bytes();
                let mac = if etm {
                    keys.cipher.apply_keystream(&mut frame[4..])?;
                    mac_key.compute(sequence, &[&frame])
                } else {
                    let mac = mac_key.compute(sequence, &[&frame]);
                    keys.cipher.apply_keystream(&mut frame)?;
                    mac
                };
                frame.extend_from_slice(&mac);
                frame
            }
        };

        self.sequence = sequence.wrapping_add(1);
        Ok(wire)
    }
}

/// Partially decrypted packet (encrypt-and-MAC mode only).
#[derive(Debug)]
struct PendingFrame {
    packet_length: usize,
    plaintext: Vec<u8>,
}

/// Inbound half of the packet protocol: deframes, verifies and decrypts.
#[derive(Debug, Default)]
pub struct PacketOpener {
    keys: Option<DirectionKeys>,
    sequence: u32,
    pending: Option<PendingFrame>,
}

impl PacketOpener {
    /// Creates an opener in plaintext mode with sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number expected on the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Returns whether keys are installed.
    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    /// Switches to new keys. Must be called between packets.
    pub fn install(&mut self, keys: DirectionKeys) {
        self.keys = Some(keys);
    }

    /// Extracts the next payload from `buf`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered; consumed bytes
    /// are removed from `buf`.
    ///
    /// # Errors
    ///
    /// - [`TernError::MacVerification`] if the MAC or GCM tag does not match
    /// - [`TernError::InvalidEncoding`] if the length or padding is malformed
    pub fn open(&mut self, buf: &mut BytesMut) -> TernResult<Option<Vec<u8>>> {
        let sequence = self.sequence;
        let payload = match &mut self.keys {
            None => {
                let Some(packet_length) = peek_length(buf)? else {
                    return Ok(None);
                };
                check_alignment(packet_length, PLAIN_BLOCK_SIZE, false)?;
                if buf.len() < 4 + packet_length {
                    return Ok(None);
                }
                let frame = buf.split_to(4 + packet_length);
                split_body(&frame[4..])?.0.to_vec()
            }
            Some(keys) if keys.cipher.algorithm().is_aead() => {
                let Some(packet_length) = peek_length(buf)? else {
                    return Ok(None);
                };
                let algorithm = keys.cipher.algorithm();
                check_alignment(packet_length, algorithm.block_size(), true)?;
                let total = 4 + packet_length + algorithm.tag_size();
                if buf.len() < total {
                    return Ok(None);
                }
                let frame = buf.split_to(total);
                let mut body = frame[4..].to_vec();
                if keys.cipher.open(&frame[..4], &mut body)?.is_none() {
                    return Err(TernError::MacVerification { sequence });
                }
                split_body(&body)?.0.to_vec()
            }
            Some(keys) if keys.is_etm() => {
                let Some(packet_length) = peek_length(buf)? else {
                    return Ok(None);
                };
                check_alignment(packet_length, keys.cipher.algorithm().block_size(), true)?;
                let mac_len = keys.trailer_len();
                let total = 4 + packet_length + mac_len;
                if buf.len() < total {
                    return Ok(None);
                }
                let frame = buf.split_to(total);
                let (packet, received) = frame.split_at(4 + packet_length);
                let verified = keys
                    .mac
                    .as_ref()
                    .is_some_and(|mac| mac.verify(sequence, &[packet], received));
                if !verified {
                    return Err(TernError::MacVerification { sequence });
                }
                let mut body = packet[4..].to_vec();
                keys.cipher.apply_keystream(&mut body)?;
                split_body(&body)?.0.to_vec()
            }
            Some(keys) => {
                let block = keys.cipher.algorithm().block_size();
                if self.pending.is_none() {
                    if buf.len() < block {
                        return Ok(None);
                    }
                    let mut first = buf.split_to(block).to_vec();
                    keys.cipher.apply_keystream(&mut first)?;
                    let packet_length =
                        u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
                    check_length(packet_length)?;
                    check_alignment(packet_length, block, false)?;
                    self.pending = Some(PendingFrame {
                        packet_length,
                        plaintext: first,
                    });
                }

                let Some(pending) = self.pending.as_mut() else {
                    return Ok(None);
                };
                let remaining = 4 + pending.packet_length - pending.plaintext.len();
                let mac_len = keys.trailer_len();
                if buf.len() < remaining + mac_len {
                    return Ok(None);
                }

                let mut rest = buf.split_to(remaining).to_vec();
                keys.cipher.apply_keystream(&mut rest)?;
                pending.plaintext.extend_from_slice(&rest);
                let received = buf.split_to(mac_len);

                let verified = keys
                    .mac
                    .as_ref()
                    .is_some_and(|mac| mac.verify(sequence, &[&pending.plaintext], &received));
                if !verified {
                    return Err(TernError::MacVerification { sequence });
                }
                let payload = split_body(&pending.plaintext[4..])?.0.to_vec();
                self.pending = None;
                payload
            }
        };

        self.sequence = sequence.wrapping_add(1);
        Ok(Some(payload))
    }
}

fn peek_length(buf: &BytesMut) -> TernResult<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let packet_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    check_length(packet_length)?;
    Ok(Some(packet_length))
}
