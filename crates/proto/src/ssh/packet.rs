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
//! # Constraints
//!
//! - `packet_length` counts neither itself nor the MAC
//! - padding is at least 4 bytes and filled from the CSPRNG
//! - `4 + packet_length` is a multiple of max(8, cipher block size)
//! - the whole packet (length field included) is at least 16 bytes
//!
//! With the classic cipher suites the MAC is computed over
//! `sequence_number || unencrypted packet` and the entire packet, length
//! field included, is then encrypted; the MAC trailer stays in the clear.

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};

/// Maximum accepted packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum total packet size in bytes.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes.
pub const MIN_PADDING_LEN: u8 = 4;

/// An SSH binary packet.
///
/// Holds the plaintext payload and padding; encryption and MAC handling
/// happen in the transport layer on the serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet for `payload`, padded for a cipher block size.
    ///
    /// The padding length is the smallest value >= 4 that makes
    /// `4 + 1 + payload + padding` a multiple of `max(8, block_size)`, and
    /// the padding bytes are drawn from the thread RNG.
    ///
    /// # Panics
    ///
    /// Panics if the padded packet would exceed [`MAX_PACKET_SIZE`].
    pub fn new(payload: Vec<u8>, block_size: usize) -> Self {
        let align = block_size.max(8);
        let unpadded_len = 4 + 1 + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % align != 0 {
            padding_len += 1;
        }

        let total = unpadded_len + padding_len;
        assert!(
            total <= MAX_PACKET_SIZE,
            "packet size {} exceeds maximum {}",
            total,
            MAX_PACKET_SIZE
        );

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Self { payload, padding }
    }

    /// The plaintext payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The padding bytes.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// First payload byte, the message type.
    pub fn message_byte(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }

    /// Serializes to the unencrypted wire layout (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses a decrypted packet (length field included, MAC excluded).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::MalformedPacket`] on any length or padding
    /// violation.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        if data.len() < 5 {
            return Err(SkiffError::MalformedPacket(format!(
                "packet header is {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SkiffError::MalformedPacket(format!(
                "packet length {} exceeds maximum {}",
                packet_length, MAX_PACKET_SIZE
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN as usize {
            return Err(SkiffError::MalformedPacket(format!(
                "packet length {} too small",
                packet_length
            )));
        }
        if buf.len() < packet_length {
            return Err(SkiffError::MalformedPacket(format!(
                "packet declares {} bytes, {} available",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        if padding_length < MIN_PADDING_LEN as usize {
            return Err(SkiffError::MalformedPacket(format!(
                "padding is {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }
        if packet_length < 1 + padding_length {
            return Err(SkiffError::MalformedPacket(format!(
                "padding {} longer than packet {}",
                padding_length, packet_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf[..padding_length].to_vec();

        Ok(Self { payload, padding })
    }
}
