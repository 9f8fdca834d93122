//! Wire-format definitions for RTP packets.
//!
//! Every unit exchanged over a [`crate::channel::PacketChannel`] is a
//! [`Packet`].  This module is responsible for:
//! - Defining the packet kinds and the per-packet [`checksum`].
//! - Serialising a [`Packet`] into a byte buffer for stream channels.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |        Payload Length         |   Checksum    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+               +
//! |              (checksum cont.)                 |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 7 bytes.
//! type(1) + payload_len(2) + checksum(4)
//!
//! Unlike a transport header checksum, the checksum covers the payload only
//! and is **not** verified by [`Packet::decode`]: a corrupted payload must
//! reach the receive worker intact so it can answer with a NACK.

use thiserror::Error;

/// Default maximum number of payload bytes carried by one packet.
pub const MAX_PAYLOAD_LENGTH: usize = 1024;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 7;

/// Largest payload the 16-bit length field can describe.
pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;

const OFF_TYPE: usize = 0;
const OFF_PAYLOAD_LEN: usize = 1;
const OFF_CHECKSUM: usize = 3;

/// What a packet means to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// A chunk of a message with more chunks to follow.
    Data,
    /// The final chunk of a message.
    LastData,
    /// The most recent data packet arrived intact.
    Ack,
    /// The most recent data packet arrived corrupted; resend it.
    Nack,
    /// Orderly connection shutdown.
    Term,
}

impl PacketType {
    fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::LastData => 1,
            Self::Ack => 2,
            Self::Nack => 3,
            Self::Term => 4,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, PacketError> {
        match byte {
            0 => Ok(Self::Data),
            1 => Ok(Self::LastData),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Nack),
            4 => Ok(Self::Term),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    /// `true` for the kinds that carry message bytes.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Data | Self::LastData)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "DATA",
            Self::LastData => "LAST_DATA",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Term => "TERM",
        };
        f.write_str(name)
    }
}

/// A single protocol packet: kind, payload bytes and the payload checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    /// Checksum computed by the sender over `payload`.
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a payload-carrying packet, stamping the checksum of `payload`.
    pub fn data(kind: PacketType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            checksum: checksum(&payload),
            payload,
        }
    }

    /// Build a payload-less control packet (ACK, NACK or TERM).
    pub fn control(kind: PacketType) -> Self {
        Self {
            kind,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    /// `true` when the payload still hashes to the checksum the sender stamped.
    pub fn is_intact(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The stored `checksum` is written verbatim; it is never recomputed here.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_WIRE_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }

        let mut buf = vec![0u8; HEADER_LEN + payload_len];
        buf[OFF_TYPE] = self.kind.to_wire();
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice holding exactly one frame.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the type byte is not a known [`PacketType`], or
    /// - the `payload_len` field disagrees with `buf.len()`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let (kind, payload_len, checksum) = decode_header(buf)?;

        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch);
        }

        Ok(Packet {
            kind,
            checksum,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Parse the fixed header, returning `(kind, payload_len, checksum)`.
///
/// Stream channels call this first to learn how many payload bytes follow.
pub fn decode_header(buf: &[u8]) -> Result<(PacketType, usize, u32), PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::BufferTooShort);
    }

    let kind = PacketType::from_wire(buf[OFF_TYPE])?;
    let payload_len = u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]);
    let checksum = u32::from_be_bytes([
        buf[OFF_CHECKSUM],
        buf[OFF_CHECKSUM + 1],
        buf[OFF_CHECKSUM + 2],
        buf[OFF_CHECKSUM + 3],
    ]);

    Ok((kind, payload_len as usize, checksum))
}

/// Errors that can arise when encoding or parsing a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("payload_len field does not match remaining bytes")]
    LengthMismatch,
    #[error("payload of {0} bytes does not fit the 16-bit length field")]
    PayloadTooLarge(usize),
}

/// Compute the corruption-detection code over `data`.
///
/// Even indices contribute `index * byte`, odd indices contribute the byte
/// itself.  Arithmetic wraps at `u32`.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter().enumerate().fold(0u32, |sum, (i, &byte)| {
        let term = if i % 2 == 0 {
            (i as u32).wrapping_mul(u32::from(byte))
        } else {
            u32::from(byte)
        };
        sum.wrapping_add(term)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_worked_example() {
        // 0 * 'a' + 'b' + 2 * 'c' + 'd'
        let expected = u32::from(b'b') + 2 * u32::from(b'c') + u32::from(b'd');
        assert_eq!(checksum(b"abcd"), expected);
    }

    #[test]
    fn checksum_of_empty_is_zero() {
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn checksum_is_deterministic() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(checksum(data), checksum(data));
    }

    #[test]
    fn checksum_detects_single_bit_flips() {
        // Index 0 is multiplied by zero, so a flip there is invisible; every
        // other position must change the sum.
        let data = b"hello world".to_vec();
        let original = checksum(&data);
        for i in 1..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[i] ^= 1 << bit;
                assert_ne!(checksum(&flipped), original, "flip at byte {i} bit {bit}");
            }
        }
    }

    #[test]
    fn checksum_treats_bytes_as_unsigned() {
        assert_eq!(checksum(&[0x00, 0xff]), 255);
        assert_eq!(checksum(&[0x00, 0x00, 0xff]), 2 * 255);
    }

    #[test]
    fn data_packet_is_intact_until_payload_changes() {
        let mut pkt = Packet::data(PacketType::Data, b"payload".to_vec());
        assert!(pkt.is_intact());
        pkt.payload[3] ^= 0x10;
        assert!(!pkt.is_intact());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = Packet::data(PacketType::LastData, b"hello".to_vec());
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn control_packet_has_empty_payload_on_wire() {
        let bytes = Packet::control(PacketType::Nack).encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[OFF_TYPE], 3);
    }

    #[test]
    fn decode_keeps_corrupted_payload() {
        let mut bytes = Packet::data(PacketType::Data, b"test".to_vec()).encode().unwrap();
        bytes[HEADER_LEN + 2] ^= 0x01;
        let decoded = Packet::decode(&bytes).unwrap();
        assert!(!decoded.is_intact());
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort));
    }

    #[test]
    fn decode_unknown_type_returns_error() {
        let mut bytes = Packet::control(PacketType::Ack).encode().unwrap();
        bytes[OFF_TYPE] = 9;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownType(9)));
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = Packet::data(PacketType::Data, b"data".to_vec()).encode().unwrap();
        bytes.pop();
        assert_eq!(Packet::decode(&bytes), Err(PacketError::LengthMismatch));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let pkt = Packet::data(PacketType::Data, vec![0u8; MAX_WIRE_PAYLOAD + 1]);
        assert_eq!(
            pkt.encode(),
            Err(PacketError::PayloadTooLarge(MAX_WIRE_PAYLOAD + 1))
        );
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let pkt = Packet {
            kind: PacketType::Data,
            checksum: 0x0102_0304,
            payload: vec![0u8; 0x0105],
        };
        let bytes = pkt.encode().unwrap();
        assert_eq!(&bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2], &[0x01, 0x05]);
        assert_eq!(&bytes[OFF_CHECKSUM..OFF_CHECKSUM + 4], &[0x01, 0x02, 0x03, 0x04]);
    }
}
