//! Splitting application messages into packets.
//!
//! Reassembly is the inverse and lives with the receive worker
//! ([`crate::receiver::Reassembly`]), which appends payloads as they validate.
//!
//! # Chunking rules
//!
//! - Every chunk but the last is [`PacketType::Data`]; the last is
//!   [`PacketType::LastData`].
//! - A message whose length is an exact multiple of `max_payload` ends with a
//!   full-size `LastData` chunk; no empty trailing chunk is produced.
//! - An empty message becomes a single empty `LastData` packet, so the peer
//!   still sees a message boundary.

use crate::connection::RtpError;
use crate::packet::{Packet, PacketType};

/// Number of packets [`packetize`] produces for a message of `len` bytes.
pub fn packet_count(len: usize, max_payload: usize) -> usize {
    len.div_ceil(max_payload).max(1)
}

/// Convert `message` into an ordered sequence of checksummed packets.
///
/// Allocation is fallible: running out of memory yields
/// [`RtpError::OutOfMemory`] rather than aborting.
pub fn packetize(message: &[u8], max_payload: usize) -> Result<Vec<Packet>, RtpError> {
    if max_payload == 0 {
        return Err(RtpError::InvalidConfig("max_payload must be non-zero".into()));
    }

    let count = packet_count(message.len(), max_payload);
    let mut packets = Vec::new();
    packets
        .try_reserve_exact(count)
        .map_err(|_| RtpError::OutOfMemory { requested: count })?;

    if message.is_empty() {
        packets.push(Packet::data(PacketType::LastData, Vec::new()));
        return Ok(packets);
    }

    for (i, chunk) in message.chunks(max_payload).enumerate() {
        let kind = if i + 1 == count {
            PacketType::LastData
        } else {
            PacketType::Data
        };
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(chunk.len())
            .map_err(|_| RtpError::OutOfMemory { requested: chunk.len() })?;
        payload.extend_from_slice(chunk);
        packets.push(Packet::data(kind, payload));
    }

    Ok(packets)
}
