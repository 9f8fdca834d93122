//! The packet channel an RTP connection runs on top of.
//!
//! A channel delivers packets in order and without loss, but may damage
//! payload bytes in transit.  The receive worker is the only reader and the
//! send side (send worker plus ACK/NACK replies from the receive worker) the
//! only writer, so implementations need a read lock and a write lock but
//! never both at once.

use thiserror::Error;

use crate::packet::{Packet, PacketError};

/// Errors that can arise from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was shut down locally or the peer went away.
    #[error("channel closed")]
    Closed,
    /// Underlying I/O error from the OS.
    #[error("channel I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be encoded or decoded.
    #[error("packet framing error: {0}")]
    Packet(#[from] PacketError),
    /// Another writer holds the channel.
    #[error("channel busy")]
    Busy,
}

/// Blocking, packet-oriented transport consumed by the connection engine.
///
/// Release of the underlying resource happens on `Drop`.
pub trait PacketChannel: Send + Sync {
    /// Transmit one packet. Returns the number of bytes put on the wire.
    fn send_packet(&self, packet: &Packet) -> Result<usize, ChannelError>;

    /// Best-effort send of a final packet such as TERM.  Must not wait behind
    /// another writer; fails with [`ChannelError::Busy`] instead.
    ///
    /// Channels whose sends never block can rely on the default.
    fn try_send_packet(&self, packet: &Packet) -> Result<usize, ChannelError> {
        self.send_packet(packet)
    }

    /// Block until the next packet arrives.
    fn recv_packet(&self) -> Result<Packet, ChannelError>;

    /// Tear the channel down.  Pending and future reads and writes fail with
    /// an error; calling this more than once is harmless.
    fn shutdown(&self);
}
