//! Receive side of a connection: validation, ACK/NACK replies and message
//! reassembly.
//!
//! The receive worker is the only reader of the channel, so it sees two kinds
//! of traffic:
//! - DATA / LAST_DATA from the peer's send worker.  Each one is checked
//!   against its checksum and answered with ACK or NACK; intact payloads are
//!   appended to a [`Reassembly`] buffer until a LAST_DATA completes the
//!   message.
//! - ACK / NACK answering our own send worker.  These are posted to the ack
//!   slot and never touch the reassembly buffer.
//!
//! A TERM packet or any read failure ends the connection.

use std::sync::Arc;

use crate::channel::ChannelError;
use crate::connection::RtpError;
use crate::packet::{Packet, PacketType};
use crate::state::{AckSignal, Counters, Shared};

/// Growable accumulation buffer for one message.
///
/// The first allocation is sized exactly to the first payload; afterwards
/// capacity at least doubles whenever it runs out.  Growth is fallible.
#[derive(Debug, Default)]
pub struct Reassembly {
    buf: Vec<u8>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intact payload.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), RtpError> {
        let needed = self.buf.len() + payload.len();
        if needed > self.buf.capacity() {
            let target = if self.buf.capacity() == 0 {
                needed
            } else {
                needed.max(self.buf.capacity() * 2)
            };
            self.buf
                .try_reserve_exact(target - self.buf.len())
                .map_err(|_| RtpError::OutOfMemory { requested: target })?;
        }
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Hand out the accumulated bytes; the message length is the number of
    /// bytes appended, not the buffer capacity.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// What the receiver concluded about one DATA / LAST_DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Intact, more packets of this message follow.
    Accepted,
    /// Intact LAST_DATA: the message is complete.
    Complete,
    /// Checksum mismatch.  The packet is dropped, even a LAST_DATA, so the
    /// message stays open until the retransmission arrives.
    Corrupted,
}

impl Verdict {
    /// The control packet to answer with.
    pub fn reply(self) -> PacketType {
        match self {
            Self::Accepted | Self::Complete => PacketType::Ack,
            Self::Corrupted => PacketType::Nack,
        }
    }
}

/// Judge a payload-carrying packet by its checksum.
pub fn judge(packet: &Packet) -> Verdict {
    if !packet.is_intact() {
        Verdict::Corrupted
    } else if packet.kind == PacketType::LastData {
        Verdict::Complete
    } else {
        Verdict::Accepted
    }
}

/// Body of the per-connection receive thread.
pub(crate) fn run_recv_worker(shared: Arc<Shared>) {
    log::debug!("[{}] recv worker started", shared.label);

    while shared.is_alive() {
        match receive_one(&shared) {
            Ok(Some(message)) if shared.is_alive() => {
                log::debug!("[{}] message complete len={}", shared.label, message.len());
                Counters::bump(&shared.counters.messages_received);
                shared.inbound.push(message);
            }
            Ok(Some(message)) => {
                log::debug!(
                    "[{}] discarding message len={} after close",
                    shared.label,
                    message.len()
                );
            }
            Ok(None) => break,
            Err(e) => {
                shared.abort(&e);
                break;
            }
        }
    }

    log::debug!("[{}] recv worker exiting", shared.label);
}

/// Read packets until one message is complete.  `Ok(None)` means the
/// connection is closing and any partial message was discarded.
fn receive_one(shared: &Shared) -> Result<Option<Vec<u8>>, RtpError> {
    let mut message = Reassembly::new();

    loop {
        let packet = match shared.channel.recv_packet() {
            Ok(packet) => packet,
            Err(ChannelError::Closed) => {
                log::info!("[{}] channel closed", shared.label);
                shared.close();
                return Ok(None);
            }
            Err(e) => {
                log::warn!("[{}] channel read failed: {e}", shared.label);
                shared.close();
                return Ok(None);
            }
        };
        if !shared.is_alive() {
            return Ok(None);
        }

        match packet.kind {
            PacketType::Term => {
                log::info!("[{}] ← TERM, peer disconnected", shared.label);
                shared.close();
                return Ok(None);
            }
            PacketType::Ack => shared.ack.post(AckSignal::Ack),
            PacketType::Nack => shared.ack.post(AckSignal::Nack),
            PacketType::Data | PacketType::LastData => {
                let verdict = judge(&packet);
                let reply = verdict.reply();
                if let Err(e) = shared.channel.send_packet(&Packet::control(reply)) {
                    log::warn!("[{}] failed to send {reply}: {e}", shared.label);
                    shared.close();
                    return Ok(None);
                }
                log::debug!(
                    "[{}] ← {} len={}; → {reply}",
                    shared.label,
                    packet.kind,
                    packet.payload.len()
                );

                match verdict {
                    Verdict::Corrupted => Counters::bump(&shared.counters.nacks_sent),
                    Verdict::Accepted | Verdict::Complete => {
                        Counters::bump(&shared.counters.acks_sent);
                        message.append(&packet.payload)?;
                    }
                }
                if verdict == Verdict::Complete {
                    return Ok(Some(message.finish()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_append_is_exact_fit() {
        let mut r = Reassembly::new();
        r.append(b"hello").unwrap();
        assert_eq!(r.len(), 5);
        assert_eq!(r.capacity(), 5);
    }

    #[test]
    fn growth_doubles_capacity() {
        let mut r = Reassembly::new();
        r.append(&[0u8; 8]).unwrap();
        r.append(&[1u8; 2]).unwrap();
        assert_eq!(r.capacity(), 16);
        r.append(&[2u8; 40]).unwrap();
        assert_eq!(r.capacity(), 50);
        assert_eq!(r.len(), 50);
    }

    #[test]
    fn finish_returns_appended_bytes_only() {
        let mut r = Reassembly::new();
        r.append(b"hello").unwrap();
        r.append(b" world").unwrap();
        let message = r.finish();
        assert_eq!(message, b"hello world");
    }

    #[test]
    fn empty_payloads_leave_buffer_empty() {
        let mut r = Reassembly::new();
        r.append(b"").unwrap();
        assert!(r.is_empty());
        assert!(r.finish().is_empty());
    }

    #[test]
    fn intact_data_is_accepted() {
        let pkt = Packet::data(PacketType::Data, b"abc".to_vec());
        assert_eq!(judge(&pkt), Verdict::Accepted);
        assert_eq!(judge(&pkt).reply(), PacketType::Ack);
    }

    #[test]
    fn intact_last_data_completes() {
        let pkt = Packet::data(PacketType::LastData, b"abc".to_vec());
        assert_eq!(judge(&pkt), Verdict::Complete);
    }

    #[test]
    fn corrupted_last_data_does_not_complete() {
        let mut pkt = Packet::data(PacketType::LastData, b"abc".to_vec());
        pkt.payload[1] ^= 0x40;
        assert_eq!(judge(&pkt), Verdict::Corrupted);
        assert_eq!(judge(&pkt).reply(), PacketType::Nack);
    }
}
