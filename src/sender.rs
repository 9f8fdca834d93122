//! Send side of a connection: stop-and-wait over the packets of one message.
//!
//! [`Sender`] tracks which packet of the current message is in flight and how
//! often it has been transmitted.  It does **not** touch the channel;
//! [`run_send_worker`] owns the loop that dequeues messages, puts packets on
//! the wire and waits on the ack slot filled by the receive worker.
//!
//! # Stop-and-Wait contract
//! - At most **one** packet is in flight at any moment (`unacked`).
//! - A new packet may only be started once `unacked` is `None`.
//! - On ACK: clear `unacked`; the next packet may go.
//! - On NACK: increment `tx_count`; resend the same packet unchanged, unless
//!   the retry budget is spent.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::connection::RtpError;
use crate::packet::Packet;
use crate::packetizer::packetize;
use crate::state::{AckSignal, Counters, Shared};

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// A packet that has been sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// The packet on the wire.
    pub packet: Packet,
    /// How many times this packet has been transmitted (1 = first send).
    pub tx_count: u32,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Stop-and-wait send state for one message.
#[derive(Debug)]
pub struct Sender {
    /// Packets of the message not yet started, in order.
    pending: VecDeque<Packet>,
    /// The in-flight packet, or `None` between packets.
    pub unacked: Option<RetransmitEntry>,
    max_retries: Option<u32>,
}

impl Sender {
    pub fn new(packets: Vec<Packet>, max_retries: Option<u32>) -> Self {
        Self {
            pending: packets.into(),
            unacked: None,
            max_retries,
        }
    }

    /// Move the next packet into the in-flight slot (first transmission) and
    /// return it.  `None` once the message is exhausted.
    ///
    /// Panics in debug mode if a packet is already in flight.
    pub fn start_next(&mut self) -> Option<&Packet> {
        debug_assert!(
            self.unacked.is_none(),
            "start_next called while a packet is already in flight"
        );
        let packet = self.pending.pop_front()?;
        let entry = self.unacked.insert(RetransmitEntry {
            packet,
            tx_count: 1,
        });
        Some(&entry.packet)
    }

    /// The peer accepted the in-flight packet.
    ///
    /// Returns `false` if nothing was in flight.
    pub fn on_ack(&mut self) -> bool {
        self.unacked.take().is_some()
    }

    /// The peer rejected the in-flight packet.  Returns the same packet for
    /// retransmission, or [`RtpError::RetriesExhausted`] once the budget is
    /// spent.
    pub fn on_nack(&mut self) -> Result<&Packet, RtpError> {
        let max_retries = self.max_retries;
        let entry = self.unacked.as_mut().ok_or(RtpError::ConnectionClosed)?;
        let retries = entry.tx_count - 1;
        if let Some(max) = max_retries {
            if retries >= max {
                return Err(RtpError::RetriesExhausted { retries });
            }
        }
        entry.tx_count += 1;
        Ok(&entry.packet)
    }

    /// Number of times the in-flight packet has been sent, or `0` if idle.
    pub fn transmit_count(&self) -> u32 {
        self.unacked.as_ref().map_or(0, |e| e.tx_count)
    }

    /// `true` when a packet is waiting for an ACK.
    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }

    /// `true` once every packet has been acknowledged.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_none()
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

/// Body of the per-connection send thread.
pub(crate) fn run_send_worker(shared: Arc<Shared>) {
    log::debug!("[{}] send worker started", shared.label);

    while let Some(message) = shared.outbound.pop_blocking(&shared.alive) {
        if !shared.is_alive() {
            break;
        }
        match send_one(&shared, &message) {
            Ok(()) => Counters::bump(&shared.counters.messages_sent),
            Err(RtpError::ConnectionClosed) => break,
            Err(RtpError::Channel(e)) => {
                log::warn!("[{}] peer unreachable: {e}", shared.label);
                shared.close();
                break;
            }
            Err(e) => {
                shared.abort(&e);
                break;
            }
        }
    }

    log::debug!("[{}] send worker exiting", shared.label);
}

/// Drive one message through packetize → send → await ACK/NACK.
fn send_one(shared: &Shared, message: &[u8]) -> Result<(), RtpError> {
    let packets = packetize(message, shared.config.max_payload)?;
    let total = packets.len();
    log::debug!(
        "[{}] sending message len={} packets={}",
        shared.label,
        message.len(),
        total
    );

    let mut sender = Sender::new(packets, shared.config.max_retries);
    let mut index = 0usize;
    while let Some(packet) = sender.start_next() {
        transmit(shared, packet)?;

        loop {
            match shared.ack.take(&shared.alive, shared.config.ack_timeout) {
                AckSignal::Ack => {
                    Counters::bump(&shared.counters.acks_received);
                    log::debug!("[{}] ← ACK {}/{}", shared.label, index + 1, total);
                    sender.on_ack();
                    break;
                }
                AckSignal::Nack => {
                    Counters::bump(&shared.counters.nacks_received);
                    log::debug!(
                        "[{}] ← NACK {}/{} (sent {}x)",
                        shared.label,
                        index + 1,
                        total,
                        sender.transmit_count()
                    );
                    let packet = sender.on_nack()?;
                    Counters::bump(&shared.counters.retransmits);
                    transmit(shared, packet)?;
                }
                AckSignal::None => {
                    return match shared.config.ack_timeout {
                        Some(limit) if shared.is_alive() => Err(RtpError::AckTimeout(limit)),
                        _ => Err(RtpError::ConnectionClosed),
                    };
                }
            }
        }
        index += 1;
    }

    debug_assert!(sender.is_done());
    Ok(())
}

fn transmit(shared: &Shared, packet: &Packet) -> Result<(), RtpError> {
    if !shared.is_alive() {
        return Err(RtpError::ConnectionClosed);
    }
    let n = shared.channel.send_packet(packet)?;
    Counters::bump(&shared.counters.data_packets_sent);
    log::debug!(
        "[{}] → {} len={} ({n} bytes)",
        shared.label,
        packet.kind,
        packet.payload.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn packets(n: usize) -> Vec<Packet> {
        (0..n)
            .map(|i| {
                let kind = if i + 1 == n {
                    PacketType::LastData
                } else {
                    PacketType::Data
                };
                Packet::data(kind, vec![i as u8; 3])
            })
            .collect()
    }

    #[test]
    fn new_sender_is_idle() {
        let s = Sender::new(packets(2), None);
        assert!(!s.has_unacked());
        assert_eq!(s.transmit_count(), 0);
        assert!(!s.is_done());
    }

    #[test]
    fn packets_start_in_order() {
        let mut s = Sender::new(packets(3), None);
        for i in 0..3u8 {
            let p = s.start_next().unwrap();
            assert_eq!(p.payload, vec![i; 3]);
            assert!(s.on_ack());
        }
        assert!(s.start_next().is_none());
        assert!(s.is_done());
    }

    #[test]
    fn nack_returns_same_packet() {
        let mut s = Sender::new(packets(2), None);
        let first = s.start_next().unwrap().clone();
        let resent = s.on_nack().unwrap().clone();
        assert_eq!(first, resent);
        assert_eq!(s.transmit_count(), 2);
        assert!(s.on_ack());
        assert_eq!(s.start_next().unwrap().kind, PacketType::LastData);
    }

    #[test]
    fn ack_without_inflight_is_ignored() {
        let mut s = Sender::new(packets(1), None);
        assert!(!s.on_ack());
    }

    #[test]
    fn retry_budget_is_enforced() {
        let mut s = Sender::new(packets(1), Some(2));
        s.start_next().unwrap();
        assert!(s.on_nack().is_ok());
        assert!(s.on_nack().is_ok());
        assert!(matches!(
            s.on_nack(),
            Err(RtpError::RetriesExhausted { retries: 2 })
        ));
        assert_eq!(s.transmit_count(), 3);
    }

    #[test]
    fn unbounded_retries_keep_going() {
        let mut s = Sender::new(packets(1), None);
        s.start_next().unwrap();
        for _ in 0..1000 {
            s.on_nack().unwrap();
        }
        assert_eq!(s.transmit_count(), 1001);
    }

    #[test]
    #[should_panic(expected = "already in flight")]
    #[cfg(debug_assertions)]
    fn starting_while_inflight_panics_in_debug() {
        let mut s = Sender::new(packets(2), None);
        s.start_next();
        s.start_next();
    }
}
