//! Per-connection shared state.
//!
//! One [`Shared`] lives behind an `Arc` and is visible to the application
//! threads, the send worker and the receive worker.  It holds three
//! independent synchronisation domains, each a mutex paired with a condvar:
//!
//! | Domain            | Predicate                | Waiter                  |
//! |-------------------|--------------------------|-------------------------|
//! | `outbound`        | queue non-empty          | send worker             |
//! | `inbound`         | queue non-empty          | `receive_message` caller|
//! | `ack`             | outcome is ACK or NACK   | send worker             |
//!
//! No code path holds more than one of these locks at a time.  The `alive`
//! flag is atomic and sits outside all three; [`Shared::close`] flips it and
//! then wakes each domain under its own lock so no waiter can miss it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::channel::PacketChannel;
use crate::config::RtpConfig;
use crate::packet::{Packet, PacketType};

/// Lock a mutex, recovering the guard if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome reported by the peer for the packet currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckSignal {
    #[default]
    None,
    Ack,
    Nack,
}

/// A FIFO of whole messages guarded by its own mutex and "non-empty" condvar.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
}

impl MessageQueue {
    pub fn push(&self, message: Vec<u8>) {
        lock(&self.items).push_back(message);
        self.ready.notify_one();
    }

    /// Block until a message is queued or `alive` drops.  Returns `None` only
    /// when woken by a close with nothing left to hand out.
    pub fn pop_blocking(&self, alive: &AtomicBool) -> Option<Vec<u8>> {
        let items = lock(&self.items);
        let mut items = self
            .ready
            .wait_while(items, |q| q.is_empty() && alive.load(Ordering::SeqCst))
            .unwrap_or_else(PoisonError::into_inner);
        items.pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        lock(&self.items).drain(..).collect()
    }

    fn wake_all(&self) {
        let _guard = lock(&self.items);
        self.ready.notify_all();
    }
}

/// The one-slot ACK/NACK mailbox between the two workers.
#[derive(Debug, Default)]
pub struct AckSlot {
    signal: Mutex<AckSignal>,
    ready: Condvar,
}

impl AckSlot {
    /// Record the peer's verdict and wake the send worker.
    pub fn post(&self, outcome: AckSignal) {
        *lock(&self.signal) = outcome;
        self.ready.notify_all();
    }

    /// Wait for an outcome, consume it and reset the slot to
    /// [`AckSignal::None`].
    ///
    /// Returns `AckSignal::None` if the connection closed or `timeout`
    /// elapsed first.
    pub fn take(&self, alive: &AtomicBool, timeout: Option<Duration>) -> AckSignal {
        let pending = |s: &mut AckSignal| *s == AckSignal::None && alive.load(Ordering::SeqCst);
        let signal = lock(&self.signal);
        let mut signal = match timeout {
            Some(limit) => {
                self.ready
                    .wait_timeout_while(signal, limit, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .ready
                .wait_while(signal, pending)
                .unwrap_or_else(PoisonError::into_inner),
        };
        std::mem::take(&mut *signal)
    }

    fn wake_all(&self) {
        let _guard = lock(&self.signal);
        self.ready.notify_all();
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStats {
    /// DATA/LAST_DATA packets put on the wire, retransmissions included.
    pub data_packets_sent: u64,
    /// Packets resent after a NACK.
    pub retransmits: u64,
    pub acks_received: u64,
    pub nacks_received: u64,
    pub acks_sent: u64,
    pub nacks_sent: u64,
    /// Messages fully acknowledged by the peer.
    pub messages_sent: u64,
    /// Messages reassembled and handed to the inbound queue.
    pub messages_received: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub data_packets_sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub acks_received: AtomicU64,
    pub nacks_received: AtomicU64,
    pub acks_sent: AtomicU64,
    pub nacks_sent: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ConnectionStats {
            data_packets_sent: get(&self.data_packets_sent),
            retransmits: get(&self.retransmits),
            acks_received: get(&self.acks_received),
            nacks_received: get(&self.nacks_received),
            acks_sent: get(&self.acks_sent),
            nacks_sent: get(&self.nacks_sent),
            messages_sent: get(&self.messages_sent),
            messages_received: get(&self.messages_received),
        }
    }
}

/// Everything the application threads and both workers share.
pub struct Shared {
    /// Short tag used in log lines to tell connections apart.
    pub label: String,
    pub config: RtpConfig,
    pub channel: Box<dyn PacketChannel>,
    pub outbound: MessageQueue,
    pub inbound: MessageQueue,
    pub ack: AckSlot,
    pub alive: AtomicBool,
    pub(crate) counters: Counters,
}

impl Shared {
    pub fn new(label: String, channel: Box<dyn PacketChannel>, config: RtpConfig) -> Self {
        Self {
            label,
            config,
            channel,
            outbound: MessageQueue::default(),
            inbound: MessageQueue::default(),
            ack: AckSlot::default(),
            alive: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Flip `alive` to false and wake every waiter.
    ///
    /// Returns `true` for the caller that performed the transition.
    pub fn close(&self) -> bool {
        let first = self.alive.swap(false, Ordering::SeqCst);
        self.outbound.wake_all();
        self.inbound.wake_all();
        self.ack.wake_all();
        first
    }

    /// Give up on the connection from inside a worker: tell the peer, then
    /// close locally.  Send errors are ignored since the link may already be
    /// gone.
    pub fn abort(&self, reason: &dyn std::fmt::Display) {
        if self.is_alive() {
            log::error!("[{}] closing connection: {reason}", self.label);
            let _ = self.channel.try_send_packet(&Packet::control(PacketType::Term));
        }
        self.close();
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("label", &self.label)
            .field("alive", &self.is_alive())
            .field("outbound", &self.outbound.len())
            .field("inbound", &self.inbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn queue_is_fifo() {
        let alive = AtomicBool::new(true);
        let q = MessageQueue::default();
        q.push(b"one".to_vec());
        q.push(b"two".to_vec());
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_blocking(&alive).unwrap(), b"one");
        assert_eq!(q.pop_blocking(&alive).unwrap(), b"two");
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn pop_blocking_wakes_on_push() {
        let alive = Arc::new(AtomicBool::new(true));
        let q = Arc::new(MessageQueue::default());
        let waiter = {
            let (q, alive) = (q.clone(), alive.clone());
            thread::spawn(move || q.pop_blocking(&alive))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(b"late".to_vec());
        assert_eq!(waiter.join().unwrap().unwrap(), b"late");
    }

    #[test]
    fn pop_blocking_returns_none_after_close() {
        let alive = Arc::new(AtomicBool::new(true));
        let q = Arc::new(MessageQueue::default());
        let waiter = {
            let (q, alive) = (q.clone(), alive.clone());
            thread::spawn(move || q.pop_blocking(&alive))
        };
        thread::sleep(Duration::from_millis(20));
        alive.store(false, Ordering::SeqCst);
        q.wake_all();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn ack_slot_resets_after_take() {
        let alive = AtomicBool::new(true);
        let slot = AckSlot::default();
        slot.post(AckSignal::Nack);
        assert_eq!(slot.take(&alive, None), AckSignal::Nack);
        slot.post(AckSignal::Ack);
        assert_eq!(slot.take(&alive, None), AckSignal::Ack);
        assert_eq!(*lock(&slot.signal), AckSignal::None);
    }

    #[test]
    fn ack_slot_times_out_empty() {
        let alive = AtomicBool::new(true);
        let slot = AckSlot::default();
        assert_eq!(
            slot.take(&alive, Some(Duration::from_millis(10))),
            AckSignal::None
        );
    }

    #[test]
    fn ack_slot_wait_ends_when_connection_dies() {
        let alive = Arc::new(AtomicBool::new(true));
        let slot = Arc::new(AckSlot::default());
        let waiter = {
            let (slot, alive) = (slot.clone(), alive.clone());
            thread::spawn(move || slot.take(&alive, None))
        };
        thread::sleep(Duration::from_millis(20));
        alive.store(false, Ordering::SeqCst);
        slot.wake_all();
        assert_eq!(waiter.join().unwrap(), AckSignal::None);
    }

    #[test]
    fn counters_snapshot() {
        let counters = Counters::default();
        Counters::bump(&counters.retransmits);
        Counters::bump(&counters.retransmits);
        Counters::bump(&counters.acks_sent);
        let stats = counters.snapshot();
        assert_eq!(stats.retransmits, 2);
        assert_eq!(stats.acks_sent, 1);
        assert_eq!(stats.nacks_sent, 0);
    }
}
