//! In-process loopback network with fault injection.
//!
//! RTP assumes a channel that never drops or reorders but may flip bits in
//! packet payloads.  [`loopback_pair`] builds two connected
//! [`LoopbackChannel`]s that behave exactly like that, applying a
//! configurable corruption model to every payload-carrying packet an endpoint
//! sends:
//!
//! | Fault            | Description                                          |
//! |------------------|------------------------------------------------------|
//! | Planned flip     | Corrupt the N-th DATA/LAST_DATA packet sent.         |
//! | Random flip      | Corrupt any DATA/LAST_DATA with `corruption_rate`.   |
//!
//! Headers and control packets are never touched.  Byte 0 of a payload has
//! weight zero in the checksum, so flips are placed at offsets `1..len`;
//! single-byte payloads therefore pass through unharmed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::{ChannelError, PacketChannel};
use crate::packet::{Packet, HEADER_LEN};
use crate::state::lock;

/// Configuration for the fault-injection model of one sending endpoint.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Zero-based indices, counted over payload-carrying packets sent by this
    /// endpoint, whose payload gets one bit flipped.
    pub corrupt_data_packets: Vec<usize>,
    /// Probability in `[0.0, 1.0]` that any payload-carrying packet is
    /// corrupted.
    pub corruption_rate: f64,
    /// Seed for the RNG behind `corruption_rate` and bit placement.
    pub seed: u64,
}

impl SimulatorConfig {
    /// A transparent pass-through.
    pub fn clean() -> Self {
        Self::default()
    }

    /// Corrupt the `index`-th payload-carrying packet (zero-based).
    pub fn corrupt_nth(mut self, index: usize) -> Self {
        self.corrupt_data_packets.push(index);
        self
    }

    /// Corrupt payload-carrying packets at random with probability `rate`.
    pub fn with_corruption_rate(mut self, rate: f64, seed: u64) -> Self {
        self.corruption_rate = rate.clamp(0.0, 1.0);
        self.seed = seed;
        self
    }
}

/// One direction of the loopback: a FIFO of encoded frames.
#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct PipeState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        lock(&self.state)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }
}

#[derive(Debug)]
struct FaultInjector {
    config: SimulatorConfig,
    rng: StdRng,
    data_sent: usize,
}

impl FaultInjector {
    fn new(mut config: SimulatorConfig) -> Self {
        config.corruption_rate = if config.corruption_rate.is_nan() {
            0.0
        } else {
            config.corruption_rate.clamp(0.0, 1.0)
        };
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            data_sent: 0,
        }
    }

    /// Possibly flip one payload bit of an encoded data frame.
    /// Returns `true` if the frame was damaged.
    fn apply(&mut self, frame: &mut [u8]) -> bool {
        let index = self.data_sent;
        self.data_sent += 1;

        let planned = self.config.corrupt_data_packets.contains(&index);
        let random = self.config.corruption_rate > 0.0
            && self.rng.random_bool(self.config.corruption_rate);
        let payload_len = frame.len() - HEADER_LEN;
        if !(planned || random) || payload_len < 2 {
            return false;
        }

        let offset = self.rng.random_range(1..payload_len);
        let bit = self.rng.random_range(0..8u8);
        frame[HEADER_LEN + offset] ^= 1 << bit;
        true
    }
}

/// One endpoint of an in-memory packet link.
#[derive(Debug)]
pub struct LoopbackChannel {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    faults: Mutex<FaultInjector>,
    corrupted: AtomicU64,
    closed: AtomicBool,
}

/// Build two connected endpoints.  `a_faults` damages traffic sent by the
/// first endpoint, `b_faults` traffic sent by the second.
pub fn loopback_pair(
    a_faults: SimulatorConfig,
    b_faults: SimulatorConfig,
) -> (LoopbackChannel, LoopbackChannel) {
    let a_to_b = Arc::new(Pipe::default());
    let b_to_a = Arc::new(Pipe::default());
    let a = LoopbackChannel::new(b_to_a.clone(), a_to_b.clone(), a_faults);
    let b = LoopbackChannel::new(a_to_b, b_to_a, b_faults);
    (a, b)
}

impl LoopbackChannel {
    fn new(inbound: Arc<Pipe>, outbound: Arc<Pipe>, faults: SimulatorConfig) -> Self {
        Self {
            inbound,
            outbound,
            faults: Mutex::new(FaultInjector::new(faults)),
            corrupted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// How many packets sent from this endpoint were damaged in transit.
    pub fn corrupted_count(&self) -> u64 {
        self.corrupted.load(Ordering::SeqCst)
    }
}

impl PacketChannel for LoopbackChannel {
    fn send_packet(&self, packet: &Packet) -> Result<usize, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut frame = packet.encode()?;
        if packet.kind.carries_payload() {
            let mut faults = lock(&self.faults);
            if faults.apply(&mut frame) {
                self.corrupted.fetch_add(1, Ordering::SeqCst);
                log::debug!("[sim] corrupted {} len={}", packet.kind, packet.payload.len());
            }
        }

        let len = frame.len();
        let mut state = self.outbound.lock();
        if state.closed {
            return Err(ChannelError::Closed);
        }
        state.frames.push_back(frame);
        drop(state);
        self.outbound.ready.notify_one();
        Ok(len)
    }

    fn recv_packet(&self) -> Result<Packet, ChannelError> {
        let state = self.inbound.lock();
        let mut state = self
            .inbound
            .ready
            .wait_while(state, |s| s.frames.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        match state.frames.pop_front() {
            Some(frame) => Ok(Packet::decode(&frame)?),
            None => Err(ChannelError::Closed),
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound.close();
        self.inbound.close();
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
