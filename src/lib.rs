//! `rtp` — reliable, in-order message delivery over a packet channel that may
//! corrupt payloads.
//!
//! # Architecture
//!
//! ```text
//!   send_message            receive_message
//!        │                        ▲
//!  ┌─────▼──────┐          ┌──────┴─────┐
//!  │ outbound Q │          │ inbound Q  │
//!  └─────┬──────┘          └──────▲─────┘
//!        │                        │
//!  ┌─────▼──────┐ ack slot ┌──────┴─────┐
//!  │   Sender   │◀─────────│  Receiver  │
//!  │  (thread)  │          │  (thread)  │
//!  └─────┬──────┘          └──────▲─────┘
//!        │ DATA/LAST_DATA         │ DATA, ACK/NACK, TERM
//!  ┌─────▼────────────────────────┴─────┐
//!  │            PacketChannel           │
//!  │     (TcpChannel / LoopbackChannel) │
//!  └────────────────────────────────────┘
//! ```
//!
//! Each message is split into packets and sent stop-and-wait: one packet in
//! flight, answered by ACK (advance) or NACK (resend) depending on whether
//! its checksum survived the trip.
//!
//! Each module has a single responsibility:
//! - [`packet`]      — packet kinds, checksum, wire format
//! - [`packetizer`]  — message → packets
//! - [`config`]      — per-connection tuning
//! - `state`         — queues, ack slot and liveness shared by the workers
//! - [`sender`]      — stop-and-wait send worker
//! - [`receiver`]    — validating, reassembling receive worker
//! - [`connection`]  — public API and lifecycle
//! - [`channel`]     — the packet channel trait
//! - [`socket`]      — TCP channel
//! - [`simulator`]   — in-process loopback with payload corruption

pub mod channel;
pub mod config;
pub mod connection;
pub mod packet;
pub mod packetizer;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub(crate) mod state;

pub use channel::{ChannelError, PacketChannel};
pub use config::RtpConfig;
pub use connection::{Connection, RtpError, RtpListener};
pub use packet::{checksum, Packet, PacketType, MAX_PAYLOAD_LENGTH};
pub use packetizer::packetize;
pub use simulator::{loopback_pair, LoopbackChannel, SimulatorConfig};
pub use socket::TcpChannel;
pub use state::ConnectionStats;
