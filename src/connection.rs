//! Per-connection lifecycle and the public message API.
//!
//! A [`Connection`] owns the complete state for one logical stream.  Its
//! responsibilities are:
//! - Opening the packet channel (actively via [`Connection::connect`], or by
//!   accepting through an [`RtpListener`]).
//! - Spawning the send and receive workers and joining them at teardown.
//! - Exposing a blocking message API: [`Connection::send_message`] hands a
//!   copy to the send worker, [`Connection::receive_message`] waits for the
//!   receive worker to complete one.
//!
//! Every method takes `&self`; share a connection behind an `Arc` to receive
//! on one thread while another sends or disconnects.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::channel::{ChannelError, PacketChannel};
use crate::config::RtpConfig;
use crate::packet::{Packet, PacketType};
use crate::receiver::run_recv_worker;
use crate::sender::run_send_worker;
use crate::socket::TcpChannel;
use crate::state::{lock, ConnectionStats, Shared};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors surfaced by the RTP layer.
#[derive(Debug, Error)]
pub enum RtpError {
    /// The connection is (or became) unusable.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("out of memory: could not allocate {requested} elements")]
    OutOfMemory { requested: usize },
    #[error("packet still corrupted after {retries} retransmissions")]
    RetriesExhausted { retries: u32 },
    #[error("no ACK or NACK within {0:?}")]
    AckTimeout(Duration),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: ChannelError,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl From<std::io::Error> for RtpError {
    fn from(err: std::io::Error) -> Self {
        Self::Channel(ChannelError::Io(err))
    }
}

struct Workers {
    send: JoinHandle<()>,
    recv: JoinHandle<()>,
}

/// A handle to a single reliable connection.
pub struct Connection {
    shared: Arc<Shared>,
    /// `None` once [`Connection::disconnect`] has run.
    workers: Mutex<Option<Workers>>,
}

impl Connection {
    /// Connect to `host:port` over TCP with the default [`RtpConfig`].
    pub fn connect(host: &str, port: u16) -> Result<Self, RtpError> {
        Self::connect_with(host, port, RtpConfig::default())
    }

    /// Connect to `host:port` over TCP.
    ///
    /// No worker threads are created if the channel cannot be opened.
    pub fn connect_with(host: &str, port: u16, config: RtpConfig) -> Result<Self, RtpError> {
        config.validate()?;
        let channel = TcpChannel::connect(host, port).map_err(|source| RtpError::Connect {
            addr: format!("{host}:{port}"),
            source,
        })?;
        log::info!("[rtp] connected to {}", channel.peer_addr);
        Self::open(channel, config)
    }

    /// Start a connection over an already-open channel and spawn its workers.
    pub fn open<C>(channel: C, config: RtpConfig) -> Result<Self, RtpError>
    where
        C: PacketChannel + 'static,
    {
        config.validate()?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::new(format!("rtp-{id}"), Box::new(channel), config));

        let recv = spawn_worker("rtp-recv", id, &shared, run_recv_worker)?;
        let send = match spawn_worker("rtp-send", id, &shared, run_send_worker) {
            Ok(handle) => handle,
            Err(e) => {
                shared.close();
                shared.channel.shutdown();
                let _ = recv.join();
                return Err(e);
            }
        };

        log::debug!("[{}] connection open", shared.label);
        Ok(Self {
            shared,
            workers: Mutex::new(Some(Workers { send, recv })),
        })
    }

    /// Queue a copy of `message` for delivery.
    ///
    /// Returns as soon as the copy is queued; delivery happens on the send
    /// worker.  Fails with [`RtpError::ConnectionClosed`] if the connection is
    /// no longer alive.
    pub fn send_message(&self, message: &[u8]) -> Result<(), RtpError> {
        if !self.shared.is_alive() {
            return Err(RtpError::ConnectionClosed);
        }
        let mut copy = Vec::new();
        copy.try_reserve_exact(message.len())
            .map_err(|_| RtpError::OutOfMemory { requested: message.len() })?;
        copy.extend_from_slice(message);
        self.shared.outbound.push(copy);
        Ok(())
    }

    /// Block until the next complete message arrives.
    ///
    /// Fails with [`RtpError::ConnectionClosed`] if the connection is dead on
    /// entry, or dies while waiting with nothing queued.
    pub fn receive_message(&self) -> Result<Vec<u8>, RtpError> {
        if !self.shared.is_alive() {
            return Err(RtpError::ConnectionClosed);
        }
        self.shared
            .inbound
            .pop_blocking(&self.shared.alive)
            .ok_or(RtpError::ConnectionClosed)
    }

    /// Close the connection: tell the peer, stop and join both workers and
    /// drop any messages still queued in either direction.
    ///
    /// Only the first call does anything; later calls return
    /// [`RtpError::ConnectionClosed`].
    pub fn disconnect(&self) -> Result<(), RtpError> {
        let workers = lock(&self.workers).take();
        match workers {
            Some(workers) => {
                self.teardown(workers);
                Ok(())
            }
            None => Err(RtpError::ConnectionClosed),
        }
    }

    /// `false` once the peer left, the channel failed or
    /// [`Connection::disconnect`] was called.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.counters.snapshot()
    }

    pub fn config(&self) -> &RtpConfig {
        &self.shared.config
    }

    fn teardown(&self, workers: Workers) {
        let shared = &self.shared;
        if let Err(e) = shared.channel.try_send_packet(&Packet::control(PacketType::Term)) {
            log::debug!("[{}] TERM not delivered: {e}", shared.label);
        }
        shared.close();
        shared.channel.shutdown();

        for (name, handle) in [("send", workers.send), ("recv", workers.recv)] {
            if handle.join().is_err() {
                log::warn!("[{}] {name} worker panicked", shared.label);
            }
        }

        let unsent = shared.outbound.drain().len();
        let unread = shared.inbound.drain().len();
        log::info!(
            "[{}] disconnected ({unsent} unsent, {unread} unread messages dropped)",
            shared.label
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(workers) = lock(&self.workers).take() {
            self.teardown(workers);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    name: &str,
    id: u64,
    shared: &Arc<Shared>,
    body: fn(Arc<Shared>),
) -> Result<JoinHandle<()>, RtpError> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("{name}-{id}"))
        .spawn(move || body(shared))
        .map_err(RtpError::Spawn)
}

/// Passive side: accepts TCP peers and wraps each in a [`Connection`].
#[derive(Debug)]
pub struct RtpListener {
    inner: TcpListener,
    config: RtpConfig,
}

impl RtpListener {
    /// Bind to `addr`.  Passing port 0 lets the OS choose an ephemeral port.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, RtpError> {
        Ok(Self {
            inner: TcpListener::bind(addr)?,
            config: RtpConfig::default(),
        })
    }

    /// Configuration applied to every accepted connection.
    pub fn with_config(mut self, config: RtpConfig) -> Result<Self, RtpError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RtpError> {
        Ok(self.inner.local_addr()?)
    }

    /// Block until a peer connects.
    pub fn accept(&self) -> Result<Connection, RtpError> {
        let (stream, peer) = self.inner.accept()?;
        log::info!("[rtp] accepted {peer}");
        Connection::open(TcpChannel::from_stream(stream)?, self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{loopback_pair, SimulatorConfig};

    fn pair() -> (Connection, Connection) {
        let (a, b) = loopback_pair(SimulatorConfig::clean(), SimulatorConfig::clean());
        (
            Connection::open(a, RtpConfig::default()).unwrap(),
            Connection::open(b, RtpConfig::default()).unwrap(),
        )
    }

    #[test]
    fn open_rejects_invalid_config() {
        let (a, _b) = loopback_pair(SimulatorConfig::clean(), SimulatorConfig::clean());
        let err = Connection::open(a, RtpConfig::default().with_max_payload(0)).unwrap_err();
        assert!(matches!(err, RtpError::InvalidConfig(_)));
    }

    #[test]
    fn send_after_disconnect_fails() {
        let (a, _b) = pair();
        a.disconnect().unwrap();
        assert!(!a.is_alive());
        assert!(matches!(a.send_message(b"x"), Err(RtpError::ConnectionClosed)));
        assert!(matches!(a.receive_message(), Err(RtpError::ConnectionClosed)));
    }

    #[test]
    fn second_disconnect_reports_closed() {
        let (a, _b) = pair();
        assert!(a.disconnect().is_ok());
        assert!(matches!(a.disconnect(), Err(RtpError::ConnectionClosed)));
    }

    #[test]
    fn connect_failure_spawns_nothing() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = Connection::connect("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, RtpError::Connect { .. }));
    }

    #[test]
    fn message_survives_round_trip() {
        let (a, b) = pair();
        a.send_message(b"ping").unwrap();
        assert_eq!(b.receive_message().unwrap(), b"ping");
        assert_eq!(b.stats().messages_received, 1);
        a.disconnect().unwrap();
        b.disconnect().unwrap();
    }
}
