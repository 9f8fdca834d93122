//! TCP packet channel.
//!
//! [`TcpChannel`] is a thin wrapper around `std::net::TcpStream` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and framing.
//!
//! The stream is cloned three ways so the receive worker can sit in a
//! blocking read while the send side writes, and so [`PacketChannel::shutdown`]
//! can interrupt that read without taking either lock.

use std::io::{BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, TryLockError};
use std::time::Duration;

use crate::channel::{ChannelError, PacketChannel};
use crate::packet::{decode_header, Packet, HEADER_LEN};
use crate::state::lock;

/// Upper bound on how long a best-effort final write may stall.
const FINAL_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

/// A blocking, packet-oriented TCP stream.
#[derive(Debug)]
pub struct TcpChannel {
    /// Address of the remote end.
    pub peer_addr: SocketAddr,
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    closed: AtomicBool,
}

impl TcpChannel {
    /// Resolve `host:port` and connect to the first address that accepts.
    pub fn connect(host: &str, port: u16) -> Result<Self, ChannelError> {
        let mut last_err = None;
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    log::debug!("[tcp] connect {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| {
                std::io::Error::new(ErrorKind::NotFound, format!("{host} resolved to no addresses"))
            })
            .into())
    }

    /// Wrap an already-connected stream (e.g. one returned by `accept`).
    pub fn from_stream(stream: TcpStream) -> Result<Self, ChannelError> {
        // ACK/NACK packets are tiny and latency-bound.
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let control = stream.try_clone()?;
        Ok(Self {
            peer_addr,
            reader: Mutex::new(reader),
            writer: Mutex::new(stream),
            control,
            closed: AtomicBool::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Map end-of-stream style errors onto [`ChannelError::Closed`].
fn classify(err: std::io::Error) -> ChannelError {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => ChannelError::Closed,
        _ => ChannelError::Io(err),
    }
}

impl PacketChannel for TcpChannel {
    fn send_packet(&self, packet: &Packet) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bytes = packet.encode()?;
        let mut writer = lock(&self.writer);
        writer.write_all(&bytes).map_err(classify)?;
        writer.flush().map_err(classify)?;
        Ok(bytes.len())
    }

    fn try_send_packet(&self, packet: &Packet) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bytes = packet.encode()?;
        let mut writer = match self.writer.try_lock() {
            Ok(writer) => writer,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(ChannelError::Busy),
        };
        // Only called right before shutdown; the timeout is never reset.
        writer.set_write_timeout(Some(FINAL_WRITE_TIMEOUT))?;
        writer.write_all(&bytes).map_err(classify)?;
        Ok(bytes.len())
    }

    fn recv_packet(&self) -> Result<Packet, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut reader = lock(&self.reader);

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).map_err(classify)?;
        let (kind, payload_len, checksum) = decode_header(&header)?;

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).map_err(classify)?;

        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        Ok(Packet {
            kind,
            checksum,
            payload,
        })
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                log::warn!("[tcp] shutdown {} failed: {e}", self.peer_addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            TcpChannel::from_stream(stream).unwrap()
        });
        let client = TcpChannel::connect("127.0.0.1", port).unwrap();
        (client, server.join().unwrap())
    }

    #[test]
    fn packets_cross_the_stream_intact() {
        let (a, b) = pair();
        let sent = Packet::data(PacketType::LastData, b"over tcp".to_vec());
        let n = a.send_packet(&sent).unwrap();
        assert_eq!(n, HEADER_LEN + 8);
        assert_eq!(b.recv_packet().unwrap(), sent);

        b.send_packet(&Packet::control(PacketType::Ack)).unwrap();
        assert_eq!(a.recv_packet().unwrap().kind, PacketType::Ack);
    }

    #[test]
    fn shutdown_unblocks_pending_read() {
        let (a, _b) = pair();
        let a = std::sync::Arc::new(a);
        let reader = {
            let a = a.clone();
            thread::spawn(move || a.recv_packet())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        a.shutdown();
        assert!(reader.join().unwrap().is_err());
        assert!(matches!(
            a.send_packet(&Packet::control(PacketType::Term)),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn final_send_skips_a_held_writer() {
        let (a, b) = pair();
        let guard = a.writer.lock().unwrap();
        assert!(matches!(
            a.try_send_packet(&Packet::control(PacketType::Term)),
            Err(ChannelError::Busy)
        ));
        drop(guard);

        a.try_send_packet(&Packet::control(PacketType::Term)).unwrap();
        assert_eq!(b.recv_packet().unwrap().kind, PacketType::Term);
    }

    #[test]
    fn peer_close_reads_as_closed() {
        let (a, b) = pair();
        drop(b);
        assert!(matches!(a.recv_packet(), Err(ChannelError::Closed)));
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(TcpChannel::connect("127.0.0.1", port).is_err());
    }
}
