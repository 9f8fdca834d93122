//! Entry point for `rtp`.
//!
//! Parses CLI arguments and dispatches into either **server** (echo) or
//! **client** (stdin lines) mode.  All protocol work is delegated to the
//! library; `main.rs` owns only process setup (logging, argument parsing).

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use rtp::{Connection, RtpConfig, RtpError, RtpListener, MAX_PAYLOAD_LENGTH};

/// Reliable message transport over a corrupting packet channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args)]
struct Tuning {
    /// Maximum payload bytes per packet.
    #[arg(long, default_value_t = MAX_PAYLOAD_LENGTH, global = true)]
    max_payload: usize,
    /// Retransmissions allowed per packet before giving up (0 = unlimited).
    #[arg(long, default_value_t = rtp::config::DEFAULT_MAX_RETRIES, global = true)]
    max_retries: u32,
    /// Give up if no ACK/NACK arrives within this many milliseconds.
    #[arg(long, global = true)]
    ack_timeout_ms: Option<u64>,
}

impl Tuning {
    fn to_config(&self) -> RtpConfig {
        RtpConfig::default()
            .with_max_payload(self.max_payload)
            .with_max_retries((self.max_retries > 0).then_some(self.max_retries))
            .with_ack_timeout(self.ack_timeout_ms.map(Duration::from_millis))
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Accept peers one at a time and echo every message back.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Send each stdin line as a message and print the echoed reply.
    Client {
        /// Remote server host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Remote server port.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
    },
}

fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.tuning.to_config();
    config.validate().context("invalid tuning flags")?;

    match cli.mode {
        Mode::Server { bind } => serve(&bind, config),
        Mode::Client { host, port } => chat(&host, port, config),
    }
}

fn serve(bind: &str, config: RtpConfig) -> Result<()> {
    let listener = RtpListener::bind(bind)
        .with_context(|| format!("binding {bind}"))?
        .with_config(config)?;
    log::info!("Starting server on {}", listener.local_addr()?);

    loop {
        let conn = listener.accept().context("accepting peer")?;
        loop {
            match conn.receive_message() {
                Ok(message) => {
                    log::info!("echoing {} bytes", message.len());
                    if conn.send_message(&message).is_err() {
                        break;
                    }
                }
                Err(RtpError::ConnectionClosed) => break,
                Err(e) => return Err(e.into()),
            }
        }
        let _ = conn.disconnect();
        log::info!("peer left; stats: {:?}", conn.stats());
    }
}

fn chat(host: &str, port: u16, config: RtpConfig) -> Result<()> {
    log::info!("Starting client, connecting to {host}:{port}");
    let conn = Connection::connect_with(host, port, config)?;
    let stdout = io::stdout();

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        conn.send_message(line.as_bytes())?;
        let reply = conn.receive_message()?;
        writeln!(stdout.lock(), "{}", String::from_utf8_lossy(&reply))?;
    }

    conn.disconnect()?;
    log::info!("stats: {:?}", conn.stats());
    Ok(())
}
