//! Connection management
//!
//! [`Connection`] owns the TCP socket of one manager and drives its
//! lifecycle:
//!
//! ```text
//! DISCONNECTED ──ensure_connected──► CONNECTING ──ok──► CONNECTED
//!                                        │                  │ error / EOF
//!                                        └──fail──► FAULTED ◄┘
//!                                                    │ backoff elapsed
//!                                                    ├──► CONNECTING
//!                                                    └──► DISCONNECTED (park)
//! ```
//!
//! Connecting never blocks the caller: the connect future is stored and
//! polled through [`Connection::next_event`] alongside socket reads, so the
//! manager can keep serving commands while a connect is pending.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_BACKOFF_INITIAL_MS, DEFAULT_BACKOFF_MAX_MS, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
    RX_BUFFER_CAPACITY,
};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{log_packet, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Faulted => "FAULTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

/// Exponential reconnect delay, doubling from `initial_ms` up to `max_ms`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64 << self.attempt.min(16);
        let delay_ms = self
            .config
            .initial_ms
            .saturating_mul(factor)
            .min(self.config.max_ms);
        if delay_ms < self.config.max_ms {
            self.attempt += 1;
        }
        Duration::from_millis(delay_ms)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = ModbusResult<TcpStream>> + Send>>;

/// Raw result of waiting on the connection
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected(TcpStream),
    ConnectFailed(ModbusError),
    Received(usize),
    Closed,
    ReadFailed(ModbusError),
    RetryDue,
}

/// Effect of an event, as far as the request pipeline is concerned
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    Up,
    /// New bytes are in the receive buffer
    Data,
    /// An established link failed
    Lost(ModbusError),
    ConnectFailed(ModbusError),
    RetryDue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub connects: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub connect_timeout: Duration,
    /// Bound on a single socket write
    pub write_timeout: Duration,
    pub backoff: BackoffConfig,
    pub packet_logging: bool,
}

pub struct Connection {
    settings: ConnectionSettings,
    address: String,
    state: ConnectionState,
    stream: Option<TcpStream>,
    pending: Option<ConnectFuture>,
    rx: BytesMut,
    backoff: Backoff,
    retry_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    stats: ConnectionStats,
}

async fn connect_tcp(address: String, connect_timeout: Duration) -> ModbusResult<TcpStream> {
    debug!("TCP connecting: {}", address);
    match timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("TCP_NODELAY: {}", e);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(ModbusError::connection(format!(
            "Failed to connect to {}: {}",
            address, e
        ))),
        Err(_) => Err(ModbusError::connection(format!(
            "Connection to {} timed out after {}ms",
            address,
            connect_timeout.as_millis()
        ))),
    }
}

impl Connection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            address: format!("{}:{}", settings.host, settings.port),
            backoff: Backoff::new(settings.backoff),
            settings,
            state: ConnectionState::Disconnected,
            stream: None,
            pending: None,
            rx: BytesMut::with_capacity(RX_BUFFER_CAPACITY),
            retry_at: None,
            state_tx,
            stats: ConnectionStats::default(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// When the next reconnect attempt may start
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("{}: {} -> {}", self.address, self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Start connecting if needed; returns whether the link is usable now
    pub fn ensure_connected(&mut self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => false,
            ConnectionState::Disconnected => {
                self.start_connect();
                false
            }
            ConnectionState::Faulted => {
                if self.retry_at.map_or(true, |at| now >= at) {
                    self.start_connect();
                }
                false
            }
        }
    }

    fn start_connect(&mut self) {
        self.retry_at = None;
        self.pending = Some(Box::pin(connect_tcp(
            self.address.clone(),
            self.settings.connect_timeout,
        )));
        self.set_state(ConnectionState::Connecting);
    }

    /// Wait for the next thing to happen on the link
    ///
    /// Cancel safe: the connect future and receive buffer live in `self`.
    /// Pends forever while disconnected.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        if let Some(pending) = self.pending.as_mut() {
            return match pending.await {
                Ok(stream) => ConnectionEvent::Connected(stream),
                Err(err) => ConnectionEvent::ConnectFailed(err),
            };
        }

        if let Some(stream) = self.stream.as_mut() {
            if self.rx.capacity() - self.rx.len() < MBAP_HEADER_LEN + MAX_MBAP_LENGTH {
                self.rx.reserve(RX_BUFFER_CAPACITY);
            }
            return match stream.read_buf(&mut self.rx).await {
                Ok(0) => ConnectionEvent::Closed,
                Ok(n) => ConnectionEvent::Received(n),
                Err(e) => ConnectionEvent::ReadFailed(ModbusError::connection(format!(
                    "Read failed: {}",
                    e
                ))),
            };
        }

        if let (ConnectionState::Faulted, Some(at)) = (self.state, self.retry_at) {
            sleep_until(at).await;
            return ConnectionEvent::RetryDue;
        }

        std::future::pending().await
    }

    /// Apply an event returned by [`Connection::next_event`]
    pub fn handle_event(&mut self, event: ConnectionEvent, now: Instant) -> LinkUpdate {
        match event {
            ConnectionEvent::Connected(stream) => {
                self.pending = None;
                self.stream = Some(stream);
                self.rx.clear();
                self.backoff.reset();
                self.stats.connects += 1;
                info!("TCP connected: {}", self.address);
                self.set_state(ConnectionState::Connected);
                LinkUpdate::Up
            }
            ConnectionEvent::ConnectFailed(err) => {
                self.pending = None;
                self.stats.connect_failures += 1;
                self.fault(now, &err);
                LinkUpdate::ConnectFailed(err)
            }
            ConnectionEvent::Received(n) => {
                self.stats.bytes_received += n as u64;
                let start = self.rx.len().saturating_sub(n);
                log_packet(
                    self.settings.packet_logging,
                    Direction::Receive,
                    &self.rx[start..],
                    self.settings.unit_id,
                );
                LinkUpdate::Data
            }
            ConnectionEvent::Closed => {
                let err = ModbusError::connection(format!("{} closed the connection", self.address));
                self.fault(now, &err);
                LinkUpdate::Lost(err)
            }
            ConnectionEvent::ReadFailed(err) => {
                self.fault(now, &err);
                LinkUpdate::Lost(err)
            }
            ConnectionEvent::RetryDue => LinkUpdate::RetryDue,
        }
    }

    /// Write one frame
    ///
    /// A failed or timed-out write faults the link.
    pub async fn send(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ModbusError::connection(format!(
                "{} not connected",
                self.address
            )));
        };

        log_packet(
            self.settings.packet_logging,
            Direction::Send,
            frame,
            self.settings.unit_id,
        );
        let err = match timeout(self.settings.write_timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => {
                self.stats.bytes_sent += frame.len() as u64;
                return Ok(());
            }
            Ok(Err(e)) => ModbusError::connection(format!("Send failed: {}", e)),
            Err(_) => ModbusError::connection(format!(
                "Send timed out after {}ms",
                self.settings.write_timeout.as_millis()
            )),
        };
        self.fault(Instant::now(), &err);
        Err(err)
    }

    /// Receive buffer holding bytes not yet decoded
    pub fn rx_buffer(&mut self) -> &mut BytesMut {
        &mut self.rx
    }

    /// Drop undecodable bytes after a framing error
    pub fn discard_rx(&mut self) {
        if !self.rx.is_empty() {
            warn!("{}: discarding {} unframed bytes", self.address, self.rx.len());
            self.rx.clear();
        }
    }

    /// Drop the socket and schedule a reconnect after backoff
    pub fn fault(&mut self, now: Instant, reason: &ModbusError) {
        if self.stream.take().is_some() {
            self.stats.disconnects += 1;
        }
        self.pending = None;
        self.rx.clear();
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        warn!(
            "{}: {} (reconnect in {}ms, attempt {})",
            self.address,
            reason,
            delay.as_millis(),
            self.backoff.attempt()
        );
        self.set_state(ConnectionState::Faulted);
    }

    /// Give up a due reconnect until there is work again
    ///
    /// Leaves a faulted link `Disconnected`, where [`Connection::next_event`]
    /// pends and the next [`Connection::ensure_connected`] connects at once.
    pub fn park(&mut self) {
        if self.state == ConnectionState::Faulted {
            self.retry_at = None;
            debug!("{}: reconnect deferred until work is queued", self.address);
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Close the socket without scheduling a reconnect
    pub async fn close(&mut self) {
        self.pending = None;
        self.retry_at = None;
        self.rx.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {}", e);
            }
            self.stats.disconnects += 1;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}
