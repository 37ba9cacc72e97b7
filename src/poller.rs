//! Poller registrations
//!
//! A [`PollerDescriptor`] describes one sensor: which registers to read,
//! how often, and how to turn the response into a [`Reading`]. The
//! [`PollerRegistry`] owned by the manager decides which descriptors are due
//! on each tick and routes results to their [`ReadingSink`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::byte_order::ByteOrder;
use crate::codec::{Scaling, Transcoder};
use crate::constants::{DEFAULT_POLL_INTERVAL_16_MS, DEFAULT_POLL_INTERVAL_32_MS};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::{ReadFunction, RequestPdu, ResponseBody};
use crate::value::{Reading, ValueFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollerId(pub(crate) u32);

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poller-{}", self.0)
    }
}

/// Receives the outcome of each poll
///
/// Called on the manager task; implementations must not block.
pub trait ReadingSink: Send + Sync {
    fn publish(&self, reading: &Reading);

    /// A poll ended without a value (exception, timeout, bad response)
    fn publish_failure(&self, _sensor: &str, _error: &ModbusError) {}
}

impl<F> ReadingSink for F
where
    F: Fn(&Reading) + Send + Sync,
{
    fn publish(&self, reading: &Reading) {
        self(reading)
    }
}

/// Forwards readings into a tokio channel, dropping them when it is full
#[derive(Debug, Clone)]
pub struct ChannelSink(pub tokio::sync::mpsc::Sender<Reading>);

impl ReadingSink for ChannelSink {
    fn publish(&self, reading: &Reading) {
        if let Err(err) = self.0.try_send(reading.clone()) {
            debug!("Reading for {} not forwarded: {}", reading.sensor, err);
        }
    }
}

#[derive(Clone)]
pub struct PollerDescriptor {
    pub name: String,
    pub address: u16,
    pub function: ReadFunction,
    pub transcoder: Transcoder,
    pub interval: Duration,
    last_scheduled: Option<Instant>,
    sink: Arc<dyn ReadingSink>,
}

impl fmt::Debug for PollerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerDescriptor")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("function", &self.function)
            .field("transcoder", &self.transcoder)
            .field("interval", &self.interval)
            .field("last_scheduled", &self.last_scheduled)
            .finish_non_exhaustive()
    }
}

impl PollerDescriptor {
    /// Holding-register Int16 sensor with the 16-bit defaults
    pub fn new(name: impl Into<String>, address: u16, sink: Arc<dyn ReadingSink>) -> Self {
        Self {
            name: name.into(),
            address,
            function: ReadFunction::HoldingRegisters,
            transcoder: Transcoder::new(ValueFormat::Int16, ByteOrder::AbCd, Scaling::default()),
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_16_MS),
            last_scheduled: None,
            sink,
        }
    }

    pub fn with_function(mut self, function: ReadFunction) -> Self {
        self.function = function;
        if function.is_bit_access() {
            self.transcoder.format = ValueFormat::Bool;
        }
        self
    }

    /// Also switches the interval to the 32-bit default for 32-bit formats
    pub fn with_format(mut self, format: ValueFormat) -> Self {
        if format.is_32bit() && !self.transcoder.format.is_32bit() {
            self.interval = Duration::from_millis(DEFAULT_POLL_INTERVAL_32_MS);
        }
        self.transcoder.format = format;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.transcoder.byte_order = byte_order;
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.transcoder.scaling = scaling;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.interval.is_zero() {
            return Err(ModbusError::configuration(format!(
                "{}: poll interval must be positive",
                self.name
            )));
        }
        if self.function.is_bit_access() != (self.transcoder.format == ValueFormat::Bool) {
            return Err(ModbusError::configuration(format!(
                "{}: format {:?} does not fit {:?}",
                self.name, self.transcoder.format, self.function
            )));
        }
        self.transcoder.scaling.validate()?;
        self.request_pdu().map(|_| ())
    }

    pub fn register_count(&self) -> u16 {
        self.transcoder.format.register_count()
    }

    pub fn request_pdu(&self) -> ModbusResult<RequestPdu> {
        RequestPdu::read(self.function, self.address, self.register_count())
    }

    #[inline]
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_scheduled
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval)
    }

    pub fn mark_scheduled(&mut self, now: Instant) {
        self.last_scheduled = Some(now);
    }

    pub fn last_scheduled(&self) -> Option<Instant> {
        self.last_scheduled
    }

    /// Decode a response and hand the reading to the sink
    pub fn deliver(&self, result: ModbusResult<ResponseBody>) -> ModbusResult<Reading> {
        let reading = result.and_then(|body| self.transcoder.transcode(&self.name, &body));
        match &reading {
            Ok(reading) => {
                debug!("{}: {} (raw {})", self.name, reading, reading.raw);
                self.sink.publish(reading);
            }
            Err(err) => self.sink.publish_failure(&self.name, err),
        }
        reading
    }
}

/// Descriptors registered with one manager
#[derive(Debug, Default)]
pub struct PollerRegistry {
    next_id: u32,
    pollers: BTreeMap<PollerId, PollerDescriptor>,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, descriptor: PollerDescriptor) -> ModbusResult<PollerId> {
        descriptor.validate()?;
        self.next_id += 1;
        let id = PollerId(self.next_id);
        debug!("Registered {} as {}", descriptor.name, id);
        self.pollers.insert(id, descriptor);
        Ok(id)
    }

    pub fn remove(&mut self, id: PollerId) -> Option<PollerDescriptor> {
        self.pollers.remove(&id)
    }

    pub fn get(&self, id: PollerId) -> Option<&PollerDescriptor> {
        self.pollers.get(&id)
    }

    pub fn get_mut(&mut self, id: PollerId) -> Option<&mut PollerDescriptor> {
        self.pollers.get_mut(&id)
    }

    /// Descriptors whose interval elapsed, in registration order
    pub fn due(&self, now: Instant) -> Vec<PollerId> {
        self.pollers
            .iter()
            .filter(|(_, descriptor)| descriptor.is_due(now))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }
}
