//! Manager configuration
//!
//! Loaded from YAML:
//!
//! ```yaml
//! host: 192.168.1.50
//! port: 502
//! unit_id: 1
//! response_timeout_ms: 1000
//! max_retries: 3
//! sensors:
//!   - name: energy
//!     register_address: 100
//!     value_type: uint32
//!     byte_order: CD_AB
//!     accuracy_decimals: 1
//!   - name: temperature
//!     register_address: 10
//!     function_code: 4
//!     scale: 0.1
//!     update_interval_ms: 5000
//! watchdog:
//!   register: 500
//!   safe_mode:
//!     - { register: 20, value: 0 }
//! ```
//!
//! Sensor `scale` and `update_interval_ms` default by value width: 16-bit
//! sensors use 0.1 and 30 s, 32-bit sensors 1.0 and 60 s.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::byte_order::ByteOrder;
use crate::codec::Scaling;
use crate::connection::{BackoffConfig, ConnectionSettings};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ReadFunction;
use crate::poller::{PollerDescriptor, ReadingSink};
use crate::scheduler::SchedulerConfig;
use crate::value::ValueFormat;
use crate::watchdog::WatchdogConfig;

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_unit_id() -> u8 {
    DEFAULT_UNIT_ID
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_max_retries() -> u8 {
    DEFAULT_MAX_RETRIES
}

fn default_max_queue_depth() -> usize {
    DEFAULT_MAX_QUEUE_DEPTH
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Re-sends after a timeout or connection loss
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Connect at startup instead of on the first request
    #[serde(default = "default_true")]
    pub eager_connect: bool,
    /// Hex dump every frame at info level
    #[serde(default)]
    pub packet_logging: bool,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub watchdog: Option<WatchdogConfig>,
}

impl ManagerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TCP_PORT,
            unit_id: DEFAULT_UNIT_ID,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            backoff: BackoffConfig::default(),
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            eager_connect: true,
            packet_logging: false,
            sensors: Vec::new(),
            watchdog: None,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_response_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.response_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u8) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.backoff = BackoffConfig { initial_ms, max_ms };
        self
    }

    pub fn with_tick_interval_ms(mut self, tick_ms: u64) -> Self {
        self.tick_interval_ms = tick_ms;
        self
    }

    pub fn with_eager_connect(mut self, eager: bool) -> Self {
        self.eager_connect = eager;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn with_sensor(mut self, sensor: SensorConfig) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::configuration("host must not be empty"));
        }
        if self.unit_id == 0 {
            return Err(ModbusError::configuration("unit_id out of range (1-255)"));
        }
        if self.response_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ModbusError::configuration("timeouts must be positive"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ModbusError::configuration("tick_interval_ms must be positive"));
        }
        if self.max_queue_depth == 0 {
            return Err(ModbusError::configuration("max_queue_depth must be positive"));
        }
        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ModbusError::configuration(format!(
                "backoff initial_ms {} must be positive and at most max_ms {}",
                self.backoff.initial_ms, self.backoff.max_ms
            )));
        }
        for sensor in &self.sensors {
            sensor.validate()?;
        }
        if let Some(watchdog) = &self.watchdog {
            watchdog.validate()?;
        }
        Ok(())
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            unit_id: self.unit_id,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            max_retries: self.max_retries,
            max_queue_depth: self.max_queue_depth,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            host: self.host.clone(),
            port: self.port,
            unit_id: self.unit_id,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.response_timeout_ms),
            backoff: self.backoff,
            packet_logging: self.packet_logging,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_function_code() -> u8 {
    FC_READ_HOLDING_REGISTERS
}

fn default_value_type() -> ValueFormat {
    ValueFormat::Int16
}

fn default_accuracy_decimals() -> u8 {
    DEFAULT_ACCURACY_DECIMALS
}

/// One polled sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub register_address: u16,
    #[serde(default = "default_function_code")]
    pub function_code: u8,
    #[serde(default = "default_value_type")]
    pub value_type: ValueFormat,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_accuracy_decimals")]
    pub accuracy_decimals: u8,
    #[serde(default)]
    pub update_interval_ms: Option<u64>,
}

impl SensorConfig {
    pub fn new(name: impl Into<String>, register_address: u16) -> Self {
        Self {
            name: name.into(),
            register_address,
            function_code: FC_READ_HOLDING_REGISTERS,
            value_type: ValueFormat::Int16,
            byte_order: ByteOrder::default(),
            scale: None,
            offset: 0.0,
            accuracy_decimals: DEFAULT_ACCURACY_DECIMALS,
            update_interval_ms: None,
        }
    }

    pub fn with_function_code(mut self, function_code: u8) -> Self {
        self.function_code = function_code;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueFormat) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_accuracy_decimals(mut self, decimals: u8) -> Self {
        self.accuracy_decimals = decimals;
        self
    }

    pub fn with_update_interval_ms(mut self, interval_ms: u64) -> Self {
        self.update_interval_ms = Some(interval_ms);
        self
    }

    /// Value layout, forced to `Bool` for coil and discrete-input reads
    pub fn format(&self) -> ModbusResult<ValueFormat> {
        let function = ReadFunction::from_code(self.function_code)?;
        Ok(if function.is_bit_access() {
            ValueFormat::Bool
        } else {
            self.value_type
        })
    }

    pub fn scaling(&self) -> ModbusResult<Scaling> {
        let default_scale = match self.format()? {
            ValueFormat::Bool => 1.0,
            format if format.is_32bit() => DEFAULT_SCALE_32,
            _ => DEFAULT_SCALE_16,
        };
        Ok(Scaling::new(self.scale.unwrap_or(default_scale))
            .with_offset(self.offset)
            .with_accuracy(self.accuracy_decimals))
    }

    pub fn interval(&self) -> ModbusResult<Duration> {
        let default_ms = if self.format()?.is_32bit() {
            DEFAULT_POLL_INTERVAL_32_MS
        } else {
            DEFAULT_POLL_INTERVAL_16_MS
        };
        Ok(Duration::from_millis(
            self.update_interval_ms.unwrap_or(default_ms),
        ))
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("sensor name must not be empty"));
        }
        self.to_descriptor(Arc::new(|_: &crate::value::Reading| {}))?
            .validate()
    }

    /// Build the runtime descriptor feeding `sink`
    pub fn to_descriptor(&self, sink: Arc<dyn ReadingSink>) -> ModbusResult<PollerDescriptor> {
        let function = ReadFunction::from_code(self.function_code).map_err(|_| {
            ModbusError::configuration(format!(
                "{}: function_code {} not supported (1-4)",
                self.name, self.function_code
            ))
        })?;
        let descriptor = PollerDescriptor::new(self.name.clone(), self.register_address, sink)
            .with_function(function)
            .with_format(self.format()?)
            .with_byte_order(self.byte_order)
            .with_scaling(self.scaling()?)
            .with_interval(self.interval()?);
        Ok(descriptor)
    }
}
