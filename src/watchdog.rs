//! Link watchdog and safe mode
//!
//! Every `interval_ms`, starting one interval after the manager starts, the
//! manager writes an incrementing counter to the watchdog register and,
//! after `readback_delay_ms`, reads it back. The slave is expected to change
//! the value in between. An unchanged value, a failed write or read, or a
//! missing connection puts the manager into safe mode: the configured
//! safe-mode registers are written once. The next healthy cycle leaves safe
//! mode.
//!
//! [`Watchdog`] is a state machine; the manager turns its
//! [`WatchdogAction`]s into queued requests and feeds the results back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::constants::{DEFAULT_WATCHDOG_INTERVAL_MS, DEFAULT_WATCHDOG_READBACK_DELAY_MS};
use crate::error::{ModbusError, ModbusResult};

/// Which half of a watchdog cycle a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStep {
    WriteCounter,
    ReadBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeModeWrite {
    pub register: u16,
    pub value: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub register: u16,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_readback_delay_ms")]
    pub readback_delay_ms: u64,
    #[serde(default)]
    pub safe_mode: Vec<SafeModeWrite>,
}

fn default_interval_ms() -> u64 {
    DEFAULT_WATCHDOG_INTERVAL_MS
}

fn default_readback_delay_ms() -> u64 {
    DEFAULT_WATCHDOG_READBACK_DELAY_MS
}

impl WatchdogConfig {
    pub fn new(register: u16) -> Self {
        Self {
            register,
            interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            readback_delay_ms: DEFAULT_WATCHDOG_READBACK_DELAY_MS,
            safe_mode: Vec::new(),
        }
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_readback_delay_ms(mut self, readback_delay_ms: u64) -> Self {
        self.readback_delay_ms = readback_delay_ms;
        self
    }

    pub fn with_safe_mode_write(mut self, register: u16, value: i16) -> Self {
        self.safe_mode.push(SafeModeWrite { register, value });
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.interval_ms == 0 {
            return Err(ModbusError::configuration("watchdog interval_ms must be positive"));
        }
        if self.readback_delay_ms >= self.interval_ms {
            return Err(ModbusError::configuration(format!(
                "watchdog readback_delay_ms {} must be shorter than interval_ms {}",
                self.readback_delay_ms, self.interval_ms
            )));
        }
        Ok(())
    }
}

/// Request the manager should issue on behalf of the watchdog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogAction {
    WriteCounter { register: u16, value: u16 },
    ReadBack { register: u16 },
    EnterSafeMode(Vec<SafeModeWrite>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Writing,
    AwaitingReadBack { at: Instant },
    Reading,
}

#[derive(Debug)]
pub struct Watchdog {
    config: WatchdogConfig,
    counter: u16,
    phase: Phase,
    last_cycle: Option<Instant>,
    safe_mode: bool,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            counter: 0,
            phase: Phase::Idle,
            last_cycle: None,
            safe_mode: false,
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn is_safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    /// Advance on the manager tick
    pub fn on_tick(&mut self, now: Instant, connected: bool) -> Option<WatchdogAction> {
        match self.phase {
            Phase::Idle => {
                // the first tick only arms the timer
                let Some(last) = self.last_cycle else {
                    self.last_cycle = Some(now);
                    return None;
                };
                if now.saturating_duration_since(last) < self.interval() {
                    return None;
                }
                self.last_cycle = Some(now);
                if !connected {
                    return self.fail("not connected");
                }
                self.counter = self.counter.wrapping_add(1);
                self.phase = Phase::Writing;
                Some(WatchdogAction::WriteCounter {
                    register: self.config.register,
                    value: self.counter,
                })
            }
            Phase::AwaitingReadBack { at } if now >= at => {
                self.phase = Phase::Reading;
                Some(WatchdogAction::ReadBack {
                    register: self.config.register,
                })
            }
            _ => None,
        }
    }

    pub fn on_write_complete<T>(
        &mut self,
        result: &ModbusResult<T>,
        now: Instant,
    ) -> Option<WatchdogAction> {
        match result {
            Ok(_) => {
                self.phase = Phase::AwaitingReadBack {
                    at: now + Duration::from_millis(self.config.readback_delay_ms),
                };
                None
            }
            Err(err) => {
                self.phase = Phase::Idle;
                self.fail(&format!("counter write failed: {}", err))
            }
        }
    }

    pub fn on_read_complete(&mut self, result: ModbusResult<u16>) -> Option<WatchdogAction> {
        self.phase = Phase::Idle;
        match result {
            Ok(value) if value != self.counter => {
                self.counter = value;
                if self.safe_mode {
                    info!("Watchdog healthy again (counter {}), leaving safe mode", value);
                    self.safe_mode = false;
                }
                None
            }
            Ok(value) => self.fail(&format!("counter unchanged at {}", value)),
            Err(err) => self.fail(&format!("read-back failed: {}", err)),
        }
    }

    /// The watchdog request could not be queued
    pub fn on_rejected(&mut self, err: &ModbusError) -> Option<WatchdogAction> {
        self.phase = Phase::Idle;
        self.fail(&format!("request rejected: {}", err))
    }

    fn fail(&mut self, reason: &str) -> Option<WatchdogAction> {
        if self.safe_mode {
            return None;
        }
        self.safe_mode = true;
        warn!(
            "Watchdog failure ({}), entering safe mode with {} writes",
            reason,
            self.config.safe_mode.len()
        );
        Some(WatchdogAction::EnterSafeMode(self.config.safe_mode.clone()))
    }
}
