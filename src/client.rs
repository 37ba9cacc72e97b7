//! Client handle for a running manager
//!
//! [`ManagerHandle`] is the cloneable front door to a manager task. Every
//! call turns into a command on the manager's channel; nothing here touches
//! the socket.
//!
//! # API Naming Convention
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//!
//! Validation and queue admission happen synchronously in [`ManagerHandle::submit`];
//! the returned [`PendingWrite`] resolves once the slave answered or the
//! request was given up.
//!
//! ```rust,no_run
//! use voltage_modbus_manager::{ManagerConfig, ModbusTcpManager, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = ManagerConfig::new("192.168.1.50");
//!     let (handle, _task) = ModbusTcpManager::spawn(config)?;
//!
//!     handle.write_06(100, 0x1234).await?;
//!     handle.write_10(200, &[1, 2, 3]).await?;
//!
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::connection::ConnectionState;
use crate::error::{ModbusError, ModbusResult};
use crate::manager::ManagerStats;
use crate::pdu::RequestPdu;
use crate::poller::{PollerDescriptor, PollerId};

pub(crate) enum Command {
    Submit {
        pdu: RequestPdu,
        reply: oneshot::Sender<ModbusResult<()>>,
    },
    AddPoller {
        descriptor: PollerDescriptor,
        reply: oneshot::Sender<ModbusResult<PollerId>>,
    },
    RemovePoller {
        id: PollerId,
        reply: oneshot::Sender<bool>,
    },
    PollNow {
        id: PollerId,
        reply: oneshot::Sender<ModbusResult<bool>>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
    Shutdown,
}

/// Completion of a submitted write
///
/// Resolves to `Ok(())` once the slave echoed the write, or to the error
/// the request finally failed with.
#[derive(Debug)]
#[must_use = "a PendingWrite does nothing unless awaited"]
pub struct PendingWrite {
    rx: oneshot::Receiver<ModbusResult<()>>,
}

impl Future for PendingWrite {
    type Output = ModbusResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ModbusError::Closed)))
    }
}

/// Counts writes submitted but not yet completed
#[derive(Debug, Clone)]
pub(crate) struct WriteBudget {
    outstanding: Arc<AtomicUsize>,
    capacity: usize,
}

impl WriteBudget {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    fn try_acquire(&self) -> ModbusResult<()> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| ModbusError::queue_full(self.capacity))
    }

    pub(crate) fn release(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    budget: WriteBudget,
}

impl ManagerHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<ConnectionState>,
        budget: WriteBudget,
    ) -> Self {
        Self {
            commands,
            state,
            budget,
        }
    }

    /// Queue a write without waiting for it
    ///
    /// Fails immediately with a validation error, `QueueFull` when the
    /// write budget is exhausted, or `Closed` when the manager stopped.
    pub fn submit(&self, pdu: RequestPdu) -> ModbusResult<PendingWrite> {
        if let RequestPdu::Read { .. } = pdu {
            return Err(ModbusError::invalid_data(
                "Reads are issued by pollers, not submitted directly",
            ));
        }
        pdu.validate()?;
        self.budget.try_acquire()?;

        let (reply, rx) = oneshot::channel();
        match self.commands.try_send(Command::Submit { pdu, reply }) {
            Ok(()) => Ok(PendingWrite { rx }),
            Err(TrySendError::Full(_)) => {
                self.budget.release();
                Err(ModbusError::queue_full(self.budget.capacity))
            }
            Err(TrySendError::Closed(_)) => {
                self.budget.release();
                Err(ModbusError::Closed)
            }
        }
    }

    /// Write single register (function code 0x06)
    pub async fn write_06(&self, address: u16, value: i16) -> ModbusResult<()> {
        self.submit(RequestPdu::write_single(address, value as u16))?
            .await
    }

    /// Write multiple registers (function code 0x10), 1-123 values
    pub async fn write_10(&self, address: u16, values: &[i16]) -> ModbusResult<()> {
        let words = values.iter().map(|v| *v as u16).collect();
        self.submit(RequestPdu::write_multiple(address, words)?)?
            .await
    }

    pub async fn write_single_register(&self, address: u16, value: i16) -> ModbusResult<()> {
        self.write_06(address, value).await
    }

    pub async fn write_multiple_registers(&self, address: u16, values: &[i16]) -> ModbusResult<()> {
        self.write_10(address, values).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> ModbusResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ModbusError::Closed)?;
        rx.await.map_err(|_| ModbusError::Closed)
    }

    /// Hand a sensor to the manager; it is polled from the next tick on
    pub async fn register_poller(&self, descriptor: PollerDescriptor) -> ModbusResult<PollerId> {
        descriptor.validate()?;
        self.request(|reply| Command::AddPoller { descriptor, reply })
            .await?
    }

    /// Remove a sensor and drop its queued polls
    pub async fn remove_poller(&self, id: PollerId) -> ModbusResult<bool> {
        self.request(|reply| Command::RemovePoller { id, reply })
            .await
    }

    /// Queue a poll now regardless of the interval
    ///
    /// Returns `false` when a poll for this sensor was already pending.
    pub async fn poll_now(&self, id: PollerId) -> ModbusResult<bool> {
        self.request(|reply| Command::PollNow { id, reply }).await?
    }

    pub async fn stats(&self) -> ModbusResult<ManagerStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Receiver notified on every connection state transition
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState, limit: Duration) -> ModbusResult<()> {
        let mut rx = self.state.clone();
        let wait = async {
            while *rx.borrow_and_update() != state {
                rx.changed().await.map_err(|_| ModbusError::Closed)?;
            }
            Ok::<(), ModbusError>(())
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ModbusError::timeout(format!("waiting for {}", state), limit.as_millis() as u64))?
    }

    /// Writes submitted through any handle and not yet completed
    pub fn pending_writes(&self) -> usize {
        self.budget.outstanding()
    }

    /// Stop the manager; queued requests fail with `Closed`
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}
