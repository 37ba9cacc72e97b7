//! # Modbus TCP manager
//!
//! One [`ModbusTcpManager`] owns the connection to a single slave and every
//! request sent to it. It runs as one tokio task:
//!
//! ```text
//!            ManagerHandle (commands)      poll tick       socket / timers
//!                     │                        │                  │
//!                     ▼                        ▼                  ▼
//!              ┌─────────────────────── select! ────────────────────────┐
//!              │  PollerRegistry ─┐                                      │
//!              │  Watchdog ───────┼──► Scheduler ──► Connection ──► TCP  │
//!              │  writes ─────────┘        ▲               │             │
//!              │                           └── decode ◄────┘             │
//!              └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing inside the task is shared, so nothing is locked. Completions are
//! routed back to their origin: readings to the poller's sink, write results
//! to the waiting [`PendingWrite`](crate::client::PendingWrite), watchdog
//! results into the watchdog state machine.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::{Command, ManagerHandle, WriteBudget};
use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, ConnectionStats, LinkUpdate};
use crate::constants::COMMAND_CHANNEL_CAPACITY;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{decode_response, Decoded};
use crate::pdu::{ReadFunction, RequestPdu, ResponseBody};
use crate::poller::{PollerDescriptor, PollerId, PollerRegistry};
use crate::request::{Origin, RequestId};
use crate::scheduler::{Completion, Dispatch, Scheduler, SchedulerStats};
use crate::watchdog::{Watchdog, WatchdogAction, WatchdogStep};

/// Snapshot of a manager's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub state: ConnectionState,
    pub queue_depth: usize,
    pub in_flight: bool,
    pub pending_writes: usize,
    pub pollers: usize,
    pub safe_mode_active: bool,
    pub scheduler: SchedulerStats,
    pub connection: ConnectionStats,
}

enum Step {
    Command(Option<Command>),
    Tick,
    Link(ConnectionEvent),
    Deadline,
}

pub struct ModbusTcpManager {
    connection: Connection,
    scheduler: Scheduler,
    pollers: PollerRegistry,
    watchdog: Option<Watchdog>,
    commands: mpsc::Receiver<Command>,
    writes: HashMap<RequestId, oneshot::Sender<ModbusResult<()>>>,
    budget: WriteBudget,
    eager_connect: bool,
    tick_interval: Duration,
}

impl ModbusTcpManager {
    /// Build a manager and the handle that controls it
    ///
    /// Sensors listed in `config` are not registered here; they need a sink,
    /// see [`SensorConfig::to_descriptor`](crate::config::SensorConfig::to_descriptor).
    pub fn new(config: ManagerConfig) -> ModbusResult<(Self, ManagerHandle)> {
        config.validate()?;

        let connection = Connection::new(config.connection_settings());
        let (commands_tx, commands) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let budget = WriteBudget::new(config.max_queue_depth);
        let handle = ManagerHandle::new(commands_tx, connection.subscribe(), budget.clone());

        let manager = Self {
            connection,
            scheduler: Scheduler::new(config.scheduler_config()),
            pollers: PollerRegistry::new(),
            watchdog: config.watchdog.clone().map(Watchdog::new),
            commands,
            writes: HashMap::new(),
            budget,
            eager_connect: config.eager_connect,
            tick_interval: config.tick_interval(),
        };
        Ok((manager, handle))
    }

    /// Build the manager and run it on a new task
    pub fn spawn(config: ManagerConfig) -> ModbusResult<(ManagerHandle, JoinHandle<()>)> {
        let (manager, handle) = Self::new(config)?;
        Ok((handle, tokio::spawn(manager.run())))
    }

    /// Register a sensor before the manager runs
    pub fn add_poller(&mut self, descriptor: PollerDescriptor) -> ModbusResult<PollerId> {
        self.pollers.add(descriptor)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            state: self.connection.state(),
            queue_depth: self.scheduler.queue_len(),
            in_flight: self.scheduler.in_flight(),
            pending_writes: self.writes.len(),
            pollers: self.pollers.len(),
            safe_mode_active: self.watchdog.as_ref().is_some_and(Watchdog::is_safe_mode),
            scheduler: self.scheduler.stats().clone(),
            connection: self.connection.stats().clone(),
        }
    }

    /// Serve until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Modbus manager for {} unit {} started",
            self.connection.address(),
            self.scheduler.config().unit_id
        );

        let mut tick = interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if self.eager_connect {
            self.connection.ensure_connected(Instant::now());
        }

        loop {
            let deadline = self.scheduler.deadline();
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                _ = tick.tick() => Step::Tick,
                event = self.connection.next_event() => Step::Link(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Deadline,
            };

            let now = Instant::now();
            match step {
                Step::Command(Some(command)) => {
                    if !self.handle_command(command, now) {
                        break;
                    }
                }
                Step::Command(None) => {
                    debug!("All manager handles dropped");
                    break;
                }
                Step::Tick => self.on_tick(now),
                Step::Link(event) => {
                    let update = self.connection.handle_event(event, now);
                    self.on_link_update(update, now);
                }
                Step::Deadline => {
                    if let Some(completion) = self.scheduler.on_deadline(now) {
                        self.complete(completion, now);
                    }
                }
            }

            self.pump().await;
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command, now: Instant) -> bool {
        match command {
            Command::Submit { pdu, reply } => {
                match self.scheduler.enqueue(Origin::Write, pdu, now) {
                    Ok(id) => {
                        self.writes.insert(id, reply);
                    }
                    Err(err) => {
                        self.budget.release();
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::AddPoller { descriptor, reply } => {
                let result = self.pollers.add(descriptor);
                if let Err(err) = &result {
                    warn!("Poller rejected: {}", err);
                }
                let _ = reply.send(result);
            }
            Command::RemovePoller { id, reply } => {
                let removed = self.pollers.remove(id);
                if let Some(descriptor) = &removed {
                    let cancelled = self.scheduler.cancel_poller(id);
                    debug!(
                        "Removed {} ({}), {} queued polls cancelled",
                        descriptor.name, id, cancelled
                    );
                }
                let _ = reply.send(removed.is_some());
            }
            Command::PollNow { id, reply } => {
                let result = match self.pollers.get_mut(id) {
                    Some(poller) => poller.request_pdu().and_then(|pdu| {
                        let queued = self.scheduler.enqueue_poll(id, pdu, now)?.is_some();
                        poller.mark_scheduled(now);
                        Ok(queued)
                    }),
                    None => Err(ModbusError::invalid_data(format!("Unknown {}", id))),
                };
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn on_tick(&mut self, now: Instant) {
        if self.eager_connect {
            self.connection.ensure_connected(now);
        }

        for id in self.pollers.due(now) {
            let Some(poller) = self.pollers.get_mut(id) else {
                continue;
            };
            // a skipped duplicate still counts as this interval's poll
            poller.mark_scheduled(now);
            let queued = poller
                .request_pdu()
                .and_then(|pdu| self.scheduler.enqueue_poll(id, pdu, now));
            if let Err(err) = queued {
                warn!("{}: poll not queued: {}", poller.name, err);
            }
        }

        let connected = self.connection.is_connected();
        let action = self
            .watchdog
            .as_mut()
            .and_then(|watchdog| watchdog.on_tick(now, connected));
        self.apply_watchdog(action, now);
    }

    fn on_link_update(&mut self, update: LinkUpdate, now: Instant) {
        match update {
            LinkUpdate::Up => {}
            LinkUpdate::Data => self.process_rx(now),
            LinkUpdate::Lost(err) => {
                if let Some(completion) = self.scheduler.on_connection_lost(err) {
                    self.complete(completion, now);
                }
            }
            LinkUpdate::ConnectFailed(err) => {
                for completion in self.scheduler.on_connect_failed(&err) {
                    self.complete(completion, now);
                }
            }
            LinkUpdate::RetryDue => {
                if self.eager_connect || self.scheduler.has_work() {
                    self.connection.ensure_connected(now);
                } else {
                    self.connection.park();
                }
            }
        }
    }

    /// Decode every complete frame in the receive buffer
    fn process_rx(&mut self, now: Instant) {
        loop {
            match decode_response(self.connection.rx_buffer()) {
                Ok(Decoded::Incomplete) => return,
                Ok(decoded) => {
                    if let Some(completion) = self.scheduler.on_frame(decoded) {
                        self.complete(completion, now);
                    }
                }
                Err(err) => {
                    self.connection.discard_rx();
                    if let Some(completion) = self.scheduler.on_protocol_error(err) {
                        self.complete(completion, now);
                    }
                    return;
                }
            }
        }
    }

    /// Put the next request on the wire when the link is idle
    async fn pump(&mut self) {
        while self.scheduler.has_work() {
            let now = Instant::now();
            if !self.connection.ensure_connected(now) {
                return;
            }
            match self.scheduler.dispatch(now) {
                Dispatch::Idle | Dispatch::Busy => return,
                Dispatch::Send {
                    transaction_id,
                    frame,
                } => {
                    if let Err(err) = self.connection.send(&frame).await {
                        debug!("tid {} not sent: {}", transaction_id, err);
                        if let Some(completion) = self.scheduler.on_connection_lost(err) {
                            self.complete(completion, now);
                        }
                    }
                    return;
                }
                Dispatch::Failed(completion) => self.complete(completion, now),
            }
        }
    }

    /// Deliver a finished request to whoever is waiting for it
    fn complete(&mut self, completion: Completion, now: Instant) {
        let Completion { request, result } = completion;
        match request.origin {
            Origin::Poller(id) => match self.pollers.get(id) {
                Some(poller) => {
                    if let Err(err) = poller.deliver(result) {
                        warn!("{}: poll failed: {}", poller.name, err);
                    }
                }
                None => debug!("{} finished after {} was removed", request, id),
            },
            Origin::Write => {
                self.budget.release();
                match self.writes.remove(&request.id) {
                    Some(reply) => {
                        let _ = reply.send(result.map(|_| ()));
                    }
                    None => warn!("No waiter for write {}", request),
                }
            }
            Origin::Watchdog(WatchdogStep::WriteCounter) => {
                let action = self
                    .watchdog
                    .as_mut()
                    .and_then(|watchdog| watchdog.on_write_complete(&result, now));
                self.apply_watchdog(action, now);
            }
            Origin::Watchdog(WatchdogStep::ReadBack) => {
                let value = result.and_then(|body| match body {
                    ResponseBody::Registers(words) => words
                        .first()
                        .copied()
                        .ok_or_else(|| ModbusError::protocol("Empty watchdog read-back")),
                    other => Err(ModbusError::protocol(format!(
                        "Unexpected watchdog read-back {:?}",
                        other
                    ))),
                });
                let action = self
                    .watchdog
                    .as_mut()
                    .and_then(|watchdog| watchdog.on_read_complete(value));
                self.apply_watchdog(action, now);
            }
            Origin::SafeMode => match result {
                Ok(_) => info!("Safe-mode write {} applied", request),
                Err(err) => error!("Safe-mode write {} failed: {}", request, err),
            },
        }
    }

    fn apply_watchdog(&mut self, action: Option<WatchdogAction>, now: Instant) {
        let Some(action) = action else {
            return;
        };
        match action {
            WatchdogAction::WriteCounter { register, value } => self.enqueue_watchdog(
                WatchdogStep::WriteCounter,
                Ok(RequestPdu::write_single(register, value)),
                now,
            ),
            WatchdogAction::ReadBack { register } => self.enqueue_watchdog(
                WatchdogStep::ReadBack,
                RequestPdu::read(ReadFunction::HoldingRegisters, register, 1),
                now,
            ),
            WatchdogAction::EnterSafeMode(writes) => {
                for write in writes {
                    let pdu = RequestPdu::write_single(write.register, write.value as u16);
                    if let Err(err) = self.scheduler.enqueue(Origin::SafeMode, pdu, now) {
                        error!(
                            "Safe-mode write to {} not queued: {}",
                            write.register, err
                        );
                    }
                }
            }
        }
    }

    fn enqueue_watchdog(&mut self, step: WatchdogStep, pdu: ModbusResult<RequestPdu>, now: Instant) {
        let queued = pdu.and_then(|pdu| self.scheduler.enqueue(Origin::Watchdog(step), pdu, now));
        if let Err(err) = queued {
            let action = self
                .watchdog
                .as_mut()
                .and_then(|watchdog| watchdog.on_rejected(&err));
            self.apply_watchdog(action, now);
        }
    }

    async fn shutdown(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Submit { reply, .. } = command {
                self.budget.release();
                let _ = reply.send(Err(ModbusError::Closed));
            }
        }
        let now = Instant::now();
        for completion in self.scheduler.drain(ModbusError::Closed) {
            self.complete(completion, now);
        }
        self.connection.close().await;
        info!("Modbus manager for {} stopped", self.connection.address());
    }
}
