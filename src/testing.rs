//! Testing utilities
//!
//! [`MockSlave`] is a loopback Modbus TCP slave with scriptable faults:
//! exception answers, silence, dropped connections and a watchdog register
//! that changes whatever the master writes to it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::constants::RX_BUFFER_CAPACITY;
use crate::error::ModbusResult;
use crate::frame::{decode_request, encode_exception, encode_response};
use crate::pdu::{ReadFunction, RequestPdu, ResponseBody};

/// Register map and fault script of a [`MockSlave`]
#[derive(Debug, Default)]
pub struct SlaveState {
    pub holding_registers: HashMap<u16, u16>,
    pub input_registers: HashMap<u16, u16>,
    pub coils: HashMap<u16, bool>,
    pub discrete_inputs: HashMap<u16, bool>,
    /// Exception code returned for requests starting at an address
    pub exceptions: HashMap<u16, u8>,
    /// Requests starting at these addresses are never answered
    pub silent: HashSet<u16>,
    /// Close the connection instead of answering the next N requests
    pub drop_next: usize,
    /// Writes here are stored incremented by one
    pub watchdog_register: Option<u16>,
    /// Every request received, in order
    pub requests: Vec<RequestPdu>,
    pub connections: usize,
}

enum Reply {
    Body(ResponseBody),
    Exception(u8),
    Silent,
    Drop,
}

impl SlaveState {
    fn process(&mut self, request: &RequestPdu) -> Reply {
        self.requests.push(request.clone());
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return Reply::Drop;
        }
        let start = request.address();
        if let Some(code) = self.exceptions.get(&start) {
            return Reply::Exception(*code);
        }
        if self.silent.contains(&start) {
            return Reply::Silent;
        }

        let body = match request {
            RequestPdu::Read {
                function,
                address,
                quantity,
            } => {
                let addresses = (0..*quantity).map(|i| address.wrapping_add(i));
                match function {
                    ReadFunction::HoldingRegisters => ResponseBody::Registers(
                        addresses
                            .map(|a| self.holding_registers.get(&a).copied().unwrap_or(0))
                            .collect(),
                    ),
                    ReadFunction::InputRegisters => ResponseBody::Registers(
                        addresses
                            .map(|a| self.input_registers.get(&a).copied().unwrap_or(0))
                            .collect(),
                    ),
                    ReadFunction::Coils => ResponseBody::Bits(
                        addresses
                            .map(|a| self.coils.get(&a).copied().unwrap_or(false))
                            .collect(),
                    ),
                    ReadFunction::DiscreteInputs => ResponseBody::Bits(
                        addresses
                            .map(|a| self.discrete_inputs.get(&a).copied().unwrap_or(false))
                            .collect(),
                    ),
                }
            }
            RequestPdu::WriteSingleRegister { address, value } => {
                let stored = if self.watchdog_register == Some(*address) {
                    value.wrapping_add(1)
                } else {
                    *value
                };
                self.holding_registers.insert(*address, stored);
                ResponseBody::WriteSingleRegister {
                    address: *address,
                    value: *value,
                }
            }
            RequestPdu::WriteMultipleRegisters { address, values } => {
                for (i, value) in values.iter().enumerate() {
                    self.holding_registers
                        .insert(address.wrapping_add(i as u16), *value);
                }
                ResponseBody::WriteMultipleRegisters {
                    address: *address,
                    quantity: values.len() as u16,
                }
            }
        };
        Reply::Body(body)
    }
}

/// Mock Modbus TCP slave on 127.0.0.1
pub struct MockSlave {
    address: SocketAddr,
    state: Arc<Mutex<SlaveState>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MockSlave {
    pub async fn start() -> ModbusResult<Self> {
        Self::start_with_state(SlaveState::default()).await
    }

    pub async fn start_with_state(state: SlaveState) -> ModbusResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let state = Arc::new(Mutex::new(state));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Self::accept_loop(listener, state.clone(), shutdown_rx));
        Ok(Self {
            address,
            state,
            shutdown,
            task: Some(task),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Direct access to the register map and fault script
    pub async fn state(&self) -> tokio::sync::MutexGuard<'_, SlaveState> {
        self.state.lock().await
    }

    pub async fn set_holding_registers(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock().await;
        for (i, value) in values.iter().enumerate() {
            state
                .holding_registers
                .insert(address.wrapping_add(i as u16), *value);
        }
    }

    pub async fn set_input_registers(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock().await;
        for (i, value) in values.iter().enumerate() {
            state
                .input_registers
                .insert(address.wrapping_add(i as u16), *value);
        }
    }

    pub async fn set_coils(&self, address: u16, values: &[bool]) {
        let mut state = self.state.lock().await;
        for (i, value) in values.iter().enumerate() {
            state.coils.insert(address.wrapping_add(i as u16), *value);
        }
    }

    pub async fn holding_registers(&self, address: u16, count: u16) -> Vec<u16> {
        let state = self.state.lock().await;
        (0..count)
            .map(|i| {
                state
                    .holding_registers
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    pub async fn set_exception(&self, address: u16, code: u8) {
        self.state.lock().await.exceptions.insert(address, code);
    }

    pub async fn set_silent(&self, address: u16, silent: bool) {
        let mut state = self.state.lock().await;
        if silent {
            state.silent.insert(address);
        } else {
            state.silent.remove(&address);
        }
    }

    pub async fn drop_next_requests(&self, count: usize) {
        self.state.lock().await.drop_next = count;
    }

    pub async fn set_watchdog_register(&self, register: u16) {
        self.state.lock().await.watchdog_register = Some(register);
    }

    pub async fn request_count(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    pub async fn requests(&self) -> Vec<RequestPdu> {
        self.state.lock().await.requests.clone()
    }

    /// Single- and multiple-register writes covering `register`
    pub async fn writes_to(&self, register: u16) -> usize {
        self.state
            .lock()
            .await
            .requests
            .iter()
            .filter(|request| match request {
                RequestPdu::WriteSingleRegister { address, .. } => *address == register,
                RequestPdu::WriteMultipleRegisters { address, values } => {
                    (*address as usize..*address as usize + values.len())
                        .contains(&(register as usize))
                }
                RequestPdu::Read { .. } => false,
            })
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections
    }

    /// Close the listener and every client connection
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<Mutex<SlaveState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else {
                        continue;
                    };
                    debug!("Mock slave accepted {}", peer);
                    state.lock().await.connections += 1;
                    let client_state = state.clone();
                    let client_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::serve(stream, client_state, client_shutdown).await {
                            debug!("Mock slave client error: {}", e);
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn serve(
        mut stream: TcpStream,
        state: Arc<Mutex<SlaveState>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ModbusResult<()> {
        let mut buf = BytesMut::with_capacity(RX_BUFFER_CAPACITY);
        loop {
            tokio::select! {
                read = stream.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }

            while let Some((header, request)) = decode_request(&mut buf)? {
                let reply = state.lock().await.process(&request);
                let frame = match reply {
                    Reply::Body(body) => encode_response(
                        header.transaction_id,
                        header.unit_id,
                        request.function_code(),
                        &body,
                    )?,
                    Reply::Exception(code) => encode_exception(
                        header.transaction_id,
                        header.unit_id,
                        request.function_code(),
                        code,
                    ),
                    Reply::Silent => continue,
                    Reply::Drop => return Ok(()),
                };
                stream.write_all(&frame).await?;
            }
        }
    }
}

impl Drop for MockSlave {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
