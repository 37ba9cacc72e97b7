//! Write actions
//!
//! Actions bind a register and value(s) that may be fixed or computed when
//! the action fires ([`Templatable`]). On trigger the inputs are resolved,
//! range-checked, and the write is handed to the manager.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::client::{ManagerHandle, PendingWrite};
use crate::constants::MAX_WRITE_REGISTERS;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::RequestPdu;

/// A value fixed at construction or produced by a resolver at trigger time
#[derive(Clone)]
pub enum Templatable<T> {
    Static(T),
    Lambda(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Templatable<T> {
    pub fn lambda(resolver: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::Lambda(Arc::new(resolver))
    }

    pub fn value(&self) -> T {
        match self {
            Self::Static(value) => value.clone(),
            Self::Lambda(resolver) => resolver(),
        }
    }
}

impl<T> From<T> for Templatable<T> {
    fn from(value: T) -> Self {
        Self::Static(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Templatable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Lambda(_) => f.write_str("Lambda(..)"),
        }
    }
}

pub fn validate_register(register: i64) -> ModbusResult<u16> {
    u16::try_from(register).map_err(|_| {
        ModbusError::invalid_data(format!("Register {} out of range (0-65535)", register))
    })
}

pub fn validate_value(value: i64) -> ModbusResult<i16> {
    i16::try_from(value).map_err(|_| {
        ModbusError::invalid_data(format!("Value {} out of range (-32768-32767)", value))
    })
}

pub fn validate_values(values: &[i64]) -> ModbusResult<Vec<i16>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(ModbusError::invalid_data(format!(
            "Write of {} values (1-{})",
            values.len(),
            MAX_WRITE_REGISTERS
        )));
    }
    values.iter().map(|v| validate_value(*v)).collect()
}

/// A triggerable write
pub trait WriteAction: Send + Sync {
    /// Resolve inputs and build the request
    fn resolve(&self) -> ModbusResult<RequestPdu>;

    fn handle(&self) -> &ManagerHandle;

    /// Queue the write; validation and admission errors return immediately
    fn trigger(&self) -> ModbusResult<PendingWrite> {
        let pdu = self.resolve()?;
        debug!(
            "Write action: FC{:02X} addr={} qty={}",
            pdu.function_code(),
            pdu.address(),
            pdu.quantity()
        );
        self.handle().submit(pdu)
    }
}

/// Single register write (0x06)
#[derive(Clone)]
pub struct WriteRegisterAction {
    handle: ManagerHandle,
    register: Templatable<i64>,
    value: Templatable<i64>,
}

impl WriteRegisterAction {
    pub fn new(
        handle: ManagerHandle,
        register: impl Into<Templatable<i64>>,
        value: impl Into<Templatable<i64>>,
    ) -> Self {
        Self {
            handle,
            register: register.into(),
            value: value.into(),
        }
    }

    /// Trigger and wait for the slave's acknowledgement
    pub async fn play(&self) -> ModbusResult<()> {
        self.trigger()?.await
    }
}

impl WriteAction for WriteRegisterAction {
    fn resolve(&self) -> ModbusResult<RequestPdu> {
        let register = validate_register(self.register.value())?;
        let value = validate_value(self.value.value())?;
        Ok(RequestPdu::write_single(register, value as u16))
    }

    fn handle(&self) -> &ManagerHandle {
        &self.handle
    }
}

/// Multiple register write (0x10)
#[derive(Clone)]
pub struct WriteMultipleRegistersAction {
    handle: ManagerHandle,
    register: Templatable<i64>,
    values: Vec<Templatable<i64>>,
}

impl WriteMultipleRegistersAction {
    /// Each value resolves on its own when the action fires
    pub fn new<V: Into<Templatable<i64>>>(
        handle: ManagerHandle,
        register: impl Into<Templatable<i64>>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            handle,
            register: register.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub async fn play(&self) -> ModbusResult<()> {
        self.trigger()?.await
    }
}

impl WriteAction for WriteMultipleRegistersAction {
    fn resolve(&self) -> ModbusResult<RequestPdu> {
        let register = validate_register(self.register.value())?;
        let values: Vec<i64> = self.values.iter().map(Templatable::value).collect();
        let values = validate_values(&values)?;
        RequestPdu::write_multiple(register, values.into_iter().map(|v| v as u16).collect())
    }

    fn handle(&self) -> &ManagerHandle {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Command, WriteBudget};
    use crate::connection::ConnectionState;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::{mpsc, watch};

    fn handle() -> (ManagerHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(8);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        (ManagerHandle::new(tx, state_rx, WriteBudget::new(8)), rx)
    }

    #[test]
    fn test_validate_register() {
        assert_eq!(validate_register(0).unwrap(), 0);
        assert_eq!(validate_register(65535).unwrap(), 65535);
        assert!(validate_register(-1).unwrap_err().is_validation());
        assert!(validate_register(65536).is_err());
    }

    #[test]
    fn test_validate_values() {
        assert_eq!(validate_values(&[-32768, 32767]).unwrap(), vec![-32768, 32767]);
        assert!(validate_values(&[32768]).is_err());
        assert!(validate_values(&[]).is_err());
        assert!(validate_values(&[0; 124]).is_err());
        assert_eq!(validate_values(&[0; 123]).unwrap().len(), 123);
    }

    #[test]
    fn test_single_write_resolves_negative_value() {
        let (handle, _rx) = handle();
        let action = WriteRegisterAction::new(handle, 10i64, -2i64);
        assert_eq!(action.resolve().unwrap(), RequestPdu::write_single(10, 0xFFFE));
    }

    #[test]
    fn test_lambda_resolved_at_trigger_time() {
        let (handle, mut rx) = handle();
        let source = Arc::new(AtomicI64::new(5));
        let read = source.clone();
        let action = WriteRegisterAction::new(
            handle,
            100i64,
            Templatable::lambda(move || read.load(Ordering::SeqCst)),
        );

        source.store(42, Ordering::SeqCst);
        let _pending = action.trigger().unwrap();
        let Ok(Command::Submit { pdu, .. }) = rx.try_recv() else {
            panic!("expected submit");
        };
        assert_eq!(pdu, RequestPdu::write_single(100, 42));

        source.store(40_000, Ordering::SeqCst);
        assert!(action.trigger().unwrap_err().is_validation());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_multiple_write_scenario() {
        let (handle, _rx) = handle();
        let action = WriteMultipleRegistersAction::new(handle, 10i64, vec![1i64, 2, 3]);
        let pdu = action.resolve().unwrap();
        assert_eq!(
            pdu.to_pdu().unwrap().as_slice(),
            &[0x10, 0x00, 0x0A, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03]
        );
    }

    #[test]
    fn test_multiple_write_resolves_each_value() {
        let (handle, mut rx) = handle();
        let setpoint = Arc::new(AtomicI64::new(7));
        let read = setpoint.clone();
        let action = WriteMultipleRegistersAction::new(
            handle,
            20i64,
            [
                Templatable::Static(1),
                Templatable::lambda(move || read.load(Ordering::SeqCst)),
                Templatable::Static(-1),
            ],
        );

        setpoint.store(300, Ordering::SeqCst);
        let _pending = action.trigger().unwrap();
        let Ok(Command::Submit { pdu, .. }) = rx.try_recv() else {
            panic!("expected submit");
        };
        assert_eq!(pdu, RequestPdu::write_multiple(20, vec![1, 300, 0xFFFF]).unwrap());

        setpoint.store(-40_000, Ordering::SeqCst);
        assert!(action.trigger().unwrap_err().is_validation());
    }

    #[test]
    fn test_multiple_write_rejects_overflowing_range() {
        let (handle, _rx) = handle();
        let action = WriteMultipleRegistersAction::new(handle, 65535i64, vec![1i64, 2]);
        assert!(action.resolve().is_err());
        let action = WriteMultipleRegistersAction::new(
            action.handle().clone(),
            Templatable::lambda(|| -5i64),
            vec![1i64],
        );
        assert!(action.resolve().is_err());
    }
}
