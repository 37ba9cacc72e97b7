//! End-to-end tests against the loopback mock slave

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use voltage_modbus_manager::testing::MockSlave;
use voltage_modbus_manager::{
    ByteOrder, ConnectionState, ManagerConfig, ManagerHandle, ModbusError, ModbusTcpManager,
    PollerDescriptor, ReadFunction, Reading, ReadingSink, RequestPdu, Scaling, ValueFormat,
    WatchdogConfig, WriteMultipleRegistersAction, WriteRegisterAction,
};

type Outcome = Result<Reading, ModbusError>;

struct Outcomes(mpsc::UnboundedSender<Outcome>);

impl ReadingSink for Outcomes {
    fn publish(&self, reading: &Reading) {
        let _ = self.0.send(Ok(reading.clone()));
    }

    fn publish_failure(&self, _sensor: &str, error: &ModbusError) {
        let _ = self.0.send(Err(error.clone()));
    }
}

fn outcomes() -> (Arc<dyn ReadingSink>, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Outcomes(tx)), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no poll outcome in time")
        .expect("sink closed")
}

fn config(port: u16) -> ManagerConfig {
    ManagerConfig::new("127.0.0.1")
        .with_port(port)
        .with_response_timeout_ms(200)
        .with_backoff(20, 100)
        .with_tick_interval_ms(10)
}

async fn stop(handle: ManagerHandle, task: tokio::task::JoinHandle<()>) {
    handle.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_word_swapped_u32_poll() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_holding_registers(100, &[0x0001, 0x0002]).await;
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();

    let (sink, mut rx) = outcomes();
    let descriptor = PollerDescriptor::new("energy", 100, sink)
        .with_format(ValueFormat::Uint32)
        .with_byte_order(ByteOrder::CdAb)
        .with_scaling(Scaling::new(0.1).with_accuracy(1));
    handle.register_poller(descriptor).await.unwrap();

    let reading = next(&mut rx).await.unwrap();
    assert_eq!(reading.raw, 131073);
    assert_eq!(reading.to_string(), "13107.3");
    assert_eq!(
        slave.requests().await[0],
        RequestPdu::read(ReadFunction::HoldingRegisters, 100, 2).unwrap()
    );

    stop(handle, task).await;
}

#[tokio::test]
async fn test_signed_input_register_and_coil_polls() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_input_registers(10, &[0xFF38]).await;
    slave.set_coils(3, &[true]).await;
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();

    let (sink, mut temperature) = outcomes();
    handle
        .register_poller(
            PollerDescriptor::new("temperature", 10, sink)
                .with_function(ReadFunction::InputRegisters)
                .with_scaling(Scaling::new(0.1)),
        )
        .await
        .unwrap();
    let (sink, mut door) = outcomes();
    handle
        .register_poller(PollerDescriptor::new("door", 3, sink).with_function(ReadFunction::Coils))
        .await
        .unwrap();

    let reading = next(&mut temperature).await.unwrap();
    assert_eq!(reading.raw, -200);
    assert!((reading.value + 20.0).abs() < 1e-9);
    assert_eq!(next(&mut door).await.unwrap().raw, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_write_actions_reach_slave() {
    let slave = MockSlave::start().await.unwrap();
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();

    WriteMultipleRegistersAction::new(handle.clone(), 10i64, vec![1i64, 2, 3])
        .play()
        .await
        .unwrap();
    WriteRegisterAction::new(handle.clone(), 20i64, -1i64)
        .play()
        .await
        .unwrap();

    assert_eq!(slave.holding_registers(10, 3).await, vec![1, 2, 3]);
    assert_eq!(slave.holding_registers(20, 1).await, vec![0xFFFF]);
    assert!(slave.requests().await.contains(&RequestPdu::WriteMultipleRegisters {
        address: 10,
        values: vec![1, 2, 3],
    }));

    let invalid = WriteRegisterAction::new(handle.clone(), 70_000i64, 1i64);
    assert!(invalid.play().await.unwrap_err().is_validation());

    stop(handle, task).await;
}

#[tokio::test]
async fn test_poll_exception_reported_once() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_exception(55, 0x02).await;
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();

    let (sink, mut rx) = outcomes();
    let descriptor =
        PollerDescriptor::new("missing", 55, sink).with_interval(Duration::from_secs(60));
    handle.register_poller(descriptor).await.unwrap();

    let err = next(&mut rx).await.unwrap_err();
    assert_eq!(err.exception_code(), Some(0x02));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(slave.request_count().await, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_unanswered_write_retried_then_failed() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_silent(7, true).await;
    let config = config(slave.port())
        .with_response_timeout_ms(100)
        .with_max_retries(2);
    let (handle, task) = ModbusTcpManager::spawn(config).unwrap();

    let err = handle.write_06(7, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Timeout { .. }));
    assert_eq!(slave.writes_to(7).await, 3);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.scheduler.timeouts, 3);
    assert_eq!(stats.scheduler.retries, 2);
    assert_eq!(stats.pending_writes, 0);

    // the link stays usable once the slave answers again
    slave.set_silent(7, false).await;
    handle.write_06(7, 2).await.unwrap();

    stop(handle, task).await;
}

#[tokio::test]
async fn test_connection_drop_mid_transaction() {
    let slave = MockSlave::start().await.unwrap();
    slave.drop_next_requests(1).await;
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();
    let mut states = handle.subscribe_state();

    handle.write_06(3, 9).await.unwrap();
    assert_eq!(slave.holding_registers(3, 1).await, vec![9]);
    assert_eq!(slave.writes_to(3).await, 2);
    assert_eq!(slave.connection_count().await, 2);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.scheduler.retries, 1);
    assert_eq!(stats.connection.connects, 2);
    assert_eq!(stats.connection.disconnects, 1);
    assert!(states.has_changed().unwrap_or(false));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_unreachable_slave_fails_writes_and_keeps_running() {
    let slave = MockSlave::start().await.unwrap();
    let port = slave.port();
    slave.stop().await;

    let config = config(port).with_max_retries(2);
    let (handle, task) = ModbusTcpManager::spawn(config).unwrap();

    let err = handle.write_06(1, 1).await.unwrap_err();
    assert!(matches!(err, ModbusError::Connection { .. }));
    assert_ne!(handle.connection_state(), ConnectionState::Connected);

    let stats = handle.stats().await.unwrap();
    assert!(stats.connection.connect_failures >= 3);
    assert!(!task.is_finished());

    stop(handle, task).await;
}

#[tokio::test]
async fn test_queue_full_rejected_synchronously() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_silent(1, true).await;
    let config = config(slave.port())
        .with_response_timeout_ms(5_000)
        .with_max_queue_depth(2);
    let (handle, task) = ModbusTcpManager::spawn(config).unwrap();

    let first = handle.submit(RequestPdu::write_single(1, 1)).unwrap();
    let second = handle.submit(RequestPdu::write_single(1, 2)).unwrap();
    assert!(matches!(
        handle.submit(RequestPdu::write_single(1, 3)),
        Err(ModbusError::QueueFull { capacity: 2 })
    ));

    stop(handle, task).await;
    assert_eq!(first.await, Err(ModbusError::Closed));
    assert_eq!(second.await, Err(ModbusError::Closed));
}

#[tokio::test]
async fn test_watchdog_safe_mode_and_recovery() {
    let slave = MockSlave::start().await.unwrap();
    let config = config(slave.port()).with_watchdog(
        WatchdogConfig::new(500)
            .with_interval_ms(100)
            .with_readback_delay_ms(20)
            .with_safe_mode_write(20, -1),
    );
    let (handle, task) = ModbusTcpManager::spawn(config).unwrap();

    // the slave never changes the counter
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(handle.stats().await.unwrap().safe_mode_active);
    assert_eq!(slave.writes_to(20).await, 1);
    assert_eq!(slave.holding_registers(20, 1).await, vec![0xFFFF]);

    slave.set_watchdog_register(500).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.stats().await.unwrap().safe_mode_active);
    assert_eq!(slave.writes_to(20).await, 1);

    stop(handle, task).await;
}

#[tokio::test]
async fn test_remove_poller_and_poll_now() {
    let slave = MockSlave::start().await.unwrap();
    slave.set_holding_registers(1, &[42]).await;
    let (handle, task) = ModbusTcpManager::spawn(config(slave.port())).unwrap();
    handle
        .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
        .await
        .unwrap();

    let (sink, mut rx) = outcomes();
    let id = handle
        .register_poller(
            PollerDescriptor::new("level", 1, sink).with_interval(Duration::from_secs(60)),
        )
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.unwrap().raw, 42);

    slave.set_holding_registers(1, &[43]).await;
    assert!(handle.poll_now(id).await.unwrap());
    assert_eq!(next(&mut rx).await.unwrap().raw, 43);

    assert!(handle.remove_poller(id).await.unwrap());
    assert!(!handle.remove_poller(id).await.unwrap());
    assert!(handle.poll_now(id).await.is_err());
    assert_eq!(handle.stats().await.unwrap().pollers, 0);

    stop(handle, task).await;
}
