//! Register Write Example
//!
//! Issues writes through the handle and through write actions whose values
//! are resolved when the action fires.
//!
//! # Running this example
//!
//! ```bash
//! cargo run --example write_registers
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use voltage_modbus_manager::testing::MockSlave;
use voltage_modbus_manager::{
    ManagerConfig, ModbusResult, ModbusTcpManager, Templatable, WriteMultipleRegistersAction,
    WriteRegisterAction,
};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let slave = MockSlave::start().await?;
    let config = ManagerConfig::new("127.0.0.1").with_port(slave.port());
    let (handle, task) = ModbusTcpManager::spawn(config)?;

    // =========================================================================
    // Direct writes (0x06 / 0x10)
    // =========================================================================
    handle.write_06(1, -100).await?;
    handle.write_10(10, &[1, 2, 3]).await?;
    println!("Register 1:      {:?}", slave.holding_registers(1, 1).await);
    println!("Registers 10-12: {:?}", slave.holding_registers(10, 3).await);

    // =========================================================================
    // Actions with deferred values
    // =========================================================================
    let setpoint = Arc::new(AtomicI64::new(0));
    let source = setpoint.clone();
    let action = WriteRegisterAction::new(
        handle.clone(),
        20i64,
        Templatable::lambda(move || source.load(Ordering::SeqCst)),
    );
    for value in [250, 500, 750] {
        setpoint.store(value, Ordering::SeqCst);
        action.play().await?;
        println!("Setpoint -> {:?}", slave.holding_registers(20, 1).await);
    }

    // fixed header word followed by the live setpoint
    let source = setpoint.clone();
    let block = WriteMultipleRegistersAction::new(
        handle.clone(),
        30i64,
        [
            Templatable::Static(1),
            Templatable::lambda(move || source.load(Ordering::SeqCst)),
        ],
    );
    block.play().await?;
    println!("Block 30-31:     {:?}", slave.holding_registers(30, 2).await);

    // Out-of-range values are rejected before anything is queued
    setpoint.store(40_000, Ordering::SeqCst);
    match action.play().await {
        Ok(()) => println!("Unexpected success"),
        Err(e) => println!("Rejected: {}", e),
    }

    handle.shutdown().await;
    let _ = task.await;
    slave.stop().await;
    Ok(())
}
