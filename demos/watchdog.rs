//! Watchdog Example
//!
//! Runs the link watchdog against a mock slave that first ignores the
//! watchdog counter, which triggers safe mode, and then starts incrementing
//! it, which clears safe mode again.
//!
//! # Running this example
//!
//! ```bash
//! RUST_LOG=info cargo run --example watchdog
//! ```

use std::time::Duration;

use voltage_modbus_manager::testing::MockSlave;
use voltage_modbus_manager::{ManagerConfig, ModbusResult, ModbusTcpManager, WatchdogConfig};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let slave = MockSlave::start().await?;
    let config = ManagerConfig::new("127.0.0.1")
        .with_port(slave.port())
        .with_watchdog(
            WatchdogConfig::new(500)
                .with_interval_ms(500)
                .with_readback_delay_ms(50)
                .with_safe_mode_write(20, 0)
                .with_safe_mode_write(21, -1),
        );
    let (handle, task) = ModbusTcpManager::spawn(config)?;

    for phase in ["slave ignores the counter", "slave increments the counter"] {
        println!("== {}", phase);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let stats = handle.stats().await?;
            println!(
                "  watchdog register {:?}, safe mode {}, safe-mode writes {}",
                slave.holding_registers(500, 1).await,
                stats.safe_mode_active,
                slave.writes_to(20).await
            );
        }
        slave.set_watchdog_register(500).await;
    }

    handle.shutdown().await;
    let _ = task.await;
    slave.stop().await;
    Ok(())
}
