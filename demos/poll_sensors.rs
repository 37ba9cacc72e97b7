//! Sensor Polling Example
//!
//! Registers three sensors with one manager. They share one connection and
//! one request queue to a loopback mock slave.
//!
//! | Address | Format | Byte order | Scale |
//! |---------|--------|------------|-------|
//! | 100     | Uint32 | CD_AB      | 1.0   |
//! | 10      | Int16 (input register) | - | 0.1 |
//! | 3       | Coil   | -          | -     |
//!
//! # Running this example
//!
//! ```bash
//! cargo run --example poll_sensors
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use voltage_modbus_manager::testing::MockSlave;
use voltage_modbus_manager::{
    ByteOrder, ChannelSink, ManagerConfig, ModbusResult, ModbusTcpManager, Reading, SensorConfig,
    ValueFormat,
};

#[tokio::main]
async fn main() -> ModbusResult<()> {
    let slave = MockSlave::start().await?;
    slave.set_holding_registers(100, &[0x0001, 0x0002]).await;
    slave.set_input_registers(10, &[0xFF38]).await;
    slave.set_coils(3, &[true]).await;
    println!("Mock slave on {}", slave.address());

    let config = ManagerConfig::new("127.0.0.1")
        .with_port(slave.port())
        .with_sensor(
            SensorConfig::new("energy", 100)
                .with_value_type(ValueFormat::Uint32)
                .with_byte_order(ByteOrder::CdAb)
                .with_update_interval_ms(1_000),
        )
        .with_sensor(
            SensorConfig::new("temperature", 10)
                .with_function_code(4)
                .with_accuracy_decimals(1)
                .with_update_interval_ms(500),
        )
        .with_sensor(
            SensorConfig::new("door", 3)
                .with_function_code(1)
                .with_update_interval_ms(2_000),
        );

    let sensors = config.sensors.clone();
    let (handle, task) = ModbusTcpManager::spawn(config)?;

    let (tx, mut rx) = mpsc::channel::<Reading>(16);
    let sink = Arc::new(ChannelSink(tx));
    for sensor in &sensors {
        handle.register_poller(sensor.to_descriptor(sink.clone())?).await?;
    }

    let until = tokio::time::Instant::now() + Duration::from_secs(3);
    while let Ok(Some(reading)) = tokio::time::timeout_at(until, rx.recv()).await {
        println!(
            "{:<12} {:>10} (raw {}) at {}",
            reading.sensor,
            reading.to_string(),
            reading.raw,
            reading.timestamp.format("%H:%M:%S%.3f")
        );
    }

    let stats = handle.stats().await?;
    println!(
        "\n{} requests, {} responses, queue depth {}",
        stats.scheduler.dispatched, stats.scheduler.responses, stats.queue_depth
    );

    handle.shutdown().await;
    let _ = task.await;
    slave.stop().await;
    Ok(())
}
