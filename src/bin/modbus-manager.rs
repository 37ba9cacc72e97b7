//! Modbus manager CLI
//!
//! Polls the sensors of a YAML configuration and logs every reading.
//!
//! Usage: cargo run --bin modbus-manager -- --config manager.yaml
//! Example: cargo run --bin modbus-manager -- --host 127.0.0.1 --port 5020 --write 10=42

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use voltage_modbus_manager::{
    ManagerConfig, ModbusError, ModbusResult, ModbusTcpManager, Reading, ReadingSink,
};

#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// YAML configuration file
    #[clap(short = 'c', long, env = "MODBUS_MANAGER_CONFIG")]
    config: Option<String>,

    /// Slave host, overrides the configuration
    #[clap(long)]
    host: Option<String>,

    /// Slave port, overrides the configuration
    #[clap(short = 'p', long)]
    port: Option<u16>,

    /// Unit id, overrides the configuration
    #[clap(short = 'u', long)]
    unit_id: Option<u8>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short = 'l', long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Hex dump every frame
    #[clap(long)]
    packet_log: bool,

    /// Register write issued after startup, as REGISTER=VALUE (repeatable)
    #[clap(short = 'w', long = "write")]
    writes: Vec<String>,

    /// Only validate the configuration
    #[clap(long)]
    validate: bool,
}

/// Sink that logs readings
struct LogSink;

impl ReadingSink for LogSink {
    fn publish(&self, reading: &Reading) {
        info!("{} = {} (raw {})", reading.sensor, reading, reading.raw);
    }

    fn publish_failure(&self, sensor: &str, error: &ModbusError) {
        warn!("{}: no value ({})", sensor, error);
    }
}

fn parse_write(arg: &str) -> ModbusResult<(u16, i16)> {
    let invalid = || {
        ModbusError::invalid_data(format!("Invalid write '{}', expected REGISTER=VALUE", arg))
    };
    let (register, value) = arg.split_once('=').ok_or_else(invalid)?;
    let register = register.trim().parse().map_err(|_| invalid())?;
    let value = value.trim().parse().map_err(|_| invalid())?;
    Ok((register, value))
}

fn load_config(args: &Args) -> ModbusResult<ManagerConfig> {
    let mut config = match (&args.config, &args.host) {
        (Some(path), _) => ManagerConfig::from_file(path)?,
        (None, Some(host)) => ManagerConfig::new(host.clone()),
        (None, None) => {
            return Err(ModbusError::configuration(
                "either --config or --host is required",
            ))
        }
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(unit_id) = args.unit_id {
        config.unit_id = unit_id;
    }
    config.packet_logging |= args.packet_log;
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> ModbusResult<()> {
    let config = load_config(&args)?;
    let writes = args
        .writes
        .iter()
        .map(|arg| parse_write(arg))
        .collect::<ModbusResult<Vec<_>>>()?;

    if args.validate {
        info!(
            "Configuration valid: {} with {} sensors",
            config.address(),
            config.sensors.len()
        );
        return Ok(());
    }

    let sensors = config.sensors.clone();
    let (handle, task) = ModbusTcpManager::spawn(config)?;

    let sink: Arc<dyn ReadingSink> = Arc::new(LogSink);
    for sensor in &sensors {
        let id = handle.register_poller(sensor.to_descriptor(sink.clone())?).await?;
        info!("Polling {} as {}", sensor.name, id);
    }

    for (register, value) in writes {
        match handle.write_06(register, value).await {
            Ok(()) => info!("Wrote {} to register {}", value, register),
            Err(e) => error!("Write to register {} failed: {}", register, e),
        }
    }

    let mut states = handle.subscribe_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                info!("Connection {}", *states.borrow_and_update());
            }
        }
    }

    if let Ok(stats) = handle.stats().await {
        info!(
            "Dispatched {} requests, {} responses, {} retries, {} failures",
            stats.scheduler.dispatched,
            stats.scheduler.responses,
            stats.scheduler.retries,
            stats.scheduler.failed
        );
    }
    handle.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
