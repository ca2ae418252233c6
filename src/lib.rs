pub mod channels; // Inter-component communication channels
pub mod config;
pub mod error;
pub mod mqtt;
pub mod options;
pub mod prelude;
pub mod rct; // RCT Power protocol and connection manager
pub mod sink;
pub mod stats;

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;
use crate::rct::inverter::{Inverter, InverterHandle};
use crate::sink::{LogSink, MqttSink};

use std::sync::Arc;
use std::time::Duration;

fn init_logging(level: &str) {
    let result = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

pub fn load_registry(config: &ConfigWrapper) -> Result<Registry> {
    match config.registry_file() {
        Some(file) => Registry::from_file(&file),
        None => Ok(Registry::builtin()),
    }
}

/// Main application entry point
///
/// Loads the configuration, starts MQTT (if enabled) and the inverter
/// connection manager, then polls until `shutdown_rx` fires or the
/// optional runtime limit is reached.
pub async fn app(mut shutdown_rx: broadcast::Receiver<()>, options: Options) -> Result<()> {
    let config = ConfigWrapper::new(options.config_file.clone())?;
    init_logging(&config.loglevel());

    info!("rct-bridge {} starting with config file: {}", CARGO_PKG_VERSION, options.config_file);
    config.log_summary();

    let registry = Arc::new(load_registry(&config)?);
    info!("{} register definitions loaded", registry.len());
    for definition in registry.definitions() {
        debug!("  {} {} {:?}", definition.id, definition.name, definition.data_type);
    }

    let channels = Channels::new();
    let stats = ConnectionStats::shared();

    let sink: Arc<dyn StateSink> = if config.mqtt().enabled() {
        Arc::new(MqttSink::new(&channels))
    } else {
        Arc::new(LogSink)
    };

    info!("  Creating MQTT client...");
    let mqtt = mqtt::Mqtt::new(config.clone(), channels.clone(), stats.clone());
    let subscription = mqtt.subscribe();
    let mqtt_clone = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start(subscription).await {
            error!("MQTT task failed: {}", e);
        }
    });

    info!("  Creating connection manager...");
    let inverter = Inverter::new(config.clone(), registry, sink, &channels, stats.clone());
    let inverter_handle = tokio::spawn(async move {
        if let Err(e) = inverter.start().await {
            error!("Inverter task failed: {}", e);
        }
    });

    let handle = InverterHandle::new(&channels);
    let inv = config.inverter();
    handle.process(inv.host(), inv.registers())?;

    match options.runtime {
        Some(secs) => {
            info!("Running for {}s", secs);
            tokio::select! {
                _ = shutdown_rx.recv() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => {
            let _ = shutdown_rx.recv().await;
        }
    }

    info!("Shutdown signal received, stopping components...");
    if let Err(e) = handle.shutdown() {
        warn!("{}", e);
    }
    mqtt.stop();

    if let Err(e) = inverter_handle.await {
        error!("Error waiting for inverter task: {}", e);
    }
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for MQTT task: {}", e);
    }

    if let Ok(stats) = stats.lock() {
        stats.print_summary();
    }

    info!("Application shutdown complete");
    Ok(())
}
