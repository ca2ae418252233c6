use crate::prelude::*;
use crate::rct::inverter::Timings;

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub inverter: Inverter,

    #[serde(default = "Config::default_mqtt")]
    pub mqtt: Mqtt,

    #[serde(default)]
    pub timings: TimingsConfig,

    /// Optional JSON register table, replaces the built-in one
    pub registry_file: Option<String>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    #[serde(default)]
    pub debug: bool,
}

// Inverter {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Inverter {
    pub host: String,
    #[serde(default = "Config::default_inverter_port")]
    pub port: u16,

    /// seconds between poll cycles
    pub poll_interval: Option<u64>,
    pub registers: Vec<String>,

    pub connect_timeout: Option<u64>,
    pub use_tcp_nodelay: Option<bool>,
    pub escape_lookahead: Option<bool>,
}
impl Inverter {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn poll_interval(&self) -> u64 {
        self.poll_interval.unwrap_or(60)
    }

    pub fn registers(&self) -> &[String] {
        &self.registers
    }

    pub fn connect_timeout(&self) -> u64 {
        self.connect_timeout.unwrap_or(10)
    }

    pub fn use_tcp_nodelay(&self) -> bool {
        self.use_tcp_nodelay.unwrap_or(true)
    }

    pub fn escape_lookahead(&self) -> bool {
        self.escape_lookahead.unwrap_or(true)
    }
} // }}}

// Timings {{{
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TimingsConfig {
    pub watchdog_ms: Option<u64>,
    pub overrun_backoff_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
}
impl TimingsConfig {
    pub fn watchdog_ms(&self) -> u64 {
        self.watchdog_ms.unwrap_or(2000)
    }

    pub fn overrun_backoff_ms(&self) -> u64 {
        self.overrun_backoff_ms.unwrap_or(60000)
    }

    pub fn error_backoff_ms(&self) -> u64 {
        self.error_backoff_ms.unwrap_or(120000)
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}
impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        // a poisoned lock still holds a usable config
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inverter(&self) -> Inverter {
        self.lock().inverter.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn registry_file(&self) -> Option<String> {
        self.lock().registry_file.clone()
    }

    pub fn loglevel(&self) -> String {
        let config = self.lock();
        if config.debug {
            "debug".to_string()
        } else {
            config.loglevel.clone()
        }
    }

    pub fn timings(&self) -> Timings {
        let config = self.lock();
        Timings {
            poll_interval: Duration::from_secs(config.inverter.poll_interval()),
            watchdog: Duration::from_millis(config.timings.watchdog_ms()),
            overrun_backoff: Duration::from_millis(config.timings.overrun_backoff_ms()),
            error_backoff: Duration::from_millis(config.timings.error_backoff_ms()),
            connect_timeout: Duration::from_secs(config.inverter.connect_timeout()),
        }
    }

    pub fn log_summary(&self) {
        let config = self.lock();
        let inv = &config.inverter;

        info!("Configuration loaded successfully:");
        info!("  Inverter:");
        info!("    Host: {}", inv.host);
        info!("    Port: {}", inv.port);
        info!("    Poll Interval: {}s", inv.poll_interval());
        info!("    Registers: {}", inv.registers.join(", "));
        info!("    Connect Timeout: {}s", inv.connect_timeout());
        info!("    TCP NoDelay: {}", inv.use_tcp_nodelay());
        info!("    Escape Lookahead: {}", inv.escape_lookahead());
        info!("  Timings:");
        info!("    Watchdog: {}ms", config.timings.watchdog_ms());
        info!("    Overrun Backoff: {}ms", config.timings.overrun_backoff_ms());
        info!("    Error Backoff: {}ms", config.timings.error_backoff_ms());

        info!("  MQTT: {}", if config.mqtt.enabled { "enabled" } else { "disabled" });
        if config.mqtt.enabled {
            info!("    Host: {}", config.mqtt.host);
            info!("    Port: {}", config.mqtt.port);
            info!("    Namespace: {}", config.mqtt.namespace);
        }

        match &config.registry_file {
            Some(file) => info!("  Registry: {}", file),
            None => info!("  Registry: built-in"),
        }
        info!("  Log Level: {}", config.loglevel);
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|err| file_error!("error parsing config: {}", err))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let inv = &self.inverter;
        if inv.host.is_empty() {
            return Err(file_error!("Inverter host cannot be empty"));
        }
        if inv.port == 0 {
            bail!("inverter.port must be between 1 and 65535");
        }
        if inv.poll_interval() == 0 {
            return Err(file_error!("Invalid poll interval: 0"));
        }
        if inv.connect_timeout() == 0 {
            return Err(file_error!("Invalid connect timeout: 0"));
        }
        if inv.registers.is_empty() {
            return Err(file_error!("inverter.registers cannot be empty"));
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                return Err(file_error!("MQTT host cannot be empty"));
            }
        }

        Ok(())
    }

    fn default_inverter_port() -> u16 {
        crate::rct::frame::PORT
    }

    fn default_mqtt() -> Mqtt {
        Mqtt {
            enabled: false,
            host: Self::default_mqtt_host(),
            port: Self::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Self::default_mqtt_namespace(),
        }
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "rct".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
