#![allow(dead_code)]

use rct_bridge::prelude::*;
use rct_bridge::rct::frame::{crc, ESCAPE_BYTE, START_BYTE};
use rct_bridge::rct::inverter::{Inverter, InverterHandle};
use rct_bridge::rct::registry::RegisterDefinition;
use rct_bridge::rct::value::DataType;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory;

impl Factory {
    pub fn registry() -> Registry {
        Registry::new(vec![
            RegisterDefinition::new("battery.soc", 0x959930BF, DataType::UInt16).with_unit("%"),
            RegisterDefinition::new("battery.power", 0x12345678, DataType::Float)
                .with_multiplier(100.0)
                .with_precision(2)
                .with_unit("W"),
            RegisterDefinition::new("g_sync.u_l_rms[0]", 0x11111111, DataType::Int16),
            RegisterDefinition::new("energy.total", 0x22222222, DataType::UInt32),
            RegisterDefinition::new("inverter_sn", 0x7924ABD9, DataType::Text),
        ])
        .unwrap()
    }

    /// A short response frame, unescaped
    pub fn response(id: u32, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0x05, (4 + data.len()) as u8];
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(data);
        Self::frame(body)
    }

    pub fn long_response(id: u32, data: &[u8]) -> Vec<u8> {
        let mut body = vec![0x06];
        body.extend_from_slice(&((4 + data.len()) as u16).to_be_bytes());
        body.extend_from_slice(&id.to_be_bytes());
        body.extend_from_slice(data);
        Self::frame(body)
    }

    fn frame(body: Vec<u8>) -> Vec<u8> {
        let mut r = vec![START_BYTE];
        r.extend_from_slice(&body);
        r.extend_from_slice(&crc(&body).to_be_bytes());
        r
    }

    /// Wire form of a frame: escape bytes in front of 0x2B/0x2D after the start byte
    pub fn escape(frame: &[u8]) -> Vec<u8> {
        let mut r = vec![frame[0]];
        for &b in &frame[1..] {
            if b == START_BYTE || b == ESCAPE_BYTE {
                r.push(ESCAPE_BYTE);
            }
            r.push(b);
        }
        r
    }
}

pub struct TestConfig {
    pub port: u16,
    pub registers: Vec<&'static str>,
    pub poll_interval: u64,
    pub watchdog_ms: u64,
    pub overrun_backoff_ms: u64,
    pub error_backoff_ms: u64,
}

impl TestConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            registers: vec!["battery.soc"],
            poll_interval: 60,
            watchdog_ms: 200,
            overrun_backoff_ms: 200,
            error_backoff_ms: 200,
        }
    }

    pub fn yaml(&self) -> String {
        format!(
            "inverter:
  host: 127.0.0.1
  port: {}
  poll_interval: {}
  connect_timeout: 2
  registers: [{}]
timings:
  watchdog_ms: {}
  overrun_backoff_ms: {}
  error_backoff_ms: {}
",
            self.port,
            self.poll_interval,
            self.registers.join(", "),
            self.watchdog_ms,
            self.overrun_backoff_ms,
            self.error_backoff_ms
        )
    }

    pub fn build(&self) -> ConfigWrapper {
        ConfigWrapper::from_config(Config::from_yaml(&self.yaml()).unwrap())
    }
}

/// Records every state update in order
#[derive(Clone, Default)]
pub struct RecordingSink {
    states: Arc<Mutex<Vec<(String, Value)>>>,
}

impl StateSink for RecordingSink {
    fn set_state(&self, path: &str, value: &Value, ack: bool) -> Result<()> {
        assert!(ack);
        self.states
            .lock()
            .unwrap()
            .push((path.to_string(), value.clone()));
        Ok(())
    }
}

impl RecordingSink {
    pub fn states(&self) -> Vec<(String, Value)> {
        self.states.lock().unwrap().clone()
    }

    pub fn values_for(&self, path: &str) -> Vec<Value> {
        self.states()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn connection_history(&self) -> Vec<Value> {
        self.values_for(sink::CONNECTION_STATE)
    }

    /// Poll until `f` holds or five seconds pass
    pub async fn wait_for(&self, f: impl Fn(&[(String, Value)]) -> bool) -> bool {
        for _ in 0..500 {
            if f(&self.states()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub struct Running {
    pub handle: InverterHandle,
    pub sink: RecordingSink,
    pub stats: SharedStats,
    pub task: JoinHandle<Result<()>>,
}

impl Running {
    pub fn start(config: ConfigWrapper) -> Self {
        let channels = Channels::new();
        let sink = RecordingSink::default();
        let stats = ConnectionStats::shared();

        let inverter = Inverter::new(
            config,
            Arc::new(Factory::registry()),
            Arc::new(sink.clone()),
            &channels,
            stats.clone(),
        );
        let task = tokio::spawn(inverter.start());

        Self {
            handle: InverterHandle::new(&channels),
            sink,
            stats,
            task,
        }
    }

    pub fn process(&self, registers: &[&str]) {
        let registers: Vec<String> = registers.iter().map(|r| r.to_string()).collect();
        self.handle.process("127.0.0.1", &registers).unwrap();
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().unwrap().clone()
    }

    pub async fn stop(self) {
        self.handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
