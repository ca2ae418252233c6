use crate::prelude::*;

use std::sync::{Arc, Mutex};

pub type SharedStats = Arc<Mutex<ConnectionStats>>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    // Connection
    pub connects: u64,
    pub connection_errors: u64,
    pub overruns: u64,
    // Frames
    pub frames_received: u64,
    pub crc_errors: u64,
    pub unknown_ids: u64,
    pub noise_bytes_skipped: u64,
    // Values
    pub values_published: u64,
    pub values_not_requested: u64,
    pub sink_errors: u64,
    // MQTT
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
}

impl ConnectionStats {
    pub fn shared() -> SharedStats {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn print_summary(&self) {
        info!("Connection Statistics:");
        info!("  Connects: {}", self.connects);
        info!("  Connection errors: {}", self.connection_errors);
        info!("  Poll cycle overruns: {}", self.overruns);
        info!("  Frames:");
        info!("    Received: {}", self.frames_received);
        info!("    CRC errors: {}", self.crc_errors);
        info!("    Unknown ids: {}", self.unknown_ids);
        info!("    Noise bytes skipped: {}", self.noise_bytes_skipped);
        info!("  Values:");
        info!("    Published: {}", self.values_published);
        info!("    Not requested: {}", self.values_not_requested);
        info!("    Sink errors: {}", self.sink_errors);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
    }
}
