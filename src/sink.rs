use crate::prelude::*;

/// State path carrying the connection up/down flag
pub const CONNECTION_STATE: &str = "info.connection";

/// Receives decoded register values. Writing the same value twice must be
/// harmless.
pub trait StateSink: Send + Sync {
    fn set_state(&self, path: &str, value: &Value, ack: bool) -> Result<()>;
}

/// Logs every update; used when MQTT is disabled
#[derive(Debug, Default)]
pub struct LogSink;

impl StateSink for LogSink {
    fn set_state(&self, path: &str, value: &Value, ack: bool) -> Result<()> {
        info!("{} = {} (ack={})", path, value, ack);
        Ok(())
    }
}

/// Forwards updates to the MQTT task, `a.b_c` becoming topic `a/b_c`
#[derive(Debug, Clone)]
pub struct MqttSink {
    sender: mqtt::Sender,
}

impl MqttSink {
    pub fn new(channels: &Channels) -> Self {
        Self {
            sender: channels.to_mqtt.clone(),
        }
    }

    pub fn message(path: &str, value: &Value, ack: bool) -> Result<mqtt::Message> {
        Ok(mqtt::Message {
            topic: path.replace('.', "/"),
            // acknowledged values come from the device, keep the last one
            retain: ack,
            payload: serde_json::to_string(value)?,
        })
    }
}

impl StateSink for MqttSink {
    fn set_state(&self, path: &str, value: &Value, ack: bool) -> Result<()> {
        let message = Self::message(path, value, ack)?;
        if self.sender.send(mqtt::ChannelData::Message(message)).is_err() {
            bail!("send(to_mqtt) failed - channel closed?");
        }
        Ok(())
    }
}
