use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};

const PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_SECS: u64 = 10;
const RECONNECT_SECS: u64 = 5;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;
pub type Receiver = broadcast::Receiver<ChannelData>;

pub struct Subscription {
    pub messages: Receiver,
    pub shutdown: Receiver,
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    stats: SharedStats,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, stats: SharedStats) -> Self {
        Self {
            config,
            channels,
            stats,
        }
    }

    /// Receivers for `start`. Take them before any sink can publish so the
    /// first state updates are queued rather than lost.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            messages: self.channels.to_mqtt.subscribe(),
            shutdown: self.channels.to_mqtt.subscribe(),
        }
    }

    pub async fn start(&self, subscription: Subscription) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let Subscription { messages, shutdown } = subscription;

        let mut options = MqttOptions::new("rct-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop, shutdown),
            self.sender(client, messages)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        Ok(())
    }

    // drives the connection; nothing is subscribed so incoming publishes are unexpected
    async fn receiver(&self, mut eventloop: EventLoop, mut shutdown: Receiver) -> Result<()> {
        loop {
            tokio::select! {
                msg = shutdown.recv() => match msg {
                    Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                    _ => continue,
                },
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        debug!("ignoring incoming publish on {}", publish.topic);
                    }
                    Ok(_) => {} // keepalives etc
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in {}s", RECONNECT_SECS);
                        tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_SECS)).await;
                    }
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // sink -> mqtt
    async fn sender(&self, client: AsyncClient, mut receiver: Receiver) -> Result<()> {
        loop {
            let message = match receiver.recv().await {
                Ok(ChannelData::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Ok(ChannelData::Message(message)) => message,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                    continue;
                }
            };

            let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
            debug!("publishing: {} = {}", topic, message.payload);

            for attempt in 1..=PUBLISH_ATTEMPTS {
                match client
                    .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                    .await
                {
                    Ok(_) => {
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.mqtt_messages_sent += 1;
                        }
                        break;
                    }
                    Err(err) => {
                        error!(
                            "MQTT publish failed: {:?} - retrying in {}s (attempt {}/{})",
                            err, PUBLISH_RETRY_SECS, attempt, PUBLISH_ATTEMPTS
                        );
                        if let Ok(mut stats) = self.stats.lock() {
                            stats.mqtt_errors += 1;
                        }
                        if attempt < PUBLISH_ATTEMPTS {
                            tokio::time::sleep(std::time::Duration::from_secs(PUBLISH_RETRY_SECS))
                                .await;
                        }
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
