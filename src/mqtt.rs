use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::manager::Controller;
use crate::messages::{Presence, PresenceEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

/// Device tracker payload (`home` / `not_home`).
#[derive(Debug, Serialize)]
struct PresenceMqttMessage {
    state: &'static str,
    devices: Vec<String>,
    generation: u64,
}

impl PresenceMqttMessage {
    fn new(presence: Presence, generation: u64, controller: &Controller) -> Self {
        PresenceMqttMessage {
            state: match presence {
                Presence::Present => "home",
                Presence::Absent => "not_home",
            },
            devices: controller
                .config()
                .devices
                .iter()
                .map(ToString::to_string)
                .collect(),
            generation,
        }
    }
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"presence-relay".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("presence".to_string()),
            },
            eventloop,
        )
    }

    fn presence_topic(&self) -> String {
        format!("{}/{}/presence", self.topic_path, self.publisher_id)
    }

    fn activate_topic(&self) -> String {
        format!("{}/{}/relay/activate", self.topic_path, self.publisher_id)
    }

    pub fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client.try_subscribe(self.activate_topic(), QoS::AtMostOnce)
    }

    /// Announces presence changes and serves relay activation requests
    /// until cancelled.
    pub async fn run(
        self,
        mut eventloop: rumqttc::EventLoop,
        mut events: broadcast::Receiver<PresenceEvent>,
        controller: Controller,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let activate_topic = self.activate_topic();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        self.announce(&PresenceMqttMessage::new(event.presence, event.generation, &controller));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("MQTT announcer skipped {} presence events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                notification = eventloop.poll() => match notification {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(p))) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);
                        if p.topic == activate_topic {
                            info!("Relay activation requested over MQTT");
                            controller.trigger_relay_now().await?;
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_))) => {
                        debug!("Subscription acknowledged");
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                        // Refresh the retained state on every (re)connect.
                        let current = controller.presence();
                        self.announce(&PresenceMqttMessage::new(current.presence, controller.generation(), &controller));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error polling MQTT event loop: {:?}", e);
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                    }
                },
            }
        }

        debug!("Disconnecting MQTT client");
        if let Err(err) = self.client.try_disconnect() {
            debug!("MQTT disconnect failed: {:?}", err);
        }
        Ok(())
    }

    fn announce(&self, message: &PresenceMqttMessage) {
        info!("Announcing {} on MQTT", message.state);
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Error encoding presence message: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .client
            .try_publish(self.presence_topic(), QoS::AtLeastOnce, true, payload)
        {
            error!("Error announcing presence: {:?}", err);
        }
    }
}
