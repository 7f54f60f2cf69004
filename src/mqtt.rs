use std::time::Duration;

use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS};
use tokio::sync::watch;

use crate::config;
use crate::controller::ControllerSnapshot;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "presence-light".to_string());

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
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "presence-light".to_string()),
            },
            eventloop,
        )
    }

    /// Keep the connection alive until shutdown. Nothing is subscribed, so
    /// incoming packets are only logged.
    pub async fn drive(mut eventloop: rumqttc::EventLoop, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => match event {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        debug!("Connection acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error polling MQTT event loop: {:?}", e);
                        // rumqttc reconnects on the next poll; don't spin.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        debug!("MQTT event loop stopped");
    }

    pub fn state_topic(&self) -> String {
        format!("{}/{}/state", self.topic_path, self.publisher_id)
    }

    pub async fn publish_snapshot(
        &self,
        snapshot: &ControllerSnapshot,
    ) -> Result<(), rumqttc::ClientError> {
        let payload = match serde_json::to_string(snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to serialize controller snapshot: {}", err);
                return Ok(());
            }
        };
        self.client
            .publish(self.state_topic(), QoS::AtMostOnce, true, payload)
            .await
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        info!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}
