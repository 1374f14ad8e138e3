use crate::config::Config;
use crate::error::NotificationError;
use crate::stats::IngestStats;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// One accepted write that the relaying gateway should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckCommand {
    pub gateway_id: String,
    pub device_id: String,
    pub sequence_number: i64,
    pub acked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckMessage<'a> {
    pub destination: &'static str,
    pub gateway_id: &'a str,
    pub device_id: &'a str,
    pub sequence_number: i64,
    pub timestamp: i64,
    pub status: &'static str,
}

impl AckCommand {
    pub fn message(&self) -> AckMessage<'_> {
        AckMessage {
            destination: "gateway",
            gateway_id: &self.gateway_id,
            device_id: &self.device_id,
            sequence_number: self.sequence_number,
            timestamp: self.acked_at.timestamp(),
            status: "ack",
        }
    }
}

pub fn ack_topic(topic_prefix: &str, gateway_id: &str) -> String {
    format!("{}/{gateway_id}/down/ack", topic_prefix.trim_end_matches('/'))
}

/// Outbound side of the notification channel. Must not block; delivery is best-effort.
pub trait AckPublisher: Send + Sync {
    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), NotificationError>;
}

impl AckPublisher for AsyncClient {
    fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), NotificationError> {
        self.try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| NotificationError::Publish(err.to_string()))
    }
}

pub fn channel() -> (mpsc::UnboundedSender<AckCommand>, mpsc::UnboundedReceiver<AckCommand>) {
    mpsc::unbounded_channel()
}

/// Publishes a single ack. Failures are counted and logged, never returned.
pub fn dispatch<P: AckPublisher + ?Sized>(
    publisher: &P,
    topic_prefix: &str,
    stats: &IngestStats,
    cmd: &AckCommand,
) {
    let topic = ack_topic(topic_prefix, &cmd.gateway_id);
    let result = serde_json::to_vec(&cmd.message())
        .map_err(NotificationError::from)
        .and_then(|payload| publisher.publish(topic.clone(), payload));
    match result {
        Ok(()) => {
            stats.record_ack_published();
            tracing::debug!(
                topic = %topic,
                device = %cmd.device_id,
                seq = cmd.sequence_number,
                "ack published"
            );
        }
        Err(err) => {
            stats.record_ack_failed();
            tracing::warn!(
                error = %err,
                topic = %topic,
                device = %cmd.device_id,
                seq = cmd.sequence_number,
                "failed to publish ack"
            );
        }
    }
}

pub async fn run_ack_manager(
    config: Config,
    stats: Arc<IngestStats>,
    mut rx: mpsc::UnboundedReceiver<AckCommand>,
) -> Result<()> {
    loop {
        let mut mqttoptions = MqttOptions::new(
            format!("{}-ack", config.mqtt_client_id),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
        tracing::info!("ack publisher connected to MQTT");

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return Ok(()); };
                    dispatch(&client, &config.mqtt_topic_prefix, &stats, &cmd);
                }
                ev = eventloop.poll() => {
                    match ev {
                        Ok(Event::Incoming(_)) => {}
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, "ack MQTT connection dropped; reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}
