use crate::arbitration::Arbiter;
use crate::config::Config;
use crate::report::WireReport;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

pub fn uplink_filter(topic_prefix: &str) -> String {
    format!("{}/+/up", topic_prefix.trim_end_matches('/'))
}

/// Gateway id segment of `<prefix>/<gateway_id>/up`, used only for log context.
fn topic_gateway<'a>(topic_prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic
        .strip_prefix(topic_prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    let gateway = rest.strip_suffix("/up")?;
    if gateway.is_empty() || gateway.contains('/') {
        return None;
    }
    Some(gateway)
}

pub async fn run_listener(config: Config, arbiter: Arbiter) -> Result<()> {
    let filter = uplink_filter(&config.mqtt_topic_prefix);
    let stats = arbiter.stats();
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
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

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            Ok(_) => {
                tracing::info!(topic=%filter, "subscribed to gateway uplinks");
                stats.set_mqtt_connected(true);
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let gateway = topic_gateway(&config.mqtt_topic_prefix, &publish.topic)
                        .unwrap_or_default()
                        .to_string();
                    let mut payload = publish.payload.to_vec();
                    let wire = match WireReport::from_json(&mut payload) {
                        Ok(wire) => wire,
                        Err(err) => {
                            stats.record_validation_error();
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode uplink payload");
                            continue;
                        }
                    };
                    let arbiter = arbiter.clone();
                    tokio::spawn(async move {
                        match arbiter.ingest(&wire).await {
                            Ok(outcome) => {
                                tracing::debug!(topic_gateway=%gateway, outcome=%outcome, "uplink processed");
                            }
                            Err(err) => {
                                tracing::warn!(topic_gateway=%gateway, error=%err, "uplink rejected");
                            }
                        }
                    });
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uplink_filter_matches_every_gateway() {
        assert_eq!(uplink_filter("battery-monitor"), "battery-monitor/+/up");
        assert_eq!(uplink_filter("site/a/"), "site/a/+/up");
    }

    #[test]
    fn topic_gateway_extracts_single_segment() {
        assert_eq!(
            topic_gateway("battery-monitor", "battery-monitor/gw-001/up"),
            Some("gw-001")
        );
        assert_eq!(topic_gateway("battery-monitor", "battery-monitor/gw-001/down/ack"), None);
        assert_eq!(topic_gateway("battery-monitor", "other/gw-001/up"), None);
        assert_eq!(topic_gateway("battery-monitor", "battery-monitor//up"), None);
    }

    #[test]
    fn decodes_uplink_payload_with_mixed_number_forms() {
        let mut payload = br#"{
            "destination": "server",
            "gateway_id": "gw-001",
            "device_id": "device-abc",
            "sequence_number": "42",
            "timestamp": 1714128000,
            "rssi": -67,
            "voltages": [3.71, "3.69"],
            "temperature": 21.5
        }"#
        .to_vec();
        let wire = WireReport::from_json(&mut payload).unwrap();
        let report = wire.normalize().unwrap();
        assert_eq!(report.sequence_number, 42);
        assert_eq!(report.rssi, Some(-67));
        assert_eq!(report.voltages.as_ref().map(Vec::len), Some(2));
        assert!(report.humidity.is_none());
    }

    #[test]
    fn rejects_non_json_payload() {
        let mut payload = b"not json".to_vec();
        assert!(WireReport::from_json(&mut payload).is_err());
    }
}
