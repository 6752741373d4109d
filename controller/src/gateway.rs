use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use heater_common::{
    payload, ControllerConfig, GatewayError, TemperatureSample, TOPIC_ACTUATOR_STATE,
    TOPIC_CMD_ACTUATOR, TOPIC_SENSOR_TEMP,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

/// Sensor and actuator access used by the controller. Implementations must
/// return `GatewayError::Unreachable`/`Timeout` for transport failures.
pub trait Gateway: Send + Sync {
    fn read_temperature(
        &self,
    ) -> impl Future<Output = Result<TemperatureSample, GatewayError>> + Send;

    fn read_actuator_state(&self) -> impl Future<Output = Result<bool, GatewayError>> + Send;

    fn set_actuator(&self, on: bool) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Gateway backed by an MQTT broker: sensor nodes publish readings, the
/// actuator node publishes its state and listens for ON/OFF commands.
#[derive(Clone)]
pub struct MqttGateway {
    mqtt: AsyncClient,
    connected: Arc<AtomicBool>,
    temperature: watch::Receiver<Option<TemperatureSample>>,
    actuator: watch::Receiver<Option<bool>>,
    settle: Duration,
}

/// Write side of the gateway caches, fed from the MQTT event loop.
struct GatewayFeed {
    temperature: watch::Sender<Option<TemperatureSample>>,
    actuator: watch::Sender<Option<bool>>,
    connected: Arc<AtomicBool>,
    config: ControllerConfig,
}

impl MqttGateway {
    pub fn spawn(mqtt: AsyncClient, eventloop: EventLoop, config: &ControllerConfig) -> Self {
        let (temperature_tx, temperature_rx) = watch::channel(None);
        let (actuator_tx, actuator_rx) = watch::channel(None);
        let connected = Arc::new(AtomicBool::new(false));

        let feed = GatewayFeed {
            temperature: temperature_tx,
            actuator: actuator_tx,
            connected: connected.clone(),
            config: config.clone(),
        };
        spawn_mqtt_loop(mqtt.clone(), eventloop, feed);

        Self {
            mqtt,
            connected,
            temperature: temperature_rx,
            actuator: actuator_rx,
            settle: config.actuator_settle(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Unreachable(
                "mqtt broker not connected".to_string(),
            ))
        }
    }
}

impl Gateway for MqttGateway {
    async fn read_temperature(&self) -> Result<TemperatureSample, GatewayError> {
        self.ensure_connected()?;
        let latest = *self.temperature.borrow();
        latest.ok_or(GatewayError::NoReading("temperature"))
    }

    async fn read_actuator_state(&self) -> Result<bool, GatewayError> {
        self.ensure_connected()?;
        let latest = *self.actuator.borrow();
        latest.ok_or(GatewayError::NoReading("actuator"))
    }

    async fn set_actuator(&self, on: bool) -> Result<(), GatewayError> {
        self.ensure_connected()?;
        self.mqtt
            .publish(
                TOPIC_CMD_ACTUATOR,
                QoS::AtLeastOnce,
                false,
                payload::actuator_command_payload(on),
            )
            .await
            .map_err(|err| GatewayError::Unreachable(err.to_string()))?;

        // Give the node a moment to report back; the caller does the verification.
        let mut actuator = self.actuator.clone();
        let settled = async {
            loop {
                if *actuator.borrow_and_update() == Some(on) {
                    break;
                }
                if actuator.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(self.settle, settled).await.is_err() {
            debug!("actuator did not report {} within {:?}", on_off(on), self.settle);
        }
        Ok(())
    }
}

impl GatewayFeed {
    fn apply(&self, topic: &str, raw: &[u8], received_at: DateTime<Utc>) {
        if raw.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                topic,
                raw.len()
            );
            return;
        }

        let Ok(message) = std::str::from_utf8(raw) else {
            warn!("dropping non utf8 payload on topic {topic}");
            return;
        };

        match topic {
            TOPIC_SENSOR_TEMP => match payload::parse_temperature(message, received_at) {
                Ok(sample) if self.config.is_valid_temperature(sample.value_c) => {
                    self.temperature.send_replace(Some(sample));
                }
                Ok(sample) => {
                    warn!("rejecting implausible temperature {}°C", sample.value_c);
                }
                Err(err) => warn!("temperature payload rejected: {err}"),
            },
            TOPIC_ACTUATOR_STATE => match payload::parse_actuator_state(message) {
                Some(on) => {
                    self.actuator.send_replace(Some(on));
                }
                None => warn!("unrecognised actuator state {message:?}"),
            },
            _ => {}
        }
    }

    fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::Relaxed);
        if was && !connected {
            warn!("mqtt gateway disconnected");
        }
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> Result<(), rumqttc::ClientError> {
    for topic in [TOPIC_SENSOR_TEMP, TOPIC_ACTUATOR_STATE] {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(mqtt: AsyncClient, mut eventloop: EventLoop, feed: GatewayFeed) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    feed.apply(&message.topic, &message.payload, Utc::now());
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt gateway connected");
                    feed.set_connected(true);
                    let client = mqtt.clone();
                    tokio::spawn(async move {
                        if let Err(err) = subscribe_topics(&client).await {
                            warn!("gateway subscribe failed: {err}");
                        }
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    feed.set_connected(false);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}
