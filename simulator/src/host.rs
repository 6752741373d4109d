use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

use heater_common::{
    payload, SensorReading, TOPIC_ACTUATOR_STATE, TOPIC_CMD_ACTUATOR, TOPIC_SENSOR_STATUS,
    TOPIC_SENSOR_TEMP,
};

use crate::plant::{Plant, PlantParams};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = env_or("MQTT_PORT", 1883u16);

    let params = PlantParams {
        ambient_c: env_or("SIM_AMBIENT_TEMP", PlantParams::default().ambient_c),
        heated_c: env_or("SIM_HEATED_TEMP", PlantParams::default().heated_c),
        time_constant_secs: env_or(
            "SIM_TIME_CONSTANT_SECONDS",
            PlantParams::default().time_constant_secs,
        ),
    };
    let initial_c = env_or("SIM_INITIAL_TEMP", 22.0);
    let publish_every = Duration::from_secs(env_or("SIM_PUBLISH_SECONDS", 10u64).max(1));

    let mut mqtt_options = MqttOptions::new("heater-simulator", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);
    let plant = Arc::new(Mutex::new(Plant::new(params, initial_c)));

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    let loop_mqtt = mqtt.clone();
    let loop_plant = plant.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message)))
                    if message.topic == TOPIC_CMD_ACTUATOR =>
                {
                    let command = String::from_utf8_lossy(&message.payload);
                    let Some(on) = payload::parse_actuator_state(&command) else {
                        warn!("ignoring actuator command {command:?}");
                        continue;
                    };
                    loop_plant.lock().await.set_heater(on);
                    info!("heater switched {}", if on { "on" } else { "off" });
                    report_actuator(&loop_mqtt, on);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("simulator connected");
                    if let Err(err) =
                        loop_mqtt.try_subscribe(TOPIC_CMD_ACTUATOR, QoS::AtLeastOnce)
                    {
                        warn!("actuator command subscribe failed: {err}");
                    }
                    report_actuator(&loop_mqtt, loop_plant.lock().await.heater_on());
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("simulator mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    info!(
        "simulator started at {:.1}°C (ambient {:.1}°C, heated {:.1}°C)",
        plant.lock().await.temperature_c(),
        params.ambient_c,
        params.heated_c
    );

    let mut interval = tokio::time::interval(publish_every);
    let mut last_step = Instant::now();

    loop {
        interval.tick().await;
        let now = Instant::now();
        let temperature_c = plant.lock().await.step(now - last_step);
        last_step = now;

        let reading = SensorReading {
            value: (temperature_c * 100.0).round() / 100.0,
            observed_at: Utc::now(),
        };
        let body = serde_json::to_vec(&reading).context("failed to encode sensor reading")?;
        mqtt.publish(TOPIC_SENSOR_TEMP, QoS::AtLeastOnce, true, body)
            .await
            .context("failed to publish sensor temperature")?;
    }
}

/// Publishes from inside the event loop task, so it must not wait on the request queue.
fn report_actuator(mqtt: &AsyncClient, on: bool) {
    let state = if on { "on" } else { "off" };
    if let Err(err) = mqtt.try_publish(TOPIC_ACTUATOR_STATE, QoS::AtLeastOnce, true, state) {
        warn!("actuator state publish failed: {err}");
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}
