use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use heater_common::{
    AlertSeverity, ControllerConfig, RuntimeConfig, TOPIC_CONTROLLER_DECISION,
    TOPIC_CONTROLLER_STATE,
};

use crate::{
    alerts::AlertDispatcher,
    control::{Controller, ControllerHandle},
    gateway::MqttGateway,
    store::StateStore,
};

const DEFAULT_ALERT_LIMIT: usize = 20;
const MAX_ALERT_LIMIT: usize = 100;

#[derive(Clone)]
struct AppState {
    controller: ControllerHandle,
    alerts: AlertDispatcher,
    config: ControllerConfig,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct AckBody {
    alert_id: u64,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ClearBody {
    cleared: usize,
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<String>,
    severity: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = StateStore::from_env();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime
        .apply_overrides(|key| std::env::var(key).ok())
        .context("invalid environment override")?;
    runtime.validate().context("invalid controller configuration")?;
    let config = runtime.controller.clone();

    let mut mqtt_options = MqttOptions::new(
        runtime.mqtt.client_id.clone(),
        runtime.mqtt.host.clone(),
        runtime.mqtt.port,
    );
    if !runtime.mqtt.user.is_empty() {
        mqtt_options.set_credentials(runtime.mqtt.user.clone(), runtime.mqtt.pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let gateway = MqttGateway::spawn(mqtt.clone(), eventloop, &config);
    let alerts = AlertDispatcher::new(Duration::from_secs(runtime.alert_dedup_minutes * 60))
        .with_mqtt(mqtt.clone());

    let persisted = store.load_control().await;
    let controller = match persisted {
        Ok(Some(persisted)) => {
            info!(
                "restoring {} entered at {}",
                persisted.state, persisted.last_transition_at
            );
            Controller::restore(config.clone(), gateway, alerts.clone(), persisted)
        }
        Ok(None) => Controller::new(config.clone(), gateway, alerts.clone(), Utc::now()),
        Err(err) => {
            warn!("failed to load controller state, starting IDLE: {err:#}");
            Controller::new(config.clone(), gateway, alerts.clone(), Utc::now())
        }
    }
    .with_store(store);

    let app_state = AppState {
        controller: controller.handle(),
        alerts,
        config,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_task = spawn_control_loop(controller, mqtt.clone(), shutdown_rx);
    spawn_state_publish_loop(app_state.controller.clone(), mqtt);

    let app = Router::new()
        .route("/health", get(handle_get_health))
        .route("/api/decision", get(handle_get_decision))
        .route("/api/alerts", get(handle_get_alerts).delete(handle_clear_alerts))
        .route("/api/alerts/{alert_id}/ack", post(handle_ack_alert))
        .route("/api/reset", post(handle_reset))
        .route("/api/config", get(handle_get_config))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    control_task.await.context("control loop panicked")?;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn spawn_control_loop(
    mut controller: Controller<MqttGateway, AlertDispatcher>,
    mqtt: AsyncClient,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = controller.config().poll_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let outcome = controller.tick().await;
            if let Some(command) = outcome.command {
                debug!(
                    "{} after {} attempt(s), verified: {}",
                    command.command, command.attempts, command.verified
                );
            }
            if outcome.transition.is_some() {
                publish_snapshot(&controller.handle(), &mqtt).await;
            }
            match serde_json::to_vec(&outcome.decision) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_DECISION, QoS::AtLeastOnce, false, body)
                        .await
                    {
                        warn!("decision publish failed: {err}");
                    }
                }
                Err(err) => warn!("decision serialization failed: {err}"),
            }
        }
        info!("control loop stopped");
    })
}

fn spawn_state_publish_loop(controller: ControllerHandle, mqtt: AsyncClient) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            publish_snapshot(&controller, &mqtt).await;
        }
    });
}

async fn publish_snapshot(controller: &ControllerHandle, mqtt: &AsyncClient) {
    let snapshot = controller.snapshot(Utc::now()).await;
    match serde_json::to_vec(&snapshot) {
        Ok(body) => {
            if let Err(err) = mqtt
                .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                .await
            {
                warn!("controller state publish failed: {err}");
            }
        }
        Err(err) => warn!("controller state serialization failed: {err}"),
    }
}

async fn handle_get_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.snapshot(Utc::now()).await)
}

async fn handle_get_decision(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.record().await.last_decision)
}

async fn handle_get_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> impl IntoResponse {
    let limit = match query.limit.as_deref().map(str::parse::<usize>) {
        None => DEFAULT_ALERT_LIMIT,
        Some(Ok(limit)) if (1..=MAX_ALERT_LIMIT).contains(&limit) => limit,
        Some(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("limit must be between 1 and {MAX_ALERT_LIMIT}"),
            )
        }
    };

    let severity = match query.severity.as_deref() {
        None => None,
        Some(raw) => match AlertSeverity::parse(raw) {
            Some(severity) => Some(severity),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "severity must be one of info, warning, critical",
                )
            }
        },
    };

    Json(state.alerts.history(limit, severity).await).into_response()
}

async fn handle_ack_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<u64>,
) -> impl IntoResponse {
    if state.alerts.acknowledge(alert_id).await {
        Json(AckBody {
            alert_id,
            status: "acknowledged",
        })
        .into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, &format!("alert {alert_id} not found"))
    }
}

async fn handle_clear_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClearBody {
        cleared: state.alerts.clear().await,
    })
}

async fn handle_reset(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.request_reset();
    info!("operator reset requested");
    (
        StatusCode::ACCEPTED,
        Json(state.controller.snapshot(Utc::now()).await),
    )
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
