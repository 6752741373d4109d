use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use heater_common::{
    ActuatorCommand, Alert, AlertKind, ControlRecord, ControllerConfig, ControllerState, Decision,
    DecisionEngine, EngineInput, Evaluation, FailureCause, GatewayError, HealthSnapshot,
    PersistedControl, StateTransition, TemperatureSample,
};

use crate::{
    alerts::{AlertSink, Delivery},
    gateway::Gateway,
    store::StateStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: ActuatorCommand,
    pub attempts: u32,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub decision: Decision,
    pub transition: Option<StateTransition>,
    pub command: Option<CommandOutcome>,
}

/// Read side of the controller, shared with the HTTP and publishing tasks.
#[derive(Clone)]
pub struct ControllerHandle {
    record: Arc<RwLock<ControlRecord>>,
    reset_requested: Arc<AtomicBool>,
}

impl ControllerHandle {
    fn new(record: ControlRecord) -> Self {
        Self {
            record: Arc::new(RwLock::new(record)),
            reset_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        self.record.read().await.health(now)
    }

    pub async fn record(&self) -> ControlRecord {
        self.record.read().await.clone()
    }

    /// Asks the next tick to clear a latched failure.
    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::Release);
    }
}

struct Inputs {
    sample: Option<TemperatureSample>,
    actuator_on: Option<bool>,
    fault: Option<GatewayError>,
}

/// Owns the control cycle: gateway reads, engine evaluation, verified
/// actuation, record bookkeeping and alerting.
pub struct Controller<G, A> {
    engine: DecisionEngine,
    gateway: G,
    alerts: A,
    store: Option<StateStore>,
    handle: ControllerHandle,
    /// Actuator position after our last verified command.
    expected_actuator: Option<bool>,
}

impl<G: Gateway, A: AlertSink> Controller<G, A> {
    pub fn new(config: ControllerConfig, gateway: G, alerts: A, started_at: DateTime<Utc>) -> Self {
        Self {
            engine: DecisionEngine::new(config),
            gateway,
            alerts,
            store: None,
            handle: ControllerHandle::new(ControlRecord::new(started_at)),
            expected_actuator: Some(false),
        }
    }

    pub fn restore(
        config: ControllerConfig,
        gateway: G,
        alerts: A,
        persisted: PersistedControl,
    ) -> Self {
        Self {
            engine: DecisionEngine::new(config),
            gateway,
            alerts,
            store: None,
            handle: ControllerHandle::new(ControlRecord::restore(persisted)),
            expected_actuator: persisted.state.expected_actuator(),
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ControllerConfig {
        self.engine.config()
    }

    /// Runs one tick on the wall clock, bounded by the tick budget.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = Utc::now();
        let budget = self.config().tick_timeout();
        let result = tokio::time::timeout(budget, self.tick_at(now)).await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                let reason = format!("tick exceeded {}s budget", budget.as_secs());
                self.fail_tick(now, FailureCause::TickTimeout, reason).await
            }
        }
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if self.handle.reset_requested.swap(false, Ordering::AcqRel) {
            self.apply_reset().await;
        }

        let previous = self.handle.record().await;
        let before = previous.persisted();
        let inputs = self.read_inputs().await;
        let manual_signal = matches!(
            (self.expected_actuator, inputs.actuator_on),
            (Some(expected), Some(observed)) if expected != observed
        );

        let mut evaluation = if previous.is_failure_latched() {
            Evaluation {
                next_state: ControllerState::Failure,
                action: None,
                reason: format!(
                    "failure latched ({}); awaiting operator reset",
                    previous.failure_cause.map_or("unknown", FailureCause::as_str)
                ),
                failure: previous.failure_cause,
            }
        } else {
            let evaluation = self.engine.evaluate(&EngineInput {
                state: previous.state,
                sample: inputs.sample.as_ref(),
                manual_signal,
                actuator_on: inputs.actuator_on,
                now,
                last_transition_at: previous.last_transition_at,
                last_off_at: previous.last_off_at,
            });
            match &inputs.fault {
                Some(fault) if fault.is_unreachable() => Evaluation {
                    reason: match fault {
                        GatewayError::Unreachable(_) => fault.to_string(),
                        _ => format!("gateway unreachable: {fault}"),
                    },
                    failure: Some(FailureCause::GatewayUnreachable),
                    ..evaluation
                },
                _ => evaluation,
            }
        };

        if evaluation.next_state == ControllerState::ManualOverride
            || self.expected_actuator.is_none()
        {
            if let Some(observed) = inputs.actuator_on {
                self.expected_actuator = Some(observed);
            }
        }

        let mut command = None;
        if let Some(action) = evaluation.action {
            let outcome = self.execute_verified(action).await;
            if outcome.verified {
                self.expected_actuator = Some(action.is_on());
            } else {
                evaluation = Evaluation {
                    next_state: ControllerState::Failure,
                    action: None,
                    reason: format!(
                        "command verification failed after {} attempts",
                        outcome.attempts
                    ),
                    failure: Some(FailureCause::VerificationExhausted),
                };
            }
            command = Some(outcome);
        }

        let mut record = previous;
        if let Some(sample) = inputs.sample {
            record.last_sample = Some(sample);
        }
        if command.is_some_and(|outcome| outcome.verified && !outcome.command.is_on()) {
            record.last_off_at = Some(now);
        }
        let unreachable = inputs.fault.as_ref().is_some_and(GatewayError::is_unreachable);
        self.commit(before, record, evaluation, command, now, unreachable).await
    }

    async fn apply_reset(&mut self) {
        let mut record = self.handle.record.write().await;
        if record.is_failure_latched() {
            info!(
                "operator reset clears latched failure ({})",
                record.failure_cause.map_or("unknown", FailureCause::as_str)
            );
            record.failure_cause = None;
            self.expected_actuator = None;
        } else {
            debug!("operator reset requested in {}; nothing latched", record.state);
        }
    }

    async fn read_inputs(&self) -> Inputs {
        let sample = match self.bounded(self.gateway.read_temperature()).await {
            Ok(sample) => sample,
            Err(err) => {
                warn!("temperature read failed: {err}");
                return Inputs {
                    sample: None,
                    actuator_on: None,
                    fault: Some(err),
                };
            }
        };

        match self.bounded(self.gateway.read_actuator_state()).await {
            Ok(on) => Inputs {
                sample: Some(sample),
                actuator_on: Some(on),
                fault: None,
            },
            Err(err) if err.is_unreachable() => {
                warn!("actuator state read failed: {err}");
                Inputs {
                    sample: None,
                    actuator_on: None,
                    fault: Some(err),
                }
            }
            Err(err) => {
                warn!("actuator state unknown: {err}");
                Inputs {
                    sample: Some(sample),
                    actuator_on: None,
                    fault: None,
                }
            }
        }
    }

    async fn execute_verified(&self, command: ActuatorCommand) -> CommandOutcome {
        let config = self.config();
        let attempts = config.verification_attempts.max(1);
        let wanted = command.is_on();

        for attempt in 1..=attempts {
            match self.bounded(self.gateway.set_actuator(wanted)).await {
                Ok(()) => match self.bounded(self.gateway.read_actuator_state()).await {
                    Ok(observed) if observed == wanted => {
                        info!("actuator {command} verified (attempt {attempt}/{attempts})");
                        return CommandOutcome {
                            command,
                            attempts: attempt,
                            verified: true,
                        };
                    }
                    Ok(_) => warn!(
                        "actuator {command} not confirmed (attempt {attempt}/{attempts})"
                    ),
                    Err(err) => warn!(attempt, "actuator {command} verify read failed: {err}"),
                },
                Err(err) => warn!(attempt, attempts, "actuator {command} failed: {err}"),
            }

            if attempt < attempts {
                tokio::time::sleep(config.verification_backoff()).await;
            }
        }

        CommandOutcome {
            command,
            attempts,
            verified: false,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> Result<T, GatewayError> {
        let limit = self.config().gateway_timeout();
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(GatewayError::Timeout(limit)))
    }

    /// Records a tick that could not run to completion.
    async fn fail_tick(
        &mut self,
        now: DateTime<Utc>,
        cause: FailureCause,
        reason: String,
    ) -> TickOutcome {
        let record = self.handle.record().await;
        let before = record.persisted();
        let failure = if record.is_failure_latched() {
            record.failure_cause
        } else {
            Some(cause)
        };
        let evaluation = Evaluation {
            next_state: ControllerState::Failure,
            action: None,
            reason,
            failure,
        };
        self.commit(before, record, evaluation, None, now, true).await
    }

    async fn commit(
        &mut self,
        before: PersistedControl,
        mut record: ControlRecord,
        evaluation: Evaluation,
        command: Option<CommandOutcome>,
        now: DateTime<Utc>,
        unreachable: bool,
    ) -> TickOutcome {
        let next = evaluation.next_state;
        let transition = record.transition(next, now);
        record.failure_cause = if next == ControllerState::Failure {
            evaluation.failure.or(record.failure_cause)
        } else {
            None
        };

        let decision = Decision {
            reason: evaluation.reason,
            timestamp: now,
            resulting_state: next,
            command_issued: command.map(|outcome| outcome.command.is_on()),
        };
        record.last_decision = Some(decision.clone());

        let failure_cause = record.failure_cause;
        let cause_changed = failure_cause != before.failure_cause;
        match transition {
            Some(t) if t.to == ControllerState::Failure => {
                error!("state transition {} -> {}: {}", t.from, t.to, decision.reason);
            }
            Some(t) => info!("state transition {} -> {}: {}", t.from, t.to, decision.reason),
            None if next == ControllerState::Failure && cause_changed => {
                let cause = failure_cause.map_or("unknown", FailureCause::as_str);
                error!(state = %next, "failure cause now {cause}: {}", decision.reason);
            }
            None => info!(state = %next, "{}", decision.reason),
        }

        let persisted = record.persisted();
        *self.handle.record.write().await = record;

        if persisted != before {
            if let Some(store) = &self.store {
                if let Err(err) = store.save_control(&persisted).await {
                    warn!("failed to persist controller state: {err:#}");
                }
            }
        }

        if next == ControllerState::Failure
            && (transition.is_some() || unreachable || cause_changed)
        {
            let kind = failure_cause.map_or(AlertKind::ApiUnreachable, AlertKind::from);
            self.emit(Alert::critical(
                kind,
                format!("heater controller in FAILURE: {}", decision.reason),
                now,
            ))
            .await;
        }
        if let Some(t) = transition.filter(|t| t.from == ControllerState::Failure) {
            self.emit(Alert::info(
                AlertKind::StateChange,
                format!("heater controller recovered from FAILURE into {}", t.to),
                now,
            ))
            .await;
        }

        TickOutcome {
            decision,
            transition,
            command,
        }
    }

    async fn emit(&self, alert: Alert) {
        let limit = self.config().gateway_timeout();
        match tokio::time::timeout(limit, self.alerts.send(alert)).await {
            Ok(Ok(Delivery::Sent { alert_id, channels })) => {
                debug!(alert_id, "alert delivered via {}", channels.join(","))
            }
            Ok(Ok(Delivery::Deduplicated)) => {}
            Ok(Err(err)) => warn!("alert delivery failed: {err}"),
            Err(_) => warn!("alert delivery timed out after {limit:?}"),
        }
    }
}
