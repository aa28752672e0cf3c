//! Poll cycle and polling loop
//!
//! One cycle walks `Idle → CredentialAcquired → RequestSent → {Succeeded |
//! AuthFailed | RateLimited | TransientFailed | FatalFailed}`. The current
//! state is recorded on the `poll_cycle` span so a stuck cycle shows where
//! it stopped.
//!
//! A bundle's sequence number is taken and its request handed to the
//! transport under that bundle's lane lock, so the transport sees each
//! bundle's numbers in strictly increasing order even on a multi-threaded
//! runtime. Different bundles poll in parallel.
//!
//! Credential outcomes are settled with the pool inside the cycle. Only
//! protocol drift (`FatalError`), template errors, sink failures, and pool
//! exhaustion reach the caller.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use capability::{HttpRequest, ResultSink, Transport, TransportResult};
use companion_auth::{CredentialBundle, now_millis};
use companion_pool::{CredentialPool, FailureKind};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use crate::backoff::Backoff;
use crate::error::PollError;
use crate::outcome::{PollOutcome, classify};
use crate::template::{RequestTemplate, TemplateContext};

/// Placeholders bound fresh on every cycle from the acquired bundle and the
/// clock. Any other placeholder must come from the template's own context.
pub const CYCLE_KEYS: &[&str] = &[
    "ticket",
    "auth_code",
    "auth_data",
    "auth_type",
    "cookie",
    "bundle_id",
    "request_sequence",
    "timestamp",
    "timestamp_ms",
    "message_expiration_time",
];

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Deadline passed to the transport and enforced locally
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_ceiling: Duration,
    /// Fractional jitter applied to backoff delays (0.2 = ±20 %)
    pub jitter: f64,
    /// Top-level key of a successful response envelope
    pub success_key: String,
    /// Added to the current time for `{message_expiration_time}`
    pub message_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(60),
            jitter: 0.2,
            success_key: "responseInfo".to_string(),
            message_ttl: Duration::from_secs(300),
        }
    }
}

/// A rendered request bound to the bundle and sequence number it carries.
#[derive(Debug, Clone)]
pub struct PollRequestContext {
    pub request: HttpRequest,
    pub bundle_id: String,
    pub request_sequence: u64,
}

/// Where a poll cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    CredentialAcquired,
    RequestSent,
    Succeeded,
    AuthFailed,
    RateLimited,
    TransientFailed,
    FatalFailed,
}

impl CycleState {
    pub fn label(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::CredentialAcquired => "credential_acquired",
            CycleState::RequestSent => "request_sent",
            CycleState::Succeeded => "succeeded",
            CycleState::AuthFailed => "auth_failed",
            CycleState::RateLimited => "rate_limited",
            CycleState::TransientFailed => "transient_failed",
            CycleState::FatalFailed => "fatal_failed",
        }
    }

    /// Terminal state for a classified outcome.
    pub fn after(outcome: &PollOutcome) -> Self {
        match outcome {
            PollOutcome::Success { .. } => CycleState::Succeeded,
            PollOutcome::AuthRejected { .. } => CycleState::AuthFailed,
            PollOutcome::RateLimited { .. } => CycleState::RateLimited,
            PollOutcome::TransientError { .. } => CycleState::TransientFailed,
            PollOutcome::FatalError { .. } => CycleState::FatalFailed,
        }
    }

    fn enter(self) -> Self {
        Span::current().record("state", self.label());
        self
    }
}

/// Why `poll_loop` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The cancellation token fired
    Cancelled,
    /// Too many non-success cycles in a row
    CircuitOpen { consecutive_failures: u32 },
    /// Fatal response or template error; needs an operator
    Fatal { cause: String },
}

/// Totals reported when `poll_loop` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub cycles: u64,
    pub successes: u64,
    pub exit: LoopExit,
}

/// Drives poll cycles against a shared credential pool.
pub struct PollingOrchestrator {
    pool: Arc<CredentialPool>,
    transport: Arc<dyn Transport>,
    settings: OrchestratorSettings,
    lanes: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PollingOrchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        transport: Arc<dyn Transport>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            transport,
            settings,
            lanes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Acquire a bundle, take its next sequence number, and render `template`.
    ///
    /// The returned guard holds the bundle's lane and must be kept until the
    /// request has been handed to the transport. An exhausted pool kicks off
    /// a repair before the error is returned.
    async fn prepare(
        &self,
        template: &RequestTemplate,
    ) -> Result<(PollRequestContext, OwnedMutexGuard<()>), PollError> {
        let bundle = match self.pool.acquire().await {
            Ok(b) => b,
            Err(e) => {
                let trigger = self.pool.ensure_capacity().await;
                debug!(?trigger, "pool exhausted, repair requested");
                return Err(e.into());
            }
        };
        let lane = self.lock_lane(&bundle.id).await;
        let sequence = self.pool.next_sequence(&bundle.id).await?;
        let context = self.context_for(&bundle, sequence);
        let request = template.render(&context)?;

        let ctx = PollRequestContext {
            request,
            bundle_id: bundle.id,
            request_sequence: sequence,
        };
        Ok((ctx, lane))
    }

    /// Lock the lane for `bundle_id`. Idle lanes of other bundles are
    /// dropped on the way.
    async fn lock_lane(&self, bundle_id: &str) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
            Arc::clone(lanes.entry(bundle_id.to_string()).or_default())
        };
        lane.lock_owned().await
    }

    /// Run one poll cycle.
    ///
    /// Credential health is settled with the pool before returning. A sink
    /// failure comes back as `PollError::Sink` after the success has already
    /// been credited to the bundle.
    pub async fn poll_once(
        &self,
        template: &RequestTemplate,
        sink: &dyn ResultSink,
    ) -> Result<PollOutcome, PollError> {
        let span = info_span!(
            "poll_cycle",
            stream = %template.name,
            state = CycleState::Idle.label(),
            bundle_id = field::Empty,
            sequence = field::Empty,
        );

        let result = self.run_cycle(template, sink).instrument(span).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(
            "poll_cycles_total",
            "stream" => template.name.clone(),
            "outcome" => label
        )
        .increment(1);
        result
    }

    async fn run_cycle(
        &self,
        template: &RequestTemplate,
        sink: &dyn ResultSink,
    ) -> Result<PollOutcome, PollError> {
        let (ctx, lane) = self.prepare(template).await?;
        let span = Span::current();
        span.record("bundle_id", ctx.bundle_id.as_str());
        span.record("sequence", ctx.request_sequence);
        CycleState::CredentialAcquired.enter();

        CycleState::RequestSent.enter();
        let started = Instant::now();
        let timeout = self.settings.request_timeout;
        let result = tokio::time::timeout(timeout, self.transport.execute(&ctx.request, timeout))
            .await
            .unwrap_or(TransportResult::Timeout);
        drop(lane);
        metrics::histogram!("poll_request_duration_seconds", "stream" => template.name.clone())
            .record(started.elapsed().as_secs_f64());

        let outcome = classify(&result, &self.settings.success_key);
        CycleState::after(&outcome).enter();
        self.settle(&ctx.bundle_id, &outcome).await;

        if let PollOutcome::Success { payload } = &outcome {
            if let Err(e) = sink.accept(payload).await {
                error!(
                    sink = sink.id(),
                    kind = e.label(),
                    error = %e,
                    "result sink failed, payload not stored"
                );
                return Err(PollError::Sink(e));
            }
            debug!(sink = sink.id(), "payload stored");
        }

        Ok(outcome)
    }

    /// Report a classified outcome against the bundle that produced it.
    async fn settle(&self, bundle_id: &str, outcome: &PollOutcome) {
        let reported = match outcome {
            PollOutcome::Success { .. } => self.pool.report_success(bundle_id).await,
            PollOutcome::AuthRejected { status_code } => {
                warn!(bundle_id, status_code, "session ticket rejected");
                let reported = self
                    .pool
                    .report_failure(bundle_id, FailureKind::AuthRejected)
                    .await;
                let trigger = self.pool.ensure_capacity().await;
                debug!(?trigger, "repair requested after auth rejection");
                reported
            }
            PollOutcome::FatalError { .. } => {
                self.pool.report_failure(bundle_id, FailureKind::Fatal).await
            }
            PollOutcome::RateLimited { .. } | PollOutcome::TransientError { .. } => Ok(()),
        };
        if let Err(e) = reported {
            // Another stream may have evicted the bundle in the meantime.
            debug!(bundle_id, error = %e, "outcome not recorded");
        }
    }

    /// Poll `template` every `interval` until cancelled, a fatal outcome, or
    /// `max_consecutive_failures` non-success cycles in a row.
    pub async fn poll_loop(
        &self,
        template: &RequestTemplate,
        sink: &dyn ResultSink,
        interval: Duration,
        max_consecutive_failures: u32,
        cancel: &CancellationToken,
    ) -> LoopSummary {
        let limit = max_consecutive_failures.max(1);
        let mut backoff = Backoff::new(
            self.settings.backoff_base,
            self.settings.backoff_ceiling,
            self.settings.jitter,
        );
        let mut consecutive_failures = 0u32;
        let mut cycles = 0u64;
        let mut successes = 0u64;
        let stream = template.name.as_str();

        info!(stream, interval_ms = interval.as_millis() as u64, "polling started");

        let exit = loop {
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            cycles += 1;

            let delay = match self.poll_once(template, sink).await {
                Ok(PollOutcome::Success { .. }) => {
                    consecutive_failures = 0;
                    successes += 1;
                    backoff.reset();
                    interval
                }
                Ok(PollOutcome::AuthRejected { .. }) => {
                    consecutive_failures += 1;
                    interval
                }
                Ok(PollOutcome::RateLimited { retry_after }) => {
                    consecutive_failures += 1;
                    let delay = backoff.next_delay(retry_after);
                    warn!(stream, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                    delay
                }
                Ok(PollOutcome::TransientError { cause }) => {
                    consecutive_failures += 1;
                    let delay = backoff.next_delay(None);
                    warn!(stream, %cause, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                    delay
                }
                Ok(PollOutcome::FatalError { cause }) => {
                    error!(stream, %cause, "fatal response, stopping stream");
                    break LoopExit::Fatal { cause };
                }
                Err(PollError::Template(e)) => {
                    error!(stream, error = %e, "template error, stopping stream");
                    break LoopExit::Fatal {
                        cause: e.to_string(),
                    };
                }
                Err(e @ (PollError::PoolExhausted(_) | PollError::Pool(_))) => {
                    consecutive_failures += 1;
                    let delay = backoff.next_delay(None);
                    warn!(stream, error = %e, delay_ms = delay.as_millis() as u64, "no credential available, backing off");
                    delay
                }
                Err(PollError::Sink(e)) => {
                    consecutive_failures += 1;
                    error!(stream, error = %e, "poll succeeded but payload was not stored");
                    interval
                }
            };

            if consecutive_failures >= limit {
                error!(stream, consecutive_failures, "circuit open, stopping stream");
                break LoopExit::CircuitOpen {
                    consecutive_failures,
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        info!(stream, cycles, successes, exit = ?exit, "polling stopped");
        LoopSummary {
            cycles,
            successes,
            exit,
        }
    }

    fn context_for(&self, bundle: &CredentialBundle, sequence: u64) -> TemplateContext {
        let now_ms = now_millis();
        let now_secs = now_ms / 1000;
        let expiration = now_secs + self.settings.message_ttl.as_secs();
        let material = &bundle.auth_material;

        let mut ctx = TemplateContext::new();
        ctx.insert("ticket".into(), bundle.ticket.expose().clone());
        ctx.insert("auth_code".into(), material.code.expose().clone());
        ctx.insert("auth_data".into(), material.data.expose().clone());
        ctx.insert("auth_type".into(), material.auth_type.to_string());
        ctx.insert(
            "cookie".into(),
            bundle
                .cookie
                .as_ref()
                .map(|c| c.expose().clone())
                .unwrap_or_default(),
        );
        ctx.insert("bundle_id".into(), bundle.id.clone());
        ctx.insert("request_sequence".into(), sequence.to_string());
        ctx.insert("timestamp".into(), now_secs.to_string());
        ctx.insert("timestamp_ms".into(), now_ms.to_string());
        ctx.insert("message_expiration_time".into(), expiration.to_string());
        ctx
    }
}
