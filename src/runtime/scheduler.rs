/// Background polling-loop scheduler
///
/// Turns loop-configured `http_request` nodes into persisted repeating tasks. A single
/// tick task scans SQLite for due loops, claims each one atomically and hands it to a
/// semaphore-bounded worker pool, so one loop never runs two iterations at once and
/// the tick never waits on iteration work. Terminal transitions are broadcast to the
/// DAG branches parked on the loop.

use crate::config::SchedulerConfig;
use crate::runtime::actions::render_template;
use crate::runtime::error::{HttpError, LoopError};
use crate::runtime::http::{body_text, HttpExecutor, HttpRequest};
use crate::runtime::sandbox::ScriptSandbox;
use crate::store::loops::{
    IterationRecord, IterationUpdate, LoopControl, LoopState, LoopStatus, LoopStatusReport, LoopStore,
    RecordOutcome, TerminationReason,
};
use crate::workflow::types::{
    BackoffStrategy, HttpRequestAction, LoopConfig, TerminationAction, WorkflowEvent,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Terminal transition of a loop, as seen by waiting branches
#[derive(Debug, Clone)]
pub struct LoopEvent {
    pub loop_id: String,
    pub execution_id: String,
    pub status: LoopStatus,
}

/// Polling-loop scheduler service
pub struct LoopScheduler {
    store: LoopStore,
    http: HttpExecutor,
    sandbox: ScriptSandbox,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    events: broadcast::Sender<LoopEvent>,
}

impl LoopScheduler {
    pub fn new(store: LoopStore, http: HttpExecutor, sandbox: ScriptSandbox, config: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            http,
            sandbox,
            workers: Arc::new(Semaphore::new(config.max_concurrent_iterations.max(1))),
            config,
            events,
        }
    }

    pub fn store(&self) -> &LoopStore {
        &self.store
    }

    /// Validate and persist a new loop for `node_id`, due immediately
    ///
    /// The URL template is rendered once against the triggering event; every iteration
    /// polls the same address.
    pub async fn schedule_loop(
        &self,
        execution_id: &str,
        workflow_id: &str,
        node_id: &str,
        action: &HttpRequestAction,
        event: WorkflowEvent,
    ) -> Result<LoopState, LoopError> {
        let loop_config = action
            .loop_config
            .clone()
            .ok_or_else(|| LoopError::InvalidConfig("node has no loop_config".to_string()))?;
        let action = HttpRequestAction {
            url: render_template(&action.url, &event),
            ..action.clone()
        };
        validate_loop(&action, &loop_config)?;

        let state = LoopState::new(execution_id, workflow_id, node_id, &action, loop_config, event);
        self.store.insert(&state).await?;

        tracing::info!(
            "🔁 Scheduled loop {} for node '{}' (execution {}): {} {}",
            state.id,
            node_id,
            execution_id,
            state.method,
            state.url
        );
        Ok(state)
    }

    /// Re-arm loops orphaned by a restart and purge expired terminal rows
    ///
    /// Returns how many loops are active.
    pub async fn recover(&self) -> Result<usize, LoopError> {
        let now = Utc::now();
        let retention = chrono::Duration::hours(self.config.terminal_retention_hours as i64);
        let purged = self.store.purge_terminal(now - retention).await?;
        if purged > 0 {
            tracing::info!("🧹 Purged {} finished loop(s) past retention", purged);
        }

        let rearmed = self.store.recover(now).await?;
        let active = self.store.list_active(None).await?.len();
        tracing::info!("♻️ Recovered {} active loop(s), {} re-armed after an interrupted iteration", active, rearmed);
        Ok(active)
    }

    /// Spawn the tick loop; it runs until `shutdown` fires
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                "⏰ Starting loop scheduler (tick {:?}, {} workers)",
                scheduler.config.tick_interval(),
                scheduler.config.max_concurrent_iterations
            );
            let mut interval = tokio::time::interval(scheduler.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            tracing::error!("❌ Loop scheduler tick failed: {}", e);
                        }
                    }
                }
            }
            tracing::info!("⏹️ Loop scheduler stopped");
        })
    }

    /// Claim due loops and dispatch them to free workers; returns the number dispatched
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize, LoopError> {
        let available = self.workers.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let mut dispatched = 0;
        for loop_id in self.store.due_ids(now, available).await? {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let Some(token) = self.store.claim(&loop_id, now).await? else {
                continue;
            };

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = scheduler.run_iteration(&loop_id, &token).await {
                    tracing::error!("❌ Iteration of loop {} failed: {}", loop_id, e);
                    if let Err(e) = scheduler.store.release(&loop_id, &token, Utc::now()).await {
                        tracing::warn!("⚠️ Could not release loop {}: {}", loop_id, e);
                    }
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            tracing::debug!("🔔 Dispatched {} loop iteration(s)", dispatched);
        }
        Ok(dispatched)
    }

    /// One iteration of a claimed loop
    pub(crate) async fn run_iteration(&self, loop_id: &str, token: &str) -> Result<(), LoopError> {
        let state = self.store.require(loop_id).await?;
        let iteration = state.current_iteration + 1;
        let timeout = Duration::from_secs(
            state
                .timeout_seconds
                .min(self.config.max_iteration_timeout_seconds)
                .max(1),
        );

        let request = HttpRequest {
            url: state.url.clone(),
            method: state.method,
            headers: state.headers.clone(),
            body: state.initial_event.data.clone(),
        };
        let started = Instant::now();
        let outcome = self.http.send_once(&request, timeout).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (data, http_status, response_text, error) = match outcome {
            Ok(result) => {
                let text = body_text(&result.body);
                (result.body, result.status, Some(text), None)
            }
            Err(HttpError::StatusError { code, body }) => {
                let data = serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body.clone()));
                let error = HttpError::StatusError { code, body: body.clone() };
                (data, code, Some(body), Some(error))
            }
            Err(e) => (state.initial_event.data.clone(), 0, None, Some(e)),
        };

        let success = error.is_none();
        let successful_iterations = state.successful_iterations + u32::from(success);
        let consecutive_failures = if success { 0 } else { state.consecutive_failures + 1 };
        let elapsed_seconds = (Utc::now() - state.loop_started_at).num_seconds().max(0);

        let event = state
            .initial_event
            .with_data(data)
            .with_metadata("loop_id", &state.id)
            .with_metadata("loop_iteration", iteration)
            .with_metadata("consecutive_failures", consecutive_failures)
            .with_metadata("elapsed_seconds", elapsed_seconds)
            .with_metadata("http_status", http_status);

        match &error {
            None => tracing::debug!("📡 Loop {} iteration {}: {} in {}ms", loop_id, iteration, http_status, latency_ms),
            Some(e) => tracing::warn!("⚠️ Loop {} iteration {} failed: {}", loop_id, iteration, e),
        }

        let terminal = match self.check_termination(&state.loop_config, &event).await {
            Some(reason) => Some(reason),
            None => state
                .max_iterations
                .filter(|max| iteration >= *max)
                .map(|_| TerminationReason::MaxIterations),
        };

        let interval = state.loop_config.backoff().interval_after(iteration);
        let snippet: String = response_text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(self.config.history_snippet_chars)
            .collect();

        let update = IterationUpdate {
            current_iteration: iteration,
            successful_iterations,
            consecutive_failures,
            last_response_status: http_status,
            last_response_body: response_text,
            last_error: error.as_ref().map(|e| e.to_string()),
            last_event: event,
            record: IterationRecord {
                iteration,
                success,
                http_status,
                latency_ms,
                error: error.as_ref().map(|e| e.to_string()),
                error_class: error.as_ref().map(|e| e.class().to_string()),
                response_snippet: snippet,
                at: Utc::now(),
            },
            terminal,
            next_execution_at: Utc::now() + chrono::Duration::seconds(interval as i64),
        };

        match self
            .store
            .record_iteration(loop_id, token, update, self.config.max_history_entries)
            .await?
        {
            RecordOutcome::Recorded(saved) if saved.status.is_terminal() => {
                tracing::info!(
                    "🏁 Loop {} finished after {} iteration(s): {} ({})",
                    loop_id,
                    saved.current_iteration,
                    saved.status,
                    saved.termination_reason.map(|r| r.as_str()).unwrap_or("-")
                );
                self.notify(&saved);
            }
            RecordOutcome::Recorded(saved) => {
                tracing::debug!("⏭️ Loop {} next run in {}s (status {})", loop_id, interval, saved.status);
            }
            RecordOutcome::Discarded => {}
        }
        Ok(())
    }

    async fn check_termination(&self, config: &LoopConfig, event: &WorkflowEvent) -> Option<TerminationReason> {
        let condition = config.termination_condition.as_ref()?;
        match self.sandbox.evaluate_condition(&condition.script, event).await {
            Ok(true) => Some(match condition.action {
                TerminationAction::Success => TerminationReason::Success,
                TerminationAction::Failure => TerminationReason::Failure,
                TerminationAction::Stop => TerminationReason::Stop,
            }),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("⚠️ Termination condition failed, continuing loop: {}", e);
                None
            }
        }
    }

    /// Apply a control operation and announce it when it ends the loop
    pub async fn control(&self, loop_id: &str, control: LoopControl) -> Result<LoopState, LoopError> {
        let (state, changed) = self.store.transition(loop_id, control).await?;
        if changed && state.status.is_terminal() {
            self.notify(&state);
        }
        Ok(state)
    }

    /// Stop every active loop of an execution
    pub async fn stop_execution_loops(&self, execution_id: &str) -> Result<usize, LoopError> {
        let mut stopped = 0;
        for state in self.store.list_active(Some(execution_id)).await? {
            match self.control(&state.id, LoopControl::Stop).await {
                Ok(_) => stopped += 1,
                Err(LoopError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stopped)
    }

    pub async fn status(&self, loop_id: &str) -> Result<LoopStatusReport, LoopError> {
        Ok(self.store.require(loop_id).await?.into())
    }

    pub async fn list_active(&self, execution_id: Option<&str>) -> Result<Vec<LoopStatusReport>, LoopError> {
        Ok(self
            .store
            .list_active(execution_id)
            .await?
            .into_iter()
            .map(LoopStatusReport::from)
            .collect())
    }

    /// Wait until the loop reaches a terminal status
    ///
    /// Subscribes before checking the row so no transition is missed; a lagged
    /// receiver or the safety poll interval triggers a fresh read.
    pub async fn wait_for_completion(&self, loop_id: &str) -> Result<LoopState, LoopError> {
        let mut receiver = self.events.subscribe();
        let poll = self.config.completion_poll();

        loop {
            let state = self.store.require(loop_id).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }

            let deadline = tokio::time::sleep(poll);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Ok(event) if event.loop_id == loop_id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!("📭 Completion listener lagged by {} event(s)", skipped);
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            (&mut deadline).await;
                            break;
                        }
                    },
                    _ = &mut deadline => break,
                }
            }
        }
    }

    fn notify(&self, state: &LoopState) {
        // No receivers just means nothing is parked on this loop
        let _ = self.events.send(LoopEvent {
            loop_id: state.id.clone(),
            execution_id: state.execution_id.clone(),
            status: state.status,
        });
    }
}

/// Bounds checked when a loop is created
pub fn validate_loop(action: &HttpRequestAction, config: &LoopConfig) -> Result<(), LoopError> {
    let invalid = |message: String| Err(LoopError::InvalidConfig(message));

    if !(action.url.starts_with("http://") || action.url.starts_with("https://")) {
        return invalid(format!("url must start with http:// or https://, got '{}'", action.url));
    }
    if !(1..=3_600).contains(&action.timeout_seconds) {
        return invalid(format!("timeout_seconds must be 1..=3600, got {}", action.timeout_seconds));
    }
    if let Some(max) = config.max_iterations {
        if !(1..=10_000).contains(&max) {
            return invalid(format!("max_iterations must be 1..=10000, got {max}"));
        }
    }
    if !(1..=86_400).contains(&config.interval_seconds) {
        return invalid(format!("interval_seconds must be 1..=86400, got {}", config.interval_seconds));
    }

    match &config.backoff_strategy {
        None => {}
        Some(BackoffStrategy::Fixed(seconds)) => {
            if !(1..=86_400).contains(seconds) {
                return invalid(format!("fixed backoff must be 1..=86400 seconds, got {seconds}"));
            }
        }
        Some(BackoffStrategy::Exponential { base, multiplier, max }) => {
            if !(1..=3_600).contains(base) {
                return invalid(format!("exponential base must be 1..=3600, got {base}"));
            }
            if !(*multiplier > 1.0 && *multiplier <= 10.0) {
                return invalid(format!("exponential multiplier must be in (1.0, 10.0], got {multiplier}"));
            }
            if !(1..=86_400).contains(max) || max < base {
                return invalid(format!("exponential max must be 1..=86400 and >= base, got {max}"));
            }
        }
    }

    if let Some(condition) = &config.termination_condition {
        if condition.script.trim().is_empty() {
            return invalid("termination condition script is empty".to_string());
        }
    }
    Ok(())
}
