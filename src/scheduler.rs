//! Owns the single run slot and the shared timing state.
//!
//! Every run, whether fired by the timer or requested over HTTP, goes through
//! [`Scheduler::trigger`]. A trigger that arrives while a run is in flight
//! joins that run and receives its outcome instead of starting a second
//! browser session.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::latency::RunLatency;
use crate::config::FAILURE_ESCALATION_EVERY;
use crate::error::AppError;
use crate::orchestrator::Orchestrator;
use crate::types::{ScrapeRun, StatusSnapshot, Trigger};

/// Result of one run as seen by every caller that waited on it.
pub type RunOutcome = std::result::Result<ScrapeRun, Arc<AppError>>;

#[derive(Default)]
struct SchedulerState {
    last_update: Option<DateTime<Utc>>,
    next_update: Option<DateTime<Utc>>,
    /// Monotonic deadline the timer loop sleeps towards. None = run now.
    next_due: Option<Instant>,
    consecutive_failures: u32,
    last_error: Option<String>,
    /// Present while a run is in flight; joiners wait on a clone.
    in_flight: Option<watch::Receiver<Option<RunOutcome>>>,
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    update_interval: Duration,
    retry_delay: Duration,
    state: Mutex<SchedulerState>,
    /// Wakes the timer loop whenever `next_due` moves.
    rescheduled: Notify,
    latency: Arc<RunLatency>,
}

impl Scheduler {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        update_interval: Duration,
        retry_delay: Duration,
        latency: Arc<RunLatency>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            update_interval,
            retry_delay,
            state: Mutex::new(SchedulerState::default()),
            rescheduled: Notify::new(),
            latency,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update_interval(&self) -> Duration {
        self.update_interval
    }

    /// Consistent copy of the timing state.
    pub fn status(&self) -> StatusSnapshot {
        let state = self.lock_state();
        StatusSnapshot {
            last_update: state.last_update,
            next_update: state.next_update,
            update_interval_hours: self.update_interval.as_secs_f64() / 3600.0,
            running: state.in_flight.is_some(),
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }

    /// Start a run, or join the one already in flight, and wait for its outcome.
    ///
    /// The run itself executes on its own task, so dropping the returned
    /// future (e.g. an HTTP client disconnecting) never aborts it.
    pub async fn trigger(self: &Arc<Self>, source: Trigger) -> RunOutcome {
        let mut rx = {
            let mut state = self.lock_state();
            match state.in_flight.clone() {
                Some(rx) => {
                    debug!(trigger = %source, "Run already in flight, joining it");
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.in_flight = Some(rx.clone());
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.execute(source, tx).await });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(Arc::new(AppError::RunAborted)))
    }

    /// Wait for the in-flight run, if any, to finish.
    pub async fn wait_idle(&self) {
        let in_flight = self.lock_state().in_flight.clone();
        if let Some(mut rx) = in_flight {
            let _ = rx.wait_for(Option::is_some).await;
        }
    }

    async fn execute(self: Arc<Self>, source: Trigger, tx: watch::Sender<Option<RunOutcome>>) {
        info!(trigger = %source, "Starting scrape run");
        let started = std::time::Instant::now();

        let orchestrator = Arc::clone(&self.orchestrator);
        let outcome = match tokio::spawn(async move { orchestrator.run_once().await }).await {
            Ok(result) => result.map_err(Arc::new),
            Err(join_err) => {
                error!("Scrape run task failed: {join_err}");
                Err(Arc::new(AppError::RunAborted))
            }
        };
        self.latency.record(started.elapsed());

        self.finish(source, &outcome);
        let _ = tx.send(Some(outcome));
        self.rescheduled.notify_one();
    }

    /// Record the outcome and release the run slot.
    fn finish(&self, source: Trigger, outcome: &RunOutcome) {
        let now = Utc::now();
        let mut state = self.lock_state();
        state.in_flight = None;
        state.last_update = Some(now);

        let delay = match outcome {
            Ok(run) => {
                state.consecutive_failures = 0;
                state.last_error = None;
                info!(
                    trigger = %source,
                    run_id = run.run_id,
                    results = run.results.len(),
                    "Scrape run completed"
                );
                self.update_interval
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.last_error = Some(e.to_string());
                let delay = if e.is_retryable() {
                    self.retry_delay
                } else {
                    self.update_interval
                };
                error!(
                    trigger = %source,
                    failures = state.consecutive_failures,
                    retry_in_secs = delay.as_secs(),
                    "Scrape run failed: {e}"
                );
                if state.consecutive_failures % FAILURE_ESCALATION_EVERY == 0 {
                    error!(
                        failures = state.consecutive_failures,
                        "Scraping has failed {} times in a row; still retrying",
                        state.consecutive_failures,
                    );
                }
                delay
            }
        };

        let next = add_delay(now, delay);
        state.next_update = Some(next);
        state.next_due = Some(Instant::now() + delay);
        info!("Next update scheduled for: {next}");
    }

    /// Timer loop: one immediate run, then one run each time the shared
    /// deadline passes. Returns once `shutdown` is cancelled; an in-flight
    /// run is left to finish on its own task.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_hours = self.update_interval.as_secs_f64() / 3600.0,
            retry_delay_secs = self.retry_delay.as_secs(),
            "Automatic updates scheduled"
        );
        let mut source = Trigger::Startup;

        loop {
            let due = self.lock_state().next_due;
            if let Some(due) = due.filter(|d| *d > Instant::now()) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.rescheduled.notified() => continue,
                    _ = tokio::time::sleep_until(due) => continue,
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(e) = self.trigger(source).await {
                warn!(trigger = %source, "Automatic update failed: {e}");
            }
            source = Trigger::Timer;
        }

        info!("Scheduler stopped");
    }
}

fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
