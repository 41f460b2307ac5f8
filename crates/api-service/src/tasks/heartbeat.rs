//! Database heartbeat watchdog.
//!
//! Probes the database session on a fixed interval, racing each probe
//! against a deadline. The first failure is fatal: the watchdog asks its
//! `ProcessTerminator` to exit the process with status 1 and stops. There is
//! no retry budget and no backoff; an orchestrator is expected to restart
//! the instance.
//!
//! A connection-level failure reported by the session outside of any probe
//! is handled the same way.
//!
//! # Cycles
//!
//! Probes are awaited inside the loop and missed ticks are skipped, so at
//! most one probe is in flight at any time. A probe that loses the race is
//! dropped; the query itself may still finish against the session and its
//! result is discarded.
//!
//! # Graceful Shutdown
//!
//! Cancelling the token stops the watchdog without requesting termination.
//! Cancellation is observed between probes, so shutdown may wait for at most
//! one probe deadline.

use crate::services::DatabaseSession;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Default interval between probes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline for a single probe.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest accepted interval between probes; larger values are clamped.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);

/// Exit status requested on any database connectivity failure.
pub const DATABASE_FAILURE_EXIT_CODE: i32 = 1;

/// Why a heartbeat cycle failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    #[error("DB heartbeat timeout")]
    Timeout,

    #[error("DB heartbeat query failed: {0}")]
    Query(String),

    #[error("DB connection error: {0}")]
    ConnectionLost(String),
}

/// How the watchdog loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Termination was requested because of this failure.
    Terminated(HeartbeatError),

    /// The cancellation token fired.
    Stopped,
}

/// Ends the process on behalf of the watchdog.
pub trait ProcessTerminator: Send + Sync {
    /// Request process termination with `exit_code`.
    fn terminate(&self, exit_code: i32, reason: &str);
}

/// Terminator that exits the real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitProcess;

impl ProcessTerminator for ExitProcess {
    fn terminate(&self, exit_code: i32, reason: &str) {
        error!(
            target: "api.task.heartbeat",
            exit_code,
            reason,
            "Terminating process"
        );
        std::process::exit(exit_code);
    }
}

/// Terminator that only records the first request (for tests).
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    requested: OnceLock<(i32, String)>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first termination request, if any.
    pub fn requested(&self) -> Option<&(i32, String)> {
        self.requested.get()
    }
}

impl ProcessTerminator for RecordingTerminator {
    fn terminate(&self, exit_code: i32, reason: &str) {
        let _ = self.requested.set((exit_code, reason.to_string()));
    }
}

/// Run one probe raced against `timeout`.
///
/// # Errors
///
/// - `HeartbeatError::Timeout` if the deadline fires first
/// - `HeartbeatError::Query` if the query fails first
pub async fn heartbeat_once(
    session: &dyn DatabaseSession,
    timeout: Duration,
) -> Result<(), HeartbeatError> {
    match tokio::time::timeout(timeout, session.ping()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HeartbeatError::Query(e.to_string())),
        Err(_) => Err(HeartbeatError::Timeout),
    }
}

/// Recurring database heartbeat with fail-fast termination.
pub struct HeartbeatWatchdog {
    session: Arc<dyn DatabaseSession>,
    terminator: Arc<dyn ProcessTerminator>,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatWatchdog {
    /// Create a watchdog with the default interval and timeout.
    pub fn new(
        session: Arc<dyn DatabaseSession>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        Self {
            session,
            terminator,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    /// Override the probe interval, clamped to `MAX_HEARTBEAT_INTERVAL`.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.min(MAX_HEARTBEAT_INTERVAL);
        self
    }

    /// Override the probe deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the watchdog onto the runtime.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<WatchdogOutcome> {
        tokio::spawn(
            self.run(cancel_token)
                .instrument(tracing::info_span!("api.task.heartbeat")),
        )
    }

    /// Run until a failure is detected or the token is cancelled.
    ///
    /// The first probe fires one interval after start.
    pub async fn run(self, cancel_token: CancellationToken) -> WatchdogOutcome {
        info!(
            target: "api.task.heartbeat",
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.as_millis() as u64,
            "Starting database heartbeat"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut connection_lost = self.session.connection_lost();

        let failure = loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!(
                        target: "api.task.heartbeat",
                        "Heartbeat received shutdown signal, exiting"
                    );
                    return WatchdogOutcome::Stopped;
                }
                reason = &mut connection_lost => {
                    break HeartbeatError::ConnectionLost(reason);
                }
                _ = ticker.tick() => {
                    match heartbeat_once(self.session.as_ref(), self.timeout).await {
                        Ok(()) => debug!(target: "api.task.heartbeat", "DB heartbeat OK"),
                        Err(e) => break e,
                    }
                }
            }
        };

        error!(
            target: "api.task.heartbeat",
            error = %failure,
            "DB heartbeat failed"
        );
        self.terminator
            .terminate(DATABASE_FAILURE_EXIT_CODE, &failure.to_string());

        WatchdogOutcome::Terminated(failure)
    }
}
