//! Database session shared by the `/db-check` handler and the heartbeat
//! watchdog.
//!
//! The session is one long-lived connection, established before the HTTP
//! listener starts and torn down only at process exit. All queries issued
//! through it are read-only, and they run one at a time.
//!
//! A lost connection is never replaced. Once the server or the network drops
//! it, every query fails and the heartbeat watchdog ends the process.
//!
//! # Abandoned Queries
//!
//! Callers may race a query against a timer and drop it when the timer wins.
//! The query keeps running server-side until it completes or hits the
//! session's `statement_timeout`; its result is discarded.

use crate::config::DatabaseConfig;
use crate::errors::ApiError;
use crate::models::DatabaseCheckResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

/// Time allowed to establish the session at startup.
const SESSION_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Reason reported once the session has been closed on purpose.
const SESSION_CLOSED: &str = "database session closed";

/// Operations the service needs from its database session.
#[async_trait]
pub trait DatabaseSession: Send + Sync {
    /// Run `SELECT NOW()` and return the server time.
    async fn current_time(&self) -> Result<DateTime<Utc>, ApiError>;

    /// Run `SELECT 1`.
    async fn ping(&self) -> Result<(), ApiError>;

    /// Resolve when the session reports a connection-level failure outside
    /// of any query, with a description of the failure.
    async fn connection_lost(&self) -> String;
}

/// Connection options for the session, including its statement timeout.
pub fn session_options(config: &DatabaseConfig) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(config.password.expose_secret())
        .database(&config.name);

    with_statement_timeout(options, config.statement_timeout_seconds)
}

/// Bound every statement on the session server-side.
pub fn with_statement_timeout(options: PgConnectOptions, seconds: u64) -> PgConnectOptions {
    options.options([("statement_timeout", format!("{}s", seconds))])
}

/// PostgreSQL session over one dedicated connection.
///
/// There is no reconnect. The first connection-level error drops the
/// connection, every later query fails with that error, and
/// `connection_lost` resolves with it.
pub struct PgSession {
    connection: Mutex<Option<PgConnection>>,
    lost: watch::Sender<Option<String>>,
}

impl PgSession {
    /// Open the session from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Database` if the connection cannot be established.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ApiError> {
        let session = Self::connect_with(session_options(config)).await?;

        info!(
            target: "api.services.database",
            host = %config.host,
            port = config.port,
            database = %config.name,
            "Database session established"
        );

        Ok(session)
    }

    /// Open the session with explicit connection options.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Database` if the connection cannot be established
    /// within the connect timeout.
    pub async fn connect_with(options: PgConnectOptions) -> Result<Self, ApiError> {
        let connection = tokio::time::timeout(
            Duration::from_secs(SESSION_CONNECT_TIMEOUT_SECS),
            options.connect(),
        )
        .await
        .map_err(|_| {
            ApiError::Database(format!(
                "timed out after {}s connecting to database",
                SESSION_CONNECT_TIMEOUT_SECS
            ))
        })??;

        let (lost, _) = watch::channel(None);

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            lost,
        })
    }

    /// Close the session, waiting for an in-flight query to finish.
    pub async fn close(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(target: "api.services.database", error = %e, "Error closing database session");
            }
        }
        self.mark_lost(SESSION_CLOSED.to_string());
    }

    fn mark_lost(&self, reason: String) {
        self.lost.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason);
            true
        });
    }

    fn lost_reason(&self) -> String {
        self.lost
            .borrow()
            .clone()
            .unwrap_or_else(|| SESSION_CLOSED.to_string())
    }

    fn open<'a>(
        &self,
        slot: &'a mut Option<PgConnection>,
    ) -> Result<&'a mut PgConnection, ApiError> {
        slot.as_mut()
            .ok_or_else(|| ApiError::Database(self.lost_reason()))
    }

    /// Map a query result, tearing the session down on connection failure.
    fn settle<T>(
        &self,
        slot: &mut Option<PgConnection>,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, ApiError> {
        result.map_err(|e| {
            let message = e.to_string();
            if is_connection_error(&e) {
                slot.take();
                error!(
                    target: "api.services.database",
                    error = %message,
                    "Database connection lost"
                );
                self.mark_lost(message.clone());
            }
            ApiError::Database(message)
        })
    }
}

#[async_trait]
impl DatabaseSession for PgSession {
    async fn current_time(&self) -> Result<DateTime<Utc>, ApiError> {
        let mut slot = self.connection.lock().await;
        let connection = self.open(&mut slot)?;
        let result = sqlx::query_as::<_, (DateTime<Utc>,)>("SELECT NOW()")
            .fetch_one(&mut *connection)
            .await;
        let (now,) = self.settle(&mut slot, result)?;
        Ok(now)
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let mut slot = self.connection.lock().await;
        let connection = self.open(&mut slot)?;
        let result = sqlx::query("SELECT 1").execute(&mut *connection).await;
        self.settle(&mut slot, result)?;
        Ok(())
    }

    async fn connection_lost(&self) -> String {
        let mut lost = self.lost.subscribe();
        let reason = match lost.wait_for(Option::is_some).await {
            Ok(reason) => reason.as_deref().unwrap_or(SESSION_CLOSED).to_string(),
            Err(_) => SESSION_CLOSED.to_string(),
        };
        reason
    }
}

/// Whether an error means the connection itself is gone, as opposed to a
/// failed statement on a healthy connection.
fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => true,
        // Class 08 is connection exception; 57P01-57P03 are server shutdowns
        // and pg_terminate_backend.
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || matches!(&*code, "57P01" | "57P02" | "57P03")),
        _ => false,
    }
}

/// Probe the database with a side-effect-free query.
///
/// Never fails: query errors become `DatabaseCheckResult::Disconnected`
/// carrying the driver's message.
#[instrument(skip_all, name = "api.services.database.probe")]
pub async fn probe_database(session: &dyn DatabaseSession) -> DatabaseCheckResult {
    match session.current_time().await {
        Ok(time) => DatabaseCheckResult::Connected(time),
        Err(e) => {
            let message = match e {
                ApiError::Database(message) => message,
                other => other.to_string(),
            };
            warn!(target: "api.services.database", error = %message, "Database probe failed");
            DatabaseCheckResult::Disconnected(message)
        }
    }
}

/// Mock database session for testing.
///
/// Behavior can be switched while the session is shared, so a test can let
/// a watchdog run against a healthy session and then break it.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, Notify};

    /// How the mock answers queries.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockBehavior {
        /// Answer immediately with this server time.
        Healthy(DateTime<Utc>),
        /// Fail immediately with this message.
        Failing(String),
        /// Answer after a delay.
        Slow(Duration),
        /// Never answer.
        Hanging,
    }

    /// Scripted `DatabaseSession`.
    pub struct MockDatabaseSession {
        behavior: Mutex<MockBehavior>,
        lost: Mutex<Option<String>>,
        lost_notify: Notify,
        ping_calls: AtomicUsize,
        time_calls: AtomicUsize,
    }

    impl MockDatabaseSession {
        /// Create a mock with the given behavior.
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                lost: Mutex::new(None),
                lost_notify: Notify::new(),
                ping_calls: AtomicUsize::new(0),
                time_calls: AtomicUsize::new(0),
            }
        }

        /// Create a mock that answers with the given time.
        pub fn healthy_at(time: DateTime<Utc>) -> Self {
            Self::new(MockBehavior::Healthy(time))
        }

        /// Create a mock that answers with the current time.
        pub fn healthy() -> Self {
            Self::healthy_at(Utc::now())
        }

        /// Create a mock whose queries fail with `message`.
        pub fn failing(message: &str) -> Self {
            Self::new(MockBehavior::Failing(message.to_string()))
        }

        /// Create a mock whose queries never complete.
        pub fn hanging() -> Self {
            Self::new(MockBehavior::Hanging)
        }

        /// Switch behavior for subsequent queries.
        pub async fn set_behavior(&self, behavior: MockBehavior) {
            *self.behavior.lock().await = behavior;
        }

        /// Report an asynchronous connection-level failure.
        pub async fn trigger_connection_lost(&self, reason: &str) {
            *self.lost.lock().await = Some(reason.to_string());
            self.lost_notify.notify_one();
        }

        /// Number of `ping` calls made.
        pub fn ping_calls(&self) -> usize {
            self.ping_calls.load(Ordering::SeqCst)
        }

        /// Number of `current_time` calls made.
        pub fn time_calls(&self) -> usize {
            self.time_calls.load(Ordering::SeqCst)
        }

        async fn answer(&self) -> Result<DateTime<Utc>, ApiError> {
            let behavior = self.behavior.lock().await.clone();
            match behavior {
                MockBehavior::Healthy(time) => Ok(time),
                MockBehavior::Failing(message) => Err(ApiError::Database(message)),
                MockBehavior::Slow(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(Utc::now())
                }
                MockBehavior::Hanging => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl DatabaseSession for MockDatabaseSession {
        async fn current_time(&self) -> Result<DateTime<Utc>, ApiError> {
            self.time_calls.fetch_add(1, Ordering::SeqCst);
            self.answer().await
        }

        async fn ping(&self) -> Result<(), ApiError> {
            self.ping_calls.fetch_add(1, Ordering::SeqCst);
            self.answer().await.map(|_| ())
        }

        async fn connection_lost(&self) -> String {
            loop {
                if let Some(reason) = self.lost.lock().await.clone() {
                    return reason;
                }
                self.lost_notify.notified().await;
            }
        }
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::mock::MockDatabaseSession;
    use super::*;
    use crate::tasks::{
        HeartbeatError, HeartbeatWatchdog, RecordingTerminator, WatchdogOutcome,
    };
    use chrono::TimeZone;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn backend_pid(session: &PgSession) -> i32 {
        let mut slot = session.connection.lock().await;
        let connection = slot.as_mut().expect("session should be open");
        let (pid,): (i32,) = sqlx::query_as("SELECT pg_backend_pid()")
            .fetch_one(&mut *connection)
            .await
            .unwrap();
        pid
    }

    async fn current_setting(session: &PgSession, name: &str) -> String {
        let mut slot = session.connection.lock().await;
        let connection = slot.as_mut().expect("session should be open");
        let (value,): (String,) = sqlx::query_as("SELECT current_setting($1)")
            .bind(name)
            .fetch_one(&mut *connection)
            .await
            .unwrap();
        value
    }

    /// Kill the session's backend from a second connection.
    async fn terminate_backend(options: &PgConnectOptions, pid: i32) {
        let mut admin = PgConnection::connect_with(options).await.unwrap();
        let (terminated,): (bool,) = sqlx::query_as("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(&mut admin)
            .await
            .unwrap();
        assert!(terminated, "backend {pid} should have been signalled");
        admin.close().await.unwrap();
    }

    /// Query until the session notices its backend is gone.
    async fn first_failure(session: &PgSession) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let DatabaseCheckResult::Disconnected(message) = probe_database(session).await {
                    return message;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("session should report the terminated backend")
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(port)
            .username("api")
            .database("api");

        let result = PgSession::connect_with(options).await;

        assert!(matches!(result, Err(ApiError::Database(_))));
    }

    #[sqlx::test(migrations = false)]
    async fn test_pg_session_answers_queries(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = PgSession::connect_with(options).await?;

        let before = Utc::now();
        let now = session.current_time().await?;
        assert!((now - before).num_seconds().abs() < 60, "server time {now} is off");

        session.ping().await?;
        assert!(matches!(
            probe_database(&session).await,
            DatabaseCheckResult::Connected(_)
        ));

        session.close().await;
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn test_pg_session_applies_statement_timeout(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = PgSession::connect_with(with_statement_timeout(options, 7)).await?;

        assert_eq!(current_setting(&session, "statement_timeout").await, "7s");

        session.close().await;
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn test_statement_error_keeps_session_open(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = PgSession::connect_with(with_statement_timeout(options, 1)).await?;

        {
            let mut slot = session.connection.lock().await;
            let connection = session.open(&mut slot)?;
            let result = sqlx::query("SELECT pg_sleep(5)")
                .execute(&mut *connection)
                .await;
            let err = session.settle(&mut slot, result).unwrap_err();
            assert!(err.to_string().contains("statement timeout"), "got {err}");
        }

        session.ping().await?;
        assert!(session.lost.borrow().is_none());

        session.close().await;
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn test_closed_session_fails_every_query(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = PgSession::connect_with(options).await?;

        session.close().await;

        assert!(matches!(
            session.ping().await,
            Err(ApiError::Database(message)) if message == "database session closed"
        ));
        assert_eq!(
            probe_database(&session).await,
            DatabaseCheckResult::Disconnected("database session closed".to_string())
        );
        assert_eq!(session.connection_lost().await, "database session closed");
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn test_terminated_backend_stays_dead(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = PgSession::connect_with(options.clone()).await?;
        let pid = backend_pid(&session).await;

        terminate_backend(&options, pid).await;

        let message = first_failure(&session).await;

        let reason = tokio::time::timeout(Duration::from_secs(1), session.connection_lost())
            .await
            .expect("connection loss should be signalled");
        assert_eq!(reason, message);

        // No silent reconnect: the session keeps failing with the same error.
        for _ in 0..3 {
            assert!(matches!(
                session.ping().await,
                Err(ApiError::Database(ref m)) if *m == message
            ));
        }
        Ok(())
    }

    #[sqlx::test(migrations = false)]
    async fn test_watchdog_terminates_after_backend_is_killed(
        _pool_options: sqlx::postgres::PgPoolOptions,
        options: PgConnectOptions,
    ) -> Result<(), anyhow::Error> {
        let session = Arc::new(PgSession::connect_with(options.clone()).await?);
        let pid = backend_pid(&session).await;
        let terminator = Arc::new(RecordingTerminator::new());
        let token = CancellationToken::new();

        let handle = HeartbeatWatchdog::new(session.clone(), terminator.clone())
            .with_interval(Duration::from_secs(60))
            .with_timeout(Duration::from_secs(1))
            .spawn(token.clone());

        terminate_backend(&options, pid).await;
        first_failure(&session).await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watchdog should stop")?;

        assert!(
            matches!(outcome, WatchdogOutcome::Terminated(HeartbeatError::ConnectionLost(_))),
            "unexpected outcome {outcome:?}"
        );
        assert_eq!(terminator.requested().map(|(code, _)| *code), Some(1));
        token.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_database_connected() {
        let time = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let session = MockDatabaseSession::healthy_at(time);

        let result = probe_database(&session).await;

        assert_eq!(result, DatabaseCheckResult::Connected(time));
    }

    #[tokio::test]
    async fn test_probe_database_disconnected_carries_message() {
        let session = MockDatabaseSession::failing("Connection terminated unexpectedly");

        let result = probe_database(&session).await;

        assert_eq!(
            result,
            DatabaseCheckResult::Disconnected("Connection terminated unexpectedly".to_string())
        );
    }
}
