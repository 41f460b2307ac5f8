//! Service layer for the API service.
//!
//! # Components
//!
//! - `database` - Shared database session and the database probe
//! - `peer_probe` - HTTP health probes against peer services

pub mod database;
pub mod peer_probe;

pub use database::{mock::MockDatabaseSession, probe_database, DatabaseSession, PgSession};
pub use peer_probe::{PeerEndpoint, PeerProbeClient, PeerServices};
