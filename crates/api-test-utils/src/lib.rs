//! # API Test Utilities
//!
//! Shared test utilities for the API service.
//!
//! This crate provides:
//! - Server test harness (`TestApiServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use api_service::services::MockDatabaseSession;
//! use api_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let session = Arc::new(MockDatabaseSession::healthy());
//!     let server = TestApiServer::spawn(session, "http://127.0.0.1:9", "http://127.0.0.1:9").await?;
//!
//!     let response = reqwest::get(format!("{}/health", server.url())).await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod server_harness;

// Re-export commonly used items
pub use server_harness::*;
