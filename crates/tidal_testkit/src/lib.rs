//! # Tidal Testkit
//!
//! Test utilities for Tidal.
//!
//! This crate provides:
//! - [`MockGateway`]: an in-memory remote with etags, a call log and
//!   scripted failures
//! - [`TestHarness`]: a fully wired engine on a manual clock
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidal_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn offline_edit_syncs_on_reconnect() {
//!     let h = TestHarness::new();
//!     h.products.update("p1", product("Tea", 100)).unwrap();
//!     h.go_online();
//!     h.sync().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mock_gateway;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::mock_gateway::*;
}

pub use fixtures::*;
pub use generators::*;
pub use mock_gateway::*;
