//! gpuq-store: Durable task storage
//!
//! This crate provides the persistence layer shared by the daemon and the CLI:
//! - Task rows with priority-ordered queries
//! - Atomic dispatch claims and compare-and-set state updates
//! - Scheduler instance (server) records

pub mod error;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use sqlite::{Registration, SqliteStore};
