//! gpuq-core: Core types and traits for the gpuq scheduler
//!
//! This crate provides the fundamental types used throughout gpuq:
//! - Tasks, the task state machine and dispatch order
//! - Server records
//! - Task file parsing
//! - GPU inventory and occupancy sampling
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod submission;
pub mod task;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use task::*;
