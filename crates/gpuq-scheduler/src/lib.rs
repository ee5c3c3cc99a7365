//! gpuq-scheduler: GPU-aware task scheduling for gpuq
//!
//! This crate provides:
//! - GPU allocation against live occupancy and the allocation table
//! - The scheduler loop that dispatches, retires and rolls back tasks
//! - The cooperative stop signal
//! - The server registry guarding a single running instance

pub mod gpu_manager;
pub mod registry;
pub mod scheduler;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use gpu_manager::GpuManager;
pub use registry::{ServerRegistry, StopOutcome};
pub use scheduler::{Dispatch, Recovery, Scheduler, SchedulerOptions};
pub use shutdown::StopSignal;
