//! gpuq-runtime: Process runtime for gpuq tasks
//!
//! This crate provides:
//! - The launcher that starts task commands with restricted device visibility
//! - Process handles used to track device ownership
//! - The pid liveness check shared by completion detection and the server registry

pub mod process;
pub mod traits;

pub use process::{
    pid_is_alive, visible_devices_value, ProcessLauncher, ProcessLauncherConfig,
    CUDA_VISIBLE_DEVICES,
};
pub use traits::{Launcher, Liveness, ProcessHandle, Signal};
