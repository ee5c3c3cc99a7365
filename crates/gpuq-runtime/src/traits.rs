//! Runtime trait definitions

use async_trait::async_trait;
use gpuq_core::{DeviceId, GpuqResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Signals the scheduler sends to processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

/// Existence check for an arbitrary pid
pub trait Liveness: Send + Sync {
    /// `false` means the process exited or never existed
    fn is_alive(&self, pid: u32) -> bool;
}

/// A process that may own devices
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    fn pid(&self) -> u32;

    /// Poll for exit without blocking. Children are reaped by this call.
    fn has_exited(&self) -> bool;
}

/// Starts task processes and signals them
#[async_trait]
pub trait Launcher: Liveness {
    /// Spawn `command` in the background with `env` added to the inherited environment
    async fn launch(
        &self,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> GpuqResult<Arc<dyn ProcessHandle>>;

    /// Handle for a process started by someone else, e.g. a previous scheduler
    fn adopt(&self, pid: u32) -> Arc<dyn ProcessHandle>;

    /// Deliver `signal` to `pid`
    fn signal(&self, pid: u32, signal: Signal) -> GpuqResult<()>;

    /// Environment overrides exposing exactly `devices` to a task
    fn device_env(&self, devices: &[DeviceId]) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            crate::process::CUDA_VISIBLE_DEVICES.to_string(),
            crate::process::visible_devices_value(devices),
        );
        env
    }

    /// Get the launcher name
    fn name(&self) -> &'static str;
}
