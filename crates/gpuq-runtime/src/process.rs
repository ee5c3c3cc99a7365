//! Process-based launcher implementation
//!
//! Tasks run as direct child processes of the scheduler. Device visibility
//! is restricted through an environment variable, `CUDA_VISIBLE_DEVICES` by
//! default.

use async_trait::async_trait;
use gpuq_core::{DeviceId, GpuqError, GpuqResult};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::traits::{Launcher, Liveness, ProcessHandle, Signal};

/// Environment variable restricting device visibility for NVIDIA runtimes
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Process launcher configuration
#[derive(Debug, Clone)]
pub struct ProcessLauncherConfig {
    /// Variable that receives the comma-separated device list
    pub visible_devices_var: String,
}

impl Default for ProcessLauncherConfig {
    fn default() -> Self {
        Self {
            visible_devices_var: CUDA_VISIBLE_DEVICES.to_string(),
        }
    }
}

/// Launches task commands as background OS processes
pub struct ProcessLauncher {
    config: ProcessLauncherConfig,
}

impl ProcessLauncher {
    /// Create a new process launcher
    pub fn new(config: ProcessLauncherConfig) -> Self {
        Self { config }
    }

    /// Build the command for a task
    fn build_command(&self, command: &[String], env: &HashMap<String, String>) -> GpuqResult<Command> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GpuqError::Launch("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(env);

        // Tasks outlive the scheduler; output goes wherever the daemon's goes
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        Ok(cmd)
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(ProcessLauncherConfig::default())
    }
}

impl Liveness for ProcessLauncher {
    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> GpuqResult<Arc<dyn ProcessHandle>> {
        let mut cmd = self.build_command(command, env)?;

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().ok_or_else(|| {
                    GpuqError::Launch(format!("`{}` exited before its pid was read", command.join(" ")))
                })?;

                info!(pid = pid, command = %command.join(" "), env = ?env, "Task process spawned");

                Ok(Arc::new(ChildProcess {
                    pid,
                    child: Mutex::new(child),
                }))
            }
            Err(e) => {
                error!(command = %command.join(" "), error = %e, "Failed to spawn task process");
                Err(GpuqError::Launch(format!(
                    "Failed to spawn `{}`: {}",
                    command.join(" "),
                    e
                )))
            }
        }
    }

    fn adopt(&self, pid: u32) -> Arc<dyn ProcessHandle> {
        Arc::new(DetachedProcess { pid })
    }

    fn signal(&self, pid: u32, signal: Signal) -> GpuqResult<()> {
        send_signal(pid, signal)
    }

    fn device_env(&self, devices: &[DeviceId]) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            self.config.visible_devices_var.clone(),
            visible_devices_value(devices),
        );
        env
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// A process spawned by this scheduler instance
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = self.pid, status = %status, "Task process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to poll task process");
                !pid_is_alive(self.pid)
            }
        }
    }
}

/// A process this instance did not spawn, tracked only by pid
#[derive(Debug)]
pub struct DetachedProcess {
    pid: u32,
}

impl ProcessHandle for DetachedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        !pid_is_alive(self.pid)
    }
}

/// Comma-separated device list, e.g. `0,2,3`
pub fn visible_devices_value(devices: &[DeviceId]) -> String {
    devices
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Check whether `pid` exists
pub fn pid_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 only performs the existence and permission checks
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to another user
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(windows)]
    {
        use std::process::Command as StdCommand;
        let output = StdCommand::new("tasklist")
            .arg("/FI")
            .arg(format!("PID eq {}", pid))
            .output();

        match output {
            Ok(o) => {
                let stdout = String::from_utf8_lossy(&o.stdout);
                stdout.contains(&pid.to_string())
            }
            Err(_) => false,
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> GpuqResult<()> {
    #[cfg(unix)]
    {
        let raw_pid = libc::pid_t::try_from(pid)
            .map_err(|_| GpuqError::Internal(format!("pid {} out of range", pid)))?;
        let signum = match signal {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: plain kill(2) on a caller-supplied pid
        let rc = unsafe { libc::kill(raw_pid, signum) };
        if rc != 0 {
            return Err(GpuqError::Io(std::io::Error::last_os_error()));
        }
        debug!(pid = pid, signal = ?signal, "Signal sent");
        Ok(())
    }

    #[cfg(windows)]
    {
        use std::process::Command as StdCommand;
        let mut cmd = StdCommand::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        if signal == Signal::Kill {
            cmd.arg("/F");
        }
        let output = cmd.output()?;
        if !output.status.success() {
            return Err(GpuqError::Internal(format!(
                "taskkill failed for pid {}",
                pid
            )));
        }
        Ok(())
    }
}
