//! Task, task state machine and server record definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::{GpuqError, GpuqResult};

/// Task identity, assigned by the store and never reused
pub type TaskId = i64;

/// GPU device index as reported by the driver
pub type DeviceId = u32;

/// Priority given to submissions that do not ask for one
pub const DEFAULT_PRIORITY: u32 = 100;

/// Lifecycle state of a task
///
/// ```text
/// QUEUING -> PENDING -> RUNNING -> DONE
///    ^          |
///    +----------+  (rollback on shutdown or crash recovery)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting in the queue, eligible for dispatch
    Queuing,
    /// Selected for dispatch, acquiring devices
    Pending,
    /// Process launched
    Running,
    /// Process exited
    Done,
}

impl TaskState {
    /// Listing order used by the CLI
    pub const DISPLAY_ORDER: [TaskState; 4] = [
        TaskState::Running,
        TaskState::Pending,
        TaskState::Queuing,
        TaskState::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queuing => "queuing",
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
        }
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Queuing, TaskState::Pending)
                | (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Queuing)
                | (TaskState::Running, TaskState::Done)
        )
    }

    /// Users may only change priority of, or delete, tasks in this state
    pub fn is_editable(self) -> bool {
        self == TaskState::Queuing
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = GpuqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queuing" => Ok(TaskState::Queuing),
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "done" => Ok(TaskState::Done),
            other => Err(GpuqError::Validation(format!("Unknown state: {}", other))),
        }
    }
}

/// A unit of work persisted in the task store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    /// Lower value runs first
    pub priority: u32,
    pub submit_time: DateTime<Utc>,
    /// Set on transition to RUNNING
    pub execute_time: Option<DateTime<Utc>>,
    /// Pid of the launched process
    pub system_pid: Option<u32>,
    /// Devices assigned to the task, ascending
    pub occupied_gpus: Vec<DeviceId>,
    /// Devices this task must never run on
    pub exclude_gpus: BTreeSet<DeviceId>,
    pub num_gpus_required: u32,
    pub command: Vec<String>,
}

impl Task {
    /// Command line joined for display and logging
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// A submission that has not been stored yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub command: Vec<String>,
    pub num_gpus_required: u32,
    pub exclude_gpus: BTreeSet<DeviceId>,
    pub priority: u32,
}

impl NewTask {
    /// Create a submission with the default priority and no exclusions
    pub fn new(command: Vec<String>, num_gpus_required: u32) -> Self {
        Self {
            command,
            num_gpus_required,
            exclude_gpus: BTreeSet::new(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_exclude_gpus(mut self, exclude_gpus: impl IntoIterator<Item = DeviceId>) -> Self {
        self.exclude_gpus = exclude_gpus.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> GpuqResult<()> {
        if self.command.is_empty() || self.command.iter().all(|arg| arg.trim().is_empty()) {
            return Err(GpuqError::Validation("command must not be empty".to_string()));
        }
        if self.num_gpus_required == 0 {
            return Err(GpuqError::Validation(
                "number of GPUs must be a positive integer".to_string(),
            ));
        }
        validate_priority(self.priority)
    }
}

/// Priorities are positive integers
pub fn validate_priority(priority: u32) -> GpuqResult<()> {
    if priority == 0 {
        return Err(GpuqError::Validation(format!(
            "priority requires positive int, but got {}",
            priority
        )));
    }
    Ok(())
}

/// Parse a user-supplied priority value
pub fn parse_priority(raw: &str) -> GpuqResult<u32> {
    let value: i64 = raw.trim().parse().map_err(|_| {
        GpuqError::Validation(format!(
            "priority value of {} is not allowed, requires int",
            raw
        ))
    })?;
    if value <= 0 || value > u32::MAX as i64 {
        return Err(GpuqError::Validation(format!(
            "priority requires positive int, but got {}",
            value
        )));
    }
    Ok(value as u32)
}

/// Partial update applied to a task row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub priority: Option<u32>,
    pub execute_time: Option<DateTime<Utc>>,
    pub system_pid: Option<u32>,
    pub occupied_gpus: Option<Vec<DeviceId>>,
}

impl TaskPatch {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn occupied_gpus(devices: Vec<DeviceId>) -> Self {
        Self {
            occupied_gpus: Some(devices),
            ..Self::default()
        }
    }

    /// Retire a finished task and release its devices in the same write
    pub fn done() -> Self {
        Self {
            state: Some(TaskState::Done),
            occupied_gpus: Some(Vec::new()),
            ..Self::default()
        }
    }

    /// Checkpoint written once the process is launched
    pub fn running(pid: u32, at: DateTime<Utc>) -> Self {
        Self {
            state: Some(TaskState::Running),
            execute_time: Some(at),
            system_pid: Some(pid),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One row per scheduler process instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: i64,
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    /// Unset while the instance is (believed to be) running
    pub stop_time: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn is_stopped(&self) -> bool {
        self.stop_time.is_some()
    }
}
