//! Scheduler loop
//!
//! One control flow: sweep finished tasks, dispatch the head of the queue,
//! sleep, repeat. A dispatch claims, acquires devices for and launches one
//! task before the loop sweeps again.

use chrono::Utc;
use gpuq_core::{
    DeviceId, GpuqError, GpuqResult, SchedulerConfig, ServerRecord, TaskId, TaskPatch, TaskState,
};
use gpuq_runtime::Launcher;
use gpuq_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::gpu_manager::GpuManager;
use crate::shutdown::StopSignal;

/// Loop timings
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Poll interval while waiting for devices
    pub find_gpu_delay: Duration,
    /// Pause after each dispatch or failed iteration
    pub cycle_delay: Duration,
    /// Pause when nothing is queued
    pub idle_poll: Duration,
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            find_gpu_delay: config.find_gpu_delay(),
            cycle_delay: config.cycle_delay(),
            idle_poll: config.idle_poll(),
        }
    }
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was queued
    Idle,
    Launched {
        task_id: TaskId,
        pid: u32,
        gpus: Vec<DeviceId>,
    },
    /// A stop arrived while waiting for devices; the task stays PENDING
    Abandoned { task_id: TaskId },
}

/// What [`Scheduler::recover`] found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// PENDING tasks returned to the queue
    pub rolled_back: Vec<TaskId>,
    /// RUNNING tasks whose devices were re-bound to their live process
    pub adopted: Vec<TaskId>,
}

/// Moves tasks through QUEUING, PENDING, RUNNING and DONE
pub struct Scheduler {
    store: SqliteStore,
    gpus: GpuManager,
    launcher: Arc<dyn Launcher>,
    options: SchedulerOptions,
    stop: StopSignal,
}

impl Scheduler {
    pub fn new(
        store: SqliteStore,
        gpus: GpuManager,
        launcher: Arc<dyn Launcher>,
        options: SchedulerOptions,
        stop: StopSignal,
    ) -> Self {
        info!(
            launcher = launcher.name(),
            devices = ?gpus.devices(),
            find_gpu_delay = ?options.find_gpu_delay,
            cycle_delay = ?options.cycle_delay,
            "Scheduler initialized"
        );
        Self {
            store,
            gpus,
            launcher,
            options,
            stop,
        }
    }

    pub fn gpus(&self) -> &GpuManager {
        &self.gpus
    }

    /// Run until a stop is requested, then perform the shutdown sequence
    /// for `server`.
    pub async fn run(&self, server: &ServerRecord) -> GpuqResult<()> {
        info!(pid = server.pid, server_id = server.id, "Scheduler started");
        if let Err(e) = self.recover().await {
            error!(error = %e, "Recovery failed, scheduling anyway");
        }

        while !self.stop.is_stop_requested() {
            let delay = match self.run_once().await {
                Ok(Dispatch::Idle) => self.options.idle_poll,
                Ok(Dispatch::Launched { .. }) => self.options.cycle_delay,
                Ok(Dispatch::Abandoned { .. }) => continue,
                Err(e) => {
                    error!(error = %e, "Scheduling iteration failed");
                    self.options.cycle_delay
                }
            };
            self.stop.sleep(delay).await;
        }

        self.shutdown(server).await
    }

    /// Undo what a crashed predecessor left behind.
    ///
    /// PENDING tasks go back to the queue. RUNNING tasks whose process is
    /// still alive get their devices re-bound so they are not handed out twice.
    pub async fn recover(&self) -> GpuqResult<Recovery> {
        let mut recovery = Recovery {
            rolled_back: self.rollback_pending().await?,
            ..Recovery::default()
        };

        for task in self.store.find_by_state(TaskState::Running).await? {
            let Some(pid) = task.system_pid else {
                continue;
            };
            if task.occupied_gpus.is_empty() || !self.launcher.is_alive(pid) {
                continue;
            }
            match self
                .gpus
                .bind(&task.occupied_gpus, self.launcher.adopt(pid))
                .await
            {
                Ok(()) => {
                    info!(task_id = task.id, pid = pid, gpus = ?task.occupied_gpus, "Adopted running task");
                    recovery.adopted.push(task.id);
                }
                Err(e) => {
                    warn!(task_id = task.id, pid = pid, error = %e, "Failed to adopt running task");
                }
            }
        }

        Ok(recovery)
    }

    /// One iteration: completion sweep, then dispatch
    pub async fn run_once(&self) -> GpuqResult<Dispatch> {
        self.sweep_completed().await?;
        self.dispatch_next().await
    }

    /// Move every RUNNING task whose process is gone to DONE.
    ///
    /// Returns the ids retired by this call.
    pub async fn sweep_completed(&self) -> GpuqResult<Vec<TaskId>> {
        let mut done = Vec::new();

        for task in self.store.find_by_state(TaskState::Running).await? {
            let finished = match task.system_pid {
                Some(pid) => self.gpus.reclaim(pid).await || !self.launcher.is_alive(pid),
                None => {
                    warn!(task_id = task.id, "RUNNING task has no pid, retiring it");
                    true
                }
            };
            if !finished {
                continue;
            }

            if self
                .store
                .update_task(task.id, TaskState::Running, &TaskPatch::done())
                .await?
            {
                info!(task_id = task.id, pid = ?task.system_pid, "Task done");
                done.push(task.id);
            }
        }

        Ok(done)
    }

    /// Claim the head of the queue, wait for its devices and launch it
    pub async fn dispatch_next(&self) -> GpuqResult<Dispatch> {
        let Some(task) = self.store.claim_next().await? else {
            debug!("No queuing task");
            return Ok(Dispatch::Idle);
        };

        info!(
            task_id = task.id,
            priority = task.priority,
            num_gpus = task.num_gpus_required,
            command = %task.command_line(),
            "Task claimed"
        );

        let gpus = match self
            .gpus
            .acquire(
                task.num_gpus_required,
                &task.exclude_gpus,
                self.options.find_gpu_delay,
                &self.stop,
            )
            .await
        {
            Ok(gpus) => gpus,
            Err(GpuqError::Cancelled) => {
                info!(task_id = task.id, "Stop requested while waiting for GPUs");
                return Ok(Dispatch::Abandoned { task_id: task.id });
            }
            Err(e) => return Err(e),
        };

        if !self
            .store
            .update_task(task.id, TaskState::Pending, &TaskPatch::occupied_gpus(gpus.clone()))
            .await?
        {
            return Err(GpuqError::Internal(format!(
                "task {} left PENDING before its GPUs were recorded",
                task.id
            )));
        }

        let env = self.launcher.device_env(&gpus);
        let handle = match self.launcher.launch(&task.command, &env).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(task_id = task.id, gpus = ?gpus, error = %e, "Task launch failed, left PENDING");
                return Err(e);
            }
        };
        let pid = handle.pid();

        if let Err(e) = self.gpus.bind(&gpus, handle).await {
            error!(task_id = task.id, pid = pid, error = %e, "internal error: GPU bind conflict");
            return Err(e);
        }

        if !self
            .store
            .update_task(task.id, TaskState::Pending, &TaskPatch::running(pid, Utc::now()))
            .await?
        {
            return Err(GpuqError::Internal(format!(
                "task {} left PENDING before it was marked RUNNING",
                task.id
            )));
        }

        info!(task_id = task.id, pid = pid, gpus = ?gpus, "Task running");
        Ok(Dispatch::Launched {
            task_id: task.id,
            pid,
            gpus,
        })
    }

    /// Return every PENDING task to the queue
    pub async fn rollback_pending(&self) -> GpuqResult<Vec<TaskId>> {
        let ids = self.store.rollback_pending().await?;
        if !ids.is_empty() {
            warn!(tasks = ?ids, "Rolled back PENDING tasks to QUEUING");
        }
        Ok(ids)
    }

    /// Final sweep, rollback and stop timestamp. Running task processes are
    /// left alone and retired by the next instance.
    async fn shutdown(&self, server: &ServerRecord) -> GpuqResult<()> {
        info!(pid = server.pid, "Scheduler stopping");

        if let Err(e) = self.sweep_completed().await {
            warn!(error = %e, "Final completion sweep failed");
        }
        self.rollback_pending().await?;

        if !self.store.mark_server_stopped(server.id, Utc::now()).await? {
            error!(
                pid = server.pid,
                server_id = server.id,
                "internal error: no running server record to stop"
            );
        }

        info!(pid = server.pid, "Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, FakeProber};
    use gpuq_core::{NewTask, Occupancy};
    use gpuq_runtime::CUDA_VISIBLE_DEVICES;
    use gpuq_store::Registration;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: SqliteStore,
        prober: Arc<FakeProber>,
        launcher: Arc<FakeLauncher>,
        stop: StopSignal,
        scheduler: Arc<Scheduler>,
    }

    async fn fixture(devices: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&dir.path().join("gpuq.db")).await.unwrap();
        let prober = Arc::new(FakeProber::idle(devices));
        let launcher = Arc::new(FakeLauncher::new());
        let stop = StopSignal::new();

        let gpus = GpuManager::new(prober.clone(), 0.1, 0.1).unwrap();
        let options = SchedulerOptions {
            find_gpu_delay: Duration::from_millis(5),
            cycle_delay: Duration::from_millis(5),
            idle_poll: Duration::from_millis(5),
        };
        let scheduler = Scheduler::new(
            store.clone(),
            gpus,
            launcher.clone(),
            options,
            stop.clone(),
        );

        Fixture {
            _dir: dir,
            store,
            prober,
            launcher,
            stop,
            scheduler: Arc::new(scheduler),
        }
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn state_of(store: &SqliteStore, id: TaskId) -> TaskState {
        store.find_by_id(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_lower_priority_value_dispatches_first() {
        let f = fixture(2).await;
        let a = f
            .store
            .insert_task(&NewTask::new(cmd(&["echo", "A"]), 1).with_priority(100))
            .await
            .unwrap();
        let b = f
            .store
            .insert_task(&NewTask::new(cmd(&["echo", "B"]), 1).with_priority(50))
            .await
            .unwrap();

        let first = f.scheduler.dispatch_next().await.unwrap();
        assert!(matches!(first, Dispatch::Launched { task_id, .. } if task_id == b));
        let second = f.scheduler.dispatch_next().await.unwrap();
        assert!(matches!(second, Dispatch::Launched { task_id, .. } if task_id == a));

        let launched = f.launcher.launched();
        assert_eq!(launched[0].command, cmd(&["echo", "B"]));
        assert_eq!(launched[1].command, cmd(&["echo", "A"]));
        assert_eq!(f.scheduler.dispatch_next().await.unwrap(), Dispatch::Idle);
    }

    #[tokio::test]
    async fn test_dispatch_records_devices_and_pid() {
        let f = fixture(4).await;
        let id = f
            .store
            .insert_task(&NewTask::new(cmd(&["train"]), 2).with_exclude_gpus([0]))
            .await
            .unwrap();

        let Dispatch::Launched { pid, gpus, .. } = f.scheduler.dispatch_next().await.unwrap() else {
            panic!("expected a launch");
        };
        assert_eq!(gpus, vec![1, 2]);

        let task = f.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.system_pid, Some(pid));
        assert_eq!(task.occupied_gpus, vec![1, 2]);
        assert!(task.execute_time.is_some());

        let env = &f.launcher.launched()[0].env;
        assert_eq!(env.get(CUDA_VISIBLE_DEVICES).map(String::as_str), Some("1,2"));
    }

    #[tokio::test]
    async fn test_running_tasks_never_share_devices() {
        let f = fixture(4).await;
        for _ in 0..2 {
            f.store
                .insert_task(&NewTask::new(cmd(&["sleep", "100"]), 2))
                .await
                .unwrap();
        }
        f.scheduler.dispatch_next().await.unwrap();
        f.scheduler.dispatch_next().await.unwrap();

        let running = f.store.find_by_state(TaskState::Running).await.unwrap();
        assert_eq!(running.len(), 2);
        let a: BTreeSet<_> = running[0].occupied_gpus.iter().collect();
        let b: BTreeSet<_> = running[1].occupied_gpus.iter().collect();
        assert!(a.is_disjoint(&b));
    }

    #[tokio::test]
    async fn test_busy_device_is_skipped() {
        let f = fixture(2).await;
        f.prober.set(0, Occupancy::new(0.95, 0.5));
        f.store
            .insert_task(&NewTask::new(cmd(&["job"]), 1))
            .await
            .unwrap();

        let Dispatch::Launched { gpus, .. } = f.scheduler.dispatch_next().await.unwrap() else {
            panic!("expected a launch");
        };
        assert_eq!(gpus, vec![1]);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let f = fixture(2).await;
        let a = f.store.insert_task(&NewTask::new(cmd(&["a"]), 1)).await.unwrap();
        let b = f.store.insert_task(&NewTask::new(cmd(&["b"]), 1)).await.unwrap();
        let Dispatch::Launched { pid: pid_a, .. } = f.scheduler.dispatch_next().await.unwrap() else {
            panic!("expected a launch");
        };
        f.scheduler.dispatch_next().await.unwrap();

        assert!(f.scheduler.sweep_completed().await.unwrap().is_empty());

        f.launcher.processes.exit(pid_a);
        assert_eq!(f.scheduler.sweep_completed().await.unwrap(), vec![a]);
        assert!(f.scheduler.sweep_completed().await.unwrap().is_empty());

        let done = f.store.find_by_id(a).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Done);
        assert!(done.occupied_gpus.is_empty());
        assert_eq!(done.system_pid, Some(pid_a));
        assert_eq!(state_of(&f.store, b).await, TaskState::Running);
        assert!(!f.scheduler.gpus().allocations().await.values().any(|p| *p == pid_a));
    }

    #[tokio::test]
    async fn test_recover_rolls_back_pending() {
        let f = fixture(1).await;
        let id = f.store.insert_task(&NewTask::new(cmd(&["job"]), 1)).await.unwrap();

        // A crashed predecessor claimed the task and recorded its devices
        f.store.claim_next().await.unwrap().unwrap();
        f.store
            .update_task(id, TaskState::Pending, &TaskPatch::occupied_gpus(vec![0]))
            .await
            .unwrap();

        let recovery = f.scheduler.recover().await.unwrap();
        assert_eq!(recovery.rolled_back, vec![id]);

        let task = f.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Queuing);
        assert!(task.occupied_gpus.is_empty());

        assert!(matches!(
            f.scheduler.dispatch_next().await.unwrap(),
            Dispatch::Launched { task_id, .. } if task_id == id
        ));
    }

    #[tokio::test]
    async fn test_recover_adopts_running_tasks() {
        let f = fixture(2).await;
        let id = f.store.insert_task(&NewTask::new(cmd(&["job"]), 1)).await.unwrap();
        f.store.claim_next().await.unwrap().unwrap();
        f.store
            .update_task(id, TaskState::Pending, &TaskPatch::occupied_gpus(vec![1]))
            .await
            .unwrap();
        f.store
            .update_task(id, TaskState::Pending, &TaskPatch::running(555, Utc::now()))
            .await
            .unwrap();
        f.launcher.processes.spawn(555);

        let recovery = f.scheduler.recover().await.unwrap();
        assert_eq!(recovery.adopted, vec![id]);
        assert_eq!(f.scheduler.gpus().allocations().await.get(&1), Some(&555));
        assert_eq!(
            f.scheduler.gpus().available_devices(&BTreeSet::new()).await.unwrap(),
            vec![0]
        );

        f.launcher.processes.exit(555);
        assert_eq!(f.scheduler.sweep_completed().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_stop_during_acquire_abandons_dispatch() {
        let f = fixture(1).await;
        let id = f.store.insert_task(&NewTask::new(cmd(&["big"]), 2)).await.unwrap();

        let dispatcher = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.dispatch_next().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state_of(&f.store, id).await, TaskState::Pending);

        f.stop.request_stop();
        let dispatch = tokio::time::timeout(Duration::from_secs(5), dispatcher)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(dispatch, Dispatch::Abandoned { task_id: id });
        assert!(f.launcher.launched().is_empty());

        assert_eq!(f.scheduler.rollback_pending().await.unwrap(), vec![id]);
        assert_eq!(state_of(&f.store, id).await, TaskState::Queuing);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_task_pending() {
        let f = fixture(1).await;
        let id = f
            .store
            .insert_task(&NewTask::new(cmd(&["missing-binary"]), 1))
            .await
            .unwrap();
        f.launcher.fail_launches(true);

        let err = f.scheduler.dispatch_next().await.unwrap_err();
        assert!(matches!(err, GpuqError::Launch(_)));

        let task = f.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.occupied_gpus, vec![0]);
        assert!(task.system_pid.is_none());

        // The next iteration does not retry it
        f.launcher.fail_launches(false);
        assert_eq!(f.scheduler.run_once().await.unwrap(), Dispatch::Idle);
    }

    #[tokio::test]
    async fn test_deleting_running_task_is_rejected() {
        let f = fixture(1).await;
        let id = f.store.insert_task(&NewTask::new(cmd(&["job"]), 1)).await.unwrap();
        f.scheduler.dispatch_next().await.unwrap();

        let err: GpuqError = f.store.delete_task(id).await.unwrap_err().into();
        assert!(matches!(
            err,
            GpuqError::InvalidState { state: TaskState::Running, .. }
        ));
        assert_eq!(state_of(&f.store, id).await, TaskState::Running);
    }

    #[tokio::test]
    async fn test_run_until_stopped() {
        let f = fixture(2).await;
        let Registration::Started { record, .. } = f
            .store
            .register_server(std::process::id(), |_| false)
            .await
            .unwrap()
        else {
            panic!("expected a fresh registration");
        };

        let runner = {
            let scheduler = f.scheduler.clone();
            let record = record.clone();
            tokio::spawn(async move { scheduler.run(&record).await })
        };

        let id = f.store.insert_task(&NewTask::new(cmd(&["job"]), 1)).await.unwrap();
        let blocked = f.store.insert_task(&NewTask::new(cmd(&["big"]), 3)).await.unwrap();

        let mut launched = false;
        for _ in 0..200 {
            if state_of(&f.store, id).await == TaskState::Running {
                launched = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(launched);

        f.stop.request_stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Running processes survive; waiting tasks return to the queue
        assert_eq!(state_of(&f.store, id).await, TaskState::Running);
        assert_eq!(state_of(&f.store, blocked).await, TaskState::Queuing);
        let server = f.store.last_server().await.unwrap().unwrap();
        assert!(server.is_stopped());
    }

    async fn register(store: &SqliteStore) -> ServerRecord {
        let Registration::Started { record, .. } = store
            .register_server(std::process::id(), |_| false)
            .await
            .unwrap()
        else {
            panic!("expected a fresh registration");
        };
        record
    }

    #[tokio::test]
    async fn test_shutdown_retires_tasks_that_exit_while_stopping() {
        let f = fixture(2).await;
        let id = f.store.insert_task(&NewTask::new(cmd(&["job"]), 1)).await.unwrap();
        let Dispatch::Launched { pid, .. } = f.scheduler.dispatch_next().await.unwrap() else {
            panic!("expected a launch");
        };
        // Never satisfiable, parks the loop in acquire
        let blocked = f.store.insert_task(&NewTask::new(cmd(&["big"]), 3)).await.unwrap();

        let record = register(&f.store).await;
        let runner = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.run(&record).await })
        };

        // Once the blocked task is claimed the loop has swept for the last time
        let mut parked = false;
        for _ in 0..200 {
            if state_of(&f.store, blocked).await == TaskState::Pending {
                parked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(parked);
        assert_eq!(state_of(&f.store, id).await, TaskState::Running);

        f.launcher.processes.exit(pid);
        f.stop.request_stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let task = f.store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Done);
        assert!(task.occupied_gpus.is_empty());
        assert!(f.scheduler.gpus().allocations().await.is_empty());
        assert_eq!(state_of(&f.store, blocked).await, TaskState::Queuing);
        assert!(f.store.last_server().await.unwrap().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_failed_recovery_still_records_stop() {
        let f = fixture(1).await;

        // A RUNNING row that can not be decoded makes every sweep fail
        let pool = sqlx::SqlitePool::connect_with(
            sqlx::sqlite::SqliteConnectOptions::new().filename(f._dir.path().join("gpuq.db")),
        )
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO tasks (state, submit_time, occupied_gpus, command) \
             VALUES ('running', ?1, 'not json', '[\"job\"]')",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
        assert!(f.scheduler.recover().await.is_err());

        let record = register(&f.store).await;
        let runner = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.run(&record).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        f.stop.request_stop();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(f.store.last_server().await.unwrap().unwrap().is_stopped());
    }
}
