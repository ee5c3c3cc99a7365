//! In-memory fakes for scheduler tests

use async_trait::async_trait;
use gpuq_core::{DeviceId, DeviceProber, GpuqError, GpuqResult, Occupancy};
use gpuq_runtime::{Launcher, Liveness, ProcessHandle, Signal};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Prober with settable occupancy
pub struct FakeProber {
    samples: Mutex<BTreeMap<DeviceId, Occupancy>>,
}

impl FakeProber {
    /// `count` devices, all idle
    pub fn idle(count: u32) -> Self {
        let samples = (0..count).map(|id| (id, Occupancy::new(0.0, 0.0))).collect();
        Self {
            samples: Mutex::new(samples),
        }
    }

    pub fn set(&self, id: DeviceId, occupancy: Occupancy) {
        self.samples.lock().unwrap().insert(id, occupancy);
    }
}

impl DeviceProber for FakeProber {
    fn list_devices(&self) -> GpuqResult<Vec<DeviceId>> {
        Ok(self.samples.lock().unwrap().keys().copied().collect())
    }

    fn sample_occupancy(
        &self,
        exclude: &BTreeSet<DeviceId>,
    ) -> GpuqResult<BTreeMap<DeviceId, Occupancy>> {
        Ok(self
            .samples
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| !exclude.contains(id))
            .map(|(id, o)| (*id, *o))
            .collect())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Set of pids considered alive, shared between a launcher and its handles
#[derive(Debug, Default, Clone)]
pub struct ProcessTable {
    alive: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessTable {
    pub fn spawn(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn exit(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }
}

/// Handle whose liveness is a [`ProcessTable`] entry
#[derive(Debug)]
pub struct FakeHandle {
    pid: u32,
    table: ProcessTable,
}

impl FakeHandle {
    /// A standalone live process
    pub fn new(pid: u32) -> Arc<Self> {
        let table = ProcessTable::default();
        table.spawn(pid);
        Arc::new(Self { pid, table })
    }

    pub fn exit(&self) {
        self.table.exit(self.pid);
    }
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        !self.table.is_alive(self.pid)
    }
}

/// A launch recorded by [`FakeLauncher`]
#[derive(Debug, Clone)]
pub struct Launched {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Launcher that hands out pids without starting anything
pub struct FakeLauncher {
    pub processes: ProcessTable,
    next_pid: AtomicU32,
    launched: Mutex<Vec<Launched>>,
    signals: Mutex<Vec<(u32, Signal)>>,
    fail_launch: AtomicBool,
    /// Terminate signals make the target exit
    exit_on_terminate: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            processes: ProcessTable::default(),
            next_pid: AtomicU32::new(1000),
            launched: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            fail_launch: AtomicBool::new(false),
            exit_on_terminate: AtomicBool::new(true),
        }
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launch.store(fail, Ordering::SeqCst);
    }

    pub fn ignore_terminate(&self) {
        self.exit_on_terminate.store(false, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<Launched> {
        self.launched.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<(u32, Signal)> {
        self.signals.lock().unwrap().clone()
    }
}

impl Liveness for FakeLauncher {
    fn is_alive(&self, pid: u32) -> bool {
        self.processes.is_alive(pid)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        command: &[String],
        env: &HashMap<String, String>,
    ) -> GpuqResult<Arc<dyn ProcessHandle>> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(GpuqError::Launch(format!("`{}` not found", command.join(" "))));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.spawn(pid);
        self.launched.lock().unwrap().push(Launched {
            command: command.to_vec(),
            env: env.clone(),
        });
        Ok(Arc::new(FakeHandle {
            pid,
            table: self.processes.clone(),
        }))
    }

    fn adopt(&self, pid: u32) -> Arc<dyn ProcessHandle> {
        Arc::new(FakeHandle {
            pid,
            table: self.processes.clone(),
        })
    }

    fn signal(&self, pid: u32, signal: Signal) -> GpuqResult<()> {
        self.signals.lock().unwrap().push((pid, signal));
        if signal != Signal::Interrupt && self.exit_on_terminate.load(Ordering::SeqCst) {
            self.processes.exit(pid);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
