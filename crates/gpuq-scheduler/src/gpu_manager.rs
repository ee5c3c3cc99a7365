//! GPU resource manager
//!
//! Availability is the intersection of live occupancy sampling and the
//! allocation table. Other processes on the host may use devices outside
//! this scheduler, so the table alone is never trusted.

use gpuq_core::{DeviceId, DeviceProber, GpuqError, GpuqResult};
use gpuq_runtime::ProcessHandle;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::shutdown::StopSignal;

/// Tracks which process owns which device
pub struct GpuManager {
    prober: Arc<dyn DeviceProber>,
    /// Host inventory, ascending
    devices: Vec<DeviceId>,
    owners: Mutex<BTreeMap<DeviceId, Arc<dyn ProcessHandle>>>,
    max_load: f64,
    max_memory: f64,
}

impl GpuManager {
    /// Create a manager over the prober's current inventory
    pub fn new(prober: Arc<dyn DeviceProber>, max_load: f64, max_memory: f64) -> GpuqResult<Self> {
        let mut devices = prober.list_devices()?;
        devices.sort_unstable();
        devices.dedup();

        info!(
            prober = prober.name(),
            devices = ?devices,
            max_load = max_load,
            max_memory = max_memory,
            "GPU manager initialized"
        );

        Ok(Self {
            prober,
            devices,
            owners: Mutex::new(BTreeMap::new()),
            max_load,
            max_memory,
        })
    }

    /// All devices on the host
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Devices that are idle, not excluded and not owned by a live process
    pub async fn available_devices(
        &self,
        excluded: &BTreeSet<DeviceId>,
    ) -> GpuqResult<Vec<DeviceId>> {
        let samples = self.prober.sample_occupancy(excluded)?;
        let owners = self.owners.lock().await;

        let available = self
            .devices
            .iter()
            .copied()
            .filter(|id| !excluded.contains(id))
            .filter(|id| {
                samples
                    .get(id)
                    .is_some_and(|o| o.is_idle(self.max_load, self.max_memory))
            })
            .filter(|id| owners.get(id).map_or(true, |owner| owner.has_exited()))
            .collect();

        Ok(available)
    }

    /// Wait until `count` devices are available and return the lowest `count` ids.
    ///
    /// There is no timeout. The stop signal is checked on every attempt and
    /// a stop abandons the wait with [`GpuqError::Cancelled`].
    pub async fn acquire(
        &self,
        count: u32,
        excluded: &BTreeSet<DeviceId>,
        poll: Duration,
        stop: &StopSignal,
    ) -> GpuqResult<Vec<DeviceId>> {
        let count = count as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let eligible = self.devices.iter().filter(|id| !excluded.contains(id)).count();
        if eligible < count {
            warn!(
                requested = count,
                eligible = eligible,
                excluded = ?excluded,
                "Request exceeds the devices this host can ever offer"
            );
        }

        let mut attempts: u64 = 0;
        loop {
            if stop.is_stop_requested() {
                return Err(GpuqError::Cancelled);
            }

            match self.available_devices(excluded).await {
                Ok(mut available) if available.len() >= count => {
                    available.truncate(count);
                    info!(gpus = ?available, attempts = attempts + 1, "GPUs acquired");
                    return Ok(available);
                }
                Ok(available) => {
                    if attempts == 0 {
                        info!(
                            requested = count,
                            available = ?available,
                            retry_in = ?poll,
                            "Not enough idle GPUs, waiting"
                        );
                    } else {
                        debug!(
                            requested = count,
                            available = ?available,
                            attempts = attempts + 1,
                            "Still waiting for GPUs"
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to sample GPU occupancy, retrying");
                }
            }

            attempts += 1;
            if !stop.sleep(poll).await {
                return Err(GpuqError::Cancelled);
            }
        }
    }

    /// Record `owner` as the holder of `devices`.
    ///
    /// Entries of exited processes are cleared first. A device still held by
    /// another live process is a conflict and nothing is recorded.
    pub async fn bind(&self, devices: &[DeviceId], owner: Arc<dyn ProcessHandle>) -> GpuqResult<()> {
        let mut owners = self.owners.lock().await;
        sweep_exited(&mut owners);

        for id in devices {
            if !self.devices.contains(id) {
                return Err(GpuqError::Gpu(format!("device {} is not present on this host", id)));
            }
            if let Some(current) = owners.get(id) {
                if current.pid() != owner.pid() {
                    return Err(GpuqError::DeviceConflict {
                        device: *id,
                        pid: current.pid(),
                    });
                }
            }
        }

        for id in devices {
            owners.insert(*id, Arc::clone(&owner));
        }
        debug!(gpus = ?devices, pid = owner.pid(), "GPUs bound");
        Ok(())
    }

    /// Clear every entry whose owner has exited.
    ///
    /// Returns `true` if `pid` held at least one device that is now free,
    /// `false` if it is still running or held nothing.
    pub async fn reclaim(&self, pid: u32) -> bool {
        let mut owners = self.owners.lock().await;
        let freed = sweep_exited(&mut owners);
        let reclaimed = freed.iter().any(|(_, owner)| *owner == pid);
        if reclaimed {
            let gpus: Vec<DeviceId> = freed
                .iter()
                .filter(|(_, owner)| *owner == pid)
                .map(|(id, _)| *id)
                .collect();
            debug!(pid = pid, gpus = ?gpus, "GPUs reclaimed");
        }
        reclaimed
    }

    /// Snapshot of the allocation table as device -> owning pid
    pub async fn allocations(&self) -> BTreeMap<DeviceId, u32> {
        self.owners
            .lock()
            .await
            .iter()
            .map(|(id, owner)| (*id, owner.pid()))
            .collect()
    }
}

/// Remove entries of exited owners, returning `(device, pid)` for each
fn sweep_exited(owners: &mut BTreeMap<DeviceId, Arc<dyn ProcessHandle>>) -> Vec<(DeviceId, u32)> {
    let mut freed = Vec::new();
    owners.retain(|id, owner| {
        if owner.has_exited() {
            freed.push((*id, owner.pid()));
            false
        } else {
            true
        }
    });
    freed
}
