//! GPU inventory and occupancy sampling

use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::{GpuqError, GpuqResult};
use crate::task::DeviceId;

/// Sampled load of a device, both as fractions in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Occupancy {
    /// Compute utilization fraction
    pub load: f64,
    /// Used memory over total memory
    pub memory: f64,
}

impl Occupancy {
    pub fn new(load: f64, memory: f64) -> Self {
        Self { load, memory }
    }

    /// A device is idle when neither fraction exceeds its threshold.
    /// Unreadable (NaN) samples never count as idle.
    pub fn is_idle(&self, max_load: f64, max_memory: f64) -> bool {
        !self.load.is_nan()
            && !self.memory.is_nan()
            && self.load <= max_load
            && self.memory <= max_memory
    }
}

/// Source of the host's GPU inventory and live occupancy
pub trait DeviceProber: Send + Sync {
    /// All devices on the host, ascending
    fn list_devices(&self) -> GpuqResult<Vec<DeviceId>>;

    /// Current occupancy of every device not in `exclude`.
    /// Devices that could not be sampled are left out.
    fn sample_occupancy(
        &self,
        exclude: &BTreeSet<DeviceId>,
    ) -> GpuqResult<BTreeMap<DeviceId, Occupancy>>;

    /// Prober name for logging
    fn name(&self) -> &'static str;
}

/// NVIDIA devices through NVML
pub struct NvmlProber {
    nvml: Nvml,
}

impl NvmlProber {
    /// Initialise NVML. Fails on hosts without the NVIDIA driver.
    pub fn new() -> GpuqResult<Self> {
        let nvml = Nvml::init().map_err(|e| GpuqError::Gpu(format!("NVML init failed: {}", e)))?;
        Ok(Self { nvml })
    }

    fn sample_device(&self, index: DeviceId) -> GpuqResult<Occupancy> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| GpuqError::Gpu(format!("device {}: {}", index, e)))?;
        let utilization = device
            .utilization_rates()
            .map_err(|e| GpuqError::Gpu(format!("device {} utilization: {}", index, e)))?;
        let memory = device
            .memory_info()
            .map_err(|e| GpuqError::Gpu(format!("device {} memory: {}", index, e)))?;

        let memory_fraction = if memory.total == 0 {
            f64::NAN
        } else {
            memory.used as f64 / memory.total as f64
        };

        Ok(Occupancy::new(
            utilization.gpu as f64 / 100.0,
            memory_fraction,
        ))
    }
}

impl DeviceProber for NvmlProber {
    fn list_devices(&self) -> GpuqResult<Vec<DeviceId>> {
        let count = self
            .nvml
            .device_count()
            .map_err(|e| GpuqError::Gpu(format!("device count: {}", e)))?;
        Ok((0..count).collect())
    }

    fn sample_occupancy(
        &self,
        exclude: &BTreeSet<DeviceId>,
    ) -> GpuqResult<BTreeMap<DeviceId, Occupancy>> {
        let mut samples = BTreeMap::new();
        for index in self.list_devices()? {
            if exclude.contains(&index) {
                continue;
            }
            match self.sample_device(index) {
                Ok(occupancy) => {
                    debug!(gpu = index, load = occupancy.load, memory = occupancy.memory, "Sampled GPU");
                    samples.insert(index, occupancy);
                }
                Err(e) => warn!(gpu = index, error = %e, "Failed to sample GPU"),
            }
        }
        Ok(samples)
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

/// Inventory for hosts where no GPU library is available
pub struct EmptyProber;

impl DeviceProber for EmptyProber {
    fn list_devices(&self) -> GpuqResult<Vec<DeviceId>> {
        Ok(Vec::new())
    }

    fn sample_occupancy(
        &self,
        _exclude: &BTreeSet<DeviceId>,
    ) -> GpuqResult<BTreeMap<DeviceId, Occupancy>> {
        Ok(BTreeMap::new())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Pick the best prober for this host
pub fn detect_prober() -> Box<dyn DeviceProber> {
    match NvmlProber::new() {
        Ok(prober) => Box::new(prober),
        Err(e) => {
            warn!(error = %e, "No GPU prober available, running with an empty inventory");
            Box::new(EmptyProber)
        }
    }
}
