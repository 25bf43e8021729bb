use std::sync::Arc;

use crate::core::hardware::DeviceProbe;
use crate::core::mount::MountBackend;

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LsblkProbe, SystemMountBackend};
pub use simulated::{SimulatedMountBackend, SimulatedProbe};

pub fn get_mount_backend(simulation: bool) -> Arc<dyn MountBackend> {
    #[cfg(target_os = "linux")]
    if !simulation {
        return Arc::new(SystemMountBackend);
    }

    let _ = simulation;
    Arc::new(SimulatedMountBackend::new())
}

pub fn get_device_probe(simulation: bool) -> Arc<dyn DeviceProbe> {
    #[cfg(target_os = "linux")]
    if !simulation {
        return Arc::new(LsblkProbe);
    }

    let _ = simulation;
    Arc::new(SimulatedProbe::default())
}
