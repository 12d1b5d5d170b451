use std::time::Duration;

use candle_core::utils::{cuda_is_available, metal_is_available};
use serde::{Deserialize, Serialize};

use crate::DeviceMap;

/// Host and build details reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub device: String,
    pub version: String,
}

impl SystemInfo {
    pub fn collect(device_map: DeviceMap) -> Self {
        let cuda_available = cuda_is_available();
        let metal_available = metal_is_available();
        let device = match device_map {
            DeviceMap::Ordinal(_) if !cuda_available && !metal_available => DeviceMap::ForceCpu,
            other => other,
        };
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
            cuda_available,
            metal_available,
            device: device.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Formats as `1h 2m 3s`, dropping leading zero units.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
