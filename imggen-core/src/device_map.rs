use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s == "cpu" {
            return Ok(Self::ForceCpu);
        }
        if s == "gpu" || s == "cuda" || s == "metal" {
            return Ok(Self::Ordinal(0));
        }
        let ordinal = s
            .strip_prefix("gpu:")
            .or_else(|| s.strip_prefix("cuda:"))
            .or_else(|| s.strip_prefix("metal:"))
            .ok_or_else(|| anyhow!("unrecognised device `{s}`"))?;
        let ordinal = ordinal
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid device ordinal in `{s}`"))?;
        Ok(Self::Ordinal(ordinal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        assert_eq!(DeviceMap::ForceCpu.to_string(), "cpu");
        assert_eq!(DeviceMap::Ordinal(1).to_string(), "gpu:1");
        assert_eq!("cpu".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu);
        assert_eq!("CUDA:2".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(2));
        assert_eq!("gpu".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(0));
        assert!("tpu:0".parse::<DeviceMap>().is_err());
        assert!("gpu:x".parse::<DeviceMap>().is_err());
    }

    #[test]
    fn test_cpu_flag() {
        assert_eq!(DeviceMap::from_cpu_flag(true), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from_cpu_flag(false), DeviceMap::Ordinal(0));
    }
}
