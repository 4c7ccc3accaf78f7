//! YAML configuration.
//!
//! ```yaml
//! cloud:
//!   base_url: https://monitor.example.com
//!   username: installer
//!   password: secret
//!   timeout: 15s
//!   retry:
//!     max_retries: 3
//!     base_delay: 1s
//! local:
//!   address: 192.168.1.50:8000
//!   timeout: 2s
//! cache:
//!   runtime: 20s
//!   parameters: 1h
//! devices:
//!   - serial: "MID0000001"
//!     family: mid-controller
//!   - serial: "1234567890"
//!     family: pv-series
//!     unit_id: 2
//!     parent: "MID0000001"
//! ```

use crate::{
    cache::CacheTtl,
    device::DeviceArena,
    error::{Error, Result},
    register_map::DeviceFamily,
    retry::RetryPolicy,
};
use serde::Deserialize;
use std::{collections::HashSet, fs::File, net::SocketAddr, path::Path, time::Duration};

pub const DEFAULT_CONFIG_FILE: &str = "invctl.yml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Timeout of one HTTP request.
    #[serde(default = "default_cloud_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_cloud_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    pub address: SocketAddr,
    /// Timeout of one Modbus transaction.
    #[serde(default = "default_local_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra attempts after a read timed out. Writes are never repeated.
    #[serde(default = "default_timeout_retries")]
    pub timeout_retries: u32,
}

fn default_local_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_timeout_retries() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub serial: String,
    pub family: DeviceFamily,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Serial of the controller this device sits behind.
    #[serde(default)]
    pub parent: Option<String>,
}

fn default_unit_id() -> u8 {
    0x01
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub local: Option<LocalConfig>,
    #[serde(default)]
    pub cache: CacheTtl,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_reader(file)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that a transport is configured, serials are unique and every
    /// parent is listed.
    pub fn validate(&self) -> Result<()> {
        if self.cloud.is_none() && self.local.is_none() {
            return Err(Error::Config(
                "neither a cloud nor a local transport is configured".into(),
            ));
        }
        let mut serials = HashSet::new();
        for device in &self.devices {
            if !serials.insert(device.serial.as_str()) {
                return Err(Error::Config(format!(
                    "device {} listed twice",
                    device.serial
                )));
            }
        }
        for device in &self.devices {
            if let Some(parent) = &device.parent {
                if !serials.contains(parent.as_str()) {
                    return Err(Error::Config(format!(
                        "device {} refers to unknown parent {parent}",
                        device.serial
                    )));
                }
            }
        }
        Ok(())
    }

    /// Registers every configured device and links children to parents.
    pub fn device_arena(&self) -> Result<DeviceArena> {
        let mut arena = DeviceArena::new();
        for device in &self.devices {
            arena.insert(&device.serial, device.unit_id, device.family)?;
        }
        for device in &self.devices {
            if let Some(parent) = &device.parent {
                let parent = arena.id_of(parent)?;
                let child = arena.id_of(&device.serial)?;
                arena.attach(parent, child)?;
            }
        }
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use assert_matches::assert_matches;

    const FULL: &str = r#"
cloud:
  base_url: https://monitor.example.com
  username: installer
  password: secret
  retry:
    max_retries: 5
    base_delay: 500ms
local:
  address: 192.168.1.50:8000
  timeout: 3s
cache:
  runtime: 10s
  battery: 0s
devices:
  - serial: "MID0000001"
    family: mid-controller
  - serial: "1234567890"
    family: pv-series
    unit_id: 2
    parent: "MID0000001"
"#;

    #[test]
    fn full_document() {
        let config = Config::from_yaml_str(FULL).unwrap();

        let cloud = config.cloud.as_ref().unwrap();
        assert_eq!(cloud.timeout, Duration::from_secs(15));
        assert_eq!(cloud.retry.max_retries, 5);
        assert_eq!(cloud.retry.base_delay, Duration::from_millis(500));
        assert_eq!(cloud.retry.max_delay, RetryPolicy::default().max_delay);

        let local = config.local.as_ref().unwrap();
        assert_eq!(local.address, "192.168.1.50:8000".parse().unwrap());
        assert_eq!(local.timeout, Duration::from_secs(3));
        assert_eq!(local.timeout_retries, 2);

        assert_eq!(config.cache.runtime, Duration::from_secs(10));
        assert_eq!(config.cache.battery, Duration::ZERO);
        assert_eq!(config.cache.parameters, Duration::from_secs(3600));

        assert_eq!(config.devices[0].unit_id, 1);
        assert_eq!(config.devices[1].family, DeviceFamily::PvSeries);
    }

    #[test]
    fn arena_links_children() {
        let arena = Config::from_yaml_str(FULL).unwrap().device_arena().unwrap();
        let mid = arena.by_serial("MID0000001").unwrap();
        assert_eq!(mid.kind, DeviceKind::GridController);
        let children: Vec<_> = arena.children(mid.id).unwrap().map(|d| d.serial()).collect();
        assert_eq!(children, vec!["1234567890"]);
        assert_eq!(arena.by_serial("1234567890").unwrap().address.unit_id, 2);
    }

    #[test]
    fn rejects_invalid_documents() {
        assert_matches!(Config::from_yaml_str("devices: []"), Err(Error::Config(_)));

        let twice = r#"
local: { address: "10.0.0.1:502" }
devices:
  - { serial: "A", family: eu-series }
  - { serial: "A", family: pv-series }
"#;
        assert_matches!(Config::from_yaml_str(twice), Err(Error::Config(m)) if m.contains("twice"));

        let orphan = r#"
local: { address: "10.0.0.1:502" }
devices:
  - { serial: "A", family: eu-series, parent: "B" }
"#;
        assert_matches!(
            Config::from_yaml_str(orphan),
            Err(Error::Config(m)) if m.contains("parent")
        );

        let unknown_family = r#"
local: { address: "10.0.0.1:502" }
devices:
  - { serial: "A", family: toaster }
"#;
        assert_matches!(Config::from_yaml_str(unknown_family), Err(Error::Config(_)));
    }
}
