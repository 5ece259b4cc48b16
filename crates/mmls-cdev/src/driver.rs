//! Driver entry point: builds, hands out and tears down the devices.

use std::sync::Arc;

use crate::backing::MmlsBackend;
use crate::cache::{CacheMaintenance, CpuCache};
use crate::config::CdevConfig;
use crate::device::MmlsDevice;
use crate::file::DeviceHandle;
use crate::{CdevError, Result};

/// The character driver: every registered device plus the configuration they were built with.
///
/// Devices are addressed by minor number, `0..device_count`. Dropping the driver tears every
/// device down.
pub struct MmlsCdev {
    config: CdevConfig,
    devices: Vec<Arc<MmlsDevice>>,
}

impl MmlsCdev {
    pub fn init(config: CdevConfig, backend: Arc<dyn MmlsBackend>) -> Result<Self> {
        Self::init_with_cache(config, backend, Arc::new(CpuCache))
    }

    /// Registers `config.device_count` devices over `backend`.
    ///
    /// All or nothing: if any device fails to initialize, the ones already built are torn down
    /// and the error is returned. A disabled driver registers nothing and reports
    /// [`CdevError::NoDevice`].
    pub fn init_with_cache(
        config: CdevConfig,
        backend: Arc<dyn MmlsBackend>,
        cache: Arc<dyn CacheMaintenance>,
    ) -> Result<Self> {
        if !config.enabled {
            tracing::info!("mmls char driver disabled");
            return Err(CdevError::NoDevice);
        }
        if config.device_count == 0 {
            return Err(CdevError::InvalidArgument("device count is zero"));
        }

        let mut devices = Vec::with_capacity(config.device_count);
        for index in 0..config.device_count {
            match MmlsDevice::init(index, &config, backend.clone(), cache.clone()) {
                Ok(device) => devices.push(Arc::new(device)),
                Err(err) => {
                    tracing::error!(device = index, error = %err, "device init failed");
                    for device in &devices {
                        device.shutdown();
                    }
                    return Err(err);
                }
            }
        }

        tracing::info!(
            devices = devices.len(),
            mmap_policy = %config.mmap_policy,
            "mmls char driver registered"
        );
        Ok(Self { config, devices })
    }

    pub fn config(&self) -> &CdevConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device(&self, minor: usize) -> Option<&Arc<MmlsDevice>> {
        self.devices.get(minor)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<MmlsDevice>> {
        self.devices.iter()
    }

    /// Node name for `minor`, as it would appear under `/dev`.
    pub fn device_name(minor: usize) -> String {
        format!("mmls{minor}")
    }

    pub fn open(&self, minor: usize) -> Result<DeviceHandle> {
        let device = self.devices.get(minor).ok_or(CdevError::NoDevice)?;
        if device.is_torn_down() {
            return Err(CdevError::NoDevice);
        }
        Ok(DeviceHandle::new(device.clone(), self.config.seek_end))
    }

    pub fn shutdown(&self) {
        for device in &self.devices {
            device.shutdown();
        }
    }
}

impl Drop for MmlsCdev {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::RamDiskBackend;
    use crate::device::BackingMode;

    #[test]
    fn disabled_driver_registers_nothing() {
        let config = CdevConfig {
            enabled: false,
            ..CdevConfig::default()
        };
        let err = MmlsCdev::init(config, Arc::new(RamDiskBackend::absent()))
            .err()
            .unwrap();
        assert!(matches!(err, CdevError::NoDevice));
    }

    #[test]
    fn later_devices_fall_back_to_static_buffer() {
        let config = CdevConfig {
            device_count: 2,
            ..CdevConfig::default()
        };
        let cdev = MmlsCdev::init(config, Arc::new(RamDiskBackend::new(8192).unwrap())).unwrap();
        assert_eq!(cdev.device(0).unwrap().mode(), BackingMode::PhysicalRegion);
        assert_eq!(cdev.device(1).unwrap().mode(), BackingMode::StaticBuffer);
        assert_eq!(MmlsCdev::device_name(1), "mmls1");
    }

    #[test]
    fn failed_init_releases_earlier_devices() {
        let backend = Arc::new(RamDiskBackend::new(8192).unwrap());
        let config = CdevConfig {
            device_count: 2,
            static_fallback: false,
            ..CdevConfig::default()
        };
        assert!(MmlsCdev::init(config, backend.clone()).is_err());
        assert!(backend.is_released());
    }

    #[test]
    fn open_rejects_unknown_minor() {
        let cdev = MmlsCdev::init(
            CdevConfig::default(),
            Arc::new(RamDiskBackend::new(4096).unwrap()),
        )
        .unwrap();
        assert!(cdev.open(0).is_ok());
        assert!(matches!(cdev.open(1), Err(CdevError::NoDevice)));
    }
}
