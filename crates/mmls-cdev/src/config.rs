//! Driver configuration, from defaults or `MMLS_*` environment variables.

use std::str::FromStr;

use thiserror::Error;

use crate::CachePolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Where `SeekFrom::End` is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekEnd {
    /// The device size.
    #[default]
    DeviceSize,
    /// The static buffer capacity regardless of device size, for compatibility with callers that
    /// depend on the historical behaviour.
    StaticBufferCapacity,
}

/// What to do with a range that starts in bounds but runs past the end of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrunPolicy {
    /// Shorten it to end at the device size.
    #[default]
    Clip,
    /// Fail it with `OutOfRange`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdevConfig {
    pub enabled: bool,
    pub device_count: usize,
    /// Cache attribute applied to every caller mapping. Fixed for the lifetime of the subsystem.
    pub mmap_policy: CachePolicy,
    /// Fall back to the static buffer when discovery finds nothing.
    pub static_fallback: bool,
    pub seek_end: SeekEnd,
    pub overrun: OverrunPolicy,
}

impl Default for CdevConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_count: 1,
            mmap_policy: CachePolicy::WriteBack,
            static_fallback: true,
            seek_end: SeekEnd::DeviceSize,
            overrun: OverrunPolicy::Clip,
        }
    }
}

impl CdevConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).map(|raw| (var, raw.trim().to_owned()));

        let enabled = match get("MMLS_CDEV_ENABLED") {
            Some((var, raw)) => parse_bool(var, &raw)?,
            None => defaults.enabled,
        };
        let device_count = match get("MMLS_DEVICE_COUNT") {
            Some((var, raw)) => match raw.parse::<usize>() {
                Ok(count) if count > 0 => count,
                _ => return Err(invalid(var, raw)),
            },
            None => defaults.device_count,
        };
        let mmap_policy = match get("MMLS_MMAP_TYPE") {
            Some((var, raw)) => CachePolicy::from_str(&raw).map_err(|_| invalid(var, raw))?,
            None => defaults.mmap_policy,
        };
        let static_fallback = match get("MMLS_STATIC_FALLBACK") {
            Some((var, raw)) => parse_bool(var, &raw)?,
            None => defaults.static_fallback,
        };
        let seek_end = match get("MMLS_SEEK_END") {
            Some((var, raw)) => match raw.as_str() {
                "size" => SeekEnd::DeviceSize,
                "buffer" => SeekEnd::StaticBufferCapacity,
                _ => return Err(invalid(var, raw)),
            },
            None => defaults.seek_end,
        };
        let overrun = match get("MMLS_OVERRUN") {
            Some((var, raw)) => match raw.as_str() {
                "clip" => OverrunPolicy::Clip,
                "reject" => OverrunPolicy::Reject,
                _ => return Err(invalid(var, raw)),
            },
            None => defaults.overrun,
        };

        Ok(Self {
            enabled,
            device_count,
            mmap_policy,
            static_fallback,
            seek_end,
            overrun,
        })
    }
}

fn invalid(var: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidEnv { var, value }
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw.to_owned())),
    }
}
