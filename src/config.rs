//! Configuration management for sopsfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default keyservice address
pub const DEFAULT_KEYSERVICE: &str = "sops-keyservice.lan:5000";

/// Default decrypt timeout: 10 seconds
pub const DEFAULT_DECRYPT_TIMEOUT_SECS: u64 = 10;

/// Default cache TTL: 5 minutes
pub const DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;

/// Default sweep interval: 10 minutes
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10 * 60;

/// Size reported for files before their content is known
pub const DEFAULT_PLACEHOLDER_SIZE: u64 = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SOPS invocation settings
    pub sops: SopsConfig,

    /// Decrypted-value cache settings
    pub cache: CacheConfig,

    /// Mount settings
    pub mount: MountConfig,
}

/// SOPS invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SopsConfig {
    /// Path to the sops binary (looked up in PATH if relative)
    pub binary: PathBuf,

    /// Keyservice address, `host:port` or `tcp://host:port`
    pub keyservice: String,

    /// SOPS-encrypted YAML/JSON file to expose
    pub secrets_file: PathBuf,

    /// Upper bound on a single decrypt, in seconds
    pub decrypt_timeout_secs: u64,
}

/// Decrypted-value cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a decrypted value may be served, in seconds
    pub ttl_secs: u64,

    /// Interval between expiry sweeps, in seconds
    pub sweep_interval_secs: u64,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Permissions of secret files
    pub file_mode: u16,

    /// Permissions of directories
    pub dir_mode: u16,

    /// Size reported by getattr for files that have not been read
    pub placeholder_size: u64,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,
}

impl Default for SopsConfig {
    fn default() -> Self {
        SopsConfig {
            binary: PathBuf::from("sops"),
            keyservice: DEFAULT_KEYSERVICE.to_string(),
            secrets_file: PathBuf::from("secrets.yaml"),
            decrypt_timeout_secs: DEFAULT_DECRYPT_TIMEOUT_SECS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/run/sopsfs"),
            fs_name: "sopsfs".to_string(),
            allow_other: false,
            auto_unmount: true,
            file_mode: 0o444,
            dir_mode: 0o555,
            placeholder_size: DEFAULT_PLACEHOLDER_SIZE,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl SopsConfig {
    /// Decrypt timeout as a duration
    pub fn decrypt_timeout(&self) -> Duration {
        Duration::from_secs(self.decrypt_timeout_secs)
    }
}

impl CacheConfig {
    /// TTL as a duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults.
    ///
    /// Environment overrides apply in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(keyservice) = env_value("SOPSFS_KEYSERVICE") {
            self.sops.keyservice = keyservice;
        }

        if let Some(secrets) = env_value("SOPSFS_SECRETS") {
            self.sops.secrets_file = PathBuf::from(secrets);
        }

        if let Some(binary) = env_value("SOPSFS_SOPS_BINARY") {
            self.sops.binary = PathBuf::from(binary);
        }

        if let Some(mount_point) = env_value("SOPSFS_MOUNT_POINT") {
            self.mount.mount_point = PathBuf::from(mount_point);
        }

        if let Some(ttl) = env_value("SOPSFS_CACHE_TTL_SECS") {
            if let Ok(secs) = ttl.parse::<u64>() {
                self.cache.ttl_secs = secs;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sops.keyservice.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Keyservice address is required".to_string(),
            ));
        }

        if self.sops.decrypt_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "Decrypt timeout must be greater than 0".to_string(),
            ));
        }

        if self.cache.ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "Cache TTL must be greater than 0".to_string(),
            ));
        }

        if self.cache.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "Cache sweep interval must be greater than 0".to_string(),
            ));
        }

        if self.mount.file_mode > 0o7777 || self.mount.dir_mode > 0o7777 {
            return Err(Error::InvalidConfig(
                "File and directory modes must be permission bits only".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
