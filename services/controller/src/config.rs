//! Controller configuration.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::clouds::CloudProfile;
use crate::provision::{ProvisionerConfig, DEFAULT_CREATE_ATTEMPTS};
use crate::retention::{RetentionSettings, DEFAULT_RETENTION_MINUTES};
use crate::sweeper::SweeperConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Where termination ledger records live.
    pub data_dir: PathBuf,

    /// Address of the phone-home and health endpoints.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// TOML file with the cloud profiles.
    pub clouds_file: PathBuf,

    pub cleanup_interval: Duration,
    pub retention_interval: Duration,

    /// Upper bound on concurrent cloud calls.
    pub max_concurrent_calls: usize,

    pub retention_enabled: bool,
    pub create_attempts: u32,
}

impl Config {
    /// Load configuration from `CLOUDFLEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir: PathBuf = var("CLOUDFLEET_DATA_DIR")
            .unwrap_or_else(|| "/var/lib/cloudfleet".to_string())
            .into();

        let listen_addr = var("CLOUDFLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8090".to_string())
            .parse::<SocketAddr>()
            .context("invalid CLOUDFLEET_LISTEN_ADDR")?;

        let log_level = var("CLOUDFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let clouds_file: PathBuf = var("CLOUDFLEET_CLOUDS_FILE")
            .unwrap_or_else(|| "/etc/cloudfleet/clouds.toml".to_string())
            .into();

        let cleanup_interval = Duration::from_secs(
            var("CLOUDFLEET_CLEANUP_INTERVAL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(300),
        );

        let retention_interval = Duration::from_secs(
            var("CLOUDFLEET_RETENTION_INTERVAL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60),
        );

        let max_concurrent_calls = var("CLOUDFLEET_MAX_CONCURRENT_CALLS")
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(8);

        let retention_enabled = var("CLOUDFLEET_RETENTION_ENABLED")
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
            .unwrap_or(true);

        let create_attempts = var("CLOUDFLEET_CREATE_ATTEMPTS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CREATE_ATTEMPTS);

        Ok(Self {
            data_dir,
            listen_addr,
            log_level,
            clouds_file,
            cleanup_interval,
            retention_interval,
            max_concurrent_calls,
            retention_enabled,
            create_attempts,
        })
    }

    pub fn retention(&self) -> RetentionSettings {
        RetentionSettings {
            enabled: self.retention_enabled,
            default_minutes: DEFAULT_RETENTION_MINUTES,
        }
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.cleanup_interval,
        }
    }

    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            create_attempts: self.create_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloudsFile {
    #[serde(default)]
    clouds: Vec<CloudProfile>,
}

/// Read cloud profiles from a TOML file with one `[[clouds]]` table per
/// cloud. A missing file yields no clouds.
pub fn load_cloud_profiles(path: &Path) -> Result<Vec<CloudProfile>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Clouds file not found, no clouds configured");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    parse_cloud_profiles(&raw).with_context(|| format!("invalid clouds file {}", path.display()))
}

fn parse_cloud_profiles(raw: &str) -> Result<Vec<CloudProfile>> {
    let file: CloudsFile = toml::from_str(raw)?;

    let mut seen = HashSet::new();
    for cloud in &file.clouds {
        if cloud.name.is_empty() {
            bail!("cloud with empty name");
        }
        if !seen.insert(cloud.name.as_str()) {
            bail!("duplicate cloud {}", cloud.name);
        }
        let mut templates = HashSet::new();
        for template in &cloud.templates {
            if !templates.insert(template.name.as_str()) {
                bail!("duplicate template {} in cloud {}", template.name, cloud.name);
            }
        }
    }
    Ok(file.clouds)
}
