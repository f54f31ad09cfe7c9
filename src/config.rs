use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::domain::Frequency;
use crate::error::XnatError;

pub const DEFAULT_CONFIG_FILE: &str = "xnat-store.json";
pub const INPUT_MOUNT: &str = "/input";
pub const OUTPUT_MOUNT: &str = "/output";
pub const CACHE_MOUNT: &str = "/cache";

#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigFile {
    pub server: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub race_condition_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XnatConfig {
    pub server: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub cache_dir: Utf8PathBuf,
    /// How long to wait for a concurrent download of the same resource.
    pub race_condition_delay_secs: u64,
}

/// Settings of a store running inside the container service, where the
/// archive is mounted read-only at `input_mount`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    pub row_frequency: Frequency,
    pub row_id: Option<String>,
    pub input_mount: Utf8PathBuf,
    pub output_mount: Utf8PathBuf,
}

pub fn default_race_condition_delay() -> u64 {
    30
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<XnatConfig, XnatError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(XnatError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| XnatError::ConfigRead(config_path.clone()))?;
        let config: ConfigFile = serde_json::from_str(&content)
            .map_err(|err| XnatError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: ConfigFile) -> Result<XnatConfig, XnatError> {
        let server = config.server.trim().trim_end_matches('/').to_string();
        if server.is_empty() {
            return Err(XnatError::ConfigParse("server must not be empty".to_string()));
        }
        let cache_dir = match config.cache_dir {
            Some(dir) => dir,
            None => Cache::default_root()?,
        };
        Ok(XnatConfig {
            server,
            user: config.user,
            password: config.password,
            cache_dir,
            race_condition_delay_secs: config
                .race_condition_delay_secs
                .unwrap_or_else(default_race_condition_delay),
        })
    }

    /// Container-service settings from the process environment.
    pub fn from_env(
        row_frequency: Frequency,
        row_id: Option<String>,
    ) -> Result<(XnatConfig, MountConfig), XnatError> {
        Self::from_lookup(row_frequency, row_id, |name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        row_frequency: Frequency,
        row_id: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(XnatConfig, MountConfig), XnatError> {
        let require =
            |name: &str| lookup(name).ok_or_else(|| XnatError::MissingEnv(name.to_string()));
        let config = XnatConfig {
            server: require("XNAT_HOST")?.trim_end_matches('/').to_string(),
            user: Some(require("XNAT_USER")?),
            password: Some(require("XNAT_PASS")?),
            cache_dir: Utf8PathBuf::from(CACHE_MOUNT),
            race_condition_delay_secs: default_race_condition_delay(),
        };
        let mounts = MountConfig {
            row_frequency,
            row_id,
            input_mount: Utf8PathBuf::from(INPUT_MOUNT),
            output_mount: Utf8PathBuf::from(OUTPUT_MOUNT),
        };
        Ok((config, mounts))
    }
}
