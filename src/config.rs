//! SDES configuration boundary: the RTCP handler reads optional SDES items
//! (NAME, EMAIL, PHONE, LOC, NOTE) from whatever is plugged in here.
//! Persisted as a flat key/value table via serde + directories + toml,
//! scoped down to these five keys plus CNAME (which is derived, not
//! stored).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const USER_NAME: &str = "USER_NAME";
pub const USER_EMAIL: &str = "USER_EMAIL";
pub const USER_PHONE: &str = "USER_PHONE";
pub const USER_LOC: &str = "USER_LOC";
pub const USER_NOTE: &str = "USER_NOTE";

pub trait SdesConfig: Send + Sync {
    fn is_set(&self, key: &str) -> bool;
    fn get(&self, key: &str, prompt: &str, default: &str) -> String;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredValues {
    #[serde(default)]
    values: HashMap<String, String>,
}

/// Persisted on disk under the platform config directory, one flat
/// key/value table mirroring the five SDES-relevant keys.
pub struct FileSdesConfig {
    values: HashMap<String, String>,
}

impl FileSdesConfig {
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "rtp-conf-core", "rtp-conf-core")
            .context("could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("sdes.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(FileSdesConfig {
                values: HashMap::new(),
            });
        }
        let content = fs::read_to_string(&path).context("failed to read SDES config file")?;
        let stored: StoredValues = toml::from_str(&content).context("failed to parse SDES config file")?;
        Ok(FileSdesConfig {
            values: stored.values,
        })
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("failed to create config directory")?;
        let path = Self::config_path()?;
        let stored = StoredValues {
            values: self.values.clone(),
        };
        let content = toml::to_string_pretty(&stored).context("failed to serialize SDES config")?;
        fs::write(&path, content).context("failed to write SDES config file")?;
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }
}

impl SdesConfig for FileSdesConfig {
    fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn get(&self, key: &str, _prompt: &str, default: &str) -> String {
        self.values.get(key).cloned().unwrap_or_else(|| default.to_string())
    }
}

/// In-memory config for tests, identical semantics without touching disk.
#[derive(Debug, Default, Clone)]
pub struct StaticSdesConfig(pub HashMap<String, String>);

impl SdesConfig for StaticSdesConfig {
    fn is_set(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    fn get(&self, key: &str, _prompt: &str, default: &str) -> String {
        self.0.get(key).cloned().unwrap_or_else(|| default.to_string())
    }
}
