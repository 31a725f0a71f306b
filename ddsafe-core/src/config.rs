//! Layered runtime settings.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `DDSAFE_*`
//! environment variables (`__` separates nested keys, so
//! `DDSAFE_EXECUTOR__USE_SUDO=true` sets `executor.use_sudo`), then
//! whatever the front-end passes as overrides.
use crate::error::Result;
use crate::request::BlockSize;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ddsafe/config.toml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub block_size: BlockSize,
    pub progress_interval_ms: u64,
    /// Upper bound on any `lsblk`/`umount` call.
    pub catalog_timeout_secs: u64,
    pub include_loop_devices: bool,
    pub allow_system_disk: bool,
    /// What the operator must type to confirm a destructive operation.
    pub confirm_phrase: String,
    /// Append-only operation log. Disabled when unset.
    pub journal: Option<PathBuf>,
    pub executor: ExecutorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            block_size: BlockSize::DEFAULT,
            progress_interval_ms: 1000,
            catalog_timeout_secs: 10,
            include_loop_devices: false,
            allow_system_disk: false,
            confirm_phrase: "yes".to_string(),
            journal: None,
            executor: ExecutorSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub program: PathBuf,
    /// Run the executor and `umount` through `sudo -n`.
    pub use_sudo: bool,
    /// SIGTERM to SIGKILL delay when a transfer is cancelled.
    pub kill_grace_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dd"),
            use_sudo: false,
            kill_grace_ms: 3000,
        }
    }
}

impl Settings {
    /// Loads settings from `path` (or [`DEFAULT_CONFIG_PATH`]) and the
    /// environment, then applies `overrides`.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load<T: Serialize>(path: Option<&Path>, overrides: T) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        Self::figment(path, overrides).extract().map_err(Into::into)
    }

    fn figment<T: Serialize>(path: &Path, overrides: T) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DDSAFE_").split("__"))
            .merge(Serialized::defaults(overrides))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(50))
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.executor.kill_grace_ms)
    }
}
