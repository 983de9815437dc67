// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::{enums::LayerKind, logger::LogConfig};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Socket and timing parameters of the daemon itself.
    pub daemon: DaemonConfig,
    /// Logging setup applied at startup.
    pub logger: LogConfig,
    /// The layer table. Discovered once at startup, immutable afterwards.
    pub layers: Vec<LayerConfig>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// Runtime parameters of the daemon process.
pub struct DaemonConfig {
    /// Path of the Unix stream socket clients connect to.
    pub socket: PathBuf,

    /// Directory holding one database file per layer.
    pub db_dir: PathBuf,

    /// Socket of the external authorization service. When absent the
    /// bridge is disabled and any privileged access is denied.
    #[serde(default)]
    pub auth_socket: Option<PathBuf>,

    /// How long a client may stall in the middle of a frame before it is
    /// disconnected.
    #[serde(default = "default_read_timeout", with = "serde_secs")]
    pub read_timeout: Duration,

    /// Frames handled per client wakeup before other clients get a turn.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_batch_limit() -> usize {
    32
}

#[derive(Deserialize, Serialize, Debug, Clone)]
/// One layer as declared in the configuration file.
pub struct LayerConfig {
    /// Unique layer name, also the database file stem.
    pub name: String,
    /// `system` or `user`.
    #[serde(rename = "type")]
    pub kind: LayerKind,
    /// Resolution priority within the kind; higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Read-only layers reject every mutation.
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates invariants the rest of the daemon relies on.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.daemon.socket.as_os_str().is_empty(),
            "daemon.socket must not be empty"
        );
        ensure!(
            !self.daemon.db_dir.as_os_str().is_empty(),
            "daemon.db_dir must not be empty"
        );
        ensure!(!self.layers.is_empty(), "at least one layer must be configured");
        ensure!(self.daemon.batch_limit >= 1, "daemon.batch_limit must be >= 1");

        let mut seen = HashSet::new();
        for layer in &self.layers {
            ensure!(!layer.name.is_empty(), "layer name must not be empty");
            ensure!(
                seen.insert(layer.name.as_str()),
                "duplicate layer name '{}'",
                layer.name
            );
        }
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
