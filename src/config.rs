// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Transfer tuning, loadable from a TOML file
//!
//! ```toml
//! retry_limit = 5
//! timeout = 10        # seconds per byte read
//! block_size = 1024   # 128 or 1024
//! marker_prefix = "$"
//! sent_prefix = "_"
//! ```

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::packet::BlockSize;
use crate::persistence::Prefixes;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Consecutive faults tolerated before the whole batch is aborted
    pub retry_limit: u32,

    /// Longest wait for any single read
    #[serde(rename = "timeout", deserialize_with = "seconds")]
    pub read_timeout: Duration,

    /// Block size used for outgoing packets
    pub block_size: BlockSize,

    /// Prefix of the resume marker kept next to a file being sent
    pub marker_prefix: String,

    /// Prefix a file is renamed to once fully sent
    pub sent_prefix: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            retry_limit: 5,
            read_timeout: Duration::from_secs(10),
            block_size: BlockSize::OneK,
            marker_prefix: "$".to_string(),
            sent_prefix: "_".to_string(),
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl TransferConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        info!("Loaded transfer config from {}", path.display());
        Ok(config)
    }

    pub fn prefixes(&self) -> Prefixes {
        Prefixes {
            marker: self.marker_prefix.clone(),
            sent: self.sent_prefix.clone(),
        }
    }
}
