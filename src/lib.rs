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

//! Resumable YMODEM batch transfers over a byte link.
//!
//! The sender keeps a marker next to every file recording how much of it the
//! receiver has acknowledged, so an interrupted session picks up where the last
//! one stopped.

pub mod checksum;
pub mod config;
pub mod error;
pub mod packet;
pub mod persistence;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod serial;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use config::TransferConfig;
pub use error::{CancelOrigin, Result, TransferError};
pub use persistence::FsLock;
pub use serial::{Channel, loopback};
pub use session::{CancelFlag, NeverPreempted, Preemption, Workers};

use persistence::MarkerStore;
use receiver::ReceiverFsm;
use sender::SenderFsm;

/// Settings and shared resources for running transfers.
#[derive(Clone)]
pub struct Transfer {
    config: TransferConfig,
    lock: FsLock,
    preemption: Arc<dyn Preemption>,
}

impl Transfer {
    pub fn new(config: TransferConfig) -> Self {
        Transfer {
            config,
            lock: FsLock::new(),
            preemption: Arc::new(NeverPreempted),
        }
    }

    /// Stop transfers whenever `preemption` says the link is wanted elsewhere.
    pub fn with_preemption(mut self, preemption: Arc<dyn Preemption>) -> Self {
        self.preemption = preemption;
        self
    }

    /// Share the marker lock with other users of the data directory.
    pub fn with_lock(mut self, lock: FsLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Send `files` in order as one batch.
    pub fn try_send(&self, channel: Box<dyn Channel>, files: Vec<PathBuf>) -> Result<()> {
        info!("Sending batch of {} file(s)", files.len());
        let store = MarkerStore::new(self.config.prefixes(), self.lock.clone());
        let fsm = SenderFsm::new(channel, files, &self.config, store, Arc::clone(&self.preemption));
        sender::run(fsm)
    }

    /// Receive a batch into `output_dir`.
    pub fn try_receive(&self, channel: Box<dyn Channel>, output_dir: PathBuf) -> Result<()> {
        info!("Receiving batch into {}", output_dir.display());
        let fsm = ReceiverFsm::new(channel, output_dir, &self.config, Arc::clone(&self.preemption));
        receiver::run(fsm)
    }

    pub fn send(&self, channel: Box<dyn Channel>, files: Vec<PathBuf>) -> bool {
        self.try_send(channel, files).is_ok()
    }

    pub fn receive(&self, channel: Box<dyn Channel>, output_dir: PathBuf) -> bool {
        self.try_receive(channel, output_dir).is_ok()
    }
}

/// Send `files` over `channel`; `true` once the receiver acknowledged the whole batch.
pub fn send(channel: Box<dyn Channel>, files: Vec<PathBuf>, config: &TransferConfig) -> bool {
    Transfer::new(config.clone()).send(channel, files)
}

/// Receive a batch over `channel` into `output_dir`; `true` once the batch terminator arrived.
pub fn receive(channel: Box<dyn Channel>, output_dir: PathBuf, config: &TransferConfig) -> bool {
    Transfer::new(config.clone()).receive(channel, output_dir)
}
