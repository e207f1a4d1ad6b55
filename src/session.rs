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

//! Per-invocation transfer state and cooperative cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::config::TransferConfig;
use crate::error::{CancelOrigin, Result, TransferError};
use crate::packet::TransferMode;

// ============================================================================
// Pre-emption
// ============================================================================

/// External signal polled between packet operations.
pub trait Preemption: Send + Sync {
    fn preempted(&self) -> bool;
}

/// Never asks a transfer to stop.
pub struct NeverPreempted;

impl Preemption for NeverPreempted {
    fn preempted(&self) -> bool {
        false
    }
}

/// Shared flag raised by whoever needs the link back.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Preemption for CancelFlag {
    fn preempted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Count of active firmware workers. A transfer yields as soon as anyone else
/// is running alongside it.
#[derive(Clone, Default)]
pub struct Workers(Arc<AtomicUsize>);

/// Registration in [`Workers`], released on drop.
pub struct WorkerGuard(Arc<AtomicUsize>);

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> WorkerGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        WorkerGuard(Arc::clone(&self.0))
    }

    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Preemption for Workers {
    fn preempted(&self) -> bool {
        self.active() > 1
    }
}

// ============================================================================
// Session
// ============================================================================

/// Mutable state for one sender or receiver run.
pub struct Session {
    pub mode: TransferMode,
    pub error_count: u32,
    pub retry_limit: u32,
    pub read_timeout: Duration,
    pub sequence: u8,
    cancel_seen: bool,
    preemption: Arc<dyn Preemption>,
}

impl Session {
    pub fn new(config: &TransferConfig, preemption: Arc<dyn Preemption>) -> Self {
        Session {
            mode: TransferMode::Crc16,
            error_count: 0,
            retry_limit: config.retry_limit.max(1),
            read_timeout: config.read_timeout,
            sequence: 0,
            cancel_seen: false,
            preemption,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.preemption.preempted()
    }

    /// Count a transient fault. Fails once the error budget is spent; anything
    /// that is not worth retrying is handed straight back.
    pub fn fault(&mut self, cause: TransferError) -> Result<()> {
        if !cause.is_transient() {
            return Err(cause);
        }
        self.cancel_seen = false;
        self.error_count += 1;
        warn!("{} ({}/{})", cause, self.error_count, self.retry_limit);
        if self.error_count >= self.retry_limit {
            return Err(TransferError::TooManyErrors { errors: self.error_count });
        }
        Ok(())
    }

    /// The peer answered as expected.
    pub fn clear_errors(&mut self) {
        self.error_count = 0;
        self.cancel_seen = false;
    }

    /// Record a CAN from the peer. The second one in a row cancels.
    pub fn peer_cancel(&mut self) -> Result<()> {
        if self.cancel_seen {
            return Err(TransferError::Cancelled(CancelOrigin::Peer));
        }
        self.cancel_seen = true;
        Ok(())
    }

    /// Any byte other than CAN breaks a pending cancel pair.
    pub fn reset_cancel(&mut self) {
        self.cancel_seen = false;
    }
}

// ============================================================================
// State Machine Step
// ============================================================================

/// Outcome of one state machine step.
pub enum Step<S: ?Sized> {
    Next(Box<S>),
    Complete,
}
