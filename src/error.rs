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

//! Error types shared by the sender and receiver

use std::fmt;

/// Which side asked for the transfer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// Two CAN bytes arrived from the peer
    Peer,
    /// Pre-empted locally; two CAN bytes were sent to the peer
    Local,
}

impl fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelOrigin::Peer => write!(f, "peer"),
            CancelOrigin::Local => write!(f, "local pre-emption"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("timed out waiting for peer")]
    Timeout,

    #[error("checksum mismatch: expected {expected:#06x}, got {got:#06x}")]
    ChecksumMismatch { expected: u16, got: u16 },

    #[error("sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    #[error("unexpected byte 0x{0:02X}")]
    UnexpectedByte(u8),

    #[error("packet rejected by peer")]
    Rejected,

    #[error("transfer cancelled by {0}")]
    Cancelled(CancelOrigin),

    #[error("too many errors ({errors}), aborting")]
    TooManyErrors { errors: u32 },

    #[error("header for {0:?} does not fit in one block")]
    HeaderTooLong(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Faults that are retried locally until the error budget runs out.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout
                | TransferError::ChecksumMismatch { .. }
                | TransferError::SequenceMismatch { .. }
                | TransferError::UnexpectedByte(_)
                | TransferError::Rejected
        )
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
