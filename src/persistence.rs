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

//! Resume markers
//!
//! A file being sent from `data/20260101` keeps its acknowledged byte count in
//! `data/$20260101`. Once fully sent and no longer written to, it is renamed to
//! `data/_20260101` and the marker is removed.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SECONDS_PER_DAY: u64 = 86_400;

/// File name prefixes for resume markers and sent files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    pub marker: String,
    pub sent: String,
}

impl Default for Prefixes {
    fn default() -> Self {
        Prefixes {
            marker: "$".to_string(),
            sent: "_".to_string(),
        }
    }
}

/// Advisory lock over marker files, shared with anything else touching the
/// data directory.
#[derive(Clone, Default)]
pub struct FsLock(Arc<Mutex<()>>);

impl FsLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// File Record
// ============================================================================

/// A file selected for sending and how far the peer has acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub declared_size: u64,
    pub acknowledged_offset: u64,
    /// A marker was found on disk when the record was loaded
    pub resumed: bool,
}

impl FileRecord {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn remaining(&self) -> u64 {
        self.declared_size.saturating_sub(self.acknowledged_offset)
    }

    /// Every byte was acknowledged in an earlier session.
    pub fn already_sent(&self) -> bool {
        self.resumed && self.acknowledged_offset == self.declared_size
    }
}

/// What finalization did with a fully sent file.
#[derive(Debug, PartialEq, Eq)]
pub enum Finalized {
    /// Renamed to the sent name, marker removed
    Renamed(PathBuf),
    /// Still being written today; marker kept at full size
    Kept,
}

// ============================================================================
// Marker Store
// ============================================================================

pub struct MarkerStore {
    prefixes: Prefixes,
    lock: FsLock,
}

fn sibling(path: &Path, prefix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    path.with_file_name(name)
}

fn day(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / SECONDS_PER_DAY)
        .unwrap_or(0)
}

impl MarkerStore {
    pub fn new(prefixes: Prefixes, lock: FsLock) -> Self {
        MarkerStore { prefixes, lock }
    }

    pub fn marker_path(&self, path: &Path) -> PathBuf {
        sibling(path, &self.prefixes.marker)
    }

    pub fn sent_path(&self, path: &Path) -> PathBuf {
        sibling(path, &self.prefixes.sent)
    }

    /// Build a record for `path` from its current size and any saved marker.
    pub fn select(&self, path: &Path) -> std::io::Result<FileRecord> {
        let declared_size = std::fs::metadata(path)?.len();
        let mut record = FileRecord {
            path: path.to_path_buf(),
            declared_size,
            acknowledged_offset: 0,
            resumed: false,
        };

        match self.load(&record) {
            Some(offset) if offset <= declared_size => {
                record.acknowledged_offset = offset;
                record.resumed = true;
            }
            Some(offset) => {
                warn!("Marker for {} is past end of file ({} > {}), starting over",
                      path.display(), offset, declared_size);
            }
            None => {}
        }
        Ok(record)
    }

    /// Saved acknowledged offset, `None` if there is no usable marker.
    pub fn load(&self, record: &FileRecord) -> Option<u64> {
        let marker = self.marker_path(&record.path);
        let _guard = self.lock.hold();
        let content = std::fs::read_to_string(&marker).ok()?;
        match content.trim().parse() {
            Ok(offset) => Some(offset),
            Err(_) => {
                warn!("Ignoring unreadable marker {}", marker.display());
                None
            }
        }
    }

    /// Persist `offset`. The marker is replaced in one rename so a reader never
    /// sees a partially written value.
    pub fn store(&self, record: &FileRecord, offset: u64) -> std::io::Result<()> {
        let marker = self.marker_path(&record.path);
        let mut staging = marker.clone().into_os_string();
        staging.push(".part");
        let staging = PathBuf::from(staging);

        let _guard = self.lock.hold();
        std::fs::write(&staging, offset.to_string())?;
        if let Err(e) = std::fs::rename(&staging, &marker) {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }
        debug!("Marker {} = {}", marker.display(), offset);
        Ok(())
    }

    pub fn remove(&self, record: &FileRecord) -> std::io::Result<()> {
        let _guard = self.lock.hold();
        match std::fs::remove_file(self.marker_path(&record.path)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Retire a fully acknowledged file. Files last written on an earlier day
    /// than `now` are renamed to their sent name; today's file may still grow,
    /// so it keeps its marker.
    pub fn finalize(&self, record: &FileRecord, now: SystemTime) -> std::io::Result<Finalized> {
        let modified = std::fs::metadata(&record.path)?.modified()?;

        if day(now) > day(modified) {
            let sent = self.sent_path(&record.path);
            {
                let _guard = self.lock.hold();
                std::fs::rename(&record.path, &sent)?;
            }
            if let Err(e) = self.remove(record) {
                warn!("Unable to remove marker for {}: {}", record.path.display(), e);
            }
            info!("Retired {} as {}", record.path.display(), sent.display());
            Ok(Finalized::Renamed(sent))
        } else {
            if self.load(record) != Some(record.declared_size) {
                self.store(record, record.declared_size)?;
            }
            Ok(Finalized::Kept)
        }
    }
}
