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

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Take};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::{CancelOrigin, Result, TransferError};
use crate::packet::{self, BlockSize, TransferMode};
use crate::persistence::{FileRecord, Finalized, MarkerStore};
use crate::protocol::{self, *};
use crate::serial::{self as channel, Channel};
use crate::session::{Preemption, Session, Step};

// ============================================================================
// States
// ============================================================================

pub struct NegotiateMode;
pub struct SelectFile;
pub struct AwaitHeaderClear;
pub struct SendHeader;
pub struct AwaitHeaderAck;
pub struct AwaitDataClear;
pub struct SendData;
pub struct AwaitDataAck;
pub struct SendEot;

/// Quiet period that ends mode negotiation. The receiver repeats its request
/// until answered, so a late sender finds several queued and must use the last.
const REQUEST_SETTLE: Duration = Duration::from_millis(50);

// ============================================================================
// FSM Structure
// ============================================================================

/// File currently on the wire.
struct Outbound {
    record: FileRecord,
    stream: Take<File>,
}

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    channel: Box<dyn Channel>,
    session: Session,
    store: MarkerStore,
    block_size: BlockSize,
    files: VecDeque<PathBuf>,
    files_started: usize,
    closing: bool,
    current: Option<Outbound>,
    packet: Vec<u8>,
    chunk_len: usize,
    retransmit: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>>;
}

/// How the peer answered while a state waited for specific bytes.
enum Reply {
    /// One of the wanted bytes
    Got(u8),
    /// Timeout or stray byte, already counted against the error budget
    Fault,
    /// First CAN of a possible pair
    Pending,
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> SenderFsm<S> {
    fn transition<T>(self) -> Box<SenderFsm<T>> {
        Box::new(SenderFsm {
            state: PhantomData,
            channel: self.channel,
            session: self.session,
            store: self.store,
            block_size: self.block_size,
            files: self.files,
            files_started: self.files_started,
            closing: self.closing,
            current: self.current,
            packet: self.packet,
            chunk_len: self.chunk_len,
            retransmit: self.retransmit,
        })
    }

    fn next_state<T: 'static>(self) -> Result<Step<dyn SenderState>>
    where
        SenderFsm<T>: SenderState,
    {
        let next: Box<dyn SenderState> = self.transition::<T>();
        Ok(Step::Next(next))
    }

    /// Stop here if the link is wanted elsewhere, telling the peer first.
    fn checkpoint(&mut self) -> Result<()> {
        if !self.session.cancel_requested() {
            return Ok(());
        }
        warn!("Pre-empted, cancelling transmission");
        Err(self.abort(TransferError::Cancelled(CancelOrigin::Local)))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.checkpoint()?;
        self.channel.write_all(bytes)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<u8>> {
        self.checkpoint()?;
        let byte = channel::read_byte(self.channel.as_mut(), self.session.read_timeout)?;
        if let Some(b) = byte {
            debug!("Received: {} (0x{:02X})", protocol::name(b), b);
        }
        Ok(byte)
    }

    fn await_reply(&mut self, wanted: &[u8]) -> Result<Reply> {
        match self.poll()? {
            Some(b) if wanted.contains(&b) => {
                self.session.reset_cancel();
                Ok(Reply::Got(b))
            }
            Some(CAN) => {
                self.session.peer_cancel()?;
                Ok(Reply::Pending)
            }
            Some(b) => {
                self.session.fault(TransferError::UnexpectedByte(b))?;
                Ok(Reply::Fault)
            }
            None => {
                self.session.fault(TransferError::Timeout)?;
                Ok(Reply::Fault)
            }
        }
    }

    fn outbound(&mut self) -> Result<&mut Outbound> {
        self.current
            .as_mut()
            .ok_or_else(|| TransferError::Io(std::io::Error::other("no file in progress")))
    }

    fn finalize(&self, record: &FileRecord) -> std::io::Result<()> {
        if self.store.finalize(record, SystemTime::now())? == Finalized::Kept {
            debug!("Keeping {} for further appends", record.path.display());
        }
        Ok(())
    }

    /// Abort with `e`, cancelling the receiver first.
    fn abort(&mut self, e: TransferError) -> TransferError {
        if let Err(write_err) = self.channel.write_all(&[CAN, CAN]) {
            warn!("Unable to send CAN: {}", write_err);
        }
        e
    }

    /// Read out requests the receiver repeated while nobody answered; the last
    /// one names the mode it is waiting in now.
    fn settle_request(&mut self, mut request: u8) -> Result<u8> {
        let quiet = REQUEST_SETTLE.min(self.session.read_timeout);
        while let Some(b) = channel::read_byte(self.channel.as_mut(), quiet)? {
            match b {
                C | NAK => {
                    self.session.reset_cancel();
                    request = b;
                }
                CAN => self.session.peer_cancel()?,
                other => debug!("Ignoring 0x{:02X} while negotiating", other),
            }
        }
        Ok(request)
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<NegotiateMode> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        let request = match fsm.await_reply(&[C, NAK])? {
            Reply::Got(b) => fsm.settle_request(b)?,
            Reply::Fault | Reply::Pending => return fsm.next_state::<NegotiateMode>(),
        };
        if request == C {
            info!("16 bit CRC requested");
            fsm.session.mode = TransferMode::Crc16;
        } else {
            info!("Standard checksum requested");
            fsm.session.mode = TransferMode::Checksum8;
        }
        fsm.session.clear_errors();
        fsm.next_state::<SelectFile>()
    }
}

impl SenderState for SenderFsm<SelectFile> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        loop {
            let Some(path) = fsm.files.pop_front() else {
                debug!("No files remaining, closing batch");
                fsm.packet = packet::build_terminator_packet(fsm.block_size, fsm.session.mode);
                fsm.closing = true;
                break;
            };

            let record = match fsm.store.select(&path) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Unable to open {}: {}, trying next file", path.display(), e);
                    continue;
                }
            };

            if record.already_sent() {
                info!("File {} already transmitted, sending next file", record.name());
                // Nothing goes on the wire for it, so a failed rename can wait for the next session.
                if let Err(e) = fsm.finalize(&record) {
                    warn!("Unable to finalize {}: {}", record.path.display(), e);
                }
                continue;
            }

            let header = match packet::build_header_packet(
                &record.name(),
                record.remaining(),
                fsm.block_size,
                fsm.session.mode,
            ) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            let stream = match File::open(&path)
                .and_then(|mut f| f.seek(SeekFrom::Start(record.acknowledged_offset)).map(|_| f))
            {
                Ok(file) => file.take(record.remaining()),
                Err(e) => {
                    warn!("Unable to open {}: {}, trying next file", path.display(), e);
                    continue;
                }
            };

            if record.resumed {
                info!("Resuming {} at byte {} of {}", record.name(), record.acknowledged_offset, record.declared_size);
            }
            fsm.packet = header;
            fsm.current = Some(Outbound { record, stream });
            break;
        }

        // The receiver asks for each header after the first with a fresh request.
        fsm.files_started += 1;
        if fsm.files_started > 1 {
            fsm.next_state::<AwaitHeaderClear>()
        } else {
            fsm.next_state::<SendHeader>()
        }
    }
}

impl SenderState for SenderFsm<AwaitHeaderClear> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        match fsm.await_reply(&[C, NAK])? {
            Reply::Got(_) => {
                fsm.session.clear_errors();
                fsm.next_state::<SendHeader>()
            }
            Reply::Fault | Reply::Pending => fsm.next_state::<AwaitHeaderClear>(),
        }
    }
}

impl SenderState for SenderFsm<SendHeader> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        fsm.checkpoint()?;
        fsm.channel.write_all(&fsm.packet)?;

        match &fsm.current {
            Some(outbound) if !fsm.closing => {
                info!("Sending file {} ({} bytes)", outbound.record.name(), outbound.record.remaining());
            }
            _ => debug!("Sent: end of batch header"),
        }
        fsm.next_state::<AwaitHeaderAck>()
    }
}

impl SenderState for SenderFsm<AwaitHeaderAck> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        match fsm.await_reply(&[ACK])? {
            Reply::Got(_) => {
                fsm.session.clear_errors();
                if fsm.closing {
                    info!("Transmission complete");
                    return Ok(Step::Complete);
                }
                fsm.next_state::<AwaitDataClear>()
            }
            Reply::Fault => fsm.next_state::<SendHeader>(),
            Reply::Pending => fsm.next_state::<AwaitHeaderAck>(),
        }
    }
}

impl SenderState for SenderFsm<AwaitDataClear> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        match fsm.await_reply(&[C, NAK])? {
            Reply::Got(_) => {
                fsm.session.clear_errors();
                fsm.session.sequence = 1;
                fsm.retransmit = false;
                fsm.next_state::<SendData>()
            }
            Reply::Fault | Reply::Pending => fsm.next_state::<AwaitDataClear>(),
        }
    }
}

impl SenderState for SenderFsm<SendData> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;

        if fsm.retransmit {
            debug!("Retransmitting packet {}", fsm.session.sequence);
        } else {
            let block_size = fsm.block_size;
            let mut chunk = vec![0u8; block_size.len()];
            let bytes_read = read_chunk(&mut fsm.outbound()?.stream, &mut chunk)?;

            if bytes_read == 0 {
                debug!("EOF");
                return fsm.next_state::<SendEot>();
            }

            fsm.packet = packet::build_data_packet(
                fsm.session.sequence,
                &chunk[..bytes_read],
                block_size,
                fsm.session.mode,
            );
            fsm.chunk_len = bytes_read;
        }

        fsm.checkpoint()?;
        fsm.channel.write_all(&fsm.packet)?;
        debug!("Sent: packet {} ({} bytes)", fsm.session.sequence, fsm.chunk_len);

        fsm.next_state::<AwaitDataAck>()
    }
}

impl SenderState for SenderFsm<AwaitDataAck> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        match fsm.await_reply(&[ACK, NAK])? {
            Reply::Got(ACK) => {
                let chunk_len = fsm.chunk_len as u64;
                let outbound = fsm.outbound()?;
                outbound.record.acknowledged_offset += chunk_len;
                let record = outbound.record.clone();
                if let Err(e) = fsm.store.store(&record, record.acknowledged_offset) {
                    // Without the marker the next session would send these bytes again.
                    error!("Unable to save progress of {}: {}", record.path.display(), e);
                    return Err(fsm.abort(e.into()));
                }

                fsm.session.clear_errors();
                fsm.session.sequence = fsm.session.sequence.wrapping_add(1);
                fsm.retransmit = false;
                fsm.next_state::<SendData>()
            }
            Reply::Got(_) => {
                fsm.session.fault(TransferError::Rejected)?;
                fsm.retransmit = true;
                fsm.next_state::<SendData>()
            }
            Reply::Fault => {
                fsm.retransmit = true;
                fsm.next_state::<SendData>()
            }
            Reply::Pending => fsm.next_state::<AwaitDataAck>(),
        }
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<Step<dyn SenderState>> {
        let mut fsm = *self;
        fsm.send(&[EOT])?;
        debug!("Sent: EOT");

        loop {
            match fsm.await_reply(&[ACK])? {
                Reply::Got(_) => break,
                Reply::Fault => return fsm.next_state::<SendEot>(),
                Reply::Pending => continue,
            }
        }

        fsm.session.clear_errors();
        if let Some(outbound) = fsm.current.take() {
            info!("File {} successfully transmitted", outbound.record.name());
            if let Err(e) = fsm.finalize(&outbound.record) {
                error!("Unable to finalize {}: {}", outbound.record.path.display(), e);
                return Err(fsm.abort(e.into()));
            }
        }
        fsm.next_state::<SelectFile>()
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl SenderFsm<NegotiateMode> {
    pub fn new(
        channel: Box<dyn Channel>,
        files: Vec<PathBuf>,
        config: &TransferConfig,
        store: MarkerStore,
        preemption: Arc<dyn Preemption>,
    ) -> Box<dyn SenderState> {
        info!("Begin transaction, packet size {}", config.block_size.len());
        Box::new(SenderFsm {
            state: PhantomData::<NegotiateMode>,
            channel,
            session: Session::new(config, preemption),
            store,
            block_size: config.block_size,
            files: files.into(),
            files_started: 0,
            closing: false,
            current: None,
            packet: Vec::new(),
            chunk_len: 0,
            retransmit: false,
        })
    }
}

/// Drive a sender until the batch is closed or the transfer aborts.
pub fn run(mut fsm: Box<dyn SenderState>) -> Result<()> {
    loop {
        match fsm.step() {
            Ok(Step::Next(next)) => fsm = next,
            Ok(Step::Complete) => return Ok(()),
            Err(e) => {
                error!("Send aborted: {}", e);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Fill `buf` from `stream`, short only at end of file.
fn read_chunk(stream: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FsLock;
    use crate::serial::MockChannel;
    use crate::session::{NeverPreempted, Workers};
    use std::path::Path;
    use std::time::Duration;

    fn config(block_size: BlockSize) -> TransferConfig {
        TransferConfig {
            block_size,
            read_timeout: Duration::from_millis(10),
            ..TransferConfig::default()
        }
    }

    /// Scripted session where the line goes quiet right after the first
    /// request byte, ending negotiation.
    fn run_sender(
        responses: Vec<u8>,
        expected_writes: Vec<u8>,
        files: Vec<PathBuf>,
        config: &TransferConfig,
    ) -> Result<()> {
        let mut script = Vec::with_capacity(responses.len() + 1);
        for (i, byte) in responses.into_iter().enumerate() {
            script.push(Some(byte));
            if i == 0 {
                script.push(None);
            }
        }
        run_scripted(script, expected_writes, files, config, Arc::new(NeverPreempted))
    }

    fn run_scripted(
        responses: Vec<Option<u8>>,
        expected_writes: Vec<u8>,
        files: Vec<PathBuf>,
        config: &TransferConfig,
        preemption: Arc<dyn Preemption>,
    ) -> Result<()> {
        let mock = Box::new(MockChannel::new(responses, expected_writes));
        let store = MarkerStore::new(config.prefixes(), FsLock::new());
        run(SenderFsm::new(mock, files, config, store, preemption))
    }

    fn header(name: &str, remaining: u64, block: BlockSize, mode: TransferMode) -> Vec<u8> {
        packet::build_header_packet(name, remaining, block, mode).unwrap()
    }

    fn marker(dir: &Path, name: &str) -> Option<String> {
        std::fs::read_to_string(dir.join(format!("${}", name))).ok()
    }

    #[test]
    fn test_sender_full_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260101");
        std::fs::write(&file, b"Test data").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![C, ACK, C, ACK, ACK, C, ACK];

        let mut expected_writes = header("20260101", 9, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, b"Test data", BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file.clone()], &cfg).expect("Transfer failed");

        // Written today: kept in place with a full-size marker
        assert!(file.exists());
        assert_eq!(marker(dir.path(), "20260101").as_deref(), Some("9"));
    }

    #[test]
    fn test_sender_checksum_mode_on_nak() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260102");
        std::fs::write(&file, b"meteo").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Checksum8;

        let responses = vec![NAK, ACK, C, ACK, ACK, C, ACK];

        let mut expected_writes = header("20260102", 5, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, b"meteo", BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
    }

    #[test]
    fn test_sender_multiple_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260103");
        let content: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
        std::fs::write(&file, &content).unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let mut responses = vec![C, ACK, C];
        responses.extend([ACK; 3]);
        responses.extend([ACK, C, ACK]);

        let mut expected_writes = header("20260103", 300, BlockSize::Standard, mode);
        for (i, chunk) in content.chunks(128).enumerate() {
            expected_writes.extend(packet::build_data_packet(i as u8 + 1, chunk, BlockSize::Standard, mode));
        }
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
        assert_eq!(marker(dir.path(), "20260103").as_deref(), Some("300"));
    }

    #[test]
    fn test_sender_multiple_files_wait_for_clear() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, b"first").unwrap();
        std::fs::write(&second, b"second").unwrap();
        let cfg = config(BlockSize::OneK);
        let mode = TransferMode::Crc16;

        let responses = vec![
            C,
            ACK, C, ACK, ACK,
            C, ACK, C, ACK, ACK,
            C, ACK,
        ];

        let mut expected_writes = header("first", 5, BlockSize::OneK, mode);
        expected_writes.extend(packet::build_data_packet(1, b"first", BlockSize::OneK, mode));
        expected_writes.push(EOT);
        expected_writes.extend(header("second", 6, BlockSize::OneK, mode));
        expected_writes.extend(packet::build_data_packet(1, b"second", BlockSize::OneK, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::OneK, mode));

        run_sender(responses, expected_writes, vec![first, second], &cfg).expect("Transfer failed");
    }

    #[test]
    fn test_sender_empty_file_sends_header_and_eot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("empty");
        std::fs::write(&file, b"").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![C, ACK, C, ACK, C, ACK];

        let mut expected_writes = header("empty", 0, BlockSize::Standard, mode);
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
        assert_eq!(marker(dir.path(), "empty").as_deref(), Some("0"));
    }

    #[test]
    fn test_sender_nak_retry_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("retry");
        std::fs::write(&file, b"retry").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let mut responses = vec![C, ACK, C];
        responses.extend([NAK; 4]);
        responses.extend([ACK, ACK, C, ACK]);

        let data = packet::build_data_packet(1, b"retry", BlockSize::Standard, mode);
        let mut expected_writes = header("retry", 5, BlockSize::Standard, mode);
        for _ in 0..5 {
            expected_writes.extend(&data);
        }
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
    }

    #[test]
    fn test_sender_nak_exhausts_budget() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("retry");
        std::fs::write(&file, b"retry").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let mut responses = vec![C, ACK, C];
        responses.extend([NAK; 5]);

        let data = packet::build_data_packet(1, b"retry", BlockSize::Standard, mode);
        let mut expected_writes = header("retry", 5, BlockSize::Standard, mode);
        for _ in 0..5 {
            expected_writes.extend(&data);
        }

        let result = run_sender(responses, expected_writes, vec![file], &cfg);
        assert!(matches!(result, Err(TransferError::TooManyErrors { errors: 5 })));
        assert_eq!(marker(dir.path(), "retry"), None);
    }

    #[test]
    fn test_sender_peer_cancel_during_data() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cancel");
        std::fs::write(&file, vec![1u8; 400]).unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![C, ACK, C, CAN, CAN];

        let mut expected_writes = header("cancel", 400, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, &[1u8; 128], BlockSize::Standard, mode));

        let result = run_sender(responses, expected_writes, vec![file], &cfg);
        assert!(matches!(result, Err(TransferError::Cancelled(CancelOrigin::Peer))));
    }

    #[test]
    fn test_sender_resumes_after_interruption() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260104");
        let content: Vec<u8> = (0..300u32).map(|i| (i * 7 % 251) as u8).collect();
        std::fs::write(&file, &content).unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        // First session: one block acknowledged, then the peer cancels.
        let responses = vec![C, ACK, C, ACK, CAN, CAN];
        let mut expected_writes = header("20260104", 300, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, &content[..128], BlockSize::Standard, mode));
        expected_writes.extend(packet::build_data_packet(2, &content[128..256], BlockSize::Standard, mode));

        let result = run_sender(responses, expected_writes, vec![file.clone()], &cfg);
        assert!(matches!(result, Err(TransferError::Cancelled(CancelOrigin::Peer))));
        assert_eq!(marker(dir.path(), "20260104").as_deref(), Some("128"));

        // Second session picks up at byte 128 with a fresh sequence.
        let responses = vec![C, ACK, C, ACK, ACK, ACK, C, ACK];
        let mut expected_writes = header("20260104", 172, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, &content[128..256], BlockSize::Standard, mode));
        expected_writes.extend(packet::build_data_packet(2, &content[256..], BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
        assert_eq!(marker(dir.path(), "20260104").as_deref(), Some("300"));
    }

    #[test]
    fn test_sender_skips_already_sent_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260105");
        std::fs::write(&file, b"all done").unwrap();
        std::fs::write(dir.path().join("$20260105"), "8").unwrap();
        let cfg = config(BlockSize::Standard);

        let responses = vec![C, ACK];
        let expected_writes = packet::build_terminator_packet(BlockSize::Standard, TransferMode::Crc16);

        run_sender(responses, expected_writes, vec![file.clone()], &cfg).expect("Transfer failed");
        assert!(file.exists());
    }

    #[test]
    fn test_sender_skips_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let file = dir.path().join("present");
        std::fs::write(&file, b"x").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![C, ACK, C, ACK, ACK, C, ACK];
        let mut expected_writes = header("present", 1, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, b"x", BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![missing, file], &cfg).expect("Transfer failed");
    }

    #[test]
    fn test_sender_resends_header_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lost");
        std::fs::write(&file, b"lost ack").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![Some(C), None, None, Some(ACK), Some(C), Some(ACK), Some(ACK), Some(C), Some(ACK)];

        let head = header("lost", 8, BlockSize::Standard, mode);
        let mut expected_writes = head.clone();
        expected_writes.extend(&head);
        expected_writes.extend(packet::build_data_packet(1, b"lost ack", BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_scripted(responses, expected_writes, vec![file], &cfg, Arc::new(NeverPreempted))
            .expect("Transfer failed");
    }

    #[test]
    fn test_sender_uses_latest_queued_request() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("late");
        std::fs::write(&file, b"late").unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Checksum8;

        // Started after the receiver gave up on CRC: C, C, NAK are all waiting.
        let responses = vec![
            Some(C), Some(C), Some(NAK), None,
            Some(ACK), Some(NAK), Some(ACK), Some(ACK), Some(NAK), Some(ACK),
        ];

        let mut expected_writes = header("late", 4, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, b"late", BlockSize::Standard, mode));
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_scripted(responses, expected_writes, vec![file], &cfg, Arc::new(NeverPreempted))
            .expect("Transfer failed");
    }

    #[test]
    fn test_sender_aborts_when_progress_cannot_be_saved() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("20260110");
        std::fs::write(&file, vec![9u8; 300]).unwrap();
        // A directory in the marker's place makes every store fail.
        std::fs::create_dir(dir.path().join("$20260110")).unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Crc16;

        let responses = vec![C, ACK, C, ACK];
        let mut expected_writes = header("20260110", 300, BlockSize::Standard, mode);
        expected_writes.extend(packet::build_data_packet(1, &[9u8; 128], BlockSize::Standard, mode));
        expected_writes.extend([CAN, CAN]);

        let result = run_sender(responses, expected_writes, vec![file.clone()], &cfg);
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(file.exists());
    }

    #[test]
    fn test_sender_negotiation_gives_up() {
        let cfg = config(BlockSize::Standard);
        let responses = vec![None, Some(0x55), None, None, None];

        let result = run_scripted(responses, vec![], vec![], &cfg, Arc::new(NeverPreempted));
        assert!(matches!(result, Err(TransferError::TooManyErrors { errors: 5 })));
    }

    #[test]
    fn test_sender_preempted_sends_cancel() {
        let workers = Workers::new();
        let _transfer = workers.enter();
        let _menu = workers.enter();
        let cfg = config(BlockSize::Standard);

        let result = run_scripted(vec![], vec![CAN, CAN], vec![], &cfg, Arc::new(workers.clone()));
        assert!(matches!(result, Err(TransferError::Cancelled(CancelOrigin::Local))));
    }

    #[test]
    fn test_sender_sequence_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("long");
        let content: Vec<u8> = (0..257 * 128).map(|i| (i / 128) as u8).collect();
        std::fs::write(&file, &content).unwrap();
        let cfg = config(BlockSize::Standard);
        let mode = TransferMode::Checksum8;

        let mut responses = vec![NAK, ACK, C];
        responses.extend(std::iter::repeat_n(ACK, 257));
        responses.extend([ACK, C, ACK]);

        let mut expected_writes = header("long", content.len() as u64, BlockSize::Standard, mode);
        for (i, chunk) in content.chunks(128).enumerate() {
            let sequence = (i + 1) as u8;
            expected_writes.extend(packet::build_data_packet(sequence, chunk, BlockSize::Standard, mode));
        }
        expected_writes.push(EOT);
        expected_writes.extend(packet::build_terminator_packet(BlockSize::Standard, mode));

        run_sender(responses, expected_writes, vec![file], &cfg).expect("Transfer failed");
    }

    #[test]
    fn test_read_chunk_fills_until_eof() {
        let mut stream: &[u8] = b"abcdef";
        let mut buf = [0u8; 4];
        assert_eq!(read_chunk(&mut stream, &mut buf).unwrap(), 4);
        assert_eq!(read_chunk(&mut stream, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut stream, &mut buf).unwrap(), 0);
    }
}
