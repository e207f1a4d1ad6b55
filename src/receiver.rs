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

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::{CancelOrigin, Result, TransferError};
use crate::packet::{self, BlockSize, HeaderInfo, Packet, TransferMode};
use crate::protocol::{self, *};
use crate::serial::{self as channel, Channel};
use crate::session::{Preemption, Session, Step};

// ============================================================================
// States
// ============================================================================

pub struct RequestMode;
pub struct AwaitPacket;
pub struct ReceivePacket;

// ============================================================================
// FSM Structure
// ============================================================================

/// File currently being written.
struct Inbound {
    path: PathBuf,
    file: File,
    declared_len: Option<u64>,
    received: u64,
    packets: u64,
}

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    channel: Box<dyn Channel>,
    session: Session,
    output_dir: PathBuf,
    current: Option<Inbound>,
    block_size: BlockSize,
    negotiating: bool,
    requests: u32,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>>;
}

// ============================================================================
// Helper to transition states
// ============================================================================

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            channel: self.channel,
            session: self.session,
            output_dir: self.output_dir,
            current: self.current,
            block_size: self.block_size,
            negotiating: self.negotiating,
            requests: self.requests,
        })
    }

    fn next_state<T: 'static>(self) -> Result<Step<dyn ReceiverState>>
    where
        ReceiverFsm<T>: ReceiverState,
    {
        let next: Box<dyn ReceiverState> = self.transition::<T>();
        Ok(Step::Next(next))
    }

    /// Tell the sender to give up. Best effort, the transfer is over either way.
    fn cancel_peer(&mut self) {
        match self.channel.write_all(&[CAN, CAN]) {
            Ok(()) => warn!("Cancel transmission"),
            Err(e) => warn!("Unable to send CAN: {}", e),
        }
    }

    /// Abort with `e`, cancelling the sender first.
    fn abort(&mut self, e: TransferError) -> TransferError {
        self.cancel_peer();
        e
    }

    fn checkpoint(&mut self) -> Result<()> {
        if self.session.cancel_requested() {
            warn!("Pre-empted, cancelling reception");
            let e = TransferError::Cancelled(CancelOrigin::Local);
            return Err(self.abort(e));
        }
        Ok(())
    }

    fn send(&mut self, byte: u8) -> Result<()> {
        self.checkpoint()?;
        self.channel.write_all(&[byte])?;
        debug!("Sent: {}", protocol::name(byte));
        Ok(())
    }

    /// Ask for the next header or data stream in the negotiated mode.
    fn request_next(&mut self) -> Result<()> {
        match self.session.mode {
            TransferMode::Crc16 => self.send(C),
            TransferMode::Checksum8 => self.send(NAK),
        }
    }

    fn poll(&mut self) -> Result<Option<u8>> {
        self.checkpoint()?;
        Ok(channel::read_byte(self.channel.as_mut(), self.session.read_timeout)?)
    }

    /// Count a fault, cancelling the sender once the budget is spent.
    fn fault(&mut self, cause: TransferError) -> Result<()> {
        if let Err(e) = self.session.fault(cause) {
            return Err(self.abort(e));
        }
        Ok(())
    }

    /// Create (or extend) the announced file inside the output directory.
    fn open_destination(&self, header: &HeaderInfo) -> std::io::Result<(PathBuf, File)> {
        let name = Path::new(&header.name).file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid file name: {:?}", header.name),
            )
        })?;
        let path = self.output_dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((path, file))
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<RequestMode> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;
        let retry_limit = fsm.session.retry_limit;

        if fsm.session.mode == TransferMode::Crc16 && fsm.requests >= (retry_limit / 2).max(1) {
            info!("No answer to CRC request, using standard checksum");
            fsm.session.mode = TransferMode::Checksum8;
            fsm.requests = 0;
        }
        if fsm.session.mode == TransferMode::Checksum8 && fsm.requests >= retry_limit {
            let e = TransferError::TooManyErrors { errors: fsm.requests };
            return Err(fsm.abort(e));
        }

        fsm.request_next()?;
        fsm.requests += 1;
        fsm.next_state::<AwaitPacket>()
    }
}

impl ReceiverState for ReceiverFsm<AwaitPacket> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;

        let byte = match fsm.poll()? {
            Some(byte) => byte,
            None if fsm.negotiating => return fsm.next_state::<RequestMode>(),
            None => {
                // Prod the sender: NAK means resend, or go ahead when it waits to be cleared.
                fsm.fault(TransferError::Timeout)?;
                fsm.send(NAK)?;
                return fsm.next_state::<AwaitPacket>();
            }
        };

        if let Some(block_size) = packet::block_size_for_marker(byte) {
            debug!("Received: {}", protocol::name(byte));
            fsm.negotiating = false;
            fsm.session.reset_cancel();
            fsm.block_size = block_size;
            return fsm.next_state::<ReceivePacket>();
        }

        match byte {
            EOT => {
                debug!("Received: EOT");
                fsm.session.reset_cancel();
                if let Some(inbound) = fsm.current.take() {
                    match inbound.shortfall() {
                        Some(missing) => warn!(
                            "File {} ended early: {} of {} bytes received, {} missing",
                            inbound.path.display(),
                            inbound.received,
                            inbound.received + missing,
                            missing
                        ),
                        None => info!("Received {} ({} bytes)", inbound.path.display(), inbound.received),
                    }
                }
                fsm.send(ACK)?;
                fsm.request_next()?;
                fsm.session.clear_errors();
            }
            CAN => {
                debug!("Received: CAN");
                fsm.session.peer_cancel()?;
            }
            other => fsm.fault(TransferError::UnexpectedByte(other))?,
        }
        fsm.next_state::<AwaitPacket>()
    }
}

impl ReceiverState for ReceiverFsm<ReceivePacket> {
    fn step(self: Box<Self>) -> Result<Step<dyn ReceiverState>> {
        let mut fsm = *self;
        let mode = fsm.session.mode;

        let mut body = vec![0u8; packet::body_len(fsm.block_size, mode)];
        if !channel::read_exact_timeout(fsm.channel.as_mut(), &mut body, fsm.session.read_timeout)? {
            fsm.fault(TransferError::Timeout)?;
            fsm.send(NAK)?;
            return fsm.next_state::<AwaitPacket>();
        }
        let packet = Packet::from_body(fsm.block_size, &body, mode);

        if !packet.sequence_intact() {
            fsm.fault(TransferError::SequenceMismatch {
                expected: 0xFF - packet.sequence,
                got: packet.complement,
            })?;
            fsm.send(NAK)?;
            return fsm.next_state::<AwaitPacket>();
        }

        let expected = if fsm.current.is_some() { fsm.session.sequence } else { 0 };
        if packet.sequence != expected {
            // Already have it: our ACK was lost, so acknowledge it again.
            fsm.fault(TransferError::SequenceMismatch { expected, got: packet.sequence })?;
            fsm.send(ACK)?;
            let header_resent = packet.sequence == 0
                && fsm.current.as_ref().is_some_and(|inbound| inbound.packets == 0);
            if header_resent {
                fsm.request_next()?;
            }
            return fsm.next_state::<AwaitPacket>();
        }

        if let Err(e) = packet.verify(mode) {
            fsm.fault(e)?;
            fsm.send(NAK)?;
            return fsm.next_state::<AwaitPacket>();
        }

        debug!("Packet {} <--", packet.sequence);
        if fsm.current.is_none() {
            let Some(header) = packet::parse_header(&packet.payload) else {
                fsm.send(ACK)?;
                info!("End of transmission");
                return Ok(Step::Complete);
            };

            let (path, file) = match fsm.open_destination(&header) {
                Ok(opened) => opened,
                Err(e) => {
                    error!("Unable to open {}: {}", header.name, e);
                    return Err(fsm.abort(e.into()));
                }
            };
            match header.length {
                Some(len) => info!("Receiving file {} ({} bytes)", path.display(), len),
                None => info!("Receiving file {} (length not announced)", path.display()),
            }
            fsm.current = Some(Inbound {
                path,
                file,
                declared_len: header.length,
                received: 0,
                packets: 0,
            });
            fsm.session.sequence = 1;
            fsm.send(ACK)?;
            fsm.request_next()?;
        } else {
            let written = match fsm.current.as_mut() {
                Some(inbound) => inbound.append(&packet.payload),
                None => Ok(()),
            };
            if let Err(e) = written {
                error!("Unable to write received data: {}", e);
                return Err(fsm.abort(e.into()));
            }
            fsm.send(ACK)?;
            fsm.session.sequence = fsm.session.sequence.wrapping_add(1);
        }

        fsm.session.clear_errors();
        fsm.next_state::<AwaitPacket>()
    }
}

impl Inbound {
    /// Append a payload, dropping the pad bytes past the announced length.
    fn append(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let keep = match self.declared_len {
            Some(len) => payload.len().min(usize::try_from(len.saturating_sub(self.received)).unwrap_or(usize::MAX)),
            None => payload.len(),
        };
        self.file.write_all(&payload[..keep])?;
        self.received += keep as u64;
        self.packets += 1;
        Ok(())
    }

    /// Bytes still owed when the sender ends the file, if it announced more.
    fn shortfall(&self) -> Option<u64> {
        self.declared_len
            .map(|len| len.saturating_sub(self.received))
            .filter(|&missing| missing > 0)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

impl ReceiverFsm<RequestMode> {
    pub fn new(
        channel: Box<dyn Channel>,
        output_dir: PathBuf,
        config: &TransferConfig,
        preemption: Arc<dyn Preemption>,
    ) -> Box<dyn ReceiverState> {
        Box::new(ReceiverFsm {
            state: PhantomData::<RequestMode>,
            channel,
            session: Session::new(config, preemption),
            output_dir,
            current: None,
            block_size: BlockSize::Standard,
            negotiating: true,
            requests: 0,
        })
    }
}

/// Drive a receiver until the batch terminator arrives or the transfer aborts.
pub fn run(mut fsm: Box<dyn ReceiverState>) -> Result<()> {
    loop {
        match fsm.step() {
            Ok(Step::Next(next)) => fsm = next,
            Ok(Step::Complete) => return Ok(()),
            Err(e) => {
                error!("Receive aborted: {}", e);
                return Err(e);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
