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

use std::io::{ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort as SerialPortTrait, StopBits};

// ============================================================================
// Channel Trait
// ============================================================================

/// Byte-oriented duplex link used by the sender and receiver.
///
/// `read_timeout` waits at most `timeout` for data. Running out of time is reported
/// as `ErrorKind::TimedOut` (or `Ok(0)`), never by blocking forever.
pub trait Channel: Send {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

/// Read one byte, `None` when nothing arrived in time.
pub fn read_byte(channel: &mut dyn Channel, timeout: Duration) -> std::io::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match channel.read_timeout(&mut buf, timeout) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(buf[0])),
        Err(e) if is_timeout(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Fill `buf`, waiting at most `timeout` for each chunk. `false` when the peer
/// went quiet before the buffer was full.
pub fn read_exact_timeout(channel: &mut dyn Channel, buf: &mut [u8], timeout: Duration) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match channel.read_timeout(&mut buf[filled..], timeout) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Line settings for [`RealSerialPort::open`].
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

/// Serial line to the modem, via the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
    timeout: Duration,
}

impl RealSerialPort {
    pub fn open(settings: &SerialSettings) -> Result<Self, serialport::Error> {
        let timeout = Duration::from_millis(100);
        let port = serialport::new(&settings.port_name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(timeout)
            .open()?;

        // Whatever the modem sent before we were listening is not part of a transfer.
        port.clear(ClearBuffer::Input)?;
        Ok(RealSerialPort { port, timeout })
    }
}

impl Channel for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout).map_err(std::io::Error::other)?;
            self.timeout = timeout;
        }
        self.port.read(buf)
    }
}

// ============================================================================
// In-memory Loopback
// ============================================================================

/// One end of an in-memory duplex pipe, see [`loopback`].
pub struct LoopbackChannel {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Two connected channel ends: bytes written to one are read from the other.
pub fn loopback() -> (LoopbackChannel, LoopbackChannel) {
    let (a_tx, b_rx) = mpsc::channel();
    let (b_tx, a_rx) = mpsc::channel();
    (
        LoopbackChannel { tx: a_tx, rx: a_rx },
        LoopbackChannel { tx: b_tx, rx: b_rx },
    )
}

impl Channel for LoopbackChannel {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        for &byte in buf {
            self.tx.send(byte)
                .map_err(|_| std::io::Error::new(ErrorKind::BrokenPipe, "Loopback peer closed"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        buf[0] = match self.rx.recv_timeout(timeout) {
            Ok(byte) => byte,
            Err(RecvTimeoutError::Timeout) => {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "Loopback timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(std::io::Error::new(ErrorKind::BrokenPipe, "Loopback peer closed"));
            }
        };

        let mut bytes_read = 1;
        while bytes_read < buf.len() {
            match self.rx.try_recv() {
                Ok(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                }
                Err(_) => break,
            }
        }
        Ok(bytes_read)
    }
}

// ============================================================================
// Mock Channel for Testing
// ============================================================================

/// Scripted peer. Each entry is a byte to hand out or `None` for one timed-out
/// read. On drop it checks that the script ran out and that exactly
/// `expected_writes` went the other way.
#[cfg(test)]
pub struct MockChannel {
    script: std::collections::VecDeque<Option<u8>>,
    consumed: usize,
    written: Vec<u8>,
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockChannel {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockChannel {
            script: responses.into(),
            consumed: 0,
            written: Vec::new(),
            expected_writes,
        }
    }
}

#[cfg(test)]
impl Channel for MockChannel {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
        let timed_out = || std::io::Error::new(ErrorKind::TimedOut, "script: timeout");
        match self.script.front() {
            None => return Err(timed_out()),
            Some(None) => {
                self.script.pop_front();
                self.consumed += 1;
                return Err(timed_out());
            }
            Some(Some(_)) => {}
        }

        // Hand out bytes up to the next scripted timeout.
        let mut n = 0;
        while n < buf.len() {
            let Some(Some(byte)) = self.script.front().copied() else { break };
            self.script.pop_front();
            self.consumed += 1;
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
impl Drop for MockChannel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        assert!(
            self.script.is_empty(),
            "{} scripted responses left unread after {}",
            self.script.len(),
            self.consumed
        );
        assert_eq!(
            self.written, self.expected_writes,
            "unexpected writes\nexpected {:02X?}\n     got {:02X?}",
            self.expected_writes, self.written
        );
    }
}
