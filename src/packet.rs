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

//! Packet framing and parsing
//!
//! A packet on the wire is `marker | seq | 0xFF-seq | payload | trailer`, where the
//! marker selects a 128 or 1024 byte payload and the trailer is a single additive
//! checksum byte or a big-endian CRC-16.

use serde::Deserialize;
use tracing::warn;

use crate::checksum::{checksum8, crc16};
use crate::error::{Result, TransferError};
use crate::protocol::{PAD, SOH, STX};

// ============================================================================
// Transfer Mode & Block Size
// ============================================================================

/// Trailer algorithm, negotiated once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Checksum8,
    Crc16,
}

impl TransferMode {
    pub fn trailer_width(self) -> usize {
        match self {
            TransferMode::Checksum8 => 1,
            TransferMode::Crc16 => 2,
        }
    }

    fn trailer(self, payload: &[u8]) -> Vec<u8> {
        match self {
            TransferMode::Checksum8 => vec![checksum8(payload)],
            TransferMode::Crc16 => crc16(payload).to_be_bytes().to_vec(),
        }
    }
}

/// Payload length of a packet, fixed by its marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "u16")]
pub enum BlockSize {
    /// 128 bytes, framed with SOH
    Standard,
    /// 1024 bytes, framed with STX
    #[default]
    OneK,
}

impl BlockSize {
    pub fn len(self) -> usize {
        match self {
            BlockSize::Standard => 128,
            BlockSize::OneK => 1024,
        }
    }

    pub fn marker(self) -> u8 {
        match self {
            BlockSize::Standard => SOH,
            BlockSize::OneK => STX,
        }
    }
}

impl TryFrom<u16> for BlockSize {
    type Error = String;

    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        match value {
            128 => Ok(BlockSize::Standard),
            1024 => Ok(BlockSize::OneK),
            _ => Err(format!("Invalid block size: {}. Must be 128 or 1024", value)),
        }
    }
}

/// Block size announced by a marker byte, `None` if it is not a packet marker.
pub fn block_size_for_marker(marker: u8) -> Option<BlockSize> {
    match marker {
        SOH => Some(BlockSize::Standard),
        STX => Some(BlockSize::OneK),
        _ => None,
    }
}

/// Bytes that follow the marker: both sequence bytes, the payload and the trailer.
pub fn body_len(block: BlockSize, mode: TransferMode) -> usize {
    2 + block.len() + mode.trailer_width()
}

// ============================================================================
// Building
// ============================================================================

fn frame(block: BlockSize, sequence: u8, payload: &[u8], mode: TransferMode) -> Vec<u8> {
    debug_assert_eq!(payload.len(), block.len());
    let mut packet = Vec::with_capacity(1 + body_len(block, mode));
    packet.push(block.marker());
    packet.push(sequence);
    packet.push(0xFF - sequence);
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&mode.trailer(payload));
    packet
}

/// Sequence 0 packet announcing a file: `name NUL remaining-length`, zero padded.
pub fn build_header_packet(
    filename: &str,
    remaining: u64,
    block: BlockSize,
    mode: TransferMode,
) -> Result<Vec<u8>> {
    if filename.is_empty() {
        return Ok(build_terminator_packet(block, mode));
    }

    let mut payload = Vec::with_capacity(block.len());
    payload.extend_from_slice(filename.as_bytes());
    payload.push(0);
    payload.extend_from_slice(remaining.to_string().as_bytes());

    // A trailing NUL must survive so the receiver can find the end of the length.
    if payload.len() >= block.len() {
        return Err(TransferError::HeaderTooLong(filename.to_string()));
    }
    payload.resize(block.len(), 0);
    Ok(frame(block, 0, &payload, mode))
}

/// Sequence 0 packet with an all-zero payload, closing the batch.
pub fn build_terminator_packet(block: BlockSize, mode: TransferMode) -> Vec<u8> {
    frame(block, 0, &vec![0u8; block.len()], mode)
}

/// Data packet for `chunk`, right-padded with the pad byte.
pub fn build_data_packet(sequence: u8, chunk: &[u8], block: BlockSize, mode: TransferMode) -> Vec<u8> {
    debug_assert!(chunk.len() <= block.len());
    let mut payload = chunk.to_vec();
    payload.resize(block.len(), PAD);
    frame(block, sequence, &payload, mode)
}

// ============================================================================
// Parsing
// ============================================================================

/// A packet body read off the wire, after the marker byte.
#[derive(Debug)]
pub struct Packet {
    pub block: BlockSize,
    pub sequence: u8,
    pub complement: u8,
    pub payload: Vec<u8>,
    pub trailer: Vec<u8>,
}

impl Packet {
    /// Split a body of exactly `body_len(block, mode)` bytes.
    pub fn from_body(block: BlockSize, body: &[u8], mode: TransferMode) -> Packet {
        debug_assert_eq!(body.len(), body_len(block, mode));
        let (payload, trailer) = body[2..].split_at(block.len());
        Packet {
            block,
            sequence: body[0],
            complement: body[1],
            payload: payload.to_vec(),
            trailer: trailer.to_vec(),
        }
    }

    /// The sequence byte and its complement agree.
    pub fn sequence_intact(&self) -> bool {
        self.sequence == 0xFF - self.complement
    }

    pub fn verify(&self, mode: TransferMode) -> Result<()> {
        verify(&self.payload, &self.trailer, mode)
    }
}

/// Recompute the trailer for `payload` and compare against the received one,
/// reporting a mismatch in the log.
pub fn verify(payload: &[u8], trailer: &[u8], mode: TransferMode) -> Result<()> {
    let got = match mode {
        TransferMode::Checksum8 => u16::from(checksum8(payload)),
        TransferMode::Crc16 => crc16(payload),
    };
    let expected = match (mode, trailer) {
        (TransferMode::Checksum8, [sum]) => u16::from(*sum),
        (TransferMode::Crc16, [hi, lo]) => u16::from_be_bytes([*hi, *lo]),
        _ => {
            warn!("Trailer of {} bytes does not fit {:?}", trailer.len(), mode);
            return Err(TransferError::ChecksumMismatch { expected: 0, got });
        }
    };

    if expected != got {
        warn!("Checksum mismatch: expected {:#06x}, got {:#06x}", expected, got);
        return Err(TransferError::ChecksumMismatch { expected, got });
    }
    Ok(())
}

/// File announced by a header payload.
#[derive(Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub name: String,
    pub length: Option<u64>,
}

/// Parse a header payload. `None` means the batch terminator (empty name).
pub fn parse_header(payload: &[u8]) -> Option<HeaderInfo> {
    let mut fields = payload.split(|&b| b == 0);
    let name = fields.next().filter(|n| !n.is_empty())?;
    let attributes = fields.next().unwrap_or_default();

    // Length, then optional modification time and mode separated by spaces.
    let length = std::str::from_utf8(attributes)
        .ok()
        .and_then(|a| a.split_whitespace().next())
        .and_then(|l| l.parse().ok());

    Some(HeaderInfo {
        name: String::from_utf8_lossy(name).into_owned(),
        length,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SOH;

    #[test]
    fn test_data_packet_layout() {
        let packet = build_data_packet(3, b"abc", BlockSize::Standard, TransferMode::Checksum8);
        assert_eq!(packet.len(), 3 + 128 + 1);
        assert_eq!(&packet[0..3], &[SOH, 3, 0xFC]);
        assert_eq!(&packet[3..6], b"abc");
        assert!(packet[6..131].iter().all(|&b| b == PAD));

        let mut payload = b"abc".to_vec();
        payload.resize(128, PAD);
        assert_eq!(packet[131], checksum8(&payload));
    }

    #[test]
    fn test_data_packet_crc_trailer_is_big_endian() {
        let chunk = vec![0x55u8; 1024];
        let packet = build_data_packet(255, &chunk, BlockSize::OneK, TransferMode::Crc16);
        assert_eq!(packet.len(), 3 + 1024 + 2);
        assert_eq!(&packet[0..3], &[STX, 255, 0]);
        let crc = crc16(&chunk);
        assert_eq!(packet[1027], (crc >> 8) as u8);
        assert_eq!(packet[1028], (crc & 0xFF) as u8);
    }

    #[test]
    fn test_header_packet_payload() {
        let packet = build_header_packet("20260101", 4200, BlockSize::Standard, TransferMode::Crc16).unwrap();
        assert_eq!(&packet[0..3], &[SOH, 0, 0xFF]);
        assert_eq!(&packet[3..16], b"20260101\x004200");
        assert!(packet[16..131].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_header_packet_rejects_oversized_name() {
        let name = "x".repeat(125);
        let err = build_header_packet(&name, 1000, BlockSize::Standard, TransferMode::Crc16).unwrap_err();
        assert!(matches!(err, TransferError::HeaderTooLong(_)));
        assert!(build_header_packet(&name, 1000, BlockSize::OneK, TransferMode::Crc16).is_ok());
    }

    #[test]
    fn test_terminator_is_all_zero() {
        let packet = build_terminator_packet(BlockSize::OneK, TransferMode::Crc16);
        assert_eq!(&packet[0..3], &[STX, 0, 0xFF]);
        assert!(packet[3..1027].iter().all(|&b| b == 0));
        assert_eq!(parse_header(&packet[3..1027]), None);
    }

    #[test]
    fn test_empty_name_closes_batch() {
        let header = build_header_packet("", 0, BlockSize::Standard, TransferMode::Checksum8).unwrap();
        assert_eq!(header, build_terminator_packet(BlockSize::Standard, TransferMode::Checksum8));
    }

    #[test]
    fn test_parse_header_fields() {
        let mut payload = b"20260101\x00512 14500000000 100644".to_vec();
        payload.resize(128, 0);
        let info = parse_header(&payload).unwrap();
        assert_eq!(info.name, "20260101");
        assert_eq!(info.length, Some(512));

        let mut payload = b"log.txt\x00".to_vec();
        payload.resize(128, 0);
        let info = parse_header(&payload).unwrap();
        assert_eq!(info.name, "log.txt");
        assert_eq!(info.length, None);
    }

    #[test]
    fn test_block_size_for_marker() {
        assert_eq!(block_size_for_marker(SOH), Some(BlockSize::Standard));
        assert_eq!(block_size_for_marker(STX), Some(BlockSize::OneK));
        assert_eq!(block_size_for_marker(0x04), None);
        assert_eq!(body_len(BlockSize::Standard, TransferMode::Checksum8), 131);
        assert_eq!(body_len(BlockSize::OneK, TransferMode::Crc16), 1028);
    }

    #[test]
    fn test_packet_from_body_and_verify() {
        let wire = build_data_packet(7, b"sample", BlockSize::Standard, TransferMode::Crc16);
        let packet = Packet::from_body(BlockSize::Standard, &wire[1..], TransferMode::Crc16);
        assert_eq!(packet.sequence, 7);
        assert!(packet.sequence_intact());
        assert!(packet.verify(TransferMode::Crc16).is_ok());

        let mut corrupted = wire.clone();
        corrupted[10] ^= 0xFF;
        let packet = Packet::from_body(BlockSize::Standard, &corrupted[1..], TransferMode::Crc16);
        assert!(matches!(
            packet.verify(TransferMode::Crc16),
            Err(TransferError::ChecksumMismatch { .. })
        ));
        let wrong_width = verify(&packet.payload, &packet.trailer, TransferMode::Checksum8);
        assert!(matches!(wrong_width, Err(TransferError::ChecksumMismatch { expected: 0, .. })));
    }

    #[test]
    fn test_block_size_deserialize() {
        assert_eq!(BlockSize::try_from(128), Ok(BlockSize::Standard));
        assert_eq!(BlockSize::try_from(1024), Ok(BlockSize::OneK));
        assert!(BlockSize::try_from(512).is_err());
    }
}
