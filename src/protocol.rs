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

//! YMODEM protocol constants

/// Start of header - begins a packet carrying a 128-byte block
pub const SOH: u8 = 0x01;

/// Start of text - begins a packet carrying a 1024-byte block
pub const STX: u8 = 0x02;

/// End of transmission - sender signals end of current file
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepted the last packet or EOT
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver rejects a packet, or requests checksum mode
pub const NAK: u8 = 0x15;

/// Cancel - two in a row abort the whole batch
pub const CAN: u8 = 0x18;

/// Clear to send - receiver requests CRC mode or the next header/data phase
pub const C: u8 = b'C';

/// Pad byte used to fill the tail of the last data block
pub const PAD: u8 = 0x1A;

/// Human readable name of a control byte, for log output.
pub fn name(byte: u8) -> &'static str {
    match byte {
        SOH => "SOH",
        STX => "STX",
        EOT => "EOT",
        ACK => "ACK",
        NAK => "NAK",
        CAN => "CAN",
        C => "'C'",
        _ => "?",
    }
}
