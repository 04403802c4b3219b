// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-exact wire framing for the BSL protocol (spec §3, §6): command
//! frames, address frames, and the two shapes of count/data frame (one for
//! writes, one for reads). Every function here does exactly one
//! request/response exchange and raises a typed [`BslError`] the moment the
//! target deviates from the expected ACK pattern — there is no retry below
//! `sync`/`detect_uart_mode`.

use std::time::Duration;

use crate::error::{BslError, Result, Stage};
use crate::transport::{receive_with_mode, send_with_mode, Transport, UartMode};

pub const SYNCH: u8 = 0x7F;
pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

pub const GET: u8 = 0x00;
pub const READ: u8 = 0x11;
pub const GO: u8 = 0x21;
pub const WRITE: u8 = 0x31;
pub const ERASE: u8 = 0x43;

pub const PFLASH_START: u64 = 0x8000;
pub const PFLASH_BLOCKSIZE: u64 = 1024;

pub const FLASH_PAGE_SIZE: usize = 128;
pub const MAX_WRITE_CHUNK: usize = 128;
pub const MAX_READ_CHUNK: usize = 256;

fn recv_byte(transport: &mut dyn Transport, mode: UartMode) -> Result<u8> {
    let bytes = receive_with_mode(transport, mode, 1)?;
    Ok(bytes[0])
}

/// Reads one byte and requires it to be `ACK`. A `NACK` here is a protocol
/// error everywhere except `sync` and `mem_check`, which read the raw byte
/// themselves instead of calling this.
pub fn expect_ack(transport: &mut dyn Transport, mode: UartMode, stage: Stage) -> Result<()> {
    let byte = recv_byte(transport, mode)?;
    if byte == ACK {
        Ok(())
    } else {
        Err(BslError::AckExpected { stage, actual: byte })
    }
}

/// Sends a command frame `[op, ~op]` and expects `ACK`.
pub fn send_command(transport: &mut dyn Transport, mode: UartMode, opcode: u8) -> Result<()> {
    send_with_mode(transport, mode, &[opcode, !opcode])?;
    expect_ack(transport, mode, Stage::CmdOpcode)
}

/// Sends a 4-byte big-endian address frame plus its XOR checksum, and
/// expects `ACK`.
pub fn send_address(transport: &mut dyn Transport, mode: UartMode, addr: u32) -> Result<()> {
    let bytes = addr.to_be_bytes();
    let chk = bytes.iter().fold(0u8, |acc, b| acc ^ b);
    let mut frame = Vec::with_capacity(5);
    frame.extend_from_slice(&bytes);
    frame.push(chk);
    send_with_mode(transport, mode, &frame)?;
    expect_ack(transport, mode, Stage::Address)
}

/// Builds a write-style count/data frame: `[N-1, data.., XOR(N-1, data..)]`,
/// `1 <= data.len() <= 128`. Sector erase uses this same shape with a
/// one-byte payload (the sector index); mass erase does not (see
/// [`MASS_ERASE_TRIGGER`]).
pub fn build_write_frame(data: &[u8]) -> Vec<u8> {
    debug_assert!(!data.is_empty() && data.len() <= MAX_WRITE_CHUNK);
    let n_minus_1 = (data.len() - 1) as u8;
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(n_minus_1);
    frame.extend_from_slice(data);
    let chk = frame.iter().fold(0u8, |acc, b| acc ^ b);
    frame.push(chk);
    frame
}

/// The fixed mass-erase trigger sent in the count-frame slot of `ERASE`.
/// Not a generic count/data frame: the target recognizes this exact
/// two-byte sequence as "erase everything" rather than "one byte of data
/// follows with N-1=0xFF".
pub const MASS_ERASE_TRIGGER: [u8; 2] = [0xFF, 0x00];

/// Sends a pre-built data-phase frame and waits for its trailing `ACK`,
/// optionally sleeping first. The target is busy programming/erasing
/// flash between the frame landing and the ACK; UART transports rely on
/// their receive timeout to absorb that latency; SPI transports have no
/// such cushion and must sleep for `predelay` before polling for ACK.
pub fn send_frame_expect_ack(
    transport: &mut dyn Transport,
    mode: UartMode,
    frame: &[u8],
    stage: Stage,
    predelay: Duration,
    sleep_fn: fn(Duration),
) -> Result<()> {
    send_with_mode(transport, mode, frame)?;
    if transport.is_spi() && !predelay.is_zero() {
        sleep_fn(predelay);
    }
    expect_ack(transport, mode, stage)
}

/// Sends a write-style count/data frame with no SPI programming delay —
/// the common case for RAM destinations and UART transports.
pub fn send_write_frame(transport: &mut dyn Transport, mode: UartMode, data: &[u8]) -> Result<()> {
    send_frame_expect_ack(
        transport,
        mode,
        &build_write_frame(data),
        Stage::Data,
        Duration::ZERO,
        |_| {},
    )
}

/// Sends a read-style count frame `[N-1, ~(N-1)]`, expects `ACK`, then
/// reads back exactly `n` data bytes (no trailing checksum on the read
/// side; the target just streams the bytes).
pub fn read_frame(
    transport: &mut dyn Transport,
    mode: UartMode,
    n: usize,
) -> Result<Vec<u8>> {
    debug_assert!(n >= 1 && n <= MAX_READ_CHUNK);
    let n_minus_1 = (n - 1) as u8;
    send_with_mode(transport, mode, &[n_minus_1, !n_minus_1])?;
    expect_ack(transport, mode, Stage::Count)?;
    receive_with_mode(transport, mode, n).map_err(BslError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn command_frame_is_self_complementary() {
        let mut t = MockTransport::new();
        t.queue_rx(&[ACK]);
        send_command(&mut t, UartMode::Duplex, GET).unwrap();
        assert_eq!(t.sent, vec![GET, !GET]);
    }

    #[test]
    fn address_frame_checksum_is_xor_of_bytes() {
        let mut t = MockTransport::new();
        t.queue_rx(&[ACK]);
        send_address(&mut t, UartMode::Duplex, 0x0080_1234).unwrap();
        let expected_chk = 0x00 ^ 0x80 ^ 0x12 ^ 0x34;
        assert_eq!(t.sent, vec![0x00, 0x80, 0x12, 0x34, expected_chk]);
    }

    #[test]
    fn write_frame_checksum_covers_length_and_data() {
        let mut t = MockTransport::new();
        t.queue_rx(&[ACK]);
        send_write_frame(&mut t, UartMode::Duplex, &[0x11, 0x22, 0x33]).unwrap();
        let expected_chk = 0x02 ^ 0x11 ^ 0x22 ^ 0x33;
        assert_eq!(t.sent, vec![0x02, 0x11, 0x22, 0x33, expected_chk]);
    }

    #[test]
    fn read_frame_returns_n_bytes_after_ack() {
        let mut t = MockTransport::new();
        t.queue_rx(&[ACK, 0xDE, 0xAD, 0xBE, 0xEF]);
        let data = read_frame(&mut t, UartMode::Duplex, 4).unwrap();
        assert_eq!(data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(t.sent, vec![0x03, !0x03u8]);
    }

    #[test]
    fn nack_on_command_is_an_error() {
        let mut t = MockTransport::new();
        t.queue_rx(&[NACK]);
        let err = send_command(&mut t, UartMode::Duplex, GET).unwrap_err();
        assert!(matches!(
            err,
            BslError::AckExpected { stage: Stage::CmdOpcode, actual: NACK }
        ));
    }
}
