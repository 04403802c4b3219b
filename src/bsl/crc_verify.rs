// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-target CRC-32 verification (spec.md §4.5): upload a start/stop
//! parameter pair, jump into a device-matched CRC routine, read the
//! 32-bit result back, and compare against the PC-side CRC-32 of the
//! same bytes. This turns post-program verification from shipping every
//! byte back over the wire into shipping two addresses out and one word
//! back per block.

use crate::bsl::client::BslClient;
use crate::bsl::wire::{self, NACK};
use crate::error::{BslError, Result};
use crate::memory_image::MemoryImage;
use crate::routines::CrcAsset;
use crate::transport::Transport;

/// How many dummy `0x00` bytes to send, at most, while coaxing a UART
/// target's state machine back to command-ready after a CRC run. The
/// target NACKs a stray opcode once it has settled; this just bounds the
/// loop against a target that never responds.
const MAX_RECOVERY_BYTES: u32 = 64;

/// Verifies every block of `image` against the target's on-chip CRC-32,
/// using the RAM routine described by `asset`. Raises `CrcMismatch` at
/// the first block whose target-computed checksum disagrees with the
/// host's.
///
/// After this call the RAM-resident write/erase routines have been
/// clobbered by the CRC routine occupying the same RAM; callers must
/// re-upload them (`BslClient::upload_write_erase_routines`) before the
/// next write or erase.
pub fn crc_verify<T: Transport>(
    client: &mut BslClient<T>,
    image: &MemoryImage,
    asset: &CrcAsset,
) -> Result<()> {
    for (start, end) in image.blocks() {
        log::debug!("crc-verifying block 0x{start:08x}..=0x{end:08x}");

        let mut params = MemoryImage::new();
        for (offset, byte) in (start as u32).to_be_bytes().into_iter().enumerate() {
            params.add(asset.start_param_addr as u64 + offset as u64, byte)?;
        }
        for (offset, byte) in (end as u32).to_be_bytes().into_iter().enumerate() {
            params.add(asset.stop_param_addr as u64 + offset as u64, byte)?;
        }
        client.mem_write(&params)?;

        client.jump_to(asset.entry_point)?;

        let block_kib = ((end - start + 1) as f64 / 1024.0).ceil() as u32;
        let session = client.session().clone();
        (session.sleep_fn)(session.crc_base_delay + session.crc_per_kib_delay * block_kib);

        client.sync()?;
        if !client.transport_mut().is_spi() {
            recover_uart_command_mode(client)?;
        }

        let mut result_image = MemoryImage::new();
        client.mem_read(
            asset.result_addr as u64,
            asset.result_addr as u64 + 3,
            &mut result_image,
        )?;
        let result_bytes = [
            result_image.get(asset.result_addr as u64).expect("just read this byte"),
            result_image.get(asset.result_addr as u64 + 1).expect("just read this byte"),
            result_image.get(asset.result_addr as u64 + 2).expect("just read this byte"),
            result_image.get(asset.result_addr as u64 + 3).expect("just read this byte"),
        ];
        let target_crc = u32::from_be_bytes(result_bytes);

        let i_start = image.find_index(start).1;
        let i_end = image.find_index(end).1;
        let host_crc = image.crc32(i_start, i_end);

        if host_crc != target_crc {
            return Err(BslError::CrcMismatch {
                address: start,
                expected: host_crc,
                got: target_crc,
            });
        }
    }
    Ok(())
}

/// After a CRC run the target is back in the BSL, but a UART link may
/// need a few dummy bytes before its state machine settles into
/// command-ready (it NACKs a stray opcode once it has).
fn recover_uart_command_mode<T: Transport>(client: &mut BslClient<T>) -> Result<()> {
    let mode = client.mode();
    for _ in 0..MAX_RECOVERY_BYTES {
        crate::transport::send_with_mode(client.transport_mut(), mode, &[0x00])?;
        if let Ok(reply) = crate::transport::receive_with_mode(client.transport_mut(), mode, 1) {
            if reply[0] == NACK {
                return Ok(());
            }
        }
    }
    Err(BslError::AckExpected {
        stage: crate::error::Stage::Sync,
        actual: wire::ACK,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsl::client::Session;
    use crate::transport::mock::MockTransport;

    fn test_session() -> Session {
        let mut s = Session::default();
        s.sleep_fn = |_| {};
        s
    }

    fn test_asset() -> CrcAsset {
        CrcAsset {
            intel_hex: String::new(),
            start_param_addr: 0x20,
            stop_param_addr: 0x24,
            result_addr: 0x28,
            entry_point: 0x30,
            available: true,
        }
    }

    #[test]
    fn matching_checksums_verify_cleanly() {
        let mut image = MemoryImage::new();
        for i in 0..4u64 {
            image.add(0x8000 + i, i as u8).unwrap();
        }
        let host_crc = image.crc32(0, 3);

        let mut t = MockTransport::new();
        t.queue_rx(&[0x79]); // mem_write: WRITE cmd ack
        t.queue_rx(&[0x79]); // mem_write: address ack
        t.queue_rx(&[0x79]); // mem_write: data ack
        t.queue_rx(&[0x79]); // jump_to: GO cmd ack
        t.queue_rx(&[0x79]); // jump_to: address ack
        t.queue_rx(&[NACK]); // sync: NACK is a valid handshake
        t.queue_rx(&[NACK]); // uart recovery: dummy byte NACKed once settled
        t.queue_rx(&[0x79]); // mem_read: READ cmd ack
        t.queue_rx(&[0x79]); // mem_read: address ack
        t.queue_rx(&[0x79]); // mem_read: count ack
        t.queue_rx(&host_crc.to_be_bytes()); // the 4 result bytes

        let mut client = BslClient::new(t, test_session());
        crc_verify(&mut client, &image, &test_asset()).unwrap();
    }

    #[test]
    fn mismatched_checksum_reports_crc_mismatch() {
        let mut image = MemoryImage::new();
        for i in 0..4u64 {
            image.add(0x8000 + i, i as u8).unwrap();
        }
        let host_crc = image.crc32(0, 3);
        let bogus = host_crc ^ 0xFFFF_FFFF;

        let mut t = MockTransport::new();
        t.queue_rx(&[0x79, 0x79, 0x79]); // mem_write
        t.queue_rx(&[0x79, 0x79]); // jump_to
        t.queue_rx(&[NACK]); // sync
        t.queue_rx(&[NACK]); // uart recovery
        t.queue_rx(&[0x79, 0x79, 0x79]); // mem_read
        t.queue_rx(&bogus.to_be_bytes());

        let mut client = BslClient::new(t, test_session());
        let err = crc_verify(&mut client, &image, &test_asset()).unwrap_err();
        assert!(matches!(
            err,
            BslError::CrcMismatch { address: 0x8000, .. }
        ));
    }
}
