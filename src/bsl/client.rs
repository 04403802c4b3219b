// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BSL client: synchronization, capability probe, RAM-routine upload,
//! and memory read/write/verify/erase/jump, all on top of [`Transport`].
//!
//! Strictly single-threaded and request/response (spec §5): every public
//! method here blocks until its exchange completes or a typed error fires,
//! there is no background task, and the only suspension points are
//! `Transport::receive` and the explicit sleeps around SPI programming
//! latency.

use std::time::Duration;

use crate::error::{BslError, Result, Stage};
use crate::memory_image::MemoryImage;
use crate::routines::{DeviceDescriptor, Family, RoutineTable};
use crate::transport::{Parity, Transport, UartMode};

use super::wire::{
    self, ACK, ERASE, GET, GO, MASS_ERASE_TRIGGER, MAX_READ_CHUNK, MAX_WRITE_CHUNK, NACK, READ,
    SYNCH, WRITE,
};

/// Candidate probe addresses, tried in the fixed order spec.md §4.4
/// prescribes: EEPROM bases first (to tell the family apart), then flash
/// top addresses from largest to smallest (to size the flash).
const EEPROM_PROBE_ADDRS: &[(u32, Family)] =
    &[(0x0040_00, Family::Stm8S), (0x0010_00, Family::Stm8L)];
const FLASH_TOP_PROBE_ADDRS: &[(u32, u32)] = &[
    (0x04_7FFF, 256),
    (0x02_7FFF, 128),
    (0x01_7FFF, 64),
    (0x00_FFFF, 32),
    (0x00_9FFF, 8),
];

const EXPECTED_GET_OPCODES: [u8; 5] = [GET, READ, GO, WRITE, ERASE];

/// Tuning knobs from spec.md §4.4, gathered into one place so a caller can
/// adjust them (e.g. for hardware that measures differently) without
/// touching client logic. `sleep_fn` is swappable so tests don't pay for
/// real sleeps.
#[derive(Debug, Clone)]
pub struct Session {
    pub sync_max_attempts: u32,
    pub sync_retry_delay: Duration,
    pub sync_attempt_timeout: Duration,
    pub command_timeout: Duration,
    pub erase_sector_timeout: Duration,
    pub erase_mass_timeout: Duration,
    pub spi_write_flash_unaligned_delay: Duration,
    pub spi_write_flash_aligned_delay: Duration,
    pub spi_write_ram_delay: Duration,
    pub spi_erase_sector_delay: Duration,
    pub spi_erase_mass_delay: Duration,
    pub crc_base_delay: Duration,
    pub crc_per_kib_delay: Duration,
    pub preset_uart_mode: Option<UartMode>,
    pub sleep_fn: fn(Duration),
}

impl Default for Session {
    fn default() -> Self {
        Session {
            sync_max_attempts: 50,
            sync_retry_delay: Duration::from_millis(10),
            sync_attempt_timeout: Duration::from_millis(100),
            command_timeout: Duration::from_millis(500),
            erase_sector_timeout: Duration::from_millis(1200),
            erase_mass_timeout: Duration::from_secs(10),
            spi_write_flash_unaligned_delay: Duration::from_millis(1200),
            spi_write_flash_aligned_delay: Duration::from_millis(20),
            spi_write_ram_delay: Duration::from_millis(1),
            spi_erase_sector_delay: Duration::from_millis(40),
            spi_erase_mass_delay: Duration::from_millis(1100),
            crc_base_delay: Duration::from_millis(500),
            crc_per_kib_delay: Duration::from_millis(25),
            preset_uart_mode: None,
            sleep_fn: std::thread::sleep,
        }
    }
}

/// Mirrors spec.md §4.4's state diagram. `BslClient` does not refuse calls
/// made out of order (the spec defines no such error kind); `state()` is
/// for callers and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Synchronized,
    Probed,
    Ready,
    Jumped,
}

pub struct BslClient<T: Transport> {
    transport: T,
    session: Session,
    mode: UartMode,
    state: ClientState,
    device: Option<DeviceDescriptor>,
}

impl<T: Transport> BslClient<T> {
    pub fn new(transport: T, session: Session) -> Self {
        let mode = session.preset_uart_mode.unwrap_or(UartMode::Duplex);
        BslClient {
            transport,
            session,
            mode,
            state: ClientState::Created,
            device: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn mode(&self) -> UartMode {
        self.mode
    }

    pub fn device(&self) -> Option<DeviceDescriptor> {
        self.device
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn sleep(&self, d: Duration) {
        (self.session.sleep_fn)(d);
    }

    /// Sends `SYNCH` and retries up to `sync_max_attempts` times until the
    /// target answers with `ACK` or `NACK` — either is a successful
    /// handshake; `NACK` typically just means the BSL is already past its
    /// initial synchronization window.
    pub fn sync(&mut self) -> Result<()> {
        self.transport.set_timeout(self.session.sync_attempt_timeout)?;
        for attempt in 0..self.session.sync_max_attempts {
            log::trace!("sync attempt {attempt}");
            self.transport.flush()?;
            if let Err(e) = self.transport.send(&[SYNCH]) {
                log::trace!("sync attempt {attempt} send failed: {e}");
                self.sleep(self.session.sync_retry_delay);
                continue;
            }
            let first = match self.transport.receive(1) {
                Ok(b) => b[0],
                Err(_) => {
                    self.sleep(self.session.sync_retry_delay);
                    continue;
                }
            };
            // A one-wire link echoes the SYNCH byte before the real reply.
            let reply = if first == SYNCH {
                match self.transport.receive(1) {
                    Ok(b) => b[0],
                    Err(_) => {
                        self.sleep(self.session.sync_retry_delay);
                        continue;
                    }
                }
            } else {
                first
            };
            if reply == ACK || reply == NACK {
                self.state = ClientState::Synchronized;
                return Ok(());
            }
            self.sleep(self.session.sync_retry_delay);
        }
        Err(BslError::SyncFailed)
    }

    /// Transmits a bad command sequence and infers the UART wiring
    /// convention from how the target responds (spec.md §4.4), applying
    /// the implied parity before returning.
    pub fn detect_uart_mode(&mut self) -> Result<UartMode> {
        self.transport.set_parity(Parity::Even)?;
        self.transport.flush()?;
        self.transport.send(&[0x00, 0xFF])?;
        let reply = self.transport.receive(1)?;

        let detected = match reply[0] {
            ACK => UartMode::Duplex,
            0x00 => {
                // First byte of the echo; consume the second to drain it.
                let _ = self.transport.receive(1)?;
                UartMode::OneWire
            }
            NACK => UartMode::TwoWireReply,
            _ => return Err(BslError::ModeDetectFailed),
        };

        match detected {
            UartMode::Duplex => self.transport.set_parity(Parity::Even)?,
            UartMode::OneWire | UartMode::TwoWireReply => {
                self.transport.set_parity(Parity::None)?
            }
        }
        self.mode = detected;
        Ok(detected)
    }

    /// A probing single-byte read of `addr`: `true` if the target ACKs
    /// through to a returned byte, `false` if it NACKs the address phase
    /// (memory not present there). This is the one place besides `sync`
    /// where a NACK is a normal answer, not a protocol error.
    pub fn mem_check(&mut self, addr: u32) -> Result<bool> {
        wire::send_command(&mut self.transport, self.mode, READ)?;
        let addr_bytes = addr.to_be_bytes();
        let chk = addr_bytes.iter().fold(0u8, |acc, b| acc ^ b);
        let mut frame = addr_bytes.to_vec();
        frame.push(chk);
        crate::transport::send_with_mode(&mut self.transport, self.mode, &frame)?;
        let ack_byte = crate::transport::receive_with_mode(&mut self.transport, self.mode, 1)?[0];
        if ack_byte == NACK {
            return Ok(false);
        }
        if ack_byte != ACK {
            return Err(BslError::AckExpected {
                stage: Stage::Address,
                actual: ack_byte,
            });
        }
        let _ = wire::read_frame(&mut self.transport, self.mode, 1)?;
        Ok(true)
    }

    /// Family/flash-size probe followed by a `GET` capability query.
    pub fn probe(&mut self) -> Result<DeviceDescriptor> {
        let mut tried = Vec::new();
        let mut family = None;
        for &(addr, fam) in EEPROM_PROBE_ADDRS {
            tried.push(addr);
            log::debug!("probing family at 0x{addr:06x}");
            if self.mem_check(addr)? {
                family = Some(fam);
                break;
            }
        }
        let family = family.ok_or_else(|| BslError::UnknownDevice {
            tried_addresses: tried.clone(),
        })?;

        let mut flash_size_kb = None;
        for &(addr, size) in FLASH_TOP_PROBE_ADDRS {
            tried.push(addr);
            log::debug!("probing flash top at 0x{addr:06x}");
            if self.mem_check(addr)? {
                flash_size_kb = Some(size);
                break;
            }
        }
        let flash_size_kb = flash_size_kb.ok_or(BslError::UnknownDevice {
            tried_addresses: tried,
        })?;

        wire::send_command(&mut self.transport, self.mode, GET)?;
        // The target pushes this response unprompted: a length byte (N-1,
        // N=9: a version byte plus 7 supported-command opcodes), the
        // payload itself, then a trailing ACK.
        let n_minus_1 = crate::transport::receive_with_mode(&mut self.transport, self.mode, 1)?[0];
        let payload =
            crate::transport::receive_with_mode(&mut self.transport, self.mode, n_minus_1 as usize + 1)?;
        wire::expect_ack(&mut self.transport, self.mode, Stage::Data)?;

        let bsl_version = *payload.first().ok_or(BslError::UnknownDevice {
            tried_addresses: vec![],
        })?;
        let opcodes = &payload[1..];
        for expected in EXPECTED_GET_OPCODES {
            if !opcodes.contains(&expected) {
                return Err(BslError::UnknownDevice {
                    tried_addresses: vec![],
                });
            }
        }

        let device = DeviceDescriptor {
            family,
            flash_size_kb,
            bsl_version,
        };
        self.device = Some(device);
        self.state = ClientState::Probed;
        Ok(device)
    }

    /// Uploads the write/erase RAM routines for the probed device, unless
    /// they're ROM-resident (STM8L with >8 kB flash).
    pub fn upload_write_erase_routines(&mut self, routines: &RoutineTable) -> Result<()> {
        let device = self.device.ok_or(BslError::UnknownDevice {
            tried_addresses: vec![],
        })?;
        if device.routines_are_rom_resident() {
            log::debug!("{device}: write/erase routines are ROM-resident, nothing to upload");
            self.state = ClientState::Ready;
            return Ok(());
        }
        let blob = routines.write_erase_for(device)?;
        let image = crate::hex::import_intel_hex(&blob.intel_hex, "ram-routine")?;
        self.mem_write(&image)?;
        self.state = ClientState::Ready;
        Ok(())
    }

    /// Reads `[addr_start, addr_stop]` (inclusive) into `image`, chunking
    /// at up to 256 bytes per `READ` command.
    pub fn mem_read(
        &mut self,
        addr_start: u64,
        addr_stop: u64,
        image: &mut MemoryImage,
    ) -> Result<()> {
        if addr_start > addr_stop {
            return Err(BslError::RangeInverted {
                start: addr_start,
                stop: addr_stop,
            });
        }
        let mut cur = addr_start;
        while cur <= addr_stop {
            let remaining = (addr_stop - cur + 1).min(MAX_READ_CHUNK as u64) as usize;
            wire::send_command(&mut self.transport, self.mode, READ)?;
            wire::send_address(&mut self.transport, self.mode, cur as u32)?;
            let data = wire::read_frame(&mut self.transport, self.mode, remaining)?;
            for (offset, byte) in data.iter().enumerate() {
                image.add(cur + offset as u64, *byte)?;
            }
            cur += remaining as u64;
        }
        Ok(())
    }

    /// Writes every block of `image`, paging flash destinations at 128
    /// bytes aligned to target flash-page boundaries (spec.md §4.4).
    pub fn mem_write(&mut self, image: &MemoryImage) -> Result<()> {
        for (start, end) in image.blocks() {
            for (page_addr, len) in plan_pages(start, end) {
                let data: Vec<u8> = (0..len)
                    .map(|i| image.get(page_addr + i as u64).expect("page within block"))
                    .collect();
                let page_is_aligned = page_addr % wire::FLASH_PAGE_SIZE as u64 == 0
                    && len == wire::FLASH_PAGE_SIZE;
                let is_flash = page_addr >= wire::PFLASH_START;
                let predelay = if !is_flash {
                    self.session.spi_write_ram_delay
                } else if page_is_aligned {
                    self.session.spi_write_flash_aligned_delay
                } else {
                    self.session.spi_write_flash_unaligned_delay
                };

                wire::send_command(&mut self.transport, self.mode, WRITE)?;
                wire::send_address(&mut self.transport, self.mode, page_addr as u32)?;
                wire::send_frame_expect_ack(
                    &mut self.transport,
                    self.mode,
                    &wire::build_write_frame(&data),
                    Stage::Data,
                    predelay,
                    self.session.sleep_fn,
                )?;
            }
        }
        Ok(())
    }

    /// Programs a handful of option bytes via the same wire sequence as
    /// `mem_write`, without page-alignment batching (option bytes live
    /// outside the flash page grid). Exposed as a distinct operation so
    /// callers opt into touching read-out-protection configuration
    /// explicitly rather than through a generic range write.
    pub fn write_option_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        let mut cur = addr;
        for chunk in bytes.chunks(MAX_WRITE_CHUNK) {
            wire::send_command(&mut self.transport, self.mode, WRITE)?;
            wire::send_address(&mut self.transport, self.mode, cur)?;
            wire::send_frame_expect_ack(
                &mut self.transport,
                self.mode,
                &wire::build_write_frame(chunk),
                Stage::Data,
                self.session.spi_write_flash_unaligned_delay,
                self.session.sleep_fn,
            )?;
            cur += chunk.len() as u32;
        }
        Ok(())
    }

    /// Reads back every block of `image` and compares byte-for-byte,
    /// raising `VerifyFailed` at the first mismatch.
    pub fn mem_verify_readback(&mut self, image: &MemoryImage) -> Result<()> {
        for (start, end) in image.blocks() {
            let mut scratch = MemoryImage::new();
            self.mem_read(start, end, &mut scratch)?;
            for addr in start..=end {
                let expected = image.get(addr).expect("address within block");
                let got = scratch.get(addr).expect("just read this address");
                if expected != got {
                    return Err(BslError::VerifyFailed {
                        address: addr,
                        expected,
                        got,
                    });
                }
            }
        }
        Ok(())
    }

    /// Erases the 1 KiB sector containing `addr`.
    pub fn erase_sector(&mut self, addr: u64) -> Result<()> {
        let sector_index = ((addr - wire::PFLASH_START) / wire::PFLASH_BLOCKSIZE) as u8;
        let saved_timeout = self.session.command_timeout;
        self.transport.set_timeout(self.session.erase_sector_timeout)?;
        let result = (|| -> Result<()> {
            wire::send_command(&mut self.transport, self.mode, ERASE)?;
            wire::send_frame_expect_ack(
                &mut self.transport,
                self.mode,
                &wire::build_write_frame(&[sector_index]),
                Stage::Data,
                self.session.spi_erase_sector_delay,
                self.session.sleep_fn,
            )
        })();
        self.transport.set_timeout(saved_timeout)?;
        result
    }

    /// Erases every 1 KiB sector covering `[addr_start, addr_stop]`. Still
    /// single-sector wire frames (spec.md standardizes on single-sector
    /// erase); this just loops `erase_sector`.
    pub fn erase_range(&mut self, addr_start: u64, addr_stop: u64) -> Result<()> {
        if addr_start > addr_stop {
            return Err(BslError::RangeInverted {
                start: addr_start,
                stop: addr_stop,
            });
        }
        let first_sector = (addr_start - wire::PFLASH_START) / wire::PFLASH_BLOCKSIZE;
        let last_sector = (addr_stop - wire::PFLASH_START) / wire::PFLASH_BLOCKSIZE;
        for sector in first_sector..=last_sector {
            let addr = wire::PFLASH_START + sector * wire::PFLASH_BLOCKSIZE;
            self.erase_sector(addr)?;
        }
        Ok(())
    }

    /// Erases the entire flash.
    pub fn erase_mass(&mut self) -> Result<()> {
        let saved_timeout = self.session.command_timeout;
        self.transport.set_timeout(self.session.erase_mass_timeout)?;
        let result = (|| -> Result<()> {
            wire::send_command(&mut self.transport, self.mode, ERASE)?;
            wire::send_frame_expect_ack(
                &mut self.transport,
                self.mode,
                &MASS_ERASE_TRIGGER,
                Stage::Data,
                self.session.spi_erase_mass_delay,
                self.session.sleep_fn,
            )
        })();
        self.transport.set_timeout(saved_timeout)?;
        result
    }

    /// Starts target execution at `addr`. After this call the target is no
    /// longer a BSL peer; the transport remains open but any further BSL
    /// command is undefined.
    pub fn jump_to(&mut self, addr: u32) -> Result<()> {
        wire::send_command(&mut self.transport, self.mode, GO)?;
        wire::send_address(&mut self.transport, self.mode, addr)?;
        self.state = ClientState::Jumped;
        Ok(())
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }
}

/// Plans the page boundaries for a write to `[start, end]`: each page holds
/// up to 128 bytes, and is cut short whenever the next address would land
/// on a 128-byte flash-page boundary, so writes always land on aligned
/// pages when the data permits it.
fn plan_pages(start: u64, end: u64) -> Vec<(u64, usize)> {
    let mut pages = Vec::new();
    let mut cur = start;
    let page_size = wire::FLASH_PAGE_SIZE as u64;
    while cur <= end {
        let remaining = end - cur + 1;
        let next_boundary = (cur / page_size + 1) * page_size;
        let distance_to_boundary = next_boundary - cur;
        let len = remaining.min(page_size).min(distance_to_boundary);
        pages.push((cur, len as usize));
        cur += len;
    }
    pages
}
