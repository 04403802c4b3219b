// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identity and the RAM-routine asset table keyed by it.
//!
//! The write/erase (and CRC, see `crc_verify`) routines are small blobs of
//! target machine code. This crate never synthesizes that code — it is an
//! opaque, device-specific asset the caller supplies, the same way the
//! original tool ships them as bundled Intel HEX files selected by a large
//! `#ifdef` ladder on family/size/BSL-version.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BslError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Stm8S,
    Stm8L,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Stm8S => write!(f, "STM8S"),
            Family::Stm8L => write!(f, "STM8L"),
        }
    }
}

/// Identifies a specific target, as established once per session by
/// `BslClient::probe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub family: Family,
    pub flash_size_kb: u32,
    pub bsl_version: u8,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {} kB flash, BSL v{}.{}",
            self.family,
            self.flash_size_kb,
            self.bsl_version >> 4,
            self.bsl_version & 0x0F
        )
    }
}

impl DeviceDescriptor {
    /// STM8L parts with more than 8 kB of flash run the write/erase
    /// routines from ROM; no RAM-routine upload is needed for them.
    pub fn routines_are_rom_resident(&self) -> bool {
        self.family == Family::Stm8L && self.flash_size_kb > 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RoutineKey {
    family: Family,
    flash_size_kb: u32,
    bsl_version: u8,
}

/// A pre-built target binary blob, carried as an Intel HEX image the way
/// the original tool bundles its RAM routines. `write_erase` and `crc`
/// serve different operations (`BslClient::mem_write`/`erase_*` vs.
/// `crc_verify`) and are looked up independently.
#[derive(Debug, Clone, Default)]
pub struct RoutineBlob {
    pub intel_hex: String,
    pub available: bool,
}

/// The on-target CRC routine's fixed RAM parameter layout (spec.md §4.5):
/// where to poke the start/stop addresses of the range to checksum, where
/// to read the 32-bit result back from, and where execution begins.
#[derive(Debug, Clone, Default)]
pub struct CrcAsset {
    pub intel_hex: String,
    pub start_param_addr: u32,
    pub stop_param_addr: u32,
    pub result_addr: u32,
    pub entry_point: u32,
    pub available: bool,
}

/// Lookup table from device identity to the matching RAM-routine blobs.
/// The crate ships the table pre-populated with unavailable placeholders
/// for every combination the original source documents; a real deployment
/// calls `insert_write_erase`/`insert_crc` with the actual asset bytes
/// before touching flash.
#[derive(Debug, Clone, Default)]
pub struct RoutineTable {
    write_erase: BTreeMap<RoutineKey, RoutineBlob>,
    crc: BTreeMap<RoutineKey, CrcAsset>,
}

impl RoutineTable {
    /// Builds the table with placeholder (unavailable) entries for the
    /// family/size/BSL-version combinations the bootloader supports.
    pub fn with_known_placeholders() -> Self {
        let mut table = RoutineTable::default();
        let known_sizes = [8u32, 32, 64, 128, 256];
        let known_versions = [0x10u8, 0x12, 0x13, 0x15, 0x20, 0x21, 0x22, 0x31];
        for &family in &[Family::Stm8S, Family::Stm8L] {
            for &size in &known_sizes {
                for &version in &known_versions {
                    let key = RoutineKey {
                        family,
                        flash_size_kb: size,
                        bsl_version: version,
                    };
                    table.write_erase.insert(key.clone(), RoutineBlob::default());
                    table.crc.insert(key, CrcAsset::default());
                }
            }
        }
        table
    }

    pub fn insert_write_erase(&mut self, device: DeviceDescriptor, intel_hex: impl Into<String>) {
        self.write_erase.insert(
            RoutineKey {
                family: device.family,
                flash_size_kb: device.flash_size_kb,
                bsl_version: device.bsl_version,
            },
            RoutineBlob {
                intel_hex: intel_hex.into(),
                available: true,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_crc(
        &mut self,
        device: DeviceDescriptor,
        intel_hex: impl Into<String>,
        start_param_addr: u32,
        stop_param_addr: u32,
        result_addr: u32,
        entry_point: u32,
    ) {
        self.crc.insert(
            RoutineKey {
                family: device.family,
                flash_size_kb: device.flash_size_kb,
                bsl_version: device.bsl_version,
            },
            CrcAsset {
                intel_hex: intel_hex.into(),
                start_param_addr,
                stop_param_addr,
                result_addr,
                entry_point,
                available: true,
            },
        );
    }

    pub fn write_erase_for(&self, device: DeviceDescriptor) -> Result<&RoutineBlob> {
        let key = RoutineKey {
            family: device.family,
            flash_size_kb: device.flash_size_kb,
            bsl_version: device.bsl_version,
        };
        match self.write_erase.get(&key) {
            Some(blob) if blob.available => Ok(blob),
            _ => Err(BslError::UnsupportedRamRoutine {
                family: device.family,
                flash_kb: device.flash_size_kb,
                bsl_version: device.bsl_version,
            }),
        }
    }

    pub fn crc_for(&self, device: DeviceDescriptor) -> Result<&CrcAsset> {
        let key = RoutineKey {
            family: device.family,
            flash_size_kb: device.flash_size_kb,
            bsl_version: device.bsl_version,
        };
        match self.crc.get(&key) {
            Some(blob) if blob.available => Ok(blob),
            _ => Err(BslError::UnsupportedRamRoutine {
                family: device.family,
                flash_kb: device.flash_size_kb,
                bsl_version: device.bsl_version,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpopulated_lookup_is_unsupported_ram_routine() {
        let table = RoutineTable::with_known_placeholders();
        let device = DeviceDescriptor {
            family: Family::Stm8S,
            flash_size_kb: 32,
            bsl_version: 0x10,
        };
        assert!(matches!(
            table.write_erase_for(device),
            Err(BslError::UnsupportedRamRoutine { .. })
        ));
    }

    #[test]
    fn inserted_routine_is_found() {
        let mut table = RoutineTable::with_known_placeholders();
        let device = DeviceDescriptor {
            family: Family::Stm8S,
            flash_size_kb: 32,
            bsl_version: 0x10,
        };
        table.insert_write_erase(device, ":00000001FF\n");
        assert!(table.write_erase_for(device).is_ok());
    }

    #[test]
    fn rom_resident_detection() {
        let rom = DeviceDescriptor {
            family: Family::Stm8L,
            flash_size_kb: 32,
            bsl_version: 0x10,
        };
        let ram = DeviceDescriptor {
            family: Family::Stm8L,
            flash_size_kb: 8,
            bsl_version: 0x10,
        };
        assert!(rom.routines_are_rom_resident());
        assert!(!ram.routines_are_rom_resident());
    }

    #[test]
    fn descriptor_display_format() {
        let d = DeviceDescriptor {
            family: Family::Stm8S,
            flash_size_kb: 128,
            bsl_version: 0x15,
        };
        assert_eq!(format!("{d}"), "STM8S, 128 kB flash, BSL v1.5");
    }
}
