// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw binary import/export. Binary carries no addresses or checksums of
//! its own, so the base address is always supplied by the caller on
//! import, and re-supplied by the caller on export (the image itself only
//! knows absolute addresses, not "where the file started").

use crate::error::Result;
use crate::memory_image::MemoryImage;

/// Assigns `bytes` to consecutive addresses starting at `base`.
pub fn import_binary(bytes: &[u8], base: u64) -> Result<MemoryImage> {
    let mut scratch = MemoryImage::new();
    for (offset, byte) in bytes.iter().enumerate() {
        scratch.add(base + offset as u64, *byte)?;
    }
    Ok(scratch)
}

/// Flattens every entry at or above `base` into a contiguous byte vector
/// running up to the image's highest address. Gaps are filled with `0x00`
/// and logged at `warn` level, since a hole silently becomes real
/// (wrong) flash content in a binary file.
pub fn export_binary(image: &MemoryImage, base: u64) -> Vec<u8> {
    let max_addr = image
        .entries()
        .map(|(a, _)| a)
        .filter(|a| *a >= base)
        .max();
    let Some(max_addr) = max_addr else {
        return Vec::new();
    };
    let len = (max_addr - base + 1) as usize;
    let mut out = vec![0u8; len];
    let mut gaps = 0usize;
    for i in 0..len {
        match image.get(base + i as u64) {
            Some(b) => out[i] = b,
            None => gaps += 1,
        }
    }
    if gaps > 0 {
        log::warn!("binary export of {len} bytes from 0x{base:x} padded {gaps} missing byte(s) with 0x00");
    }
    out
}
