// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intel HEX import/export.

use crate::error::{BslError, Result};
use crate::memory_image::MemoryImage;

const MAX_DATA_BYTES_PER_LINE: usize = 32;

const TYPE_DATA: u8 = 0x00;
const TYPE_EOF: u8 = 0x01;
const TYPE_EXT_SEGMENT: u8 = 0x02;
const TYPE_START_SEGMENT: u8 = 0x03;
const TYPE_EXT_LINEAR: u8 = 0x04;
const TYPE_START_LINEAR: u8 = 0x05;

struct Record {
    record_type: u8,
    address: u16,
    data: Vec<u8>,
}

fn parse_line(raw: &str, file: &str, line: usize) -> Result<Option<Record>> {
    let raw = raw.trim_end();
    if raw.is_empty() {
        return Ok(None);
    }
    if !raw.starts_with(':') {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: "line does not start with ':'".to_string(),
        });
    }
    let hex_digits = &raw[1..];
    if hex_digits.len() % 2 != 0 || hex_digits.len() < 8 {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: "malformed hex digit count".to_string(),
        });
    }
    let mut raw_bytes = Vec::with_capacity(hex_digits.len() / 2);
    for chunk in hex_digits.as_bytes().chunks(2) {
        let text = std::str::from_utf8(chunk).map_err(|_| BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: "non-ASCII hex digits".to_string(),
        })?;
        let byte = u8::from_str_radix(text, 16).map_err(|_| BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: format!("invalid hex byte '{text}'"),
        })?;
        raw_bytes.push(byte);
    }

    let declared_len = raw_bytes[0] as usize;
    if raw_bytes.len() != 1 + 2 + 1 + declared_len + 1 {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: format!(
                "declared length {} does not match {} data bytes present",
                declared_len,
                raw_bytes.len().saturating_sub(5)
            ),
        });
    }

    let checksum = *raw_bytes.last().unwrap();
    let sum: u32 = raw_bytes[..raw_bytes.len() - 1]
        .iter()
        .map(|b| *b as u32)
        .sum();
    let total = (sum + checksum as u32) & 0xFF;
    if total != 0 {
        let expected = (0x100 - (sum & 0xFF)) as u8 & 0xFF;
        return Err(BslError::ChecksumMismatch {
            file: file.to_string(),
            line,
            expected,
            got: checksum,
        });
    }

    let address = ((raw_bytes[1] as u16) << 8) | raw_bytes[2] as u16;
    let record_type = raw_bytes[3];
    let data = raw_bytes[4..4 + declared_len].to_vec();

    match record_type {
        TYPE_EXT_SEGMENT => Err(BslError::UnsupportedRecord {
            file: file.to_string(),
            line,
            record_type: "02 (extended segment address)".to_string(),
        }),
        TYPE_DATA | TYPE_EOF | TYPE_START_SEGMENT | TYPE_EXT_LINEAR | TYPE_START_LINEAR => {
            Ok(Some(Record {
                record_type,
                address,
                data,
            }))
        }
        other => Err(BslError::UnsupportedRecord {
            file: file.to_string(),
            line,
            record_type: format!("{other:02X}"),
        }),
    }
}

/// Imports an Intel HEX file. A `04` record sets the upper 16 bits of every
/// subsequent data record's address until the next `04`.
pub fn import_intel_hex(text: &str, file_name: &str) -> Result<MemoryImage> {
    let mut scratch = MemoryImage::new();
    let mut ela: u32 = 0;
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let Some(record) = parse_line(raw_line, file_name, line_no)? else {
            continue;
        };
        match record.record_type {
            TYPE_DATA => {
                let base = (ela << 16) | record.address as u32;
                for (offset, byte) in record.data.iter().enumerate() {
                    scratch.add(base as u64 + offset as u64, *byte)?;
                }
            }
            TYPE_EXT_LINEAR => {
                if record.data.len() != 2 {
                    return Err(BslError::MalformedLine {
                        file: file_name.to_string(),
                        line: line_no,
                        reason: "type 04 record must carry exactly 2 data bytes".to_string(),
                    });
                }
                ela = ((record.data[0] as u32) << 8) | record.data[1] as u32;
            }
            TYPE_EOF | TYPE_START_SEGMENT | TYPE_START_LINEAR => {}
            _ => unreachable!("filtered in parse_line"),
        }
    }
    Ok(scratch)
}

fn emit_record(record_type: u8, address: u16, data: &[u8]) -> String {
    let mut raw_bytes = Vec::with_capacity(4 + data.len());
    raw_bytes.push(data.len() as u8);
    raw_bytes.push((address >> 8) as u8);
    raw_bytes.push((address & 0xFF) as u8);
    raw_bytes.push(record_type);
    raw_bytes.extend_from_slice(data);
    let sum: u32 = raw_bytes.iter().map(|b| *b as u32).sum();
    let checksum = ((0x100 - (sum & 0xFF)) & 0xFF) as u8;

    let mut line = String::from(":");
    for b in &raw_bytes {
        line.push_str(&format!("{b:02X}"));
    }
    line.push_str(&format!("{checksum:02X}"));
    line
}

/// Exports an Intel HEX file, inserting a `04` record whenever the upper 16
/// bits of the next line's address change, and terminating with the
/// canonical `:00000001FF` EOF record.
pub fn export_intel_hex(image: &MemoryImage) -> String {
    let mut out = String::new();
    let mut last_ela: Option<u32> = None;

    for (start, end) in image.blocks() {
        let block_len = (end - start + 1) as usize;
        let mut offset = 0usize;
        while offset < block_len {
            let addr = start + offset as u64;
            let ela = (addr >> 16) as u32;
            if last_ela != Some(ela) {
                out.push_str(&emit_record(
                    TYPE_EXT_LINEAR,
                    0,
                    &[(ela >> 8) as u8, (ela & 0xFF) as u8],
                ));
                out.push('\n');
                last_ela = Some(ela);
            }
            // Don't let a chunk cross a 64 KiB boundary within one line.
            let remaining_in_segment = (0x1_0000 - (addr & 0xFFFF)) as usize;
            let take = block_len
                .saturating_sub(offset)
                .min(MAX_DATA_BYTES_PER_LINE)
                .min(remaining_in_segment);
            let data: Vec<u8> = (0..take)
                .map(|i| image.get(addr + i as u64).unwrap_or(0))
                .collect();
            out.push_str(&emit_record(TYPE_DATA, (addr & 0xFFFF) as u16, &data));
            out.push('\n');
            offset += take;
        }
    }

    out.push_str(":00000001FF\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e3_extended_linear_address_scenario() {
        let text = ":020000040001F9\n:040000000011223396\n";
        let img = import_intel_hex(text, "e3.hex").unwrap();
        assert_eq!(img.get(0x0001_0000), Some(0x00));
        assert_eq!(img.get(0x0001_0001), Some(0x11));
        assert_eq!(img.get(0x0001_0002), Some(0x22));
        assert_eq!(img.get(0x0001_0003), Some(0x33));
    }

    #[test]
    fn rejects_extended_segment_address() {
        let line = emit_record(TYPE_EXT_SEGMENT, 0, &[0x00, 0x10]);
        let err = import_intel_hex(&format!("{line}\n"), "x.hex").unwrap_err();
        assert!(matches!(err, BslError::UnsupportedRecord { .. }));
    }

    #[test]
    fn detects_checksum_mismatch() {
        let mut line = emit_record(TYPE_DATA, 0, &[0xAA]);
        let last_two: String = line.chars().rev().take(2).collect::<String>().chars().rev().collect();
        let bumped = format!("{:02X}", (u8::from_str_radix(&last_two, 16).unwrap()).wrapping_add(1));
        line.truncate(line.len() - 2);
        line.push_str(&bumped);
        let err = import_intel_hex(&format!("{line}\n"), "x.hex").unwrap_err();
        assert!(matches!(err, BslError::ChecksumMismatch { .. }));
    }

    #[test]
    fn round_trips_through_export_import() {
        let mut img = MemoryImage::new();
        img.fill(0x0001_FFF0, 0x0002_0010, 0x77).unwrap();
        let text = export_intel_hex(&img);
        let reimported = import_intel_hex(&text, "round.hex").unwrap();
        assert_eq!(
            img.entries().collect::<Vec<_>>(),
            reimported.entries().collect::<Vec<_>>()
        );
    }
}
