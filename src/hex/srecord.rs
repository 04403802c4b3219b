// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Motorola S-record import/export.

use crate::error::{BslError, Result};
use crate::memory_image::MemoryImage;

const MAX_DATA_BYTES_PER_LINE: usize = 32;

struct Record {
    kind: u8,
    address: u64,
    data: Vec<u8>,
}

fn addr_width(kind: u8) -> Option<usize> {
    match kind {
        b'0' | b'1' | b'9' => Some(2),
        b'2' | b'8' => Some(3),
        b'3' | b'7' => Some(4),
        b'5' | b'6' => None, // count records carry a count, not an address
        _ => None,
    }
}

fn parse_hex_byte(s: &[u8], file: &str, line: usize) -> Result<u8> {
    let text = std::str::from_utf8(s).map_err(|_| BslError::MalformedLine {
        file: file.to_string(),
        line,
        reason: "non-ASCII hex digits".to_string(),
    })?;
    u8::from_str_radix(text, 16).map_err(|_| BslError::MalformedLine {
        file: file.to_string(),
        line,
        reason: format!("invalid hex byte '{text}'"),
    })
}

fn parse_line(raw: &str, file: &str, line: usize) -> Result<Option<Record>> {
    let raw = raw.trim_end();
    if raw.is_empty() {
        return Ok(None);
    }
    let bytes = raw.as_bytes();
    if bytes[0] != b'S' || bytes.len() < 4 {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: "line does not start with a valid S-record prefix".to_string(),
        });
    }
    let kind = bytes[1];
    if !matches!(kind, b'0'..=b'3' | b'5'..=b'9') {
        return Err(BslError::UnsupportedRecord {
            file: file.to_string(),
            line,
            record_type: format!("S{}", kind as char),
        });
    }

    let hex_digits = &bytes[2..];
    if hex_digits.len() % 2 != 0 {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: "odd number of hex digits".to_string(),
        });
    }
    let mut raw_bytes = Vec::with_capacity(hex_digits.len() / 2);
    for chunk in hex_digits.chunks(2) {
        raw_bytes.push(parse_hex_byte(chunk, file, line)?);
    }

    let declared_len = raw_bytes[0] as usize;
    if declared_len != raw_bytes.len() - 1 {
        return Err(BslError::MalformedLine {
            file: file.to_string(),
            line,
            reason: format!(
                "declared length {} does not match {} following bytes",
                declared_len,
                raw_bytes.len() - 1
            ),
        });
    }

    let checksum = *raw_bytes.last().unwrap();
    let sum: u32 = raw_bytes[..raw_bytes.len() - 1]
        .iter()
        .map(|b| *b as u32)
        .sum();
    let expected = 0xFF ^ ((sum & 0xFF) as u8);
    if checksum != expected {
        return Err(BslError::ChecksumMismatch {
            file: file.to_string(),
            line,
            expected,
            got: checksum,
        });
    }

    match kind {
        b'0' | b'5' | b'6' | b'7' | b'8' | b'9' => Ok(Some(Record {
            kind,
            address: 0,
            data: Vec::new(),
        })),
        b'1' | b'2' | b'3' => {
            let width = addr_width(kind).unwrap();
            if raw_bytes.len() < 1 + width {
                return Err(BslError::MalformedLine {
                    file: file.to_string(),
                    line,
                    reason: format!("record too short for a {width}-byte address"),
                });
            }
            let addr_bytes = &raw_bytes[1..1 + width];
            let data_bytes = &raw_bytes[1 + width..raw_bytes.len() - 1];
            let mut address = 0u64;
            for b in addr_bytes {
                address = (address << 8) | *b as u64;
            }
            Ok(Some(Record {
                kind,
                address,
                data: data_bytes.to_vec(),
            }))
        }
        _ => unreachable!("checked above"),
    }
}

/// Imports an S-record file. Data records' address widths may be mixed
/// freely within one file (an `S1` line may follow an `S3` line).
pub fn import_srecord(text: &str, file_name: &str) -> Result<MemoryImage> {
    let mut scratch = MemoryImage::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let Some(record) = parse_line(raw_line, file_name, line_no)? else {
            continue;
        };
        if matches!(record.kind, b'1' | b'2' | b'3') {
            for (offset, byte) in record.data.iter().enumerate() {
                scratch.add(record.address + offset as u64, *byte)?;
            }
        }
    }
    Ok(scratch)
}

fn emit_record(kind: char, address: u64, addr_width: usize, data: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + addr_width + data.len() + 1);
    let len = (addr_width + data.len() + 1) as u8;
    payload.push(len);
    for shift in (0..addr_width).rev() {
        payload.push(((address >> (shift * 8)) & 0xFF) as u8);
    }
    payload.extend_from_slice(data);
    let sum: u32 = payload.iter().map(|b| *b as u32).sum();
    let checksum = 0xFF ^ ((sum & 0xFF) as u8);

    let mut line = format!("S{kind}");
    for b in &payload {
        line.push_str(&format!("{b:02X}"));
    }
    line.push_str(&format!("{checksum:02X}"));
    line
}

/// Exports an S-record file: a harmless header, chunked data records using
/// the narrowest address width that covers every emitted address, followed
/// by the matching termination record.
pub fn export_srecord(image: &MemoryImage) -> String {
    let max_addr = image.entries().map(|(a, _)| a).max().unwrap_or(0);
    let (data_kind, width, term_kind) = if max_addr <= 0xFFFF {
        ('1', 2, '9')
    } else if max_addr <= 0xFF_FFFF {
        ('2', 3, '8')
    } else {
        ('3', 4, '7')
    };

    let mut out = String::new();
    out.push_str(&emit_record('0', 0, 2, b"stm8bsl"));
    out.push('\n');

    for (start, end) in image.blocks() {
        let block_len = (end - start + 1) as usize;
        let mut offset = 0usize;
        while offset < block_len {
            let take = block_len.saturating_sub(offset).min(MAX_DATA_BYTES_PER_LINE);
            let addr = start + offset as u64;
            let data: Vec<u8> = (0..take)
                .map(|i| image.get(addr + i as u64).unwrap_or(0))
                .collect();
            out.push_str(&emit_record(data_kind, addr, width, &data));
            out.push('\n');
            offset += take;
        }
    }

    out.push_str(&emit_record(term_kind, 0, width, &[]));
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e2_s1_record_imports_expected_bytes() {
        // S1 13 0000 00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F <chk>
        let data: Vec<u8> = (0u8..16).collect();
        let line = emit_record('1', 0, 2, &data);
        let img = import_srecord(&line, "test.s19").unwrap();
        for (i, b) in data.iter().enumerate() {
            assert_eq!(img.get(i as u64), Some(*b));
        }
    }

    #[test]
    fn rejects_unknown_record_type() {
        let err = import_srecord("SA0B0000FF", "x.s19").unwrap_err();
        assert!(matches!(err, BslError::UnsupportedRecord { .. }));
    }

    #[test]
    fn detects_checksum_mismatch() {
        let mut line = emit_record('1', 0, 2, &[0xAA]);
        let last = line.pop().unwrap();
        let bumped = if last == '0' { '1' } else { '0' };
        line.push(bumped);
        let err = import_srecord(&line, "x.s19").unwrap_err();
        assert!(matches!(err, BslError::ChecksumMismatch { .. }));
    }

    #[test]
    fn round_trips_through_export_import() {
        let mut img = MemoryImage::new();
        img.fill(0x8000, 0x8050, 0x5A).unwrap();
        let text = export_srecord(&img);
        let reimported = import_srecord(&text, "round.s19").unwrap();
        assert_eq!(
            img.entries().collect::<Vec<_>>(),
            reimported.entries().collect::<Vec<_>>()
        );
    }

    #[test]
    fn malformed_import_is_atomic() {
        let good = emit_record('1', 0, 2, &[0x01]);
        let bad = "S9999999999999999";
        let combined = format!("{good}\n{bad}\n");
        assert!(import_srecord(&combined, "bad.s19").is_err());
    }
}
