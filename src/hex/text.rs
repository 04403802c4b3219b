// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plain address/value text table import/export.
//!
//! `#`-prefixed lines are comments; every other non-blank line holds
//! exactly two whitespace-separated tokens, address then value, each
//! parsed as hexadecimal if it begins with `0x`/`0X`, decimal otherwise.

use crate::error::{BslError, Result};
use crate::memory_image::MemoryImage;

fn parse_token(tok: &str, file: &str, line: usize, what: &str) -> Result<u64> {
    let (radix, digits) = if let Some(stripped) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        (16, stripped)
    } else {
        (10, tok)
    };
    u64::from_str_radix(digits, radix).map_err(|_| BslError::MalformedLine {
        file: file.to_string(),
        line,
        reason: format!("invalid {what} token '{tok}'"),
    })
}

/// Imports a plain-text address/value table. Syntactically invalid lines
/// abort the import with the offending line number; the image is
/// all-or-nothing.
pub fn import_text(text: &str, file_name: &str) -> Result<MemoryImage> {
    let mut scratch = MemoryImage::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let addr_tok = tokens.next().ok_or_else(|| BslError::MalformedLine {
            file: file_name.to_string(),
            line: line_no,
            reason: "missing address token".to_string(),
        })?;
        let val_tok = tokens.next().ok_or_else(|| BslError::MalformedLine {
            file: file_name.to_string(),
            line: line_no,
            reason: "missing value token".to_string(),
        })?;
        if tokens.next().is_some() {
            return Err(BslError::MalformedLine {
                file: file_name.to_string(),
                line: line_no,
                reason: "more than two tokens on data line".to_string(),
            });
        }

        let addr = parse_token(addr_tok, file_name, line_no, "address")?;
        let val = parse_token(val_tok, file_name, line_no, "value")?;
        if val > 0xFF {
            return Err(BslError::MalformedLine {
                file: file_name.to_string(),
                line: line_no,
                reason: format!("value {val:#x} does not fit in one byte"),
            });
        }
        scratch.add(addr, val as u8)?;
    }
    Ok(scratch)
}

/// Exports a plain-text address/value table, one hex-formatted pair per
/// line, in ascending address order.
pub fn export_text(image: &MemoryImage) -> String {
    let mut out = String::new();
    out.push_str("# address value\n");
    for (addr, val) in image.entries() {
        out.push_str(&format!("0x{addr:x} 0x{val:02x}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_radix_tokens() {
        let text = "# comment\n0x8000 0xAA\n32769 171\n";
        let img = import_text(text, "t.txt").unwrap();
        assert_eq!(img.get(0x8000), Some(0xAA));
        assert_eq!(img.get(32769), Some(171));
    }

    #[test]
    fn aborts_with_line_number_on_bad_line() {
        let text = "0x8000 0xAA\nbogus line here\n";
        let err = import_text(text, "t.txt").unwrap_err();
        match err {
            BslError::MalformedLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn round_trips_through_export_import() {
        let mut img = MemoryImage::new();
        img.fill(0x10, 0x14, 0x99).unwrap();
        let text = export_text(&img);
        let reimported = import_text(&text, "round.txt").unwrap();
        assert_eq!(
            img.entries().collect::<Vec<_>>(),
            reimported.entries().collect::<Vec<_>>()
        );
    }
}
