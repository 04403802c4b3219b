// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Which frame-phase of the wire protocol an unexpected reply arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CmdOpcode,
    Address,
    Count,
    Data,
    Sync,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::CmdOpcode => "cmd-opcode",
            Stage::Address => "address",
            Stage::Count => "count",
            Stage::Data => "data",
            Stage::Sync => "sync",
        };
        f.write_str(s)
    }
}

/// Transport-level failures, independent of BSL semantics.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for {expected} byte(s), got {got}")]
    Timeout { expected: usize, got: usize },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("short write: wrote {wrote} of {requested} byte(s)")]
    ShortWrite { wrote: usize, requested: usize },
}

/// Every way a BSL session can fail.
#[derive(Debug, Error)]
pub enum BslError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol expected ACK during {stage} stage, got 0x{actual:02x}")]
    AckExpected { stage: Stage, actual: u8 },

    #[error("echoed byte did not match transmitted byte")]
    BadEcho,

    #[error("checksum mismatch in {file} line {line}: expected 0x{expected:02x}, got 0x{got:02x}")]
    ChecksumMismatch {
        file: String,
        line: usize,
        expected: u8,
        got: u8,
    },

    #[error("unsupported record type '{record_type}' in {file} line {line}")]
    UnsupportedRecord {
        file: String,
        line: usize,
        record_type: String,
    },

    #[error("malformed line {line} in {file}: {reason}")]
    MalformedLine {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("could not identify device; tried addresses {tried_addresses:?}")]
    UnknownDevice { tried_addresses: Vec<u32> },

    #[error("no RAM routine for family={family:?} flash={flash_kb}kB bsl=0x{bsl_version:02x}")]
    UnsupportedRamRoutine {
        family: crate::routines::Family,
        flash_kb: u32,
        bsl_version: u8,
    },

    #[error("verification failed at address 0x{address:08x}: expected 0x{expected:02x}, got 0x{got:02x}")]
    VerifyFailed {
        address: u64,
        expected: u8,
        got: u8,
    },

    #[error("inverted range: start 0x{start:x} > stop 0x{stop:x}")]
    RangeInverted { start: u64, stop: u64 },

    #[error("crc mismatch for block at 0x{address:08x}: host computed 0x{expected:08x}, target returned 0x{got:08x}")]
    CrcMismatch {
        address: u64,
        expected: u32,
        got: u32,
    },

    #[error("memory image capacity exceeded")]
    ImageCapacityExceeded,

    #[error("failed to synchronize with target after retry budget exhausted")]
    SyncFailed,

    #[error("could not determine UART mode from target response")]
    ModeDetectFailed,
}

pub type Result<T> = std::result::Result<T, BslError>;
