// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The BSL protocol stack: wire framing, the stateful client built on top
//! of it, and on-target CRC-32 verification.

mod client;
mod crc_verify;
mod wire;

pub use client::{BslClient, ClientState, Session};
pub use crc_verify::crc_verify;
pub use wire::{ACK, NACK, SYNCH};
