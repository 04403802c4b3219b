// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side driver for the STM8 UART/SPI bootloader (BSL): frame-level
//! protocol, a sparse memory image with CRC-32 support, hex/binary
//! interchange codecs, device auto-identification, and the RAM-routine
//! asset table the protocol depends on to write or erase flash.
//!
//! The top-level entry point is [`bsl::BslClient`], built on any
//! [`transport::Transport`] implementation the caller supplies (this
//! crate owns no serial port or SPI device itself).

pub mod bsl;
pub mod error;
pub mod hex;
pub mod memory_image;
pub mod routines;
pub mod transport;

pub use bsl::{BslClient, ClientState, Session};
pub use error::{BslError, Result};
pub use memory_image::MemoryImage;
pub use routines::{DeviceDescriptor, Family, RoutineTable};
pub use transport::{Parity, Transport, UartMode};
