// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Import/export for the four interchange formats a `MemoryImage` can be
//! built from or flattened to. Every importer is all-or-nothing: it builds
//! into a scratch image and only hands it to the caller once the whole
//! source has parsed cleanly, so a malformed file never leaves a partially
//! populated image in the caller's hands.

pub mod binary;
pub mod intel_hex;
pub mod srecord;
pub mod text;

pub use binary::{export_binary, import_binary};
pub use intel_hex::{export_intel_hex, import_intel_hex};
pub use srecord::{export_srecord, import_srecord};
pub use text::{export_text, import_text};
