// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BAR virtualization for PCI devices passed through to a guest.
//!
//! The guest sees a shadow copy of each physical BAR.  Relocation writes to
//! that shadow are translated into second-stage mappings onto the device's
//! fixed host-physical ranges, while the page(s) holding the MSI-X table are
//! kept behind an MMIO trap so interrupt configuration stays under the
//! control of the host.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod common;
pub mod ept;
pub mod hw;
pub mod mmio;
pub mod util;
pub mod vm;

pub use hw::pci::passthru::{PtConfig, PtDevice, VirtualDevice};
pub use vm::{AddrModel, VmCtx};
