// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI config registers.

pub const LEN_CFG: usize = 0x100;

pub const OFF_CMD: u16 = 0x04;
pub const OFF_BAR0: u16 = 0x10;
pub const LEN_BAR: u16 = 4;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RegCmd: u16 {
        const IO_EN = 1 << 0;
        const MMIO_EN = 1 << 1;
        const BUSMSTR_EN = 1 << 2;
        const INTX_DIS = 1 << 10;
    }
}

/// BAR size ceiling for virtualization (4 GiB)
pub const BAR_SIZE_MAX: u64 = 1 << 32;

/// Written to a BAR by a guest sizing it, rather than relocating it
pub const BAR_PROBE: u32 = u32::MAX;

pub const MSIX_TABLE_ENTRY_SIZE: u64 = 16;
pub const MSIX_VEC_MAX: u16 = 2048;
/// Vector control: per-vector mask bit
pub const MSIX_VCTRL_MASK: u32 = 1 << 0;

pub(super) const MASK_FUNC: u8 = 0x07;
pub(super) const MASK_DEV: u8 = 0x1f;
pub(super) const MASK_BUS: u8 = 0xff;
