// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::bits;
use crate::common::round_page_up;

pub const BAR_COUNT: usize = 6;

/// Decoding type of a physical BAR
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum BarKind {
    Empty,
    Pio,
    Mmio,
    Mmio64,
}
impl BarKind {
    /// Kind represents an MMIO-backed (32-bit or 64-bit) BAR
    pub fn is_mmio(&self) -> bool {
        matches!(self, BarKind::Mmio | BarKind::Mmio64)
    }
}

/// A BAR of the physical device, as assigned by platform firmware.
///
/// Never modified once the device has been enumerated.
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct PhysBar {
    pub kind: BarKind,
    /// Host-physical base address
    pub base: u64,
    pub size: u64,
}
impl PhysBar {
    pub const fn empty() -> Self {
        Self { kind: BarKind::Empty, base: 0, size: 0 }
    }
    pub const fn mmio(base: u64, size: u64) -> Self {
        Self { kind: BarKind::Mmio, base, size }
    }
    pub const fn mmio64(base: u64, size: u64) -> Self {
        Self { kind: BarKind::Mmio64, base, size }
    }
    pub const fn pio(base: u64, size: u64) -> Self {
        Self { kind: BarKind::Pio, base, size }
    }

    /// Can this BAR be presented to a guest?
    ///
    /// Only memory BARs with a power-of-two size no larger than 4 GiB are
    /// virtualized.
    pub fn is_supported(&self) -> bool {
        self.kind.is_mmio()
            && self.size.is_power_of_two()
            && self.size <= bits::BAR_SIZE_MAX
    }
}

/// Kinds of BAR exposed to the guest.  64-bit physical BARs are presented
/// as 32-bit ones.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub enum VBarKind {
    #[default]
    Empty,
    Mmio32,
}

/// Guest-visible shadow of a BAR.
#[derive(Eq, PartialEq, Clone, Copy, Debug, Default)]
pub struct VirtBar {
    pub kind: VBarKind,
    /// Guest-physical base, 0 when unassigned
    pub base: u64,
    pub size: u64,
}
impl VirtBar {
    /// Derive the guest-visible BAR from its physical counterpart.
    ///
    /// The size is rounded up to 4 KiB so that any guest placement of the
    /// BAR on its size boundary is page-aligned.
    pub fn from_phys(pbar: &PhysBar) -> Self {
        if pbar.is_supported() {
            Self {
                kind: VBarKind::Mmio32,
                base: 0,
                size: round_page_up(pbar.size),
            }
        } else {
            Self::default()
        }
    }

    /// Alignment mask for writes to the BAR register
    ///
    /// A 4 GiB BAR yields an all-zero mask: it can only ever sit at 0.
    pub fn mask(&self) -> u32 {
        match self.kind {
            VBarKind::Empty => 0,
            VBarKind::Mmio32 => !((self.size - 1) as u32),
        }
    }
}
