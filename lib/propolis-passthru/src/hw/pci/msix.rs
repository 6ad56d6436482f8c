// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shadow of a passthrough device's MSI-X table, and the placement of the
//! trap which guards it.

use super::bar::PhysBar;
use super::bits::*;
use super::passthru::Error;
use super::phys::MsixCap;
use super::BarN;
use crate::common::{round_page_down, round_page_up};
use crate::mmio::TrapWindow;
use crate::vm::AddrModel;

/// Software copy of one MSI-X table entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MsixEntry {
    pub addr: u64,
    pub data: u32,
    pub vector_control: u32,
}
impl MsixEntry {
    fn mask(&mut self) {
        self.vector_control = MSIX_VCTRL_MASK;
        self.addr = 0;
        self.data = 0;
    }
    pub fn is_masked(&self) -> bool {
        self.vector_control & MSIX_VCTRL_MASK != 0
    }
}

#[derive(Debug)]
pub struct MsixState {
    table_bar: BarN,
    table_offset: u32,
    entries: Vec<MsixEntry>,

    mmio_hpa: u64,
    mmio_gpa: u64,
    mmio_size: u64,
    trap: Option<TrapWindow>,
}

impl MsixState {
    /// Build the shadow for a device with physical BARs `bars`.
    ///
    /// The table BAR must be one of those BARs, the vector count must be
    /// within what MSI-X allows, and the whole table must lie within the BAR.
    pub(super) fn new(cap: &MsixCap, bars: &[PhysBar]) -> Result<Self, Error> {
        let pbar = bars
            .get(cap.bar as usize)
            .ok_or(Error::MsixBarOutOfRange(cap.bar, bars.len()))?;
        if cap.count == 0 || cap.count > MSIX_VEC_MAX {
            return Err(Error::MsixCount(cap.count));
        }
        let table_end = u64::from(cap.table_offset)
            + u64::from(cap.count) * MSIX_TABLE_ENTRY_SIZE;
        if table_end > pbar.size {
            return Err(Error::MsixTableOutsideBar(cap.bar, table_end, pbar.size));
        }
        let mut entries = Vec::with_capacity(cap.count as usize);
        entries.resize_with(cap.count as usize, Default::default);
        let mut this = Self {
            table_bar: cap.bar,
            table_offset: cap.table_offset,
            entries,
            mmio_hpa: 0,
            mmio_gpa: 0,
            mmio_size: 0,
            trap: None,
        };
        this.mask_all();
        Ok(this)
    }

    pub fn table_bar(&self) -> BarN {
        self.table_bar
    }
    pub fn table_offset(&self) -> u32 {
        self.table_offset
    }
    pub fn table_count(&self) -> u16 {
        self.entries.len() as u16
    }
    pub fn entries(&self) -> &[MsixEntry] {
        &self.entries
    }
    pub fn mmio_hpa(&self) -> u64 {
        self.mmio_hpa
    }
    pub fn mmio_gpa(&self) -> u64 {
        self.mmio_gpa
    }
    pub fn mmio_size(&self) -> u64 {
        self.mmio_size
    }
    /// Window currently trapped on behalf of the table, if any
    pub fn trap(&self) -> Option<TrapWindow> {
        self.trap
    }

    /// Shadowed entry `idx`, for the table emulation to update
    pub fn entry_mut(&mut self, idx: u16) -> Option<&mut MsixEntry> {
        self.entries.get_mut(idx as usize)
    }

    /// Drop any interrupt configuration held in the shadow table
    pub(super) fn mask_all(&mut self) {
        self.entries.iter_mut().for_each(MsixEntry::mask);
    }

    pub(super) fn set_mmio(&mut self, hpa: u64, gpa: u64, size: u64) {
        self.mmio_hpa = hpa;
        self.mmio_gpa = gpa;
        self.mmio_size = size;
    }

    pub(super) fn set_trap(
        &mut self,
        trap: Option<TrapWindow>,
    ) -> Option<TrapWindow> {
        std::mem::replace(&mut self.trap, trap)
    }

    /// Window to trap for the table at its currently resolved location
    ///
    /// `None` while the table BAR is unassigned.
    pub fn trap_window(&self, model: AddrModel) -> Option<TrapWindow> {
        if self.mmio_gpa == 0 {
            return None;
        }
        Some(table_window(
            model,
            self.mmio_gpa,
            self.mmio_size,
            self.table_offset,
            self.table_count(),
        ))
    }
}

/// Guest-physical window which must trap to protect an MSI-X table.
///
/// With pre-assigned addressing the host emulates the whole BAR.  Otherwise
/// the mediator handles everything outside the table, so only the 4 KiB
/// pages the table occupies are claimed.  The PCI spec forbids MSI-X
/// structures from sharing a naturally aligned 4 KiB page with unrelated
/// registers (the PBA excepted), so those pages belong to the table alone.
pub fn table_window(
    model: AddrModel,
    bar_gpa: u64,
    bar_size: u64,
    table_offset: u32,
    count: u16,
) -> TrapWindow {
    match model {
        AddrModel::PreAssigned => TrapWindow::new(bar_gpa, bar_gpa + bar_size),
        AddrModel::Relayed => {
            let table = bar_gpa + u64::from(table_offset);
            let table_end = table + u64::from(count) * MSIX_TABLE_ENTRY_SIZE;
            TrapWindow::new(round_page_down(table), round_page_up(table_end))
        }
    }
}
