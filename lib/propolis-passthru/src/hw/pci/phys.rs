// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The physical side of a passthrough device.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::bar::{PhysBar, BAR_COUNT};
use super::cfgspace::CfgSpace;
use super::passthru::Error;
use super::{BarN, Bdf};

/// Raw access to a physical function's configuration space.
#[cfg_attr(test, mockall::automock)]
pub trait PhysCfgAccess: Send + Sync {
    fn cfg_read(&self, bdf: Bdf, offset: u16, width: u8) -> u32;
    fn cfg_write(&self, bdf: Bdf, offset: u16, width: u8, val: u32);
}

/// Location and size of the MSI-X table, per the device's capability.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MsixCap {
    /// BAR holding the table
    pub bar: BarN,
    /// Offset of the table within that BAR
    pub table_offset: u32,
    /// Number of vectors
    pub count: u16,
}

/// Enumerated physical function, as handed over for passthrough.
pub struct PhysDevice {
    bdf: Bdf,
    bars: Vec<PhysBar>,
    msix: Option<MsixCap>,
    cfg: Arc<dyn PhysCfgAccess>,
}

impl PhysDevice {
    pub fn new(
        bdf: Bdf,
        bars: Vec<PhysBar>,
        msix: Option<MsixCap>,
        cfg: Arc<dyn PhysCfgAccess>,
    ) -> Result<Self, Error> {
        if bars.len() > BAR_COUNT {
            return Err(Error::TooManyBars(bars.len()));
        }
        Ok(Self { bdf, bars, msix, cfg })
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }
    pub fn nr_bars(&self) -> usize {
        self.bars.len()
    }
    pub fn bars(&self) -> &[PhysBar] {
        &self.bars
    }
    /// # Panics
    ///
    /// If `n` is beyond the BARs of this device.
    pub fn bar(&self, n: BarN) -> &PhysBar {
        &self.bars[n as usize]
    }
    pub fn msix(&self) -> Option<&MsixCap> {
        self.msix.as_ref()
    }

    pub fn cfg_read(&self, offset: u16, width: u8) -> u32 {
        self.cfg.cfg_read(self.bdf, offset, width)
    }
    pub fn cfg_write(&self, offset: u16, width: u8, val: u32) {
        self.cfg.cfg_write(self.bdf, offset, width, val)
    }
}

/// Software-backed [PhysCfgAccess], for fixtures standing in for hardware.
///
/// Reads of functions which were never written return all-ones, as an absent
/// function would.
#[derive(Default)]
pub struct SoftCfg {
    funcs: Mutex<BTreeMap<Bdf, CfgSpace>>,
}

impl SoftCfg {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhysCfgAccess for SoftCfg {
    fn cfg_read(&self, bdf: Bdf, offset: u16, width: u8) -> u32 {
        let ones = match width {
            1 => 0xff,
            2 => 0xffff,
            _ => u32::MAX,
        };
        let funcs = self.funcs.lock().unwrap();
        funcs
            .get(&bdf)
            .and_then(|cfg| cfg.read(offset, width))
            .unwrap_or(ones)
    }

    fn cfg_write(&self, bdf: Bdf, offset: u16, width: u8, val: u32) {
        let mut funcs = self.funcs.lock().unwrap();
        if funcs.entry(bdf).or_default().write(offset, width, val).is_none() {
            panic!("bad config write to {bdf}: {width} bytes at {offset:#x}");
        }
    }
}
