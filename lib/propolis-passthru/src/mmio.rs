// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MMIO interception windows over guest-physical space.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LE};

use crate::common::*;
use crate::hw::pci::Bdf;
use crate::util::aspace::ASpace;

/// Half-open guest-physical range `[lo, hi)` covered by a trap.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrapWindow {
    pub lo: u64,
    pub hi: u64,
}
impl TrapWindow {
    /// # Panics
    ///
    /// If the window is empty or inverted.
    pub fn new(lo: u64, hi: u64) -> Self {
        assert!(lo < hi, "empty trap window {lo:#x}..{hi:#x}");
        Self { lo, hi }
    }
    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.lo && addr < self.hi
    }
}
impl Display for TrapWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "[{:#x}, {:#x})", self.lo, self.hi)
    }
}

/// Emulation invoked when a guest access lands inside an installed window.
///
/// The offset of the operation is relative to the start of the window; its
/// length is the access width.
pub trait MmioTrapHandler: Send + Sync {
    fn trap_rw(&self, owner: Bdf, rwo: RWOp);
}

/// Installs and removes trap windows on behalf of passthrough devices.
///
/// Each owning device holds at most one window.  Registering a window for an
/// owner which already has one replaces it, and that replacement must appear
/// atomic to concurrent MMIO faults.
#[cfg_attr(test, mockall::automock)]
pub trait TrapRegistrar: Send + Sync {
    fn register_trap(
        &self,
        owner: Bdf,
        window: TrapWindow,
        handler: Arc<dyn MmioTrapHandler>,
    );
    fn unregister_trap(&self, owner: Bdf);
}

struct Trap {
    owner: Bdf,
    handler: Arc<dyn MmioTrapHandler>,
}

struct Inner {
    space: ASpace<Trap>,
    owners: BTreeMap<Bdf, TrapWindow>,
}

/// In-memory [TrapRegistrar] which also dispatches guest accesses.
pub struct MmioTraps {
    inner: Mutex<Inner>,
}
impl MmioTraps {
    /// Create a trap table covering guest-physical `[0, limit)`
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                space: ASpace::new(limit),
                owners: BTreeMap::new(),
            }),
        }
    }

    /// Currently installed windows, sorted by owner
    pub fn windows(&self) -> Vec<(Bdf, TrapWindow)> {
        let inner = self.inner.lock().unwrap();
        inner.owners.iter().map(|(bdf, win)| (*bdf, *win)).collect()
    }

    pub fn window_of(&self, owner: Bdf) -> Option<TrapWindow> {
        self.inner.lock().unwrap().owners.get(&owner).copied()
    }

    pub fn handle_write(&self, addr: u64, bytes: u8, val: u64) -> Option<()> {
        let buf = val.to_le_bytes();
        let data = match bytes {
            1 => &buf[0..1],
            2 => &buf[0..2],
            4 => &buf[0..4],
            8 => &buf[0..],
            _ => panic!("bad MMIO width {bytes}"),
        };
        self.do_mmio(addr, |owner, off, handler| {
            let mut wo = WriteOp::from_buf(off, data);
            handler.trap_rw(owner, RWOp::Write(&mut wo));
        })
    }

    pub fn handle_read(&self, addr: u64, bytes: u8) -> Option<u64> {
        let mut buf = [0xffu8; 8];
        let data = match bytes {
            1 => &mut buf[0..1],
            2 => &mut buf[0..2],
            4 => &mut buf[0..4],
            8 => &mut buf[0..],
            _ => panic!("bad MMIO width {bytes}"),
        };
        self.do_mmio(addr, |owner, off, handler| {
            let mut ro = ReadOp::from_buf(off, data);
            handler.trap_rw(owner, RWOp::Read(&mut ro));
        })?;
        Some(LE::read_uint(&buf, bytes as usize))
    }

    fn do_mmio<F>(&self, addr: u64, f: F) -> Option<()>
    where
        F: FnOnce(Bdf, usize, &Arc<dyn MmioTrapHandler>),
    {
        let inner = self.inner.lock().unwrap();
        let (start, _len, trap) = inner.space.region_at(addr)?;
        let owner = trap.owner;
        let handler = Arc::clone(&trap.handler);
        // unlock before entering handler
        drop(inner);
        f(owner, (addr - start) as usize, &handler);
        Some(())
    }
}

impl TrapRegistrar for MmioTraps {
    fn register_trap(
        &self,
        owner: Bdf,
        window: TrapWindow,
        handler: Arc<dyn MmioTrapHandler>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.owners.remove(&owner) {
            inner.space.unregister(old.lo).unwrap();
        }
        if let Err(e) =
            inner.space.register(window.lo, window.len(), Trap { owner, handler })
        {
            panic!("MSI-X trap {window} for {owner} not installable: {e}");
        }
        inner.owners.insert(owner, window);
    }

    fn unregister_trap(&self, owner: Bdf) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.owners.remove(&owner) {
            inner.space.unregister(old.lo).unwrap();
        }
    }
}
