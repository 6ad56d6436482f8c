// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI base address register (BAR) virtualization for passthrough devices.
//!
//! Each physical BAR (the "pbar") holds a host-physical address assigned by
//! platform firmware.  It is never altered here.  The guest instead sees a
//! virtual BAR (the "vbar") which is either unassigned (0) or holds a
//! guest-physical address, set up front from configuration or programmed
//! by the guest itself.
//!
//! Guest relocations of a memory vbar are mirrored into the second-stage
//! tables as a mapping of the vbar's guest-physical range onto the pbar.
//! The BAR holding the MSI-X table is never mapped that way: the pages it
//! occupies are trapped, so that the host sees (and remaps) all interrupt
//! configuration done by the guest.

use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LE};
use slog::{debug, info};
use thiserror::Error;

use super::bar::{VBarKind, VirtBar, BAR_COUNT};
use super::bits::*;
use super::cfgspace::CfgSpace;
use super::msix::{MsixEntry, MsixState};
use super::phys::PhysDevice;
use super::{BarN, Bdf};
use crate::common::RWOp;
use crate::mmio::MmioTrapHandler;
use crate::vm::{MapFlags, VmCtx};

/// Conditions which prevent a passthrough device from being attached.
///
/// Each represents a defect in device enumeration or configuration rather
/// than anything the guest can provoke.
#[derive(Debug, Error)]
pub enum Error {
    #[error("passthrough device has no BARs")]
    NoBars,

    #[error("device reports {0} BARs, no more than 6 are possible")]
    TooManyBars(usize),

    #[error("MSI-X table in {0:?}, but device only has {1} BARs")]
    MsixBarOutOfRange(BarN, usize),

    #[error("MSI-X vector count {0} outside of 1..=2048")]
    MsixCount(u16),

    #[error("MSI-X table ends at {1:#x} in {0:?}, past BAR size {2:#x}")]
    MsixTableOutsideBar(BarN, u64, u64),

    #[error("guest address configured for {0:?}, but device only has {1} BARs")]
    VbarOutOfRange(BarN, usize),
}

/// Guest-physical bases assigned to a device's BARs out-of-band.
///
/// Only honored under pre-assigned addressing.  A base of 0 leaves the BAR
/// unassigned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PtConfig {
    pub vbar: [u32; BAR_COUNT],
}
impl PtConfig {
    pub fn with_vbar(mut self, n: BarN, base: u32) -> Self {
        self.vbar[n as usize] = base;
        self
    }
}

/// Guest-facing state of a passthrough device's BARs.
///
/// All mutation happens through `&mut self`: whoever dispatches config space
/// accesses must hold exclusive access to the device across each call (see
/// [PtDevice] for a locked wrapper).
pub struct VirtualDevice {
    log: slog::Logger,
    pdev: Arc<PhysDevice>,
    nr_bars: usize,
    bars: [VirtBar; BAR_COUNT],
    cfg: CfgSpace,
    msix: Option<MsixState>,
    msix_hdl: Arc<dyn MmioTrapHandler>,
}

impl VirtualDevice {
    /// Create the virtual side of `pdev`, at the time it is attached to the
    /// VM and before the guest can observe it.
    ///
    /// Under pre-assigned addressing, every BAR is classified, any base
    /// supplied in `cfg` is programmed (establishing its mapping or MSI-X
    /// trap), and legacy INTx is disabled on the physical function.  Under
    /// relayed addressing, BARs are left unassigned for the guest and its
    /// mediator to program.
    ///
    /// Guest accesses to the MSI-X table will be directed to `msix_hdl`.
    pub fn init_passthrough(
        ctx: &VmCtx,
        log: &slog::Logger,
        pdev: Arc<PhysDevice>,
        cfg: &PtConfig,
        msix_hdl: Arc<dyn MmioTrapHandler>,
    ) -> Result<Self, Error> {
        let nr_bars = pdev.nr_bars();
        if nr_bars == 0 {
            return Err(Error::NoBars);
        }
        if let Some(n) = BarN::iter()
            .skip(nr_bars)
            .find(|n| cfg.vbar[*n as usize] != 0)
        {
            return Err(Error::VbarOutOfRange(n, nr_bars));
        }
        let msix = pdev
            .msix()
            .map(|cap| MsixState::new(cap, pdev.bars()))
            .transpose()?;

        let log = log.new(slog::o!(
            "component" => "pci-passthru",
            "bdf" => pdev.bdf().to_string(),
        ));
        let mut this = Self {
            log,
            pdev,
            nr_bars,
            bars: Default::default(),
            cfg: CfgSpace::new(),
            msix,
            msix_hdl,
        };

        if ctx.is_pre_assigned() {
            for n in BarN::iter().take(nr_bars) {
                let pbar = this.pdev.bar(n);
                let vbar = VirtBar::from_phys(pbar);
                this.bars[n as usize] = vbar;

                if vbar.kind == VBarKind::Empty {
                    info!(this.log, "hiding unsupported BAR";
                        "bar" => ?n,
                        "kind" => ?pbar.kind,
                        "size" => pbar.size);
                    continue;
                }
                info!(this.log, "virtualizing BAR";
                    "bar" => ?n,
                    "hpa" => format!("{:#x}", pbar.base),
                    "size" => vbar.size);

                let base = cfg.vbar[n as usize];
                if base != 0 {
                    this.write_vbar(ctx, n, base);
                }
            }
            this.disable_intx();
        }

        Ok(this)
    }

    pub fn bdf(&self) -> Bdf {
        self.pdev.bdf()
    }
    pub fn nr_bars(&self) -> usize {
        self.nr_bars
    }
    pub fn phys(&self) -> &PhysDevice {
        &self.pdev
    }
    /// Guest-visible state of BAR `n`, if the device has it
    pub fn vbar(&self, n: BarN) -> Option<&VirtBar> {
        self.bars[..self.nr_bars].get(n as usize)
    }
    pub fn msix(&self) -> Option<&MsixState> {
        self.msix.as_ref()
    }
    /// Shadowed MSI-X table entry `idx`, for the table emulation to update
    /// as the guest programs vectors.
    pub fn msix_entry_mut(&mut self, idx: u16) -> Option<&mut MsixEntry> {
        self.msix.as_mut()?.entry_mut(idx)
    }

    /// The BAR register, among those this device has, covering `offset`
    fn bar_at(&self, offset: u16) -> Option<BarN> {
        BarN::from_cfg_offset(offset).filter(|n| (*n as usize) < self.nr_bars)
    }

    fn is_msix_table_bar(&self, n: BarN) -> bool {
        self.msix.as_ref().map(|m| m.table_bar() == n).unwrap_or(false)
    }

    /// Service a guest config space read.
    ///
    /// Returns `None` when the access is not for this subsystem: the VM does
    /// not use pre-assigned addressing, or `offset` is outside the device's
    /// BAR registers.
    pub fn read_cfg(&self, ctx: &VmCtx, offset: u16, width: u8) -> Option<u32> {
        if !ctx.is_pre_assigned() {
            return None;
        }
        self.bar_at(offset)?;
        self.cfg.read(offset, width)
    }

    /// Service a guest config space write.
    ///
    /// Beyond the conditions under which [VirtualDevice::read_cfg] declines
    /// an access, BAR writes which are not 4 bytes wide and 4-byte aligned
    /// are dropped and reported as not handled.
    pub fn write_cfg(
        &mut self,
        ctx: &VmCtx,
        offset: u16,
        width: u8,
        val: u32,
    ) -> Option<()> {
        if !ctx.is_pre_assigned() {
            return None;
        }
        let n = self.bar_at(offset)?;
        if width != 4 || offset & 0x3 != 0 {
            debug!(self.log, "ignoring partial BAR write";
                "offset" => offset, "width" => width);
            return None;
        }
        self.write_vbar(ctx, n, val);
        Some(())
    }

    fn write_vbar(&mut self, ctx: &VmCtx, n: BarN, val: u32) {
        let idx = n as usize;
        let vbar = self.bars[idx];

        let new_bar = match vbar.kind {
            VBarKind::Empty => {
                self.bars[idx].base = 0;
                0
            }
            VBarKind::Mmio32 => {
                let new_bar = val & vbar.mask();
                // A sizing probe only latches the mask into the register
                if val != BAR_PROBE {
                    let base = u64::from(new_bar);
                    if self.is_msix_table_bar(n) {
                        self.bars[idx].base = base;
                        self.remap_msix_table_bar(ctx);
                    } else {
                        self.remap_generic_bar(ctx, n, base);
                        self.bars[idx].base = base;
                    }
                }
                new_bar
            }
        };

        self.cfg.write_u32(n.cfg_offset(), new_bar);
    }

    /// Move the second-stage mapping of a (non-MSI-X) memory BAR from its
    /// current guest base to `new_base`.  Either may be 0 (unmapped).
    ///
    /// The shadow base is left for the caller to update.
    fn remap_generic_bar(&self, ctx: &VmCtx, n: BarN, new_base: u64) {
        let vbar = &self.bars[n as usize];
        let hpa = self.pdev.bar(n).base;

        if vbar.base != 0 {
            ctx.ept.remove_mapping(ctx.ept_root, vbar.base, vbar.size);
        }
        if new_base != 0 {
            ctx.ept.add_mapping(
                ctx.ept_root,
                hpa,
                new_base,
                vbar.size,
                MapFlags::RW | MapFlags::UNCACHED,
            );
        }
        debug!(self.log, "relocated BAR";
            "bar" => ?n,
            "old" => format!("{:#x}", vbar.base),
            "new" => format!("{:#x}", new_base),
            "hpa" => format!("{:#x}", hpa));
    }

    /// Re-resolve the location of the MSI-X table and move its trap to
    /// match.
    ///
    /// Every shadowed vector is masked first, so no interrupt configuration
    /// survives a relocation.  Under relayed addressing this is the entry
    /// point for the mediator to call when it moves the table BAR.  It is a
    /// no-op for devices without MSI-X.
    pub fn remap_msix_table_bar(&mut self, ctx: &VmCtx) {
        let Some(msix) = self.msix.as_mut() else {
            return;
        };
        let bdf = self.pdev.bdf();
        msix.mask_all();

        let n = msix.table_bar();
        let pbar = self.pdev.bar(n);
        let gpa = if ctx.is_pre_assigned() {
            self.bars[n as usize].base
        } else {
            ctx.xlate.host_to_guest(pbar.base)
        };
        msix.set_mmio(pbar.base, gpa, pbar.size);

        match msix.trap_window(ctx.model) {
            Some(win) => {
                ctx.traps.register_trap(bdf, win, Arc::clone(&self.msix_hdl));
                msix.set_trap(Some(win));
                info!(self.log, "trapping MSI-X table";
                    "bar" => ?n, "window" => %win);
            }
            None => {
                if let Some(old) = msix.set_trap(None) {
                    ctx.traps.unregister_trap(bdf);
                    info!(self.log, "released MSI-X table trap";
                        "bar" => ?n, "window" => %old);
                }
            }
        }
    }

    fn disable_intx(&self) {
        let raw = self.pdev.cfg_read(OFF_CMD, 2) as u16;
        let cmd = RegCmd::from_bits_retain(raw) | RegCmd::INTX_DIS;
        self.pdev.cfg_write(OFF_CMD, 2, u32::from(cmd.bits()));
        debug!(self.log, "disabled INTx"; "cmd" => format!("{:#x}", cmd.bits()));
    }

    /// Release everything installed on behalf of the device: mappings for
    /// its generic memory BARs and any MSI-X trap.
    pub fn teardown(self, ctx: &VmCtx) {
        for n in BarN::iter().take(self.nr_bars) {
            let vbar = &self.bars[n as usize];
            if vbar.kind == VBarKind::Mmio32
                && vbar.base != 0
                && !self.is_msix_table_bar(n)
            {
                ctx.ept.remove_mapping(ctx.ept_root, vbar.base, vbar.size);
            }
        }
        if let Some(win) = self.msix.as_ref().and_then(MsixState::trap) {
            ctx.traps.unregister_trap(self.pdev.bdf());
            info!(self.log, "released MSI-X table trap"; "window" => %win);
        }
        info!(self.log, "detached");
    }
}

/// A [VirtualDevice] shareable between vCPUs.
///
/// The device lock is held across each entire config space access.
pub struct PtDevice {
    bdf: Bdf,
    inner: Mutex<VirtualDevice>,
}

impl PtDevice {
    pub fn new(vdev: VirtualDevice) -> Self {
        Self { bdf: vdev.bdf(), inner: Mutex::new(vdev) }
    }

    pub fn bdf(&self) -> Bdf {
        self.bdf
    }

    pub fn lock(&self) -> MutexGuard<'_, VirtualDevice> {
        self.inner.lock().unwrap()
    }

    pub fn cfg_read(&self, ctx: &VmCtx, offset: u16, width: u8) -> Option<u32> {
        self.lock().read_cfg(ctx, offset, width)
    }

    pub fn cfg_write(
        &self,
        ctx: &VmCtx,
        offset: u16,
        width: u8,
        val: u32,
    ) -> Option<()> {
        self.lock().write_cfg(ctx, offset, width, val)
    }

    /// Service a config space operation, as decoded by a config space
    /// dispatcher.  The operation offset is the offset within the device's
    /// config space.
    ///
    /// Returns `None` if the access was not handled, leaving a read
    /// operation unfilled for the dispatcher to complete.
    pub fn cfg_rw(&self, ctx: &VmCtx, rwo: RWOp) -> Option<()> {
        let offset = u16::try_from(rwo.offset()).ok()?;
        let width = u8::try_from(rwo.len()).ok()?;
        match rwo {
            RWOp::Read(ro) => {
                let val = self.cfg_read(ctx, offset, width)?;
                let mut buf = [0u8; 4];
                LE::write_u32(&mut buf, val);
                ro.write_bytes(&buf[..width as usize]);
                Some(())
            }
            RWOp::Write(wo) => {
                if width > 4 {
                    return None;
                }
                let mut buf = [0u8; 4];
                wo.read_bytes(&mut buf[..width as usize]);
                self.cfg_write(ctx, offset, width, LE::read_u32(&buf))
            }
        }
    }

    /// Detach the device, releasing its mappings and trap
    pub fn teardown(self, ctx: &VmCtx) {
        self.inner.into_inner().unwrap().teardown(ctx);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::pci::bar::PhysBar;
    use crate::hw::pci::phys::{MockPhysCfgAccess, MsixCap};
    use crate::hw::pci::test::{test_logger, NullHdl};
    use crate::mmio::{MockTrapRegistrar, TrapWindow};
    use crate::vm::{AddrModel, EptRoot, MockSecondStage};

    use mockall::predicate::*;
    use mockall::Sequence;

    const ROOT: EptRoot = EptRoot(0x4000);
    const BDF: Bdf = Bdf::new_unchecked(0, 5, 0);
    const DEV_MEM: MapFlags = MapFlags::RW.union(MapFlags::UNCACHED);

    fn ctx(
        model: AddrModel,
        ept: MockSecondStage,
        traps: MockTrapRegistrar,
    ) -> VmCtx {
        VmCtx::new(&test_logger(), model, ROOT, Arc::new(ept), Arc::new(traps))
    }

    /// Physical config space which expects exactly one INTx disable
    fn intx_cfg() -> MockPhysCfgAccess {
        let mut cfg = MockPhysCfgAccess::new();
        cfg.expect_cfg_read()
            .with(eq(BDF), eq(OFF_CMD), eq(2))
            .times(1)
            .return_const(0x0006u32);
        cfg.expect_cfg_write()
            .with(eq(BDF), eq(OFF_CMD), eq(2), eq(0x0406))
            .times(1)
            .return_const(());
        cfg
    }

    fn pdev(
        bars: Vec<PhysBar>,
        msix: Option<MsixCap>,
        cfg: MockPhysCfgAccess,
    ) -> Arc<PhysDevice> {
        Arc::new(PhysDevice::new(BDF, bars, msix, Arc::new(cfg)).unwrap())
    }

    fn attach(
        ctx: &VmCtx,
        pdev: Arc<PhysDevice>,
        cfg: &PtConfig,
    ) -> Result<VirtualDevice, Error> {
        VirtualDevice::init_passthrough(
            ctx,
            &test_logger(),
            pdev,
            cfg,
            Arc::new(NullHdl),
        )
    }

    #[test]
    fn mem_and_io_bars() {
        let mut ept = MockSecondStage::new();
        ept.expect_add_mapping()
            .with(
                eq(ROOT),
                eq(0xf000_0000),
                eq(0x8000_0000),
                eq(65536),
                eq(DEV_MEM),
            )
            .times(1)
            .return_const(());
        let ctx = ctx(AddrModel::PreAssigned, ept, MockTrapRegistrar::new());
        let pdev = pdev(
            vec![PhysBar::mmio(0xf000_0000, 0x10000), PhysBar::pio(0xc000, 0x40)],
            None,
            intx_cfg(),
        );

        let mut vdev = attach(&ctx, pdev, &PtConfig::default()).unwrap();
        let bar0 = *vdev.vbar(BarN::BAR0).unwrap();
        assert_eq!(bar0.kind, VBarKind::Mmio32);
        assert_eq!(bar0.size, 65536);
        assert_eq!(bar0.base, 0);
        let bar1 = *vdev.vbar(BarN::BAR1).unwrap();
        assert_eq!(bar1.kind, VBarKind::Empty);
        assert_eq!(bar1.size, 0);
        assert!(vdev.vbar(BarN::BAR2).is_none());

        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0x8000_0000), Some(()));
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0x8000_0000);
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0x8000_0000));

        // the IO BAR swallows writes and reads back as absent
        assert_eq!(vdev.write_cfg(&ctx, 0x14, 4, 0xc001), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x14, 4), Some(0));
        assert_eq!(vdev.vbar(BarN::BAR1).unwrap().base, 0);
    }

    #[test]
    fn probe_then_relocate() {
        let mut seq = Sequence::new();
        let mut ept = MockSecondStage::new();
        ept.expect_add_mapping()
            .with(eq(ROOT), eq(0xf000_0000), eq(0x8000_0000), eq(0x10000), eq(DEV_MEM))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        ept.expect_remove_mapping()
            .with(eq(ROOT), eq(0x8000_0000), eq(0x10000))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        ept.expect_add_mapping()
            .with(eq(ROOT), eq(0xf000_0000), eq(0x9000_0000), eq(0x10000), eq(DEV_MEM))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        let ctx = ctx(AddrModel::PreAssigned, ept, MockTrapRegistrar::new());
        let pdev =
            pdev(vec![PhysBar::mmio(0xf000_0000, 0x10000)], None, intx_cfg());
        let cfg = PtConfig::default().with_vbar(BarN::BAR0, 0x8000_0000);

        let mut vdev = attach(&ctx, pdev, &cfg).unwrap();
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0x8000_0000);

        // sizing probe: mask latched, nothing remapped
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, u32::MAX), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0xffff_0000));
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0x8000_0000);

        // low bits below the BAR alignment are discarded
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0x9000_1234), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0x9000_0000));
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0x9000_0000);
    }

    #[test]
    fn malformed_writes_dropped() {
        // any mapping call would fail the test
        let ctx = ctx(
            AddrModel::PreAssigned,
            MockSecondStage::new(),
            MockTrapRegistrar::new(),
        );
        let pdev =
            pdev(vec![PhysBar::mmio(0xf000_0000, 0x1000)], None, intx_cfg());
        let mut vdev = attach(&ctx, pdev, &PtConfig::default()).unwrap();
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, u32::MAX), Some(()));

        assert_eq!(vdev.write_cfg(&ctx, 0x10, 2, 0x8000), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x12, 2, 0x8000), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x11, 4, 0x8000_0000), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 1, 0x80), None);

        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0xffff_f000));
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0);
    }

    #[test]
    fn outside_bar_range() {
        let ctx = ctx(
            AddrModel::PreAssigned,
            MockSecondStage::new(),
            MockTrapRegistrar::new(),
        );
        let pdev = pdev(
            vec![PhysBar::mmio(0xf000_0000, 0x1000), PhysBar::empty()],
            None,
            intx_cfg(),
        );
        let mut vdev = attach(&ctx, pdev, &PtConfig::default()).unwrap();

        assert_eq!(vdev.read_cfg(&ctx, 0x0c, 4), None);
        assert_eq!(vdev.read_cfg(&ctx, 0x17, 1), Some(0));
        // BAR2 is beyond this device's BARs
        assert_eq!(vdev.read_cfg(&ctx, 0x18, 4), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x18, 4, 0x8000_0000), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x04, 4, 0x6), None);
    }

    #[test]
    fn relayed_is_hands_off() {
        let ctx =
            ctx(AddrModel::Relayed, MockSecondStage::new(), MockTrapRegistrar::new());
        // no physical config accesses are expected either
        let pdev = pdev(
            vec![PhysBar::mmio(0xf000_0000, 0x1000)],
            None,
            MockPhysCfgAccess::new(),
        );
        let cfg = PtConfig::default().with_vbar(BarN::BAR0, 0x8000_0000);
        let mut vdev = attach(&ctx, pdev, &cfg).unwrap();

        assert_eq!(*vdev.vbar(BarN::BAR0).unwrap(), VirtBar::default());
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), None);
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0x8000_0000), None);
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0);
    }

    #[test]
    fn attach_preconditions() {
        let ctx = ctx(
            AddrModel::PreAssigned,
            MockSecondStage::new(),
            MockTrapRegistrar::new(),
        );
        let res = attach(
            &ctx,
            pdev(vec![], None, MockPhysCfgAccess::new()),
            &PtConfig::default(),
        );
        assert!(matches!(res, Err(Error::NoBars)));

        let msix = MsixCap { bar: BarN::BAR1, table_offset: 0, count: 4 };
        let res = attach(
            &ctx,
            pdev(
                vec![PhysBar::mmio(0xf000_0000, 0x1000)],
                Some(msix),
                MockPhysCfgAccess::new(),
            ),
            &PtConfig::default(),
        );
        assert!(matches!(res, Err(Error::MsixBarOutOfRange(BarN::BAR1, 1))));

        let res = attach(
            &ctx,
            pdev(
                vec![PhysBar::mmio(0xf000_0000, 0x1000)],
                None,
                MockPhysCfgAccess::new(),
            ),
            &PtConfig::default().with_vbar(BarN::BAR3, 0x8000_0000),
        );
        assert!(matches!(res, Err(Error::VbarOutOfRange(BarN::BAR3, 1))));
    }

    #[test]
    fn msix_table_beyond_bar_rejected() {
        // any trap registration would fail the test
        let ctx = ctx(
            AddrModel::Relayed,
            MockSecondStage::new(),
            MockTrapRegistrar::new(),
        );
        let msix = MsixCap { bar: BarN::BAR0, table_offset: 0x1000, count: 8 };
        let res = attach(
            &ctx,
            pdev(
                vec![PhysBar::mmio(0xf000_1000, 0x1000)],
                Some(msix),
                MockPhysCfgAccess::new(),
            ),
            &PtConfig::default(),
        );
        assert!(matches!(
            res,
            Err(Error::MsixTableOutsideBar(BarN::BAR0, 0x1080, 0x1000))
        ));
    }

    #[test]
    fn msix_bar_is_trapped_not_mapped() {
        let mut seq = Sequence::new();
        let mut traps = MockTrapRegistrar::new();
        traps
            .expect_register_trap()
            .withf(|owner, win, _| {
                *owner == BDF
                    && *win == TrapWindow::new(0x8000_0000, 0x8000_4000)
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        traps
            .expect_register_trap()
            .withf(|owner, win, _| {
                *owner == BDF
                    && *win == TrapWindow::new(0x8100_0000, 0x8100_4000)
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        traps
            .expect_unregister_trap()
            .with(eq(BDF))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        // generic BAR1 is still mapped normally
        let mut ept = MockSecondStage::new();
        ept.expect_add_mapping()
            .with(eq(ROOT), eq(0xf100_0000), eq(0x8200_0000), eq(0x1000), eq(DEV_MEM))
            .times(1)
            .return_const(());

        let ctx = ctx(AddrModel::PreAssigned, ept, traps);
        let msix = MsixCap { bar: BarN::BAR0, table_offset: 0x2000, count: 16 };
        let pdev = pdev(
            vec![
                PhysBar::mmio(0xf000_0000, 0x4000),
                PhysBar::mmio(0xf100_0000, 0x1000),
            ],
            Some(msix),
            intx_cfg(),
        );
        let cfg = PtConfig::default()
            .with_vbar(BarN::BAR0, 0x8000_0000)
            .with_vbar(BarN::BAR1, 0x8200_0000);
        let mut vdev = attach(&ctx, pdev, &cfg).unwrap();

        let state = vdev.msix().unwrap();
        assert_eq!(state.mmio_hpa(), 0xf000_0000);
        assert_eq!(state.mmio_gpa(), 0x8000_0000);
        assert_eq!(state.mmio_size(), 0x4000);
        assert_eq!(state.trap(), Some(TrapWindow::new(0x8000_0000, 0x8000_4000)));

        let vec5 =
            MsixEntry { addr: 0xfee0_5000, data: 0x4025, vector_control: 0 };
        *vdev.msix_entry_mut(5).unwrap() = vec5;
        assert!(vdev.msix_entry_mut(16).is_none());

        // a probe neither moves the trap nor touches the vectors
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, u32::MAX), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0xffff_c000));
        assert_eq!(vdev.msix().unwrap().entries()[5], vec5);

        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0x8100_0000), Some(()));
        assert_eq!(vdev.msix().unwrap().mmio_gpa(), 0x8100_0000);
        assert_eq!(
            vdev.msix().unwrap().entries()[5],
            MsixEntry { addr: 0, data: 0, vector_control: MSIX_VCTRL_MASK }
        );
        assert!(vdev.msix().unwrap().entries().iter().all(|e| e.is_masked()));

        // unassigning the table BAR releases the trap
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0), Some(()));
        assert_eq!(vdev.msix().unwrap().trap(), None);
        assert_eq!(vdev.msix().unwrap().mmio_gpa(), 0);
    }

    #[test]
    fn relayed_msix_window() {
        let mut traps = MockTrapRegistrar::new();
        traps
            .expect_register_trap()
            .withf(|owner, win, _| {
                *owner == BDF
                    && *win == TrapWindow::new(0x9000_1000, 0x9000_2000)
            })
            .times(1)
            .return_const(());
        let ctx = ctx(AddrModel::Relayed, MockSecondStage::new(), traps)
            .with_xlate(Arc::new(|hpa: u64| hpa - 0x6000_0000));
        let msix = MsixCap { bar: BarN::BAR0, table_offset: 0, count: 8 };
        let pdev = pdev(
            vec![PhysBar::mmio(0xf000_1000, 0x1000)],
            Some(msix),
            MockPhysCfgAccess::new(),
        );
        let mut vdev = attach(&ctx, pdev, &PtConfig::default()).unwrap();
        assert_eq!(vdev.msix().unwrap().trap(), None);

        vdev.remap_msix_table_bar(&ctx);
        let state = vdev.msix().unwrap();
        assert_eq!(state.mmio_hpa(), 0xf000_1000);
        assert_eq!(state.mmio_gpa(), 0x9000_1000);
        assert_eq!(state.trap(), Some(TrapWindow::new(0x9000_1000, 0x9000_2000)));
    }

    #[test]
    fn whole_address_space_bar() {
        // A 4 GiB BAR has an empty alignment mask: relocation can only ever
        // resolve to 0, and a sizing probe reads back as 0.
        let mut ept = MockSecondStage::new();
        ept.expect_add_mapping().never();
        ept.expect_remove_mapping().never();
        let ctx = ctx(AddrModel::PreAssigned, ept, MockTrapRegistrar::new());
        let pdev = pdev(vec![PhysBar::mmio64(0, 1 << 32)], None, intx_cfg());
        let mut vdev = attach(&ctx, pdev, &PtConfig::default()).unwrap();
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().kind, VBarKind::Mmio32);

        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, u32::MAX), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0));
        assert_eq!(vdev.write_cfg(&ctx, 0x10, 4, 0x8000_0000), Some(()));
        assert_eq!(vdev.read_cfg(&ctx, 0x10, 4), Some(0));
        assert_eq!(vdev.vbar(BarN::BAR0).unwrap().base, 0);
    }

    #[test]
    fn teardown_releases_all() {
        let mut ept = MockSecondStage::new();
        ept.expect_add_mapping().times(1).return_const(());
        ept.expect_remove_mapping()
            .with(eq(ROOT), eq(0x8200_0000), eq(0x1000))
            .times(1)
            .return_const(());
        let mut traps = MockTrapRegistrar::new();
        traps.expect_register_trap().times(1).return_const(());
        traps.expect_unregister_trap().with(eq(BDF)).times(1).return_const(());

        let ctx = ctx(AddrModel::PreAssigned, ept, traps);
        let msix = MsixCap { bar: BarN::BAR0, table_offset: 0, count: 4 };
        let pdev = pdev(
            vec![
                PhysBar::mmio(0xf000_0000, 0x1000),
                PhysBar::mmio(0xf100_0000, 0x1000),
                PhysBar::mmio(0xf200_0000, 0x1000),
            ],
            Some(msix),
            intx_cfg(),
        );
        let cfg = PtConfig::default()
            .with_vbar(BarN::BAR0, 0x8000_0000)
            .with_vbar(BarN::BAR1, 0x8200_0000);
        let vdev = attach(&ctx, pdev, &cfg).unwrap();
        vdev.teardown(&ctx);
    }
}
