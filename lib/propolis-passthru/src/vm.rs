// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM context handed to every passthrough operation.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::sync::Arc;

use crate::mmio::TrapRegistrar;

/// How guest-physical addresses for passthrough BARs come to be.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddrModel {
    /// The host lays out guest-physical space up front and owns every
    /// relocation of a passthrough BAR.
    PreAssigned,
    /// The guest (possibly through a mediating service partition) assigns
    /// BAR addresses at boot.  The mediator maps the non-table portions of a
    /// BAR itself.
    Relayed,
}

impl AddrModel {
    pub fn is_pre_assigned(&self) -> bool {
        matches!(self, AddrModel::PreAssigned)
    }
}

impl FromStr for AddrModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-assigned" => Ok(AddrModel::PreAssigned),
            "relayed" => Ok(AddrModel::Relayed),
            other => Err(format!("unknown addressing model \"{other}\"")),
        }
    }
}

impl Display for AddrModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AddrModel::PreAssigned => write!(f, "pre-assigned"),
            AddrModel::Relayed => write!(f, "relayed"),
        }
    }
}

/// Opaque handle to the root of a VM's second-stage translation tables.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EptRoot(pub u64);

bitflags! {
    /// Access and caching attributes for a second-stage mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MapFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Device memory: never cached, never speculatively accessed.
        const UNCACHED = 1 << 3;

        const RW = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Second-stage (guest-physical to host-physical) mapping primitives.
///
/// Failure to apply a mapping is fatal to the VM, so neither operation
/// reports an error: implementations are expected to panic rather than
/// return with the address space in an unknown state.
#[cfg_attr(test, mockall::automock)]
pub trait SecondStage: Send + Sync {
    /// Map `[gpa, gpa + size)` onto `[hpa, hpa + size)`.
    fn add_mapping(
        &self,
        root: EptRoot,
        hpa: u64,
        gpa: u64,
        size: u64,
        flags: MapFlags,
    );
    /// Remove the mapping of `[gpa, gpa + size)`.
    fn remove_mapping(&self, root: EptRoot, gpa: u64, size: u64);
}

/// Translation from a host-physical address to the guest-physical address at
/// which the mediating partition exposes it.
pub trait AddrXlate: Send + Sync {
    fn host_to_guest(&self, hpa: u64) -> u64;
}

impl<F> AddrXlate for F
where
    F: Fn(u64) -> u64 + Send + Sync,
{
    fn host_to_guest(&self, hpa: u64) -> u64 {
        self(hpa)
    }
}

/// Everything a passthrough device needs to know about its VM.
///
/// Operations take this explicitly rather than reaching it through the
/// device, so every dependency is visible at the call site.
pub struct VmCtx {
    pub log: slog::Logger,
    pub model: AddrModel,
    pub ept_root: EptRoot,
    pub ept: Arc<dyn SecondStage>,
    pub traps: Arc<dyn TrapRegistrar>,
    pub xlate: Arc<dyn AddrXlate>,
}

impl VmCtx {
    pub fn new(
        log: &slog::Logger,
        model: AddrModel,
        ept_root: EptRoot,
        ept: Arc<dyn SecondStage>,
        traps: Arc<dyn TrapRegistrar>,
    ) -> Self {
        Self {
            log: log.new(slog::o!("model" => model.to_string())),
            model,
            ept_root,
            ept,
            traps,
            xlate: Arc::new(|hpa: u64| hpa),
        }
    }

    /// Replace the (default identity) host-to-guest translation
    pub fn with_xlate(mut self, xlate: Arc<dyn AddrXlate>) -> Self {
        self.xlate = xlate;
        self
    }

    pub fn is_pre_assigned(&self) -> bool {
        self.model.is_pre_assigned()
    }
}
