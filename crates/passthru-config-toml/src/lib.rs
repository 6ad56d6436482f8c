// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use propolis_passthru::hw::pci::bar::BAR_COUNT;
use propolis_passthru::hw::pci::{BarN, Bdf, MsixCap, PhysBar};
use propolis_passthru::{AddrModel, PtConfig};

/// Passthrough fixture: the VM's addressing setup, and the devices handed
/// to it along with the guest config space writes to replay against them.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub main: Main,

    #[serde(default, rename = "dev")]
    pub devices: BTreeMap<String, Device>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Main {
    #[serde(default = "default_addressing")]
    pub addressing: String,

    /// Handle of the second-stage table root
    #[serde(default, rename = "ept-root")]
    pub ept_root: u64,

    /// Offset added to a host-physical address to find where the mediating
    /// partition exposes it.  Only meaningful for relayed addressing.
    #[serde(default, rename = "relay-offset")]
    pub relay_offset: i64,
}
impl Default for Main {
    fn default() -> Self {
        Self { addressing: default_addressing(), ept_root: 0, relay_offset: 0 }
    }
}
impl Main {
    pub fn addressing(&self) -> Result<AddrModel, ParseError> {
        self.addressing.parse().map_err(ParseError::Addressing)
    }
}

fn default_addressing() -> String {
    AddrModel::PreAssigned.to_string()
}

/// A physical function to pass through.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Device {
    #[serde(rename = "pci-path")]
    pub pci_path: String,

    /// Guest-physical BAR bases assigned up front (0 for none)
    #[serde(default)]
    pub vbar: Vec<u32>,

    /// BARs of the physical function, as firmware assigned them
    #[serde(default)]
    pub bars: Vec<BarSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msix: Option<MsixSpec>,

    #[serde(default, rename = "write")]
    pub writes: Vec<Write>,
}

impl Device {
    pub fn bdf(&self) -> Result<Bdf, ParseError> {
        self.pci_path
            .parse()
            .map_err(|_| ParseError::PciPath(self.pci_path.clone()))
    }

    pub fn phys_bars(&self) -> Vec<PhysBar> {
        self.bars.iter().map(BarSpec::to_phys).collect()
    }

    pub fn msix_cap(&self) -> Result<Option<MsixCap>, ParseError> {
        let Some(spec) = self.msix.as_ref() else {
            return Ok(None);
        };
        let bar = BarN::from_repr(spec.bar).ok_or(ParseError::Bar(spec.bar))?;
        Ok(Some(MsixCap {
            bar,
            table_offset: spec.table_offset,
            count: spec.count,
        }))
    }

    pub fn pt_config(&self) -> Result<PtConfig, ParseError> {
        if self.vbar.len() > BAR_COUNT {
            return Err(ParseError::TooManyVbars(self.vbar.len()));
        }
        let mut cfg = PtConfig::default();
        cfg.vbar[..self.vbar.len()].copy_from_slice(&self.vbar);
        Ok(cfg)
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BarKindSpec {
    Empty,
    Pio,
    Mmio,
    Mmio64,
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BarSpec {
    pub kind: BarKindSpec,
    #[serde(default)]
    pub base: u64,
    #[serde(default)]
    pub size: u64,
}
impl BarSpec {
    pub fn to_phys(&self) -> PhysBar {
        match self.kind {
            BarKindSpec::Empty => PhysBar::empty(),
            BarKindSpec::Pio => PhysBar::pio(self.base, self.size),
            BarKindSpec::Mmio => PhysBar::mmio(self.base, self.size),
            BarKindSpec::Mmio64 => PhysBar::mmio64(self.base, self.size),
        }
    }
}

#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct MsixSpec {
    pub bar: u8,
    #[serde(default, rename = "table-offset")]
    pub table_offset: u32,
    pub count: u16,
}

/// A guest config space write
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Write {
    pub offset: u16,
    pub width: u8,
    pub value: u32,
}

/// Errors which may be returned when parsing the fixture configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid PCI path {0}")]
    PciPath(String),

    #[error("No BAR {0}")]
    Bar(u8),

    #[error("{0} BAR bases given, at most 6 allowed")]
    TooManyVbars(usize),

    #[error("{0}")]
    Addressing(String),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
