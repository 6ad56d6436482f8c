// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Result as FmtResult;
use std::fmt::{Display, Formatter};
use std::io::{Error, ErrorKind};
use std::str::FromStr;

use strum::FromRepr;

pub mod bar;
pub mod bits;
pub mod cfgspace;
pub mod msix;
pub mod passthru;
pub mod phys;


pub use bar::{BarKind, PhysBar, VirtBar};
pub use phys::{MsixCap, PhysCfgAccess, PhysDevice, SoftCfg};

/// Bus, Device, Function.
///
/// Identifies a physical function, and the virtual device fronting it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct Bdf {
    bus: u8,
    dev: u8,
    func: u8,
}

impl Bdf {
    /// Attempts to make a new PCI [Bdf].
    ///
    /// Returns [`Option::None`] if the values would not fit within a BDF.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Option<Self> {
        if dev <= bits::MASK_DEV && func <= bits::MASK_FUNC {
            Some(Self { bus: bus & bits::MASK_BUS, dev, func })
        } else {
            None
        }
    }
    /// Create a new PCI [Bdf]
    ///
    /// # Panics
    ///
    /// If `dev` or `func` are outside their respective valid ranges
    pub const fn new_unchecked(bus: u8, dev: u8, func: u8) -> Self {
        match Self::new(bus, dev, func) {
            Some(bdf) => bdf,
            None => panic!("device or function number exceeds max"),
        }
    }
    pub const fn bus(&self) -> u8 {
        self.bus
    }
    pub const fn dev(&self) -> u8 {
        self.dev
    }
    pub const fn func(&self) -> u8 {
        self.func
    }
}

impl FromStr for Bdf {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::with_capacity(3);
        for f in s.split('.') {
            let num = u8::from_str(f).map_err(|e| {
                Error::new(ErrorKind::InvalidInput, e.to_string())
            })?;
            fields.push(num);
        }

        if fields.len() != 3 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Wrong number of fields for BDF",
            ));
        }

        Bdf::new(fields[0], fields[1], fields[2]).ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "Failed to parse as BDF")
        })
    }
}

impl Display for Bdf {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}.{}.{}", self.bus, self.dev, self.func)
    }
}

/// Index of a BAR within a type 0 header.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, FromRepr)]
#[repr(u8)]
pub enum BarN {
    BAR0 = 0,
    BAR1,
    BAR2,
    BAR3,
    BAR4,
    BAR5,
}
impl BarN {
    pub fn iter() -> BarIter {
        BarIter { n: 0 }
    }

    /// Offset of this BAR's register in config space
    pub const fn cfg_offset(&self) -> u16 {
        bits::OFF_BAR0 + (*self as u16) * bits::LEN_BAR
    }

    /// The BAR whose register holds config space `offset`, if any
    ///
    /// Unaligned offsets resolve to the register containing them.
    pub fn from_cfg_offset(offset: u16) -> Option<Self> {
        let rel = offset.checked_sub(bits::OFF_BAR0)?;
        let idx = u8::try_from(rel / bits::LEN_BAR).ok()?;
        Self::from_repr(idx)
    }
}

pub struct BarIter {
    n: u8,
}
impl Iterator for BarIter {
    type Item = BarN;

    fn next(&mut self) -> Option<Self::Item> {
        let res = BarN::from_repr(self.n)?;
        self.n += 1;
        Some(res)
    }
}
