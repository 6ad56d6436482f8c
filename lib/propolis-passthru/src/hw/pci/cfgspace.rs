// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backing store for emulated configuration space.

use byteorder::{ByteOrder, LE};

use super::bits::LEN_CFG;

/// Byte-addressable, little-endian image of a function's config space.
#[derive(Clone)]
pub struct CfgSpace {
    regs: [u8; LEN_CFG],
}

impl Default for CfgSpace {
    fn default() -> Self {
        Self { regs: [0u8; LEN_CFG] }
    }
}

impl CfgSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Width-checked range of an access, if it fits within config space
    fn span(offset: u16, width: u8) -> Option<std::ops::Range<usize>> {
        if !matches!(width, 1 | 2 | 4) {
            return None;
        }
        let start = offset as usize;
        let end = start + width as usize;
        (end <= LEN_CFG).then_some(start..end)
    }

    /// Read `width` (1, 2 or 4) bytes at `offset`
    pub fn read(&self, offset: u16, width: u8) -> Option<u32> {
        let span = Self::span(offset, width)?;
        Some(LE::read_uint(&self.regs[span], width as usize) as u32)
    }

    /// Write the low `width` (1, 2 or 4) bytes of `val` at `offset`
    ///
    /// Returns `None`, leaving the space untouched, for a bad width or an
    /// access running off the end of config space.
    pub fn write(&mut self, offset: u16, width: u8, val: u32) -> Option<()> {
        let span = Self::span(offset, width)?;
        LE::write_uint(&mut self.regs[span], u64::from(val), width as usize);
        Some(())
    }

    pub fn read_u32(&self, offset: u16) -> u32 {
        self.read(offset, 4).unwrap()
    }
    pub fn write_u32(&mut self, offset: u16, val: u32) {
        self.write(offset, 4, val).unwrap()
    }
}
