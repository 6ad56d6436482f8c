// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::{ByteOrder, LE};

/// Represents an abstract requested read operation.
///
/// The party servicing the read fills the buffer through the "write" methods.
pub struct ReadOp<'a> {
    buf: &'a mut [u8],
    offset: usize,
    write_offset: usize,
}

impl<'a> ReadOp<'a> {
    /// Initializes a new read operation from a buffer.
    ///
    /// # Arguments
    ///
    /// - `op_offset`: Offset (within the serviced region) being read.
    /// - `buf`: Sink of the read, its length is the access width.
    pub fn from_buf(op_offset: usize, buf: &'a mut [u8]) -> Self {
        Self { buf, offset: op_offset, write_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn avail(&self) -> usize {
        self.len().checked_sub(self.write_offset).unwrap()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write_u8(&mut self, val: u8) {
        self.write_bytes(&[val]);
    }
    pub fn write_u16(&mut self, val: u16) {
        let mut buf = [0u8; 2];
        LE::write_u16(&mut buf, val);
        self.write_bytes(&buf);
    }
    pub fn write_u32(&mut self, val: u32) {
        let mut buf = [0u8; 4];
        LE::write_u32(&mut buf, val);
        self.write_bytes(&buf);
    }
    pub fn write_u64(&mut self, val: u64) {
        let mut buf = [0u8; 8];
        LE::write_u64(&mut buf, val);
        self.write_bytes(&buf);
    }
    pub fn write_bytes(&mut self, data: &[u8]) {
        let start = self.write_offset;
        let end = start + data.len();
        self.buf[start..end].copy_from_slice(data);
        self.write_offset = end;
    }
    /// Fill the remaining portion of the operation with `val`.
    pub fn fill(&mut self, val: u8) {
        let start = self.write_offset;
        self.buf[start..].fill(val);
        self.write_offset = self.buf.len();
    }
}

/// Represents an abstract requested write operation.
///
/// The party servicing the write consumes the buffer through the "read"
/// methods.
pub struct WriteOp<'a> {
    buf: &'a [u8],
    offset: usize,
    read_offset: usize,
}

impl<'a> WriteOp<'a> {
    pub fn from_buf(op_offset: usize, buf: &'a [u8]) -> Self {
        Self { buf, offset: op_offset, read_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
    pub fn avail(&self) -> usize {
        self.len().checked_sub(self.read_offset).unwrap()
    }
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf);
        LE::read_u32(&buf)
    }
    pub fn read_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf);
        LE::read_u64(&buf)
    }
    pub fn read_bytes(&mut self, data: &mut [u8]) {
        let start = self.read_offset;
        let end = start + data.len();
        data.copy_from_slice(&self.buf[start..end]);
        self.read_offset = end;
    }
}

pub enum RWOp<'a, 'b> {
    Read(&'a mut ReadOp<'b>),
    Write(&'a mut WriteOp<'b>),
}
impl RWOp<'_, '_> {
    pub fn offset(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.offset,
            RWOp::Write(wo) => wo.offset,
        }
    }
    pub fn len(&self) -> usize {
        match self {
            RWOp::Read(ro) => ro.len(),
            RWOp::Write(wo) => wo.len(),
        }
    }
    pub fn is_write(&self) -> bool {
        matches!(self, RWOp::Write(_))
    }
}

pub const PAGE_SIZE: u64 = 0x1000;
pub const PAGE_OFFSET: u64 = 0xfff;
pub const PAGE_MASK: u64 = u64::MAX - PAGE_OFFSET;

/// Round `val` down to the containing 4 KiB page boundary
pub const fn round_page_down(val: u64) -> u64 {
    val & PAGE_MASK
}

/// Round `val` up to the next 4 KiB page boundary
///
/// # Panics
///
/// If the rounded value does not fit in a `u64`.
pub fn round_page_up(val: u64) -> u64 {
    val.checked_add(PAGE_OFFSET).unwrap() & PAGE_MASK
}
