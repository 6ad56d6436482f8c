// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A sparse map of non-overlapping ranges within a 64-bit address space.

use std::collections::{btree_map, BTreeMap};
use std::ops::Bound::{Excluded, Included, Unbounded};

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("range {0:#x}+{1:#x} lies outside the address space")]
    OutOfRange(u64, u64),
    #[error("zero-length range at {0:#x}")]
    BadLength(u64),
    #[error("range {0:#x}+{1:#x} conflicts with an existing region")]
    Conflict(u64, u64),
    #[error("no region starts at {0:#x}")]
    NotFound(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Regions are half-open `[start, start + len)` and keyed by their start.
#[derive(Debug)]
pub struct ASpace<T> {
    limit: u64,
    map: BTreeMap<u64, (u64, T)>,
}

impl<T> ASpace<T> {
    /// Create an address space covering `[0, limit)`
    ///
    /// # Panics
    ///
    /// If `limit` is zero.
    pub fn new(limit: u64) -> Self {
        assert!(limit != 0);
        Self { limit, map: BTreeMap::new() }
    }

    /// Register region `[start, start + len)`
    pub fn register(&mut self, start: u64, len: u64, item: T) -> Result<()> {
        if len == 0 {
            return Err(Error::BadLength(start));
        }
        let end = match start.checked_add(len) {
            Some(end) if end <= self.limit => end,
            _ => return Err(Error::OutOfRange(start, len)),
        };

        // Any region starting within the new one?
        if self.map.range((Included(start), Excluded(end))).next().is_some() {
            return Err(Error::Conflict(start, len));
        }
        // Any preceding region spilling into it?
        if let Some((_, (p_end, _))) =
            self.map.range((Unbounded, Included(start))).next_back()
        {
            if *p_end > start {
                return Err(Error::Conflict(start, len));
            }
        }

        self.map.insert(start, (end, item));
        Ok(())
    }

    /// Remove the region beginning at `start`, returning its length and item
    pub fn unregister(&mut self, start: u64) -> Result<(u64, T)> {
        match self.map.remove(&start) {
            Some((end, item)) => Ok((end - start, item)),
            None => Err(Error::NotFound(start)),
        }
    }

    /// Find the region containing `addr`, as `(start, len, &item)`
    pub fn region_at(&self, addr: u64) -> Option<(u64, u64, &T)> {
        match self.map.range((Unbounded, Included(addr))).next_back() {
            Some((start, (end, item))) if *end > addr => {
                Some((*start, *end - *start, item))
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over regions, sorted by starting address
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { inner: self.map.iter() }
    }
}

pub struct Iter<'a, T> {
    inner: btree_map::Iter<'a, u64, (u64, T)>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    /// Item represents (start, len, &item)
    type Item = (u64, u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(start, (end, item))| (*start, *end - *start, item))
    }
}
