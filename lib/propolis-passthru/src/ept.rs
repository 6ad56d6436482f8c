// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping-only second-stage address space.

use std::sync::Mutex;

use crate::util::aspace::ASpace;
use crate::vm::{EptRoot, MapFlags, SecondStage};

/// A single guest-physical to host-physical mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub gpa: u64,
    pub hpa: u64,
    pub size: u64,
    pub flags: MapFlags,
}

/// [SecondStage] implementation which records mappings rather than editing
/// hardware page tables.
///
/// Mappings made against any root other than the one the table was created
/// for, overlapping mappings, and removal of a range which was never mapped
/// are all treated as fatal.
pub struct MapTable {
    root: EptRoot,
    map: Mutex<ASpace<(u64, MapFlags)>>,
}

impl MapTable {
    pub fn new(root: EptRoot, limit: u64) -> Self {
        Self { root, map: Mutex::new(ASpace::new(limit)) }
    }

    /// Current mappings, sorted by guest-physical address
    pub fn mappings(&self) -> Vec<Mapping> {
        let map = self.map.lock().unwrap();
        map.iter()
            .map(|(gpa, size, (hpa, flags))| Mapping {
                gpa,
                hpa: *hpa,
                size,
                flags: *flags,
            })
            .collect()
    }

    /// Translate a guest-physical address through the table
    pub fn translate(&self, gpa: u64) -> Option<u64> {
        let map = self.map.lock().unwrap();
        let (start, _len, (hpa, _flags)) = map.region_at(gpa)?;
        Some(hpa + (gpa - start))
    }

    fn check_root(&self, root: EptRoot) {
        assert_eq!(root, self.root, "mapping request against foreign root");
    }
}

impl SecondStage for MapTable {
    fn add_mapping(
        &self,
        root: EptRoot,
        hpa: u64,
        gpa: u64,
        size: u64,
        flags: MapFlags,
    ) {
        self.check_root(root);
        let mut map = self.map.lock().unwrap();
        if let Err(e) = map.register(gpa, size, (hpa, flags)) {
            panic!("cannot map {gpa:#x}+{size:#x} -> {hpa:#x}: {e}");
        }
    }

    fn remove_mapping(&self, root: EptRoot, gpa: u64, size: u64) {
        self.check_root(root);
        let mut map = self.map.lock().unwrap();
        match map.unregister(gpa) {
            Ok((len, _)) => {
                assert_eq!(len, size, "partial unmap of {gpa:#x}+{len:#x}")
            }
            Err(e) => panic!("cannot unmap {gpa:#x}+{size:#x}: {e}"),
        }
    }
}
