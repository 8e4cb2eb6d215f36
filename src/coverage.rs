//! Edge coverage tracking through the shared bitmap.
//!
//! The target's instrumentation records edge hits into a shared-memory map of
//! [`MAP_SIZE`] bytes; the segment id is handed to it through the
//! [`SHM_ENV_VAR`] environment variable. After every execution the map is
//! scanned against the session-wide [`GlobalBitmap`] to decide whether any
//! previously unseen edge fired.

use std::collections::{hash_map::Entry, HashMap};

use libafl_bolts::{
    shmem::{ShMem, ShMemProvider, UnixShMemProvider},
    AsSlice, AsSliceMut, Error,
};

/// Size of the edge bitmap shared with the target.
pub const MAP_SIZE: usize = 1 << 16;

/// Environment variable carrying the shared-memory id to the target.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// What a scan of the coverage map observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    /// At least one edge fired that the session had never seen before.
    pub new_edge: bool,
    /// Number of map entries that fired in this execution.
    pub total_hits: u64,
}

/// The shared edge bitmap written by the target's instrumentation.
///
/// Owns the backing SysV segment; dropping the map detaches and removes it.
#[derive(Debug)]
pub struct CoverageMap {
    shmem: <UnixShMemProvider as ShMemProvider>::ShMem,
}

impl CoverageMap {
    /// Allocates a fresh, zeroed map of [`MAP_SIZE`] bytes.
    pub fn new(provider: &mut UnixShMemProvider) -> Result<Self, Error> {
        let mut shmem = provider.new_shmem(MAP_SIZE)?;
        shmem.as_slice_mut().fill(0);
        Ok(Self { shmem })
    }

    /// The segment id, in the decimal form the target expects in
    /// [`SHM_ENV_VAR`].
    pub fn shm_id(&self) -> String {
        self.shmem.id().to_string()
    }

    /// Zeroes the map. Must happen before every execution.
    pub fn reset(&mut self) {
        self.shmem.as_slice_mut().fill(0);
    }

    /// Folds the hits of the last execution into `global`.
    ///
    /// Only valid once the execution has reported its status; until then the
    /// target may still be writing to the map.
    pub fn scan(&self, global: &mut GlobalBitmap) -> ScanResult {
        global.absorb(self.shmem.as_slice())
    }
}

/// Cumulative hit counts for every edge observed during the session.
///
/// An edge enters with count 0 when first discovered; only subsequent
/// executions that fire it again count as hits.
#[derive(Debug, Default)]
pub struct GlobalBitmap {
    hits: HashMap<usize, u64>,
}

impl GlobalBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct edges ever observed.
    pub fn num_edges(&self) -> usize {
        self.hits.len()
    }

    /// Cumulative hit count for one edge, if it was ever observed.
    pub fn hit_count(&self, edge: usize) -> Option<u64> {
        self.hits.get(&edge).copied()
    }

    /// Merges one execution's raw map into the cumulative counts.
    pub fn absorb(&mut self, map: &[u8]) -> ScanResult {
        let mut total_hits = 0;
        let mut new_edge = false;
        for (edge, byte) in map.iter().enumerate() {
            if *byte != 0 {
                total_hits += 1;
                match self.hits.entry(edge) {
                    Entry::Vacant(entry) => {
                        entry.insert(0);
                        new_edge = true;
                    }
                    Entry::Occupied(mut entry) => {
                        *entry.get_mut() += 1;
                    }
                }
            }
        }
        ScanResult {
            new_edge,
            total_hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_observes_nothing() {
        let mut global = GlobalBitmap::new();
        let map = [0u8; MAP_SIZE];
        let scan = global.absorb(&map);
        assert!(!scan.new_edge);
        assert_eq!(scan.total_hits, 0);
        assert_eq!(global.num_edges(), 0);
    }

    #[test]
    fn first_sighting_is_a_discovery_not_a_hit() {
        let mut global = GlobalBitmap::new();
        let mut map = [0u8; MAP_SIZE];
        map[42] = 1;

        let scan = global.absorb(&map);
        assert!(scan.new_edge);
        assert_eq!(scan.total_hits, 1);
        assert_eq!(global.hit_count(42), Some(0));

        let scan = global.absorb(&map);
        assert!(!scan.new_edge);
        assert_eq!(scan.total_hits, 1);
        assert_eq!(global.hit_count(42), Some(1));
    }

    #[test]
    fn any_nonzero_byte_counts_once() {
        let mut global = GlobalBitmap::new();
        let mut map = [0u8; MAP_SIZE];
        map[0] = 1;
        map[1] = 0xff;
        map[MAP_SIZE - 1] = 3;

        let scan = global.absorb(&map);
        assert!(scan.new_edge);
        assert_eq!(scan.total_hits, 3);
        assert_eq!(global.num_edges(), 3);
    }

    #[test]
    fn edges_accumulate_across_executions() {
        let mut global = GlobalBitmap::new();
        let mut map = [0u8; MAP_SIZE];
        map[7] = 1;
        global.absorb(&map);

        map[7] = 0;
        map[9] = 1;
        let scan = global.absorb(&map);
        assert!(scan.new_edge);
        assert_eq!(global.num_edges(), 2);
        // Edge 7 did not fire this time, so its count is unchanged.
        assert_eq!(global.hit_count(7), Some(0));
        assert_eq!(global.hit_count(9), Some(0));
    }
}
