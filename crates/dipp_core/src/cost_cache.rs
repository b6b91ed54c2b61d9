//! Fingerprint-keyed cost cache: remembers the measured `(latency, energy)`
//! of a module implementation for a given batch shape, so the heuristic can
//! skip re-measuring it next time. Bounded to `MAX_ENTRIES`, evicting the
//! least-recently-used entry (by a monotone logical clock, not wall time)
//! when full.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use crate::error::{DippError, DippResult};

pub const MAX_ENTRIES: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CostEntry {
    pub fingerprint: u32,
    pub latency_us: u32,
    pub energy_uwh: f32,
    pub ts: u64,
    pub valid: bool,
}

impl CostEntry {
    const fn invalid() -> Self {
        Self {
            fingerprint: 0,
            latency_us: 0,
            energy_uwh: 0.0,
            ts: 0,
            valid: false,
        }
    }

    const RECORD_LEN: usize = 4 + 4 + 4 + 8 + 1;

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.fingerprint);
        LittleEndian::write_u32(&mut buf[4..8], self.latency_us);
        LittleEndian::write_f32(&mut buf[8..12], self.energy_uwh);
        LittleEndian::write_u64(&mut buf[12..20], self.ts);
        buf[20] = self.valid as u8;
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            fingerprint: LittleEndian::read_u32(&buf[0..4]),
            latency_us: LittleEndian::read_u32(&buf[4..8]),
            energy_uwh: LittleEndian::read_f32(&buf[8..12]),
            ts: LittleEndian::read_u64(&buf[12..20]),
            valid: buf[20] != 0,
        }
    }
}

/// Shared table-scan logic used by both backends: find a valid entry
/// matching `fingerprint`, and separately find the index of the
/// least-recently-used valid entry.
fn find_entry(table: &[CostEntry], fingerprint: u32) -> Option<usize> {
    table
        .iter()
        .position(|e| e.valid && e.fingerprint == fingerprint)
}

fn find_lru_index(table: &[CostEntry]) -> usize {
    table
        .iter()
        .enumerate()
        .filter(|(_, e)| e.valid)
        .min_by_key(|(_, e)| e.ts)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn recalculate_clock(table: &[CostEntry]) -> u64 {
    table
        .iter()
        .filter(|e| e.valid)
        .map(|e| e.ts)
        .max()
        .unwrap_or(0)
}

pub trait CostCache: Send {
    /// Look up a fingerprint; bumps its timestamp to the current logical
    /// clock on a hit (it just became the most-recently-used entry).
    fn lookup(&mut self, fingerprint: u32) -> Option<CostEntry>;

    /// Insert or overwrite a `(latency, energy)` observation for a
    /// fingerprint.
    fn insert(&mut self, fingerprint: u32, latency_us: u32, energy_uwh: f32) -> DippResult<()>;
}

/// Heap-backed cache. Lives for the duration of the process; nothing to
/// flush on drop.
pub struct RamCostCache {
    table: Vec<CostEntry>,
    clock: u64,
}

impl RamCostCache {
    pub fn new() -> Self {
        let table = vec![CostEntry::invalid(); MAX_ENTRIES];
        let clock = recalculate_clock(&table);
        Self { table, clock }
    }
}

impl Default for RamCostCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CostCache for RamCostCache {
    fn lookup(&mut self, fingerprint: u32) -> Option<CostEntry> {
        let idx = find_entry(&self.table, fingerprint)?;
        self.clock += 1;
        self.table[idx].ts = self.clock;
        Some(self.table[idx])
    }

    fn insert(&mut self, fingerprint: u32, latency_us: u32, energy_uwh: f32) -> DippResult<()> {
        self.clock += 1;
        let entry = CostEntry {
            fingerprint,
            latency_us,
            energy_uwh,
            ts: self.clock,
            valid: true,
        };
        if let Some(idx) = find_entry(&self.table, fingerprint) {
            self.table[idx] = entry;
            return Ok(());
        }
        if let Some(idx) = self.table.iter().position(|e| !e.valid) {
            self.table[idx] = entry;
            return Ok(());
        }
        let idx = find_lru_index(&self.table);
        self.table[idx] = entry;
        Ok(())
    }
}

/// File-backed cache: the table lives inside a memory-mapped file so its
/// contents survive a process restart. Every mutating operation is followed
/// by an `msync`-equivalent flush (`MmapMut::flush`) before returning.
pub struct MmapCostCache {
    mmap: Mutex<MmapMut>,
    clock: u64,
}

impl MmapCostCache {
    pub fn open(path: &Path) -> DippResult<Self> {
        let file_len = (CostEntry::RECORD_LEN * MAX_ENTRIES) as u64;
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| DippError::Storage(format!("open {}: {e}", path.display())))?;
        file.set_len(file_len)
            .map_err(|e| DippError::Storage(format!("ftruncate {}: {e}", path.display())))?;

        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| DippError::Storage(format!("mmap {}: {e}", path.display())))?
        };

        if is_new {
            for byte in mmap.iter_mut() {
                *byte = 0;
            }
            mmap.flush()
                .map_err(|e| DippError::Storage(format!("msync {}: {e}", path.display())))?;
        }

        let table = Self::read_table(&mmap);
        let clock = recalculate_clock(&table);

        Ok(Self {
            mmap: Mutex::new(mmap),
            clock,
        })
    }

    fn read_table(mmap: &MmapMut) -> Vec<CostEntry> {
        (0..MAX_ENTRIES)
            .map(|i| {
                let off = i * CostEntry::RECORD_LEN;
                CostEntry::read_from(&mmap[off..off + CostEntry::RECORD_LEN])
            })
            .collect()
    }

    fn write_entry(mmap: &mut MmapMut, idx: usize, entry: &CostEntry) {
        let off = idx * CostEntry::RECORD_LEN;
        entry.write_to(&mut mmap[off..off + CostEntry::RECORD_LEN]);
    }
}

impl CostCache for MmapCostCache {
    fn lookup(&mut self, fingerprint: u32) -> Option<CostEntry> {
        let mut mmap = self.mmap.lock().unwrap();
        let table = Self::read_table(&mmap);
        let idx = find_entry(&table, fingerprint)?;
        self.clock += 1;
        let mut entry = table[idx];
        entry.ts = self.clock;
        Self::write_entry(&mut mmap, idx, &entry);
        let _ = mmap.flush();
        Some(entry)
    }

    fn insert(&mut self, fingerprint: u32, latency_us: u32, energy_uwh: f32) -> DippResult<()> {
        let mut mmap = self.mmap.lock().unwrap();
        let table = Self::read_table(&mmap);
        self.clock += 1;
        let entry = CostEntry {
            fingerprint,
            latency_us,
            energy_uwh,
            ts: self.clock,
            valid: true,
        };

        let idx = find_entry(&table, fingerprint)
            .or_else(|| table.iter().position(|e| !e.valid))
            .unwrap_or_else(|| find_lru_index(&table));

        Self::write_entry(&mut mmap, idx, &entry);
        mmap.flush()
            .map_err(|e| DippError::Storage(format!("msync cost cache: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_then_hit() {
        let mut cache = RamCostCache::new();
        assert!(cache.lookup(42).is_none());
        cache.insert(42, 1000, 2.5).unwrap();
        let entry = cache.lookup(42).unwrap();
        assert_eq!(entry.latency_us, 1000);
        assert!((entry.energy_uwh - 2.5).abs() < f32::EPSILON);
    }

    #[test]
    fn overwrite_keeps_single_entry_per_fingerprint() {
        let mut cache = RamCostCache::new();
        cache.insert(1, 100, 1.0).unwrap();
        cache.insert(1, 200, 2.0).unwrap();
        let valid_count = cache.table.iter().filter(|e| e.valid && e.fingerprint == 1).count();
        assert_eq!(valid_count, 1);
        assert_eq!(cache.lookup(1).unwrap().latency_us, 200);
    }

    #[test]
    fn eviction_picks_least_recently_used() {
        let mut cache = RamCostCache::new();
        for i in 0..MAX_ENTRIES as u32 {
            cache.insert(i, 10, 1.0).unwrap();
        }
        // Touch everything except fingerprint 5, which should now be LRU.
        for i in 0..MAX_ENTRIES as u32 {
            if i != 5 {
                cache.lookup(i);
            }
        }
        cache.insert(9999, 10, 1.0).unwrap();
        assert!(cache.lookup(5).is_none());
        assert!(cache.lookup(9999).is_some());
    }

    #[test]
    fn mmap_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost.cache");

        {
            let mut cache = MmapCostCache::open(&path).unwrap();
            cache.insert(7, 500, 1.5).unwrap();
        }

        let mut reopened = MmapCostCache::open(&path).unwrap();
        let entry = reopened.lookup(7).unwrap();
        assert_eq!(entry.latency_us, 500);
    }
}
