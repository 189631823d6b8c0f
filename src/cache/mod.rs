//! Byte-budgeted LRU cache of materialized sections.
//!
//! All state sits behind one [`parking_lot::RwLock`]. Lookups take the read
//! side and bump per-entry atomics, so concurrent hits never serialize; inserts,
//! evictions and invalidations take the write side. Recency is a logical clock
//! shared by the whole cache, which makes the eviction order total.
use crate::spreadsheet::Grid;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

mod key;

pub use key::Fingerprint;
pub use key::SectionKey;

/// A section held by the cache.
#[derive(Debug)]
pub struct CachedSection {
    pub key: SectionKey,
    pub grid: Grid,
    /// Estimated heap footprint of `grid`.
    pub byte_size: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CachedSection {
    pub fn new(key: SectionKey, grid: Grid) -> Self {
        let byte_size = grid
            .iter()
            .map(|row| size_of::<Vec<()>>() + row.iter().map(|value| value.size_in_bytes()).sum::<usize>())
            .sum::<usize>() as u64;
        CachedSection {
            key,
            grid,
            byte_size,
            last_access: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
        }
    }

    /// Logical clock tick of the latest insert or hit.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Number of hits since the section was inserted.
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// Point-in-time counters of a [`SectionCache`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
}

#[derive(Default)]
struct Entries {
    sections: HashMap<SectionKey, Arc<CachedSection>>,
    bytes: u64,
    budget: u64,
    evictions: u64,
    insertions: u64,
}

impl Entries {
    fn remove(&mut self, key: &SectionKey) -> Option<Arc<CachedSection>> {
        let section = self.sections.remove(key)?;
        self.bytes -= section.byte_size;
        Some(section)
    }

    /// Evicts least recently used sections until the total fits the budget.
    fn shrink(&mut self) {
        while self.bytes > self.budget {
            let victim = self
                .sections
                .values()
                .min_by_key(|section| (section.last_access(), section.access_count()))
                .map(|section| section.key.clone());
            let Some(key) = victim else { break };
            if let Some(section) = self.remove(&key) {
                self.evictions += 1;
                debug!(
                    path = %key.fingerprint.path.display(),
                    range = %key.range,
                    bytes = section.byte_size,
                    last_access = section.last_access(),
                    "Evict cached section"
                );
            }
        }
    }

    fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&SectionKey) -> bool,
    {
        let before = self.sections.len();
        let mut freed = 0;
        self.sections.retain(|key, section| {
            let kept = keep(key);
            if !kept {
                freed += section.byte_size;
            }
            kept
        });
        self.bytes -= freed;
        before - self.sections.len()
    }
}

pub struct SectionCache {
    entries: RwLock<Entries>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SectionCache {
    pub fn new(budget: u64) -> Self {
        SectionCache {
            entries: RwLock::new(Entries {
                budget,
                ..Entries::default()
            }),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the section for `key` and marks it as most recently used.
    pub fn lookup(&self, key: &SectionKey) -> Option<Arc<CachedSection>> {
        let entries = self.entries.read();
        match entries.sections.get(key) {
            Some(section) => {
                section.last_access.store(self.tick(), Ordering::Relaxed);
                section.access_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(range = %key.range, sheet = key.sheet_index, "Cache hit");
                Some(Arc::clone(section))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(range = %key.range, sheet = key.sheet_index, "Cache miss");
                None
            }
        }
    }

    /// Inserts or replaces a section, then evicts down to the budget.
    ///
    /// A section larger than the whole budget is handed back without being
    /// stored. The returned handle is usable either way.
    pub fn insert(&self, section: CachedSection) -> Arc<CachedSection> {
        section.last_access.store(self.tick(), Ordering::Relaxed);
        let section = Arc::new(section);
        let mut entries = self.entries.write();
        entries.remove(&section.key);
        if section.byte_size > entries.budget {
            debug!(bytes = section.byte_size, budget = entries.budget, "Section exceeds cache budget, not cached");
            return section;
        }
        entries.bytes += section.byte_size;
        entries.insertions += 1;
        entries.sections.insert(section.key.clone(), Arc::clone(&section));
        entries.shrink();
        section
    }

    /// `true` when `key` is cached. Does not count as an access.
    pub fn contains(&self, key: &SectionKey) -> bool {
        self.entries.read().sections.contains_key(key)
    }

    /// Drops every section of one file version. Returns the number removed.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> usize {
        self.entries.write().retain(|key| key.fingerprint != *fingerprint)
    }

    /// Drops every section of `path`, whatever its version. `path` must be canonical.
    pub fn invalidate_path(&self, path: &Path) -> usize {
        let removed = self.entries.write().retain(|key| key.fingerprint.path != path);
        if removed > 0 {
            debug!(path = %path.display(), removed, "Invalidate cached sections");
        }
        removed
    }

    /// Applies a new byte budget, evicting immediately if it shrank.
    pub fn set_budget(&self, budget: u64) {
        let mut entries = self.entries.write();
        entries.budget = budget;
        entries.shrink();
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.sections.clear();
        entries.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        CacheStats {
            entries: entries.sections.len(),
            bytes: entries.bytes,
            budget: entries.budget,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: entries.evictions,
            insertions: entries.insertions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::RangeSpec;
    use crate::spreadsheet::CellValue;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn fingerprint(name: &str) -> Fingerprint {
        Fingerprint {
            path: PathBuf::from(format!("/data/{name}")),
            size: 1,
            modified: None,
        }
    }

    fn key(name: &str, start_row: usize) -> SectionKey {
        SectionKey::new(fingerprint(name), 0, RangeSpec::new(start_row, start_row + 1, 0, 1).unwrap())
    }

    fn section(key: SectionKey) -> CachedSection {
        CachedSection::new(key, vec![vec![CellValue::Number(1.0)]])
    }

    fn unit() -> u64 {
        section(key("a", 0)).byte_size
    }

    #[test]
    fn hit_after_insert() {
        let cache = SectionCache::new(1 << 20);
        assert!(cache.lookup(&key("a", 0)).is_none());
        cache.insert(section(key("a", 0)));

        let hit = cache.lookup(&key("a", 0)).unwrap();
        assert_eq!(hit.grid, vec![vec![CellValue::Number(1.0)]]);
        assert_eq!(hit.access_count(), 1);
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses, stats.insertions), (1, 1, 1, 1));
        assert_eq!(stats.bytes, unit());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = SectionCache::new(3 * unit());
        for row in 0..3 {
            cache.insert(section(key("a", row)));
        }
        cache.lookup(&key("a", 0));
        cache.insert(section(key("a", 3)));

        assert!(cache.contains(&key("a", 0)));
        assert!(!cache.contains(&key("a", 1)));
        assert!(cache.contains(&key("a", 2)));
        assert!(cache.contains(&key("a", 3)));

        cache.insert(section(key("a", 4)));
        assert!(!cache.contains(&key("a", 2)));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn eviction_order_follows_last_access() {
        let cache = SectionCache::new(10 * unit());
        for row in 0..5 {
            cache.insert(section(key("a", row)));
        }
        for row in [3, 1, 4, 0, 2] {
            cache.lookup(&key("a", row));
        }
        let mut evicted = Vec::new();
        for budget in (0..5).rev() {
            cache.set_budget(budget * unit());
            for row in 0..5 {
                if !cache.contains(&key("a", row)) && !evicted.contains(&row) {
                    evicted.push(row);
                }
            }
        }
        assert_eq!(evicted, vec![3, 1, 4, 0, 2]);
    }

    #[test]
    fn never_exceeds_budget() {
        let cache = SectionCache::new(2 * unit() + unit() / 2);
        for row in 0..20 {
            cache.insert(section(key("a", row)));
            let stats = cache.stats();
            assert!(stats.bytes <= stats.budget);
        }
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn oversized_section_bypasses_cache() {
        let cache = SectionCache::new(unit() * 2);
        cache.insert(section(key("a", 0)));
        let big = CachedSection::new(key("a", 1), vec![vec![CellValue::from("x".repeat(1000).as_str()); 10]]);
        let handle = cache.insert(big);

        assert_eq!(handle.grid.len(), 1);
        assert!(!cache.contains(&key("a", 1)));
        assert!(cache.contains(&key("a", 0)));
    }

    #[test]
    fn replace_keeps_byte_count() {
        let cache = SectionCache::new(1 << 20);
        cache.insert(section(key("a", 0)));
        cache.insert(section(key("a", 0)));
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.bytes), (1, unit()));
    }

    #[test]
    fn invalidation() {
        let cache = SectionCache::new(1 << 20);
        cache.insert(section(key("a", 0)));
        cache.insert(section(key("a", 1)));
        cache.insert(section(key("b", 0)));

        let mut rewritten = key("a", 2);
        rewritten.fingerprint.size = 2;
        cache.insert(section(rewritten.clone()));

        assert_eq!(cache.invalidate(&fingerprint("a")), 2);
        assert!(cache.contains(&rewritten));
        assert_eq!(cache.invalidate_path(Path::new("/data/a")), 1);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, unit());

        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn shrinking_budget_evicts() {
        let cache = SectionCache::new(4 * unit());
        for row in 0..4 {
            cache.insert(section(key("a", row)));
        }
        cache.set_budget(2 * unit());
        assert_eq!(cache.stats().entries, 2);
        assert!(cache.contains(&key("a", 2)));
        assert!(cache.contains(&key("a", 3)));
    }
}
