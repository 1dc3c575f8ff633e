/// Process-wide cache of parsed file data, with a byte budget.
///
/// Each file holds its own cached payload, the cache only knows which files are holding data and
/// how much.  The budget goes negative when a file registers more data than there is room for;
/// `reclaim` then purges files until the budget is non-negative again.  The victim is the less
/// recently used of two files picked at random, an approximation of LRU that needs no ordered
/// structure.
///
/// The cache lock is never held while a file lock is taken: files call into the cache with their
/// own lock held, so the order is always file -> cache.
use crate::logfile::LogFile;

use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Purgeable {
    entries: Vec<(Arc<LogFile>, u64)>,
    index: HashMap<u64, usize>,
    lru_counter: u64,
}

pub struct Cache {
    enabled: AtomicBool,
    budget: AtomicI64,
    purgeable: Mutex<Purgeable>,
}

impl Cache {
    /// A cache with the given budget in bytes.  A negative size means caching is disabled.

    pub fn new(size: i64) -> Cache {
        Cache {
            enabled: AtomicBool::new(size >= 0),
            budget: AtomicI64::new(size.max(0)),
            purgeable: Mutex::new(Purgeable::default()),
        }
    }

    /// Enable the cache with the given budget, or disable it if the size is negative.  Either way
    /// everything cached is purged first, so the new budget is all free.

    pub fn init(&self, size: i64) {
        if size >= 0 {
            log::info!("Enabling cache, initial budget {size}");
            self.purge_all_sync();
            self.budget.store(size, Ordering::SeqCst);
            self.enabled.store(true, Ordering::SeqCst);
        } else {
            log::info!("Disabling cache");
            self.enabled.store(false, Ordering::SeqCst);
            self.purge_all_sync();
            self.budget.store(0, Ordering::SeqCst);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn budget(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, file: &Arc<LogFile>, size: i64) {
        self.budget.fetch_sub(size, Ordering::SeqCst);
        let mut p = self.lock();
        let lru = next_lru(&mut p);
        if let Some(&ix) = p.index.get(&file.id()) {
            p.entries[ix].1 = lru;
        } else {
            let ix = p.entries.len();
            p.entries.push((file.clone(), lru));
            p.index.insert(file.id(), ix);
        }
    }

    pub(crate) fn unregister(&self, id: u64, size: i64) {
        self.budget.fetch_add(size, Ordering::SeqCst);
        let mut p = self.lock();
        if let Some(ix) = p.index.remove(&id) {
            p.entries.swap_remove(ix);
            if ix < p.entries.len() {
                let moved = p.entries[ix].0.id();
                p.index.insert(moved, ix);
            }
        }
    }

    pub(crate) fn touch(&self, id: u64) {
        let mut p = self.lock();
        if let Some(&ix) = p.index.get(&id) {
            let lru = next_lru(&mut p);
            p.entries[ix].1 = lru;
        }
    }

    /// Purge files until the budget is non-negative.  Must be called without any file lock held.

    pub fn reclaim(&self) {
        while self.budget() < 0 {
            let Some(victim) = self.pick_file_to_purge() else {
                break;
            };
            victim.purge_cache("internal:capacity");
        }
    }

    /// Purge every cached file.  Must be called without any file lock held.

    pub fn purge_all_sync(&self) {
        let files = self
            .lock()
            .entries
            .iter()
            .map(|(f, _)| f.clone())
            .collect::<Vec<Arc<LogFile>>>();
        for f in files {
            f.purge_cache("internal:purge-all");
        }
    }

    pub fn num_cached(&self) -> usize {
        self.lock().entries.len()
    }

    fn pick_file_to_purge(&self) -> Option<Arc<LogFile>> {
        let p = self.lock();
        match p.entries.len() {
            0 => None,
            1 => Some(p.entries[0].0.clone()),
            n => {
                let mut rng = rand::thread_rng();
                let a = rng.gen_range(0..n);
                let b = rng.gen_range(0..n);
                let victim = if p.entries[a].1 <= p.entries[b].1 { a } else { b };
                Some(p.entries[victim].0.clone())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Purgeable> {
        self.purgeable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// On counter overflow, renumber the entries densely in their current order.
fn next_lru(p: &mut Purgeable) -> u64 {
    if p.lru_counter == u64::MAX {
        let mut order = (0..p.entries.len()).collect::<Vec<usize>>();
        order.sort_by_key(|&ix| p.entries[ix].1);
        for (n, ix) in order.into_iter().enumerate() {
            p.entries[ix].1 = n as u64;
        }
        p.lru_counter = p.entries.len() as u64;
    }
    let lru = p.lru_counter;
    p.lru_counter += 1;
    lru
}

static CACHE: Lazy<Arc<Cache>> = Lazy::new(|| Arc::new(Cache::new(-1)));

/// The process-wide cache, disabled until `cache_init` is called.

pub fn global_cache() -> Arc<Cache> {
    CACHE.clone()
}

pub fn cache_init(size: i64) {
    CACHE.init(size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::tests::LineCounter;
    use crate::logfile::{Fullname, FILE_SLURM_CSV};
    use rustutils::UstrCache;
    use std::path::PathBuf;

    fn make_files(dir: &std::path::Path, cache: &Arc<Cache>, n: usize) -> Vec<Arc<LogFile>> {
        let root = Arc::new(PathBuf::from(dir));
        (0..n)
            .map(|i| {
                let name = format!("f{i}.csv");
                std::fs::write(dir.join(&name), "x\ny\n").unwrap();
                let name = Fullname::new(root.clone(), "", &name);
                LogFile::with_cache(name, FILE_SLURM_CSV, cache.clone())
            })
            .collect()
    }

    // This tests:
    //  - registering files consumes budget
    //  - going over budget purges files until the budget is non-negative
    //  - every file is still readable after being purged

    #[test]
    fn test_cache_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        // Each file is 200 bytes nominally
        let cache = Arc::new(Cache::new(1000));
        let files = make_files(dir.path(), &cache, 8);
        let mut ustrs = UstrCache::new();
        for f in &files {
            f.read_sync(&mut ustrs, false, &LineCounter).unwrap();
            assert!(cache.budget() >= 0);
        }
        assert!(cache.num_cached() <= 5);
        assert!(cache.budget() == 1000 - 200 * cache.num_cached() as i64);
        let cached = files.iter().filter(|f| f.is_cached()).count();
        assert!(cached == cache.num_cached());
        for f in &files {
            let (p, _) = f.read_sync(&mut ustrs, false, &LineCounter).unwrap();
            let records = crate::logfile::Records::new(p, crate::logfile::tests::select_sacct);
            assert!(records.len() == 2);
        }
    }

    #[test]
    fn test_cache_disable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(10_000));
        let files = make_files(dir.path(), &cache, 3);
        let mut ustrs = UstrCache::new();
        for f in &files {
            f.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        }
        assert!(cache.num_cached() == 3);
        cache.init(-1);
        assert!(!cache.enabled());
        assert!(cache.num_cached() == 0);
        assert!(files.iter().all(|f| !f.is_cached()));
        files[0].read_sync(&mut ustrs, false, &LineCounter).unwrap();
        assert!(!files[0].is_cached());
        cache.init(500);
        assert!(cache.enabled() && cache.budget() == 500);
    }

    // This tests:
    //  - re-enabling an enabled cache does not count the resident bytes twice

    #[test]
    fn test_cache_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(1000));
        let files = make_files(dir.path(), &cache, 2);
        let mut ustrs = UstrCache::new();
        for f in &files {
            f.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        }
        assert!(cache.budget() == 600);
        cache.init(1000);
        assert!(cache.budget() == 1000);
        assert!(cache.num_cached() == 0);
        assert!(files.iter().all(|f| !f.is_cached()));
        files[0].read_sync(&mut ustrs, false, &LineCounter).unwrap();
        assert!(cache.budget() == 800);
    }

    #[test]
    fn test_lru_renumbering() {
        let mut p = Purgeable::default();
        p.lru_counter = u64::MAX;
        assert!(next_lru(&mut p) == 0);
        assert!(next_lru(&mut p) == 1);
        assert!(p.lru_counter == 2);
    }
}
