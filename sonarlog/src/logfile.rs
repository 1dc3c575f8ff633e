/// LogFile: the API to an individual data file.
///
/// Each LogFile is backed by a particular disk file.  If the file is appendable then there is a
/// unique LogFile in the process representing the file (the cluster that owns the file makes sure
/// of that); read-only files need not be unique.
///
/// When a file is appended to, the data are added to a list in the LogFile but no further action is
/// taken.  The file has to be flushed by external action, normally by the cluster, which tracks
/// dirty files.  There is no finalization: if a dirty file is dropped without being flushed then
/// its data are not written.
///
/// A file may cache its parsed data, in which case a read returns the cached data.  When unlocked,
/// a file is in one of three states:
///
/// (A) on disk, no output pending
/// (B) on disk + in cache, no output pending
/// (C) on disk, output pending
///
/// Hence if a cached file is appended to, it is first purged from the cache.  Most files are
/// read-only after the day they were created, so they will stay cached.
///
/// Parsed data are kept in an immutable, shared `Payload`.  A file may hold several record streams
/// (sample files have samples, load data and GPU data) and a `Records<T>` is a cheap view of one of
/// them.
use crate::cache::Cache;
use crate::cluzter::CluzterData;
use crate::sacct::SacctInfo;
use crate::samplecsv::SampleData;
use crate::sysinfo::SysinfoData;

use anyhow::{bail, Context, Result};
use rustutils::UstrAllocator;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::ops::Deref;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const FILE_PERMISSIONS: u32 = 0o644;

/// File attributes: whether the file can be appended to, and the representation of its content.

pub type FileAttr = u32;

pub const FILE_APPENDABLE: FileAttr = 1;
pub const FILE_SAMPLE_CSV: FileAttr = 2;
pub const FILE_SAMPLE_V0_JSON: FileAttr = 4;
pub const FILE_SYSINFO_OLD_JSON: FileAttr = 8;
pub const FILE_SYSINFO_V0_JSON: FileAttr = 16;
pub const FILE_SLURM_CSV: FileAttr = 32;
pub const FILE_SLURM_V0_JSON: FileAttr = 64;
pub const FILE_CLUZTER_V0_JSON: FileAttr = 128;

/// The parsed content of one file.

#[derive(Debug)]
pub enum Payload {
    Samples(SampleData),
    Sysinfo(SysinfoData),
    Sacct(Vec<SacctInfo>),
    Cluzter(CluzterData),
}

/// A shared read-only view of one record stream in a payload.  Cloning is cheap.  The payload may
/// be purged from the cache while a view is alive, the view keeps it alive.

pub struct Records<T: 'static> {
    payload: Arc<Payload>,
    select: fn(&Payload) -> &[T],
}

impl<T> Records<T> {
    pub fn new(payload: Arc<Payload>, select: fn(&Payload) -> &[T]) -> Records<T> {
        Records { payload, select }
    }
}

impl<T> Clone for Records<T> {
    fn clone(&self) -> Records<T> {
        Records {
            payload: self.payload.clone(),
            select: self.select,
        }
    }
}

impl<T> Deref for Records<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        (self.select)(&self.payload)
    }
}

/// ReadSyncMethods allows read_sync to handle the various file types and their caching
/// generically.  See readers.rs.

pub trait ReadSyncMethods: Send + Sync {
    /// True iff files read by these methods can be stored in the cache.
    fn is_cacheable(&self) -> bool;

    /// Read the file and return a payload with all the record streams in it, along with a count of
    /// soft errors.  The returned records have been rectified as necessary and are what will be
    /// cached.  The file attributes select the representation.
    fn read_data_locked(
        &self,
        attr: FileAttr,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Payload, usize)>;

    /// The nominal cache occupancy of a freshly read payload, in bytes.
    fn cached_size_of_payload(&self, payload: &Payload) -> i64;
}

/// The components of the name are kept separate so that the (long) cluster root is shared among
/// all the files in the cluster.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fullname {
    pub cluster: Arc<PathBuf>,
    pub dirname: String,
    pub basename: String,
}

impl Fullname {
    pub fn new(cluster: Arc<PathBuf>, dirname: &str, basename: &str) -> Fullname {
        Fullname {
            cluster,
            dirname: dirname.to_string(),
            basename: basename.to_string(),
        }
    }

    /// A name for a file outside any cluster tree.

    pub fn from_path(p: &Path) -> Fullname {
        let dir = p.parent().unwrap_or(Path::new(""));
        let basename = p
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Fullname {
            cluster: Arc::new(dir.to_path_buf()),
            dirname: String::new(),
            basename,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.cluster.join(&self.dirname).join(&self.basename)
    }
}

impl fmt::Display for Fullname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

struct CachedPayload {
    payload: Arc<Payload>,
    soft_errors: usize,
    size: i64,
}

#[derive(Default)]
struct FileState {
    pending: Vec<Vec<u8>>,
    cached: Option<CachedPayload>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct LogFile {
    id: u64,
    fullname: Fullname,
    attrs: FileAttr,
    cache: Arc<Cache>,
    state: Mutex<FileState>,
}

impl LogFile {
    pub fn with_cache(fullname: Fullname, attrs: FileAttr, cache: Arc<Cache>) -> Arc<LogFile> {
        Arc::new(LogFile {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fullname,
            attrs,
            cache,
            state: Mutex::new(FileState::default()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn fullname(&self) -> &Fullname {
        &self.fullname
    }

    pub fn is_cached(&self) -> bool {
        self.lock().cached.is_some()
    }

    /// Queue data for appending.  A newline is added on flush if the payload does not end with one.
    /// Panics if the file is not appendable.

    pub fn append_async(&self, payload: impl AsRef<[u8]>) {
        assert!(self.attrs & FILE_APPENDABLE != 0, "Read-only file");
        let payload = payload.as_ref();
        if payload.is_empty() {
            return;
        }
        let mut state = self.lock();
        // Purge here because writes are pending.  read_sync would do it anyway and this eases cache
        // pressure earlier.
        self.purge_locked(&mut state, "internal:dirty");
        state.pending.push(payload.to_vec());
    }

    /// Flush pending data, then return the data from the cache if they are there, otherwise read
    /// and parse the file and cache the result if the reader allows it.

    pub fn read_sync(
        self: &Arc<Self>,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
        reader: &dyn ReadSyncMethods,
    ) -> Result<(Arc<Payload>, usize)> {
        let result = self.read_sync_inner(ustrs, verbose, reader);
        // Capacity purging takes file locks, so it must happen with our lock released.
        self.cache.reclaim();
        result
    }

    fn read_sync_inner(
        self: &Arc<Self>,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
        reader: &dyn ReadSyncMethods,
    ) -> Result<(Arc<Payload>, usize)> {
        let mut state = self.lock();
        if !state.pending.is_empty() && state.cached.is_some() {
            log::warn!("cache: File should not have cached data");
        }
        self.flush_locked(&mut state)?;

        let cacheable = reader.is_cacheable() && self.cache.enabled();
        if cacheable {
            if let Some(c) = &state.cached {
                log::debug!("Cache hit {}", self.fullname);
                self.cache.touch(self.id);
                return Ok((c.payload.clone(), c.soft_errors));
            }
        }

        let path = self.fullname.path();
        let mut input =
            File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let (payload, soft_errors) = reader
            .read_data_locked(self.attrs, &mut input, ustrs, verbose)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let payload = Arc::new(payload);

        if cacheable {
            let size = reader.cached_size_of_payload(&payload);
            self.purge_locked(&mut state, "internal:replacing");
            log::debug!("Caching {} size {}", self.fullname, size);
            state.cached = Some(CachedPayload {
                payload: payload.clone(),
                soft_errors,
                size,
            });
            self.cache.register(self, size);
        }
        Ok((payload, soft_errors))
    }

    /// Reason codes with the prefix "internal:" are reserved for the file layer.  Purging a file
    /// that is not cached is a no-op.

    pub fn purge_cache(&self, reason: &str) {
        let mut state = self.lock();
        self.purge_locked(&mut state, reason);
    }

    pub fn flush_sync(&self) -> Result<()> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn purge_locked(&self, state: &mut FileState, reason: &str) {
        if let Some(c) = state.cached.take() {
            log::info!("Purging {} b/c {}", self.fullname, reason);
            self.cache.unregister(self.id, c.size);
        }
    }

    // The queue is reset even if writing fails, the caller can't retry.  The directory is assumed
    // to exist, the cluster creates it along with the LogFile.
    fn flush_locked(&self, state: &mut FileState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut state.pending);
        let f = match OpenOptions::new()
            .append(true)
            .create(true)
            .mode(FILE_PERMISSIONS)
            .open(self.fullname.path())
        {
            Ok(f) => f,
            Err(e) => bail!("Failed to open/create file: {e}"),
        };
        let mut w = BufWriter::new(f);
        for item in items {
            w.write_all(&item)?;
            if item.last() != Some(&b'\n') {
                w.write_all(b"\n")?;
            }
        }
        w.flush()?;
        Ok(())
    }
}

impl fmt::Debug for LogFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogFile({})", self.fullname)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustutils::UstrCache;

    // Counts lines, for testing the file mechanics without the parsers.
    pub(crate) struct LineCounter;

    impl ReadSyncMethods for LineCounter {
        fn is_cacheable(&self) -> bool {
            true
        }

        fn read_data_locked(
            &self,
            _attr: FileAttr,
            input: &mut dyn io::Read,
            _ustrs: &mut dyn UstrAllocator,
            _verbose: bool,
        ) -> Result<(Payload, usize)> {
            let mut s = String::new();
            input.read_to_string(&mut s)?;
            let n = s.lines().count();
            Ok((Payload::Sacct(vec![SacctInfo::default(); n]), 0))
        }

        fn cached_size_of_payload(&self, payload: &Payload) -> i64 {
            match payload {
                Payload::Sacct(xs) => 100 * xs.len() as i64,
                _ => 0,
            }
        }
    }

    pub(crate) fn select_sacct(p: &Payload) -> &[SacctInfo] {
        match p {
            Payload::Sacct(xs) => xs,
            _ => &[],
        }
    }

    // This tests:
    //  - appends are not visible on disk until flushed
    //  - a missing newline is added, an empty append is a no-op
    //  - reading flushes first
    //  - reading caches, appending purges the cache

    #[test]
    fn test_logfile_states() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(1_000_000));
        let name = Fullname::new(Arc::new(dir.path().to_path_buf()), "", "a.csv");
        let lf = LogFile::with_cache(name, FILE_APPENDABLE | FILE_SLURM_CSV, cache.clone());

        lf.append_async("a=1,b=2");
        lf.append_async(b"c=3\n");
        lf.append_async("");
        assert!(!lf.fullname().path().exists());
        lf.flush_sync().unwrap();
        let text = std::fs::read_to_string(lf.fullname().path()).unwrap();
        assert!(text == "a=1,b=2\nc=3\n");

        lf.append_async("d=4");
        let mut ustrs = UstrCache::new();
        let (payload, soft) = lf.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        assert!(soft == 0);
        assert!(Records::new(payload, select_sacct).len() == 3);
        assert!(lf.is_cached());
        assert!(cache.budget() == 1_000_000 - 300);

        // Cache hit returns the same payload
        let (p1, _) = lf.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        let (p2, _) = lf.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));

        lf.append_async("e=5");
        assert!(!lf.is_cached());
        assert!(cache.budget() == 1_000_000);
        // The old view is still valid
        assert!(Records::new(p1, select_sacct).len() == 3);
        let (p3, _) = lf.read_sync(&mut ustrs, false, &LineCounter).unwrap();
        assert!(Records::new(p3, select_sacct).len() == 4);

        lf.purge_cache("testing");
        lf.purge_cache("testing");
        assert!(!lf.is_cached());
    }

    #[test]
    fn test_logfile_errors() {
        let dir = tempfile::tempdir().unwrap();
        let name = Fullname::new(Arc::new(dir.path().to_path_buf()), "nonexistent", "a.csv");
        let lf = LogFile::with_cache(name, FILE_APPENDABLE, Arc::new(Cache::new(-1)));
        let mut ustrs = UstrCache::new();
        assert!(lf.read_sync(&mut ustrs, false, &LineCounter).is_err());
        lf.append_async("x");
        let e = lf.flush_sync().unwrap_err();
        assert!(e.to_string().starts_with("Failed to open/create file"));
        // The queue was reset
        assert!(lf.flush_sync().is_ok());
    }

    #[test]
    #[should_panic]
    fn test_logfile_read_only() {
        let lf = LogFile::with_cache(
            Fullname::from_path(Path::new("/tmp/x.csv")),
            FILE_SAMPLE_CSV,
            Arc::new(Cache::new(-1)),
        );
        lf.append_async("x");
    }
}
