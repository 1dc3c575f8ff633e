/// A PersistentCluster is backed by a date-indexed directory tree and finds and manages the files
/// in that tree.
///
/// The cluster keeps a shadow of the tree for a date range [from_date, to_date), both midnight UTC.
/// Every leaf directory `yyyy/mm/dd` in the range is known to the shadow tree, and when a query
/// presents a wider range the missing directories are probed first.  The range only ever widens.
///
/// The files in a leaf directory are found lazily, per kind of file, the first time they are
/// needed.  If we know any files of a kind in a directory then we know all of them: new files are
/// created through the cluster, not behind its back.  Hence there is a single LogFile per disk
/// file, which the caching and append logic depends on.
///
/// The shadow tree is never pruned, as a directory can be dropped only if nothing anywhere holds a
/// reference to one of its files.  It grows by one directory per day plus one LogFile per file.
///
/// Locking: the cluster lock is taken before any file lock.  File operations that may be slow
/// (reading, appending) are performed with the cluster lock released.
use crate::cache::{global_cache, Cache};
use crate::clusterstore::{Cluster, StoreError};
use crate::cluzter::{CluzterAttributes, CluzterNodes, CluzterPartitions};
use crate::logfile::{
    FileAttr, Fullname, LogFile, Payload, ReadSyncMethods, Records, FILE_APPENDABLE,
    FILE_CLUZTER_V0_JSON, FILE_SAMPLE_CSV, FILE_SAMPLE_V0_JSON, FILE_SLURM_CSV,
    FILE_SLURM_V0_JSON, FILE_SYSINFO_OLD_JSON, FILE_SYSINFO_V0_JSON,
};
use crate::pool::{global_pool, read_records_from_files};
use crate::readers::{
    select_cluzter_attributes, select_cluzter_nodes, select_cluzter_partitions,
    select_gpu_data, select_load_data, select_sacct, select_samples, select_sysinfo_cards,
    select_sysinfo_nodes, CluzterFileMethods, SacctFileMethods, SampleFileMethods,
    SysinfoFileMethods,
};
use crate::sacct::SacctInfo;
use crate::sample::{GpuDatum, LoadDatum, Sample};
use crate::sysinfo::{SysinfoCardData, SysinfoNodeData};

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, Utc};
use rustutils::{now, roundup_day, this_day, ClusterConfig, HostGlobber, Timestamp};
use std::collections::HashMap;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const DIR_PERMISSIONS: u32 = 0o755;

// File name schemes.  The host name, where there is one, is the part matched by the wildcard.

#[derive(Clone, Copy)]
enum Glob {
    Exact(&'static str),
    Wild(&'static str, &'static str),
}

impl Glob {
    fn matches(&self, name: &str) -> bool {
        match *self {
            Glob::Exact(s) => name == s,
            Glob::Wild(prefix, suffix) => {
                name.len() > prefix.len() + suffix.len()
                    && name.starts_with(prefix)
                    && name.ends_with(suffix)
            }
        }
    }

    fn host<'a>(&self, name: &'a str) -> Option<&'a str> {
        match *self {
            Glob::Exact(_) => None,
            Glob::Wild(prefix, suffix) => {
                if self.matches(name) {
                    Some(&name[prefix.len()..name.len() - suffix.len()])
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Kind {
    Sample,
    Sysinfo,
    Sacct,
    Cluzter,
}

const NUM_KINDS: usize = 4;

impl Kind {
    fn index(self) -> usize {
        self as usize
    }

    fn globs(self) -> &'static [Glob] {
        match self {
            Kind::Sample => &[Glob::Wild("", ".csv"), Glob::Wild("0+sample-", ".json")],
            Kind::Sysinfo => &[
                Glob::Wild("sysinfo-", ".json"),
                Glob::Wild("0+sysinfo-", ".json"),
            ],
            Kind::Sacct => &[Glob::Exact("slurm-sacct.csv"), Glob::Exact("0+job-slurm.json")],
            Kind::Cluzter => &[Glob::Exact("0+cluzter-slurm.json")],
        }
    }

    // Names that match the globs but are reserved for other data.
    fn proscribed(self, name: &str) -> bool {
        match self {
            Kind::Sample => {
                name == "cpuhog.csv" || name == "bughunt.csv" || name == "slurm-sacct.csv"
            }
            _ => false,
        }
    }

    fn matches(self, name: &str) -> bool {
        self.globs().iter().any(|g| g.matches(name)) && !self.proscribed(name)
    }

    fn file_type(self, name: &str) -> FileAttr {
        match self {
            Kind::Sample if name.starts_with("0+sample-") => FILE_SAMPLE_V0_JSON,
            Kind::Sample => FILE_SAMPLE_CSV,
            Kind::Sysinfo if name.starts_with("0+sysinfo-") => FILE_SYSINFO_V0_JSON,
            Kind::Sysinfo => FILE_SYSINFO_OLD_JSON,
            Kind::Sacct if name == "slurm-sacct.csv" => FILE_SLURM_CSV,
            Kind::Sacct => FILE_SLURM_V0_JSON,
            Kind::Cluzter => FILE_CLUZTER_V0_JSON,
        }
    }

    fn host_of<'a>(self, name: &'a str) -> Option<&'a str> {
        self.globs().iter().find_map(|g| g.host(name))
    }
}

/// Classify a file by its name.  Anything that is not recognizably some other kind of data is
/// taken to be sample data.

pub(crate) fn classify_basename(name: &str) -> (Kind, FileAttr) {
    for kind in [Kind::Sacct, Kind::Cluzter, Kind::Sysinfo] {
        if kind.matches(name) {
            return (kind, kind.file_type(name));
        }
    }
    (Kind::Sample, Kind::Sample.file_type(name))
}

pub(crate) fn dirname_from_time(t: Timestamp) -> String {
    format!("{:04}/{:02}/{:02}", t.year(), t.month(), t.day())
}

struct PersistentDir {
    // "yyyy/mm/dd" relative to the cluster root
    name: String,

    // Per kind, None until the directory has been scanned for files of that kind.
    files: [Option<HashMap<String, Arc<LogFile>>>; NUM_KINDS],
}

impl PersistentDir {
    fn new(name: String) -> PersistentDir {
        PersistentDir {
            name,
            files: Default::default(),
        }
    }
}

struct ClusterState {
    closed: bool,
    from_date: Timestamp,
    to_date: Timestamp,
    // Sorted ascending by name, hence by date
    dirs: Vec<PersistentDir>,
    // Files with appended data that have not been flushed
    dirty: HashMap<u64, Arc<LogFile>>,
}

pub struct PersistentCluster {
    root: Arc<PathBuf>,
    cfg: Option<Arc<ClusterConfig>>,
    cache: Arc<Cache>,
    samples_methods: Arc<dyn ReadSyncMethods>,
    sysinfo_methods: Arc<dyn ReadSyncMethods>,
    sacct_methods: Arc<dyn ReadSyncMethods>,
    cluzter_methods: Arc<dyn ReadSyncMethods>,
    state: Mutex<ClusterState>,
}

impl PersistentCluster {
    /// `root` should be a cleaned path, it is the identity of the cluster.

    pub fn new(root: &Path, cfg: Option<Arc<ClusterConfig>>) -> PersistentCluster {
        PersistentCluster::with_cache(root, cfg, global_cache())
    }

    pub fn with_cache(
        root: &Path,
        cfg: Option<Arc<ClusterConfig>>,
        cache: Arc<Cache>,
    ) -> PersistentCluster {
        let from_date = this_day(now());
        let to_date = from_date + Duration::days(1);
        let dirs = find_sorted_date_indexed_directories(root, from_date, to_date);
        PersistentCluster {
            root: Arc::new(root.to_path_buf()),
            samples_methods: Arc::new(SampleFileMethods::new(cfg.clone())),
            sysinfo_methods: Arc::new(SysinfoFileMethods),
            sacct_methods: Arc::new(SacctFileMethods),
            cluzter_methods: Arc::new(CluzterFileMethods),
            cfg,
            cache,
            state: Mutex::new(ClusterState {
                closed: false,
                from_date,
                to_date,
                dirs,
                dirty: HashMap::new(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_filenames(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        kind: Kind,
    ) -> Result<Vec<String>> {
        let files = self.find_files(from, to, hosts, kind)?;
        Ok(files.iter().map(|f| f.fullname().to_string()).collect())
    }

    fn find_files(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        kind: Kind,
    ) -> Result<Vec<Arc<LogFile>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::ClusterClosed.into());
        }
        Ok(self.find_files_locked(&mut state, from, to, hosts, kind))
    }

    fn read_records<T>(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        kind: Kind,
        methods: &Arc<dyn ReadSyncMethods>,
        select_records: fn(&Payload) -> &[T],
        verbose: bool,
    ) -> Result<(Vec<Records<T>>, usize)> {
        let files = self.find_files(from, to, hosts, kind)?;
        read_records_from_files(global_pool(), &files, methods.clone(), select_records, verbose)
    }

    fn append_data_async(
        &self,
        kind: Kind,
        timestamp: &str,
        basename: &str,
        payload: &[u8],
    ) -> Result<()> {
        let file = {
            let mut state = self.lock();
            if state.closed {
                return Err(StoreError::ClusterClosed.into());
            }
            let file = self.find_file_by_time_locked(&mut state, timestamp, basename, kind)?;
            state.dirty.insert(file.id(), file.clone());
            file
        };
        file.append_async(payload);
        Ok(())
    }

    fn find_files_locked(
        &self,
        state: &mut ClusterState,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        kind: Kind,
    ) -> Vec<Arc<LogFile>> {
        let from = this_day(from);
        let to = roundup_day(to);
        let hosts = hosts.filter(|h| !h.is_empty());
        let (lo, hi) = self.select_dirs_locked(state, from, to);
        let mut files = vec![];
        for d in &mut state.dirs[lo..hi] {
            let found = self.scanned_files(d, kind);
            let mut selected = found
                .values()
                .filter(|f| match hosts {
                    Some(h) => kind
                        .host_of(&f.fullname().basename)
                        .is_some_and(|host| h.match_hostname(host)),
                    None => true,
                })
                .cloned()
                .collect::<Vec<Arc<LogFile>>>();
            // Hash order is arbitrary, make the result stable.
            selected.sort_by(|a, b| a.fullname().basename.cmp(&b.fullname().basename));
            files.extend(selected);
        }
        files
    }

    // The files of the kind in the directory, scanning it first if necessary.
    fn scanned_files<'a>(
        &self,
        d: &'a mut PersistentDir,
        kind: Kind,
    ) -> &'a mut HashMap<String, Arc<LogFile>> {
        let name = &d.name;
        let root = &self.root;
        let cache = &self.cache;
        d.files[kind.index()].get_or_insert_with(|| {
            find_files_in_dir(&root.join(name), kind)
                .into_iter()
                .map(|basename| {
                    let f = LogFile::with_cache(
                        Fullname::new(root.clone(), name, &basename),
                        FILE_APPENDABLE | kind.file_type(&basename),
                        cache.clone(),
                    );
                    (basename, f)
                })
                .collect()
        })
    }

    // Returns the range within state.dirs of the directories for [from, to), which must be
    // midnight-aligned.
    fn select_dirs_locked(
        &self,
        state: &mut ClusterState,
        from: Timestamp,
        to: Timestamp,
    ) -> (usize, usize) {
        self.ensure_scanned_directories_locked(state, from, to);
        let lo = binary_search_dirs(&state.dirs, from).unwrap_or_else(|x| x);
        let hi = binary_search_dirs(&state.dirs, to).unwrap_or_else(|x| x);
        (lo, hi)
    }

    fn find_file_by_time_locked(
        &self,
        state: &mut ClusterState,
        timestamp: &str,
        basename: &str,
        kind: Kind,
    ) -> Result<Arc<LogFile>> {
        // Normalized to UTC, so 2024-06-03T00:00:01+02:00 goes into 2024/06/02.
        let t = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| StoreError::BadTimestamp)?
            .with_timezone(&Utc);
        let ix = self.ensure_directory_locked(state, t)?;
        let root = self.root.clone();
        let cache = self.cache.clone();
        let d = &mut state.dirs[ix];
        let dirname = d.name.clone();
        let files = self.scanned_files(d, kind);
        let file = files.entry(basename.to_string()).or_insert_with(|| {
            LogFile::with_cache(
                Fullname::new(root, &dirname, basename),
                FILE_APPENDABLE | kind.file_type(basename),
                cache,
            )
        });
        Ok(file.clone())
    }

    // Make sure the directory for `t` exists on disk and in the shadow tree, and return its index.
    fn ensure_directory_locked(&self, state: &mut ClusterState, t: Timestamp) -> Result<usize> {
        let from = this_day(t);
        let to = from + Duration::days(1);
        self.ensure_scanned_directories_locked(state, from, to);
        match binary_search_dirs(&state.dirs, from) {
            Ok(ix) => Ok(ix),
            Err(ix) => {
                let name = dirname_from_time(from);
                DirBuilder::new()
                    .recursive(true)
                    .mode(DIR_PERMISSIONS)
                    .create(self.root.join(&name))?;
                state.dirs.insert(ix, PersistentDir::new(name));
                Ok(ix)
            }
        }
    }

    // Widen the shadow tree to cover [from, to), both midnight-aligned.
    fn ensure_scanned_directories_locked(
        &self,
        state: &mut ClusterState,
        from: Timestamp,
        to: Timestamp,
    ) {
        if from < state.from_date {
            let prefix = find_sorted_date_indexed_directories(&self.root, from, state.from_date);
            state.dirs.splice(0..0, prefix);
            state.from_date = from;
        }
        if state.to_date < to {
            let suffix = find_sorted_date_indexed_directories(&self.root, state.to_date, to);
            state.dirs.extend(suffix);
            state.to_date = to;
        }
        debug_assert!(state.dirs.windows(2).all(|w| w[0].name < w[1].name));
    }

    fn flush_sync_locked(state: &mut ClusterState) {
        for (_, file) in state.dirty.drain() {
            if let Err(e) = file.flush_sync() {
                log::warn!("Flushing {}: {e}", file.fullname());
            }
        }
    }
}

impl Cluster for PersistentCluster {
    fn config(&self) -> Option<Arc<ClusterConfig>> {
        if self.lock().closed {
            return None;
        }
        self.cfg.clone()
    }

    fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(StoreError::ClusterClosed.into());
        }
        state.closed = true;
        PersistentCluster::flush_sync_locked(&mut state);
        for d in &state.dirs {
            for files in d.files.iter().flatten() {
                for f in files.values() {
                    f.purge_cache("closing cluster");
                }
            }
        }
        Ok(())
    }

    fn flush_async(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        PersistentCluster::flush_sync_locked(&mut state);
    }

    fn sample_filenames(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>> {
        self.find_filenames(from, to, hosts, Kind::Sample)
    }

    fn sysinfo_filenames(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>> {
        self.find_filenames(from, to, hosts, Kind::Sysinfo)
    }

    fn sacct_filenames(&self, from: Timestamp, to: Timestamp) -> Result<Vec<String>> {
        self.find_filenames(from, to, None, Kind::Sacct)
    }

    fn cluzter_filenames(&self, from: Timestamp, to: Timestamp) -> Result<Vec<String>> {
        self.find_filenames(from, to, None, Kind::Cluzter)
    }

    fn read_samples(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<Sample>>, usize)> {
        let m = &self.samples_methods;
        self.read_records(from, to, hosts, Kind::Sample, m, select_samples, verbose)
    }

    fn read_load_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<LoadDatum>>, usize)> {
        let m = &self.samples_methods;
        self.read_records(from, to, hosts, Kind::Sample, m, select_load_data, verbose)
    }

    fn read_gpu_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<GpuDatum>>, usize)> {
        let m = &self.samples_methods;
        self.read_records(from, to, hosts, Kind::Sample, m, select_gpu_data, verbose)
    }

    fn read_sysinfo_nodes(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoNodeData>>, usize)> {
        let m = &self.sysinfo_methods;
        self.read_records(from, to, hosts, Kind::Sysinfo, m, select_sysinfo_nodes, verbose)
    }

    fn read_sysinfo_cards(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoCardData>>, usize)> {
        let m = &self.sysinfo_methods;
        self.read_records(from, to, hosts, Kind::Sysinfo, m, select_sysinfo_cards, verbose)
    }

    fn read_sacct_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<SacctInfo>>, usize)> {
        let m = &self.sacct_methods;
        self.read_records(from, to, None, Kind::Sacct, m, select_sacct, verbose)
    }

    fn read_cluzter_attributes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterAttributes>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(from, to, None, Kind::Cluzter, m, select_cluzter_attributes, verbose)
    }

    fn read_cluzter_partitions(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterPartitions>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(from, to, None, Kind::Cluzter, m, select_cluzter_partitions, verbose)
    }

    fn read_cluzter_nodes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterNodes>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(from, to, None, Kind::Cluzter, m, select_cluzter_nodes, verbose)
    }

    fn append_samples_async(
        &self,
        ty: FileAttr,
        host: &str,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()> {
        let name = match ty {
            FILE_SAMPLE_CSV => format!("{host}.csv"),
            FILE_SAMPLE_V0_JSON => format!("0+sample-{host}.json"),
            _ => panic!("Unsupported sample data format"),
        };
        self.append_data_async(Kind::Sample, timestamp, &name, payload)
    }

    fn append_sysinfo_async(
        &self,
        ty: FileAttr,
        host: &str,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()> {
        let name = match ty {
            FILE_SYSINFO_OLD_JSON => format!("sysinfo-{host}.json"),
            FILE_SYSINFO_V0_JSON => format!("0+sysinfo-{host}.json"),
            _ => panic!("Unsupported sysinfo data format"),
        };
        self.append_data_async(Kind::Sysinfo, timestamp, &name, payload)
    }

    fn append_slurm_sacct_async(
        &self,
        ty: FileAttr,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()> {
        let name = match ty {
            FILE_SLURM_CSV => "slurm-sacct.csv",
            FILE_SLURM_V0_JSON => "0+job-slurm.json",
            _ => panic!("Unsupported slurm data format"),
        };
        self.append_data_async(Kind::Sacct, timestamp, name, payload)
    }

    fn append_cluzter_async(&self, ty: FileAttr, timestamp: &str, payload: &[u8]) -> Result<()> {
        assert!(ty == FILE_CLUZTER_V0_JSON, "Unsupported cluzter data format");
        self.append_data_async(Kind::Cluzter, timestamp, "0+cluzter-slurm.json", payload)
    }
}

// Errors are ignored, an unreadable directory has no files.
fn find_files_in_dir(dir: &Path, kind: Kind) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| kind.matches(name))
        .collect()
}

// The directories `yyyy/mm/dd` under root for the days in [from, to), ascending.  Errors and
// non-directories are ignored.
fn find_sorted_date_indexed_directories(
    root: &Path,
    from: Timestamp,
    to: Timestamp,
) -> Vec<PersistentDir> {
    let mut result = vec![];
    let mut t = from;
    while t < to {
        let name = dirname_from_time(t);
        if root.join(&name).is_dir() {
            result.push(PersistentDir::new(name));
        }
        t += Duration::days(1);
    }
    result
}

fn binary_search_dirs(dirs: &[PersistentDir], t: Timestamp) -> Result<usize, usize> {
    let name = dirname_from_time(t);
    dirs.binary_search_by(|d| d.name.as_str().cmp(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustutils::timestamp_from_ymd;
    use std::fs;

    fn make_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        fs::create_dir_all(p.join("2023/05/28")).unwrap();
        fs::create_dir_all(p.join("2023/05/30")).unwrap();
        fs::create_dir_all(p.join("2023/05/31")).unwrap();
        let a = "v=0.11.1,time=2023-05-28T12:00:00Z,host=a,user=u,cmd=x,pid=1,cputime_sec=1\n";
        let b = "v=0.11.1,time=2023-05-28T12:00:00Z,host=b,user=u,cmd=x,pid=2,cputime_sec=1\n";
        let a30 = "v=0.11.1,time=2023-05-30T12:00:00Z,host=a,user=u,cmd=y,pid=3,cputime_sec=1\n";
        fs::write(p.join("2023/05/28/a.csv"), a).unwrap();
        fs::write(p.join("2023/05/28/b.csv"), b).unwrap();
        fs::write(p.join("2023/05/30/a.csv"), a30).unwrap();
        fs::write(p.join("2023/05/31/bughunt.csv"), "junk\n").unwrap();
        fs::write(p.join("2023/05/31/slurm-sacct.csv"), "").unwrap();
        dir
    }

    fn globber(pattern: &str) -> HostGlobber {
        let mut h = HostGlobber::new(false);
        h.insert(pattern).unwrap();
        h
    }

    fn private_cluster(root: &Path) -> PersistentCluster {
        PersistentCluster::with_cache(root, None, Arc::new(Cache::new(1_000_000)))
    }

    // This tests:
    //  - files are selected by date range and host
    //  - reserved names are not sample files
    //  - the sacct file is found as a sacct file only

    #[test]
    fn test_select_files() {
        let dir = make_tree();
        let pc = private_cluster(dir.path());
        let from = timestamp_from_ymd(2023, 5, 28);
        let to = timestamp_from_ymd(2023, 6, 1);
        let names = pc.sample_filenames(from, to, Some(&globber("a"))).unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        assert!(
            names
                == vec![
                    format!("{root}/2023/05/28/a.csv"),
                    format!("{root}/2023/05/30/a.csv")
                ]
        );
        let names = pc.sample_filenames(from, to, None).unwrap();
        assert!(names.len() == 3);
        assert!(names.iter().all(|n| !n.ends_with("bughunt.csv") && !n.ends_with("sacct.csv")));
        let names = pc.sacct_filenames(from, to).unwrap();
        assert!(names.len() == 1 && names[0].ends_with("2023/05/31/slurm-sacct.csv"));

        // Half-open range
        let names = pc
            .sample_filenames(from, timestamp_from_ymd(2023, 5, 30), None)
            .unwrap();
        assert!(names.len() == 2);
    }

    #[test]
    fn test_classify() {
        assert!(classify_basename("a.csv") == (Kind::Sample, FILE_SAMPLE_CSV));
        assert!(classify_basename("0+sample-a.json") == (Kind::Sample, FILE_SAMPLE_V0_JSON));
        assert!(classify_basename("sysinfo-a.json") == (Kind::Sysinfo, FILE_SYSINFO_OLD_JSON));
        assert!(classify_basename("0+sysinfo-a.json") == (Kind::Sysinfo, FILE_SYSINFO_V0_JSON));
        assert!(classify_basename("slurm-sacct.csv") == (Kind::Sacct, FILE_SLURM_CSV));
        assert!(classify_basename("0+job-slurm.json") == (Kind::Sacct, FILE_SLURM_V0_JSON));
        assert!(classify_basename("0+cluzter-slurm.json") == (Kind::Cluzter, FILE_CLUZTER_V0_JSON));
        assert!(Kind::Sample.host_of("0+sample-c1-2.json") == Some("c1-2"));
        assert!(Kind::Sysinfo.host_of("0+sysinfo-c1-2.json") == Some("c1-2"));
        assert!(Kind::Sysinfo.host_of("sysinfo-c1-2.json") == Some("c1-2"));
        assert!(Kind::Sample.host_of("c1-2.fox.csv") == Some("c1-2.fox"));
        assert!(Kind::Sacct.host_of("slurm-sacct.csv").is_none());
    }

    // This tests:
    //  - appends are binned by UTC date and create the directory
    //  - the appended data are on disk after flushing and are seen by an immediate read
    //  - the same LogFile is used for a file whether it was found or created

    #[test]
    fn test_append_then_read() {
        let dir = make_tree();
        let pc = private_cluster(dir.path());
        let from = timestamp_from_ymd(2023, 5, 28);
        let to = timestamp_from_ymd(2023, 5, 29);
        let (blobs, _) = pc.read_samples(from, to, Some(&globber("a")), false).unwrap();
        assert!(blobs.len() == 1 && blobs[0].len() == 1);

        let r1 = "v=0.11.1,time=2023-05-28T12:05:00Z,host=a,user=u,cmd=x,pid=1,cputime_sec=2";
        let r2 = "v=0.11.1,time=2023-05-28T12:10:00Z,host=a,user=u,cmd=x,pid=1,cputime_sec=3\n";
        pc.append_samples_async(FILE_SAMPLE_CSV, "a", "2023-05-28T12:05:00Z", r1.as_bytes())
            .unwrap();
        pc.append_samples_async(FILE_SAMPLE_CSV, "a", "2023-05-28T12:10:00Z", r2.as_bytes())
            .unwrap();
        let (blobs, soft) = pc.read_samples(from, to, Some(&globber("a")), false).unwrap();
        assert!(soft == 0);
        assert!(blobs.len() == 1 && blobs[0].len() == 3);
        assert!(blobs[0][2].cputime_sec == 3);

        pc.flush_async();
        let text = fs::read_to_string(dir.path().join("2023/05/28/a.csv")).unwrap();
        let lines = text.lines().collect::<Vec<&str>>();
        assert!(lines.len() == 3);
        assert!(lines[1] == r1 && lines[2] == r2.trim_end());

        // A new day in the local zone is still the old day in UTC
        pc.append_samples_async(FILE_SAMPLE_CSV, "c", "2024-06-03T00:00:01+02:00", b"x")
            .unwrap();
        pc.flush_async();
        assert!(dir.path().join("2024/06/02/c.csv").exists());
        assert!(!dir.path().join("2024/06/03").exists());

        let e = pc
            .append_samples_async(FILE_SAMPLE_CSV, "c", "yesterday", b"x")
            .unwrap_err();
        assert!(matches!(e.downcast_ref::<StoreError>(), Some(StoreError::BadTimestamp)));
    }

    #[test]
    fn test_append_into_unscanned_dir() {
        let dir = make_tree();
        let pc = private_cluster(dir.path());
        // Appending to b.csv must not hide a.csv in the same directory
        pc.append_samples_async(FILE_SAMPLE_CSV, "b", "2023-05-28T13:00:00Z", b"x")
            .unwrap();
        let names = pc
            .sample_filenames(
                timestamp_from_ymd(2023, 5, 28),
                timestamp_from_ymd(2023, 5, 29),
                None,
            )
            .unwrap();
        assert!(names.len() == 2);
    }

    #[test]
    fn test_unique_logfile() {
        let dir = make_tree();
        let pc = private_cluster(dir.path());
        let from = timestamp_from_ymd(2023, 5, 28);
        let to = timestamp_from_ymd(2023, 5, 29);
        let f1 = pc.find_files(from, to, Some(&globber("a")), Kind::Sample).unwrap();
        let f2 = pc.find_files(from, to, Some(&globber("a")), Kind::Sample).unwrap();
        assert!(Arc::ptr_eq(&f1[0], &f2[0]));
        let mut state = pc.lock();
        let f3 = pc
            .find_file_by_time_locked(&mut state, "2023-05-28T01:00:00Z", "a.csv", Kind::Sample)
            .unwrap();
        assert!(Arc::ptr_eq(&f1[0], &f3));
    }

    #[test]
    fn test_closed() {
        let dir = make_tree();
        let cfg = Arc::new(ClusterConfig::new("test"));
        let pc = PersistentCluster::with_cache(dir.path(), Some(cfg), Arc::new(Cache::new(-1)));
        pc.append_samples_async(FILE_SAMPLE_CSV, "d", "2023-05-28T13:00:00Z", b"x")
            .unwrap();
        assert!(pc.config().is_some_and(|c| c.name == "test"));
        pc.close().unwrap();
        assert!(pc.config().is_none());
        // Close flushed
        assert!(dir.path().join("2023/05/28/d.csv").exists());
        let e = pc.close().unwrap_err();
        assert!(e.to_string() == "ClusterStore is closed");
        let from = timestamp_from_ymd(2023, 5, 28);
        assert!(pc.sample_filenames(from, from, None).is_err());
        assert!(pc
            .append_slurm_sacct_async(FILE_SLURM_CSV, "2023-05-28T13:00:00Z", b"x")
            .is_err());
    }
}
