/// The cluster store: the process-wide registry of open clusters, and the interface common to all
/// clusters.
///
/// There is exactly one PersistentCluster per data directory in the process, so that there is
/// exactly one LogFile per appendable file.  Transient clusters are not registered, their files are
/// read-only.
///
/// FILE NAME SCHEMES.  Below the root of a persistent cluster there are directories `yyyy/mm/dd`
/// holding the data for the UTC day:
///
///   <host>.csv              samples, CSV
///   0+sample-<host>.json    samples, JSON
///   sysinfo-<host>.json     system descriptions, old JSON
///   0+sysinfo-<host>.json   system descriptions, JSON
///   slurm-sacct.csv         Slurm jobs, CSV
///   0+job-slurm.json        Slurm jobs, JSON
///   0+cluzter-slurm.json    Slurm partitions and node states, JSON
///
/// `cpuhog.csv` and `bughunt.csv` are reserved for other data and are not sample files.
use crate::cluzter::{CluzterAttributes, CluzterNodes, CluzterPartitions};
use crate::logfile::{FileAttr, Records};
use crate::persistent::PersistentCluster;
use crate::sacct::SacctInfo;
use crate::sample::{GpuDatum, LoadDatum, Sample};
use crate::sysinfo::{SysinfoCardData, SysinfoNodeData};
use crate::transient::TransientCluster;

use anyhow::Result;
use once_cell::sync::Lazy;
use rustutils::{ClusterConfig, HostGlobber, Timestamp};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors that callers may want to test for, with `err.downcast_ref::<StoreError>()`.

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Bad timestamp")]
    BadTimestamp,
    #[error("ClusterStore is closed")]
    ClusterClosed,
    #[error("Cluster is read-only list of files")]
    ReadOnlyDir,
}

/// All the time arguments are UTC; the date range is [from, to) with from and to rounded down and
/// up to midnight, respectively.  Every read returns the records as one blob per file, along with
/// the total number of soft errors.  Every operation on a closed cluster fails with
/// `StoreError::ClusterClosed`, except `config`, which returns None.

pub trait Cluster: Send + Sync {
    fn config(&self) -> Option<Arc<ClusterConfig>>;

    /// Flush and close.  Closing twice is an error.
    fn close(&self) -> Result<()>;

    /// Write pending appends to disk.
    fn flush_async(&self);

    fn sample_filenames(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>>;

    fn sysinfo_filenames(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>>;

    fn sacct_filenames(&self, from: Timestamp, to: Timestamp) -> Result<Vec<String>>;

    fn cluzter_filenames(&self, from: Timestamp, to: Timestamp) -> Result<Vec<String>>;

    fn read_samples(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<Sample>>, usize)>;

    fn read_load_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<LoadDatum>>, usize)>;

    fn read_gpu_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<GpuDatum>>, usize)>;

    fn read_sysinfo_nodes(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoNodeData>>, usize)>;

    fn read_sysinfo_cards(
        &self,
        from: Timestamp,
        to: Timestamp,
        hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoCardData>>, usize)>;

    fn read_sacct_data(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<SacctInfo>>, usize)>;

    fn read_cluzter_attributes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterAttributes>>, usize)>;

    fn read_cluzter_partitions(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterPartitions>>, usize)>;

    fn read_cluzter_nodes(
        &self,
        from: Timestamp,
        to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterNodes>>, usize)>;

    /// The timestamp is RFC3339 and selects the directory.  The payload is one or more records; a
    /// final newline is added if missing.  The data are written when the cluster is flushed or the
    /// file is read.
    fn append_samples_async(
        &self,
        ty: FileAttr,
        host: &str,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()>;

    fn append_sysinfo_async(
        &self,
        ty: FileAttr,
        host: &str,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()>;

    fn append_slurm_sacct_async(&self, ty: FileAttr, timestamp: &str, payload: &[u8])
        -> Result<()>;

    fn append_cluzter_async(&self, ty: FileAttr, timestamp: &str, payload: &[u8]) -> Result<()>;
}

#[derive(Default)]
struct ClusterStore {
    closed: bool,
    clusters: HashMap<PathBuf, Arc<PersistentCluster>>,
}

static STORE: Lazy<Mutex<ClusterStore>> = Lazy::new(|| Mutex::new(ClusterStore::default()));

/// Open the persistent cluster rooted at `dir`, or return the open cluster if there is one.  The
/// configuration is used only when the cluster is first opened.

pub fn open_persistent_cluster(
    dir: impl AsRef<Path>,
    cfg: Option<Arc<ClusterConfig>>,
) -> Result<Arc<PersistentCluster>> {
    let mut store = STORE.lock().unwrap_or_else(PoisonError::into_inner);
    if store.closed {
        return Err(StoreError::ClusterClosed.into());
    }
    let dir = clean_path(dir.as_ref());
    let pc = store
        .clusters
        .entry(dir.clone())
        .or_insert_with(|| Arc::new(PersistentCluster::new(&dir, cfg)));
    Ok(pc.clone())
}

pub fn open_transient_cluster<P: AsRef<Path>>(
    files: &[P],
    cfg: Option<Arc<ClusterConfig>>,
) -> Result<Arc<TransientCluster>> {
    if STORE.lock().unwrap_or_else(PoisonError::into_inner).closed {
        return Err(StoreError::ClusterClosed.into());
    }
    Ok(Arc::new(TransientCluster::new(files, cfg)?))
}

/// Close every open persistent cluster, flushing pending data.  Subsequent opens fail.

pub fn close() -> Result<()> {
    let mut store = STORE.lock().unwrap_or_else(PoisonError::into_inner);
    if store.closed {
        return Err(StoreError::ClusterClosed.into());
    }
    store.closed = true;
    for (_, pc) in store.clusters.drain() {
        // Already-closed clusters are fine.
        let _ = pc.close();
    }
    Ok(())
}

// Lexical cleanup of a path: drop `.` components and resolve `..` against the preceding component
// where there is one.
fn clean_path(p: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() {
                    result.push("..");
                }
            }
            c => result.push(c.as_os_str()),
        }
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    result
}

#[test]
fn test_clean_path() {
    assert!(clean_path(Path::new("/a/./b/../c/")) == PathBuf::from("/a/c"));
    assert!(clean_path(Path::new("a//b")) == PathBuf::from("a/b"));
    assert!(clean_path(Path::new("./")) == PathBuf::from("."));
    assert!(clean_path(Path::new("../x")) == PathBuf::from("../x"));
}

// The registry is process-global, so everything that closes it is in one test.

#[test]
fn test_cluster_store() {
    let dir = tempfile::tempdir().unwrap();
    let p1 = dir.path().join("fox");
    let p2 = dir.path().join("./fox/../fox/");
    std::fs::create_dir_all(&p1).unwrap();
    let c1 = open_persistent_cluster(&p1, None).unwrap();
    let c2 = open_persistent_cluster(&p2, None).unwrap();
    assert!(Arc::ptr_eq(&c1, &c2));
    assert!(c1.root() == p1.as_path());

    c1.append_cluzter_async(
        crate::logfile::FILE_CLUZTER_V0_JSON,
        "2024-06-03T12:00:00Z",
        b"{}",
    )
    .unwrap();

    close().unwrap();
    assert!(p1.join("2024/06/03/0+cluzter-slurm.json").exists());
    assert!(c1.config().is_none());
    let Err(e) = open_persistent_cluster(&p1, None) else {
        panic!("Open should fail after close");
    };
    assert!(e.downcast_ref::<StoreError>() == Some(&StoreError::ClusterClosed));
    assert!(open_transient_cluster(&["x.csv"], None).is_err());
    assert!(close().is_err());
}
