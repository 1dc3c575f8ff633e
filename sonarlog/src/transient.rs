/// A TransientCluster is a fixed list of files named by the user.  The files are read-only and
/// their data are not cached.  Each file's kind is determined by its name; a file whose name is not
/// that of some other kind of data is taken to hold samples.  The date range and host filter of a
/// query are ignored, the user has already selected the files.
use crate::cache::Cache;
use crate::clusterstore::{Cluster, StoreError};
use crate::cluzter::{CluzterAttributes, CluzterNodes, CluzterPartitions};
use crate::logfile::{FileAttr, Fullname, LogFile, Payload, ReadSyncMethods, Records};
use crate::persistent::{classify_basename, Kind};
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

use anyhow::{bail, Result};
use rustutils::{ClusterConfig, HostGlobber, Timestamp};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

pub struct TransientCluster {
    cfg: Option<Arc<ClusterConfig>>,
    files: Vec<(Kind, Arc<LogFile>)>,
    samples_methods: Arc<dyn ReadSyncMethods>,
    sysinfo_methods: Arc<dyn ReadSyncMethods>,
    sacct_methods: Arc<dyn ReadSyncMethods>,
    cluzter_methods: Arc<dyn ReadSyncMethods>,
    closed: Mutex<bool>,
}

impl TransientCluster {
    pub fn new<P: AsRef<Path>>(
        filenames: &[P],
        cfg: Option<Arc<ClusterConfig>>,
    ) -> Result<TransientCluster> {
        if filenames.is_empty() {
            bail!("Empty list of files");
        }
        // A private, disabled cache: nothing is ever cached.
        let cache = Arc::new(Cache::new(-1));
        let files = filenames
            .iter()
            .map(|p| {
                let fullname = Fullname::from_path(p.as_ref());
                let (kind, attr) = classify_basename(&fullname.basename);
                (kind, LogFile::with_cache(fullname, attr, cache.clone()))
            })
            .collect();
        Ok(TransientCluster {
            samples_methods: Arc::new(SampleFileMethods::new(cfg.clone())),
            sysinfo_methods: Arc::new(SysinfoFileMethods),
            sacct_methods: Arc::new(SacctFileMethods),
            cluzter_methods: Arc::new(CluzterFileMethods),
            cfg,
            files,
            closed: Mutex::new(false),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn files_of_kind(&self, kind: Kind) -> Result<Vec<Arc<LogFile>>> {
        if self.is_closed() {
            return Err(StoreError::ClusterClosed.into());
        }
        Ok(self
            .files
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn filenames(&self, kind: Kind) -> Result<Vec<String>> {
        Ok(self
            .files_of_kind(kind)?
            .iter()
            .map(|f| f.fullname().to_string())
            .collect())
    }

    fn read_records<T>(
        &self,
        kind: Kind,
        methods: &Arc<dyn ReadSyncMethods>,
        select_records: fn(&Payload) -> &[T],
        verbose: bool,
    ) -> Result<(Vec<Records<T>>, usize)> {
        let files = self.files_of_kind(kind)?;
        read_records_from_files(global_pool(), &files, methods.clone(), select_records, verbose)
    }

    fn read_only(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::ClusterClosed.into());
        }
        Err(StoreError::ReadOnlyDir.into())
    }
}

impl Cluster for TransientCluster {
    fn config(&self) -> Option<Arc<ClusterConfig>> {
        if self.is_closed() {
            return None;
        }
        self.cfg.clone()
    }

    fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(StoreError::ClusterClosed.into());
        }
        *closed = true;
        Ok(())
    }

    fn flush_async(&self) {}

    fn sample_filenames(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>> {
        self.filenames(Kind::Sample)
    }

    fn sysinfo_filenames(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
    ) -> Result<Vec<String>> {
        self.filenames(Kind::Sysinfo)
    }

    fn sacct_filenames(&self, _from: Timestamp, _to: Timestamp) -> Result<Vec<String>> {
        self.filenames(Kind::Sacct)
    }

    fn cluzter_filenames(&self, _from: Timestamp, _to: Timestamp) -> Result<Vec<String>> {
        self.filenames(Kind::Cluzter)
    }

    fn read_samples(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<Sample>>, usize)> {
        self.read_records(Kind::Sample, &self.samples_methods, select_samples, verbose)
    }

    fn read_load_data(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<LoadDatum>>, usize)> {
        self.read_records(Kind::Sample, &self.samples_methods, select_load_data, verbose)
    }

    fn read_gpu_data(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<GpuDatum>>, usize)> {
        self.read_records(Kind::Sample, &self.samples_methods, select_gpu_data, verbose)
    }

    fn read_sysinfo_nodes(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoNodeData>>, usize)> {
        self.read_records(Kind::Sysinfo, &self.sysinfo_methods, select_sysinfo_nodes, verbose)
    }

    fn read_sysinfo_cards(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        _hosts: Option<&HostGlobber>,
        verbose: bool,
    ) -> Result<(Vec<Records<SysinfoCardData>>, usize)> {
        self.read_records(Kind::Sysinfo, &self.sysinfo_methods, select_sysinfo_cards, verbose)
    }

    fn read_sacct_data(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<SacctInfo>>, usize)> {
        self.read_records(Kind::Sacct, &self.sacct_methods, select_sacct, verbose)
    }

    fn read_cluzter_attributes(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterAttributes>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(Kind::Cluzter, m, select_cluzter_attributes, verbose)
    }

    fn read_cluzter_partitions(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterPartitions>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(Kind::Cluzter, m, select_cluzter_partitions, verbose)
    }

    fn read_cluzter_nodes(
        &self,
        _from: Timestamp,
        _to: Timestamp,
        verbose: bool,
    ) -> Result<(Vec<Records<CluzterNodes>>, usize)> {
        let m = &self.cluzter_methods;
        self.read_records(Kind::Cluzter, m, select_cluzter_nodes, verbose)
    }

    fn append_samples_async(&self, _: FileAttr, _: &str, _: &str, _: &[u8]) -> Result<()> {
        self.read_only()
    }

    fn append_sysinfo_async(&self, _: FileAttr, _: &str, _: &str, _: &[u8]) -> Result<()> {
        self.read_only()
    }

    fn append_slurm_sacct_async(&self, _: FileAttr, _: &str, _: &[u8]) -> Result<()> {
        self.read_only()
    }

    fn append_cluzter_async(&self, _: FileAttr, _: &str, _: &[u8]) -> Result<()> {
        self.read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::FILE_SAMPLE_CSV;
    use rustutils::{epoch, far_future};

    #[test]
    fn test_transient_read() {
        let tc = TransientCluster::new(
            &[
                "../tests/sonarlog/whitebox-intermingled.csv",
                "../tests/sonarlog/whitebox-untagged-intermingled.csv",
            ],
            Some(Arc::new(ClusterConfig::new("fox"))),
        )
        .unwrap();
        let names = tc.sample_filenames(epoch(), far_future(), None).unwrap();
        assert!(names.len() == 2 && names[0].ends_with("whitebox-intermingled.csv"));
        assert!(tc.sacct_filenames(epoch(), far_future()).unwrap().is_empty());
        let (blobs, soft_errors) = tc.read_samples(epoch(), far_future(), None, false).unwrap();
        assert!(blobs.len() == 2);
        assert!(blobs[0].len() == 5);
        assert!(soft_errors >= 4);
        assert!(blobs[0].iter().all(|s| s.cluster.as_str() == "fox"));
        let (load, _) = tc.read_load_data(epoch(), far_future(), None, false).unwrap();
        assert!(load[0].len() == 1);
    }

    #[test]
    fn test_transient_state_errors() {
        assert!(TransientCluster::new::<&str>(&[], None).is_err());
        let tc = TransientCluster::new(&["../tests/sonarlog/whitebox-intermingled.csv"], None)
            .unwrap();
        let e = tc
            .append_samples_async(FILE_SAMPLE_CSV, "a", "2023-05-28T12:00:00Z", b"x")
            .unwrap_err();
        assert!(matches!(e.downcast_ref::<StoreError>(), Some(StoreError::ReadOnlyDir)));
        tc.close().unwrap();
        let e = tc.close().unwrap_err();
        assert!(matches!(e.downcast_ref::<StoreError>(), Some(StoreError::ClusterClosed)));
        assert!(tc.read_samples(epoch(), far_future(), None, false).is_err());
        assert!(tc.config().is_none());
    }
}
