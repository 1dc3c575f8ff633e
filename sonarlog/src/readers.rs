/// Record readers: the per-kind `ReadSyncMethods` that parse a file into a `Payload`, and the
/// selectors that turn a payload into a typed view of one of its record streams.
///
/// Sample files may be rectified after parsing, before the data are cached.  The default
/// rectification fills in the cluster name for records that don't carry one (the CSV format has
/// no cluster field).
use crate::cluzter::{
    parse_cluzter_v0_json, CluzterAttributes, CluzterNodes, CluzterPartitions,
};
use crate::logfile::{
    FileAttr, Payload, ReadSyncMethods, FILE_CLUZTER_V0_JSON, FILE_SAMPLE_CSV,
    FILE_SAMPLE_V0_JSON, FILE_SLURM_CSV, FILE_SLURM_V0_JSON, FILE_SYSINFO_OLD_JSON,
    FILE_SYSINFO_V0_JSON,
};
use crate::sacct::{parse_sacct_csv, parse_sacct_v0_json, SacctInfo};
use crate::sample::{EncodedGpuData, EncodedLoadData, GpuDatum, LoadDatum, PerGpuDatum, Sample};
use crate::samplecsv::{parse_sample_csv, SampleData};
use crate::samplejson::parse_sample_v0_json;
use crate::sysinfo::{
    parse_sysinfo_old_json, parse_sysinfo_v0_json, SysinfoCardData, SysinfoNodeData,
};

use anyhow::{bail, Result};
use rustutils::{ClusterConfig, UstrAllocator};
use std::io;
use std::mem::size_of;
use std::sync::Arc;

/// Applied to freshly parsed sample data before they are cached.

pub type SampleRectifier = fn(&mut SampleData, Option<&ClusterConfig>, &mut dyn UstrAllocator);

pub fn rectify_cluster_name(
    data: &mut SampleData,
    cfg: Option<&ClusterConfig>,
    ustrs: &mut dyn UstrAllocator,
) {
    if let Some(cfg) = cfg {
        let name = ustrs.alloc(&cfg.name);
        for s in data.samples.iter_mut().filter(|s| s.cluster.is_empty()) {
            s.cluster = name;
        }
    }
}

pub struct SampleFileMethods {
    cfg: Option<Arc<ClusterConfig>>,
    rectifier: Option<SampleRectifier>,
}

impl SampleFileMethods {
    pub fn new(cfg: Option<Arc<ClusterConfig>>) -> SampleFileMethods {
        SampleFileMethods {
            cfg,
            rectifier: Some(rectify_cluster_name),
        }
    }

    pub fn with_rectifier(
        cfg: Option<Arc<ClusterConfig>>,
        rectifier: Option<SampleRectifier>,
    ) -> SampleFileMethods {
        SampleFileMethods { cfg, rectifier }
    }
}

impl ReadSyncMethods for SampleFileMethods {
    fn is_cacheable(&self) -> bool {
        true
    }

    fn read_data_locked(
        &self,
        attr: FileAttr,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Payload, usize)> {
        let (mut data, soft_errors) = if attr & FILE_SAMPLE_CSV != 0 {
            parse_sample_csv(input, ustrs, verbose)?
        } else if attr & FILE_SAMPLE_V0_JSON != 0 {
            parse_sample_v0_json(input, ustrs, verbose)?
        } else {
            bail!("Not a sample file")
        };
        if let Some(rectify) = self.rectifier {
            rectify(&mut data, self.cfg.as_deref(), ustrs);
        }
        Ok((Payload::Samples(data), soft_errors))
    }

    fn cached_size_of_payload(&self, payload: &Payload) -> i64 {
        let Payload::Samples(data) = payload else {
            return 0;
        };
        let load = data
            .load
            .iter()
            .map(|l| {
                size_of::<LoadDatum>()
                    + match &l.encoded {
                        EncodedLoadData::Base45(bs) => bs.len(),
                        EncodedLoadData::Values(vs) => vs.len() * size_of::<u64>(),
                    }
            })
            .sum::<usize>();
        let gpu = data
            .gpu
            .iter()
            .map(|g| {
                size_of::<GpuDatum>()
                    + match &g.encoded {
                        EncodedGpuData::Csv(bs) => bs.len(),
                        EncodedGpuData::Values(vs) => vs.len() * size_of::<PerGpuDatum>(),
                    }
            })
            .sum::<usize>();
        (data.samples.len() * size_of::<Sample>() + load + gpu) as i64
    }
}

// Estimated heap footprint of the strings in a node or card record.
const STRING_OVERHEAD: usize = 64;

pub struct SysinfoFileMethods;

impl ReadSyncMethods for SysinfoFileMethods {
    fn is_cacheable(&self) -> bool {
        true
    }

    fn read_data_locked(
        &self,
        attr: FileAttr,
        input: &mut dyn io::Read,
        _ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Payload, usize)> {
        let (data, soft_errors) = if attr & FILE_SYSINFO_OLD_JSON != 0 {
            parse_sysinfo_old_json(input, verbose)?
        } else if attr & FILE_SYSINFO_V0_JSON != 0 {
            parse_sysinfo_v0_json(input, verbose)?
        } else {
            bail!("Not a sysinfo file")
        };
        Ok((Payload::Sysinfo(data), soft_errors))
    }

    fn cached_size_of_payload(&self, payload: &Payload) -> i64 {
        let Payload::Sysinfo(data) = payload else {
            return 0;
        };
        let nodes = data
            .nodes
            .iter()
            .map(|n| size_of::<SysinfoNodeData>() + n.topo_svg.len() + n.topo_text.len())
            .sum::<usize>();
        let cards = data.cards.len() * (size_of::<SysinfoCardData>() + 8 * STRING_OVERHEAD);
        (nodes + cards) as i64
    }
}

pub struct SacctFileMethods;

impl ReadSyncMethods for SacctFileMethods {
    fn is_cacheable(&self) -> bool {
        true
    }

    fn read_data_locked(
        &self,
        attr: FileAttr,
        input: &mut dyn io::Read,
        ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Payload, usize)> {
        let (data, soft_errors) = if attr & FILE_SLURM_CSV != 0 {
            parse_sacct_csv(input, ustrs, verbose)?
        } else if attr & FILE_SLURM_V0_JSON != 0 {
            parse_sacct_v0_json(input, ustrs, verbose)?
        } else {
            bail!("Not a sacct file")
        };
        Ok((Payload::Sacct(data), soft_errors))
    }

    fn cached_size_of_payload(&self, payload: &Payload) -> i64 {
        match payload {
            Payload::Sacct(xs) => (xs.len() * size_of::<SacctInfo>()) as i64,
            _ => 0,
        }
    }
}

pub struct CluzterFileMethods;

impl ReadSyncMethods for CluzterFileMethods {
    fn is_cacheable(&self) -> bool {
        true
    }

    fn read_data_locked(
        &self,
        attr: FileAttr,
        input: &mut dyn io::Read,
        _ustrs: &mut dyn UstrAllocator,
        verbose: bool,
    ) -> Result<(Payload, usize)> {
        if attr & FILE_CLUZTER_V0_JSON == 0 {
            bail!("Not a cluster file")
        }
        let (data, soft_errors) = parse_cluzter_v0_json(input, verbose)?;
        Ok((Payload::Cluzter(data), soft_errors))
    }

    fn cached_size_of_payload(&self, payload: &Payload) -> i64 {
        let Payload::Cluzter(data) = payload else {
            return 0;
        };
        let partitions = data
            .partitions
            .iter()
            .map(|p| p.partitions.len() * STRING_OVERHEAD * 4)
            .sum::<usize>();
        let nodes = data
            .nodes
            .iter()
            .map(|n| n.nodes.len() * STRING_OVERHEAD * 4)
            .sum::<usize>();
        (data.attributes.len() * size_of::<CluzterAttributes>() + partitions + nodes) as i64
    }
}

// Selectors for `Records`.  A selector applied to a payload of the wrong kind yields no records.

pub fn select_samples(p: &Payload) -> &[Sample] {
    match p {
        Payload::Samples(d) => &d.samples,
        _ => &[],
    }
}

pub fn select_load_data(p: &Payload) -> &[LoadDatum] {
    match p {
        Payload::Samples(d) => &d.load,
        _ => &[],
    }
}

pub fn select_gpu_data(p: &Payload) -> &[GpuDatum] {
    match p {
        Payload::Samples(d) => &d.gpu,
        _ => &[],
    }
}

pub fn select_sysinfo_nodes(p: &Payload) -> &[SysinfoNodeData] {
    match p {
        Payload::Sysinfo(d) => &d.nodes,
        _ => &[],
    }
}

pub fn select_sysinfo_cards(p: &Payload) -> &[SysinfoCardData] {
    match p {
        Payload::Sysinfo(d) => &d.cards,
        _ => &[],
    }
}

pub fn select_sacct(p: &Payload) -> &[SacctInfo] {
    match p {
        Payload::Sacct(xs) => xs,
        _ => &[],
    }
}

pub fn select_cluzter_attributes(p: &Payload) -> &[CluzterAttributes] {
    match p {
        Payload::Cluzter(d) => &d.attributes,
        _ => &[],
    }
}

pub fn select_cluzter_partitions(p: &Payload) -> &[CluzterPartitions] {
    match p {
        Payload::Cluzter(d) => &d.partitions,
        _ => &[],
    }
}

pub fn select_cluzter_nodes(p: &Payload) -> &[CluzterNodes] {
    match p {
        Payload::Cluzter(d) => &d.nodes,
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::Records;
    use rustutils::UstrCache;
    use std::fs::File;

    #[test]
    fn test_sample_methods_rectify() {
        let mut cfg = ClusterConfig::new("fox.educloud.no");
        cfg.description = "Fox".to_string();
        let methods = SampleFileMethods::new(Some(Arc::new(cfg)));
        let mut f = File::open("../tests/sonarlog/whitebox-intermingled.csv").unwrap();
        let mut ustrs = UstrCache::new();
        let (payload, soft_errors) = methods
            .read_data_locked(FILE_SAMPLE_CSV, &mut f, &mut ustrs, false)
            .unwrap();
        assert!(soft_errors == 4);
        assert!(methods.cached_size_of_payload(&payload) >= 5 * size_of::<Sample>() as i64);
        let samples = Records::new(Arc::new(payload), select_samples);
        assert!(samples.len() == 5);
        assert!(samples.iter().all(|s| s.cluster.as_str() == "fox.educloud.no"));
    }

    #[test]
    fn test_sample_methods_no_rectify() {
        let methods = SampleFileMethods::with_rectifier(
            Some(Arc::new(ClusterConfig::new("fox"))),
            None,
        );
        let mut f = File::open("../tests/sonarlog/whitebox-intermingled.csv").unwrap();
        let (payload, _) = methods
            .read_data_locked(FILE_SAMPLE_CSV, &mut f, &mut UstrCache::new(), false)
            .unwrap();
        let payload = Arc::new(payload);
        assert!(Records::new(payload.clone(), select_samples)
            .iter()
            .all(|s| s.cluster.is_empty()));
        // Wrong selector gives nothing
        assert!(Records::new(payload, select_sacct).is_empty());
    }

    #[test]
    fn test_wrong_kind() {
        let mut input: &[u8] = b"";
        let mut ustrs = UstrCache::new();
        assert!(SacctFileMethods
            .read_data_locked(FILE_SAMPLE_CSV, &mut input, &mut ustrs, false)
            .is_err());
        assert!(CluzterFileMethods
            .read_data_locked(FILE_SLURM_CSV, &mut input, &mut ustrs, false)
            .is_err());
    }
}
