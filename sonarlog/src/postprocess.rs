/// Postprocess and clean up sample data after ingestion.
///
/// The raw samples from a set of files are bucketed into *sample streams*, one per job artifact.
/// A stream is identified by the triple (hostname, stream-id, command), where the stream-id is
/// defined below.  There are important invariants on a stream after postprocessing:
///
/// - the stream is sorted ascending by timestamp
/// - no two records in the stream have the same timestamp
/// - the stream is not empty
///
/// The stream-id is necessary to distinguish the different event streams for a single job.
/// Consider a run of records from the same host.  There may be multiple records per job in that
/// run, and they may or may not also have the same cmd, and they may or may not have been rolled
/// up.  There are two cases:
///
/// - If the job is not rolled-up then we know that for a given pid there is only ever one record at
///   a given time.
///
/// - If the job is rolled-up then we know that for a given (job, cmd) pair there is only one
///   record, but the job ID by itself is not enough to distinguish records, and there is no obvious
///   distinguishing pid value, as the set of rolled-up processes may change from invocation to
///   invocation of sonar.  We also know a rolled-up record has rolledup > 0.
///
/// Therefore, let the stream-id for a rolled-up record r be JOB_ID_TAG + r.job.  Records for job 0
/// are never rolled up and use the pid, which is unique.
use crate::decode::{decode_gpu_data, decode_load_data};
use crate::filter::CompiledFilter;
use crate::sample::{parse_version, GpuDatum, LoadDatum, PerGpuDatum, Sample};

use rustutils::{ClusterConfig, Ustr};
use std::collections::HashMap;

/// Greater than any Linux pid observed in the wild.

pub const JOB_ID_TAG: u32 = 10_000_000;

/// (hostname, stream-id, command)

pub type InputStreamKey = (Ustr, u32, Ustr);

pub type SampleStream = Vec<Sample>;

pub type InputStreamSet = HashMap<InputStreamKey, SampleStream>;

/// The earliest and latest timestamps seen for a host, across all the raw samples, before
/// filtering.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebound {
    pub earliest: i64,
    pub latest: i64,
}

pub type Timebounds = HashMap<Ustr, Timebound>;

pub fn stream_id(s: &Sample) -> u32 {
    if s.rolledup > 0 {
        JOB_ID_TAG.wrapping_add(s.job)
    } else {
        s.pid
    }
}

/// Reconstruct the sample streams from the samples, compute `cpu_util_pct`, reconcile the GPU
/// memory fields with the host configuration if there is one, and then drop the samples that do not
/// pass the filter or that have a negative `cpu_util_pct` (an artifact of sonar bugs).  Streams that
/// end up empty are removed.
///
/// The order of the samples in the input is immaterial except among samples with the same key and
/// timestamp, where the first is kept.

pub fn postprocess_samples<'a>(
    samples: impl IntoIterator<Item = &'a Sample>,
    filter: Option<&CompiledFilter>,
    cfg: Option<&ClusterConfig>,
) -> (InputStreamSet, Timebounds) {
    let mut streams: InputStreamSet = HashMap::new();
    let mut bounds: Timebounds = HashMap::new();

    for s in samples {
        bounds
            .entry(s.hostname)
            .and_modify(|b| {
                b.earliest = b.earliest.min(s.timestamp);
                b.latest = b.latest.max(s.timestamp);
            })
            .or_insert(Timebound {
                earliest: s.timestamp,
                latest: s.timestamp,
            });
        streams
            .entry((s.hostname, stream_id(s), s.cmd))
            .or_default()
            .push(*s);
    }

    for stream in streams.values_mut() {
        // Stable, so that records from the same file stay in file order.
        stream.sort_by_key(|s| s.timestamp);

        // Duplicates appear when sonar output is delayed by slow disks.  They should be identical.
        stream.dedup_by_key(|s| s.timestamp);

        compute_cpu_util_pct(stream);

        if let Some(cfg) = cfg {
            reconcile_gpu_memory(stream, cfg);
        }

        stream.retain(|s| s.cpu_util_pct >= 0.0 && filter.map_or(true, |f| f.matches(s)));
    }

    streams.retain(|_, stream| !stream.is_empty());

    (streams, bounds)
}

// For v0.7.0 and later, cpu_util_pct is the difference in cputime_sec between adjacent records
// divided by the time difference between them, and the first record gets a copy of cpu_pct.  Older
// producers do not have cputime_sec, so every record gets a copy of cpu_pct.
//
// The stream is sorted, deduplicated and non-empty.
fn compute_cpu_util_pct(stream: &mut [Sample]) {
    stream[0].cpu_util_pct = stream[0].cpu_pct;
    let (major, minor, _) = parse_version(stream[0].version.as_str());
    if major == 0 && minor <= 6 {
        for s in stream[1..].iter_mut() {
            s.cpu_util_pct = s.cpu_pct;
        }
    } else {
        for i in 1..stream.len() {
            let dt = (stream[i].timestamp - stream[i - 1].timestamp) as f64;
            // This can be negative, see https://github.com/NAICNO/Jobanalyzer/issues/63.
            let dc = stream[i].cputime_sec as f64 - stream[i - 1].cputime_sec as f64;
            stream[i].cpu_util_pct = ((dc / dt) * 100.0) as f32;
        }
    }
}

// The producer reports either the memory or the percentage reliably, depending on the card, and the
// host configuration says which.  The other is computed from it.
fn reconcile_gpu_memory(stream: &mut [Sample], cfg: &ClusterConfig) {
    let Some(sys) = cfg.lookup(stream[0].hostname.as_str()) else {
        return;
    };
    if sys.gpu_cards == 0 {
        return;
    }
    let cardsize_kib = sys.gpumem_gb as f64 * 1024.0 * 1024.0 / sys.gpu_cards as f64;
    for s in stream {
        if sys.gpumem_pct {
            s.gpu_kib = (s.gpumem_pct as f64 / 100.0 * cardsize_kib) as u64;
        } else {
            s.gpumem_pct = (s.gpu_kib as f64 / cardsize_kib) as f32;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLoadDatum {
    pub timestamp: i64,
    pub load: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedGpuDatum {
    pub timestamp: i64,
    pub cards: Vec<PerGpuDatum>,
}

pub type LoadDataSet = HashMap<Ustr, Vec<DecodedLoadDatum>>;

pub type GpuDataSet = HashMap<Ustr, Vec<DecodedGpuDatum>>;

/// Decode the load data and bucket them by host, each bucket sorted ascending by time with
/// duplicate times removed.  Returns the buckets, the time bounds per host, and the number of data
/// that could not be decoded.

pub fn rectify_load_data<'a>(
    data: impl IntoIterator<Item = &'a LoadDatum>,
) -> (LoadDataSet, Timebounds, usize) {
    let mut errors = 0;
    let mut streams: LoadDataSet = HashMap::new();
    for d in data {
        match decode_load_data(&d.encoded) {
            Ok(load) => streams.entry(d.hostname).or_default().push(DecodedLoadDatum {
                timestamp: d.timestamp,
                load,
            }),
            Err(_) => errors += 1,
        }
    }
    let bounds = sort_and_dedup(&mut streams, |d| d.timestamp);
    (streams, bounds, errors)
}

/// Like `rectify_load_data`, for the per-card GPU data.  Old-style data decode leniently, so there
/// are never any errors.

pub fn rectify_gpu_data<'a>(
    data: impl IntoIterator<Item = &'a GpuDatum>,
) -> (GpuDataSet, Timebounds) {
    let mut streams: GpuDataSet = HashMap::new();
    for d in data {
        streams.entry(d.hostname).or_default().push(DecodedGpuDatum {
            timestamp: d.timestamp,
            cards: decode_gpu_data(&d.encoded),
        });
    }
    let bounds = sort_and_dedup(&mut streams, |d| d.timestamp);
    (streams, bounds)
}

fn sort_and_dedup<T>(streams: &mut HashMap<Ustr, Vec<T>>, time: fn(&T) -> i64) -> Timebounds {
    let mut bounds = HashMap::new();
    for (host, v) in streams.iter_mut() {
        v.sort_by_key(time);
        v.dedup_by_key(|d| time(d));
        // Never empty by construction.
        bounds.insert(
            *host,
            Timebound {
                earliest: time(&v[0]),
                latest: time(&v[v.len() - 1]),
            },
        );
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SampleFilter;
    use crate::sample::{EncodedGpuData, EncodedLoadData};
    use rustutils::{intern, System};

    fn sample(host: &str, pid: u32, cmd: &str, t: i64, cputime_sec: u64) -> Sample {
        Sample {
            timestamp: t,
            hostname: intern(host),
            version: intern("0.11.0"),
            user: intern("alice"),
            job: 9,
            pid,
            cmd: intern(cmd),
            cpu_pct: 25.0,
            cputime_sec,
            ..Default::default()
        }
    }

    // This tests:
    //  - samples for the same key go in one stream, ordered by time
    //  - cpu_util_pct is derived from cputime_sec for new producers
    //  - the first sample copies cpu_pct

    #[test]
    fn test_cpu_util_pct() {
        let samples = vec![
            sample("a", 10, "python", 600, 550),
            sample("a", 10, "python", 0, 100),
            sample("a", 10, "python", 300, 400),
        ];
        let (streams, bounds) = postprocess_samples(&samples, None, None);
        assert!(streams.len() == 1);
        let s = &streams[&(intern("a"), 10, intern("python"))];
        assert!(s.len() == 3);
        assert!(s[0].cpu_util_pct == 25.0);
        assert!(s[1].cpu_util_pct == 100.0);
        assert!(s[2].cpu_util_pct == 50.0);
        assert!(bounds[&intern("a")] == Timebound { earliest: 0, latest: 600 });
    }

    #[test]
    fn test_old_producer_cpu_util_pct() {
        let mut samples = vec![sample("a", 10, "python", 0, 0), sample("a", 10, "python", 300, 0)];
        for s in samples.iter_mut() {
            s.version = intern("0.6.0");
        }
        samples[1].cpu_pct = 80.0;
        let (streams, _) = postprocess_samples(&samples, None, None);
        let s = &streams[&(intern("a"), 10, intern("python"))];
        assert!(s[0].cpu_util_pct == 25.0 && s[1].cpu_util_pct == 80.0);
    }

    // This tests:
    //  - duplicate timestamps are elided
    //  - rolled-up samples are keyed by job
    //  - different hosts and commands give different streams

    #[test]
    fn test_stream_reconstruction() {
        let mut rolled = sample("a", 0, "python", 100, 10);
        rolled.rolledup = 3;
        let samples = vec![
            sample("a", 10, "python", 0, 100),
            sample("a", 10, "python", 300, 400),
            sample("a", 10, "python", 300, 400),
            sample("b", 10, "python", 0, 100),
            sample("a", 10, "bash", 0, 100),
            rolled,
        ];
        let (streams, bounds) = postprocess_samples(&samples, None, None);
        assert!(streams.len() == 4);
        assert!(streams[&(intern("a"), 10, intern("python"))].len() == 2);
        assert!(streams.contains_key(&(intern("a"), JOB_ID_TAG + 9, intern("python"))));
        for stream in streams.values() {
            assert!(stream.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            assert!(stream.iter().all(|s| s.cpu_util_pct >= 0.0));
        }
        assert!(bounds.len() == 2);
    }

    // This tests:
    //  - negative cpu_util_pct samples are dropped
    //  - filtered samples are dropped after cpu_util_pct is computed
    //  - empty streams are removed but still count toward the bounds

    #[test]
    fn test_filtering() {
        let samples = vec![
            sample("a", 10, "python", 0, 100),
            sample("a", 10, "python", 300, 50),
            sample("a", 10, "python", 600, 350),
            sample("b", 20, "bash", 0, 100),
        ];
        let mut f = SampleFilter::new();
        f.exclude_commands.insert(intern("bash"));
        let f = f.compile();
        let (streams, bounds) = postprocess_samples(&samples, Some(&f), None);
        assert!(streams.len() == 1);
        let s = &streams[&(intern("a"), 10, intern("python"))];
        assert!(s.len() == 2);
        assert!(s[1].timestamp == 600 && s[1].cpu_util_pct == 100.0);
        assert!(bounds.contains_key(&intern("b")));
    }

    #[test]
    fn test_gpu_memory_reconciliation() {
        let mut cfg = ClusterConfig::new("x");
        cfg.insert(System {
            hostname: "pct".to_string(),
            gpu_cards: 2,
            gpumem_gb: 20,
            gpumem_pct: true,
            ..Default::default()
        });
        cfg.insert(System {
            hostname: "kib".to_string(),
            gpu_cards: 2,
            gpumem_gb: 20,
            gpumem_pct: false,
            ..Default::default()
        });
        let mut s1 = sample("pct", 10, "python", 0, 0);
        s1.gpumem_pct = 50.0;
        let mut s2 = sample("kib", 10, "python", 0, 0);
        s2.gpu_kib = 5 * 1024 * 1024;
        let (streams, _) = postprocess_samples(&[s1, s2], None, Some(&cfg));
        let p = &streams[&(intern("pct"), 10, intern("python"))][0];
        assert!(p.gpu_kib == 5 * 1024 * 1024);
        let k = &streams[&(intern("kib"), 10, intern("python"))][0];
        assert!(k.gpumem_pct == 0.5);
    }

    #[test]
    fn test_rectify_side_tables() {
        let load = |t: i64, host: &str, v: Vec<u64>| LoadDatum {
            timestamp: t,
            hostname: intern(host),
            encoded: EncodedLoadData::Values(v),
        };
        let data = vec![
            load(200, "a", vec![1, 2]),
            load(100, "a", vec![3, 4]),
            load(200, "a", vec![1, 2]),
            load(100, "b", vec![]),
            load(150, "b", vec![5]),
            LoadDatum {
                timestamp: 300,
                hostname: intern("a"),
                encoded: EncodedLoadData::Base45(b"0".to_vec()),
            },
        ];
        let (streams, bounds, errors) = rectify_load_data(&data);
        assert!(errors == 1);
        let a = &streams[&intern("a")];
        assert!(a.len() == 2 && a[0].timestamp == 100 && a[0].load == vec![3, 4]);
        assert!(bounds[&intern("a")] == Timebound { earliest: 100, latest: 200 });
        assert!(streams[&intern("b")].last().unwrap().load == vec![5]);

        let gpu = vec![
            GpuDatum {
                timestamp: 20,
                hostname: intern("a"),
                encoded: EncodedGpuData::Values(vec![PerGpuDatum::default()]),
            },
            GpuDatum {
                timestamp: 10,
                hostname: intern("a"),
                encoded: EncodedGpuData::Values(vec![]),
            },
        ];
        let (streams, bounds) = rectify_gpu_data(&gpu);
        let a = &streams[&intern("a")];
        assert!(a[0].timestamp == 10 && a[1].cards.len() == 1);
        assert!(bounds[&intern("a")].latest == 20);
    }
}
