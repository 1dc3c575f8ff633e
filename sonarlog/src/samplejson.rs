/// Parser for the JSON form of Sonar `sample` data (`0+sample-<host>.json`).
///
/// Each envelope holds one sampling instant for one host: the per-CPU load, the per-card GPU state,
/// and the jobs on the node with their processes.  Every process becomes a `Sample`, the load and
/// the card state become a `LoadDatum` and a `GpuDatum`.  An instant with no processes at all
/// becomes a heartbeat, as that is what the CSV producer would have sent.
///
/// The newer producer does not send the installed memory with the sample, so `memtotal_kib` is
/// zero; `cores` is the number of CPUs for which there is a load value.
use crate::sample::{
    EncodedGpuData, EncodedLoadData, GpuDatum, LoadDatum, PerGpuDatum, Sample, FLAG_HEARTBEAT,
    GPU_HAS_COMPUTE_MODE, GPU_HAS_FAILING, GPU_HAS_UTIL, GPU_HAS_UUID,
};
use crate::samplecsv::SampleData;

use anyhow::Result;
use rustutils::{parse_rfc3339, GpuSet, UstrAllocator};
use serde::Deserialize;
use std::io;

const MAX_GPU_INDEX: u64 = 30;

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleEnvelope {
    meta: Meta,
    data: Option<SampleEnvelopeData>,
    errors: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Meta {
    version: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleEnvelopeData {
    attributes: SampleAttributes,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleAttributes {
    time: String,
    cluster: String,
    node: String,
    system: SampleSystem,
    jobs: Vec<SampleJob>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleSystem {
    cpus: Vec<u64>,
    gpus: Vec<SampleGpu>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleGpu {
    index: u64,
    uuid: String,
    failing: u64,
    fan: u64,
    compute_mode: String,
    performance_state: i64,
    memory: u64,
    ce_util: u64,
    memory_util: u64,
    temperature: i64,
    power: u64,
    power_limit: u64,
    ce_clock: u64,
    memory_clock: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleJob {
    job: u64,
    user: String,
    processes: Vec<SampleProcess>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleProcess {
    resident_memory: u64,
    virtual_memory: u64,
    cmd: String,
    pid: u64,
    ppid: u64,
    cpu_avg: f64,
    cpu_time: u64,
    rolledup: u64,
    gpus: Vec<SampleProcessGpu>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SampleProcessGpu {
    index: u64,
    gpu_util: f64,
    gpu_memory: u64,
    gpu_memory_util: f64,
}

pub fn parse_sample_v0_json(
    input: &mut dyn io::Read,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(SampleData, usize)> {
    let mut data = SampleData {
        samples: vec![],
        load: vec![],
        gpu: vec![],
    };
    let mut soft_errors = 0usize;
    for r in serde_json::Deserializer::from_reader(input).into_iter::<SampleEnvelope>() {
        let r = match r {
            Ok(r) => r,
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => {
                if verbose {
                    log::warn!("Abandoning sample data with bad JSON: {e}");
                }
                soft_errors += 1;
                break;
            }
        };
        let (Some(envelope_data), None) = (r.data, &r.errors) else {
            soft_errors += 1;
            continue;
        };
        let attrs = envelope_data.attributes;
        let Ok(timestamp) = parse_rfc3339(attrs.time.as_bytes()) else {
            if verbose {
                log::warn!("Dropping sample data with bad timestamp: {}", attrs.time);
            }
            soft_errors += 1;
            continue;
        };
        let version = ustrs.alloc(&r.meta.version);
        let cluster = ustrs.alloc(&attrs.cluster);
        let hostname = ustrs.alloc(&attrs.node);
        let cores = attrs.system.cpus.len() as u32;

        if !attrs.system.cpus.is_empty() {
            data.load.push(LoadDatum {
                timestamp,
                hostname,
                encoded: EncodedLoadData::Values(attrs.system.cpus.clone()),
            });
        }

        let mut failing = GpuSet::empty();
        if !attrs.system.gpus.is_empty() {
            let cards = attrs
                .system
                .gpus
                .iter()
                .map(|g| {
                    if g.failing != 0 && g.index <= MAX_GPU_INDEX {
                        failing.adjoin(g.index as u32);
                    }
                    PerGpuDatum {
                        attr: GPU_HAS_UUID | GPU_HAS_COMPUTE_MODE | GPU_HAS_UTIL | GPU_HAS_FAILING,
                        index: g.index as u32,
                        uuid: g.uuid.clone(),
                        fan_pct: g.fan,
                        compute_mode: g.compute_mode.clone(),
                        perf_state: g.performance_state,
                        mem_kib: g.memory,
                        ce_util_pct: g.ce_util,
                        mem_util_pct: g.memory_util,
                        temp_c: g.temperature,
                        power_w: g.power,
                        power_limit_w: g.power_limit,
                        ce_clock_mhz: g.ce_clock,
                        mem_clock_mhz: g.memory_clock,
                        failing: g.failing,
                    }
                })
                .collect::<Vec<PerGpuDatum>>();
            data.gpu.push(GpuDatum {
                timestamp,
                hostname,
                encoded: EncodedGpuData::Values(cards),
            });
        }

        let mut any_processes = false;
        for job in &attrs.jobs {
            let user = ustrs.alloc(&job.user);
            for p in &job.processes {
                any_processes = true;
                let mut gpus = GpuSet::empty();
                let mut gpu_pct = 0.0;
                let mut gpumem_pct = 0.0;
                let mut gpu_kib = 0;
                for g in &p.gpus {
                    if g.index <= MAX_GPU_INDEX {
                        gpus.adjoin(g.index as u32);
                    } else {
                        gpus = GpuSet::unknown();
                    }
                    gpu_pct += g.gpu_util;
                    gpumem_pct += g.gpu_memory_util;
                    gpu_kib += g.gpu_memory;
                }
                // The process is on a failing card
                let gpu_fail = (!gpus.is_unknown() && (gpus.bits() & failing.bits()) != 0) as u8;
                data.samples.push(Sample {
                    timestamp,
                    memtotal_kib: 0,
                    cpu_kib: p.virtual_memory,
                    rssanon_kib: p.resident_memory,
                    gpu_kib,
                    cputime_sec: p.cpu_time,
                    version,
                    cluster,
                    hostname,
                    cores,
                    user,
                    job: job.job as u32,
                    pid: p.pid as u32,
                    ppid: p.ppid as u32,
                    cmd: ustrs.alloc(&p.cmd),
                    cpu_pct: p.cpu_avg as f32,
                    gpus,
                    gpu_pct: gpu_pct as f32,
                    gpumem_pct: gpumem_pct as f32,
                    rolledup: p.rolledup as u32,
                    cpu_util_pct: 0.0,
                    gpu_fail,
                    flags: 0,
                });
            }
        }

        if !any_processes {
            data.samples.push(Sample {
                timestamp,
                version,
                cluster,
                hostname,
                cores,
                user: ustrs.alloc("_sonar_"),
                cmd: ustrs.alloc("_heartbeat_"),
                flags: FLAG_HEARTBEAT,
                ..Default::default()
            });
        }
    }
    Ok((data, soft_errors))
}

// This tests:
//  - processes become samples, with the GPU fields summed across the process's cards
//  - the load and card state become side-table data
//  - an instant without processes becomes a heartbeat
//  - error envelopes and bad timestamps are soft errors

#[test]
fn test_parse_sample_json() {
    use rustutils::UstrCache;

    let text = r#"
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sample","attributes":{"time":"2024-06-03T12:00:02+02:00","cluster":"fox","node":"c1-10",
   "system":{"cpus":[10,20,30,40],
             "gpus":[{"index":0,"uuid":"GPU-a","fan":27,"performance_state":8,"memory":1024,"failing":0},
                     {"index":1,"uuid":"GPU-b","fan":28,"performance_state":2,"memory":2048,"failing":1}]},
   "jobs":[{"job":4079,"user":"larsbent","epoch":0,
            "processes":[{"resident_memory":500,"virtual_memory":1000,"cmd":"python","pid":1234,"ppid":1,
                          "cpu_avg":97.5,"cpu_time":3600,"rolledup":2,
                          "gpus":[{"index":0,"gpu_util":50.0,"gpu_memory":1024,"gpu_memory_util":10.0},
                                  {"index":1,"gpu_util":25.0,"gpu_memory":2048,"gpu_memory_util":20.0}]},
                         {"cmd":"bash","pid":1200,"ppid":1,"cpu_avg":0.5}]}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sample","attributes":{"time":"2024-06-03T12:05:02+02:00","cluster":"fox","node":"c1-10",
   "system":{"cpus":[1,2,3,4]},"jobs":[]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"time":"2024-06-03T12:10:02+02:00","detail":"no"}]}
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sample","attributes":{"time":"yesterday","node":"c1-10"}}}
"#;
    let mut bytes = text.as_bytes();
    let (data, soft_errors) = parse_sample_v0_json(&mut bytes, &mut UstrCache::new(), false).unwrap();
    assert!(soft_errors == 2);
    assert!(data.samples.len() == 3);
    assert!(data.load.len() == 2);
    assert!(data.gpu.len() == 1);

    let s = &data.samples[0];
    assert!(s.timestamp == 1717408802);
    assert!(s.version.as_str() == "0.13.0" && s.cluster.as_str() == "fox");
    assert!(s.hostname.as_str() == "c1-10" && s.cores == 4);
    assert!(s.user.as_str() == "larsbent" && s.job == 4079);
    assert!(s.pid == 1234 && s.ppid == 1 && s.cmd.as_str() == "python");
    assert!(s.cpu_pct == 97.5 && s.cputime_sec == 3600);
    assert!(s.cpu_kib == 1000 && s.rssanon_kib == 500);
    assert!(s.gpus.as_vec() == vec![0, 1]);
    assert!(s.gpu_pct == 75.0 && s.gpumem_pct == 30.0 && s.gpu_kib == 3072);
    assert!(s.rolledup == 2);
    assert!(s.gpu_fail == 1);
    assert!(!s.is_heartbeat());

    let s = &data.samples[1];
    assert!(s.cmd.as_str() == "bash" && s.gpus.is_empty() && s.gpu_fail == 0);

    let s = &data.samples[2];
    assert!(s.is_heartbeat() && s.cmd.as_str() == "_heartbeat_" && s.timestamp == 1717409102);

    let EncodedLoadData::Values(ref vs) = data.load[1].encoded else {
        panic!("Expected values")
    };
    assert!(*vs == vec![1, 2, 3, 4]);
    let EncodedGpuData::Values(ref cards) = data.gpu[0].encoded else {
        panic!("Expected values")
    };
    assert!(cards.len() == 2);
    assert!(cards[1].uuid == "GPU-b" && cards[1].fan_pct == 28 && cards[1].perf_state == 2);
    assert!(cards[1].failing == 1 && (cards[1].attr & GPU_HAS_FAILING) != 0);
}
