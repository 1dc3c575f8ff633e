/// Helpers for merging sample streams.
use crate::postprocess::{InputStreamSet, SampleStream, Timebound, Timebounds};
use crate::sample::Sample;

use rustutils::{compress_hostnames, intern, GpuSet, Ustr};
use std::collections::{BTreeSet, HashMap};

/// A bag of merged streams.  The constraints on the individual streams in terms of uniqueness and
/// so on depends on how they were merged and are not implied by the type.

pub type MergedSampleStreams = Vec<SampleStream>;

const MERGED: &str = "_merged_";

// The sliding window, in seconds: records within WINDOW after the earliest record are taken to be
// simultaneous, and the last record of an exhausted stream stays in effect for less than DEEP_PAST
// seconds.
const WINDOW: i64 = 10;
const DEEP_PAST: i64 = 60;

/// Merge streams that have the same host and job ID into synthesized data.
///
/// Each output stream is sorted ascending by timestamp.  No two records have exactly the same time.
/// All records within a stream have the same host, command, user, and job ID.
///
/// The command name for synthesized data collects all the commands that went into the synthesized
/// stream, and similarly the user name.  Streams for job ID 0 can't be merged and are passed on
/// unchanged.

pub fn merge_by_host_and_job(streams: InputStreamSet) -> MergedSampleStreams {
    // The value is the set of command names, the set of user names, and the individual streams.
    let mut collections: HashMap<(Ustr, u32), (BTreeSet<Ustr>, BTreeSet<Ustr>, Vec<SampleStream>)> =
        HashMap::new();

    let mut vs: MergedSampleStreams = vec![];
    for ((host, _, cmd), v) in streams {
        let job = v[0].job;
        if job == 0 {
            vs.push(v);
            continue;
        }
        let (cmds, users, ss) = collections.entry((host, job)).or_default();
        cmds.insert(cmd);
        users.insert(v[0].user);
        ss.push(v);
    }

    for ((hostname, job), (cmds, users, streams)) in collections {
        vs.push(merge_streams(hostname, ustr_join(&cmds), ustr_join(&users), job, streams));
    }

    vs
}

/// Merge streams that have the same job ID (across hosts) into synthesized data.
///
/// Each output stream is sorted ascending by timestamp.  No two records have exactly the same time.
/// All records within an output stream have the same host name, job ID, command name, and user.
///
/// The host name for synthesized data is the compressed list of the hosts that went into the
/// synthesized stream.
///
/// This must also merge the metadata from the different hosts: the time bounds.  For a merged
/// stream, the "earliest" time is the min across the earliest times for the different host streams
/// that go into the merged stream, and the "latest" time is the max across the latest times ditto.

pub fn merge_by_job(
    streams: InputStreamSet,
    bounds: &Timebounds,
) -> (MergedSampleStreams, Timebounds) {
    // The value is the set of command names, user names, host names, and the individual streams.
    let mut collections: HashMap<
        u32,
        (BTreeSet<Ustr>, BTreeSet<Ustr>, BTreeSet<Ustr>, Vec<SampleStream>),
    > = HashMap::new();

    let mut vs: MergedSampleStreams = vec![];
    let mut new_bounds = HashMap::new();
    for ((host, _, cmd), v) in streams {
        let job = v[0].job;
        if job == 0 {
            if let Some(b) = bounds.get(&host) {
                new_bounds.insert(host, *b);
            }
            vs.push(v);
            continue;
        }
        let (cmds, users, hosts, ss) = collections.entry(job).or_default();
        cmds.insert(cmd);
        users.insert(v[0].user);
        hosts.insert(host);
        ss.push(v);
    }

    for (job, (cmds, users, hosts, streams)) in collections {
        let hosts = hosts.into_iter().collect::<Vec<Ustr>>();
        let hostname = intern(&compress_hostnames(&hosts).join(","));
        let merged = hosts
            .iter()
            .filter_map(|h| bounds.get(h))
            .fold(None, |acc: Option<Timebound>, b| {
                Some(match acc {
                    None => *b,
                    Some(a) => Timebound {
                        earliest: a.earliest.min(b.earliest),
                        latest: a.latest.max(b.latest),
                    },
                })
            });
        if let Some(merged) = merged {
            new_bounds
                .entry(hostname)
                .and_modify(|b: &mut Timebound| {
                    b.earliest = b.earliest.min(merged.earliest);
                    b.latest = b.latest.max(merged.latest);
                })
                .or_insert(merged);
        }
        vs.push(merge_streams(hostname, ustr_join(&cmds), ustr_join(&users), job, streams));
    }

    (vs, new_bounds)
}

/// Merge streams that have the same host (across jobs) into synthesized data.
///
/// The command name and user name for synthesized data are "_merged_".  The job ID for synthesized
/// data is 0, which is not ideal but probably OK so long as the consumer knows it.

pub fn merge_by_host(streams: InputStreamSet) -> MergedSampleStreams {
    let mut collections: HashMap<Ustr, Vec<SampleStream>> = HashMap::new();

    // This lumps jobs with job ID 0 in with the others.
    for ((host, _, _), v) in streams {
        collections.entry(host).or_default().push(v);
    }

    let merged = intern(MERGED);
    collections
        .into_iter()
        .map(|(hostname, streams)| merge_streams(hostname, merged, merged, 0, streams))
        .collect::<MergedSampleStreams>()
}

/// Given a set of already-merged streams, where each stream pertains to one host and all hosts are
/// different, merge by timeslot to create cross-host cross-job data.

pub fn merge_across_hosts_by_time(streams: MergedSampleStreams) -> MergedSampleStreams {
    let streams = streams.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>();
    if streams.is_empty() {
        return vec![];
    }
    let hostname = intern(
        &compress_hostnames(&streams.iter().map(|s| s[0].hostname).collect::<Vec<Ustr>>())
            .join(","),
    );
    let merged = intern(MERGED);
    vec![merge_streams(hostname, merged, merged, 0, streams)]
}

// What does it mean to sample a job that runs on multiple hosts, or to sample a host that runs
// multiple jobs concurrently?
//
// Consider peak CPU utilization.  The single-host interpretation of this is the highest valued
// sample for CPU utilization across the run (sample stream).  For cross-host jobs we want the
// highest valued sum-of-samples (for samples taken at the same time) for CPU utilization across the
// run.  However, in general samples will not have been taken on different hosts at the same time so
// this is not completely trivial.
//
// Consider all sample streams from all hosts in the job in parallel, here "+" denotes a sample and
// "-" denotes time just passing, we have three cores C1 C2 C3, and each character is one time tick:
//
//   t= 01234567890123456789
//   C1 --+---+---
//   C2 -+----+---
//   C3 ---+----+-
//
// At t=1, we get a reading for C2.  This value is now in effect until t=6 when we have a new
// sample for C2.  For C1, we have readings at t=2 and t=6.  We wish to "reconstruct" a CPU
// utilization sample across C1, C2, and C3.  An obvious way to do it is to create samples at t=1,
// t=2, t=3, t=6, t=8.  The values that we create for the sample at eg t=3 are the values in effect
// for C1 and C2 from earlier and the new value for C3 at t=3.  The total CPU utilization at that
// time is the sum of the three values, and that goes into computing the peak.
//
// In practice sonar is run by cron, and runs on different hosts are well correlated, so records
// cluster around points in time.  We capture a cluster by taking all records within WINDOW seconds
// after the earliest next record to have that record's time.
//
// merge_streams() takes a set of streams for an individual job (along with names for the host, the
// command, the user, and the job) and returns a single, merged stream for the job, where the
// synthesized records for a single job all have the following artifacts.  Let R be the records that
// went into synthesizing a single record.  Then:
//
//   - version is "0.0.0"
//   - hostname, cmd, user, and job are as given to the function
//   - timestamp is the earliest time in the window
//   - cores, memtotal_kib, pid and ppid are 0
//   - the CPU, memory and GPU quantities are the sums across R
//   - gpus is the union of the gpus across R
//   - gpu_fail is 1 if any record in R has a failure
//   - rolledup is the number of processes in R less one
//
// Invariants of the input that are used:
//
// - streams are never empty
// - streams are sorted by ascending timestamp
// - in no stream are there two adjacent records with the same timestamp

pub fn merge_streams(
    hostname: Ustr,
    cmd: Ustr,
    user: Ustr,
    job: u32,
    streams: Vec<SampleStream>,
) -> SampleStream {
    let version = intern("0.0.0");
    let mut records = vec![];

    // indices[i] has the index of the next element of streams[i]
    let mut indices = vec![0usize; streams.len()];

    // Streams that have moved into the past have their indices[i] value set to STREAM_ENDED.
    const STREAM_ENDED: usize = usize::MAX;

    // selected holds the records selected by the second inner loop, we allocate it once.
    let mut selected: Vec<&Sample> = Vec::with_capacity(streams.len());

    // The following loop nest is O(t^2) and performance-sensitive: the number of streams grows with
    // the length of the time window, and the outer loop makes one iteration per time step.  Expired
    // streams are skipped quickly, and `live` is the first stream that is definitely not expired.
    let mut live = 0;

    let sentinel_time = i64::MAX;
    loop {
        while live < streams.len() && indices[live] == STREAM_ENDED {
            live += 1;
        }

        // Loop across streams to find smallest head.
        let mut min_time = sentinel_time;
        for i in live..streams.len() {
            if indices[i] >= streams[i].len() {
                continue;
            }
            min_time = min_time.min(streams[i][indices[i]].timestamp);
        }

        // Exit if no values in any stream
        if min_time == sentinel_time {
            break;
        }

        let lim_time = min_time + WINDOW;
        let deep_past = min_time - DEEP_PAST;

        // Now select values from all streams (either a value in the time window or the most recent
        // value before the time window) and advance the stream pointers for the ones in the window.
        for i in live..streams.len() {
            let s = &streams[i];
            let ix = indices[i];
            let lim = s.len();

            if ix < lim {
                if s[ix].timestamp >= lim_time {
                    // The stream starts in the future.
                    continue;
                }

                if s[ix].timestamp >= min_time {
                    // In the window.
                    selected.push(&s[ix]);
                    indices[i] += 1;
                    continue;
                }

                // Head in the past.  The guard on the time is necessary to avoid picking up records
                // from a lot of dead processes.
                if ix > 0 && s[ix - 1].timestamp > deep_past {
                    selected.push(&s[ix - 1]);
                    continue;
                }

                // This is an old record and we can ignore it.
            } else if ix == STREAM_ENDED {
                continue;
            } else {
                // ix == lim > 0: exhausted but maybe residually live.

                if s[ix - 1].timestamp <= deep_past {
                    indices[i] = STREAM_ENDED;
                    continue;
                }

                if s[ix - 1].timestamp < min_time {
                    selected.push(&s[ix - 1]);
                }
            }
        }

        records.push(sum_records(version, min_time, hostname, user, job, cmd, &selected));
        selected.clear();
    }

    records
}

fn sum_records(
    version: Ustr,
    timestamp: i64,
    hostname: Ustr,
    user: Ustr,
    job: u32,
    cmd: Ustr,
    selected: &[&Sample],
) -> Sample {
    let mut r = Sample {
        timestamp,
        version,
        hostname,
        user,
        job,
        cmd,
        cluster: selected.first().map(|s| s.cluster).unwrap_or_default(),
        gpus: GpuSet::empty(),
        ..Default::default()
    };
    let mut processes = 0u32;
    for s in selected {
        r.cpu_kib += s.cpu_kib;
        r.rssanon_kib += s.rssanon_kib;
        r.gpu_kib += s.gpu_kib;
        r.cputime_sec += s.cputime_sec;
        r.cpu_pct += s.cpu_pct;
        r.gpu_pct += s.gpu_pct;
        r.gpumem_pct += s.gpumem_pct;
        r.cpu_util_pct += s.cpu_util_pct;
        r.gpus = r.gpus.union(s.gpus);
        if s.gpu_fail != 0 {
            r.gpu_fail = 1;
        }
        // rolledup counts the *other* processes, so each record stands for rolledup+1.  Computing
        // sum(rolledup) - (count+1) directly can wrap in u32, this form saturates at zero instead.
        processes = processes.saturating_add(s.rolledup.saturating_add(1));
    }
    r.rolledup = processes.saturating_sub(1);
    r
}

pub fn fold_samples_half_hourly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_half_hour)
}

pub fn fold_samples_hourly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_hour)
}

pub fn fold_samples_half_daily(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_half_day)
}

pub fn fold_samples_daily(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_day)
}

pub fn fold_samples_weekly(samples: &[Sample]) -> SampleStream {
    fold_samples(samples, rustutils::truncate_to_week)
}

// Bucket consecutive samples by truncated time and average each bucket.
fn fold_samples(samples: &[Sample], get_time: fn(i64) -> i64) -> SampleStream {
    let version = intern("0.0.0");
    let merged = intern(MERGED);
    samples
        .chunk_by(|a, b| get_time(a.timestamp) == get_time(b.timestamp))
        .map(|bucket| {
            let t0 = get_time(bucket[0].timestamp);
            let refs = bucket.iter().collect::<Vec<&Sample>>();
            let mut r = sum_records(version, t0, bucket[0].hostname, merged, 0, merged, &refs);
            let n = bucket.len();
            r.cpu_kib /= n as u64;
            r.rssanon_kib /= n as u64;
            r.gpu_kib /= n as u64;
            r.cputime_sec /= n as u64;
            r.cpu_pct /= n as f32;
            r.gpu_pct /= n as f32;
            r.gpumem_pct /= n as f32;
            r.cpu_util_pct /= n as f32;
            r
        })
        .collect::<SampleStream>()
}

fn ustr_join(ss: &BTreeSet<Ustr>) -> Ustr {
    intern(&ss.iter().map(|s| s.as_str()).collect::<Vec<&str>>().join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::postprocess_samples;

    fn sample(host: &str, job: u32, pid: u32, cmd: &str, t: i64, cpu_pct: f32) -> Sample {
        Sample {
            timestamp: t,
            hostname: intern(host),
            version: intern("0.11.0"),
            user: intern("alice"),
            job,
            pid,
            cmd: intern(cmd),
            cpu_pct,
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_window() {
        let streams = vec![
            vec![sample("a", 1, 10, "x", 1000, 10.0)],
            vec![sample("a", 1, 11, "y", 1005, 20.0)],
        ];
        let r = merge_streams(intern("a"), intern("x,y"), intern("alice"), 1, streams);
        assert!(r.len() == 1);
        assert!(r[0].timestamp == 1000);
        assert!(r[0].cpu_pct == 30.0);
        assert!(r[0].rolledup == 1);
        assert!(r[0].version.as_str() == "0.0.0");
        assert!(r[0].pid == 0 && r[0].cores == 0);
    }

    // This tests:
    //  - an exhausted stream contributes its last record for up to a minute
    //  - then it is retired and contributes nothing

    #[test]
    fn test_merge_retirement() {
        let short = vec![sample("a", 1, 10, "x", 100, 1.0), sample("a", 1, 10, "x", 200, 1.0)];
        let long = [100, 220, 250, 259, 260, 300]
            .iter()
            .map(|t| sample("a", 1, 11, "x", *t, 2.0))
            .collect::<Vec<Sample>>();
        let r = merge_streams(intern("a"), intern("x"), intern("alice"), 1, vec![short, long]);
        let at = |t: i64| r.iter().find(|s| s.timestamp == t).unwrap().cpu_pct;
        assert!(r.len() == 7);
        assert!(at(100) == 3.0);
        assert!(at(200) == 1.0);
        assert!(at(220) == 3.0);
        assert!(at(259) == 3.0);
        assert!(at(260) == 2.0);
        assert!(at(300) == 2.0);
    }

    #[test]
    fn test_merge_gpus_and_failures() {
        let mut s1 = sample("a", 1, 10, "x", 100, 1.0);
        s1.gpus = GpuSet::singleton(0);
        s1.rolledup = 2;
        let mut s2 = sample("a", 1, 11, "x", 100, 1.0);
        s2.gpus = GpuSet::singleton(3);
        s2.gpu_fail = 7;
        let r = merge_streams(intern("a"), intern("x"), intern("alice"), 1, vec![vec![s1], vec![s2]]);
        assert!(r[0].gpus.as_vec() == vec![0, 3]);
        assert!(r[0].gpu_fail == 1);
        assert!(r[0].rolledup == 3);
    }

    // This tests:
    //  - streams for the same job on different hosts are merged
    //  - the host name is compressed
    //  - the bounds are merged for the new host name
    //  - job 0 passes through

    #[test]
    fn test_merge_by_job() {
        let samples = vec![
            sample("h1", 9, 10, "py", 100, 1.0),
            sample("h1", 9, 10, "py", 200, 1.0),
            sample("h2", 9, 20, "py", 105, 2.0),
            sample("h2", 9, 20, "py", 195, 2.0),
            sample("h2", 0, 30, "sh", 150, 4.0),
        ];
        let (streams, mut bounds) = postprocess_samples(&samples, None, None);
        assert!(bounds[&intern("h1")] == Timebound { earliest: 100, latest: 200 });
        assert!(bounds[&intern("h2")] == Timebound { earliest: 105, latest: 195 });
        bounds.insert(intern("h2"), Timebound { earliest: 120, latest: 180 });
        let (merged, new_bounds) = merge_by_job(streams, &bounds);
        assert!(merged.len() == 2);
        let job = merged.iter().find(|s| s[0].job == 9).unwrap();
        assert!(job.len() == 2);
        assert!(job[0].hostname.as_str() == "h[1-2]");
        assert!(job[0].cmd.as_str() == "py");
        assert!(job[0].timestamp == 100 && job[0].cpu_pct == 3.0);
        assert!(job[1].timestamp == 195 && job[1].cpu_pct == 3.0);
        assert!(new_bounds[&intern("h[1-2]")] == Timebound { earliest: 100, latest: 200 });
        assert!(new_bounds.contains_key(&intern("h2")));
    }

    #[test]
    fn test_merge_by_host_and_job() {
        let samples = vec![
            sample("h1", 9, 10, "py", 100, 1.0),
            sample("h1", 9, 11, "sh", 100, 2.0),
            sample("h2", 9, 20, "py", 100, 4.0),
            sample("h1", 0, 30, "init", 100, 8.0),
        ];
        let (streams, _) = postprocess_samples(&samples, None, None);
        let merged = merge_by_host_and_job(streams);
        assert!(merged.len() == 3);
        let h1 = merged
            .iter()
            .find(|s| s[0].hostname.as_str() == "h1" && s[0].job == 9)
            .unwrap();
        assert!(h1[0].cmd.as_str() == "py,sh" && h1[0].cpu_pct == 3.0);
        assert!(h1[0].user.as_str() == "alice");
        assert!(merged.iter().any(|s| s[0].job == 0 && s[0].pid == 30));
    }

    #[test]
    fn test_merge_by_host() {
        let samples = vec![
            sample("h1", 9, 10, "py", 100, 1.0),
            sample("h1", 0, 11, "sh", 100, 2.0),
            sample("h2", 9, 20, "py", 100, 4.0),
        ];
        let (streams, _) = postprocess_samples(&samples, None, None);
        let mut merged = merge_by_host(streams);
        assert!(merged.len() == 2);
        merged.sort_by_key(|s| s[0].hostname);
        assert!(merged[0][0].cpu_pct == 3.0 && merged[0][0].job == 0);
        assert!(merged[0][0].cmd.as_str() == "_merged_" && merged[0][0].user.as_str() == "_merged_");

        let across = merge_across_hosts_by_time(merged);
        assert!(across.len() == 1);
        assert!(across[0][0].hostname.as_str() == "h[1-2]");
        assert!(across[0][0].cpu_pct == 7.0);
        assert!(merge_across_hosts_by_time(vec![]).is_empty());
    }

    #[test]
    fn test_fold() {
        let mut samples = vec![];
        for (t, c) in [(3600, 10.0), (3700, 20.0), (7199, 30.0), (7200, 5.0)] {
            let mut s = sample("a", 1, 10, "x", t, c);
            s.cpu_kib = 100;
            samples.push(s);
        }
        let folded = fold_samples_hourly(&samples);
        assert!(folded.len() == 2);
        assert!(folded[0].timestamp == 3600 && folded[0].cpu_pct == 20.0);
        assert!(folded[0].cpu_kib == 100);
        assert!(folded[0].cmd.as_str() == "_merged_");
        assert!(folded[1].timestamp == 7200 && folded[1].cpu_pct == 5.0);
        assert!(fold_samples_daily(&samples).len() == 1);
        assert!(fold_samples_weekly(&[]).is_empty());
    }
}
