/// Slurm job data, from `sacct` polling (CSV) or from the newer JSON job envelopes.
///
/// See the sacct documentation for the interpretation of the fields, we follow that except as noted
/// here:
///
/// - JobIDRaw is split into `job_id` (integer) and `job_step` (string), the latter empty for the
///   "main" record for the job.  For array jobs, JobID is parsed into `array_job_id`,
///   `array_index` and `array_step`.  For het jobs, JobID is parsed into `het_job_id`, `het_offset`
///   and `het_step`.  For normal jobs the array and het fields are zero/blank.
///
/// - 2^32-1 seconds is about 136 years, which is fine for elapsed time, but 170K cores running flat
///   out for a week comes to about 24 times that, so total consumed CPU time is 64 bits.
///
/// - Memory and I/O sizes are in GiB, rounded up.  Anything smaller isn't meaningful.
///
/// - The time limit is in *seconds*, though sacct reports minutes.
///
/// - The state is the first word only: "CANCELLED by 1234" is just CANCELLED.
///
/// - For jobs that were cancelled before they were scheduled, `start` can be 0 and `node_list` can
///   be empty, and probably a number of other fields are off too.
///
/// There are orders of magnitude fewer of these than of Samples, so the structure can afford to be
/// big, but it is still pointer-free.
use anyhow::Result;
use rustutils::{
    parse_rfc3339, parse_slurm_bytes, parse_slurm_elapsed32, parse_slurm_elapsed64, parse_uint32,
    parse_uint8, CsvSyntaxError, CsvToken, CsvTokenizer, Ustr, UstrAllocator, CSV_EQ_SENTINEL,
    USTR_EMPTY,
};
use serde::Deserialize;
use std::io;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SacctInfo {
    /// Record timestamp, not in older data
    pub time: i64,
    pub start: i64,
    pub end: i64,
    pub submit: i64,
    pub system_cpu: u64,
    pub user_cpu: u64,
    pub ave_cpu: u64,
    pub min_cpu: u64,
    pub version: Ustr,
    /// Only for the "main" record for the job
    pub user: Ustr,
    pub job_name: Ustr,
    pub state: Ustr,
    pub account: Ustr,
    pub layout: Ustr,
    pub reservation: Ustr,
    /// Name of step if any, eg "extern" or "1"
    pub job_step: Ustr,
    pub array_step: Ustr,
    pub het_step: Ustr,
    pub node_list: Ustr,
    pub partition: Ustr,
    /// Comma-separated list of model=n and/or *=n, from AllocTRES
    pub req_gpus: Ustr,
    pub job_id: u32,
    pub array_job_id: u32,
    pub array_index: u32,
    pub het_job_id: u32,
    pub het_offset: u32,
    pub ave_disk_read: u32,
    pub ave_disk_write: u32,
    pub ave_rss: u32,
    pub ave_vmsize: u32,
    pub elapsed_raw: u32,
    pub max_rss: u32,
    pub max_vmsize: u32,
    pub req_cpus: u32,
    pub req_mem: u32,
    pub req_nodes: u32,
    pub suspended: u32,
    pub timelimit_raw: u32,
    /// The code part of code:signal
    pub exit_code: u8,
    /// The signal part of code:signal, only in older data
    pub exit_signal: u8,
}

/// Reduce an AllocTRES value to the GPU requests: `gres/gpu=n` becomes `*=n` and
/// `gres/gpu:model=n` becomes `model=n`, and these are comma-joined.

pub fn parse_alloc_tres(val: &[u8], ustrs: &mut dyn UstrAllocator) -> Ustr {
    const GRES_GPU: &[u8] = b"gres/gpu";
    let mut t = Vec::<u8>::new();
    for item in val.split(|c| *c == b',') {
        let Some(rest) = item.strip_prefix(GRES_GPU) else {
            continue;
        };
        let rest = match rest.first() {
            Some(b'=') => rest,
            Some(b':') if rest.len() > 1 => &rest[1..],
            _ => continue,
        };
        if !t.is_empty() {
            t.push(b',');
        }
        if rest.first() == Some(&b'=') {
            t.push(b'*');
        }
        t.extend_from_slice(rest);
    }
    ustrs.alloc_bytes(&t)
}

/// Parse the CSV sacct format.  This has the same structure as the sample parser: one record per
/// line, `Tag=value` fields, a bad field drops the field and a bad value drops the record.
/// Mandatory fields are `v`, `End` and a nonzero job ID.

pub fn parse_sacct_csv(
    input: &mut dyn io::Read,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(Vec<SacctInfo>, usize)> {
    let mut records = vec![];
    let mut soft_errors = 0usize;
    let mut tokenizer = CsvTokenizer::new(input);
    let mut end_of_input = false;

    'line_loop: while !end_of_input {
        let mut any_fields = false;
        let mut info = SacctInfo {
            end: i64::MAX,
            ..Default::default()
        };

        'field_loop: loop {
            let (start, lim, eqloc) = match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<CsvSyntaxError>().is_none() {
                        return Err(e);
                    }
                    tokenizer.scan_eol();
                    soft_errors += 1;
                    continue 'line_loop;
                }
                Ok(CsvToken::EOL) => break 'field_loop,
                Ok(CsvToken::EOF) => {
                    end_of_input = true;
                    break 'field_loop;
                }
                Ok(CsvToken::Field(start, lim, eqloc)) => (start, lim, eqloc),
            };
            any_fields = true;

            if eqloc == CSV_EQ_SENTINEL {
                if verbose {
                    log::info!("Dropping field with bad form: {}", "(elided)");
                }
                soft_errors += 1;
                continue 'field_loop;
            }

            let tk = &tokenizer;
            let mut matched = false;
            let mut failed = false;
            let mut field = |tag: &[u8]| -> Option<&[u8]> {
                if tk.match_tag(tag, start, eqloc) {
                    matched = true;
                    Some(tk.buf_slice(eqloc, lim))
                } else {
                    None
                }
            };

            match tk.buf_at(start) {
                b'A' => {
                    if let Some(val) = field(b"Account") {
                        info.account = ustrs.alloc_bytes(val);
                    } else if let Some(val) = field(b"AllocTRES") {
                        info.req_gpus = parse_alloc_tres(val, ustrs);
                    } else if let Some(val) = field(b"AveCPU") {
                        failed = set(&mut info.ave_cpu, parse_slurm_elapsed64(val));
                    } else if let Some(val) = field(b"AveDiskRead") {
                        failed = set(&mut info.ave_disk_read, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"AveDiskWrite") {
                        failed = set(&mut info.ave_disk_write, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"AveRSS") {
                        failed = set(&mut info.ave_rss, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"AveVMSize") {
                        failed = set(&mut info.ave_vmsize, parse_slurm_bytes(val));
                    }
                }
                b'E' => {
                    if let Some(val) = field(b"ElapsedRaw") {
                        failed = set(&mut info.elapsed_raw, parse_uint32(val));
                    } else if let Some(val) = field(b"ExitCode") {
                        match val.iter().position(|c| *c == b':') {
                            None => {
                                failed = set(&mut info.exit_code, parse_uint8(val));
                            }
                            Some(sep) => {
                                failed = set(&mut info.exit_code, parse_uint8(&val[..sep]))
                                    | set(&mut info.exit_signal, parse_uint8(&val[sep + 1..]));
                            }
                        }
                    } else if let Some(val) = field(b"End") {
                        failed = set(&mut info.end, parse_rfc3339(val));
                    }
                }
                b'J' => {
                    if let Some(val) = field(b"JobID") {
                        // If the ID indicates an array job then set the array fields, if it
                        // indicates a het job then set the het fields.  In either case the job ID
                        // and step are left alone, they are set from JobIDRaw.
                        let (val, step) = match val.iter().position(|c| *c == b'.') {
                            Some(sep) => (&val[..sep], ustrs.alloc_bytes(&val[sep + 1..])),
                            None => (val, USTR_EMPTY),
                        };
                        if let Some(sep) = val.iter().position(|c| *c == b'_' || *c == b'+') {
                            let mut id = 0u32;
                            let mut ix = 0u32;
                            failed = set(&mut id, parse_uint32(&val[..sep]))
                                | set(&mut ix, parse_uint32(&val[sep + 1..]));
                            if val[sep] == b'_' {
                                info.array_job_id = id;
                                info.array_index = ix;
                                info.array_step = step;
                            } else {
                                info.het_job_id = id;
                                info.het_offset = ix;
                                info.het_step = step;
                            }
                        }
                    } else if let Some(val) = field(b"JobIDRaw") {
                        match val.iter().position(|c| *c == b'.') {
                            Some(sep) => {
                                failed = set(&mut info.job_id, parse_uint32(&val[..sep]));
                                info.job_step = ustrs.alloc_bytes(&val[sep + 1..]);
                            }
                            None => {
                                failed = set(&mut info.job_id, parse_uint32(val));
                            }
                        }
                    } else if let Some(val) = field(b"JobName") {
                        info.job_name = ustrs.alloc_bytes(val);
                    }
                }
                b'L' => {
                    if let Some(val) = field(b"Layout") {
                        info.layout = ustrs.alloc_bytes(val);
                    }
                }
                b'M' => {
                    if let Some(val) = field(b"MaxRSS") {
                        failed = set(&mut info.max_rss, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"MaxVMSize") {
                        failed = set(&mut info.max_vmsize, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"MinCPU") {
                        failed = set(&mut info.min_cpu, parse_slurm_elapsed64(val));
                    }
                }
                b'N' => {
                    if let Some(val) = field(b"NodeList") {
                        info.node_list = ustrs.alloc_bytes(val);
                    }
                }
                b'P' => {
                    if let Some(val) = field(b"Partition") {
                        info.partition = ustrs.alloc_bytes(val);
                    } else if field(b"Priority").is_some() {
                        // No field for this yet
                    }
                }
                b'R' => {
                    // Stick to the Slurm spelling: "ReqCPUS" with a capital S
                    if let Some(val) = field(b"ReqCPUS") {
                        failed = set(&mut info.req_cpus, parse_uint32(val));
                    } else if let Some(val) = field(b"ReqMem") {
                        failed = set(&mut info.req_mem, parse_slurm_bytes(val));
                    } else if let Some(val) = field(b"ReqNodes") {
                        failed = set(&mut info.req_nodes, parse_uint32(val));
                    } else if let Some(val) = field(b"Reservation") {
                        info.reservation = ustrs.alloc_bytes(val);
                    }
                }
                b'S' => {
                    if let Some(val) = field(b"Start") {
                        failed = set(&mut info.start, parse_rfc3339(val));
                    } else if let Some(val) = field(b"State") {
                        let val = match val.iter().position(|c| *c == b' ') {
                            Some(loc) => &val[..loc],
                            None => val,
                        };
                        info.state = ustrs.alloc_bytes(val);
                    } else if let Some(val) = field(b"Submit") {
                        failed = set(&mut info.submit, parse_rfc3339(val));
                    } else if let Some(val) = field(b"Suspended") {
                        failed = set(&mut info.suspended, parse_slurm_elapsed32(val));
                    } else if let Some(val) = field(b"SystemCPU") {
                        failed = set(&mut info.system_cpu, parse_slurm_elapsed64(val));
                    }
                }
                b'T' => {
                    if let Some(val) = field(b"TimelimitRaw") {
                        // The input value is in minutes
                        failed = set(
                            &mut info.timelimit_raw,
                            parse_uint32(val).map(|m| m.saturating_mul(60)),
                        );
                    }
                }
                b'U' => {
                    if let Some(val) = field(b"User") {
                        info.user = ustrs.alloc_bytes(val);
                    } else if let Some(val) = field(b"UserCPU") {
                        failed = set(&mut info.user_cpu, parse_slurm_elapsed64(val));
                    }
                }
                b'v' => {
                    if let Some(val) = field(b"v") {
                        info.version = ustrs.alloc_bytes(val);
                    }
                }
                _ => {}
            }

            if !matched {
                if verbose {
                    log::warn!("Dropping field with unknown name: {}", "(elided)");
                }
                soft_errors += 1;
            }
            if failed {
                if verbose {
                    log::warn!("Dropping record with illegal/unparseable value: {}", "(elided)");
                }
                soft_errors += 1;
                tokenizer.scan_eol();
                continue 'line_loop;
            }
        } // Field loop

        // Skip entirely empty records.
        if !any_fields {
            continue 'line_loop;
        }

        let mut irritants = String::new();
        if info.version == USTR_EMPTY {
            irritants += "version ";
        }
        if info.end == i64::MAX {
            irritants += "end ";
        }
        if info.job_id == 0 {
            irritants += "jobid ";
        }
        if !irritants.is_empty() {
            if verbose {
                log::warn!("Dropping record with missing mandatory field(s): {irritants}");
            }
            soft_errors += 1;
            continue 'line_loop;
        }

        records.push(info);
    }

    Ok((records, soft_errors))
}

// Store the value if there is one, and return true if there was an error.
fn set<T>(dest: &mut T, r: Result<T>) -> bool {
    match r {
        Ok(v) => {
            *dest = v;
            false
        }
        Err(_) => true,
    }
}

// The JSON job format.  Every field is optional in the input and defaults to zero/empty.

#[derive(Deserialize, Default)]
#[serde(default)]
struct SlurmJobsEnvelope {
    meta: Meta,
    data: Option<SlurmJobsData>,
    errors: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Meta {
    version: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SlurmJobsData {
    attributes: SlurmJobsAttributes,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SlurmJobsAttributes {
    time: String,
    slurm_jobs: Vec<SlurmJob>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SlurmJob {
    job_id: u64,
    job_step: String,
    job_name: String,
    job_state: String,
    array_job_id: u64,
    array_task_id: u64,
    het_job_id: u64,
    het_job_offset: u64,
    user_name: String,
    account: String,
    submit_time: String,
    start_time: String,
    end_time: String,
    // Seconds
    time_limit: u64,
    partition: String,
    reservation: String,
    nodes: Vec<String>,
    layout: String,
    req_cpus: u64,
    // GiB
    req_memory_per_node: u64,
    req_nodes: u64,
    suspended: u64,
    exit_code: u64,
    sacct: Option<SacctData>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SacctData {
    min_cpu: u64,
    alloc_tres: String,
    ave_cpu: u64,
    ave_disk_read: u64,
    ave_disk_write: u64,
    ave_rss: u64,
    ave_vmsize: u64,
    elapsed_raw: u64,
    system_cpu: u64,
    user_cpu: u64,
    max_rss: u64,
    max_vmsize: u64,
}

/// Parse the JSON job format: a stream of whitespace-separated envelopes, each holding the jobs
/// observed by one sacct run.  An envelope that carries errors instead of data is a soft error.  A
/// malformed envelope is a soft error too, and ends the parse, as we can't resynchronize.

pub fn parse_sacct_v0_json(
    input: &mut dyn io::Read,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(Vec<SacctInfo>, usize)> {
    let mut records = vec![];
    let mut soft_errors = 0usize;
    let stream = serde_json::Deserializer::from_reader(input).into_iter::<SlurmJobsEnvelope>();
    for envelope in stream {
        let envelope = match envelope {
            Ok(e) => e,
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => {
                if verbose {
                    log::warn!("Abandoning job data with bad JSON: {e}");
                }
                soft_errors += 1;
                break;
            }
        };
        let Some(data) = envelope.data else {
            soft_errors += 1;
            continue;
        };
        if envelope.errors.is_some() {
            soft_errors += 1;
            continue;
        }
        let version = ustrs.alloc(&envelope.meta.version);
        let time = parse_rfc3339(data.attributes.time.as_bytes()).unwrap_or(0);
        for job in data.attributes.slurm_jobs {
            let sacct = job.sacct.unwrap_or_default();
            let step = ustrs.alloc(&job.job_step);
            records.push(SacctInfo {
                time,
                start: parse_rfc3339(job.start_time.as_bytes()).unwrap_or(0),
                end: parse_rfc3339(job.end_time.as_bytes()).unwrap_or(0),
                submit: parse_rfc3339(job.submit_time.as_bytes()).unwrap_or(0),
                system_cpu: sacct.system_cpu,
                user_cpu: sacct.user_cpu,
                ave_cpu: sacct.ave_cpu,
                min_cpu: sacct.min_cpu,
                version,
                user: ustrs.alloc(&job.user_name),
                job_name: ustrs.alloc(&job.job_name),
                state: ustrs.alloc(&job.job_state),
                account: ustrs.alloc(&job.account),
                layout: ustrs.alloc(&job.layout),
                reservation: ustrs.alloc(&job.reservation),
                job_step: step,
                array_step: if job.array_job_id != 0 { step } else { USTR_EMPTY },
                het_step: if job.het_job_id != 0 { step } else { USTR_EMPTY },
                node_list: ustrs.alloc(&job.nodes.join(",")),
                partition: ustrs.alloc(&job.partition),
                req_gpus: parse_alloc_tres(sacct.alloc_tres.as_bytes(), ustrs),
                job_id: job.job_id as u32,
                array_job_id: job.array_job_id as u32,
                array_index: job.array_task_id as u32,
                het_job_id: job.het_job_id as u32,
                het_offset: job.het_job_offset as u32,
                ave_disk_read: sacct.ave_disk_read as u32,
                ave_disk_write: sacct.ave_disk_write as u32,
                ave_rss: sacct.ave_rss as u32,
                ave_vmsize: sacct.ave_vmsize as u32,
                elapsed_raw: sacct.elapsed_raw as u32,
                max_rss: sacct.max_rss as u32,
                max_vmsize: sacct.max_vmsize as u32,
                req_cpus: job.req_cpus as u32,
                req_mem: job.req_memory_per_node as u32,
                req_nodes: job.req_nodes as u32,
                suspended: job.suspended as u32,
                timelimit_raw: job.time_limit as u32,
                exit_code: job.exit_code as u8,
                exit_signal: 0,
            });
        }
    }
    Ok((records, soft_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustutils::UstrCache;

    #[test]
    fn test_alloc_tres() {
        let mut ustrs = UstrCache::new();
        let tres = b"billing=20,cpu=20,gres/gpu:rtx30=1,gres/gpu=2,mem=50G";
        let u = parse_alloc_tres(tres, &mut ustrs);
        assert!(u.as_str() == "rtx30=1,*=2");
        assert!(parse_alloc_tres(b"billing=20,cpu=20", &mut ustrs).is_empty());
        assert!(parse_alloc_tres(b"gres/gpu", &mut ustrs).is_empty());
        assert!(parse_alloc_tres(b"gres/gpu:", &mut ustrs).is_empty());
        assert!(parse_alloc_tres(b"cpu=8,gres/gpu:,gres/gpu=2", &mut ustrs).as_str() == "*=2");
        assert!(parse_alloc_tres(b"gres/gpumem=10G,gres/gpu=1", &mut ustrs).as_str() == "*=1");
        assert!(parse_alloc_tres(b"", &mut ustrs).is_empty());
    }

    // This tests:
    //  - array and het job IDs
    //  - the step is split off JobIDRaw
    //  - conversions of elapsed times, sizes, time limits, exit codes
    //  - the state is truncated to one word
    //  - unknown fields are dropped but the record is kept
    //  - bad values and missing mandatory fields drop the record
    //  - a blank line is not an error

    #[test]
    fn test_parse_sacct_csv() {
        let text = r#"v=0.1.0,JobID=1182031_3,JobIDRaw=1182035,User=ec313,Account=ec313,State=COMPLETED,Start=2024-06-03T10:00:00+02:00,End=2024-06-03T11:00:00+02:00,Submit=2024-06-03T09:59:00+02:00,ElapsedRaw=3600,TimelimitRaw=120,ReqCPUS=8,ReqMem=16G,ReqNodes=1,NodeList=c1-10,Partition=normal,"AllocTRES=billing=8,cpu=8,gres/gpu=1",ExitCode=0:0,Priority=100
v=0.1.0,JobID=1182040+1.batch,JobIDRaw=1182041.batch,State=CANCELLED by 2101,End=2024-06-03T11:00:00+02:00,AveCPU=01:02:03,MaxRSS=1025M,UserCPU=1-00:00:00,Suspended=00:10,ExitCode=2:9,Frobnitz=1

v=0.1.0,JobIDRaw=1182042,End=2024-06-03T11:00:00+02:00,ElapsedRaw=1x
v=0.1.0,JobIDRaw=1182043
JobIDRaw=1182044,End=2024-06-03T11:00:00+02:00
"#;
        let mut bytes = text.as_bytes();
        let (records, soft_errors) =
            parse_sacct_csv(&mut bytes, &mut UstrCache::new(), false).unwrap();
        assert!(records.len() == 2);
        assert!(soft_errors == 4);

        let r = &records[0];
        assert!(r.version.as_str() == "0.1.0");
        assert!(r.job_id == 1182035 && r.job_step.is_empty());
        assert!(r.array_job_id == 1182031 && r.array_index == 3 && r.array_step.is_empty());
        assert!(r.het_job_id == 0);
        assert!(r.user.as_str() == "ec313" && r.account.as_str() == "ec313");
        assert!(r.state.as_str() == "COMPLETED");
        assert!(r.start == 1717401600 && r.end == 1717405200 && r.submit == 1717401540);
        assert!(r.elapsed_raw == 3600);
        assert!(r.timelimit_raw == 7200);
        assert!(r.req_cpus == 8 && r.req_mem == 16 && r.req_nodes == 1);
        assert!(r.node_list.as_str() == "c1-10" && r.partition.as_str() == "normal");
        assert!(r.req_gpus.as_str() == "*=1");
        assert!(r.exit_code == 0 && r.exit_signal == 0);

        let r = &records[1];
        assert!(r.job_id == 1182041 && r.job_step.as_str() == "batch");
        assert!(r.het_job_id == 1182040 && r.het_offset == 1 && r.het_step.as_str() == "batch");
        assert!(r.array_job_id == 0);
        assert!(r.state.as_str() == "CANCELLED");
        assert!(r.ave_cpu == 3723);
        assert!(r.max_rss == 2);
        assert!(r.user_cpu == 86400);
        assert!(r.suspended == 10);
        assert!(r.exit_code == 2 && r.exit_signal == 9);
    }

    #[test]
    fn test_parse_sacct_json() {
        let text = r#"
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"jobs","attributes":{"time":"2024-06-03T12:00:00+02:00","cluster":"fox",
   "slurm_jobs":[
     {"job_id":1182035,"job_step":"","job_name":"train","job_state":"COMPLETED","array_job_id":1182031,
      "array_task_id":3,"user_name":"ec313","account":"ec313","start_time":"2024-06-03T10:00:00+02:00",
      "end_time":"2024-06-03T11:00:00+02:00","submit_time":"2024-06-03T09:59:00+02:00","time_limit":7200,
      "partition":"normal","nodes":["c1-10","c1-11"],"req_cpus":8,"req_memory_per_node":16,"req_nodes":2,
      "exit_code":1,
      "sacct":{"alloc_tres":"billing=8,gres/gpu:a100=2","ave_cpu":10,"min_cpu":5,"user_cpu":3000,
               "system_cpu":20,"ave_rss":3,"max_rss":4,"elapsed_raw":3600}},
     {"job_id":1182036,"job_step":"0","het_job_id":1182036,"het_job_offset":0,
      "end_time":"2024-06-03T11:00:00+02:00"}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"time":"2024-06-03T12:05:00+02:00","detail":"sacct failed"}]}
{"meta":{"producer":"sonar","version":"0.13.0"},"data":{"type":"jobs","attributes":{"time":"#;
        let mut bytes = text.as_bytes();
        let (records, soft_errors) =
            parse_sacct_v0_json(&mut bytes, &mut UstrCache::new(), false).unwrap();
        assert!(records.len() == 2);
        assert!(soft_errors == 2);

        let r = &records[0];
        assert!(r.version.as_str() == "0.13.0");
        assert!(r.time == 1717408800);
        assert!(r.job_id == 1182035 && r.job_step.is_empty());
        assert!(r.array_job_id == 1182031 && r.array_index == 3);
        assert!(r.job_name.as_str() == "train" && r.state.as_str() == "COMPLETED");
        assert!(r.start == 1717401600 && r.end == 1717405200);
        assert!(r.timelimit_raw == 7200);
        assert!(r.node_list.as_str() == "c1-10,c1-11");
        assert!(r.req_cpus == 8 && r.req_mem == 16 && r.req_nodes == 2);
        assert!(r.exit_code == 1);
        assert!(r.req_gpus.as_str() == "a100=2");
        assert!(r.user_cpu == 3000 && r.max_rss == 4 && r.elapsed_raw == 3600);

        let r = &records[1];
        assert!(r.het_job_id == 1182036 && r.het_step.as_str() == "0");
        assert!(r.array_step.is_empty());
        assert!(r.user_cpu == 0 && r.req_gpus.is_empty());
    }
}
