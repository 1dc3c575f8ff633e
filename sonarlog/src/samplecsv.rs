/// Fast parser for the CSV form of Sonar `sample` data.
///
/// Read a stream of Sonar data records, parse them and return them in order.  Returns the number of
/// benign (soft) errors along with the data; the only hard error is an I/O error from the reader.
///
/// NOTE:
///
/// - Tagged and untagged records can be mixed in a file in any order; this allows files to be
///   catenated and sonar to be updated at any time.
///
/// - It's an important feature of this parser that a corrupted record is dropped and counted but
///   does not stop the parse.  Appending-to-log is not atomic wrt reading-from-log and it is
///   somewhat likely that there will be situations where we run into a partly-written
///   (corrupted-looking) record.
///
/// - Efficiency is a major concern: the tokenizer does not allocate, strings are interned straight
///   from the tokenizer's buffer, numbers are parsed from it, and fields are dispatched on one or
///   two bytes of the tag before the tag is compared.
///
/// - In verbose mode we log why a field or record was dropped, but we never extract the offending
///   bytes for the message, "(elided)" is logged instead.  Extracting them is technically free of
///   effects and the optimizer will hoist the work out of the dispatch and slow everything down.
use crate::sample::{
    EncodedGpuData, EncodedLoadData, GpuDatum, LoadDatum, Sample, FLAG_HEARTBEAT,
};

use anyhow::Result;
use rustutils::{
    parse_float, parse_rfc3339, parse_uint64, CsvSyntaxError, CsvToken, CsvTokenizer, GpuSet,
    UstrAllocator, CSV_EQ_SENTINEL, USTR_EMPTY,
};
use std::io;

#[derive(Debug, Default)]
pub struct SampleData {
    pub samples: Vec<Sample>,
    pub load: Vec<LoadDatum>,
    pub gpu: Vec<GpuDatum>,
}

#[derive(PartialEq)]
enum Format {
    Unknown,
    Untagged,
    Tagged,
}

pub fn parse_sample_csv(
    input: &mut dyn io::Read,
    ustrs: &mut dyn UstrAllocator,
    verbose: bool,
) -> Result<(SampleData, usize)> {
    let mut samples = vec![];
    let mut load_data = vec![];
    let mut gpu_data = vec![];
    let mut soft_errors = 0usize;
    let mut tokenizer = CsvTokenizer::new(input);
    let v060 = ustrs.alloc("0.6.0");
    let heartbeat = ustrs.alloc("_heartbeat_");
    let mut end_of_input = false;

    'line_loop: while !end_of_input {
        // Find the fields and then convert them.  Mandatory fields are really required.  The
        // sentinels are not zero because zeroes are valid values from the input.  Keep the
        // sentinels in sync with the code below that inserts default values after parsing!
        let mut version = USTR_EMPTY;
        let mut timestamp = i64::MAX;
        let mut hostname = USTR_EMPTY;
        let mut cores = u32::MAX;
        let mut memtotal_kib = u64::MAX;
        let mut user = USTR_EMPTY;
        let mut pid = u32::MAX;
        let mut ppid = u32::MAX;
        let mut job = u32::MAX;
        let mut cmd = USTR_EMPTY;
        let mut cpu_pct = f32::MAX;
        let mut cpu_kib = u64::MAX;
        let mut rssanon_kib = u64::MAX;
        let mut gpus = GpuSet::empty();
        let mut gpu_pct = f32::MAX;
        let mut gpumem_pct = f32::MAX;
        let mut gpu_kib = u64::MAX;
        let mut gpu_fail = u8::MAX;
        let mut cputime_sec = u64::MAX;
        let mut rolledup = u32::MAX;
        let mut load: Option<Vec<u8>> = None;
        let mut gpuinfo: Option<Vec<u8>> = None;
        let mut format = Format::Unknown;
        let mut untagged_position = 0;

        'field_loop: loop {
            let (start, lim, eqloc) = match tokenizer.get() {
                Err(e) => {
                    if e.downcast_ref::<CsvSyntaxError>().is_none() {
                        return Err(e);
                    }
                    if verbose {
                        log::info!("Dropping record with syntax error: {e}");
                    }
                    tokenizer.scan_eol();
                    soft_errors += 1;
                    continue 'line_loop;
                }
                Ok(CsvToken::EOL) => {
                    break 'field_loop;
                }
                Ok(CsvToken::EOF) => {
                    end_of_input = true;
                    break 'field_loop;
                }
                Ok(CsvToken::Field(start, lim, eqloc)) => (start, lim, eqloc),
            };

            if format == Format::Unknown {
                if eqloc == CSV_EQ_SENTINEL {
                    format = Format::Untagged;
                    version = v060;
                } else {
                    format = Format::Tagged;
                }
            }

            let mut matched = false;
            let mut failed = false;
            match format {
                Format::Unknown => {
                    panic!("Unexpected case");
                }
                #[cfg(not(feature = "untagged_sonar_data"))]
                Format::Untagged => {
                    if verbose {
                        log::info!("Dropping untagged record");
                    }
                    soft_errors += 1;
                    tokenizer.scan_eol();
                    continue 'line_loop;
                }
                #[cfg(feature = "untagged_sonar_data")]
                Format::Untagged => {
                    // This is an untagged record.  It does not carry a version number and has
                    // evolved a bit over time.
                    //
                    // Old old format (current on Saga as of 2023-10-13)
                    // 0  timestamp
                    // 1  hostname
                    // 2  numcores
                    // 3  username
                    // 4  jobid
                    // 5  command
                    // 6  cpu_pct
                    // 7  mem_kib
                    //
                    // New old format (what was briefly deployed on the UiO ML nodes)
                    // 8  gpus bitvector
                    // 9  gpu_pct
                    // 10 gpumem_pct
                    // 11 gpumem_kib
                    //
                    // Newer old format (again briefly used on the UiO ML nodes)
                    // 12 cputime_sec
                    let val = tokenizer.buf_slice(start, lim);
                    match untagged_position {
                        0 => match parse_rfc3339(val) {
                            Ok(t) => timestamp = t,
                            Err(_) => failed = true,
                        },
                        1 => hostname = ustrs.alloc_bytes(val),
                        2 => match parse_uint64(val) {
                            Ok(n) => cores = n as u32,
                            Err(_) => failed = true,
                        },
                        3 => user = ustrs.alloc_bytes(val),
                        4 => match parse_uint64(val) {
                            Ok(n) => {
                                // Untagged data do not carry a PID, so use the job ID in its
                                // place.  Sometimes the job ID is also zero, for root jobs.
                                job = n as u32;
                                pid = job;
                            }
                            Err(_) => failed = true,
                        },
                        5 => cmd = ustrs.alloc_bytes(val),
                        6 => match parse_float(val, true) {
                            Ok(n) => cpu_pct = n as f32,
                            Err(_) => failed = true,
                        },
                        7 => match parse_uint64(val) {
                            Ok(n) => cpu_kib = n,
                            Err(_) => failed = true,
                        },
                        8 => match GpuSet::from_bitvector(val) {
                            Ok(g) => gpus = g,
                            Err(_) => failed = true,
                        },
                        9 => match parse_float(val, true) {
                            Ok(n) => gpu_pct = n as f32,
                            Err(_) => failed = true,
                        },
                        10 => match parse_float(val, true) {
                            Ok(n) => gpumem_pct = n as f32,
                            Err(_) => failed = true,
                        },
                        11 => match parse_uint64(val) {
                            Ok(n) => gpu_kib = n,
                            Err(_) => failed = true,
                        },
                        12 => match parse_uint64(val) {
                            Ok(n) => cputime_sec = n,
                            Err(_) => failed = true,
                        },
                        _ => {
                            // Drop the field, we may learn about it later
                        }
                    }
                    untagged_position += 1;
                    matched = true;
                }
                Format::Tagged => {
                    if eqloc == CSV_EQ_SENTINEL {
                        // Invalid field syntax: Drop the field but keep the record
                        if verbose {
                            log::info!("Dropping field with bad form: {}", "(elided)");
                        }
                        soft_errors += 1;
                        continue 'field_loop;
                    }

                    // The first two characters will always be present because eqloc >= 2 (the
                    // field name is never empty).

                    let tk = &tokenizer;
                    match tk.buf_at(start) {
                        b'c' => match tk.buf_at(start + 1) {
                            b'o' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"cores") {
                                    match parse_uint64(val) {
                                        Ok(n) => cores = n as u32,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            b'm' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"cmd") {
                                    cmd = ustrs.alloc_bytes(val);
                                    matched = true;
                                }
                            }
                            b'p' if lim - start >= 4 => match tk.buf_at(start + 3) {
                                b'%' => {
                                    if let Some(val) = value(tk, start, lim, eqloc, b"cpu%") {
                                        match parse_float(val, true) {
                                            Ok(n) => cpu_pct = n as f32,
                                            Err(_) => failed = true,
                                        }
                                        matched = true;
                                    }
                                }
                                b'k' => {
                                    if let Some(val) = value(tk, start, lim, eqloc, b"cpukib") {
                                        match parse_uint64(val) {
                                            Ok(n) => cpu_kib = n,
                                            Err(_) => failed = true,
                                        }
                                        matched = true;
                                    }
                                }
                                b't' => {
                                    if let Some(val) = value(tk, start, lim, eqloc, b"cputime_sec")
                                    {
                                        match parse_uint64(val) {
                                            Ok(n) => cputime_sec = n,
                                            Err(_) => failed = true,
                                        }
                                        matched = true;
                                    }
                                }
                                _ => {}
                            },
                            _ => {}
                        },
                        b'e' => {
                            if value(tk, start, lim, eqloc, b"epoch").is_some() {
                                // Ignore it
                                matched = true;
                            }
                        }
                        b'g' if lim - start >= 4 => match tk.buf_at(start + 3) {
                            b'%' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpu%") {
                                    match parse_float(val, true) {
                                        Ok(n) => gpu_pct = n as f32,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            b'f' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpufail") {
                                    match parse_uint64(val) {
                                        Ok(n) => gpu_fail = n as u8,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            b'i' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpuinfo") {
                                    gpuinfo = Some(val.to_vec());
                                    matched = true;
                                }
                            }
                            b'k' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpukib") {
                                    match parse_uint64(val) {
                                        Ok(n) => gpu_kib = n,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            b'm' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpumem%") {
                                    match parse_float(val, true) {
                                        Ok(n) => gpumem_pct = n as f32,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            b's' => {
                                if let Some(val) = value(tk, start, lim, eqloc, b"gpus") {
                                    match GpuSet::from_bytes(val) {
                                        Ok(g) => gpus = g,
                                        Err(_) => failed = true,
                                    }
                                    matched = true;
                                }
                            }
                            _ => {}
                        },
                        b'h' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"host") {
                                hostname = ustrs.alloc_bytes(val);
                                matched = true;
                            }
                        }
                        b'j' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"job") {
                                match parse_uint64(val) {
                                    Ok(n) => job = n as u32,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            }
                        }
                        b'l' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"load") {
                                load = Some(val.to_vec());
                                matched = true;
                            }
                        }
                        b'm' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"memtotalkib") {
                                match parse_uint64(val) {
                                    Ok(n) => memtotal_kib = n,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            }
                        }
                        b'p' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"pid") {
                                match parse_uint64(val) {
                                    Ok(n) => pid = n as u32,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            } else if let Some(val) = value(tk, start, lim, eqloc, b"ppid") {
                                match parse_uint64(val) {
                                    Ok(n) => ppid = n as u32,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            }
                        }
                        b'r' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"rssanonkib") {
                                match parse_uint64(val) {
                                    Ok(n) => rssanon_kib = n,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            } else if let Some(val) = value(tk, start, lim, eqloc, b"rolledup") {
                                match parse_uint64(val) {
                                    Ok(n) => rolledup = n as u32,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            }
                        }
                        b't' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"time") {
                                match parse_rfc3339(val) {
                                    Ok(t) => timestamp = t,
                                    Err(_) => failed = true,
                                }
                                matched = true;
                            }
                        }
                        b'u' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"user") {
                                user = ustrs.alloc_bytes(val);
                                matched = true;
                            }
                        }
                        b'v' => {
                            if let Some(val) = value(tk, start, lim, eqloc, b"v") {
                                version = ustrs.alloc_bytes(val);
                                matched = true;
                            }
                        }
                        _ => {}
                    }

                    if !matched {
                        // Unknown field: drop it but keep the record.
                        if verbose {
                            log::warn!("Dropping field with unknown name: {}", "(elided)");
                        }
                        soft_errors += 1;
                    }
                }
            }

            // Three cases:
            //
            //   matched && !failed - field matched a tag, value is good
            //   matched && failed - field matched a tag, value is bad
            //   !matched - field did not match any tag, already counted
            //
            // The second case suggests something bad, so discard the record in this case.
            if matched && failed {
                if verbose {
                    log::warn!("Dropping record with illegal/unparseable value: {}", "(elided)");
                }
                soft_errors += 1;
                tokenizer.scan_eol();
                continue 'line_loop;
            }
        } // Field loop

        // Skip entirely empty records.
        if format == Format::Unknown {
            continue 'line_loop;
        }

        // Untagged records must have at least the old old fields.
        if format == Format::Untagged && untagged_position < 8 {
            if verbose {
                log::info!(
                    "Dropping untagged record with missing fields, got only {untagged_position} fields"
                );
            }
            soft_errors += 1;
            continue 'line_loop;
        }

        // Check that mandatory fields are present.
        let mut irritants = String::new();
        if version == USTR_EMPTY {
            irritants += "version ";
        }
        if timestamp == i64::MAX {
            irritants += "time ";
        }
        if hostname == USTR_EMPTY {
            irritants += "host ";
        }
        if cmd == USTR_EMPTY {
            irritants += "cmd ";
        }
        if cmd != heartbeat && user == USTR_EMPTY {
            irritants += "user ";
        }
        if !irritants.is_empty() {
            if verbose {
                log::warn!("Dropping record with missing mandatory field(s): {irritants}");
            }
            soft_errors += 1;
            continue 'line_loop;
        }

        // Fill in default data for optional fields.  Keep this code in sync with initialization
        // above!
        if cores == u32::MAX {
            cores = 0;
        }
        if memtotal_kib == u64::MAX {
            memtotal_kib = 0;
        }
        if job == u32::MAX {
            job = 0;
        }
        if pid == u32::MAX {
            pid = 0;
        }
        if ppid == u32::MAX {
            ppid = 0;
        }
        if cpu_pct == f32::MAX {
            cpu_pct = 0.0;
        }
        if cpu_kib == u64::MAX {
            cpu_kib = 0;
        }
        if rssanon_kib == u64::MAX {
            rssanon_kib = 0;
        }
        if gpu_pct == f32::MAX {
            gpu_pct = 0.0;
        }
        if gpumem_pct == f32::MAX {
            gpumem_pct = 0.0;
        }
        if gpu_kib == u64::MAX {
            gpu_kib = 0;
        }
        if gpu_fail == u8::MAX {
            gpu_fail = 0;
        }
        if cputime_sec == u64::MAX {
            cputime_sec = 0;
        }
        if rolledup == u32::MAX {
            rolledup = 0;
        }
        let flags = if cmd == heartbeat { FLAG_HEARTBEAT } else { 0 };

        // Ship it!

        samples.push(Sample {
            timestamp,
            memtotal_kib,
            cpu_kib,
            rssanon_kib,
            gpu_kib,
            cputime_sec,
            version,
            cluster: USTR_EMPTY,
            hostname,
            cores,
            user,
            job,
            pid,
            ppid,
            cmd,
            cpu_pct,
            gpus,
            gpu_pct,
            gpumem_pct,
            rolledup,
            cpu_util_pct: 0.0,
            gpu_fail,
            flags,
        });
        if let Some(bytes) = load {
            load_data.push(LoadDatum {
                timestamp,
                hostname,
                encoded: EncodedLoadData::Base45(bytes),
            });
        }
        if let Some(bytes) = gpuinfo {
            gpu_data.push(GpuDatum {
                timestamp,
                hostname,
                encoded: EncodedGpuData::Csv(bytes),
            });
        }
    } // Line loop

    Ok((
        SampleData {
            samples,
            load: load_data,
            gpu: gpu_data,
        },
        soft_errors,
    ))
}

// If the field at start has the tag, return its value.
#[inline]
fn value<'a>(
    tokenizer: &'a CsvTokenizer,
    start: usize,
    lim: usize,
    eqloc: usize,
    tag: &[u8],
) -> Option<&'a [u8]> {
    if tokenizer.match_tag(tag, start, eqloc) {
        Some(tokenizer.buf_slice(eqloc, lim))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode_gpu_data;
    use crate::sample::parse_version;
    use rustutils::UstrCache;

    fn parse_file(name: &str) -> (SampleData, usize) {
        let mut f = std::fs::File::open(name).unwrap();
        parse_sample_csv(&mut f, &mut UstrCache::new(), true).unwrap()
    }

    fn parse_text(text: &str) -> (SampleData, usize) {
        let mut bytes = text.as_bytes();
        parse_sample_csv(&mut bytes, &mut UstrCache::new(), false).unwrap()
    }

    // This tests:
    //  - a record with a missing mandatory field is dropped
    //  - a field with an unknown tag is dropped but the record is kept
    //  - a field without `=` is dropped but the record is kept
    //  - a record with a bad value is dropped
    //  - blank lines are skipped without complaint
    //  - heartbeats are flagged
    //  - load and gpuinfo data are split off into their own tables

    #[test]
    fn test_parse_intermingled() {
        let (data, soft_errors) = parse_file("../tests/sonarlog/whitebox-intermingled.csv");
        let samples = &data.samples;
        assert!(samples.len() == 5);
        assert!(soft_errors == 4);

        let s = &samples[0];
        assert!(s.version.as_str() == "0.11.1");
        assert!(s.timestamp == 1717408802);
        assert!(s.hostname.as_str() == "ml4.hpc.uio.no");
        assert!(s.cores == 64);
        assert!(s.memtotal_kib == 263518084);
        assert!(s.user.as_str() == "root");
        assert!(s.job == 0 && s.pid == 1090 && s.ppid == 1);
        assert!(s.cmd.as_str() == "tuned");
        assert!((s.cpu_pct - 0.2).abs() < 1e-6);
        assert!(s.cpu_kib == 31960 && s.rssanon_kib == 14628);
        assert!(s.gpus.is_empty());
        assert!(s.cputime_sec == 1248);
        assert!(s.rolledup == 0 && s.gpu_fail == 0 && s.flags == 0);
        assert!(s.cluster.is_empty());

        let s = &samples[1];
        assert!(s.user.as_str() == "larsbent" && s.cmd.as_str() == "python");
        assert!(s.job == 4079);
        assert!(s.gpus == GpuSet::singleton(0));
        assert!(s.gpu_pct == 85.0 && s.gpumem_pct == 12.0 && s.gpu_kib == 2621440);

        assert!(samples[2].is_heartbeat());
        assert!(samples[2].user.as_str() == "_sonar_");
        assert!(samples.iter().filter(|s| s.is_heartbeat()).count() == 1);

        // The field without `=` was dropped, so there's no core count.
        assert!(samples[3].cores == 0);
        assert!(samples[3].cputime_sec == 3774);

        assert!(samples[4].timestamp == 1717409102);
        assert!(data.load.len() == 1);
        assert!(data.load[0].timestamp == 1717409102);
        assert!(data.load[0].encoded == EncodedLoadData::Base45(b"(B0A}1B".to_vec()));
        assert!(data.gpu.len() == 1);
        assert!(data.gpu[0].hostname == samples[4].hostname);
        let cards = decode_gpu_data(&data.gpu[0].encoded);
        assert!(cards.len() == 2);
        assert!(cards[1].perf_state == 2 && cards[1].mem_kib == 2621440);
    }

    // This tests:
    //  - an empty user field is a missing mandatory field
    //  - bad numbers drop the record, in any position
    //  - short records are dropped
    //  - the optional trailing GPU fields are decoded

    #[cfg(feature = "untagged_sonar_data")]
    #[test]
    fn test_parse_untagged_intermingled() {
        let (data, soft_errors) = parse_file("../tests/sonarlog/whitebox-untagged-intermingled.csv");
        let samples = &data.samples;
        assert!(samples.len() == 2);
        assert!(soft_errors == 5);

        let s = &samples[0];
        assert!(s.version.as_str() == "0.6.0");
        assert!(s.hostname.as_str() == "ml3.hpc.uio.no");
        assert!(s.cores == 56);
        assert!(s.user.as_str() == "larsbent");
        assert!(s.job == 1137 && s.pid == 1137);
        assert!(s.cmd.as_str() == "python");
        assert!(s.cpu_kib == 1628248);
        assert!(s.gpus.is_empty());

        let s = &samples[1];
        assert!(s.gpus == GpuSet::singleton(0));
        assert!(s.gpu_pct == 80.0 && s.gpumem_pct == 10.0);
        assert!(s.gpu_kib == 2097152);
        assert!(s.cputime_sec == 1900);
        assert!(data.load.is_empty() && data.gpu.is_empty());
    }

    #[test]
    fn test_parse_clean() {
        let (data, soft_errors) = parse_text(
            "v=0.11.1,time=2024-06-03T10:00:00Z,host=a,user=u1,cmd=x,pid=10,job=9,cpu%=50
v=0.11.1,time=2024-06-03T10:00:00Z,host=b,user=u1,cmd=x,pid=20,job=9,cpu%=25
v=0.11.1,time=2024-06-03T10:05:00Z,host=a,user=u1,cmd=x,pid=10,job=9,cpu%=50,rolledup=3
v=0.11.1,time=2024-06-03T10:05:00Z,host=b,user=u1,cmd=x,pid=20,job=9,cpu%=25,epoch=1717408800
v=0.11.1,time=2024-06-03T10:05:00Z,host=b,user=_sonar_,cmd=_heartbeat_",
        );
        assert!(soft_errors == 0);
        assert!(data.samples.len() == 5);
        assert!(data.samples.iter().filter(|s| s.is_heartbeat()).count() == 1);
        assert!(data.samples[2].rolledup == 3);
        assert!(data.samples[1].hostname.as_str() == "b");
    }

    #[test]
    fn test_parse_errors() {
        // Junk after a closing quote is a syntax error, the line is skipped.
        let (data, soft_errors) = parse_text(
            "v=0.11.1,time=2024-06-03T10:00:00Z,host=a,user=u,cmd=\"x\"y,pid=1
v=0.11.1,time=2024-06-03T10:00:00Z,host=a,user=u,\"cmd=x,y\",pid=1
v=0.11.1,time=yesterday,host=a,user=u,cmd=x
v=0.11.1,time=2024-06-03T10:00:00Z,user=u,cmd=x
v=0.11.1,time=2024-06-03T10:00:00Z,host=a,user=u,cmd=x,gpus=31
v=0.11.1,time=2024-06-03T10:00:00Z,host=a,user=u,cmd=x,cpu%=-1
",
        );
        assert!(data.samples.len() == 1);
        assert!(data.samples[0].cmd.as_str() == "x,y");
        assert!(soft_errors == 5);
        assert!(parse_version(data.samples[0].version.as_str()) == (0, 11, 1));
    }

    struct FailingReader {}

    impl io::Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "Disk on fire"))
        }
    }

    #[test]
    fn test_parse_io_error() {
        let mut r = FailingReader {};
        let e = parse_sample_csv(&mut r, &mut UstrCache::new(), false).err().unwrap();
        assert!(e.downcast_ref::<io::Error>().is_some());
    }
}
