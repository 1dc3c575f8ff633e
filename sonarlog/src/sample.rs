/// Process samples and the per-host side tables that travel with them.
///
/// Space is at a premium here because we hold very many of these structures in memory at the same
/// time, and more are held in the cache for subsequent queries.  Hence:
///
/// - all fields are plain values, so a Sample is `Copy` and can be shared freely across threads
///   once published
/// - strings are interned `Ustr`s, which take 4 bytes
/// - the timestamp is Unix seconds, we always assume UTC
/// - fields are ordered largest-to-smallest and the layout is fixed, to pack the structure
///
/// After ingestion and the initial corrections made by postprocessing a Sample is strictly
/// read-only.
use rustutils::{GpuSet, Ustr};

/// Sample::flags bit: the record is a heartbeat, not an observation of a process.

pub const FLAG_HEARTBEAT: u8 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct Sample {
    /// The time is common to all records created by the same sonar invocation.  It has no subsecond
    /// precision.
    pub timestamp: i64,

    /// Total memory installed on the node, or zero if there's no information.
    pub memtotal_kib: u64,

    /// Virtual memory used by the process at the time of sampling, data+stack.
    pub cpu_kib: u64,

    /// Resident memory owned exclusively by the process.  RssAnon is not a perfect measure of that,
    /// but a compromise; see comments in Sonar.
    pub rssanon_kib: u64,

    /// GPU memory used by the process, across all the cards in `gpus`.  May be corrected by
    /// postprocessing if the host config says the producer reports percentages.
    pub gpu_kib: u64,

    /// Accumulated CPU time for the process since the start, including time for any of its children
    /// that have terminated.
    pub cputime_sec: u64,

    /// Producer version, "major.minor.bugfix".  "0.6.0" for untagged data and "0.0.0" for
    /// synthesized data.
    pub version: Ustr,

    pub cluster: Ustr,
    pub hostname: Ustr,

    /// Number of cores on the node, or zero if there's no information.
    pub cores: u32,

    /// Unix user name, or `_zombie_<PID>`
    pub user: Ustr,

    pub job: u32,
    pub pid: u32,
    pub ppid: u32,

    /// The command contains at least the executable name.  For merged records, this is either a
    /// comma-joined sorted list of the command names of the original records, or "_merged_".
    pub cmd: Ustr,

    /// Running average of the CPU usage of the process over its lifetime.  IT IS NOT A SAMPLE.
    /// 100.0 = one core's worth.  `cpu_util_pct` is usually more useful.
    pub cpu_pct: f32,

    pub gpus: GpuSet,

    /// Percent of the capacity of the cards in `gpus`, 100.0 = one card's worth.
    pub gpu_pct: f32,

    /// GPU memory in use as a percentage of one card's memory, summed across cards.
    pub gpumem_pct: f32,

    /// Number of *other* processes (same host, same command) rolled up into this one.
    pub rolledup: u32,

    /// Computed by postprocessing: CPU utilization since the previous sample in the stream, 100.0
    /// = one core.  For the first sample in a stream, and for producers that do not report
    /// `cputime_sec`, this is `cpu_pct`.
    pub cpu_util_pct: f32,

    /// Nonzero if the producer observed a GPU failure.
    pub gpu_fail: u8,

    pub flags: u8,
}

impl Sample {
    pub fn is_heartbeat(&self) -> bool {
        (self.flags & FLAG_HEARTBEAT) != 0
    }
}

/// Parse a version string "major.minor.bugfix".  Missing or malformed components are zero.  Avoid
/// allocation here, we parse *a lot* of these.

pub fn parse_version(v: &str) -> (u16, u16, u16) {
    let mut parts = v.split('.').map(|x| x.parse::<u16>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let bugfix = parts.next().unwrap_or(0);
    (major, minor, bugfix)
}

/// The per-CPU load of a host at a point in time.  Older producers send this as a base-45
/// delta-encoded string that we keep verbatim until somebody needs it; newer producers send the
/// values.

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedLoadData {
    Base45(Vec<u8>),
    Values(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadDatum {
    pub timestamp: i64,
    pub hostname: Ustr,
    pub encoded: EncodedLoadData,
}

/// Per-card data for the cards on a host at a point in time.  Older producers send this as a
/// compact CSV-ish string, newer producers send structured data.

#[derive(Debug, Clone, PartialEq)]
pub enum EncodedGpuData {
    Csv(Vec<u8>),
    Values(Vec<PerGpuDatum>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuDatum {
    pub timestamp: i64,
    pub hostname: Ustr,
    pub encoded: EncodedGpuData,
}

/// Sample data for one card.  The fields that are not reported by the producer are zero, `attr`
/// says which optional groups were present.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerGpuDatum {
    pub attr: u32,
    pub index: u32,
    pub uuid: String,
    pub fan_pct: u64,
    pub compute_mode: String,
    pub perf_state: i64,
    pub mem_kib: u64,
    pub ce_util_pct: u64,
    pub mem_util_pct: u64,
    pub temp_c: i64,
    pub power_w: u64,
    pub power_limit_w: u64,
    pub ce_clock_mhz: u64,
    pub mem_clock_mhz: u64,
    pub failing: u64,
}

// PerGpuDatum::attr bits.

pub const GPU_HAS_UUID: u32 = 1;
pub const GPU_HAS_COMPUTE_MODE: u32 = 2;
pub const GPU_HAS_UTIL: u32 = 4;
pub const GPU_HAS_FAILING: u32 = 8;

#[test]
fn test_sample_layout() {
    // Six 8-byte fields, fifteen 4-byte fields, two bytes, padded to 8.
    assert!(std::mem::size_of::<Sample>() == 112);
    let s = Sample::default();
    assert!(s.hostname.is_empty() && s.gpus.is_empty() && !s.is_heartbeat());
}

#[test]
fn test_parse_version() {
    assert!(parse_version("0.11.1") == (0, 11, 1));
    assert!(parse_version("1.2") == (1, 2, 0));
    assert!(parse_version("") == (0, 0, 0));
    assert!(parse_version("0.x.3") == (0, 0, 3));
}
