/// The sonar data store: ingest, cache, and query the telemetry that the sonar agent produces on
/// the nodes of a compute cluster.
///
/// Sonar data are stored per cluster in a *data directory*, with a subdirectory per UTC day
/// `yyyy/mm/dd` and within that one file per host and kind of data (process samples, system
/// descriptions) or per cluster (Slurm jobs, Slurm partitions and nodes).  A *persistent cluster*
/// is a data directory open for reading and appending; a *transient cluster* is a fixed list of
/// files open for reading only.  Files are parsed in parallel by a pool of workers and the parsed
/// data are kept in a process-wide cache with a byte budget.
///
/// Sample data represent a set of *sample streams* from a set of running systems.  Each stream
/// represents samples from a single *job artifact* - a single process or a set of processes of the
/// same job id and command name that were rolled up by Sonar.  The stream is uniquely identified by
/// the triple (hostname, id, command), where `id` is either the process ID for non-rolled-up
/// processes or the job ID + JOB_ID_TAG for rolled-up processes (see postprocess.rs for a lot more
/// detail).  There may be multiple job artifacts, and hence multiple sample streams, per job - both
/// on a single host and across hosts.
///
/// This library has as its fundamental task to reconstruct the set of sample streams from the raw
/// data and provide utilities to manipulate that set.  This task breaks down into a number of
/// subtasks:
///
/// - Find data files within the data directory, applying filters by date and host name.
///
/// - Parse the records within the files, handling both the older CSV formats (with or without
///   field names) and the newer JSON formats transparently.  Support for untagged CSV data is
///   opt-in under the feature "untagged_sonar_data".
///
/// - Clean up and filter and bucket the sample data by stream.
///
/// - Merge and fold sample streams, to create complete views of jobs or systems.
mod cache;
mod clusterstore;
mod cluzter;
mod decode;
mod filter;
mod logfile;
mod persistent;
mod pool;
mod postprocess;
mod readers;
mod sacct;
mod sample;
mod samplecsv;
mod samplejson;
mod synthesize;
mod sysinfo;
mod transient;

// The record types.  A Sample is one observation of one process, or a group of rolled-up
// processes, at one point in time.

pub use sample::Sample;
pub use sample::FLAG_HEARTBEAT;
pub use sample::parse_version;

// Per-host side tables carried in sample data: per-CPU load and per-card GPU data, in encoded form.

pub use sample::EncodedGpuData;
pub use sample::EncodedLoadData;
pub use sample::GpuDatum;
pub use sample::LoadDatum;
pub use sample::PerGpuDatum;
pub use sample::GPU_HAS_COMPUTE_MODE;
pub use sample::GPU_HAS_FAILING;
pub use sample::GPU_HAS_UTIL;
pub use sample::GPU_HAS_UUID;

// Decode the side tables.

pub use decode::decode_gpu_data;
pub use decode::decode_load_data;

// Slurm job records.

pub use sacct::SacctInfo;

// System descriptions, per node and per GPU card.

pub use sysinfo::SysinfoCardData;
pub use sysinfo::SysinfoData;
pub use sysinfo::SysinfoGpuCard;
pub use sysinfo::SysinfoNodeData;

// Slurm cluster descriptions: partitions and node states.

pub use cluzter::ClusterNodes;
pub use cluzter::ClusterPartition;
pub use cluzter::CluzterAttributes;
pub use cluzter::CluzterData;
pub use cluzter::CluzterNodes;
pub use cluzter::CluzterPartitions;

// Parsers for the individual file formats.  Each takes a reader and a Ustr allocator and returns
// the records along with a count of soft errors (records that were skipped or repaired).

pub use samplecsv::parse_sample_csv;
pub use samplecsv::SampleData;
pub use samplejson::parse_sample_v0_json;
pub use sacct::parse_alloc_tres;
pub use sacct::parse_sacct_csv;
pub use sacct::parse_sacct_v0_json;
pub use sysinfo::parse_sysinfo_old_json;
pub use sysinfo::parse_sysinfo_v0_json;
pub use cluzter::parse_cluzter_v0_json;

// File kinds and attributes, for appending data.

pub use logfile::FileAttr;
pub use logfile::FILE_APPENDABLE;
pub use logfile::FILE_CLUZTER_V0_JSON;
pub use logfile::FILE_SAMPLE_CSV;
pub use logfile::FILE_SAMPLE_V0_JSON;
pub use logfile::FILE_SLURM_CSV;
pub use logfile::FILE_SLURM_V0_JSON;
pub use logfile::FILE_SYSINFO_OLD_JSON;
pub use logfile::FILE_SYSINFO_V0_JSON;

// A read returns one Records<T> per file: a cheap shared view of the (possibly cached) parsed
// contents of the file, dereferencing to &[T].

pub use logfile::Payload;
pub use logfile::Records;

// Set the byte budget of the global cache.  A negative budget disables caching.

pub use cache::cache_init;

// The interface to an open cluster, and the two kinds of cluster.

pub use clusterstore::Cluster;
pub use persistent::PersistentCluster;
pub use transient::TransientCluster;

// Errors that callers may want to test for.

pub use clusterstore::StoreError;

// Open and close clusters in the process-wide registry.

pub use clusterstore::close;
pub use clusterstore::open_persistent_cluster;
pub use clusterstore::open_transient_cluster;

// The rectifier that is applied to sample data as they are read, before caching.

pub use readers::rectify_cluster_name;
pub use readers::SampleRectifier;

// A filter for sample records, and its compiled form.

pub use filter::CompiledFilter;
pub use filter::SampleFilter;

// Postprocess a set of sample records: bucket them by stream, sort and deduplicate the streams,
// compute the cpu_util_pct field, clean up the GPU memory data, and apply a record filter.

pub use postprocess::postprocess_samples; // -> (InputStreamSet, Timebounds)
pub use postprocess::stream_id;
pub use postprocess::JOB_ID_TAG;

// A datum representing a key in the map of sample streams: (hostname, stream-id, command).

pub use postprocess::InputStreamKey;
pub use postprocess::InputStreamSet;
pub use postprocess::SampleStream;

// Map from host name to (earliest, latest) time for host.

pub use postprocess::Timebound;
pub use postprocess::Timebounds;

// Decode the side tables and bucket them per host, sorted by time.

pub use postprocess::rectify_gpu_data;
pub use postprocess::rectify_load_data;
pub use postprocess::DecodedGpuDatum;
pub use postprocess::DecodedLoadDatum;
pub use postprocess::GpuDataSet;
pub use postprocess::LoadDataSet;

// Given a set of sample streams, merge by host and job and return a vector of the merged streams.

pub use synthesize::merge_by_host_and_job; // -> MergedSampleStreams

// Given a set of sample streams, merge by job (across hosts) and return a vector of the merged
// streams.

pub use synthesize::merge_by_job; // -> (MergedSampleStreams, Timebounds)

// Given a set of sample streams, merge by host (across jobs) and return a vector of the merged
// streams.

pub use synthesize::merge_by_host; // -> MergedSampleStreams

// Given a set of already-merged streams, where each stream pertains to one host and all hosts are
// different, merge by timeslot to create cross-host cross-job data.

pub use synthesize::merge_across_hosts_by_time;

// Merge a set of streams into one synthesized stream.

pub use synthesize::merge_streams;

// Bucket samples in a single stream by various time quantities and compute averages.

pub use synthesize::fold_samples_daily;
pub use synthesize::fold_samples_half_daily;
pub use synthesize::fold_samples_half_hourly;
pub use synthesize::fold_samples_hourly;
pub use synthesize::fold_samples_weekly;

// A datum representing a bag of merged streams, with no implied constraints on uniqueness of any
// type of key or any ordering.

pub use synthesize::MergedSampleStreams;
