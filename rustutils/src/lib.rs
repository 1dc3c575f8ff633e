// Utilities that are not specific to the sample store: interned strings, the CSV tokenizer and the
// byte-slice number parsers it feeds, time handling, GPU sets, host name patterns, and the cluster
// configuration.

mod configs;
mod csv;
mod dates;
mod gpuset;
mod hostglob;
mod numeric;
mod ustr;

// A structure representing the configuration of one host, and the set of those for a cluster.

pub use configs::ClusterConfig;
pub use configs::System;

// Read a cluster configuration from a file.

pub use configs::read_cluster_config;

// Fast, non-allocating, flexible CSV parser.

pub use csv::CsvSyntaxError;
pub use csv::CsvToken;
pub use csv::CsvTokenizer;
pub use csv::CSV_EQ_SENTINEL;

// Number and time parsers on the tokenizer's byte slices.

pub use numeric::parse_float;
pub use numeric::parse_rfc3339;
pub use numeric::parse_slurm_bytes;
pub use numeric::parse_slurm_elapsed32;
pub use numeric::parse_slurm_elapsed64;
pub use numeric::parse_uint32;
pub use numeric::parse_uint64;
pub use numeric::parse_uint8;

// Types and utilities for manipulating timestamps.

pub use dates::Timestamp;

// "A long long time ago".

pub use dates::epoch;

// The time right now.

pub use dates::now;

// A time that should not be in any sample record.

pub use dates::far_future;

// Parse a &str into a Timestamp.

pub use dates::parse_timestamp;

// Construct Timestamps.

pub use dates::timestamp_from_unix;
pub use dates::timestamp_from_ymd;
pub use dates::timestamp_from_ymdhms;

// Midnight at the start of the day, and the smallest midnight not before the time.

pub use dates::roundup_day;
pub use dates::this_day;

// The days between two times, inclusive.

pub use dates::date_range;

// Truncate Unix-seconds times to the start of the period.

pub use dates::truncate_to_day;
pub use dates::truncate_to_half_day;
pub use dates::truncate_to_half_hour;
pub use dates::truncate_to_hour;
pub use dates::truncate_to_week;

// Step Unix-seconds times by one period.

pub use dates::add_day;
pub use dates::add_half_day;
pub use dates::add_half_hour;
pub use dates::add_hour;
pub use dates::add_week;

// A GpuSet is empty, unknown, or a set of card indices.

pub use gpuset::GpuSet;

// Structure representing a host name filter: basically a restricted automaton matching host names
// in useful ways.

pub use hostglob::HostGlobber;

// Formatter and expander for sets of host names.

pub use hostglob::compress_hostnames;
pub use hostglob::expand_pattern;

// Interned strings.

pub use ustr::Ustr;
pub use ustr::USTR_EMPTY;

// The interner's hash function, exposed so that its agreement between bytes and strings can be
// relied on.

pub use ustr::hash_bytes;
pub use ustr::hash_str;

// Intern and resolve through the global table.

pub use ustr::intern;
pub use ustr::intern_bytes;
pub use ustr::resolve;

// Allocators of Ustrs: straight to the table, or through a per-thread memo.

pub use ustr::UstrAllocator;
pub use ustr::UstrCache;
pub use ustr::UstrFacade;
