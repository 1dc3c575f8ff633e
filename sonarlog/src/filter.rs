/// Sample record filter.  This is performance-sensitive, it is applied to every sample read.
///
/// A `SampleFilter` is a plain description of the records to keep; `SampleFilter::matches` is the
/// straightforward conjunction of its parts.  `compile` turns it into a `CompiledFilter`, a small
/// bytecode program with one instruction per active test, which is what queries should use.
///
/// Instructions are u64: the opcode is in the low 5 bits and the operand, if any, in the high 32.
/// Sets with a single element compile to a comparison against the operand; larger sets are looked
/// up in the filter's own sets.  The tests are ordered roughly from most to least discriminating.
/// The time test passes for almost every record (the files were selected by date) and is applied
/// last, outside the dispatch loop.
///
/// The filter is immutable once compiled and is shared freely between threads.
use crate::sample::Sample;

use rustutils::{ClusterConfig, HostGlobber, Ustr};
use std::collections::HashSet;
use std::sync::Arc;

/// Empty include sets mean "everything".  `from` and `to` are inclusive Unix times.

#[derive(Debug, Default)]
pub struct SampleFilter {
    pub include_users: HashSet<Ustr>,
    pub include_hosts: Option<HostGlobber>,
    pub include_jobs: HashSet<u32>,
    pub include_commands: HashSet<Ustr>,
    pub exclude_users: HashSet<Ustr>,
    pub exclude_jobs: HashSet<u32>,
    pub exclude_commands: HashSet<Ustr>,
    pub min_pid: u32,
    pub from: i64,
    pub to: i64,
}

impl SampleFilter {
    /// A filter that accepts everything.

    pub fn new() -> SampleFilter {
        SampleFilter {
            to: i64::MAX,
            ..Default::default()
        }
    }

    /// Add the users the cluster configuration says should always be excluded.

    pub fn exclude_configured_users(&mut self, cfg: &ClusterConfig) {
        for u in &cfg.exclude_user {
            self.exclude_users.insert(Ustr::from(u.as_str()));
        }
    }

    pub fn matches(&self, e: &Sample) -> bool {
        (self.include_users.is_empty() || self.include_users.contains(&e.user))
            && self
                .include_hosts
                .as_ref()
                .map_or(true, |h| h.is_empty() || h.match_hostname(e.hostname.as_str()))
            && (self.include_jobs.is_empty() || self.include_jobs.contains(&e.job))
            && (self.include_commands.is_empty() || self.include_commands.contains(&e.cmd))
            && !self.exclude_users.contains(&e.user)
            && !self.exclude_jobs.contains(&e.job)
            && !self.exclude_commands.contains(&e.cmd)
            && e.pid >= self.min_pid
            && self.from <= e.timestamp
            && e.timestamp <= self.to
    }

    pub fn compile(self) -> CompiledFilter {
        let mut program = vec![];
        emit_set(&mut program, &self.include_jobs, |j| *j, INCLUDE_SINGLE_JOB, INCLUDE_JOBS);
        emit_set(
            &mut program,
            &self.include_users,
            |u| u.handle(),
            INCLUDE_SINGLE_USER,
            INCLUDE_USERS,
        );
        if self.include_hosts.as_ref().is_some_and(|h| !h.is_empty()) {
            program.push(INCLUDE_HOSTS);
        }
        emit_set(
            &mut program,
            &self.include_commands,
            |c| c.handle(),
            INCLUDE_SINGLE_COMMAND,
            INCLUDE_COMMANDS,
        );
        emit_set(
            &mut program,
            &self.exclude_users,
            |u| u.handle(),
            EXCLUDE_SINGLE_USER,
            EXCLUDE_USERS,
        );
        emit_set(&mut program, &self.exclude_jobs, |j| *j, EXCLUDE_SINGLE_JOB, EXCLUDE_JOBS);
        emit_set(
            &mut program,
            &self.exclude_commands,
            |c| c.handle(),
            EXCLUDE_SINGLE_COMMAND,
            EXCLUDE_COMMANDS,
        );
        if self.min_pid > 0 {
            program.push(EXCLUDE_LOW_PIDS | operand(self.min_pid));
        }
        CompiledFilter {
            program,
            filter: Arc::new(self),
        }
    }
}

const INCLUDE_SINGLE_JOB: u64 = 0;
const INCLUDE_JOBS: u64 = 1;
const INCLUDE_SINGLE_USER: u64 = 2;
const INCLUDE_USERS: u64 = 3;
const INCLUDE_HOSTS: u64 = 4;
const INCLUDE_SINGLE_COMMAND: u64 = 5;
const INCLUDE_COMMANDS: u64 = 6;
const EXCLUDE_SINGLE_USER: u64 = 7;
const EXCLUDE_USERS: u64 = 8;
const EXCLUDE_SINGLE_JOB: u64 = 9;
const EXCLUDE_JOBS: u64 = 10;
const EXCLUDE_SINGLE_COMMAND: u64 = 11;
const EXCLUDE_COMMANDS: u64 = 12;
const EXCLUDE_LOW_PIDS: u64 = 13;

const OP_MASK: u64 = 31;
const OP_SHIFT: u32 = 32;

fn operand(x: u32) -> u64 {
    (x as u64) << OP_SHIFT
}

fn emit_set<T>(
    program: &mut Vec<u64>,
    set: &HashSet<T>,
    encode: fn(&T) -> u32,
    single: u64,
    many: u64,
) {
    let mut it = set.iter();
    match (it.next(), it.next()) {
        (None, _) => {}
        (Some(x), None) => program.push(single | operand(encode(x))),
        _ => program.push(many),
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    program: Vec<u64>,
    filter: Arc<SampleFilter>,
}

impl CompiledFilter {
    pub fn matches(&self, e: &Sample) -> bool {
        let f = &self.filter;
        for &op in &self.program {
            let arg = (op >> OP_SHIFT) as u32;
            let pass = match op & OP_MASK {
                INCLUDE_SINGLE_JOB => e.job == arg,
                INCLUDE_JOBS => f.include_jobs.contains(&e.job),
                INCLUDE_SINGLE_USER => e.user.handle() == arg,
                INCLUDE_USERS => f.include_users.contains(&e.user),
                INCLUDE_HOSTS => f
                    .include_hosts
                    .as_ref()
                    .map_or(true, |h| h.match_hostname(e.hostname.as_str())),
                INCLUDE_SINGLE_COMMAND => e.cmd.handle() == arg,
                INCLUDE_COMMANDS => f.include_commands.contains(&e.cmd),
                EXCLUDE_SINGLE_USER => e.user.handle() != arg,
                EXCLUDE_USERS => !f.exclude_users.contains(&e.user),
                EXCLUDE_SINGLE_JOB => e.job != arg,
                EXCLUDE_JOBS => !f.exclude_jobs.contains(&e.job),
                EXCLUDE_SINGLE_COMMAND => e.cmd.handle() != arg,
                EXCLUDE_COMMANDS => !f.exclude_commands.contains(&e.cmd),
                EXCLUDE_LOW_PIDS => e.pid >= arg,
                _ => panic!("Bad filter opcode"),
            };
            if !pass {
                return false;
            }
        }
        f.from <= e.timestamp && e.timestamp <= f.to
    }

    pub fn filter(&self) -> &SampleFilter {
        &self.filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustutils::intern;

    fn sample(t: i64, host: &str, user: &str, job: u32, pid: u32, cmd: &str) -> Sample {
        Sample {
            timestamp: t,
            hostname: intern(host),
            user: intern(user),
            job,
            pid,
            cmd: intern(cmd),
            ..Default::default()
        }
    }

    fn users(xs: &[&str]) -> HashSet<Ustr> {
        xs.iter().map(|x| intern(x)).collect()
    }

    fn jobs(xs: &[u32]) -> HashSet<u32> {
        xs.iter().copied().collect()
    }

    fn hosts(xs: &[&str]) -> Option<HostGlobber> {
        if xs.is_empty() {
            return None;
        }
        let mut h = HostGlobber::new(true);
        for x in xs {
            h.insert(x).unwrap();
        }
        Some(h)
    }

    // Filters with every combination of empty, single and multiple sets in every position.
    fn filters() -> Vec<SampleFilter> {
        let user_sets: [&[&str]; 3] = [&[], &["alice"], &["alice", "bob"]];
        let job_sets: [&[u32]; 3] = [&[], &[7], &[7, 8]];
        let cmd_sets: [&[&str]; 3] = [&[], &["python"], &["python", "bash"]];
        let host_sets: [&[&str]; 2] = [&[], &["c1-[1-2]"]];
        let mut result = vec![];
        for (i, u) in user_sets.iter().enumerate() {
            for (j, jb) in job_sets.iter().enumerate() {
                for (k, c) in cmd_sets.iter().enumerate() {
                    for h in host_sets {
                        let mut f = SampleFilter::new();
                        f.include_users = users(u);
                        f.include_jobs = jobs(jb);
                        f.include_commands = users(c);
                        f.include_hosts = hosts(h);
                        // Rotate the sets so that includes and excludes differ
                        f.exclude_users = users(user_sets[(i + 1) % 3]);
                        f.exclude_jobs = jobs(job_sets[(j + 2) % 3]);
                        f.exclude_commands = users(cmd_sets[(k + 1) % 3]);
                        f.min_pid = (i * 500) as u32;
                        if k == 2 {
                            f.from = 150;
                            f.to = 250;
                        }
                        result.push(f);
                    }
                }
            }
        }
        result
    }

    fn samples() -> Vec<Sample> {
        let mut result = vec![];
        for t in [100, 200, 300] {
            for host in ["c1-1", "c1-3"] {
                for user in ["alice", "bob", "carol"] {
                    for job in [7, 8, 9] {
                        for cmd in ["python", "bash", "vim"] {
                            for pid in [10, 1000] {
                                result.push(sample(t, host, user, job, pid, cmd));
                            }
                        }
                    }
                }
            }
        }
        result
    }

    #[test]
    fn test_compiled_equals_conjunction() {
        let samples = samples();
        for f in filters() {
            let expected = samples.iter().map(|s| f.matches(s)).collect::<Vec<bool>>();
            let c = f.compile();
            for (s, e) in samples.iter().zip(expected) {
                assert!(c.matches(s) == e, "{:?} {:?}", c.filter(), s);
            }
        }
    }

    #[test]
    fn test_compile() {
        let c = SampleFilter::new().compile();
        assert!(c.program.is_empty());
        assert!(c.matches(&sample(0, "a", "b", 0, 0, "c")));

        let mut f = SampleFilter::new();
        f.include_jobs = jobs(&[7]);
        f.exclude_commands = users(&["_heartbeat_", "bash"]);
        f.min_pid = 1000;
        let c = f.compile();
        assert!(
            c.program
                == vec![
                    INCLUDE_SINGLE_JOB | (7 << 32),
                    EXCLUDE_COMMANDS,
                    EXCLUDE_LOW_PIDS | (1000 << 32)
                ]
        );
        assert!(c.matches(&sample(5, "a", "b", 7, 1000, "python")));
        assert!(!c.matches(&sample(5, "a", "b", 7, 1000, "_heartbeat_")));
        assert!(!c.matches(&sample(5, "a", "b", 7, 999, "python")));
        assert!(!c.matches(&sample(5, "a", "b", 8, 1000, "python")));
    }

    #[test]
    fn test_configured_exclusions() {
        let mut cfg = ClusterConfig::new("x");
        cfg.exclude_user = vec!["root".to_string(), "zabbix".to_string()];
        let mut f = SampleFilter::new();
        f.exclude_configured_users(&cfg);
        let c = f.compile();
        assert!(!c.matches(&sample(5, "a", "zabbix", 7, 1000, "python")));
        assert!(c.matches(&sample(5, "a", "alice", 7, 1000, "python")));
    }
}
