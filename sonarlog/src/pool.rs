/// Parse-worker pool.
///
/// A fixed set of threads, each with its own `UstrCache`, reads requests off a shared queue, reads
/// the requested file (from cache or disk) and sends the result back on the channel that came with
/// the request.  A `None` request terminates a worker.  A parser that panics fails only its own
/// request, the worker stays alive.
///
/// A multi-file read interleaves sending requests and receiving results so that neither side can
/// stall the other; see `read_records_from_files`.
use crate::logfile::{LogFile, Payload, ReadSyncMethods, Records};

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use once_cell::sync::Lazy;
use rustutils::UstrCache;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

const REQUEST_QUEUE_SIZE: usize = 100;

struct ParseRequest {
    file: Arc<LogFile>,
    reader: Arc<dyn ReadSyncMethods>,
    verbose: bool,
    results: Sender<ParseResult>,
    id: usize,
}

struct ParseResult {
    id: usize,
    data: Result<(Arc<Payload>, usize)>,
}

pub struct Pool {
    requests: Sender<Option<ParseRequest>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    pub fn new(workers: usize) -> Pool {
        let (requests, queue) = bounded(REQUEST_QUEUE_SIZE);
        let workers = (0..workers.max(1))
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || parse_worker(queue))
            })
            .collect::<Vec<_>>();
        Pool { requests, workers }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.requests.send(None);
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn parse_worker(queue: Receiver<Option<ParseRequest>>) {
    let mut ustrs = UstrCache::new();
    while let Ok(Some(req)) = queue.recv() {
        let data = catch_unwind(AssertUnwindSafe(|| {
            req.file.read_sync(&mut ustrs, req.verbose, req.reader.as_ref())
        }))
        .unwrap_or_else(|_| Err(anyhow!("Panic while parsing {}", req.file.fullname())));
        // The receiver is gone only if the requester panicked.
        let _ = req.results.send(ParseResult { id: req.id, data });
    }
}

static POOL: Lazy<Pool> = Lazy::new(|| {
    let n = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    Pool::new(n)
});

pub(crate) fn global_pool() -> &'static Pool {
    &POOL
}

/// Read the files in parallel and return one blob per file, in the order of `files`, along with
/// the sum of the soft errors.  If any file fails then the result is an error that lists every
/// failure and no data are returned.

pub(crate) fn read_records_from_files<T>(
    pool: &Pool,
    files: &[Arc<LogFile>],
    reader: Arc<dyn ReadSyncMethods>,
    select_records: fn(&Payload) -> &[T],
    verbose: bool,
) -> Result<(Vec<Records<T>>, usize)> {
    let (results, responses) = bounded::<ParseResult>(files.len().max(1));
    let mut blobs: Vec<Option<Records<T>>> = files.iter().map(|_| None).collect();
    let mut soft_errors = 0usize;
    let mut bad = String::new();

    let mut receive = |r: ParseResult| match r.data {
        Ok((payload, soft)) => {
            soft_errors += soft;
            blobs[r.id] = Some(Records::new(payload, select_records));
        }
        Err(e) => {
            bad += &format!("  {e:#}\n");
        }
    };

    let mut next = 0;
    let mut received = 0;
    while received < files.len() {
        if next < files.len() {
            let req = ParseRequest {
                file: files[next].clone(),
                reader: reader.clone(),
                verbose,
                results: results.clone(),
                id: next,
            };
            select! {
                send(pool.requests, Some(req)) -> r => {
                    if r.is_err() {
                        bail!("Parse workers are gone");
                    }
                    next += 1;
                }
                recv(responses) -> r => {
                    let Ok(r) = r else {
                        bail!("Parse workers are gone");
                    };
                    receive(r);
                    received += 1;
                }
            }
        } else {
            let Ok(r) = responses.recv() else {
                bail!("Parse workers are gone");
            };
            receive(r);
            received += 1;
        }
    }

    if !bad.is_empty() {
        bail!("Failed to process one or more files:\n{bad}");
    }
    Ok((blobs.into_iter().flatten().collect(), soft_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::logfile::tests::{select_sacct, LineCounter};
    use crate::logfile::{FileAttr, Fullname, FILE_SLURM_CSV};
    use rustutils::UstrAllocator;
    use std::path::PathBuf;

    // This tests:
    //  - results come back in file order whatever the completion order
    //  - more files than the request queue holds do not stall
    //  - one bad file fails the whole read and is named in the error

    #[test]
    fn test_read_records_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(PathBuf::from(dir.path()));
        let cache = Arc::new(Cache::new(-1));
        let mut files = vec![];
        for i in 0..250 {
            let name = format!("f{i}.csv");
            std::fs::write(dir.path().join(&name), "x\n".repeat(i % 7 + 1)).unwrap();
            files.push(LogFile::with_cache(
                Fullname::new(root.clone(), "", &name),
                FILE_SLURM_CSV,
                cache.clone(),
            ));
        }
        let pool = Pool::new(4);
        let (blobs, soft) =
            read_records_from_files(&pool, &files, Arc::new(LineCounter), select_sacct, false)
                .unwrap();
        assert!(soft == 0);
        assert!(blobs.len() == 250);
        for (i, b) in blobs.iter().enumerate() {
            assert!(b.len() == i % 7 + 1);
        }

        files.push(LogFile::with_cache(
            Fullname::new(root.clone(), "", "missing.csv"),
            FILE_SLURM_CSV,
            cache.clone(),
        ));
        let Err(e) =
            read_records_from_files(&pool, &files, Arc::new(LineCounter), select_sacct, false)
        else {
            panic!("Read should fail");
        };
        let e = e.to_string();
        assert!(e.starts_with("Failed to process one or more files:"));
        assert!(e.contains("missing.csv"));
    }

    struct Exploder;

    impl ReadSyncMethods for Exploder {
        fn is_cacheable(&self) -> bool {
            false
        }

        fn read_data_locked(
            &self,
            _attr: FileAttr,
            input: &mut dyn std::io::Read,
            _ustrs: &mut dyn UstrAllocator,
            _verbose: bool,
        ) -> Result<(Payload, usize)> {
            let mut s = String::new();
            input.read_to_string(&mut s)?;
            if s.contains("boom") {
                panic!("Exploding on {s}");
            }
            Ok((Payload::Sacct(vec![]), 0))
        }

        fn cached_size_of_payload(&self, _payload: &Payload) -> i64 {
            0
        }
    }

    // This tests:
    //  - a parser panic fails the read with the usual error and names the file
    //  - the worker survives and serves the next read

    #[test]
    fn test_parser_panic() {
        let dir = tempfile::tempdir().unwrap();
        let root = Arc::new(PathBuf::from(dir.path()));
        let cache = Arc::new(Cache::new(-1));
        std::fs::write(dir.path().join("good.csv"), "fine\n").unwrap();
        std::fs::write(dir.path().join("bad.csv"), "boom\n").unwrap();
        let good = LogFile::with_cache(
            Fullname::new(root.clone(), "", "good.csv"),
            FILE_SLURM_CSV,
            cache.clone(),
        );
        let bad = LogFile::with_cache(
            Fullname::new(root.clone(), "", "bad.csv"),
            FILE_SLURM_CSV,
            cache.clone(),
        );
        let pool = Pool::new(1);
        let files = vec![good.clone(), bad];
        let reader = Arc::new(Exploder);
        let Err(e) = read_records_from_files(&pool, &files, reader.clone(), select_sacct, false)
        else {
            panic!("Read should fail");
        };
        let e = e.to_string();
        assert!(e.starts_with("Failed to process one or more files:"));
        assert!(e.contains("Panic while parsing") && e.contains("bad.csv"));

        let (blobs, _) =
            read_records_from_files(&pool, &[good], reader, select_sacct, false)
                .unwrap();
        assert!(blobs.len() == 1);
    }

    #[test]
    fn test_empty_read() {
        let pool = Pool::new(1);
        let (blobs, soft) =
            read_records_from_files(&pool, &[], Arc::new(LineCounter), select_sacct, false)
                .unwrap();
        assert!(blobs.is_empty() && soft == 0);
    }
}
