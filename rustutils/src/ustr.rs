/// Interned strings ("Ustr").
///
/// A Ustr is a 32-bit handle denoting a string.  Two Ustrs are equal iff the strings they denote
/// are equal, and the empty string is always represented by the handle 0.  The backing table is
/// process-global and append-only, so a handle is never recycled and the string it resolves to
/// lives for the rest of the process.
///
/// The table is a chained hash table behind a reader-writer lock.  Lookups take the read lock;
/// on a miss the write lock is taken, the probe is repeated (somebody else may have won the race),
/// and only then is a copy of the string inserted.
///
/// Parse workers should not hammer the global table for every field of every record, they should
/// go through a `UstrCache`, which is an unsynchronized, per-thread memo in front of the table.
/// Code that allocates Ustrs generically takes a `&mut dyn UstrAllocator`.
use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ustr(u32);

pub const USTR_EMPTY: Ustr = Ustr(0);

impl Ustr {
    /// Intern the bytes, which should be UTF-8.  Invalid UTF-8 is replaced by U+FFFD before
    /// interning.

    pub fn from_bytes(bs: &[u8]) -> Ustr {
        intern_bytes(bs)
    }

    /// The string denoted by the handle.  This is valid for the lifetime of the process.

    pub fn as_str(&self) -> &'static str {
        resolve(*self)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The raw handle value.  Handle order is allocation order, not lexicographic order.

    pub fn handle(&self) -> u32 {
        self.0
    }
}

impl From<&str> for Ustr {
    fn from(s: &str) -> Ustr {
        intern(s)
    }
}

impl From<&String> for Ustr {
    fn from(s: &String) -> Ustr {
        intern(s.as_str())
    }
}

// Ordering is by the denoted strings, so that sorting a vector of Ustr sorts it lexicographically.
// This is consistent with Eq because handles are unique per string.

impl Ord for Ustr {
    fn cmp(&self, other: &Ustr) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else {
            self.as_str().cmp(other.as_str())
        }
    }
}

impl PartialOrd for Ustr {
    fn partial_cmp(&self, other: &Ustr) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Ustr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Ustr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// The hash function for the table.  It operates on bytes only, so a string and its UTF-8 bytes
/// always hash the same.

pub fn hash_bytes(bs: &[u8]) -> u32 {
    let mut h = 0u32;
    for b in bs {
        h = (h << 3) ^ (*b as u32);
    }
    h
}

pub fn hash_str(s: &str) -> u32 {
    hash_bytes(s.as_bytes())
}

const INVERSE_LOAD: usize = 3;
const INITIAL_CAPACITY: usize = 100;

struct Table {
    // Each bucket is a chain of handles; the string for a handle is found in `strings`.
    buckets: Vec<Vec<Ustr>>,
    strings: Vec<&'static str>,
}

impl Table {
    fn new() -> Table {
        let mut t = Table {
            buckets: vec![vec![]; INVERSE_LOAD * INITIAL_CAPACITY],
            strings: Vec::with_capacity(INITIAL_CAPACITY),
        };
        t.insert(hash_str(""), "");
        t
    }

    fn probe(&self, h: u32, s: &str) -> Option<Ustr> {
        self.buckets[h as usize % self.buckets.len()]
            .iter()
            .copied()
            .find(|u| self.strings[u.0 as usize] == s)
    }

    // Pre: s is not in the table.
    fn insert(&mut self, h: u32, s: &str) -> Ustr {
        if self.strings.len() >= self.buckets.len() / INVERSE_LOAD {
            self.grow();
        }
        let u = Ustr(self.strings.len() as u32);
        // The table is never freed, so the copy may as well be 'static.
        let copy: &'static str = Box::leak(s.to_string().into_boxed_str());
        self.strings.push(copy);
        let nbuckets = self.buckets.len();
        self.buckets[h as usize % nbuckets].push(u);
        u
    }

    fn grow(&mut self) {
        let mut buckets = vec![vec![]; self.buckets.len() * 2];
        let nbuckets = buckets.len();
        for (ix, s) in self.strings.iter().enumerate() {
            buckets[hash_str(s) as usize % nbuckets].push(Ustr(ix as u32));
        }
        self.buckets = buckets;
    }
}

static TABLE: Lazy<RwLock<Table>> = Lazy::new(|| RwLock::new(Table::new()));

/// Return the unique handle for `s`, interning a copy of it if necessary.

pub fn intern(s: &str) -> Ustr {
    if s.is_empty() {
        return USTR_EMPTY;
    }
    let h = hash_str(s);
    {
        let table = TABLE.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(u) = table.probe(h, s) {
            return u;
        }
    }
    let mut table = TABLE.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(u) = table.probe(h, s) {
        return u;
    }
    table.insert(h, s)
}

/// Like `intern` but from bytes, without allocating a temporary string for valid UTF-8.

pub fn intern_bytes(bs: &[u8]) -> Ustr {
    match std::str::from_utf8(bs) {
        Ok(s) => intern(s),
        Err(_) => intern(&String::from_utf8_lossy(bs)),
    }
}

/// Resolve a handle.  Panics if the handle was not produced by this table.

pub fn resolve(u: Ustr) -> &'static str {
    let table = TABLE.read().unwrap_or_else(PoisonError::into_inner);
    match table.strings.get(u.0 as usize) {
        Some(s) => s,
        None => panic!("Invalid Ustr {}", u.0),
    }
}

/// Something that can hand out Ustrs.

pub trait UstrAllocator {
    fn alloc(&mut self, s: &str) -> Ustr;
    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr;
}

/// An allocator that goes straight to the global table.

pub struct UstrFacade;

impl UstrAllocator for UstrFacade {
    fn alloc(&mut self, s: &str) -> Ustr {
        intern(s)
    }

    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr {
        intern_bytes(bs)
    }
}

/// An unsynchronized memo in front of the global table, one per worker thread.

#[derive(Default)]
pub struct UstrCache {
    known: HashMap<&'static str, Ustr>,
}

impl UstrCache {
    pub fn new() -> UstrCache {
        UstrCache {
            known: HashMap::new(),
        }
    }
}

impl UstrAllocator for UstrCache {
    fn alloc(&mut self, s: &str) -> Ustr {
        if let Some(u) = self.known.get(s) {
            return *u;
        }
        let u = intern(s);
        self.known.insert(u.as_str(), u);
        u
    }

    fn alloc_bytes(&mut self, bs: &[u8]) -> Ustr {
        match std::str::from_utf8(bs) {
            Ok(s) => self.alloc(s),
            Err(_) => self.alloc(&String::from_utf8_lossy(bs)),
        }
    }
}

#[test]
fn test_ustr_identity() {
    assert!(intern("") == USTR_EMPTY);
    assert!(Ustr::default() == USTR_EMPTY);
    assert!(USTR_EMPTY.as_str() == "");

    let a = intern("hello");
    let b = intern(&"hel".to_string().replace("hel", "hello"));
    let c = intern("world");
    assert!(a == b);
    assert!(a != c);
    assert!(a.as_str() == "hello");
    assert!(c.to_string() == "world");
    assert!(Ustr::from("world") == c);
}

// This tests:
//  - hash consistency between &str and &[u8], including non-ASCII
//  - interning of bytes yields the same handle as interning the string
//  - the cache hands out the same handles as the table

#[test]
fn test_ustr_bytes() {
    for s in ["", "a", "blåbærsyltetøy", "日本語", "x,y=z"] {
        assert!(hash_bytes(s.as_bytes()) == hash_str(s));
        assert!(intern_bytes(s.as_bytes()) == intern(s));
    }
    let mut cache = UstrCache::new();
    let u1 = cache.alloc_bytes("blåbær".as_bytes());
    let u2 = cache.alloc("blåbær");
    assert!(u1 == u2);
    assert!(u1 == UstrFacade.alloc("blåbær"));
    assert!(cache.alloc("") == USTR_EMPTY);
}

#[test]
fn test_ustr_ordering() {
    // Interned in reverse order so that handle order differs from lexicographic order.
    let z = intern("zzz-ordering");
    let a = intern("aaa-ordering");
    let mut v = vec![z, a];
    v.sort();
    assert!(v[0] == a && v[1] == z);
}

#[test]
fn test_ustr_threads() {
    let mut handles = vec![];
    for _ in 0..8 {
        handles.push(std::thread::spawn(|| {
            let mut cache = UstrCache::new();
            (0..1000)
                .map(|i| cache.alloc(&format!("threaded-{i}")))
                .collect::<Vec<Ustr>>()
        }));
    }
    let results = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<Vec<Ustr>>>();
    for r in &results[1..] {
        assert!(*r == results[0]);
    }
    let distinct = results[0]
        .iter()
        .copied()
        .collect::<std::collections::HashSet<Ustr>>();
    assert!(distinct.len() == 1000);
    for (i, u) in results[0].iter().enumerate() {
        assert!(u.as_str() == format!("threaded-{i}"));
    }
}
