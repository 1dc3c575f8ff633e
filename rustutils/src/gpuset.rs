/// The GpuSet has three states:
///
///  - the set is known to be empty
///  - the set is known to be nonempty and have only known gpus in the set, {a,b,..}
///  - the set is known to be nonempty but have (some) unknown members
///
/// During processing, the set starts out as empty.  If a device reports "unknown" GPUs then the set
/// can transition from empty or nonempty to unknown.  Once in the unknown state, the set will stay
/// in that state.  There is no representation for some known + some unknown GPUs, it is not
/// believed to be worthwhile.
///
/// To conserve space in the Sample we use a 32-bit bitmap for cards 0..30, with bit 31 reserved as
/// the "unknown" marker.  A HashSet would be quite large.
use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuSet(u32);

const UNKNOWN: u32 = 0x8000_0000;
const MAX_GPU: u32 = 30;

impl GpuSet {
    pub const fn empty() -> GpuSet {
        GpuSet(0)
    }

    pub const fn unknown() -> GpuSet {
        GpuSet(UNKNOWN)
    }

    /// Card n alone.  Panics if n is out of range.

    pub fn singleton(n: u32) -> GpuSet {
        assert!(n <= MAX_GPU);
        GpuSet(1 << n)
    }

    /// The raw representation, for storage.

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> GpuSet {
        GpuSet(bits)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    pub fn is_set(&self, n: u32) -> bool {
        !self.is_unknown() && n <= MAX_GPU && (self.0 & (1 << n)) != 0
    }

    /// The number of known cards in the set.  Panics on the unknown set.

    pub fn size(&self) -> usize {
        assert!(!self.is_unknown(), "Size of unknown GpuSet");
        self.0.count_ones() as usize
    }

    // Union one GPU into the set (destructively).  The unknown set stays unknown.
    pub fn adjoin(&mut self, n: u32) {
        assert!(n <= MAX_GPU);
        if !self.is_unknown() {
            self.0 |= 1 << n;
        }
    }

    pub fn union(&self, other: GpuSet) -> GpuSet {
        if self.is_unknown() || other.is_unknown() {
            GpuSet::unknown()
        } else {
            GpuSet(self.0 | other.0)
        }
    }

    /// True if `other` is a subset of `self`, and if `proper` is set, a proper subset.  Nothing is a
    /// subset of or has a subset that is unknown.

    pub fn has_subset(&self, other: GpuSet, proper: bool) -> bool {
        if self.is_unknown() || other.is_unknown() {
            return false;
        }
        if (self.0 & other.0) != other.0 {
            return false;
        }
        !proper || self.0 != other.0
    }

    /// The card indices in ascending order; empty for the unknown set.

    pub fn as_vec(&self) -> Vec<u32> {
        if self.is_unknown() {
            return vec![];
        }
        (0..=MAX_GPU).filter(|n| self.is_set(*n)).collect::<Vec<u32>>()
    }

    /// Parse "unknown", "none", or a comma-separated list of card numbers, from bytes.

    pub fn from_bytes(bs: &[u8]) -> Result<GpuSet> {
        match bs {
            b"unknown" => return Ok(GpuSet::unknown()),
            b"none" => return Ok(GpuSet::empty()),
            _ => {}
        }
        let mut set = GpuSet::empty();
        for elt in bs.split(|c| *c == b',') {
            if elt.is_empty() || !elt.iter().all(|c| c.is_ascii_digit()) {
                bail!("Bad GPU set");
            }
            let mut n = 0u32;
            for c in elt {
                n = n * 10 + (c - b'0') as u32;
                if n > MAX_GPU {
                    bail!("GPU index out of range");
                }
            }
            set.adjoin(n);
        }
        Ok(set)
    }

    /// Parse a base-2 bit vector where bit n denotes card n, as written by very old producers.
    /// Bit 31 can't be set this way.

    pub fn from_bitvector(bs: &[u8]) -> Result<GpuSet> {
        let s = std::str::from_utf8(bs)?;
        let mask = u32::from_str_radix(s, 2)?;
        if mask & UNKNOWN != 0 {
            bail!("GPU index out of range");
        }
        Ok(GpuSet(mask))
    }
}

impl FromStr for GpuSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<GpuSet> {
        GpuSet::from_bytes(s.as_bytes())
    }
}

// For testing, we need a predictable order, so the cards are listed in ascending order.
impl fmt::Display for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("unknown")
        } else if self.is_empty() {
            f.write_str("none")
        } else {
            let mut term = "";
            for x in self.as_vec() {
                write!(f, "{term}{x}")?;
                term = ",";
            }
            Ok(())
        }
    }
}

impl fmt::Debug for GpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuSet({self})")
    }
}

#[test]
fn test_gpuset() {
    assert!(GpuSet::empty().is_empty());
    assert!(GpuSet::default().is_empty());
    assert!(!GpuSet::unknown().is_empty());
    assert!(!GpuSet::singleton(1).is_empty());
    let mut s = GpuSet::unknown();
    s.adjoin(1);
    assert!(s.is_unknown());
    assert!(!s.is_set(1));
    let mut t = GpuSet::singleton(3);
    t.adjoin(30);
    assert!(t.is_set(3) && t.is_set(30) && !t.is_set(0));
    assert!(t.size() == 2);
    assert!(t.as_vec() == vec![3, 30]);
    assert!(t.union(GpuSet::unknown()).is_unknown());
    assert!(GpuSet::unknown().union(t).is_unknown());
    assert!(t.union(GpuSet::singleton(0)).to_string() == "0,3,30");
}

// This tests:
//  - the three textual forms
//  - duplicates and order in the input list do not matter
//  - malformed input and out-of-range cards are errors

#[test]
fn test_gpuset_parse() {
    assert!("unknown".parse::<GpuSet>().unwrap().is_unknown());
    assert!("none".parse::<GpuSet>().unwrap().is_empty());
    assert!("1".parse::<GpuSet>().unwrap() == GpuSet::singleton(1));
    assert!("1,1,1".parse::<GpuSet>().unwrap() == GpuSet::singleton(1));
    let s = GpuSet::from_bytes(b"1,3,2,5,0").unwrap();
    assert!(s.size() == 5);
    assert!(s.as_vec() == vec![0, 1, 2, 3, 5]);
    assert!(s.to_string() == "0,1,2,3,5");
    assert!(GpuSet::unknown().to_string() == "unknown");
    assert!(GpuSet::empty().to_string() == "none");

    assert!("unknownx".parse::<GpuSet>().is_err());
    assert!("".parse::<GpuSet>().is_err());
    assert!("1,".parse::<GpuSet>().is_err());
    assert!("1,x".parse::<GpuSet>().is_err());
    assert!("31".parse::<GpuSet>().is_err());
    assert!("-1".parse::<GpuSet>().is_err());

    assert!(GpuSet::from_bitvector(b"0").unwrap().is_empty());
    assert!(GpuSet::from_bitvector(b"101").unwrap().as_vec() == vec![0, 2]);
    assert!(GpuSet::from_bitvector(b"10000000000000000000000000000000").is_err());
    assert!(GpuSet::from_bitvector(b"12").is_err());
}

#[test]
fn test_gpuset_subset() {
    let s = GpuSet::from_bytes(b"1,3,2,5,0").unwrap();
    let u = GpuSet::from_bytes(b"0,1,2,3,5").unwrap();
    let v = GpuSet::from_bytes(b"1,2,5").unwrap();
    let x = GpuSet::unknown();

    assert!(s == u);
    assert!(x == x);
    assert!(s != v);

    // Equal sets are improper subsets but not proper ones
    assert!(s.has_subset(u, false));
    assert!(u.has_subset(s, false));
    assert!(!s.has_subset(u, true));

    assert!(s.has_subset(v, true));
    assert!(s.has_subset(v, false));
    assert!(!v.has_subset(s, true));
    assert!(!v.has_subset(s, false));

    // Unknown sets are neither subsets nor supersets
    assert!(!s.has_subset(x, true));
    assert!(!s.has_subset(x, false));
    assert!(!x.has_subset(s, true));
    assert!(!x.has_subset(s, false));
}
