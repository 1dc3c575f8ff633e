/// Matcher, expander and compressor for host names.
///
/// The host name pattern grammar:
///
///   pattern ::= element ("." element)*
///   element ::= (literal | range)+ "*"?
///   literal ::= a nonempty run of characters other than '[', ']', ',', '*', '.'
///   range ::= "[" range-elt ("," range-elt)* "]"
///   range-elt ::= number | number "-" number
///
/// A range denotes each of its numbers in turn; in `A-B`, A must be no greater than B.  A trailing
/// `*` in an element matches any run of characters that does not contain a `.`.
///
/// A `HostGlobber` can be a prefix matcher, in which case a pattern with fewer elements than the host
/// name matches the leading elements of the name: `ml8` matches `ml8.hpc.uio.no`.
use crate::Ustr;

use anyhow::{bail, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

// Limits on the size of the generated matchers.
const MAX_RANGE: usize = 10000;
const MAX_REGEX: usize = 50000;

pub struct HostGlobber {
    is_prefix_matcher: bool,

    // Matcher + source pattern, for posterity.
    matchers: Vec<(Regex, String)>,
}

impl HostGlobber {
    pub fn new(is_prefix_matcher: bool) -> HostGlobber {
        HostGlobber {
            is_prefix_matcher,
            matchers: vec![],
        }
    }

    /// Add the pattern to the set of patterns in the matcher.

    pub fn insert(&mut self, pattern: &str) -> Result<()> {
        let r = compile_globber(pattern, self.is_prefix_matcher)?;
        self.matchers.push((Regex::new(&r)?, pattern.to_string()));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// The source patterns, in insertion order.

    pub fn patterns(&self) -> Vec<&str> {
        self.matchers.iter().map(|(_, p)| p.as_str()).collect::<Vec<&str>>()
    }

    /// Match s against the patterns and return true iff it matches at least one pattern.

    pub fn match_hostname(&self, s: &str) -> bool {
        self.matchers.iter().any(|(re, _)| re.is_match(s))
    }
}

impl fmt::Debug for HostGlobber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostGlobber({})", self.patterns().join(","))
    }
}

// A pattern after lexing: literal runs, number sets from brackets, the element separator, and the
// wildcard.
#[derive(Debug, PartialEq)]
enum Piece {
    Lit(String),
    Set(Vec<u32>),
    Dot,
    Star,
}

fn lex_pattern(p: &str) -> Result<Vec<Piece>> {
    let cs = p.chars().collect::<Vec<char>>();
    let mut pieces = vec![];
    let mut lit = String::new();
    let mut i = 0;
    while i < cs.len() {
        let c = cs[i];
        i += 1;
        if c != '[' && c != '.' && c != '*' {
            if c == ']' || c == ',' {
                bail!("Unexpected '{c}' in host pattern");
            }
            lit.push(c);
            continue;
        }
        if !lit.is_empty() {
            pieces.push(Piece::Lit(std::mem::take(&mut lit)));
        }
        match c {
            '.' => pieces.push(Piece::Dot),
            '*' => {
                if i < cs.len() && cs[i] != '.' {
                    bail!("Wildcard must end the host element");
                }
                pieces.push(Piece::Star)
            }
            _ => {
                let mut set = vec![];
                loop {
                    let (lo, next) = read_int(&cs, i)?;
                    i = next;
                    let mut hi = lo;
                    if i < cs.len() && cs[i] == '-' {
                        (hi, i) = read_int(&cs, i + 1)?;
                        if lo > hi {
                            bail!("Invalid range");
                        }
                    }
                    for n in lo..=hi {
                        set.push(n);
                        if set.len() > MAX_RANGE {
                            bail!("Range too large, use more '*'");
                        }
                    }
                    match cs.get(i) {
                        Some(']') => {
                            i += 1;
                            break;
                        }
                        Some(',') => i += 1,
                        _ => bail!("Expected ',' or ']'"),
                    }
                }
                pieces.push(Piece::Set(set));
            }
        }
    }
    if !lit.is_empty() {
        pieces.push(Piece::Lit(lit));
    }
    Ok(pieces)
}

fn read_int(cs: &[char], mut i: usize) -> Result<(u32, usize)> {
    let first = i;
    let mut n = 0u64;
    while i < cs.len() && cs[i].is_ascii_digit() {
        n = n * 10 + (cs[i] as u64 - '0' as u64);
        if n > u32::MAX as u64 {
            bail!("Number out of range in glob set");
        }
        i += 1;
    }
    if i == first {
        bail!("Invalid number in glob set");
    }
    Ok((n as u32, i))
}

fn compile_globber(p: &str, prefix: bool) -> Result<String> {
    let mut r = "^".to_string();
    for piece in lex_pattern(p)? {
        match piece {
            Piece::Lit(s) => r += &regex::escape(&s),
            Piece::Set(ns) => {
                r += "(?:";
                r += &ns.iter().map(|n| n.to_string()).collect::<Vec<String>>().join("|");
                r += ")";
            }
            Piece::Dot => r += "\\.",
            Piece::Star => r += "[^.]*",
        }
        if r.len() > MAX_REGEX {
            bail!("Expression too large, use more '*'")
        }
    }
    if prefix {
        // The pattern must match whole host elements, so after the prefix there is either the end
        // or a `.` and the remaining elements.
        r += "(?:\\..*)?$"
    } else {
        r += "$";
    }
    Ok(r)
}

/// Expand a single pattern into the list of host names it denotes.  The pattern must not contain
/// wildcards.

pub fn expand_pattern(p: &str) -> Result<Vec<String>> {
    let mut result = vec!["".to_string()];
    for piece in lex_pattern(p)? {
        match piece {
            Piece::Lit(s) => result.iter_mut().for_each(|r| r.push_str(&s)),
            Piece::Dot => result.iter_mut().for_each(|r| r.push('.')),
            Piece::Star => bail!("Suffix wildcard not allowed in expandable hostname"),
            Piece::Set(ns) => {
                result = result
                    .iter()
                    .flat_map(|r| ns.iter().map(move |n| format!("{r}{n}")))
                    .collect::<Vec<String>>();
            }
        }
    }
    Ok(result)
}

/// Take a list of host names and return a list of patterns s.t. the expansion of those patterns is
/// the original set of names.
///
/// Names a1.b.c and a2.b.c become a[1,2].b.c: numbers at the end of the first element are combined
/// for names whose first elements have the same non-numeric stem and whose remaining elements are
/// equal.  This fits the typical naming of compute nodes, <name>-<number> or <name><number>.  The
/// output is ordered by the remaining elements first and the first element second.

pub fn compress_hostnames(hosts: &[Ustr]) -> Vec<String> {
    // (tail, stem) -> numbers, for combinable names; (tail, first) -> () for the rest.
    let mut groups: BTreeMap<(&str, &str), Vec<u32>> = BTreeMap::new();
    let mut singles: BTreeMap<(&str, &str), ()> = BTreeMap::new();
    for h in hosts {
        let s = h.as_str();
        let (first, tail) = match s.find('.') {
            Some(ix) => (&s[..ix], &s[ix..]),
            None => (s, ""),
        };
        match split_number(first) {
            Some((stem, n)) => groups.entry((tail, stem)).or_default().push(n),
            None => {
                singles.insert((tail, first), ());
            }
        }
    }

    let mut results = vec![];
    for ((tail, stem), mut ns) in groups {
        ns.sort();
        ns.dedup();
        let first = if ns.len() == 1 {
            format!("{stem}{}", ns[0])
        } else {
            format!("{stem}[{}]", compress_range(&ns))
        };
        results.push((tail, first));
    }
    results.extend(singles.into_keys().map(|(tail, first)| (tail, first.to_string())));
    results.sort();
    results
        .into_iter()
        .map(|(tail, first)| first + tail)
        .collect::<Vec<String>>()
}

// Split "a-12" into ("a-", 12).  The stem must be nonempty, the number nonempty, and the number
// must not have a leading zero (it would not survive the round trip).
fn split_number(s: &str) -> Option<(&str, u32)> {
    let ix = s.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if ix == 0 || ix == s.len() {
        return None;
    }
    let digits = &s[ix..];
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse::<u32>().ok().map(|n| (&s[..ix], n))
}

// The input is sorted and deduplicated.
fn compress_range(ns: &[u32]) -> String {
    let mut parts = vec![];
    let mut k = 0;
    while k < ns.len() {
        let mut m = k + 1;
        while m < ns.len() && ns[m] == ns[m - 1] + 1 {
            m += 1;
        }
        if m == k + 1 {
            parts.push(ns[k].to_string());
        } else {
            parts.push(format!("{}-{}", ns[k], ns[m - 1]));
        }
        k = m;
    }
    parts.join(",")
}

#[test]
fn test_hostfilter1() {
    let mut hf = HostGlobber::new(true);
    hf.insert("ml8").unwrap();
    hf.insert("ml3.hpc").unwrap();

    // Single-element prefix match against this
    assert!(hf.match_hostname("ml8.hpc.uio.no"));

    // Multi-element prefix match against this
    assert!(hf.match_hostname("ml3.hpc.uio.no"));

    // Prefixes match whole elements only
    assert!(!hf.match_hostname("ml80.hpc.uio.no"));
    assert!(hf.patterns() == vec!["ml8", "ml3.hpc"]);

    let mut hf = HostGlobber::new(false);
    hf.insert("ml4.hpc.uio.no").unwrap();

    // Exhaustive match against this
    assert!(hf.match_hostname("ml4.hpc.uio.no"));
    assert!(!hf.match_hostname("ml4.hpc.uio.no.yes"));
    assert!(!hf.match_hostname("ml4xhpc.uio.no"));
}

#[test]
fn test_hostfilter2() {
    let mut hf = HostGlobber::new(true);
    hf.insert("ml[1-3]*").unwrap();
    assert!(hf.match_hostname("ml1"));
    assert!(hf.match_hostname("ml1x"));
    assert!(hf.match_hostname("ml1.uio"));
    assert!(!hf.match_hostname("ml4"));
    assert!(HostGlobber::new(true).is_empty());
}

#[test]
fn test_hostfilter3() {
    let mut hf = HostGlobber::new(false);
    hf.insert("c[1-3]-[2,4]").unwrap();
    assert!(hf.match_hostname("c1-2"));
    assert!(hf.match_hostname("c2-2"));
    assert!(hf.match_hostname("c3-4"));
    assert!(!hf.match_hostname("c2-3"));
}

// This tests:
//  - syntax errors in patterns

#[test]
fn test_hostfilter_errors() {
    let mut hf = HostGlobber::new(false);
    assert!(hf.insert("c[1-").is_err());
    assert!(hf.insert("c[3-1]").is_err());
    assert!(hf.insert("c[x]").is_err());
    assert!(hf.insert("c*x").is_err());
    assert!(hf.insert("c]").is_err());
    assert!(hf.insert("c[1-100000]").is_err());
    assert!(hf.is_empty());
}

#[test]
fn test_expansion() {
    assert!(expand_pattern("c1-[23-25]").unwrap() == vec!["c1-23", "c1-24", "c1-25"]);
    assert!(
        expand_pattern("hi[1-2].ho[3,4]").unwrap()
            == vec!["hi1.ho3", "hi1.ho4", "hi2.ho3", "hi2.ho4"]
    );
    assert!(expand_pattern("ml1.hpc.uio.no").unwrap() == vec!["ml1.hpc.uio.no"]);
    assert!(expand_pattern("ml[1-2]*").is_err());
}

#[test]
fn test_compress_hostnames() {
    assert!(
        compress_hostnames(&vec![
            Ustr::from("a1"),
            Ustr::from("a3"),
            Ustr::from("a2"),
            Ustr::from("a5")
        ])
        .join(",")
            == "a[1-3,5]"
    );
    // Hosts are carefully ordered here to ensure that they are not sorted either by their first or
    // second elements.
    assert!(
        compress_hostnames(&vec![
            Ustr::from("a3.fox"),
            Ustr::from("a1.fox"),
            Ustr::from("a3.fum"),
            Ustr::from("a2.fox"),
            Ustr::from("a5.fox"),
        ])
        .join(",")
            == "a[1-3,5].fox,a3.fum"
    );
    assert!(
        compress_hostnames(&vec![Ustr::from("h2"), Ustr::from("h1"), Ustr::from("login"), Ustr::from("h1")])
            .join(",")
            == "h[1-2],login"
    );
    assert!(compress_hostnames(&vec![Ustr::from("c01"), Ustr::from("c02")]).join(",") == "c01,c02");
}

#[test]
fn test_split_number() {
    assert!(split_number("") == None);
    assert!(split_number("a") == None);
    assert!(split_number("12") == None);
    assert!(split_number("a1") == Some(("a", 1)));
    assert!(split_number("a1-23") == Some(("a1-", 23)));
}
