/// Fast number and time parsers operating directly on the byte slices handed out by the CSV
/// tokenizer.  None of these allocate on the success path.
use anyhow::{bail, Result};
use chrono::DateTime;

pub fn parse_uint64(bs: &[u8]) -> Result<u64> {
    if bs.is_empty() {
        bail!("Empty");
    }
    let mut n = 0u64;
    for c in bs {
        if !c.is_ascii_digit() {
            bail!("Not a digit");
        }
        n = match n.checked_mul(10).and_then(|m| m.checked_add((c - b'0') as u64)) {
            Some(m) => m,
            None => bail!("Out of range"),
        };
    }
    Ok(n)
}

pub fn parse_uint32(bs: &[u8]) -> Result<u32> {
    match u32::try_from(parse_uint64(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Overflow"),
    }
}

pub fn parse_uint8(bs: &[u8]) -> Result<u8> {
    match u8::try_from(parse_uint64(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Overflow"),
    }
}

/// A primitive float parser: unsigned decimal with an optional fraction, no exponent.  Older
/// producers have written NaN and infinities (Rust prints "NaN" and "inf", Go prints "NaN" and
/// "+Inf"), so those are accepted case-insensitively unless `filter_inf_nan` is set.  Accuracy is
/// only what the sampling data need.

pub fn parse_float(bs: &[u8], filter_inf_nan: bool) -> Result<f64> {
    if bs.is_empty() {
        bail!("Empty");
    }
    match bs[0] {
        b'-' => bail!("Not a digit"),
        b'+' | b'i' | b'I' => {
            let s = if bs[0] == b'+' { &bs[1..] } else { bs };
            if s.eq_ignore_ascii_case(b"inf") || s.eq_ignore_ascii_case(b"infinity") {
                if filter_inf_nan {
                    bail!("Infinity");
                }
                return Ok(f64::INFINITY);
            }
            bail!("Not a digit");
        }
        b'n' | b'N' => {
            if bs.eq_ignore_ascii_case(b"nan") {
                if filter_inf_nan {
                    bail!("NaN");
                }
                return Ok(f64::NAN);
            }
            bail!("Not a digit");
        }
        _ => {}
    }
    let mut n = 0f64;
    let mut i = 0;
    while i < bs.len() && bs[i] != b'.' {
        let c = bs[i];
        if !c.is_ascii_digit() {
            bail!("Not a digit");
        }
        n = n * 10.0 + (c - b'0') as f64;
        i += 1;
    }
    if i < bs.len() {
        i += 1;
        if i == bs.len() {
            bail!("Empty fraction");
        }
        let mut f = 0.1;
        while i < bs.len() {
            let c = bs[i];
            if !c.is_ascii_digit() {
                bail!("Not a digit");
            }
            n += (c - b'0') as f64 * f;
            f *= 0.1;
            i += 1;
        }
    }
    Ok(n)
}

// Parse digits from bs[i..], returning the value and the index of the first non-digit.  There must
// be at least one digit.
fn parse_uint64_here(bs: &[u8], mut i: usize) -> Option<(u64, usize)> {
    let start = i;
    let mut n = 0u64;
    while i < bs.len() && bs[i].is_ascii_digit() {
        n = n.checked_mul(10)?.checked_add((bs[i] - b'0') as u64)?;
        i += 1;
    }
    if i == start {
        None
    } else {
        Some((n, i))
    }
}

/// Slurm elapsed time, `[DD-][HH:]MM:SS[.micros]`, in seconds.  The micros are discarded.  The Slurm
/// documentation is not consistent about which parts are optional and whether they are two-digit,
/// so we just look for the terminators and parse the numbers in between.

pub fn parse_slurm_elapsed64(bs: &[u8]) -> Result<u64> {
    const MSG: &str = "Bad elapsed time format";
    let mut days = 0u64;
    let mut hours = 0u64;
    let mut minutes = 0u64;
    let mut have_hours = false;
    let mut have_minutes = false;

    let Some((mut n, mut i)) = parse_uint64_here(bs, 0) else {
        bail!(MSG)
    };

    if i < bs.len() && bs[i] == b'-' {
        days = n;
        (n, i) = match parse_uint64_here(bs, i + 1) {
            Some(x) => x,
            None => bail!(MSG),
        };
    }

    // Values followed by colon are either HH or MM
    while i < bs.len() && bs[i] == b':' {
        if have_hours {
            bail!(MSG);
        }
        if have_minutes {
            hours = minutes;
            have_hours = true;
        }
        minutes = n;
        have_minutes = true;
        (n, i) = match parse_uint64_here(bs, i + 1) {
            Some(x) => x,
            None => bail!(MSG),
        };
    }

    if !have_minutes {
        bail!(MSG);
    }
    let seconds = n;

    if i < bs.len() && bs[i] == b'.' {
        (_, i) = match parse_uint64_here(bs, i + 1) {
            Some(x) => x,
            None => bail!(MSG),
        };
    }

    if i < bs.len() {
        bail!(MSG);
    }

    Ok(seconds + minutes * 60 + hours * 3600 + days * 3600 * 24)
}

pub fn parse_slurm_elapsed32(bs: &[u8]) -> Result<u32> {
    match u32::try_from(parse_slurm_elapsed64(bs)?) {
        Ok(n) => Ok(n),
        Err(_) => bail!("Bad elapsed time format"),
    }
}

/// RFC3339 timestamp with a required time zone and optional fractional seconds, to Unix seconds.

pub fn parse_rfc3339(bs: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(bs)?;
    Ok(DateTime::parse_from_rfc3339(s)?.timestamp())
}

/// An integer or decimal value optionally followed by K, M or G, converted to GiB and rounded up.

pub fn parse_slurm_bytes(bs: &[u8]) -> Result<u32> {
    let Some(last) = bs.last() else {
        bail!("Empty")
    };
    let (mpy, digits) = match last {
        b'G' => (1024.0 * 1024.0 * 1024.0, &bs[..bs.len() - 1]),
        b'M' => (1024.0 * 1024.0, &bs[..bs.len() - 1]),
        b'K' => (1024.0, &bs[..bs.len() - 1]),
        _ => (1.0, bs),
    };
    let n = parse_float(digits, true)?;
    Ok(((n * mpy) / (1024.0 * 1024.0 * 1024.0)).ceil() as u32)
}

#[test]
fn test_parse_uint() {
    assert!(parse_uint64(b"0").unwrap() == 0);
    assert!(parse_uint64(b"18446744073709551615").unwrap() == u64::MAX);
    assert!(parse_uint64(b"18446744073709551616").is_err());
    assert!(parse_uint64(b"").is_err());
    assert!(parse_uint64(b"1x92").is_err());
    assert!(parse_uint64(b"-1").is_err());
    assert!(parse_uint32(b"4294967295").unwrap() == u32::MAX);
    assert!(parse_uint32(b"4294967296").is_err());
    assert!(parse_uint8(b"255").unwrap() == 255);
    assert!(parse_uint8(b"256").is_err());
}

// This tests:
//  - plain and fractional values
//  - NaN and infinities with and without filtering
//  - rejected syntax: negative, exponent, empty fraction, junk

#[test]
fn test_parse_float() {
    assert!(parse_float(b"12", false).unwrap() == 12.0);
    assert!((parse_float(b"12.5", false).unwrap() - 12.5).abs() < 1e-9);
    assert!((parse_float(b"0.25", true).unwrap() - 0.25).abs() < 1e-9);
    assert!(parse_float(b"NaN", false).unwrap().is_nan());
    assert!(parse_float(b"nan", true).is_err());
    assert!(parse_float(b"inf", false).unwrap() == f64::INFINITY);
    assert!(parse_float(b"+Inf", false).unwrap() == f64::INFINITY);
    assert!(parse_float(b"Infinity", false).unwrap() == f64::INFINITY);
    assert!(parse_float(b"+infinity", false).unwrap() == f64::INFINITY);
    assert!(parse_float(b"+Inf", true).is_err());
    assert!(parse_float(b"-1", false).is_err());
    assert!(parse_float(b"-inf", false).is_err());
    assert!(parse_float(b"1e5", false).is_err());
    assert!(parse_float(b"1.", false).is_err());
    assert!(parse_float(b"", false).is_err());
    assert!(parse_float(b"1.2.3", false).is_err());
    assert!(parse_float(b"+12", false).is_err());
}

#[test]
fn test_parse_slurm_elapsed() {
    assert!(parse_slurm_elapsed64(b"1-02:03:04").unwrap() == 86400 + 2 * 3600 + 3 * 60 + 4);
    assert!(parse_slurm_elapsed64(b"02:03:04").unwrap() == 2 * 3600 + 3 * 60 + 4);
    assert!(parse_slurm_elapsed64(b"03:04").unwrap() == 3 * 60 + 4);
    assert!(parse_slurm_elapsed64(b"03:04.123456").unwrap() == 3 * 60 + 4);
    assert!(parse_slurm_elapsed64(b"2-03:04").unwrap() == 2 * 86400 + 3 * 60 + 4);
    assert!(parse_slurm_elapsed64(b"04").is_err());
    assert!(parse_slurm_elapsed64(b"1:2:3:4").is_err());
    assert!(parse_slurm_elapsed64(b"03:04x").is_err());
    assert!(parse_slurm_elapsed64(b"03:04.").is_err());
    assert!(parse_slurm_elapsed64(b"").is_err());
    assert!(parse_slurm_elapsed32(b"10:00").unwrap() == 600);
}

#[test]
fn test_parse_rfc3339() {
    assert!(parse_rfc3339(b"1970-01-01T00:00:10Z").unwrap() == 10);
    assert!(parse_rfc3339(b"1970-01-01T01:00:10+01:00").unwrap() == 10);
    assert!(parse_rfc3339(b"1970-01-01T00:00:10.5Z").unwrap() == 10);
    assert!(parse_rfc3339(b"2024-06-03T00:00:01+02:00").unwrap() == 1717365601);
    assert!(parse_rfc3339(b"2024-06-03T00:00:01").is_err());
    assert!(parse_rfc3339(b"yesterday").is_err());
}

#[test]
fn test_parse_slurm_bytes() {
    assert!(parse_slurm_bytes(b"1G").unwrap() == 1);
    assert!(parse_slurm_bytes(b"1.5G").unwrap() == 2);
    assert!(parse_slurm_bytes(b"1024M").unwrap() == 1);
    assert!(parse_slurm_bytes(b"1025M").unwrap() == 2);
    assert!(parse_slurm_bytes(b"10K").unwrap() == 1);
    assert!(parse_slurm_bytes(b"0").unwrap() == 0);
    assert!(parse_slurm_bytes(b"1073741825").unwrap() == 2);
    assert!(parse_slurm_bytes(b"").is_err());
    assert!(parse_slurm_bytes(b"G").is_err());
}
