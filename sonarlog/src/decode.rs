/// Decoders for the encoded side-table data carried by LoadDatum and GpuDatum.
use crate::sample::{EncodedGpuData, EncodedLoadData, PerGpuDatum};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;

// Base-45 delta encoding of the per-CPU load, see the Sonar documentation.  Every number starts
// with a character from INITIAL and is continued, least significant digit first, with characters
// from SUBSEQUENT.  The first number is a bias that is added to the others and then dropped.

const BASE: u64 = 45;
const NONE: u8 = 255;
const INITIAL: &[u8] = b"(){}[]<>+-abcdefghijklmnopqrstuvwxyz!@#$%^&*_";
const SUBSEQUENT: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ~|';:.?/`";

static DIGITS: Lazy<([u8; 256], [u8; 256])> = Lazy::new(|| {
    let mut initial = [NONE; 256];
    let mut subsequent = [NONE; 256];
    for i in 0..BASE as usize {
        initial[INITIAL[i] as usize] = i as u8;
        subsequent[SUBSEQUENT[i] as usize] = i as u8;
    }
    (initial, subsequent)
});

pub fn decode_load_data(data: &EncodedLoadData) -> Result<Vec<u64>> {
    match data {
        EncodedLoadData::Values(vals) => Ok(vals.clone()),
        EncodedLoadData::Base45(bytes) => decode_base45(bytes),
    }
}

fn decode_base45(data: &[u8]) -> Result<Vec<u64>> {
    let (initial, subsequent) = &*DIGITS;
    let mut vals = Vec::with_capacity(data.len() * 3);

    // shift == 0 means no value
    let mut val = 0u64;
    let mut shift = 0u64;
    for c in data {
        let d = initial[*c as usize];
        if d != NONE {
            if shift != 0 {
                vals.push(val);
            }
            val = d as u64;
            shift = BASE;
            continue;
        }
        let d = subsequent[*c as usize];
        if d == NONE || shift == 0 {
            bail!("Could not decode load datum");
        }
        val = val.wrapping_add((d as u64).wrapping_mul(shift));
        shift = shift.wrapping_mul(BASE);
    }
    if shift != 0 {
        vals.push(val);
    }
    if vals.is_empty() {
        bail!("Empty data array");
    }
    let bias = vals[0];
    Ok(vals[1..].iter().map(|v| v.wrapping_add(bias)).collect::<Vec<u64>>())
}

/// Old-style GPU data is a comma-separated list of arrays `tag=x|y|...|z`, one array element per
/// card:
///
///   fan%=27|28|28,perf=P8|P8|P8,musekib=1024|1024|1024,tempc=26|27|28,poww=5|2|20,...
///
/// The arrays should all be the same length.  Unknown tags and unparseable values are ignored,
/// leaving zero in the field.

pub fn decode_gpu_data(data: &EncodedGpuData) -> Vec<PerGpuDatum> {
    match data {
        EncodedGpuData::Values(vals) => vals.clone(),
        EncodedGpuData::Csv(bytes) => decode_csv_gpu_data(&String::from_utf8_lossy(bytes)),
    }
}

fn decode_csv_gpu_data(data: &str) -> Vec<PerGpuDatum> {
    let mut result: Vec<PerGpuDatum> = vec![];
    for field in data.split(',') {
        let (tag, values) = field.split_once('=').unwrap_or((field, ""));
        let values = values.split('|').collect::<Vec<&str>>();
        if result.is_empty() {
            result = (0..values.len())
                .map(|i| PerGpuDatum {
                    index: i as u32,
                    ..Default::default()
                })
                .collect();
        }
        for (card, v) in result.iter_mut().zip(values) {
            match tag {
                "fan%" => card.fan_pct = v.parse::<u64>().unwrap_or(0),
                "perf" => {
                    card.perf_state = v
                        .strip_prefix('P')
                        .and_then(|n| n.parse::<i64>().ok())
                        .unwrap_or(0)
                }
                "musekib" => card.mem_kib = v.parse::<u64>().unwrap_or(0),
                "tempc" => card.temp_c = v.parse::<i64>().unwrap_or(0),
                "poww" => card.power_w = v.parse::<u64>().unwrap_or(0),
                "powlimw" => card.power_limit_w = v.parse::<u64>().unwrap_or(0),
                "cez" => card.ce_clock_mhz = v.parse::<u64>().unwrap_or(0),
                "memz" => card.mem_clock_mhz = v.parse::<u64>().unwrap_or(0),
                _ => {}
            }
        }
    }
    result
}

// This tests:
//  - the bias is added to and removed from the values
//  - multi-digit numbers are little-endian in the subsequent alphabet
//  - junk and empty input are errors

#[test]
fn test_decode_load() {
    // bias 10 ("a"), then 8 ("+"), 0 ("("), 45*1+3 ("}1"), 0 ("(")
    let vs = decode_load_data(&EncodedLoadData::Base45(b"a+(}1(".to_vec())).unwrap();
    assert!(vs == vec![18, 10, 58, 10]);
    let vs = decode_load_data(&EncodedLoadData::Base45(b"(B0A}1B".to_vec())).unwrap();
    assert!(vs == vec![3 + 45 + 11 * 2025 + 495 + 10 * 91125]);
    assert!(decode_load_data(&EncodedLoadData::Base45(b"a".to_vec())).unwrap().is_empty());
    assert!(decode_load_data(&EncodedLoadData::Base45(b"".to_vec())).is_err());
    assert!(decode_load_data(&EncodedLoadData::Base45(b"a,b".to_vec())).is_err());
    assert!(decode_load_data(&EncodedLoadData::Base45(b"0a".to_vec())).is_err());
    assert!(decode_load_data(&EncodedLoadData::Values(vec![1, 2])).unwrap() == vec![1, 2]);
}

#[test]
fn test_decode_gpu() {
    let cards = decode_gpu_data(&EncodedGpuData::Csv(
        b"fan%=27|28,perf=P8|P2,musekib=1024|2621440,tempc=26|31,bogus=1|2,poww=x|7".to_vec(),
    ));
    assert!(cards.len() == 2);
    assert!(cards[0].index == 0 && cards[1].index == 1);
    assert!(cards[0].fan_pct == 27 && cards[1].fan_pct == 28);
    assert!(cards[0].perf_state == 8 && cards[1].perf_state == 2);
    assert!(cards[1].mem_kib == 2621440);
    assert!(cards[1].temp_c == 31);
    assert!(cards[0].power_w == 0 && cards[1].power_w == 7);
}
