/// Per-node system descriptions, from the old `sysinfo-<host>.json` files and the newer
/// `0+sysinfo-<host>.json` files.  Both are streams of whitespace-separated JSON objects and both
/// produce node records and card records.
///
/// There are few of these relative to samples, so they are stored with owned strings.
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::io;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysinfoNodeData {
    pub time: String,
    pub cluster: String,
    pub node: String,
    pub os_name: String,
    pub os_release: String,
    pub architecture: String,
    pub sockets: u64,
    pub cores_per_socket: u64,
    pub threads_per_core: u64,
    pub cpu_model: String,
    /// KiB
    pub memory: u64,
    pub topo_svg: String,
    pub topo_text: String,
    pub distances: Vec<Vec<u64>>,
}

/// One GPU card as described by the node, as it appears in the newer format.  Memory is in KiB,
/// power in watts, clocks in MHz.

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SysinfoGpuCard {
    pub index: u64,
    pub uuid: String,
    pub address: String,
    pub manufacturer: String,
    pub model: String,
    pub architecture: String,
    pub driver: String,
    pub firmware: String,
    pub memory: u64,
    pub power_limit: u64,
    pub max_power_limit: u64,
    pub min_power_limit: u64,
    pub max_ce_clock: u64,
    pub max_memory_clock: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SysinfoCardData {
    pub time: String,
    pub node: String,
    pub card: SysinfoGpuCard,
}

/// Everything read from one sysinfo file.

#[derive(Debug, Default)]
pub struct SysinfoData {
    pub nodes: Vec<SysinfoNodeData>,
    pub cards: Vec<SysinfoCardData>,
}

// Old format.  The description looks like this:
//
//   2x48 (hyperthreaded) AMD EPYC 7642 48-Core Processor, 1007 GiB, 4x NVIDIA GeForce RTX 3090 @ 24GiB

static DESC_MATCHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)x(\d+)( \(hyperthreaded\))?(.*?), \d+ GiB").expect("Valid regex")
});
static GPU_MATCHER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r", \d+x (.*) @ (\d+)GiB$").expect("Valid regex"));

#[derive(Deserialize, Default)]
#[serde(default)]
struct OldSysinfo {
    timestamp: String,
    hostname: String,
    description: String,
    mem_gb: u64,
    gpu_cards: u64,
    gpu_info: Option<Vec<OldGpuInfo>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OldGpuInfo {
    bus_addr: String,
    uuid: String,
    manufacturer: String,
    model: String,
    arch: String,
    driver: String,
    firmware: String,
    mem_size_kib: u64,
    power_limit_watt: u64,
    max_power_limit_watt: u64,
    min_power_limit_watt: u64,
    max_ce_clock_mhz: u64,
    max_mem_clock_mhz: u64,
}

pub fn parse_sysinfo_old_json(
    input: &mut dyn io::Read,
    verbose: bool,
) -> Result<(SysinfoData, usize)> {
    let mut nodes = vec![];
    let mut cards = vec![];
    let mut soft_errors = 0usize;
    for r in serde_json::Deserializer::from_reader(input).into_iter::<OldSysinfo>() {
        let r = match r {
            Ok(r) => r,
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => {
                if verbose {
                    log::warn!("Abandoning sysinfo data with bad JSON: {e}");
                }
                soft_errors += 1;
                break;
            }
        };

        let mut node = SysinfoNodeData {
            time: r.timestamp.clone(),
            node: r.hostname.clone(),
            memory: r.mem_gb * 1024 * 1024,
            os_name: "Linux".to_string(),
            ..Default::default()
        };
        if let Some(m) = DESC_MATCHER.captures(&r.description) {
            node.sockets = m[1].parse::<u64>().unwrap_or(0);
            node.cores_per_socket = m[2].parse::<u64>().unwrap_or(0);
            node.threads_per_core = if m.get(3).is_some() { 2 } else { 1 };
            node.cpu_model = m[4].trim().to_string();
        }
        // Architecture names as reported by Sonar.
        node.architecture = if r.description.contains("Intel") || r.description.contains("AMD") {
            "x86_64".to_string()
        } else {
            "aarch64".to_string()
        };
        nodes.push(node);

        // Prefer the per-card info, fall back to synthesizing cards from the description.
        if let Some(infos) = r.gpu_info {
            for (i, o) in infos.into_iter().enumerate() {
                cards.push(SysinfoCardData {
                    time: r.timestamp.clone(),
                    node: r.hostname.clone(),
                    card: SysinfoGpuCard {
                        index: i as u64,
                        uuid: o.uuid,
                        address: o.bus_addr,
                        manufacturer: o.manufacturer,
                        model: o.model,
                        architecture: o.arch,
                        driver: o.driver,
                        firmware: o.firmware,
                        memory: o.mem_size_kib,
                        power_limit: o.power_limit_watt,
                        max_power_limit: o.max_power_limit_watt,
                        min_power_limit: o.min_power_limit_watt,
                        max_ce_clock: o.max_ce_clock_mhz,
                        max_memory_clock: o.max_mem_clock_mhz,
                    },
                });
            }
        } else if r.gpu_cards > 0 {
            let mut model = String::new();
            let mut manufacturer = String::new();
            let mut memory = 0u64;
            if let Some(m) = GPU_MATCHER.captures(&r.description) {
                model = m[1].to_string();
                memory = m[2].parse::<u64>().unwrap_or(0) * 1024 * 1024;
                for maker in ["NVIDIA", "AMD", "Intel"] {
                    if model.contains(maker) {
                        manufacturer = maker.to_string();
                        break;
                    }
                }
            }
            for i in 0..r.gpu_cards {
                cards.push(SysinfoCardData {
                    time: r.timestamp.clone(),
                    node: r.hostname.clone(),
                    card: SysinfoGpuCard {
                        index: i,
                        model: model.clone(),
                        manufacturer: manufacturer.clone(),
                        memory,
                        ..Default::default()
                    },
                });
            }
        }
    }
    Ok((SysinfoData { nodes, cards }, soft_errors))
}

// New format.

#[derive(Deserialize, Default)]
#[serde(default)]
struct SysinfoEnvelope {
    data: Option<SysinfoEnvelopeData>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SysinfoEnvelopeData {
    attributes: SysinfoAttributes,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SysinfoAttributes {
    time: String,
    cluster: String,
    node: String,
    os_name: String,
    os_release: String,
    architecture: String,
    sockets: u64,
    cores_per_socket: u64,
    threads_per_core: u64,
    cpu_model: String,
    memory: u64,
    topo_svg: String,
    topo_text: String,
    distances: Option<Vec<Vec<u64>>>,
    cards: Vec<SysinfoGpuCard>,
}

pub fn parse_sysinfo_v0_json(
    input: &mut dyn io::Read,
    verbose: bool,
) -> Result<(SysinfoData, usize)> {
    let mut nodes = vec![];
    let mut cards = vec![];
    let mut soft_errors = 0usize;
    for r in serde_json::Deserializer::from_reader(input).into_iter::<SysinfoEnvelope>() {
        let r = match r {
            Ok(r) => r,
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => {
                if verbose {
                    log::warn!("Abandoning sysinfo data with bad JSON: {e}");
                }
                soft_errors += 1;
                break;
            }
        };
        let Some(data) = r.data else {
            soft_errors += 1;
            continue;
        };
        let d = data.attributes;
        let mut topo = |text: &str| -> String {
            if text.is_empty() {
                return String::new();
            }
            match BASE64.decode(text) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => {
                    soft_errors += 1;
                    String::new()
                }
            }
        };
        let topo_svg = topo(&d.topo_svg);
        let topo_text = topo(&d.topo_text);
        for card in d.cards {
            cards.push(SysinfoCardData {
                time: d.time.clone(),
                node: d.node.clone(),
                card,
            });
        }
        nodes.push(SysinfoNodeData {
            time: d.time,
            cluster: d.cluster,
            node: d.node,
            os_name: d.os_name,
            os_release: d.os_release,
            architecture: d.architecture,
            sockets: d.sockets,
            cores_per_socket: d.cores_per_socket,
            threads_per_core: d.threads_per_core,
            cpu_model: d.cpu_model,
            memory: d.memory,
            topo_svg,
            topo_text,
            distances: d.distances.unwrap_or_else(|| vec![vec![10]]),
        });
    }
    Ok((SysinfoData { nodes, cards }, soft_errors))
}

#[test]
fn test_parse_sysinfo_old() {
    let text = r#"
{"version":"0.9.0","timestamp":"2024-06-03T12:00:01+02:00","hostname":"ml6.hpc.uio.no",
 "description":"2x14 (hyperthreaded) Intel(R) Xeon(R) Gold 5120 CPU @ 2.20GHz, 251 GiB, 8x NVIDIA GeForce RTX 2080 Ti @ 11GiB",
 "cpu_cores":56,"mem_gb":251,"gpu_cards":8,"gpumem_gb":88}
{"version":"0.12.0","timestamp":"2024-06-03T12:00:01+02:00","hostname":"c1-10",
 "description":"1x64 ARM Neoverse, 128 GiB","cpu_cores":64,"mem_gb":128,"gpu_cards":1,
 "gpu_info":[{"bus_addr":"00000000:18:00.0","uuid":"GPU-xyz","manufacturer":"NVIDIA","model":"H100",
              "mem_size_kib":83886080,"power_limit_watt":700}]}
"#;
    let mut bytes = text.as_bytes();
    let (SysinfoData { nodes, cards }, soft_errors) =
        parse_sysinfo_old_json(&mut bytes, false).unwrap();
    assert!(soft_errors == 0);
    assert!(nodes.len() == 2);
    assert!(nodes[0].node == "ml6.hpc.uio.no");
    assert!(nodes[0].sockets == 2);
    assert!(nodes[0].cores_per_socket == 14 && nodes[0].threads_per_core == 2);
    assert!(nodes[0].cpu_model == "Intel(R) Xeon(R) Gold 5120 CPU @ 2.20GHz");
    assert!(nodes[0].architecture == "x86_64");
    assert!(nodes[0].memory == 251 * 1024 * 1024);
    assert!(nodes[1].sockets == 1 && nodes[1].threads_per_core == 1);
    assert!(nodes[1].architecture == "aarch64");

    assert!(cards.len() == 9);
    assert!(cards[0].card.model == "NVIDIA GeForce RTX 2080 Ti");
    assert!(cards[0].card.manufacturer == "NVIDIA");
    assert!(cards[0].card.memory == 11 * 1024 * 1024);
    assert!(cards[7].card.index == 7);
    assert!(cards[8].node == "c1-10");
    assert!(cards[8].card.uuid == "GPU-xyz" && cards[8].card.address == "00000000:18:00.0");
    assert!(cards[8].card.power_limit == 700);
}

#[test]
fn test_parse_sysinfo_v0() {
    let text = r#"
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sysinfo","attributes":{"time":"2024-06-03T12:00:01+02:00","cluster":"fox",
   "node":"c1-10","os_name":"Linux","os_release":"5.14","architecture":"x86_64","sockets":2,
   "cores_per_socket":64,"threads_per_core":1,"cpu_model":"AMD EPYC","memory":1056714156,
   "topo_text":"aGVsbG8=",
   "cards":[{"index":0,"uuid":"GPU-a","model":"A100","memory":41943040},
            {"index":1,"uuid":"GPU-b","model":"A100","memory":41943040}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"time":"2024-06-03T12:00:01+02:00","detail":"oops"}]}
{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"sysinfo","attributes":{"time":"2024-06-03T13:00:01+02:00","node":"c1-11","topo_svg":"!!!"}}}
"#;
    let mut bytes = text.as_bytes();
    let (SysinfoData { nodes, cards }, soft_errors) =
        parse_sysinfo_v0_json(&mut bytes, false).unwrap();
    assert!(nodes.len() == 2);
    assert!(cards.len() == 2);
    // The error envelope and the bad base64
    assert!(soft_errors == 2);
    assert!(nodes[0].cluster == "fox" && nodes[0].node == "c1-10");
    assert!(nodes[0].sockets == 2 && nodes[0].cores_per_socket == 64);
    assert!(nodes[0].topo_text == "hello");
    assert!(nodes[0].distances == vec![vec![10]]);
    assert!(cards[1].card.uuid == "GPU-b" && cards[1].node == "c1-10");
    assert!(nodes[1].topo_svg.is_empty());
}
