/// Slurm cluster descriptions (`0+cluzter-slurm.json`), as obtained by Sonar from `sinfo`.  Each
/// envelope is one observation of the cluster and is split three ways: the attributes of the
/// cluster, the partitions with their nodes, and the states of the nodes.  A client usually needs
/// only one of those.
///
/// Node names are host-name patterns as reported by Slurm (`c1-[1-4,7]`); see `expand_pattern`.
use anyhow::Result;
use serde::Deserialize;
use std::io;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterAttributes {
    pub time: String,
    pub cluster: String,
    pub slurm: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterPartition {
    pub name: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterPartitions {
    pub time: String,
    pub cluster: String,
    pub partitions: Vec<ClusterPartition>,
}

/// A group of nodes that are all in the same set of states.

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClusterNodes {
    pub names: Vec<String>,
    pub states: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CluzterNodes {
    pub time: String,
    pub cluster: String,
    pub nodes: Vec<ClusterNodes>,
}

#[derive(Debug, Default)]
pub struct CluzterData {
    pub attributes: Vec<CluzterAttributes>,
    pub partitions: Vec<CluzterPartitions>,
    pub nodes: Vec<CluzterNodes>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterEnvelope {
    data: Option<CluzterEnvelopeData>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterEnvelopeData {
    attributes: CluzterEnvelopeAttributes,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct CluzterEnvelopeAttributes {
    time: String,
    cluster: String,
    slurm: bool,
    partitions: Vec<ClusterPartition>,
    nodes: Vec<ClusterNodes>,
}

pub fn parse_cluzter_v0_json(
    input: &mut dyn io::Read,
    verbose: bool,
) -> Result<(CluzterData, usize)> {
    let mut data = CluzterData::default();
    let mut soft_errors = 0usize;
    for r in serde_json::Deserializer::from_reader(input).into_iter::<CluzterEnvelope>() {
        let r = match r {
            Ok(r) => r,
            Err(e) if e.is_io() => return Err(e.into()),
            Err(e) => {
                if verbose {
                    log::warn!("Abandoning cluster data with bad JSON: {e}");
                }
                soft_errors += 1;
                break;
            }
        };
        let Some(d) = r.data else {
            soft_errors += 1;
            continue;
        };
        let a = d.attributes;
        data.attributes.push(CluzterAttributes {
            time: a.time.clone(),
            cluster: a.cluster.clone(),
            slurm: a.slurm,
        });
        data.partitions.push(CluzterPartitions {
            time: a.time.clone(),
            cluster: a.cluster.clone(),
            partitions: a.partitions,
        });
        data.nodes.push(CluzterNodes {
            time: a.time,
            cluster: a.cluster,
            nodes: a.nodes,
        });
    }
    Ok((data, soft_errors))
}

#[test]
fn test_parse_cluzter() {
    let text = r#"{"meta":{"producer":"sonar","version":"0.13.0"},
 "data":{"type":"cluster","attributes":{"time":"2024-06-03T12:00:00+02:00","cluster":"fox","slurm":true,
   "partitions":[{"name":"normal","nodes":["c1-[1-4]","c2-1"]},{"name":"gpu","nodes":["gpu-[1,2]"]}],
   "nodes":[{"names":["c1-[1-3]"],"states":["IDLE"]},{"names":["c1-4"],"states":["DOWN","DRAIN"]}]}}}
{"meta":{"producer":"sonar","version":"0.13.0"},"errors":[{"time":"2024-06-03T12:05:00+02:00","detail":"sinfo failed"}]}
"#;
    let mut bytes = text.as_bytes();
    let (data, soft_errors) = parse_cluzter_v0_json(&mut bytes, false).unwrap();
    assert!(soft_errors == 1);
    assert!(data.attributes.len() == 1 && data.partitions.len() == 1 && data.nodes.len() == 1);
    assert!(data.attributes[0].cluster == "fox" && data.attributes[0].slurm);
    let ps = &data.partitions[0].partitions;
    assert!(ps.len() == 2 && ps[1].name == "gpu" && ps[0].nodes == vec!["c1-[1-4]", "c2-1"]);
    let ns = &data.nodes[0].nodes;
    assert!(ns[1].names == vec!["c1-4"] && ns[1].states == vec!["DOWN", "DRAIN"]);
    assert!(data.nodes[0].time == "2024-06-03T12:00:00+02:00");
}
