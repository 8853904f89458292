//! Desired-state documents: a YAML list of `{address, kind, attributes}`.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tether_core::ResourceSpec;

fn max_yaml_bytes() -> usize {
    std::env::var("TETHER_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("TETHER_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// One managed resource. `address` is the caller's local name for it and keys persisted state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    pub address: String,
    pub kind: String,
    #[serde(default)]
    pub attributes: ResourceSpec,
}

pub fn parse_desired(yaml: &str) -> Result<Vec<DesiredResource>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let json = serde_json::to_value(val).context("converting YAML to JSON")?;
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
    }
    if !json.is_array() {
        return Err(anyhow!("desired state must be a YAML list of resources"));
    }
    let items: Vec<DesiredResource> = serde_json::from_value(json).context("reading desired resources")?;
    let mut seen = BTreeSet::new();
    for (i, it) in items.iter().enumerate() {
        if it.address.trim().is_empty() {
            return Err(anyhow!("resource #{} missing address", i + 1));
        }
        if it.kind.trim().is_empty() {
            return Err(anyhow!("resource {} missing kind", it.address));
        }
        if !seen.insert(it.address.as_str()) {
            return Err(anyhow!("duplicate address {}", it.address));
        }
    }
    Ok(items)
}
