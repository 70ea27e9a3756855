//! Manifest documents: YAML input with size guards, and the identity a
//! desired value names.

use keel_core::{DynamicValue, Error, FieldPath, Gvk, HostValue, KeelResult, ObjectName, ResourceIdentity};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

/// True when `v` has more than `max` nodes.
pub fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    // running counter, bail one node past max
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max.saturating_add(1));
    count > max
}

/// Parse a (possibly multi-document) YAML stream into wire values. Empty
/// documents are skipped; every other document must be a mapping.
pub fn parse_manifests(yaml: &str, max_bytes: usize, max_nodes: usize) -> KeelResult<Vec<DynamicValue>> {
    if yaml.len() > max_bytes {
        return Err(Error::invalid(format!("YAML payload too large (>{max_bytes} bytes)")));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::invalid(format!("parsing YAML document {}: {e}", i + 1)))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val)
            .map_err(|e| Error::invalid(format!("converting YAML document {} to JSON: {e}", i + 1)))?;
        if json_node_budget_exceeded(&json, max_nodes) {
            return Err(Error::invalid(format!("YAML document {} too complex (>{max_nodes} nodes)", i + 1)));
        }
        if !json.is_object() {
            return Err(Error::invalid(format!("YAML document {} is not a mapping", i + 1)));
        }
        out.push(DynamicValue::from(json));
    }
    debug!(documents = out.len(), bytes = yaml.len(), "parsed manifests");
    Ok(out)
}

/// Identity named by a desired value. `default_ns` applies when the value
/// carries no `metadata.namespace`; cluster-scoped kinds drop it later.
pub fn build_identity(desired: &HostValue, default_ns: Option<&str>) -> KeelResult<ResourceIdentity> {
    let api_version = desired
        .attr("apiVersion")
        .and_then(HostValue::as_str)
        .ok_or_else(|| Error::invalid_at(&FieldPath::root().field("apiVersion"), "missing apiVersion"))?;
    let kind = desired
        .attr("kind")
        .and_then(HostValue::as_str)
        .ok_or_else(|| Error::invalid_at(&FieldPath::root().field("kind"), "missing kind"))?;
    let meta = desired.attr("metadata");
    let meta_str = |k: &str| meta.and_then(|m| m.attr(k)).and_then(HostValue::as_str).filter(|s| !s.is_empty());
    let name = match (meta_str("name"), meta_str("generateName")) {
        (Some(n), _) => ObjectName::Named(n.to_string()),
        (None, Some(prefix)) => ObjectName::Generated(prefix.to_string()),
        (None, None) => {
            return Err(Error::invalid_at(
                &FieldPath::root().field("metadata").field("name"),
                "missing metadata.name (or metadata.generateName)",
            ))
        }
    };
    let ns = meta_str("namespace").or(default_ns);
    Ok(ResourceIdentity::new(&Gvk::from_api_version(api_version, kind), ns, name))
}
