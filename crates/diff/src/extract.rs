use keel_core::{DynamicMap, DynamicValue, FieldOwnership, FieldPath, PathSegment};

const IDENTITY: [&str; 2] = ["apiVersion", "kind"];
const IDENTITY_META: [&str; 2] = ["name", "namespace"];

/// The part of `value` that `manager` owns, plus the identity fields. Used to
/// seed a baseline when adopting an existing object. Without any ownership
/// record the whole value is returned.
pub fn extract_owned(value: &DynamicValue, ownership: &FieldOwnership, manager: &str) -> DynamicValue {
    if ownership.is_empty() {
        return value.clone();
    }
    let Some(root) = value.as_map() else {
        return DynamicValue::map();
    };
    let mut out = walk(root, ownership, manager, &mut FieldPath::root());
    for k in IDENTITY {
        if let Some(v) = root.get(k) {
            out.insert(k.to_string(), v.clone());
        }
    }
    if let Some(meta) = root.get("metadata").and_then(DynamicValue::as_map) {
        let entry = out.entry("metadata".to_string()).or_insert_with(DynamicValue::map);
        if let Some(m) = entry.as_map_mut() {
            for k in IDENTITY_META {
                if let Some(v) = meta.get(k) {
                    m.insert(k.to_string(), v.clone());
                }
            }
        }
    }
    let mut out = DynamicValue::Map(out);
    out.canonicalize();
    out
}

fn walk(map: &DynamicMap, ownership: &FieldOwnership, manager: &str, path: &mut FieldPath) -> DynamicMap {
    let mut out = DynamicMap::new();
    for (k, v) in map {
        path.push(PathSegment::Field(k.clone()));
        if ownership.owned_by(path, manager) {
            match v.as_map() {
                Some(child) => {
                    let sub = walk(child, ownership, manager, path);
                    // owned as a whole when nothing below is itemized
                    let kept = if sub.is_empty() { v.clone() } else { DynamicValue::Map(sub) };
                    out.insert(k.clone(), kept);
                }
                None => {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        path.pop();
    }
    out
}
