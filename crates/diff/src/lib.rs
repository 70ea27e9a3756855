//! Keel diff engine.
//!
//! Three-way structural merge of the last applied value (baseline), the new
//! desired value and the observed object with its ownership record. Maps are
//! merged key by key; lists and scalars are leaves. Keys present only on the
//! server are never touched.
//!
//! Per field path `p`:
//! - desired drops `p` that the baseline had: delete it if this manager owns
//!   it, otherwise leave it alone
//! - desired differs from the baseline: set it, whatever the server holds
//! - desired equals the baseline but the server differs: accept the drift when
//!   another manager owns `p`, re-assert desired otherwise
//!
//! An object without any ownership record makes the baseline authoritative:
//! every baselined path counts as ours and no foreign owner is assumed.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use keel_core::{Baseline, DynamicMap, DynamicValue, FieldOwnership, FieldPath, ObservedState, PathSegment};
use serde::{Deserialize, Serialize};
use tracing::debug;

mod extract;

pub use crate::extract::extract_owned;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Result of one diff. Serializes deterministically: map keys are sorted and
/// path sets are ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Minimal set-patch: nested map holding only the values to write.
    pub set: DynamicValue,
    pub deletions: BTreeSet<FieldPath>,
    /// Foreign-owned paths whose observed value was adopted.
    pub drift: BTreeSet<FieldPath>,
    pub next_baseline: Baseline,
    summary: DiffSummary,
}

impl Patch {
    /// Nothing to write and nothing to delete.
    pub fn is_empty(&self) -> bool {
        self.set.as_map().map_or(true, |m| m.is_empty()) && self.deletions.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        self.summary
    }

    /// RFC 7386 merge-patch body: the set-patch with a null per deletion.
    pub fn to_merge_patch(&self) -> DynamicValue {
        let mut out = self.set.clone();
        for p in &self.deletions {
            out.set_path(p, DynamicValue::Null);
        }
        out.canonicalize();
        out
    }

    /// Full server-side apply configuration: the next baseline without the
    /// adopted drift, so those fields are released rather than re-claimed.
    pub fn apply_configuration(&self) -> DynamicValue {
        let mut out = self.next_baseline.clone();
        for p in &self.drift {
            out.remove_path(p);
        }
        out
    }

    /// Leaf paths written by the set-patch, in order.
    pub fn set_paths(&self) -> Vec<FieldPath> {
        fn walk(v: &DynamicValue, path: &mut FieldPath, out: &mut Vec<FieldPath>) {
            match v {
                DynamicValue::Map(m) if !m.is_empty() => {
                    for (k, child) in m {
                        path.push(PathSegment::Field(k.clone()));
                        walk(child, path, out);
                        path.pop();
                    }
                }
                _ if !path.is_root() => out.push(path.clone()),
                _ => {}
            }
        }
        let mut out = Vec::new();
        walk(&self.set, &mut FieldPath::root(), &mut out);
        out
    }
}

/// Ownership view used by the merge. With no record at all the baseline
/// decides.
struct Owners<'a> {
    record: Option<&'a FieldOwnership>,
    manager: &'a str,
}

impl Owners<'_> {
    fn ours(&self, p: &FieldPath) -> bool {
        match self.record {
            Some(f) if !f.is_empty() => f.owned_by(p, self.manager),
            _ => true,
        }
    }

    fn foreign(&self, p: &FieldPath) -> bool {
        match self.record {
            Some(f) if !f.is_empty() => f.owned_by_other(p, self.manager),
            _ => false,
        }
    }
}

struct Walk<'a> {
    owners: Owners<'a>,
    exists: bool,
    deletions: BTreeSet<FieldPath>,
    drift: Vec<(FieldPath, DynamicValue)>,
    summary: DiffSummary,
}

/// Diff `desired` against `baseline` and the observed object.
///
/// `baseline` is `None` on the first cycle; `observed` is `None` when the
/// object does not exist (nothing is deleted then, and everything desired is
/// written).
pub fn diff(
    baseline: Option<&Baseline>,
    desired: &DynamicValue,
    observed: Option<&ObservedState>,
    manager: &str,
) -> Patch {
    let mut w = Walk {
        owners: Owners { record: observed.map(|o| &o.ownership), manager },
        exists: observed.is_some(),
        deletions: BTreeSet::new(),
        drift: Vec::new(),
        summary: DiffSummary::default(),
    };
    let empty = DynamicMap::new();
    let b = baseline.and_then(DynamicValue::as_map).unwrap_or(&empty);
    let o = observed.map(|o| &o.value);
    let set = match desired.as_map() {
        Some(d) => w.merge(b, d, o, &mut FieldPath::root()),
        None => DynamicMap::new(),
    };

    let mut next = desired.clone();
    let mut drift = BTreeSet::new();
    for (p, v) in w.drift {
        next.set_path(&p, v);
        drift.insert(p);
    }
    next.canonicalize();
    let mut set = DynamicValue::Map(set);
    set.canonicalize();

    debug!(
        adds = w.summary.adds,
        updates = w.summary.updates,
        removes = w.summary.removes,
        drift = drift.len(),
        "diff computed"
    );
    Patch { set, deletions: w.deletions, drift, next_baseline: next, summary: w.summary }
}

impl Walk<'_> {
    fn merge(
        &mut self,
        b: &DynamicMap,
        d: &DynamicMap,
        o: Option<&DynamicValue>,
        path: &mut FieldPath,
    ) -> DynamicMap {
        let keys: BTreeSet<&String> = b.keys().chain(d.keys()).collect();
        let mut out = DynamicMap::new();
        for k in keys {
            path.push(PathSegment::Field(k.clone()));
            let bv = b.get(k.as_str());
            let ov = o.and_then(|o| o.get(k));
            match d.get(k.as_str()) {
                None => {
                    // only reachable when the baseline has k
                    if self.exists {
                        if let (Some(bv), Some(ov)) = (bv, ov) {
                            self.release(bv, ov, path);
                        }
                    }
                }
                Some(dv) => {
                    if let Some(sub) = self.visit(bv, dv, ov, path) {
                        out.insert(k.clone(), sub);
                    }
                }
            }
            path.pop();
        }
        out
    }

    /// Delete what this manager owns of a dropped subtree. A map shared with
    /// another manager is descended into so its foreign fields survive.
    fn release(&mut self, bv: &DynamicValue, ov: &DynamicValue, path: &mut FieldPath) {
        if !self.owners.ours(path) {
            return;
        }
        if let (DynamicValue::Map(bm), Some(om)) = (bv, ov.as_map()) {
            if self.owners.foreign(path) {
                for (k, child) in bm {
                    if let Some(oc) = om.get(k.as_str()) {
                        path.push(PathSegment::Field(k.clone()));
                        self.release(child, oc, path);
                        path.pop();
                    }
                }
                return;
            }
        }
        self.deletions.insert(path.clone());
        self.summary.removes += 1;
    }

    /// Value to write at `path`, if any.
    fn visit(
        &mut self,
        bv: Option<&DynamicValue>,
        dv: &DynamicValue,
        ov: Option<&DynamicValue>,
        path: &mut FieldPath,
    ) -> Option<DynamicValue> {
        if let (Some(DynamicValue::Map(bm)), DynamicValue::Map(dm)) = (bv, dv) {
            let sub = self.merge(bm, dm, ov, path);
            let created = ov.map_or(true, |o| o.as_map().is_none());
            // an empty desired map must still exist remotely
            return if !sub.is_empty() || (created && dm.is_empty()) {
                Some(DynamicValue::Map(sub))
            } else {
                None
            };
        }
        if bv != Some(dv) {
            self.count_write(dv, ov);
            return Some(dv.clone());
        }
        if ov == Some(dv) {
            return None;
        }
        if let Some(o) = ov {
            if self.owners.foreign(path) {
                self.drift.push((path.clone(), o.clone()));
                return None;
            }
        }
        self.count_write(dv, ov);
        Some(dv.clone())
    }

    fn count_write(&mut self, dv: &DynamicValue, ov: Option<&DynamicValue>) {
        match (ov, dv) {
            (None, _) => self.summary.adds += 1,
            (Some(o), d) if o != d => self.summary.updates += 1,
            _ => {}
        }
    }
}
