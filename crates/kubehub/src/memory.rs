//! In-memory [`Cluster`] with server-side apply field ownership.
//!
//! Follows the API server's rules closely enough for the engine's scenarios:
//! lists are atomic, an apply conflicts when another manager owns a field the
//! request sets to a different value, fields an applier stops sending are
//! removed unless somebody else still owns them, and updates (merge patch,
//! create, [`MemoryCluster::update_as`]) take ownership without conflicts.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{
    DynamicMap, DynamicValue, Error, ErrorKind, FieldConflict, FieldPath, FieldSet, Gvk, KeelResult, ManagedEntry,
    ManagedOperation,
};
use tracing::debug;

use crate::{scoped_namespace, Cluster, DiscoveredResource, ObjectRef, RawSchema, WriteParams};

type Key = (String, Option<String>, String);

#[derive(Debug, Clone)]
struct Stored {
    object: DynamicValue,
    managers: Vec<ManagedEntry>,
}

#[derive(Default)]
struct State {
    kinds: BTreeMap<Gvk, (DiscoveredResource, RawSchema)>,
    objects: BTreeMap<Key, Stored>,
    next_rv: u64,
    next_uid: u64,
    discovery_calls: u64,
    failing_discoveries: u32,
    failing_gets: u32,
    discovery_delay: Option<Duration>,
    get_delay: Option<Duration>,
}

/// Test double for an API server. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

fn key(resource: &DiscoveredResource, namespace: Option<&str>, name: &str) -> Key {
    (resource.gvk_key(), namespace.map(str::to_string), name.to_string())
}

fn target_key(target: &ObjectRef) -> Key {
    key(&target.resource, target.namespace.as_deref(), &target.name)
}

/// Paths the server assigns or derives from the URL; never owned by a manager.
fn is_identity_path(path: &FieldPath) -> bool {
    let s = path.to_string();
    matches!(
        s.as_str(),
        ".apiVersion" | ".kind" | ".metadata.name" | ".metadata.namespace" | ".metadata.generateName"
            | ".metadata.resourceVersion" | ".metadata.uid" | ".metadata.generation"
            | ".metadata.creationTimestamp" | ".metadata.managedFields"
    ) || s.starts_with(".status")
}

/// Leaf field set of an apply body. Lists, scalars, nulls and empty maps are
/// leaves.
fn leaf_fields(value: &DynamicValue) -> FieldSet {
    fn walk(v: &DynamicValue, path: &mut FieldPath, out: &mut FieldSet) {
        match v {
            DynamicValue::Map(m) if !m.is_empty() => {
                for (k, child) in m {
                    path.push(keel_core::PathSegment::Field(k.clone()));
                    walk(child, path, out);
                    path.pop();
                }
            }
            _ => {
                if !path.is_root() && !is_identity_path(path) {
                    out.insert(path);
                }
            }
        }
    }
    let mut out = FieldSet::new();
    walk(value, &mut FieldPath::root(), &mut out);
    out
}

/// Deep-merge `src` into `dst`: maps merge key by key, everything else replaces.
fn merge_into(dst: &mut DynamicValue, src: &DynamicValue) {
    match (dst.as_map_mut(), src) {
        (Some(d), DynamicValue::Map(s)) => {
            for (k, v) in s {
                match d.get_mut(k) {
                    Some(existing) if existing.as_map().is_some() && v.as_map().is_some() => merge_into(existing, v),
                    _ => {
                        d.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        _ => *dst = src.clone(),
    }
}

/// RFC 7386: nulls delete, maps merge, everything else replaces.
fn merge_patch_into(dst: &mut DynamicValue, patch: &DynamicValue) {
    let DynamicValue::Map(p) = patch else {
        *dst = patch.clone();
        return;
    };
    if dst.as_map().is_none() {
        *dst = DynamicValue::map();
    }
    let Some(d) = dst.as_map_mut() else { return };
    for (k, v) in p {
        if v.is_null() {
            d.shift_remove(k);
        } else if let Some(existing) = d.get_mut(k) {
            merge_patch_into(existing, v);
        } else {
            let mut fresh = DynamicValue::Null;
            merge_patch_into(&mut fresh, v);
            d.insert(k.clone(), fresh);
        }
    }
}

/// Leaf paths changed or removed between `before` and `after`.
fn changed_leaves(before: &DynamicValue, after: &DynamicValue) -> (Vec<FieldPath>, Vec<FieldPath>) {
    let before_set = leaf_fields(before);
    let after_set = leaf_fields(after);
    let changed = after_set.members().into_iter().filter(|p| before.get_path(p) != after.get_path(p)).collect();
    let removed = before_set.members().into_iter().filter(|p| after.get_path(p).is_none()).collect();
    (changed, removed)
}

impl State {
    fn bump(&mut self, obj: &mut DynamicValue, previous: Option<&DynamicValue>, target: (&str, Option<&str>)) {
        self.next_rv += 1;
        let spec_changed = previous.map(|p| p.get("spec") != obj.get("spec")).unwrap_or(true);
        let prev_meta = previous.and_then(|p| p.get("metadata"));
        let generation = prev_meta.and_then(|m| m.get("generation")).and_then(DynamicValue::as_i64).unwrap_or(0);
        let uid = match prev_meta.and_then(|m| m.get("uid")).and_then(DynamicValue::as_str) {
            Some(u) => u.to_string(),
            None => {
                self.next_uid += 1;
                format!("00000000-0000-0000-0000-{:012}", self.next_uid)
            }
        };
        if obj.as_map().is_none() {
            *obj = DynamicValue::map();
        }
        let meta_path = FieldPath::root().field("metadata");
        if obj.get("metadata").and_then(DynamicValue::as_map).is_none() {
            obj.set_path(&meta_path, DynamicValue::map());
        }
        let (name, namespace) = target;
        let set = |obj: &mut DynamicValue, k: &str, v: DynamicValue| {
            obj.set_path(&meta_path.field(k), v);
        };
        set(obj, "name", name.into());
        if let Some(ns) = namespace {
            set(obj, "namespace", ns.into());
        }
        set(obj, "uid", DynamicValue::string(uid));
        set(obj, "resourceVersion", DynamicValue::string(self.next_rv.to_string()));
        set(obj, "generation", (generation + i64::from(spec_changed)).into());
        if let Some(ts) = prev_meta.and_then(|m| m.get("creationTimestamp")) {
            set(obj, "creationTimestamp", ts.clone());
        } else {
            set(obj, "creationTimestamp", "2024-01-01T00:00:00Z".into());
        }
        if let Some(m) = obj.as_map_mut().and_then(|m| m.get_mut("metadata")).and_then(DynamicValue::as_map_mut) {
            m.shift_remove("generateName");
        }
    }
}

fn record_update(managers: &mut Vec<ManagedEntry>, manager: &str, api_version: &str, changed: &[FieldPath], removed: &[FieldPath]) {
    for e in managers.iter_mut() {
        for p in removed {
            e.fields.remove(p);
        }
        if e.manager != manager {
            for p in changed {
                e.fields.remove(p);
            }
        }
    }
    if !changed.is_empty() {
        let idx = match managers.iter().position(|e| e.manager == manager && e.operation == ManagedOperation::Update) {
            Some(i) => i,
            None => {
                managers.push(ManagedEntry {
                    manager: manager.to_string(),
                    operation: ManagedOperation::Update,
                    api_version: Some(api_version.to_string()),
                    subresource: None,
                    fields: FieldSet::new(),
                });
                managers.len() - 1
            }
        };
        for p in changed {
            managers[idx].fields.insert(p);
        }
    }
    managers.retain(|e| !e.fields.is_empty());
}

fn render(stored: &Stored) -> DynamicValue {
    let mut out = stored.object.clone();
    let entries: Vec<DynamicValue> = stored
        .managers
        .iter()
        .map(|e| {
            let mut m = DynamicMap::new();
            m.insert("manager".into(), e.manager.as_str().into());
            let op = match e.operation {
                ManagedOperation::Apply => "Apply",
                ManagedOperation::Update => "Update",
            };
            m.insert("operation".into(), op.into());
            if let Some(v) = &e.api_version {
                m.insert("apiVersion".into(), v.as_str().into());
            }
            m.insert("fieldsType".into(), "FieldsV1".into());
            m.insert("fieldsV1".into(), e.fields.to_fields_v1());
            DynamicValue::Map(m)
        })
        .collect();
    if !entries.is_empty() {
        out.set_path(&FieldPath::root().field("metadata").field("managedFields"), DynamicValue::List(entries));
    }
    out
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Serve `resource` with the given schema material.
    pub fn register(&self, resource: DiscoveredResource, schema: RawSchema) {
        self.lock().kinds.insert(resource.gvk(), (resource, schema));
    }

    pub fn with_kind(self, resource: DiscoveredResource, schema: RawSchema) -> Self {
        self.register(resource, schema);
        self
    }

    pub fn discovery_calls(&self) -> u64 {
        self.lock().discovery_calls
    }

    /// The next `n` discovery calls fail as if the server were unreachable.
    pub fn fail_discoveries(&self, n: u32) {
        self.lock().failing_discoveries = n;
    }

    /// The next `n` reads fail with a 503.
    pub fn fail_gets(&self, n: u32) {
        self.lock().failing_gets = n;
    }

    pub fn set_discovery_delay(&self, d: Option<Duration>) {
        self.lock().discovery_delay = d;
    }

    pub fn set_get_delay(&self, d: Option<Duration>) {
        self.lock().get_delay = d;
    }

    /// Current object with `managedFields`, bypassing failure injection.
    pub fn object(&self, target: &ObjectRef) -> Option<DynamicValue> {
        self.lock().objects.get(&target_key(target)).map(render)
    }

    /// Mutate an object the way a controller would (an `Update` by
    /// `manager`), taking ownership of every leaf it changes.
    pub fn update_as<F>(&self, target: &ObjectRef, manager: &str, f: F) -> KeelResult<DynamicValue>
    where
        F: FnOnce(&mut DynamicValue),
    {
        let mut st = self.lock();
        let k = target_key(target);
        let Some(stored) = st.objects.get(&k).cloned() else {
            return Err(Error::not_found(target.identity().to_string()));
        };
        let mut obj = stored.object.clone();
        f(&mut obj);
        let (changed, removed) = changed_leaves(&stored.object, &obj);
        let mut managers = stored.managers;
        record_update(&mut managers, manager, &target.resource.api_version(), &changed, &removed);
        st.bump(&mut obj, Some(&stored.object), (&target.name, target.namespace.as_deref()));
        let next = Stored { object: obj, managers };
        let out = render(&next);
        st.objects.insert(k, next);
        Ok(out)
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn discover(&self, gvk: &Gvk) -> KeelResult<DiscoveredResource> {
        let delay = self.lock().discovery_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.lock();
        st.discovery_calls += 1;
        if st.failing_discoveries > 0 {
            st.failing_discoveries -= 1;
            return Err(ErrorKind::DiscoveryUnavailable { gvk: gvk.key(), message: "connection refused".into() }.into());
        }
        match st.kinds.get(gvk) {
            Some((r, _)) => Ok(r.clone()),
            None => Err(ErrorKind::UnknownKind { gvk: gvk.key() }.into()),
        }
    }

    async fn fetch_schema(&self, resource: &DiscoveredResource) -> KeelResult<RawSchema> {
        let st = self.lock();
        Ok(st.kinds.get(&resource.gvk()).map(|(_, s)| s.clone()).unwrap_or(RawSchema::Missing))
    }

    async fn get(&self, target: &ObjectRef) -> KeelResult<Option<DynamicValue>> {
        let delay = self.lock().get_delay;
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut st = self.lock();
        if st.failing_gets > 0 {
            st.failing_gets -= 1;
            return Err(ErrorKind::Remote { code: 503, message: "ServiceUnavailable: etcd leader changed".into() }.into());
        }
        Ok(st.objects.get(&target_key(target)).map(render))
    }

    async fn apply(&self, target: &ObjectRef, body: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue> {
        let mut st = self.lock();
        let k = target_key(target);
        let new_fields = leaf_fields(body);
        let manager = params.field_manager.as_str();
        let existing = st.objects.get(&k).cloned();

        let (mut obj, mut managers) = match &existing {
            Some(s) => (s.object.clone(), s.managers.clone()),
            None => (DynamicValue::map(), Vec::new()),
        };

        let mut conflicts: Vec<FieldConflict> = Vec::new();
        for path in new_fields.members() {
            if obj.get_path(&path) == body.get_path(&path) {
                continue;
            }
            for e in managers.iter().filter(|e| e.manager != manager && e.fields.touches(&path)) {
                conflicts.push(FieldConflict { path: path.clone(), manager: e.manager.clone() });
            }
        }
        conflicts.sort();
        conflicts.dedup();
        if !conflicts.is_empty() && !params.force {
            debug!(object = %target.identity(), manager, conflicts = conflicts.len(), "apply rejected");
            return Err(ErrorKind::Conflict { manager: manager.to_string(), conflicts }.into());
        }

        if let Some(prev) = managers.iter().find(|e| e.manager == manager && e.operation == ManagedOperation::Apply) {
            for p in prev.fields.members() {
                let shared = managers.iter().any(|e| e.manager != manager && e.fields.touches(&p));
                if !new_fields.touches(&p) && !shared {
                    obj.remove_path(&p);
                }
            }
        }
        merge_into(&mut obj, body);

        for c in &conflicts {
            for e in managers.iter_mut().filter(|e| e.manager != manager) {
                e.fields.remove(&c.path);
            }
        }
        managers.retain(|e| !(e.manager == manager && e.operation == ManagedOperation::Apply));
        if !new_fields.is_empty() {
            managers.push(ManagedEntry {
                manager: manager.to_string(),
                operation: ManagedOperation::Apply,
                api_version: Some(target.resource.api_version()),
                subresource: None,
                fields: new_fields,
            });
        }
        managers.retain(|e| !e.fields.is_empty());

        st.bump(&mut obj, existing.as_ref().map(|s| &s.object), (&target.name, target.namespace.as_deref()));
        let next = Stored { object: obj, managers };
        let out = render(&next);
        if !params.dry_run {
            st.objects.insert(k, next);
        }
        Ok(out)
    }

    async fn merge_patch(&self, target: &ObjectRef, patch: &DynamicValue, params: &WriteParams) -> KeelResult<DynamicValue> {
        let mut st = self.lock();
        let k = target_key(target);
        let Some(stored) = st.objects.get(&k).cloned() else {
            return Err(Error::not_found(target.identity().to_string()));
        };
        let mut obj = stored.object.clone();
        merge_patch_into(&mut obj, patch);
        let (changed, removed) = changed_leaves(&stored.object, &obj);
        let mut managers = stored.managers;
        record_update(&mut managers, &params.field_manager, &target.resource.api_version(), &changed, &removed);
        st.bump(&mut obj, Some(&stored.object), (&target.name, target.namespace.as_deref()));
        let next = Stored { object: obj, managers };
        let out = render(&next);
        if !params.dry_run {
            st.objects.insert(k, next);
        }
        Ok(out)
    }

    async fn create(
        &self,
        resource: &DiscoveredResource,
        namespace: Option<&str>,
        body: &DynamicValue,
        params: &WriteParams,
    ) -> KeelResult<DynamicValue> {
        let namespace = scoped_namespace(resource, namespace)?;
        let mut st = self.lock();
        let meta = body.get("metadata");
        let name = match meta.and_then(|m| m.get("name")).and_then(DynamicValue::as_str).filter(|n| !n.is_empty()) {
            Some(n) => n.to_string(),
            None => {
                let prefix = meta
                    .and_then(|m| m.get("generateName"))
                    .and_then(DynamicValue::as_str)
                    .ok_or_else(|| Error::invalid("metadata.name or metadata.generateName is required"))?;
                st.next_uid += 1;
                format!("{}{:05x}", prefix, st.next_uid * 7919 % 0xfffff)
            }
        };
        let k = key(resource, namespace.as_deref(), &name);
        if st.objects.contains_key(&k) {
            return Err(ErrorKind::Remote { code: 409, message: format!("AlreadyExists: {} {:?} already exists", resource.plural, name) }.into());
        }
        let mut obj = body.clone();
        let mut managers = Vec::new();
        let (changed, _) = changed_leaves(&DynamicValue::map(), &obj);
        record_update(&mut managers, &params.field_manager, &resource.api_version(), &changed, &[]);
        st.bump(&mut obj, None, (&name, namespace.as_deref()));
        let next = Stored { object: obj, managers };
        let out = render(&next);
        if !params.dry_run {
            st.objects.insert(k, next);
        }
        Ok(out)
    }

    async fn delete(&self, target: &ObjectRef, dry_run: bool) -> KeelResult<bool> {
        let mut st = self.lock();
        let k = target_key(target);
        if dry_run {
            return Ok(st.objects.contains_key(&k));
        }
        Ok(st.objects.remove(&k).is_some())
    }
}
