//! Readiness predicates: pure checks over a fetched object.

use keel_core::{DynamicValue, FieldPath};
use regex::Regex;

/// Decides whether an object is ready. Must be pure and cheap; an `Err`
/// ends the wait as failed.
pub trait ReadinessPredicate: Send + Sync {
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String>;

    fn describe(&self) -> String {
        "custom predicate".to_string()
    }
}

impl<F> ReadinessPredicate for F
where
    F: Fn(&DynamicValue) -> bool + Send + Sync,
{
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String> {
        Ok(self(object))
    }
}

/// Scalar rendering used for regex matching; `None` for maps and lists.
fn render_scalar(v: &DynamicValue) -> Option<String> {
    match v {
        DynamicValue::String(s) => Some(s.clone()),
        DynamicValue::Number(n) => Some(n.to_string()),
        DynamicValue::Bool(b) => Some(b.to_string()),
        DynamicValue::Null => Some("null".to_string()),
        _ => None,
    }
}

/// Every listed path holds a scalar matching its regex.
#[derive(Debug, Clone)]
pub struct FieldsMatch {
    fields: Vec<(FieldPath, Regex)>,
}

impl FieldsMatch {
    pub fn new(fields: Vec<(FieldPath, Regex)>) -> Self {
        Self { fields }
    }

    /// Parse `path=regex` pairs, e.g. `status.phase=^Running$`.
    pub fn parse<'a, I: IntoIterator<Item = &'a str>>(specs: I) -> Result<Self, String> {
        let mut fields = Vec::new();
        for spec in specs {
            let (path, re) = spec.split_once('=').ok_or_else(|| format!("expected path=regex, got {spec:?}"))?;
            let path = FieldPath::parse(path.trim())?;
            let re = Regex::new(re).map_err(|e| format!("invalid regex for {path}: {e}"))?;
            fields.push((path, re));
        }
        Ok(Self { fields })
    }
}

impl ReadinessPredicate for FieldsMatch {
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String> {
        Ok(self.fields.iter().all(|(path, re)| {
            object.get_path(path).and_then(render_scalar).map_or(false, |s| re.is_match(&s))
        }))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.fields.iter().map(|(p, re)| format!("{p}=~{}", re.as_str())).collect();
        format!("fields {}", parts.join(", "))
    }
}

/// `status.conditions` holds an entry with the given type and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionMatch {
    pub condition: String,
    pub status: String,
}

impl ConditionMatch {
    pub fn new(condition: impl Into<String>, status: impl Into<String>) -> Self {
        Self { condition: condition.into(), status: status.into() }
    }

    /// `Type=Status`; status defaults to `True`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        match spec.split_once('=') {
            Some((t, s)) if !t.is_empty() && !s.is_empty() => Ok(Self::new(t, s)),
            Some(_) => Err(format!("expected Type=Status, got {spec:?}")),
            None if !spec.is_empty() => Ok(Self::new(spec, "True")),
            None => Err("empty condition".to_string()),
        }
    }
}

impl ReadinessPredicate for ConditionMatch {
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String> {
        let Some(conds) = object.get("status").and_then(|s| s.get("conditions")).and_then(DynamicValue::as_list) else {
            return Ok(false);
        };
        Ok(conds.iter().any(|c| {
            c.get("type").and_then(DynamicValue::as_str) == Some(self.condition.as_str())
                && c.get("status").and_then(DynamicValue::as_str) == Some(self.status.as_str())
        }))
    }

    fn describe(&self) -> String {
        format!("condition {}={}", self.condition, self.status)
    }
}

/// Workload rollout finished: the controller observed the latest generation
/// and every replica is updated and available.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rollout;

fn int_at(obj: &DynamicValue, path: &[&str]) -> Option<i64> {
    let mut cur = obj;
    for k in path {
        cur = cur.get(k)?;
    }
    cur.as_i64()
}

fn generation_observed(obj: &DynamicValue) -> bool {
    let generation = int_at(obj, &["metadata", "generation"]).unwrap_or(0);
    int_at(obj, &["status", "observedGeneration"]).map_or(false, |g| g >= generation)
}

impl ReadinessPredicate for Rollout {
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String> {
        let kind = object.get("kind").and_then(DynamicValue::as_str).unwrap_or_default();
        let status = |k: &str| int_at(object, &["status", k]).unwrap_or(0);
        match kind {
            "Deployment" => {
                let want = int_at(object, &["spec", "replicas"]).unwrap_or(1);
                Ok(generation_observed(object)
                    && status("updatedReplicas") == want
                    && status("availableReplicas") == want
                    && status("replicas") == want)
            }
            "StatefulSet" => {
                let want = int_at(object, &["spec", "replicas"]).unwrap_or(1);
                let rev = |k: &str| object.get("status").and_then(|s| s.get(k)).and_then(DynamicValue::as_str);
                let revisions_match = match (rev("updateRevision"), rev("currentRevision")) {
                    (Some(u), Some(c)) => u == c,
                    _ => true,
                };
                Ok(generation_observed(object)
                    && revisions_match
                    && status("readyReplicas") == want
                    && status("updatedReplicas") == want)
            }
            "DaemonSet" => {
                let want = status("desiredNumberScheduled");
                Ok(generation_observed(object)
                    && status("updatedNumberScheduled") == want
                    && status("numberAvailable") == want)
            }
            other => Err(format!("rollout wait is not supported for kind {other:?}")),
        }
    }

    fn describe(&self) -> String {
        "rollout".to_string()
    }
}

/// All inner predicates hold.
pub struct AllOf(pub Vec<Box<dyn ReadinessPredicate>>);

impl ReadinessPredicate for AllOf {
    fn evaluate(&self, object: &DynamicValue) -> Result<bool, String> {
        for p in &self.0 {
            if !p.evaluate(object)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn describe(&self) -> String {
        self.0.iter().map(|p| p.describe()).collect::<Vec<_>>().join(" and ")
    }
}
