use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Group/Version/Kind of a served resource (incl. CRDs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Split an `apiVersion` (`v1` or `apps/v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((g, v)) => Self::new(g, v, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Parse "v1/Kind" or "group/v1/Kind".
    pub fn parse_key(key: &str) -> Result<Self, Error> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(ErrorKind::Invalid { path: None, message: format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key) }.into()),
        }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl std::fmt::Display for Gvk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectName {
    Named(String),
    /// `metadata.generateName` prefix; the server picks the final name on create.
    Generated(String),
}

/// Uniquely addresses one remote object. Never mutated in place: resolving a
/// generated name produces a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_group: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: ObjectName,
}

impl ResourceIdentity {
    pub fn new(gvk: &Gvk, namespace: Option<&str>, name: ObjectName) -> Self {
        Self {
            api_group: gvk.group.clone(),
            api_version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
            name,
        }
    }

    pub fn named(gvk: &Gvk, namespace: Option<&str>, name: &str) -> Self {
        Self::new(gvk, namespace, ObjectName::Named(name.to_string()))
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.api_group, &self.api_version, &self.kind)
    }

    /// Concrete name, if one is known.
    pub fn name(&self) -> Option<&str> {
        match &self.name {
            ObjectName::Named(n) => Some(n),
            ObjectName::Generated(_) => None,
        }
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.name, ObjectName::Generated(_))
    }

    pub fn resolve_name(&self, name: &str) -> Self {
        Self { name: ObjectName::Named(name.to_string()), ..self.clone() }
    }
}

impl std::fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ", self.gvk().key())?;
        if let Some(ns) = &self.namespace {
            write!(f, "{}/", ns)?;
        }
        match &self.name {
            ObjectName::Named(n) => f.write_str(n),
            ObjectName::Generated(prefix) => write!(f, "{}*", prefix),
        }
    }
}
