//! Field paths within an object tree.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Map field name.
    Field(String),
    /// Positional list element.
    Index(usize),
    /// Associative list element, identified by its key fields (canonical JSON).
    Key(String),
    /// Set element, identified by its value (canonical JSON).
    Value(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(SmallVec<[PathSegment; 8]>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, seg: PathSegment) {
        self.0.push(seg);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    pub fn field(&self, name: &str) -> Self {
        let mut p = self.clone();
        p.0.push(PathSegment::Field(name.to_string()));
        p
    }

    pub fn index(&self, i: usize) -> Self {
        let mut p = self.clone();
        p.0.push(PathSegment::Index(i));
        p
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Parse `spec.ports[0].port`, `.spec.selector`,
    /// `metadata.labels["app.kubernetes.io/name"]` or
    /// `spec.containers[name="nginx"].image`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut out = FieldPath::root();
        let s = s.strip_prefix('.').unwrap_or(s);
        if s.is_empty() {
            return Ok(out);
        }
        let chars: Vec<char> = s.chars().collect();
        let mut i = 0usize;
        let mut field = String::new();
        let mut expect_field = true;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    if expect_field && field.is_empty() {
                        return Err(format!("empty segment in path {:?}", s));
                    }
                    if !field.is_empty() {
                        out.0.push(PathSegment::Field(std::mem::take(&mut field)));
                    }
                    expect_field = true;
                    i += 1;
                }
                '[' => {
                    if !field.is_empty() {
                        out.0.push(PathSegment::Field(std::mem::take(&mut field)));
                    }
                    let close = chars[i..].iter().position(|c| *c == ']').map(|p| p + i)
                        .ok_or_else(|| format!("unclosed '[' in path {:?}", s))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    if inner.is_empty() {
                        return Err(format!("empty brackets in path {:?}", s));
                    }
                    if let Some(quoted) = inner.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
                        out.0.push(PathSegment::Field(quoted.to_string()));
                    } else if let Ok(idx) = inner.parse::<usize>() {
                        out.0.push(PathSegment::Index(idx));
                    } else if let Some(v) = inner.strip_prefix('=') {
                        out.0.push(PathSegment::Value(v.to_string()));
                    } else {
                        // associative list key as reported by the server, e.g. [name="nginx"]
                        out.0.push(PathSegment::Key(inner));
                    }
                    expect_field = false;
                    i = close + 1;
                }
                c => {
                    field.push(c);
                    expect_field = false;
                    i += 1;
                }
            }
        }
        if !field.is_empty() {
            out.0.push(PathSegment::Field(field));
        } else if expect_field {
            return Err(format!("trailing '.' in path {:?}", s));
        }
        Ok(out)
    }
}

impl FromIterator<PathSegment> for FieldPath {
    fn from_iter<I: IntoIterator<Item = PathSegment>>(iter: I) -> Self {
        FieldPath(iter.into_iter().collect())
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        for seg in &self.0 {
            match seg {
                PathSegment::Field(name) => {
                    if name.contains('.') || name.contains('[') {
                        write!(f, "[{:?}]", name)?;
                    } else {
                        write!(f, ".{}", name)?;
                    }
                }
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
                PathSegment::Key(k) => write!(f, "[{}]", k)?,
                PathSegment::Value(v) => write!(f, "[={}]", v)?,
            }
        }
        Ok(())
    }
}
