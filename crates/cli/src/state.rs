//! Host-side state file: one `ManifestState` per declared manifest, keyed by
//! the identity as written (generated names keep their prefix key).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use keel_api::ManifestState;
use serde::{Deserialize, Serialize};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub objects: BTreeMap<String, ManifestState>,
}

impl StateFile {
    /// Missing file means empty state.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self { version: STATE_VERSION, objects: BTreeMap::new() })
            }
            Err(e) => return Err(e).with_context(|| format!("reading state {}", path.display())),
        };
        let state: StateFile =
            serde_json::from_str(&text).with_context(|| format!("parsing state {}", path.display()))?;
        if state.version != STATE_VERSION {
            anyhow::bail!("state {} has version {}, expected {}", path.display(), state.version, STATE_VERSION);
        }
        Ok(state)
    }

    /// Written to a temp file, then renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}
