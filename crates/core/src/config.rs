//! Engine configuration. Defaults are overridable from `KEEL_*` environment
//! variables; the CLI layers its flags on top.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FIELD_MANAGER: &str = "keel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyStrategy {
    /// Server-side apply with the engine's field manager.
    #[default]
    ServerSide,
    /// RFC 7386 merge patch of the minimal change set.
    MergePatch,
}

impl FromStr for ApplyStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssa" | "server-side" | "apply" => Ok(ApplyStrategy::ServerSide),
            "merge" | "merge-patch" => Ok(ApplyStrategy::MergePatch),
            other => Err(format!("unknown apply strategy {:?} (expect ssa or merge)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub timeout_secs: u64,
    /// Consecutive fetch errors tolerated before a wait fails.
    pub max_fetch_errors: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { base_ms: 250, max_ms: 5_000, timeout_secs: 600, max_fetch_errors: 3 }
    }
}

impl WaitConfig {
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.base_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Field manager identity; must stay stable across applies to one object.
    pub field_manager: String,
    pub force_conflicts: bool,
    pub strategy: ApplyStrategy,
    pub wait: WaitConfig,
    pub max_yaml_bytes: usize,
    pub max_yaml_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            force_conflicts: false,
            strategy: ApplyStrategy::ServerSide,
            wait: WaitConfig::default(),
            max_yaml_bytes: 1_000_000,
            max_yaml_nodes: 100_000,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let wait = WaitConfig {
            base_ms: env_or("KEEL_WAIT_BASE_MS", d.wait.base_ms),
            max_ms: env_or("KEEL_WAIT_MAX_MS", d.wait.max_ms),
            timeout_secs: env_or("KEEL_WAIT_TIMEOUT_SECS", d.wait.timeout_secs),
            max_fetch_errors: env_or("KEEL_WAIT_MAX_FETCH_ERRORS", d.wait.max_fetch_errors),
        };
        Self {
            field_manager: std::env::var("KEEL_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
            force_conflicts: env_flag("KEEL_FORCE_CONFLICTS").unwrap_or(d.force_conflicts),
            strategy: env_or("KEEL_APPLY_STRATEGY", d.strategy),
            wait,
            max_yaml_bytes: env_or("KEEL_MAX_YAML_BYTES", d.max_yaml_bytes),
            max_yaml_nodes: env_or("KEEL_MAX_YAML_NODES", d.max_yaml_nodes),
        }
    }
}
