use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::info;

/// What to do with traffic for a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Terminate TLS and range-split large downloads.
    Accelerate,
    /// Single-stream splice to the origin.
    PassThrough,
    /// Pin to one interface. Currently handled like `PassThrough`.
    Isolate,
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(rename = "ActionAccelerate", default)]
    accelerate: Vec<String>,
    #[serde(rename = "ActionPassThrough", default)]
    pass_through: Vec<String>,
    #[serde(rename = "ActionIso", default)]
    isolate: Vec<String>,
}

/// Host policy table. Exact host match wins, then the `*` wildcard, then a
/// permissive `Accelerate` default.
pub struct PolicyStore {
    policies: RwLock<HashMap<String, Action>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn check(&self, host: &str) -> Action {
        let policies = self.policies.read().expect("policy lock poisoned");
        if let Some(action) = policies.get(host) {
            return *action;
        }
        if let Some(action) = policies.get("*") {
            return *action;
        }
        Action::Accelerate
    }

    /// Load `HostPolicy.json`. The wildcard entry is always forced to
    /// `Accelerate` after a successful load.
    pub fn load(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read policy file {}", path.display()))?;
        let file: PolicyFile = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse policy file {}", path.display()))?;

        let mut policies = self.policies.write().expect("policy lock poisoned");
        for host in file.accelerate {
            policies.insert(host, Action::Accelerate);
        }
        for host in file.pass_through {
            policies.insert(host, Action::PassThrough);
        }
        for host in file.isolate {
            policies.insert(host, Action::Isolate);
        }
        policies.insert("*".to_string(), Action::Accelerate);
        info!("loaded {} host policies", policies.len());
        Ok(())
    }
}
