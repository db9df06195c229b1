// Declared capabilities and host-supplied utility functions.
//
// A payload carries the set of inert capabilities it may use. Anything
// outside the set fails with a security error at the call site. Utilities
// are pure host functions over JSON exposed to scripts as `utils.<name>`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `Math.*`
    Math,
    /// `JSON.parse` / `JSON.stringify`
    Json,
    /// String methods
    Text,
    /// Array and object helpers
    Collections,
    /// `console.*`
    Logger,
    /// `utils.*`
    Utilities,
}

impl Capability {
    pub fn all() -> CapabilitySet {
        [
            Capability::Math,
            Capability::Json,
            Capability::Text,
            Capability::Collections,
            Capability::Logger,
            Capability::Utilities,
        ]
        .into_iter()
        .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Math => "math",
            Capability::Json => "json",
            Capability::Text => "text",
            Capability::Collections => "collections",
            Capability::Logger => "logger",
            Capability::Utilities => "utilities",
        }
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

/// Opaque script body plus the capabilities it declares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPayload {
    pub code: String,
    #[serde(default = "Capability::all")]
    pub capabilities: CapabilitySet,
}

impl ScriptPayload {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            capabilities: Capability::all(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }
}

pub type UtilityFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named host functions callable as `utils.<name>(...)`
#[derive(Clone, Default)]
pub struct UtilityRegistry {
    functions: HashMap<String, UtilityFn>,
}

impl UtilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<&UtilityFn> {
        self.functions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for UtilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtilityRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
