use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use quotio_provider_core::normalize_provider;

/// One `(provider, modelId)` entry of a fallback chain. Lower `priority`
/// numbers are preferred, the usual ordering-number convention; this is the
/// opposite axis from the selector's credential priority, where higher wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub priority: i64,
}

/// A user-defined model alias resolving to an ordered provider chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entries: Vec<FallbackEntry>,
}

impl VirtualModel {
    /// Entries in dispatch order, normalised provider tags, stable for equal
    /// priorities.
    pub fn ordered_entries(&self) -> Vec<FallbackEntry> {
        let mut entries: Vec<FallbackEntry> = self
            .entries
            .iter()
            .map(|entry| FallbackEntry {
                provider: normalize_provider(&entry.provider),
                model_id: entry.model_id.clone(),
                priority: entry.priority,
            })
            .collect();
        entries.sort_by_key(|entry| entry.priority);
        entries
    }
}

/// The single JSON document behind virtual-model routing. External tools
/// edit it in place; the watcher swaps the whole object on change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub virtual_models: Vec<VirtualModel>,
}

impl FallbackConfig {
    pub const FILE_NAME: &'static str = "fallback.json";

    /// A missing file is an empty, disabled configuration.
    pub async fn load(path: &Path) -> io::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    /// Resolve a requested model name against the configured aliases.
    pub fn resolve(&self, model: &str) -> Option<&VirtualModel> {
        if !self.enabled {
            return None;
        }
        self.virtual_models
            .iter()
            .find(|vm| vm.name == model || vm.id == model)
    }
}
