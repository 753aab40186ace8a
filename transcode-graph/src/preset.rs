//! Encoder presets: named bags of encoder properties kept in a key/value
//! store and applied to encode stages by name.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

pub const DEFAULT_X264_720P_PRESET: &str = "multitranscodebin-x264-preset-720p";
pub const DEFAULT_X264_480P_PRESET: &str = "multitranscodebin-x264-preset-480p";
pub const DEFAULT_X264_240P_PRESET: &str = "multitranscodebin-x264-preset-240p";

const X264_OPTION_STRING: &str = "threads=4:bframes=0:keyint=30:min-keyint=30:scenecut=0:cabac=1";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    /// Encoder factory the preset was made for, e.g. "x264enc".
    pub encoder: String,
    pub properties: BTreeMap<String, String>,
}

impl Preset {
    pub fn new(name: &str, encoder: &str) -> Self {
        Self {
            name: name.to_string(),
            encoder: encoder.to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait PresetStore: Send + Sync {
    fn load(&self, name: &str) -> Option<Preset>;
    fn save(&self, preset: Preset) -> Result<()>;
    fn names(&self) -> Vec<String>;
}

#[derive(Default)]
pub struct MemoryPresetStore {
    presets: RwLock<BTreeMap<String, Preset>>,
}

impl MemoryPresetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresetStore for MemoryPresetStore {
    fn load(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    fn save(&self, preset: Preset) -> Result<()> {
        self.presets.write().insert(preset.name.clone(), preset);
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.presets.read().keys().cloned().collect()
    }
}

/// Presets persisted as one JSON document; every save rewrites the file.
pub struct JsonPresetStore {
    path: PathBuf,
    presets: RwLock<BTreeMap<String, Preset>>,
}

impl JsonPresetStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let presets = match std::fs::read_to_string(path) {
            Ok(text) => {
                let list: Vec<Preset> =
                    serde_json::from_str(&text).map_err(|e| GraphError::Config {
                        message: format!("invalid preset file {}: {}", path.display(), e),
                    })?;
                list.into_iter().map(|p| (p.name.clone(), p)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(GraphError::io(path, e)),
        };

        Ok(Self {
            path: path.to_path_buf(),
            presets: RwLock::new(presets),
        })
    }

    fn persist(&self, presets: &BTreeMap<String, Preset>) -> Result<()> {
        let list: Vec<&Preset> = presets.values().collect();
        let text = serde_json::to_string_pretty(&list).map_err(|e| GraphError::Config {
            message: format!("serialize presets: {}", e),
        })?;
        std::fs::write(&self.path, text).map_err(|e| GraphError::io(&self.path, e))
    }
}

impl PresetStore for JsonPresetStore {
    fn load(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    fn save(&self, preset: Preset) -> Result<()> {
        let mut presets = self.presets.write();
        let mut updated = presets.clone();
        updated.insert(preset.name.clone(), preset);
        self.persist(&updated)?;
        *presets = updated;
        Ok(())
    }

    fn names(&self) -> Vec<String> {
        self.presets.read().keys().cloned().collect()
    }
}

fn default_x264_preset(name: &str, bitrate_kbps: u32) -> Preset {
    Preset::new(name, "x264enc")
        .with("option-string", X264_OPTION_STRING)
        .with("tune", "zerolatency")
        .with("speed-preset", "faster")
        .with("bitrate", bitrate_kbps)
}

/// Creates the presets referenced by the default target. Presets that
/// already exist are left untouched, so calling this again is a no-op.
pub fn ensure_default_presets(store: &dyn PresetStore) -> Result<()> {
    let defaults = [
        (DEFAULT_X264_720P_PRESET, 2000),
        (DEFAULT_X264_480P_PRESET, 1200),
        (DEFAULT_X264_240P_PRESET, 800),
    ];
    for (name, bitrate) in defaults {
        if store.load(name).is_none() {
            log::debug!("creating default preset {}", name);
            store.save(default_x264_preset(name, bitrate))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_default_presets_is_idempotent() {
        let store = MemoryPresetStore::new();
        store
            .save(Preset::new(DEFAULT_X264_480P_PRESET, "x264enc").with("bitrate", 999))
            .unwrap();

        ensure_default_presets(&store).unwrap();
        ensure_default_presets(&store).unwrap();

        assert_eq!(store.names().len(), 3);
        let p720 = store.load(DEFAULT_X264_720P_PRESET).unwrap();
        assert_eq!(p720.properties.get("bitrate").map(String::as_str), Some("2000"));
        assert_eq!(
            p720.properties.get("option-string").map(String::as_str),
            Some(X264_OPTION_STRING)
        );
        let p240 = store.load(DEFAULT_X264_240P_PRESET).unwrap();
        assert_eq!(p240.properties.get("bitrate").map(String::as_str), Some("800"));
        // user-provided presets win over defaults
        let p480 = store.load(DEFAULT_X264_480P_PRESET).unwrap();
        assert_eq!(p480.properties.get("bitrate").map(String::as_str), Some("999"));
    }

    #[test]
    fn test_json_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");

        let store = JsonPresetStore::open(&path).unwrap();
        assert!(store.names().is_empty());
        ensure_default_presets(&store).unwrap();

        let reopened = JsonPresetStore::open(&path).unwrap();
        assert_eq!(reopened.names().len(), 3);
        assert_eq!(
            reopened.load(DEFAULT_X264_720P_PRESET),
            store.load(DEFAULT_X264_720P_PRESET)
        );
    }

    #[test]
    fn test_json_store_failed_save_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("presets.json");

        let store = JsonPresetStore::open(&path).unwrap();
        assert!(matches!(
            store.save(Preset::new("custom", "x264enc")),
            Err(GraphError::Io { .. })
        ));
        assert!(store.names().is_empty());
        assert!(store.load("custom").is_none());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonPresetStore::open(&path),
            Err(GraphError::Config { .. })
        ));
    }
}
