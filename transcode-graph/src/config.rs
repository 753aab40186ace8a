use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{GraphError, Result},
    profile::Target,
};

pub const DEFAULT_TARGET_DURATION: u32 = 3;

/// Settings read by a transcode bin when it activates.
///
/// The bin holds the value behind an `Arc` and replaces it whole, so an
/// activation in progress keeps seeing the settings it started with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Parent of the per-profile output directories; `None` means the
    /// working directory.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
    /// Target segment duration in seconds, 0 for unbounded.
    #[serde(default = "default_target_duration")]
    pub target_duration: u32,
    #[serde(default)]
    pub target: Option<Arc<Target>>,
}

fn default_target_duration() -> u32 {
    DEFAULT_TARGET_DURATION
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            target_duration: DEFAULT_TARGET_DURATION,
            target: None,
        }
    }
}

impl TranscodeConfig {
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    pub fn with_target_duration(mut self, seconds: u32) -> Self {
        self.target_duration = seconds;
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(Arc::new(target));
        self
    }

    /// Directory receiving the output of the profile called `profile`.
    pub fn output_dir(&self, profile: &str) -> PathBuf {
        match &self.root_dir {
            Some(root) => root.join(profile),
            None => PathBuf::from(profile),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| GraphError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| GraphError::Config {
            message: format!("invalid config {}: {}", path.display(), e),
        })
    }
}
