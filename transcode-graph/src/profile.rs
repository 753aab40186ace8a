//! Encoding targets and profiles.
//!
//! A [`Target`] names a set of output renditions. Each top-level [`Profile`]
//! is normally a container profile grouping one video and/or one audio leaf
//! under a single muxed output; a container without children requests a
//! pass-through rendition.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    caps::{Caps, Structure},
    error::{GraphError, Result},
    preset::{DEFAULT_X264_240P_PRESET, DEFAULT_X264_480P_PRESET, DEFAULT_X264_720P_PRESET},
    registry::PluginRegistry,
    stream_type::MediaKind,
};

pub mod category {
    pub const DEVICE: &str = "device";
    pub const ONLINE_SERVICE: &str = "online-service";
    pub const STORAGE_EDITING: &str = "storage-editing";
    pub const CAPTURE: &str = "capture";
    pub const FILE_EXTENSION: &str = "file-extension";
}

pub const DEFAULT_TARGET_NAME: &str = "default-encoding-target";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Target {
    name: String,
    category: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    profiles: Vec<Profile>,
}

impl Target {
    pub fn new(name: &str, category: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            profiles: Vec::new(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<Profile>) -> Self {
        self.add_profile(profile);
        self
    }

    pub fn add_profile(&mut self, profile: impl Into<Profile>) {
        self.profiles.push(profile.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name() == name)
    }

    /// Copy of this target restricted to the profile called `name`.
    pub fn with_only_profile(&self, name: &str) -> Option<Target> {
        let profile = self.profile(name)?.clone();
        Some(Target {
            name: self.name.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            profiles: vec![profile],
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Config {
            message: format!("invalid target: {}", e),
        })
    }

    /// Loads a file holding either one target or an array of targets.
    pub fn load_all(path: &Path) -> Result<Vec<Target>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(Target),
            Many(Vec<Target>),
        }

        let text = std::fs::read_to_string(path).map_err(|e| GraphError::io(path, e))?;
        let parsed: OneOrMany = serde_json::from_str(&text).map_err(|e| GraphError::Config {
            message: format!("invalid target file {}: {}", path.display(), e),
        })?;
        Ok(match parsed {
            OneOrMany::One(target) => vec![target],
            OneOrMany::Many(targets) => targets,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Profile {
    Container(ContainerProfile),
    Leaf(LeafProfile),
}

impl Profile {
    pub fn name(&self) -> &str {
        match self {
            Profile::Container(p) => &p.name,
            Profile::Leaf(p) => p.name.as_deref().unwrap_or_default(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Profile::Container(p) => &p.description,
            Profile::Leaf(p) => &p.description,
        }
    }

    pub fn format(&self) -> &Caps {
        match self {
            Profile::Container(p) => &p.format,
            Profile::Leaf(p) => &p.format,
        }
    }

    /// Number of times this profile may be used; 0 means unlimited.
    pub fn presence(&self) -> u32 {
        match self {
            Profile::Container(p) => p.presence,
            Profile::Leaf(p) => p.presence,
        }
    }

    pub fn set_presence(&mut self, presence: u32) {
        match self {
            Profile::Container(p) => p.presence = presence,
            Profile::Leaf(p) => p.presence = presence,
        }
    }

    pub fn children(&self) -> &[Profile] {
        match self {
            Profile::Container(p) => &p.children,
            Profile::Leaf(_) => &[],
        }
    }

    pub fn as_container(&self) -> Option<&ContainerProfile> {
        match self {
            Profile::Container(p) => Some(p),
            Profile::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafProfile> {
        match self {
            Profile::Container(_) => None,
            Profile::Leaf(p) => Some(p),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub format: Caps,
    #[serde(default)]
    pub presence: u32,
    #[serde(default)]
    pub children: Vec<Profile>,
}

impl ContainerProfile {
    pub fn new(name: &str, format: Caps) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            format,
            presence: 0,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, profile: impl Into<Profile>) -> Self {
        self.add_child_profile(profile);
        self
    }

    pub fn add_child_profile(&mut self, profile: impl Into<Profile>) {
        self.children.push(profile.into());
    }

    pub fn is_passthrough(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeafProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    pub kind: MediaKind,
    pub format: Caps,
    #[serde(default)]
    pub preset: Option<String>,
    /// Raw size/framerate the input is converted to before encoding.
    #[serde(default)]
    pub restriction: Option<Caps>,
    #[serde(default)]
    pub presence: u32,
}

impl LeafProfile {
    fn new(kind: MediaKind, format: Caps) -> Self {
        Self {
            name: None,
            description: String::new(),
            kind,
            format,
            preset: None,
            restriction: None,
            presence: 0,
        }
    }

    pub fn video(format: Caps) -> Self {
        Self::new(MediaKind::Video, format)
    }

    pub fn audio(format: Caps) -> Self {
        Self::new(MediaKind::Audio, format)
    }

    pub fn with_preset(mut self, preset: &str) -> Self {
        self.preset = Some(preset.to_string());
        self
    }

    pub fn with_restriction(mut self, restriction: Caps) -> Self {
        self.restriction = Some(restriction);
        self
    }
}

impl From<ContainerProfile> for Profile {
    fn from(p: ContainerProfile) -> Self {
        Profile::Container(p)
    }
}

impl From<LeafProfile> for Profile {
    fn from(p: LeafProfile) -> Self {
        Profile::Leaf(p)
    }
}

/// True when every leaf of `profile` can be produced by an installed encoder.
pub fn is_profile_usable(registry: &dyn PluginRegistry, profile: &Profile) -> bool {
    match profile {
        Profile::Leaf(leaf) => registry.can_encode(leaf),
        Profile::Container(container) => container
            .children
            .iter()
            .all(|child| is_profile_usable(registry, child)),
    }
}

fn video_restriction(width: i32, height: i32) -> Caps {
    Structure::new("video/x-raw")
        .with("width", width)
        .with("height", height)
        .with("framerate", crate::caps::Value::Fraction(30, 1))
        .into()
}

/// Built-in HLS ladder: 720p, 480p and 240p H.264 + AAC renditions plus an
/// audio-only one.
pub fn default_target() -> Target {
    let container = Caps::new_simple("application/x-hls");
    let video: Caps = Structure::new("video/x-h264").with("profile", "main").into();
    let audio: Caps = Structure::new("audio/mpeg").with("mpegversion", 4).into();

    let ladder = [
        ("720p", DEFAULT_X264_720P_PRESET, 1280, 720),
        ("480p", DEFAULT_X264_480P_PRESET, 640, 480),
        ("240p", DEFAULT_X264_240P_PRESET, 360, 240),
    ];

    let mut target = Target::new(
        DEFAULT_TARGET_NAME,
        category::ONLINE_SERVICE,
        DEFAULT_TARGET_NAME,
    );
    for (name, preset, width, height) in ladder {
        target.add_profile(
            ContainerProfile::new(name, container.clone())
                .with_child(
                    LeafProfile::video(video.clone())
                        .with_preset(preset)
                        .with_restriction(video_restriction(width, height)),
                )
                .with_child(LeafProfile::audio(audio.clone())),
        );
    }
    target.add_profile(
        ContainerProfile::new("audio-only", container).with_child(LeafProfile::audio(audio)),
    );
    target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target_layout() {
        let target = default_target();
        assert_eq!(target.name(), DEFAULT_TARGET_NAME);
        assert_eq!(target.category(), category::ONLINE_SERVICE);

        let names: Vec<_> = target.profiles().iter().map(Profile::name).collect();
        assert_eq!(names, vec!["720p", "480p", "240p", "audio-only"]);

        let p720 = target.profile("720p").unwrap();
        assert_eq!(p720.format().first_name(), Some("application/x-hls"));
        assert_eq!(p720.children().len(), 2);
        let video = p720.children()[0].as_leaf().unwrap();
        assert_eq!(video.kind, MediaKind::Video);
        assert_eq!(video.preset.as_deref(), Some(DEFAULT_X264_720P_PRESET));
        let restriction = video.restriction.as_ref().unwrap().structure(0).unwrap();
        assert_eq!(restriction.get("width").and_then(|v| v.as_int()), Some(1280));

        let audio_only = target.profile("audio-only").unwrap();
        assert_eq!(audio_only.children().len(), 1);
        assert_eq!(
            audio_only.children()[0].as_leaf().unwrap().kind,
            MediaKind::Audio
        );
    }

    #[test]
    fn test_with_only_profile() {
        let target = default_target();
        let only = target.with_only_profile("480p").unwrap();
        assert_eq!(only.profiles().len(), 1);
        assert_eq!(only.profiles()[0].name(), "480p");
        assert!(target.with_only_profile("1080p").is_none());
    }

    #[test]
    fn test_presence_accessors() {
        let mut profile: Profile = LeafProfile::audio(Caps::new_simple("audio/mpeg")).into();
        assert_eq!(profile.presence(), 0);
        profile.set_presence(1);
        assert_eq!(profile.presence(), 1);
        assert!(profile.children().is_empty());
        assert_eq!(profile.name(), "");
    }

    #[test]
    fn test_target_from_json() {
        let json = r#"{
            "name": "web",
            "category": "online-service",
            "profiles": [
                {
                    "type": "container",
                    "name": "360p",
                    "format": "application/x-hls",
                    "children": [
                        {
                            "type": "leaf",
                            "kind": "video",
                            "format": "video/x-h264, profile=main",
                            "restriction": "video/x-raw, width=640, height=360"
                        },
                        { "type": "leaf", "kind": "audio", "format": "audio/mpeg, mpegversion=4" }
                    ]
                },
                { "type": "container", "name": "copy", "format": "video/quicktime" }
            ]
        }"#;
        let target = Target::from_json_str(json).unwrap();
        assert_eq!(target.name(), "web");
        assert_eq!(target.description(), "");
        assert_eq!(target.profiles().len(), 2);
        assert!(target.profiles()[1].as_container().unwrap().is_passthrough());
        let leaf = target.profiles()[0].children()[0].as_leaf().unwrap();
        assert_eq!(leaf.format.first_name(), Some("video/x-h264"));
        assert!(leaf.preset.is_none());

        assert!(Target::from_json_str("{\"name\": 1}").is_err());
    }

    #[test]
    fn test_load_all_accepts_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        let targets = vec![default_target(), Target::new("empty", category::DEVICE, "")];
        std::fs::write(&path, serde_json::to_string(&targets).unwrap()).unwrap();

        let loaded = Target::load_all(&path).unwrap();
        assert_eq!(loaded, targets);
    }
}
