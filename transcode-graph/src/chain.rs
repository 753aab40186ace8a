//! Output Chains: one encode+mux+write fragment per profile.

use std::path::PathBuf;

use serde::Serialize;

use crate::{
    config::TranscodeConfig,
    element::{Element, ElementGraph, ElementId, PadRef},
    error::{GraphError, Result},
    preset::PresetStore,
    profile::{ContainerProfile, LeafProfile, Profile},
    registry::{Capability, PluginRegistry},
    stream_type::MediaKind,
};

const SEGMENTED_FORMAT_PREFIX: &str = "application/x-hls";

pub struct OutputChain {
    name: String,
    profile: String,
    bin: ElementId,
    writer: ElementId,
    encoders: Vec<ElementId>,
    video_sink: Option<PadRef>,
    audio_sink: Option<PadRef>,
    output: ChainOutput,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChainOutput {
    pub dir: PathBuf,
    /// Segment name template, or the file path for single-file output.
    pub location: String,
    pub playlist: Option<String>,
    pub target_duration: Option<u32>,
}

impl OutputChain {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn bin(&self) -> ElementId {
        self.bin
    }

    pub fn writer(&self) -> ElementId {
        self.writer
    }

    pub fn encoders(&self) -> &[ElementId] {
        &self.encoders
    }

    pub fn output(&self) -> &ChainOutput {
        &self.output
    }

    pub fn sink(&self, kind: MediaKind) -> Option<&PadRef> {
        match kind {
            MediaKind::Video => self.video_sink.as_ref(),
            MediaKind::Audio => self.audio_sink.as_ref(),
        }
    }
}

pub struct ChainBuilder<'a> {
    pub graph: &'a mut ElementGraph,
    pub registry: &'a dyn PluginRegistry,
    pub presets: &'a dyn PresetStore,
    pub config: &'a TranscodeConfig,
}

impl ChainBuilder<'_> {
    /// Builds the chain for `profile` as `name`. On failure nothing of the
    /// chain is left in the graph.
    pub fn build(&mut self, profile: &Profile, name: &str) -> Result<OutputChain> {
        let Profile::Container(container) = profile else {
            return Err(GraphError::UnsupportedProfile {
                profile: profile.name().to_string(),
                reason: "not a container profile".to_string(),
            });
        };
        if container.format.is_empty() || container.format.is_any() {
            return Err(GraphError::UnsupportedProfile {
                profile: container.name.clone(),
                reason: "no output format".to_string(),
            });
        }

        validate_children(container)?;

        let bin = self.graph.add(Element::new("bin", name), None)?;
        match self.populate(container, name, bin) {
            Ok(chain) => Ok(chain),
            Err(e) => {
                self.graph.remove(bin);
                Err(e)
            }
        }
    }

    fn populate(
        &mut self,
        profile: &ContainerProfile,
        name: &str,
        bin: ElementId,
    ) -> Result<OutputChain> {
        let dir = self.config.output_dir(&profile.name);
        std::fs::create_dir_all(&dir).map_err(|e| GraphError::io(&dir, e))?;

        let segmented = profile
            .format
            .first_name()
            .is_some_and(|n| n.starts_with(SEGMENTED_FORMAT_PREFIX));

        let (writer, output) = if segmented {
            self.add_segmented_writer(profile, bin, dir)?
        } else {
            self.add_file_writer(profile, bin, dir)?
        };

        let mut chain = OutputChain {
            name: name.to_string(),
            profile: profile.name.clone(),
            bin,
            writer,
            encoders: Vec::new(),
            video_sink: None,
            audio_sink: None,
            output,
        };
        if !segmented {
            return Ok(chain);
        }

        for leaf in profile.children.iter().filter_map(Profile::as_leaf) {
            self.add_encoder(&mut chain, &profile.name, leaf)?;
        }

        Ok(chain)
    }

    fn add_segmented_writer(
        &mut self,
        profile: &ContainerProfile,
        bin: ElementId,
        dir: PathBuf,
    ) -> Result<(ElementId, ChainOutput)> {
        let factory = Capability::SegmentedWrite;
        let element = self
            .registry
            .make_element(factory, factory.factory())
            .ok_or_else(|| GraphError::MissingCapability {
                factory: factory.factory().to_string(),
            })?;

        let location = format!("{}/{}%05d.ts", dir.display(), profile.name);
        let playlist = format!("{}/playlist.m3u8", dir.display());
        let element = element
            .with_property("location", &location)
            .with_property("playlist-location", &playlist)
            .with_property("target-duration", self.config.target_duration);
        let writer = self.graph.add(element, Some(bin))?;

        Ok((
            writer,
            ChainOutput {
                dir,
                location,
                playlist: Some(playlist),
                target_duration: Some(self.config.target_duration),
            },
        ))
    }

    /// Single-file output. Encoding for these formats is not wired yet.
    fn add_file_writer(
        &mut self,
        profile: &ContainerProfile,
        bin: ElementId,
        dir: PathBuf,
    ) -> Result<(ElementId, ChainOutput)> {
        log::warn!(
            "profile {}: format {} is written to a single file without encoding",
            profile.name,
            profile.format
        );
        let factory = Capability::FileWrite;
        let element = self
            .registry
            .make_element(factory, factory.factory())
            .ok_or_else(|| GraphError::MissingCapability {
                factory: factory.factory().to_string(),
            })?;

        let location = format!("{}/{}", dir.display(), profile.name);
        let writer = self
            .graph
            .add(element.with_property("location", &location), Some(bin))?;

        Ok((
            writer,
            ChainOutput {
                dir,
                location,
                playlist: None,
                target_duration: None,
            },
        ))
    }

    fn add_encoder(
        &mut self,
        chain: &mut OutputChain,
        profile: &str,
        leaf: &LeafProfile,
    ) -> Result<()> {
        let name = format!("encodebin-{}", leaf.kind);
        let mut element = self.registry.make_encoder(leaf, &name).ok_or_else(|| {
            GraphError::MissingCapability {
                factory: Capability::Encode.factory().to_string(),
            }
        })?;

        if let Some(restriction) = &leaf.restriction {
            element = element.with_property("restriction", restriction);
        }
        if let Some(preset_name) = &leaf.preset {
            match self.presets.load(preset_name) {
                Some(preset) => {
                    element = element.with_property("preset", preset_name);
                    for (key, value) in &preset.properties {
                        element = element.with_property(key, value);
                    }
                }
                None => log::warn!("profile {}: unknown preset {}", profile, preset_name),
            }
        }

        let encoder = self.graph.add(element, Some(chain.bin))?;
        chain.encoders.push(encoder);

        let Some(sink) = self.graph.static_pad(encoder, &format!("{}_0", leaf.kind)) else {
            return Err(GraphError::CannotEncode {
                profile: profile.to_string(),
                caps: leaf.format.clone(),
            });
        };

        let src = self
            .graph
            .static_pad(encoder, "src")
            .ok_or_else(|| GraphError::structure(format!("{} has no src pad", name)))?;
        let writer_pad = self
            .graph
            .request_pad(chain.writer, leaf.kind.as_str())
            .ok_or_else(|| {
                GraphError::structure(format!("writer of {} has no {} pad", profile, leaf.kind))
            })?;
        self.graph.link(&src, &writer_pad)?;
        self.graph.sync_state_with_parent(encoder)?;

        match leaf.kind {
            MediaKind::Video => chain.video_sink = Some(sink),
            MediaKind::Audio => chain.audio_sink = Some(sink),
        }
        log::debug!("{}: {} encoder ready for profile {}", chain.name, leaf.kind, profile);
        Ok(())
    }
}

/// Children must be leaves, at most one per media kind.
fn validate_children(profile: &ContainerProfile) -> Result<()> {
    let mut seen = Vec::with_capacity(2);
    for child in &profile.children {
        let Profile::Leaf(leaf) = child else {
            return Err(GraphError::UnsupportedProfile {
                profile: profile.name.clone(),
                reason: format!("nested container profile '{}'", child.name()),
            });
        };
        if seen.contains(&leaf.kind) {
            return Err(GraphError::UnsupportedProfile {
                profile: profile.name.clone(),
                reason: format!("more than one {} profile", leaf.kind),
            });
        }
        seen.push(leaf.kind);
    }
    Ok(())
}
