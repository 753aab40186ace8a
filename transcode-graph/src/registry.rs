//! Capability provider lookup.
//!
//! The graph never instantiates processing elements itself; it asks a
//! [`PluginRegistry`] for them by capability. A `None` answer means the
//! capability is not installed and is reported as
//! [`GraphError::MissingCapability`](crate::error::GraphError::MissingCapability).

use std::{collections::HashSet, fmt, sync::Arc};

use crate::{
    caps::Caps,
    decoder::DemuxDecoder,
    element::{Element, PadDirection, PadTemplate},
    profile::LeafProfile,
    stream_type::MediaKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Decode,
    Duplicate,
    Encode,
    SegmentedWrite,
    FileWrite,
}

impl Capability {
    pub fn factory(self) -> &'static str {
        match self {
            Capability::Decode => "decodebin",
            Capability::Duplicate => "tee",
            Capability::Encode => "encodebin",
            Capability::SegmentedWrite => "hlssink2",
            Capability::FileWrite => "filesink",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.factory())
    }
}

pub trait PluginRegistry: Send + Sync {
    /// Demultiplex+decode stage for the input called `input`, together with
    /// the driver that reports its streams.
    fn make_decoder(&self, input: &str) -> Option<(Element, Box<dyn DemuxDecoder>)>;

    /// Elements that need no parameters: duplicators and writers.
    fn make_element(&self, capability: Capability, name: &str) -> Option<Element>;

    /// Encode stage for `leaf`. The stage exposes a `video_0` / `audio_0`
    /// input only when an installed encoder can produce the leaf format.
    fn make_encoder(&self, leaf: &LeafProfile, name: &str) -> Option<Element>;

    fn can_encode(&self, leaf: &LeafProfile) -> bool;
}

/// An encoder implementation known to the registry.
#[derive(Clone, Debug)]
pub struct EncoderInfo {
    pub factory: String,
    pub kind: MediaKind,
    pub caps: Caps,
}

pub type DecoderFactory = Arc<dyn Fn(&str) -> Box<dyn DemuxDecoder> + Send + Sync>;

/// Registry backed by an explicit list of installed capabilities.
#[derive(Clone)]
pub struct StaticRegistry {
    installed: HashSet<Capability>,
    encoders: Vec<EncoderInfo>,
    tee_sink_caps: Caps,
    decoder: Option<DecoderFactory>,
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl StaticRegistry {
    /// Nothing installed.
    pub fn empty() -> Self {
        Self {
            installed: HashSet::new(),
            encoders: Vec::new(),
            tee_sink_caps: Caps::any(),
            decoder: None,
        }
    }

    /// Duplicator, writers, an H.264 and an AAC encoder. Decoding needs a
    /// driver and is installed with [`StaticRegistry::with_decoder`].
    pub fn standard() -> Self {
        let h264 = "video/x-h264"
            .parse()
            .unwrap_or_else(|_| Caps::new_simple("video/x-h264"));
        let aac = "audio/mpeg, mpegversion=4"
            .parse()
            .unwrap_or_else(|_| Caps::new_simple("audio/mpeg"));

        Self::empty()
            .with_capability(Capability::Duplicate)
            .with_capability(Capability::Encode)
            .with_capability(Capability::SegmentedWrite)
            .with_capability(Capability::FileWrite)
            .with_encoder("x264enc", MediaKind::Video, h264)
            .with_encoder("avenc_aac", MediaKind::Audio, aac)
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.installed.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.installed.remove(&capability);
        if capability == Capability::Decode {
            self.decoder = None;
        }
        self
    }

    pub fn with_encoder(mut self, factory: &str, kind: MediaKind, caps: Caps) -> Self {
        self.encoders.push(EncoderInfo {
            factory: factory.to_string(),
            kind,
            caps,
        });
        self
    }

    pub fn without_encoders(mut self) -> Self {
        self.encoders.clear();
        self
    }

    /// Restricts what the duplicator accepts on its input.
    pub fn with_tee_sink_caps(mut self, caps: Caps) -> Self {
        self.tee_sink_caps = caps;
        self
    }

    pub fn with_decoder<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Box<dyn DemuxDecoder> + Send + Sync + 'static,
    {
        self.installed.insert(Capability::Decode);
        self.decoder = Some(Arc::new(factory));
        self
    }

    pub fn encoders(&self) -> &[EncoderInfo] {
        &self.encoders
    }

    fn find_encoder(&self, leaf: &LeafProfile) -> Option<&EncoderInfo> {
        if !self.installed.contains(&Capability::Encode) {
            return None;
        }
        self.encoders
            .iter()
            .find(|e| e.kind == leaf.kind && e.caps.can_intersect(&leaf.format))
    }
}

impl PluginRegistry for StaticRegistry {
    fn make_decoder(&self, input: &str) -> Option<(Element, Box<dyn DemuxDecoder>)> {
        if !self.installed.contains(&Capability::Decode) {
            return None;
        }
        let factory = self.decoder.as_ref()?;
        let element = Element::new(
            Capability::Decode.factory(),
            &format!("{}-{}", Capability::Decode.factory(), input),
        )
        .with_template(PadTemplate::always("sink", PadDirection::Sink, Caps::any()))
        .with_template(PadTemplate::sometimes(
            "src_%u",
            PadDirection::Src,
            Caps::any(),
        ));
        Some((element, factory(input)))
    }

    fn make_element(&self, capability: Capability, name: &str) -> Option<Element> {
        if !self.installed.contains(&capability) {
            return None;
        }
        let element = Element::new(capability.factory(), name);
        let element = match capability {
            Capability::Duplicate => element
                .with_template(PadTemplate::always(
                    "sink",
                    PadDirection::Sink,
                    self.tee_sink_caps.clone(),
                ))
                .with_template(PadTemplate::request(
                    "src_%u",
                    PadDirection::Src,
                    Caps::any(),
                )),
            Capability::SegmentedWrite => element
                .with_template(PadTemplate::request(
                    MediaKind::Video.as_str(),
                    PadDirection::Sink,
                    Caps::any(),
                ))
                .with_template(PadTemplate::request(
                    MediaKind::Audio.as_str(),
                    PadDirection::Sink,
                    Caps::any(),
                )),
            Capability::FileWrite => {
                element.with_template(PadTemplate::always("sink", PadDirection::Sink, Caps::any()))
            }
            // need per-input or per-profile parameters
            Capability::Decode | Capability::Encode => return None,
        };
        Some(element)
    }

    fn make_encoder(&self, leaf: &LeafProfile, name: &str) -> Option<Element> {
        if !self.installed.contains(&Capability::Encode) {
            return None;
        }
        let mut element = Element::new(Capability::Encode.factory(), name)
            .with_property("profile", &leaf.format)
            .with_template(PadTemplate::always(
                "src",
                PadDirection::Src,
                leaf.format.clone(),
            ));
        if let Some(encoder) = self.find_encoder(leaf) {
            element = element
                .with_property("encoder", &encoder.factory)
                .with_template(PadTemplate::always(
                    &format!("{}_0", leaf.kind),
                    PadDirection::Sink,
                    leaf.kind.raw_caps(),
                ));
        }
        Some(element)
    }

    fn can_encode(&self, leaf: &LeafProfile) -> bool {
        self.find_encoder(leaf).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ManifestDecoder;

    fn caps(s: &str) -> Caps {
        s.parse().unwrap()
    }

    #[test]
    fn test_standard_encoders() {
        let registry = StaticRegistry::standard();
        let h264 = LeafProfile::video(caps("video/x-h264, profile=main"));
        let vp8 = LeafProfile::video(caps("video/x-vp8"));
        let aac = LeafProfile::audio(caps("audio/mpeg, mpegversion=4"));
        let mp3 = LeafProfile::audio(caps("audio/mpeg, mpegversion=1"));

        assert!(registry.can_encode(&h264));
        assert!(!registry.can_encode(&vp8));
        assert!(registry.can_encode(&aac));
        assert!(!registry.can_encode(&mp3));

        let enc = registry.make_encoder(&h264, "enc").unwrap();
        assert!(enc.pad("video_0").is_some());
        assert_eq!(enc.property("encoder"), Some("x264enc"));
        let enc = registry.make_encoder(&vp8, "enc").unwrap();
        assert!(enc.pad("video_0").is_none());
        assert!(enc.pad("src").is_some());
    }

    #[test]
    fn test_missing_capabilities() {
        let registry = StaticRegistry::standard().without(Capability::SegmentedWrite);
        assert!(registry.make_element(Capability::SegmentedWrite, "w").is_none());
        assert!(registry.make_element(Capability::Duplicate, "t").is_some());
        // no decoder driver installed by default
        assert!(registry.make_decoder("sink").is_none());

        let registry = StaticRegistry::standard().without(Capability::Encode);
        let h264 = LeafProfile::video(caps("video/x-h264"));
        assert!(!registry.can_encode(&h264));
        assert!(registry.make_encoder(&h264, "enc").is_none());
    }

    #[test]
    fn test_decoder_factory() {
        let registry = StaticRegistry::standard()
            .with_decoder(|_| Box::new(ManifestDecoder::new(vec![caps("video/x-raw")])));
        let (element, _driver) = registry.make_decoder("sink_3").unwrap();
        assert_eq!(element.name(), "decodebin-sink_3");
        assert!(element.pad("sink").is_some());

        let registry = registry.without(Capability::Decode);
        assert!(registry.make_decoder("sink").is_none());
    }

    #[test]
    fn test_tee_sink_caps_override() {
        let registry = StaticRegistry::standard().with_tee_sink_caps(caps("video/x-raw"));
        let tee = registry.make_element(Capability::Duplicate, "tee0").unwrap();
        assert_eq!(tee.pad("sink").unwrap().caps(), &caps("video/x-raw"));
        assert!(tee.pad("src_0").is_none());
    }
}
