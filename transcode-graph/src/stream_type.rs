use std::fmt;

use serde::{Deserialize, Serialize};

use crate::caps::Caps;

/// Coarse type of an elementary stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Video,
    Audio,
    Text,
    Unknown,
}

/// Media kind of a leaf profile and of an output chain sink port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl StreamType {
    /// The sink port kind this stream may be routed to.
    pub fn media_kind(self) -> Option<MediaKind> {
        match self {
            StreamType::Video => Some(MediaKind::Video),
            StreamType::Audio => Some(MediaKind::Audio),
            StreamType::Text | StreamType::Unknown => None,
        }
    }
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }

    /// Caps accepted by an encode stage input of this kind.
    pub fn raw_caps(self) -> Caps {
        match self {
            MediaKind::Video => Caps::new_simple("video/x-raw"),
            MediaKind::Audio => Caps::new_simple("audio/x-raw"),
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamType::Video => "video",
            StreamType::Audio => "audio",
            StreamType::Text => "text",
            StreamType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Guess the stream type from the first alternative of `caps`.
pub fn classify(caps: &Caps) -> StreamType {
    let Some(name) = caps.first_name() else {
        return StreamType::Unknown;
    };

    if name.starts_with("video/") || name.starts_with("image/") {
        StreamType::Video
    } else if name.starts_with("audio/") {
        StreamType::Audio
    } else if name.starts_with("text/") || name.starts_with("subpicture/") {
        StreamType::Text
    } else {
        StreamType::Unknown
    }
}
