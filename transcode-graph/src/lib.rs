//! Runtime assembly of multi-rendition transcode graphs.
//!
//! A [`TranscodeBin`] takes a [`Target`] describing the wanted renditions,
//! builds one Output Chain per profile when it is activated, and routes every
//! elementary stream discovered on its inputs to the chains that can consume
//! it.

pub mod bin;
pub mod caps;
pub mod chain;
pub mod config;
pub mod decoder;
pub mod element;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod input;
pub mod preset;
pub mod profile;
pub mod registry;
pub mod router;
pub mod stream_type;

pub use bin::{BinEvent, BinSnapshot, LifecycleState, TranscodeBin};
pub use caps::Caps;
pub use config::TranscodeConfig;
pub use error::{GraphError, Result};
pub use input::InputName;
pub use profile::{Profile, Target};
