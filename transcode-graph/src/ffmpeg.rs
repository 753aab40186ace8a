//! FFmpeg-backed capability provider: real encoders and a probing decode
//! driver.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::{
    caps::{Caps, Structure, Value},
    decoder::{DecodeEvents, DemuxDecoder},
    registry::StaticRegistry,
    stream_type::MediaKind,
};

/// Registers FFmpeg components (format, device, etc.). Call once at startup.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

const ENCODERS: [(&str, MediaKind, &str); 4] = [
    ("libx264", MediaKind::Video, "video/x-h264"),
    ("libx265", MediaKind::Video, "video/x-h265"),
    ("aac", MediaKind::Audio, "audio/mpeg, mpegversion=4"),
    ("libopus", MediaKind::Audio, "audio/x-opus"),
];

/// Standard registry with the encoders this FFmpeg build provides and a
/// decoder probing `sources` (input name to file path or URL).
pub fn registry(sources: BTreeMap<String, String>) -> anyhow::Result<StaticRegistry> {
    let mut registry = StaticRegistry::standard().without_encoders();
    for (name, kind, caps) in ENCODERS {
        if ffmpeg_next::encoder::find_by_name(name).is_some() {
            registry = registry.with_encoder(name, kind, caps.parse()?);
        } else {
            log::debug!("encoder {} not available", name);
        }
    }

    Ok(registry.with_decoder(move |input| {
        Box::new(FfmpegDecoder::new(sources.get(input).cloned()))
    }))
}

/// Reports one stream per elementary stream of a probed file or URL.
pub struct FfmpegDecoder {
    source: Option<String>,
    cancel: CancellationToken,
}

impl FfmpegDecoder {
    pub fn new(source: Option<String>) -> Self {
        Self {
            source,
            cancel: CancellationToken::new(),
        }
    }
}

impl DemuxDecoder for FfmpegDecoder {
    fn start(&mut self, events: DecodeEvents) -> anyhow::Result<()> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no source for input {}", events.input()))?;
        let cancel = self.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let streams = match probe_streams(&source) {
                Ok(streams) => streams,
                Err(e) => {
                    log::error!("probe {} error: {:#}", source, e);
                    return;
                }
            };
            for caps in streams {
                if cancel.is_cancelled() {
                    return;
                }
                if events.stream_added_blocking(caps).is_err() {
                    return;
                }
            }
            if !cancel.is_cancelled() {
                let _ = events.no_more_streams_blocking();
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.cancel();
    }
}

fn probe_streams(source: &str) -> anyhow::Result<Vec<Caps>> {
    let input = ffmpeg_next::format::input(source)?;
    let mut streams = Vec::with_capacity(input.nb_streams() as usize);

    for stream in input.streams() {
        let params = stream.parameters();
        let structure = match params.medium() {
            ffmpeg_next::media::Type::Video => {
                let (width, height) = video_size_from_parameters(&params);
                let rate = stream.avg_frame_rate();
                let mut s = Structure::new("video/x-raw")
                    .with("width", width)
                    .with("height", height);
                if rate.denominator() != 0 && rate.numerator() != 0 {
                    s.set(
                        "framerate",
                        Value::Fraction(rate.numerator(), rate.denominator()),
                    );
                }
                s
            }
            ffmpeg_next::media::Type::Audio => {
                let (rate, channels) = audio_params_from_parameters(&params);
                Structure::new("audio/x-raw")
                    .with("rate", rate)
                    .with("channels", channels)
            }
            ffmpeg_next::media::Type::Subtitle => Structure::new("text/x-raw"),
            other => Structure::new(format!("application/x-{:?}", other).to_lowercase()),
        };
        log::debug!("{}: stream {} is {}", source, stream.index(), structure);
        streams.push(Caps::from(structure));
    }
    Ok(streams)
}

/// Reads video width/height from codec parameters (not exposed by ffmpeg-next).
fn video_size_from_parameters(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let ptr = params.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        ((*ptr).width.max(0) as u32, (*ptr).height.max(0) as u32)
    }
}

/// Reads audio sample rate and channel count from codec parameters.
fn audio_params_from_parameters(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let ptr = params.as_ptr() as *const ffmpeg_next::ffi::AVCodecParameters;
        (
            (*ptr).sample_rate.max(0) as u32,
            (*ptr).ch_layout.nb_channels.max(0) as u32,
        )
    }
}
