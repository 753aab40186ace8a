use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use transcode_graph::{
    BinEvent, BinSnapshot, Caps, InputName, Target, TranscodeBin, TranscodeConfig,
    decoder::ManifestDecoder,
    preset::{JsonPresetStore, MemoryPresetStore, PresetStore},
    profile::{default_target, is_profile_usable},
    registry::{PluginRegistry, StaticRegistry},
};

mod cli;

const DEFAULT_STREAMS: [&str; 2] = [
    "video/x-raw, width=1920, height=1080, framerate=30/1",
    "audio/x-raw, rate=48000, channels=2",
];

const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("transcode_graph", log::LevelFilter::Debug)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = cli::Cli::parse();
    #[cfg(feature = "ffmpeg")]
    transcode_graph::ffmpeg::init()?;

    let targets = load_targets(&cli)?;
    let registry = make_registry(&cli)?;

    if cli.list_targets {
        list_targets(&targets, registry.as_ref());
        return Ok(());
    }

    let target = select_target(&targets, cli.target.as_deref())?;
    let presets: Arc<dyn PresetStore> = match &cli.presets {
        Some(path) => Arc::new(
            JsonPresetStore::open(path)
                .with_context(|| format!("open preset store {}", path.display()))?,
        ),
        None => Arc::new(MemoryPresetStore::new()),
    };

    let config = TranscodeConfig {
        root_dir: cli.root_dir.clone(),
        target_duration: cli.target_duration,
        target: Some(Arc::new(target)),
    };
    run(&cli, config, registry, presets).await
}

fn load_targets(cli: &cli::Cli) -> anyhow::Result<Vec<Target>> {
    let mut targets = vec![default_target()];
    for path in &cli.target_files {
        let loaded = Target::load_all(path)
            .with_context(|| format!("load targets from {}", path.display()))?;
        targets.extend(loaded);
    }
    Ok(targets)
}

fn parse_streams(streams: &[String]) -> anyhow::Result<Vec<Caps>> {
    if streams.is_empty() {
        return DEFAULT_STREAMS
            .iter()
            .map(|s| s.parse().context("default stream caps"))
            .collect();
    }
    streams
        .iter()
        .map(|s| s.parse().with_context(|| format!("invalid stream caps {:?}", s)))
        .collect()
}

fn make_registry(cli: &cli::Cli) -> anyhow::Result<Arc<dyn PluginRegistry>> {
    #[cfg(feature = "ffmpeg")]
    if let Some(input) = &cli.input {
        let sources = [(InputName::main().to_string(), input.clone())].into();
        return Ok(Arc::new(transcode_graph::ffmpeg::registry(sources)?));
    }

    let streams = parse_streams(&cli.streams)?;
    let registry = StaticRegistry::standard()
        .with_decoder(move |_| Box::new(ManifestDecoder::new(streams.clone())));
    Ok(Arc::new(registry))
}

fn list_targets(targets: &[Target], registry: &dyn PluginRegistry) {
    for target in targets {
        println!(
            "{} ({}): {}",
            target.name(),
            target.category(),
            target.description()
        );
        for profile in target.profiles() {
            if is_profile_usable(registry, profile) {
                println!("    {}: {}", profile.name(), profile.format());
            }
        }
    }
}

/// Resolves `TARGET[/PROFILE]`; no selector means the built-in target.
fn select_target(targets: &[Target], selector: Option<&str>) -> anyhow::Result<Target> {
    let Some(selector) = selector else {
        return Ok(default_target());
    };
    let (name, profile) = match selector.split_once('/') {
        Some((name, profile)) => (name, Some(profile)),
        None => (selector, None),
    };
    let target = targets
        .iter()
        .find(|t| t.name() == name)
        .with_context(|| format!("unknown target {}", name))?;
    match profile {
        Some(profile) => target
            .with_only_profile(profile)
            .with_context(|| format!("target {} has no profile {}", name, profile)),
        None => Ok(target.clone()),
    }
}

async fn run(
    cli: &cli::Cli,
    config: TranscodeConfig,
    registry: Arc<dyn PluginRegistry>,
    presets: Arc<dyn PresetStore>,
) -> anyhow::Result<()> {
    let bin = TranscodeBin::new("multitranscodebin0", config, registry, presets);
    let mut events = bin.events();

    bin.activate().await.context("activate")?;
    let main = InputName::main();
    bin.attach(&main).await.context("attach main input")?;

    let wait = async {
        while let Some(event) = events.next().await {
            match event {
                BinEvent::DecoderSetup { input, .. } if input == main => return true,
                BinEvent::Warning(e) => log::warn!("{}", e),
                BinEvent::Error(e) => log::error!("{}", e),
                other => log::debug!("{:?}", other),
            }
        }
        false
    };
    match tokio::time::timeout(SETUP_TIMEOUT, wait).await {
        Ok(true) => {}
        Ok(false) => anyhow::bail!("bin stopped before the input was set up"),
        Err(_) => anyhow::bail!("input not set up after {:?}", SETUP_TIMEOUT),
    }

    let snapshot = bin.snapshot().await?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_summary(&snapshot);
    }

    if let Some(path) = &cli.dot {
        std::fs::write(path, bin.to_dot().await?)
            .with_context(|| format!("write {}", path.display()))?;
    }

    bin.deactivate().await?;
    bin.stop();
    Ok(())
}

fn print_summary(snapshot: &BinSnapshot) {
    println!("{} [{}]", snapshot.name, snapshot.state);
    for chain in &snapshot.chains {
        println!("  {} ({})", chain.name, chain.profile);
        println!("    output: {}", chain.output.location);
        if let Some(playlist) = &chain.output.playlist {
            println!("    playlist: {}", playlist);
        }
        for (kind, sink) in [("video", &chain.video_sink), ("audio", &chain.audio_sink)] {
            if let Some((pad, linked)) = sink {
                let status = if *linked { "linked" } else { "idle" };
                println!("    {}: {} ({})", kind, pad, status);
            }
        }
    }
    for router in &snapshot.routers {
        let input = router
            .input
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "  {} <- {} {} [{}]",
            router.name, input, router.stream_type, router.caps
        );
        if !router.connected {
            println!("    not connected");
        }
        for link in &router.outputs {
            println!("    {} -> {}", link.src, link.sink);
        }
    }
}
