use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::sync::broadcast::{Receiver, error::RecvError};

use crate::{
    bin::{BinEvent, LifecycleState, TranscodeBin},
    caps::Caps,
    config::TranscodeConfig,
    decoder::ManifestDecoder,
    error::GraphError,
    input::{AttachState, InputName},
    preset::MemoryPresetStore,
    profile::{ContainerProfile, LeafProfile, Target, category, default_target},
    registry::StaticRegistry,
    stream_type::{MediaKind, StreamType},
};

const VIDEO: &str = "video/x-raw, width=1920, height=1080, framerate=30/1";
const AUDIO: &str = "audio/x-raw, rate=48000, channels=2";

fn caps(s: &str) -> Caps {
    s.parse().unwrap()
}

/// Standard registry whose decoders report `streams` for every input.
fn registry_with(streams: &[&str]) -> StaticRegistry {
    let streams: Vec<Caps> = streams.iter().map(|s| caps(s)).collect();
    StaticRegistry::standard()
        .with_decoder(move |_| Box::new(ManifestDecoder::new(streams.clone())))
}

fn new_bin(registry: StaticRegistry, config: TranscodeConfig) -> TranscodeBin {
    TranscodeBin::new(
        "multitranscodebin0",
        config,
        Arc::new(registry),
        Arc::new(MemoryPresetStore::new()),
    )
}

async fn wait_for<F>(rx: &mut Receiver<BinEvent>, mut pred: F) -> anyhow::Result<BinEvent>
where
    F: FnMut(&BinEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Ok(event),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => anyhow::bail!("event channel closed"),
            Err(_) => anyhow::bail!("timed out waiting for event"),
        }
    }
}

async fn wait_setup(rx: &mut Receiver<BinEvent>, input: &str) -> anyhow::Result<BinEvent> {
    wait_for(rx, |e| {
        matches!(e, BinEvent::DecoderSetup { input: i, .. } if i.as_str() == input)
    })
    .await
}

#[tokio::test]
async fn test_activate_builds_every_chain() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = new_bin(StaticRegistry::standard(), config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    assert_eq!(bin.state().await?, LifecycleState::Running);

    let snapshot = bin.snapshot().await?;
    let chains: Vec<_> = snapshot
        .chains
        .iter()
        .map(|c| (c.name.as_str(), c.profile.as_str()))
        .collect();
    assert_eq!(
        chains,
        vec![
            ("transchild_0", "720p"),
            ("transchild_1", "480p"),
            ("transchild_2", "240p"),
            ("transchild_3", "audio-only"),
        ]
    );
    assert!(snapshot.chain("audio-only").unwrap().video_sink.is_none());

    let mut created = 0;
    while created < 4 {
        wait_for(&mut rx, |e| matches!(e, BinEvent::ChainCreated { .. })).await?;
        created += 1;
    }

    // already running
    assert!(matches!(
        bin.activate().await,
        Err(GraphError::InvalidState { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_activate_is_all_or_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = StaticRegistry::standard().without_encoders().with_encoder(
        "avenc_aac",
        MediaKind::Audio,
        caps("audio/mpeg, mpegversion=4"),
    );
    let mut target = Target::new("mixed", category::ONLINE_SERVICE, "");
    target.add_profile(
        ContainerProfile::new("audio", caps("application/x-hls"))
            .with_child(LeafProfile::audio(caps("audio/mpeg, mpegversion=4"))),
    );
    target.add_profile(
        ContainerProfile::new("video", caps("application/x-hls"))
            .with_child(LeafProfile::video(caps("video/x-vp9"))),
    );
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(target);
    let bin = new_bin(registry, config.clone());
    let mut rx = bin.subscribe();

    match bin.activate().await {
        Err(GraphError::CannotEncode { profile, caps: c }) => {
            assert_eq!(profile, "video");
            assert_eq!(c, caps("video/x-vp9"));
        }
        other => panic!("unexpected activation result {:?}", other),
    }
    let warning = wait_for(&mut rx, |e| matches!(e, BinEvent::Warning(_))).await?;
    if let BinEvent::Warning(e) = warning {
        assert!(e.to_string().contains("video/x-vp9"));
    }

    assert_eq!(bin.state().await?, LifecycleState::Failed);
    let snapshot = bin.snapshot().await?;
    assert!(snapshot.chains.is_empty());
    assert!(!bin.to_dot().await?.contains("transchild_0"));

    // a usable target can be activated after a failure
    let mut fixed = Target::new("audio", category::ONLINE_SERVICE, "");
    fixed.add_profile(
        ContainerProfile::new("audio", caps("application/x-hls"))
            .with_child(LeafProfile::audio(caps("audio/mpeg, mpegversion=4"))),
    );
    let mut config = config;
    config.target = Some(Arc::new(fixed));
    bin.set_config(config).await?;
    bin.activate().await?;
    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.chains.len(), 1);
    // chain names are never reused
    assert_eq!(snapshot.chains[0].name, "transchild_1");
    Ok(())
}

#[tokio::test]
async fn test_activate_without_target() -> anyhow::Result<()> {
    let bin = new_bin(StaticRegistry::standard(), TranscodeConfig::default());
    let mut rx = bin.subscribe();

    assert_eq!(bin.activate().await, Err(GraphError::MissingTarget));
    wait_for(&mut rx, |e| {
        matches!(e, BinEvent::Error(GraphError::MissingTarget))
    })
    .await?;
    assert_eq!(bin.state().await?, LifecycleState::Failed);
    Ok(())
}

#[tokio::test]
async fn test_single_hls_rendition() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = default_target().with_only_profile("720p").unwrap();
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(target);
    let bin = new_bin(registry_with(&[VIDEO, AUDIO]), config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    bin.attach(&InputName::main()).await?;
    wait_setup(&mut rx, "sink").await?;

    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.chains.len(), 1);
    let chain = snapshot.chain("720p").unwrap();
    assert_eq!(chain.name, "transchild_0");

    let out_dir = dir.path().join("720p");
    assert!(out_dir.is_dir());
    assert_eq!(
        chain.output.location,
        format!("{}/720p%05d.ts", out_dir.display())
    );
    assert_eq!(
        chain.output.playlist,
        Some(format!("{}/playlist.m3u8", out_dir.display()))
    );
    assert_eq!(chain.output.target_duration, Some(3));

    assert_eq!(snapshot.routers.len(), 2);
    for router in &snapshot.routers {
        assert!(router.connected);
        assert_eq!(router.outputs.len(), 1);
        assert_eq!(router.outputs[0].chain, "transchild_0");
    }
    assert!(chain.video_sink.as_ref().unwrap().1);
    assert!(chain.audio_sink.as_ref().unwrap().1);

    let input = snapshot.input("sink").unwrap();
    assert_eq!(input.state, AttachState::Attached);
    assert_eq!(input.streams, 2);
    Ok(())
}

#[tokio::test]
async fn test_streams_reach_matching_sinks_only() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = new_bin(registry_with(&[VIDEO, AUDIO, "text/x-raw"]), config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    bin.attach(&InputName::main()).await?;
    wait_setup(&mut rx, "sink").await?;

    let snapshot = bin.snapshot().await?;
    let by_type = |t: StreamType| {
        snapshot
            .routers
            .iter()
            .find(|r| r.stream_type == t)
            .unwrap()
    };

    let video: Vec<_> = by_type(StreamType::Video)
        .outputs
        .iter()
        .map(|l| l.chain.as_str())
        .collect();
    assert_eq!(video, vec!["transchild_0", "transchild_1", "transchild_2"]);
    assert_eq!(by_type(StreamType::Audio).outputs.len(), 4);
    // text streams get a router but no consumer
    assert!(by_type(StreamType::Text).outputs.is_empty());

    for chain in &snapshot.chains {
        if let Some((_, linked)) = &chain.video_sink {
            assert!(*linked);
        }
        assert!(chain.audio_sink.as_ref().unwrap().1);
    }
    Ok(())
}

#[tokio::test]
async fn test_stream_link_failure_is_local() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = default_target().with_only_profile("720p").unwrap();
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(target);
    let registry = registry_with(&[VIDEO, AUDIO]).with_tee_sink_caps(caps("audio/x-raw"));
    let bin = new_bin(registry, config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    bin.attach(&InputName::main()).await?;

    let event = wait_for(&mut rx, |e| {
        matches!(e, BinEvent::Error(GraphError::LinkFailed { .. }))
    })
    .await?;
    match event {
        BinEvent::Error(GraphError::LinkFailed {
            src,
            src_caps,
            sink,
            sink_caps,
            ..
        }) => {
            assert_eq!(src, "decodebin-sink:src_0");
            assert_eq!(src_caps, caps(VIDEO));
            assert_eq!(sink, "tee_0:sink");
            assert_eq!(sink_caps, caps("audio/x-raw"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    wait_setup(&mut rx, "sink").await?;

    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.state, LifecycleState::Running);
    assert_eq!(snapshot.routers.len(), 2);
    let video = &snapshot.routers[0];
    assert_eq!(video.stream_type, StreamType::Video);
    assert!(!video.connected);
    assert!(video.outputs.is_empty());
    let audio = &snapshot.routers[1];
    assert!(audio.connected);
    assert_eq!(audio.outputs.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_request_names_are_distinct() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = Arc::new(new_bin(registry_with(&[AUDIO]), config));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let bin = bin.clone();
        handles.push(tokio::spawn(async move {
            let name = bin.request_input().await?;
            bin.attach(&name).await?;
            Ok::<_, GraphError>(name)
        }));
    }

    let mut names = BTreeSet::new();
    for handle in handles {
        names.insert(handle.await??.to_string());
    }
    let expected: BTreeSet<String> = (0..8).map(|i| format!("sink_{}", i)).collect();
    assert_eq!(names, expected);

    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.inputs.len(), 9);
    let units: BTreeSet<_> = snapshot.inputs.iter().filter_map(|i| i.decode_unit).collect();
    assert_eq!(units.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_detach_releases_request_input_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = new_bin(registry_with(&[VIDEO, AUDIO]), config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    let name = bin.request_input().await?;
    assert_eq!(name.as_str(), "sink_0");
    bin.attach(&name).await?;
    wait_setup(&mut rx, "sink_0").await?;
    assert_eq!(bin.snapshot().await?.routers.len(), 2);

    bin.detach(&name).await?;
    wait_for(&mut rx, |e| {
        matches!(e, BinEvent::InputReleased { input } if input == &name)
    })
    .await?;

    assert!(matches!(
        bin.detach(&name).await,
        Err(GraphError::UnknownInput { .. })
    ));
    let released_again = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if let Ok(BinEvent::InputReleased { .. }) = rx.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(released_again.is_err());

    let snapshot = bin.snapshot().await?;
    assert!(snapshot.input("sink_0").is_none());
    assert!(snapshot.routers.is_empty());
    for chain in &snapshot.chains {
        assert!(!chain.audio_sink.as_ref().unwrap().1);
    }

    // the counter keeps going
    assert_eq!(bin.request_input().await?.as_str(), "sink_1");
    Ok(())
}

#[tokio::test]
async fn test_detach_before_attach_keeps_input() -> anyhow::Result<()> {
    let bin = new_bin(registry_with(&[VIDEO]), TranscodeConfig::default());
    let mut rx = bin.subscribe();

    let name = bin.request_input().await?;
    bin.detach(&name).await?;

    let snapshot = bin.snapshot().await?;
    let input = snapshot.input("sink_0").unwrap();
    assert_eq!(input.state, AttachState::Unattached);
    assert!(input.decode_unit.is_none());
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // still usable
    bin.attach(&name).await?;
    assert_eq!(
        bin.snapshot().await?.input("sink_0").unwrap().state,
        AttachState::Attached
    );
    Ok(())
}

#[tokio::test]
async fn test_passthrough_chain_gets_no_streams() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut target = default_target().with_only_profile("720p").unwrap();
    target.add_profile(ContainerProfile::new("copy", caps("application/x-hls")));
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(target);
    let bin = new_bin(registry_with(&[VIDEO, AUDIO]), config);
    let mut rx = bin.subscribe();

    bin.activate().await?;
    bin.attach(&InputName::main()).await?;
    wait_setup(&mut rx, "sink").await?;

    let snapshot = bin.snapshot().await?;
    let copy = snapshot.chain("copy").unwrap();
    assert_eq!(copy.name, "transchild_1");
    assert!(copy.video_sink.is_none());
    assert!(copy.audio_sink.is_none());
    assert!(dir.path().join("copy").is_dir());

    assert_eq!(snapshot.routers.len(), 2);
    for router in &snapshot.routers {
        let chains: Vec<_> = router.outputs.iter().map(|l| l.chain.as_str()).collect();
        assert_eq!(chains, vec!["transchild_0"]);
    }
    Ok(())
}

#[tokio::test]
async fn test_main_input_reattach() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let target = default_target().with_only_profile("480p").unwrap();
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(target);
    let bin = new_bin(registry_with(&[VIDEO, AUDIO]), config);
    let mut rx = bin.subscribe();
    let main = InputName::main();

    bin.activate().await?;
    let first = bin.attach(&main).await?;
    wait_setup(&mut rx, "sink").await?;

    bin.detach(&main).await?;
    let snapshot = bin.snapshot().await?;
    let input = snapshot.input("sink").unwrap();
    assert_eq!(input.state, AttachState::Unattached);
    assert!(input.decode_unit.is_none());
    assert!(snapshot.routers.is_empty());

    let second = bin.attach(&main).await?;
    assert_ne!(first, second);
    let event = wait_setup(&mut rx, "sink").await?;
    assert!(matches!(event, BinEvent::DecoderSetup { unit, .. } if unit == second));

    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.routers.len(), 2);
    let chain = snapshot.chain("480p").unwrap();
    assert!(chain.video_sink.as_ref().unwrap().1);
    assert!(chain.audio_sink.as_ref().unwrap().1);
    Ok(())
}

#[tokio::test]
async fn test_missing_decoder_refuses_attach() -> anyhow::Result<()> {
    let bin = new_bin(
        StaticRegistry::standard(),
        TranscodeConfig::default().with_target(Target::new("empty", category::DEVICE, "")),
    );
    let mut rx = bin.subscribe();

    match bin.attach(&InputName::main()).await {
        Err(GraphError::MissingCapability { factory }) => assert_eq!(factory, "decodebin"),
        other => panic!("unexpected attach result {:?}", other),
    }
    wait_for(&mut rx, |e| {
        matches!(e, BinEvent::Error(GraphError::MissingCapability { .. }))
    })
    .await?;

    let snapshot = bin.snapshot().await?;
    assert_eq!(
        snapshot.input("sink").unwrap().state,
        AttachState::Unattached
    );
    Ok(())
}

#[tokio::test]
async fn test_discovery_waits_for_activation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = new_bin(registry_with(&[VIDEO]), config);
    let mut rx = bin.subscribe();

    bin.attach(&InputName::main()).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bin.snapshot().await?.routers.is_empty());

    bin.activate().await?;
    wait_setup(&mut rx, "sink").await?;
    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.routers.len(), 1);
    assert_eq!(snapshot.routers[0].outputs.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_deactivate_and_reactivate() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = TranscodeConfig::default()
        .with_root_dir(dir.path())
        .with_target(default_target());
    let bin = new_bin(registry_with(&[VIDEO, AUDIO]), config);
    let mut rx = bin.subscribe();

    assert!(matches!(
        bin.deactivate().await,
        Err(GraphError::InvalidState { .. })
    ));

    bin.activate().await?;
    bin.attach(&InputName::main()).await?;
    wait_setup(&mut rx, "sink").await?;

    bin.deactivate().await?;
    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.state, LifecycleState::Idle);
    assert!(snapshot.chains.is_empty());
    assert!(snapshot.routers.is_empty());
    let input = snapshot.input("sink").unwrap();
    assert_eq!(input.state, AttachState::Attached);
    assert!(input.decode_unit.is_none());

    bin.activate().await?;
    wait_setup(&mut rx, "sink").await?;
    let snapshot = bin.snapshot().await?;
    assert_eq!(snapshot.chains.len(), 4);
    assert_eq!(snapshot.routers.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_config_swap() -> anyhow::Result<()> {
    let bin = new_bin(StaticRegistry::standard(), TranscodeConfig::default());
    assert_eq!(bin.config().await?.target_duration, 3);

    bin.set_config(TranscodeConfig::default().with_target_duration(10))
        .await?;
    let config = bin.config().await?;
    assert_eq!(config.target_duration, 10);
    assert!(config.target.is_none());
    Ok(())
}
