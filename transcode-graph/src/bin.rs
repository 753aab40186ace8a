use std::{fmt, pin::Pin, sync::Arc};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    caps::Caps,
    chain::{ChainBuilder, ChainOutput, OutputChain},
    config::TranscodeConfig,
    decoder::{DecodeEvents, DecodePhase, DecodeUnit, DecodeUnitId},
    element::{ElementGraph, ElementState},
    error::{GraphError, Result},
    input::{self, AttachState, InputName, InputSet},
    preset::{PresetStore, ensure_default_presets},
    registry::{Capability, PluginRegistry},
    router::{self, RouteLink, StreamRouter},
    stream_type::{MediaKind, StreamType},
};

/// Handle to a transcode bin.
///
/// The graph itself lives on a task owned by the bin; every method is a
/// message to that task, so handles can be shared across tasks (wrap in an
/// `Arc`). Dropping the handle stops the task.
pub struct TranscodeBin {
    name: String,
    cancel: CancellationToken,
    tx: tokio::sync::mpsc::Sender<BinCommand>,
    events: tokio::sync::broadcast::Sender<BinEvent>,
}

impl TranscodeBin {
    pub fn new(
        name: &str,
        config: TranscodeConfig,
        registry: Arc<dyn PluginRegistry>,
        presets: Arc<dyn PresetStore>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let (events, _) = tokio::sync::broadcast::channel(1024);

        let state = BinState {
            name: name.to_string(),
            graph: ElementGraph::new(name),
            config: Arc::new(config),
            registry,
            presets,
            presets_ready: false,
            lifecycle: LifecycleState::Idle,
            inputs: InputSet::new(),
            chains: Vec::new(),
            num_child: 0,
            routers: Vec::new(),
            num_router: 0,
            next_unit: 0,
            tx: tx.clone(),
            events: events.clone(),
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, state).await });
        Self {
            name: name.to_string(),
            cancel,
            tx,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: tokio::sync::mpsc::Receiver<BinCommand>,
        mut state: BinState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    if let Err(e) = Self::inner_command_handler(&mut state, cmd) {
                        log::error!("{}: inner_command_handler error: {:#?}", state.name, e);
                    }
                },
            }
        }
        state.shutdown();
    }

    fn inner_command_handler(state: &mut BinState, cmd: BinCommand) -> anyhow::Result<()> {
        match cmd {
            BinCommand::RequestInput { result } => {
                let name = state.inputs.request();
                log::debug!("{}: requested input {}", state.name, name);
                result
                    .send(name)
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Attach { input, result } => {
                result
                    .send(Self::attach_internal(state, &input))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Detach { input, result } => {
                result
                    .send(Self::detach_internal(state, &input))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Activate { result } => {
                result
                    .send(Self::activate_internal(state))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Deactivate { result } => {
                result
                    .send(Self::deactivate_internal(state))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::SetConfig { config, result } => {
                state.config = Arc::new(config);
                result
                    .send(())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Config { result } => {
                result
                    .send(state.config.clone())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::State { result } => {
                result
                    .send(state.lifecycle)
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Snapshot { result } => {
                result
                    .send(state.snapshot())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::Dot { result } => {
                result
                    .send(state.graph.to_dot())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            BinCommand::StreamDiscovered { unit, caps } => {
                Self::stream_discovered(state, unit, caps)?;
            }
            BinCommand::NoMoreStreams { unit } => {
                Self::no_more_streams(state, unit);
            }
        }

        Ok(())
    }

    fn attach_internal(state: &mut BinState, name: &InputName) -> Result<DecodeUnitId> {
        let unit = state
            .inputs
            .get(name)
            .ok_or_else(|| GraphError::UnknownInput {
                name: name.to_string(),
            })?;
        if let Some(decode) = unit.decode() {
            return Ok(decode.id());
        }

        let id = state.ensure_decode_unit(name)?;
        if state.lifecycle == LifecycleState::Running {
            state.start_decode_unit(name)?;
        }
        log::info!("{}: input {} attached ({})", state.name, name, id);
        Ok(id)
    }

    fn detach_internal(state: &mut BinState, name: &InputName) -> Result<()> {
        let unit = state
            .inputs
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownInput {
                name: name.to_string(),
            })?;
        if unit.decode.is_none() && unit.state == AttachState::Unattached {
            log::debug!("{}: input {} is not attached", state.name, name);
            return Ok(());
        }
        if let Some(decode) = unit.decode.take() {
            teardown_decode(&mut state.graph, &mut state.routers, decode);
        }
        if unit.is_main {
            unit.state = AttachState::Unattached;
            log::info!("{}: input {} detached", state.name, name);
            return Ok(());
        }

        let mut unit = state.inputs.remove(name)?;
        unit.state = AttachState::Detaching;
        log::info!("{}: input {} detached, releasing", state.name, name);
        tokio::spawn(input::release(unit, state.events.clone()));
        Ok(())
    }

    fn activate_internal(state: &mut BinState) -> Result<()> {
        if matches!(
            state.lifecycle,
            LifecycleState::Building | LifecycleState::Running
        ) {
            return Err(GraphError::InvalidState {
                state: state.lifecycle.to_string(),
                operation: "activate".to_string(),
            });
        }

        state.set_lifecycle(LifecycleState::Building);
        state.graph.set_root_state(ElementState::Ready);
        if let Err(e) = state.build_chains() {
            state.report(&e);
            for chain in state.chains.drain(..) {
                state.graph.remove(chain.bin());
            }
            state.graph.set_root_state(ElementState::Null);
            state.set_lifecycle(LifecycleState::Failed);
            return Err(e);
        }

        state.graph.set_root_state(ElementState::Paused);
        state.graph.set_root_state(ElementState::Playing);
        state.set_lifecycle(LifecycleState::Running);

        let attached: Vec<InputName> = state
            .inputs
            .iter()
            .filter(|u| u.state() == AttachState::Attached)
            .map(|u| u.name().clone())
            .collect();
        for name in attached {
            // failures are reported and leave the input unattached
            let _ = state.start_decode_unit(&name);
        }
        Ok(())
    }

    fn deactivate_internal(state: &mut BinState) -> Result<()> {
        if !matches!(
            state.lifecycle,
            LifecycleState::Running | LifecycleState::Failed
        ) {
            return Err(GraphError::InvalidState {
                state: state.lifecycle.to_string(),
                operation: "deactivate".to_string(),
            });
        }

        for unit in state.inputs.iter_mut() {
            if let Some(decode) = unit.decode.take() {
                teardown_decode(&mut state.graph, &mut state.routers, decode);
            }
        }
        for router in state.routers.drain(..) {
            router::unwire(&mut state.graph, router);
        }
        for chain in state.chains.drain(..) {
            state.graph.remove(chain.bin());
        }
        state.graph.set_root_state(ElementState::Null);
        state.set_lifecycle(LifecycleState::Idle);
        Ok(())
    }

    fn stream_discovered(state: &mut BinState, unit: DecodeUnitId, caps: Caps) -> Result<()> {
        if state.lifecycle != LifecycleState::Running {
            log::debug!("{}: stream {} ignored while {}", state.name, caps, state.lifecycle);
            return Ok(());
        }
        let Some(input) = state.input_of(unit) else {
            log::debug!("{}: stream from stale {} ignored", state.name, unit);
            return Ok(());
        };
        let Some(decode) = state.inputs.get_mut(&input).and_then(|u| u.decode.as_mut()) else {
            return Ok(());
        };

        let pad = state.graph.add_pad(decode.element, "src_%u", caps)?;
        decode.streams.push(pad.clone());

        let name = format!("tee_{}", state.num_router);
        state.num_router += 1;
        let routed = match router::wire_stream(
            &mut state.graph,
            state.registry.as_ref(),
            &name,
            unit,
            pad,
            &state.chains,
        ) {
            Ok(routed) => routed,
            Err(e) => {
                state.report(&e);
                return Err(e);
            }
        };
        for e in &routed.errors {
            state.report(e);
        }

        let router = routed.router;
        log::debug!(
            "{}: {} stream of {} routed to {} chain(s)",
            state.name,
            router.stream_type(),
            input,
            router.outputs().len()
        );
        state.emit(BinEvent::RouterCreated {
            router: name,
            input,
            stream_type: router.stream_type(),
            connected: router.is_connected(),
        });
        state.routers.push(router);
        Ok(())
    }

    fn no_more_streams(state: &mut BinState, unit: DecodeUnitId) {
        let Some(input) = state.input_of(unit) else {
            log::debug!("{}: no-more-streams from stale {} ignored", state.name, unit);
            return;
        };
        let Some(decode) = state.inputs.get_mut(&input).and_then(|u| u.decode.as_mut()) else {
            return;
        };
        decode.phase = DecodePhase::Finalizing;
        let element = state
            .graph
            .get(decode.element)
            .map(|e| e.name().to_string())
            .unwrap_or_default();
        log::info!("{}: {} set up for input {}", state.name, element, input);
        state.emit(BinEvent::DecoderSetup {
            input,
            unit,
            element,
        });
    }

    pub async fn request_input(&self) -> Result<InputName> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::RequestInput { result: tx }).await?;
        Ok(rx.await?)
    }

    /// Connects a producer to `input`, creating its Decode Unit. Returns the
    /// existing unit when the input is already attached.
    pub async fn attach(&self, input: &InputName) -> Result<DecodeUnitId> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(BinCommand::Attach {
                input: input.clone(),
                result: tx,
            })
            .await?;
        rx.await?
    }

    pub async fn detach(&self, input: &InputName) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(BinCommand::Detach {
                input: input.clone(),
                result: tx,
            })
            .await?;
        rx.await?
    }

    /// Builds one Output Chain per profile of the configured target, then
    /// starts the decode drivers of attached inputs.
    pub async fn activate(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::Activate { result: tx }).await?;
        rx.await?
    }

    pub async fn deactivate(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::Deactivate { result: tx }).await?;
        rx.await?
    }

    /// Replaces the configuration used by the next activation.
    pub async fn set_config(&self, config: TranscodeConfig) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(BinCommand::SetConfig { config, result: tx })
            .await?;
        Ok(rx.await?)
    }

    pub async fn config(&self) -> Result<Arc<TranscodeConfig>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::Config { result: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::State { result: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn snapshot(&self) -> Result<BinSnapshot> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::Snapshot { result: tx }).await?;
        Ok(rx.await?)
    }

    pub async fn to_dot(&self) -> Result<String> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx.send(BinCommand::Dot { result: tx }).await?;
        Ok(rx.await?)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BinEvent> {
        self.events.subscribe()
    }

    /// Events as a stream; lagged events are skipped.
    pub fn events(&self) -> BinEventStream {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|r| async move { r.ok() });
        Box::pin(stream)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TranscodeBin {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BinState {
    name: String,
    graph: ElementGraph,
    config: Arc<TranscodeConfig>,
    registry: Arc<dyn PluginRegistry>,
    presets: Arc<dyn PresetStore>,
    presets_ready: bool,
    lifecycle: LifecycleState,
    inputs: InputSet,
    chains: Vec<OutputChain>,
    num_child: u32,
    routers: Vec<StreamRouter>,
    num_router: u32,
    next_unit: u64,
    tx: tokio::sync::mpsc::Sender<BinCommand>,
    events: tokio::sync::broadcast::Sender<BinEvent>,
}

impl BinState {
    fn emit(&self, event: BinEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: &GraphError) {
        if err.is_warning() {
            log::warn!("{}: {}", self.name, err);
            self.emit(BinEvent::Warning(err.clone()));
        } else {
            log::error!("{}: {}", self.name, err);
            self.emit(BinEvent::Error(err.clone()));
        }
    }

    fn set_lifecycle(&mut self, to: LifecycleState) {
        let from = self.lifecycle;
        if from == to {
            return;
        }
        log::info!("{}: {} -> {}", self.name, from, to);
        self.lifecycle = to;
        self.emit(BinEvent::StateChanged { from, to });
    }

    fn input_of(&self, unit: DecodeUnitId) -> Option<InputName> {
        self.inputs
            .iter()
            .find(|u| u.decode().is_some_and(|d| d.id() == unit))
            .map(|u| u.name().clone())
    }

    fn build_chains(&mut self) -> Result<()> {
        let config = self.config.clone();
        let target = config.target.clone().ok_or(GraphError::MissingTarget)?;
        if !self.presets_ready {
            ensure_default_presets(self.presets.as_ref())?;
            self.presets_ready = true;
        }

        for profile in target.profiles() {
            let name = format!("transchild_{}", self.num_child);
            let chain = ChainBuilder {
                graph: &mut self.graph,
                registry: self.registry.as_ref(),
                presets: self.presets.as_ref(),
                config: &config,
            }
            .build(profile, &name)?;
            self.num_child += 1;
            self.chains.push(chain);
        }

        for chain in &self.chains {
            log::debug!("{}: {} built for profile {}", self.name, chain.name(), chain.profile());
            self.emit(BinEvent::ChainCreated {
                name: chain.name().to_string(),
                profile: chain.profile().to_string(),
            });
        }
        Ok(())
    }

    /// Creates the Decode Unit of `name` without starting it.
    fn ensure_decode_unit(&mut self, name: &InputName) -> Result<DecodeUnitId> {
        if let Some(decode) = self.inputs.get(name).and_then(|u| u.decode()) {
            return Ok(decode.id());
        }

        let Some((element, driver)) = self.registry.make_decoder(name.as_str()) else {
            let err = GraphError::MissingCapability {
                factory: Capability::Decode.factory().to_string(),
            };
            self.report(&err);
            if let Some(unit) = self.inputs.get_mut(name) {
                unit.state = AttachState::Unattached;
            }
            return Err(err);
        };
        let element = self.graph.add(element, None)?;
        self.graph.sync_state_with_parent(element)?;

        let id = DecodeUnitId(self.next_unit);
        self.next_unit += 1;
        let unit = self
            .inputs
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownInput {
                name: name.to_string(),
            })?;
        unit.decode = Some(DecodeUnit::new(id, element, driver));
        unit.state = AttachState::Attached;
        Ok(id)
    }

    fn start_decode_unit(&mut self, name: &InputName) -> Result<()> {
        self.ensure_decode_unit(name)?;
        let events = self.tx.clone();
        let Some(decode) = self.inputs.get_mut(name).and_then(|u| u.decode.as_mut()) else {
            return Ok(());
        };
        let id = decode.id;
        let started = decode.start(DecodeEvents::new(name.clone(), id, events));
        if let Err(e) = started {
            let err = GraphError::structure(format!("decoder of {} failed to start: {:#}", name, e));
            if let Some(unit) = self.inputs.get_mut(name) {
                unit.state = AttachState::Unattached;
                if let Some(decode) = unit.decode.take() {
                    teardown_decode(&mut self.graph, &mut self.routers, decode);
                }
            }
            self.report(&err);
            return Err(err);
        }
        Ok(())
    }

    fn snapshot(&self) -> BinSnapshot {
        let inputs = self
            .inputs
            .iter()
            .map(|u| InputInfo {
                name: u.name().clone(),
                is_main: u.is_main(),
                state: u.state(),
                decode_unit: u.decode().map(DecodeUnit::id),
                phase: u.decode().map(DecodeUnit::phase),
                streams: u.decode().map(|d| d.streams().len()).unwrap_or(0),
            })
            .collect();

        let sink_info = |chain: &OutputChain, kind: MediaKind| {
            chain
                .sink(kind)
                .map(|pad| (self.graph.pad_path(pad), self.graph.is_linked(pad)))
        };
        let chains = self
            .chains
            .iter()
            .map(|c| ChainInfo {
                name: c.name().to_string(),
                profile: c.profile().to_string(),
                output: c.output().clone(),
                video_sink: sink_info(c, MediaKind::Video),
                audio_sink: sink_info(c, MediaKind::Audio),
            })
            .collect();

        let routers = self
            .routers
            .iter()
            .map(|r| RouterInfo {
                name: r.name().to_string(),
                input: self.input_of(r.decode_unit()),
                stream_type: r.stream_type(),
                caps: r.caps().clone(),
                connected: r.is_connected(),
                outputs: r.outputs().to_vec(),
            })
            .collect();

        BinSnapshot {
            name: self.name.clone(),
            state: self.lifecycle,
            graph_state: self.graph.state(),
            inputs,
            chains,
            routers,
        }
    }

    fn shutdown(&mut self) {
        for unit in self.inputs.iter_mut() {
            if let Some(decode) = unit.decode.take() {
                teardown_decode(&mut self.graph, &mut self.routers, decode);
            }
            unit.state = AttachState::Unattached;
        }
        for unit in self.inputs.drain_requested() {
            tokio::spawn(input::release(unit, self.events.clone()));
        }
        self.graph.set_root_state(ElementState::Null);
        log::debug!("{}: stopped", self.name);
    }
}

/// Stops a Decode Unit and removes it, its stream pads and its routers.
fn teardown_decode(
    graph: &mut ElementGraph,
    routers: &mut Vec<StreamRouter>,
    mut decode: DecodeUnit,
) {
    decode.stop();
    let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(routers)
        .into_iter()
        .partition(|r| r.decode_unit() == decode.id());
    *routers = kept;
    for router in gone {
        router::unwire(graph, router);
    }
    graph.remove(decode.element);
    log::debug!("{} torn down", decode.id);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Building,
    Running,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Building => "building",
            LifecycleState::Running => "running",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub enum BinEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    ChainCreated {
        name: String,
        profile: String,
    },
    RouterCreated {
        router: String,
        input: InputName,
        stream_type: StreamType,
        /// False when the stream could not be linked to the router.
        connected: bool,
    },
    /// A Decode Unit reported all of its streams.
    DecoderSetup {
        input: InputName,
        unit: DecodeUnitId,
        element: String,
    },
    InputReleased {
        input: InputName,
    },
    Warning(GraphError),
    Error(GraphError),
}

pub type BinEventStream = Pin<Box<dyn Stream<Item = BinEvent> + Send>>;

#[derive(Clone, Debug, Serialize)]
pub struct BinSnapshot {
    pub name: String,
    pub state: LifecycleState,
    pub graph_state: ElementState,
    pub inputs: Vec<InputInfo>,
    pub chains: Vec<ChainInfo>,
    pub routers: Vec<RouterInfo>,
}

impl BinSnapshot {
    pub fn input(&self, name: &str) -> Option<&InputInfo> {
        self.inputs.iter().find(|i| i.name.as_str() == name)
    }

    pub fn chain(&self, profile: &str) -> Option<&ChainInfo> {
        self.chains.iter().find(|c| c.profile == profile)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct InputInfo {
    pub name: InputName,
    pub is_main: bool,
    pub state: AttachState,
    pub decode_unit: Option<DecodeUnitId>,
    pub phase: Option<DecodePhase>,
    pub streams: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainInfo {
    pub name: String,
    pub profile: String,
    pub output: ChainOutput,
    /// Sink pad path and whether a router feeds it.
    pub video_sink: Option<(String, bool)>,
    pub audio_sink: Option<(String, bool)>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouterInfo {
    pub name: String,
    pub input: Option<InputName>,
    pub stream_type: StreamType,
    pub caps: Caps,
    pub connected: bool,
    pub outputs: Vec<RouteLink>,
}

pub(crate) enum BinCommand {
    RequestInput {
        result: tokio::sync::oneshot::Sender<InputName>,
    },
    Attach {
        input: InputName,
        result: tokio::sync::oneshot::Sender<Result<DecodeUnitId>>,
    },
    Detach {
        input: InputName,
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Activate {
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Deactivate {
        result: tokio::sync::oneshot::Sender<Result<()>>,
    },
    SetConfig {
        config: TranscodeConfig,
        result: tokio::sync::oneshot::Sender<()>,
    },
    Config {
        result: tokio::sync::oneshot::Sender<Arc<TranscodeConfig>>,
    },
    State {
        result: tokio::sync::oneshot::Sender<LifecycleState>,
    },
    Snapshot {
        result: tokio::sync::oneshot::Sender<BinSnapshot>,
    },
    Dot {
        result: tokio::sync::oneshot::Sender<String>,
    },
    StreamDiscovered {
        unit: DecodeUnitId,
        caps: Caps,
    },
    NoMoreStreams {
        unit: DecodeUnitId,
    },
}

#[cfg(test)]
#[path = "bin_test.rs"]
mod bin_test;
