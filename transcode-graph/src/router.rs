//! Stream Routers: one duplicator per discovered elementary stream, fanned
//! out to every Output Chain with a matching sink.

use serde::Serialize;

use crate::{
    caps::Caps,
    chain::OutputChain,
    decoder::DecodeUnitId,
    element::{ElementGraph, ElementId, PadRef},
    error::{GraphError, Result},
    registry::{Capability, PluginRegistry},
    stream_type::{StreamType, classify},
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteLink {
    pub chain: String,
    pub src: String,
    pub sink: String,
}

pub struct StreamRouter {
    name: String,
    tee: ElementId,
    stream_pad: PadRef,
    caps: Caps,
    stream_type: StreamType,
    decode_unit: DecodeUnitId,
    connected: bool,
    outputs: Vec<RouteLink>,
}

impl StreamRouter {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tee(&self) -> ElementId {
        self.tee
    }

    pub fn stream_pad(&self) -> &PadRef {
        &self.stream_pad
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn decode_unit(&self) -> DecodeUnitId {
        self.decode_unit
    }

    /// Whether the discovered stream feeds this router.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn outputs(&self) -> &[RouteLink] {
        &self.outputs
    }
}

/// Result of wiring one stream. `errors` are the stream-local failures; the
/// router exists even when its input link failed.
pub struct Routed {
    pub router: StreamRouter,
    pub errors: Vec<GraphError>,
}

pub fn wire_stream(
    graph: &mut ElementGraph,
    registry: &dyn PluginRegistry,
    name: &str,
    unit: DecodeUnitId,
    stream_pad: PadRef,
    chains: &[OutputChain],
) -> Result<Routed> {
    let caps = graph
        .pad(&stream_pad)
        .map(|p| p.caps().clone())
        .ok_or_else(|| GraphError::structure(format!("stream pad {} not found", name)))?;
    let stream_type = classify(&caps);

    let element = registry
        .make_element(Capability::Duplicate, name)
        .ok_or_else(|| GraphError::MissingCapability {
            factory: Capability::Duplicate.factory().to_string(),
        })?;
    let tee = graph.add(element, None)?;
    graph.sync_state_with_parent(tee)?;

    let mut router = StreamRouter {
        name: name.to_string(),
        tee,
        stream_pad,
        caps,
        stream_type,
        decode_unit: unit,
        connected: false,
        outputs: Vec::new(),
    };
    let mut errors = Vec::new();

    let tee_sink = graph
        .static_pad(tee, "sink")
        .ok_or_else(|| GraphError::structure(format!("{} has no sink pad", name)))?;
    if let Err(e) = graph.link(&router.stream_pad, &tee_sink) {
        log::error!("{}", e);
        errors.push(e);
        return Ok(Routed { router, errors });
    }
    router.connected = true;

    let Some(kind) = stream_type.media_kind() else {
        log::debug!("{}: {} stream is not routed", name, stream_type);
        return Ok(Routed { router, errors });
    };

    for chain in chains {
        let Some(sink) = chain.sink(kind) else {
            continue;
        };
        if graph.is_linked(sink) {
            continue;
        }
        let Some(src) = graph.request_pad(tee, "src_%u") else {
            errors.push(GraphError::structure(format!(
                "{} refused a new src pad",
                name
            )));
            continue;
        };
        match graph.link(&src, sink) {
            Ok(()) => {
                log::debug!(
                    "{}: {} -> {}",
                    chain.name(),
                    graph.pad_path(&src),
                    graph.pad_path(sink)
                );
                router.outputs.push(RouteLink {
                    chain: chain.name().to_string(),
                    src: graph.pad_path(&src),
                    sink: graph.pad_path(sink),
                });
            }
            Err(e) => {
                log::error!("{}", e);
                graph.release_pad(&src);
                errors.push(e);
            }
        }
    }

    Ok(Routed { router, errors })
}

/// Removes the router's duplicator, dropping all its links.
pub fn unwire(graph: &mut ElementGraph, router: StreamRouter) {
    log::debug!("removing router {}", router.name);
    graph.remove(router.tee);
}
