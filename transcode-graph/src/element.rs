//! In-memory model of the media graph.
//!
//! The execution engine is not driven from here: this module only records
//! which elements exist, how they are nested, which pads they expose, how the
//! pads are linked and which run-state each element is in. Links are checked
//! the way a real engine negotiates them (direction, single peer, compatible
//! caps) so failures surface while the graph is being assembled.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Write as _},
};

use serde::Serialize;

use crate::{
    caps::Caps,
    error::{GraphError, Result},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadDirection {
    Src,
    Sink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadPresence {
    /// Instantiated together with the element.
    Always,
    /// Added by the element itself at runtime (e.g. a discovered stream).
    Sometimes,
    /// Created on demand by whoever links to the element.
    Request,
}

#[derive(Clone, Debug)]
pub struct PadTemplate {
    /// Pad name, or a pattern with `%u` for numbered pads.
    pub name: String,
    pub direction: PadDirection,
    pub presence: PadPresence,
    pub caps: Caps,
}

impl PadTemplate {
    pub fn new(name: &str, direction: PadDirection, presence: PadPresence, caps: Caps) -> Self {
        Self {
            name: name.to_string(),
            direction,
            presence,
            caps,
        }
    }

    pub fn always(name: &str, direction: PadDirection, caps: Caps) -> Self {
        Self::new(name, direction, PadPresence::Always, caps)
    }

    pub fn request(name: &str, direction: PadDirection, caps: Caps) -> Self {
        Self::new(name, direction, PadPresence::Request, caps)
    }

    pub fn sometimes(name: &str, direction: PadDirection, caps: Caps) -> Self {
        Self::new(name, direction, PadPresence::Sometimes, caps)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PadRef {
    pub element: ElementId,
    pub pad: String,
}

impl PadRef {
    pub fn new(element: ElementId, pad: &str) -> Self {
        Self {
            element,
            pad: pad.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pad {
    name: String,
    direction: PadDirection,
    presence: PadPresence,
    caps: Caps,
    peer: Option<PadRef>,
}

impl Pad {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    pub fn peer(&self) -> Option<&PadRef> {
        self.peer.as_ref()
    }

    pub fn is_linked(&self) -> bool {
        self.peer.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementState::Null => "NULL",
            ElementState::Ready => "READY",
            ElementState::Paused => "PAUSED",
            ElementState::Playing => "PLAYING",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
pub struct Element {
    name: String,
    factory: String,
    templates: Vec<PadTemplate>,
    pads: Vec<Pad>,
    properties: BTreeMap<String, String>,
    state: ElementState,
    parent: Option<ElementId>,
    pad_counters: HashMap<String, u32>,
}

impl Element {
    pub fn new(factory: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            factory: factory.to_string(),
            templates: Vec::new(),
            pads: Vec::new(),
            properties: BTreeMap::new(),
            state: ElementState::Null,
            parent: None,
            pad_counters: HashMap::new(),
        }
    }

    /// Registers a pad template; `Always` templates are instantiated at once.
    pub fn with_template(mut self, template: PadTemplate) -> Self {
        if template.presence == PadPresence::Always {
            self.pads.push(Pad {
                name: template.name.clone(),
                direction: template.direction,
                presence: PadPresence::Always,
                caps: template.caps.clone(),
                peer: None,
            });
        }
        self.templates.push(template);
        self
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn parent(&self) -> Option<ElementId> {
        self.parent
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn pads(&self) -> &[Pad] {
        &self.pads
    }

    pub fn pad(&self, name: &str) -> Option<&Pad> {
        self.pads.iter().find(|p| p.name == name)
    }

    fn pad_mut(&mut self, name: &str) -> Option<&mut Pad> {
        self.pads.iter_mut().find(|p| p.name == name)
    }

    fn template(&self, name: &str) -> Option<&PadTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// Instantiates a new pad from `template`, numbering `%u` patterns.
    fn new_pad_from_template(&mut self, template: &str, caps: Option<Caps>) -> Option<String> {
        let template = self.template(template)?.clone();
        let name = if template.name.contains("%u") {
            let counter = self.pad_counters.entry(template.name.clone()).or_insert(0);
            let name = template.name.replace("%u", &counter.to_string());
            *counter += 1;
            name
        } else if self.pad(&template.name).is_some() {
            return None;
        } else {
            template.name.clone()
        };

        self.pads.push(Pad {
            name: name.clone(),
            direction: template.direction,
            presence: template.presence,
            caps: caps.unwrap_or(template.caps),
            peer: None,
        });
        Some(name)
    }
}

/// Owner of every element in one transcode bin.
pub struct ElementGraph {
    name: String,
    elements: BTreeMap<ElementId, Element>,
    next_id: u64,
    state: ElementState,
}

impl ElementGraph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            elements: BTreeMap::new(),
            next_id: 0,
            state: ElementState::Null,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(&id)
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.elements.contains_key(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|(_, e)| e.name == name)
            .map(|(id, _)| *id)
    }

    pub fn children(&self, parent: Option<ElementId>) -> Vec<ElementId> {
        self.elements
            .iter()
            .filter(|(_, e)| e.parent == parent)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Adds `element` under `parent` (`None` is the graph root). Sibling
    /// names must be unique.
    pub fn add(&mut self, mut element: Element, parent: Option<ElementId>) -> Result<ElementId> {
        if let Some(parent) = parent {
            if !self.contains(parent) {
                return Err(GraphError::structure(format!(
                    "parent {} of {} not found",
                    parent, element.name
                )));
            }
        }
        if self
            .elements
            .values()
            .any(|e| e.parent == parent && e.name == element.name)
        {
            return Err(GraphError::structure(format!(
                "name {} is not unique in {}",
                element.name,
                self.parent_name(parent)
            )));
        }

        let id = ElementId(self.next_id);
        self.next_id += 1;
        element.parent = parent;
        log::trace!("{}: added {} ({})", self.name, element.name, element.factory);
        self.elements.insert(id, element);
        Ok(id)
    }

    /// Removes `id` and everything nested in it, unlinking all their pads.
    pub fn remove(&mut self, id: ElementId) -> Option<Element> {
        for child in self.children(Some(id)) {
            self.remove(child);
        }

        let pads: Vec<PadRef> = self
            .elements
            .get(&id)?
            .pads
            .iter()
            .map(|p| PadRef::new(id, &p.name))
            .collect();
        for pad in &pads {
            self.unlink(pad);
        }

        let mut element = self.elements.remove(&id)?;
        element.state = ElementState::Null;
        log::trace!("{}: removed {}", self.name, element.name);
        Some(element)
    }

    pub fn pad(&self, pad: &PadRef) -> Option<&Pad> {
        self.elements.get(&pad.element)?.pad(&pad.pad)
    }

    pub fn static_pad(&self, id: ElementId, name: &str) -> Option<PadRef> {
        self.elements
            .get(&id)?
            .pad(name)
            .map(|_| PadRef::new(id, name))
    }

    pub fn request_pad(&mut self, id: ElementId, template: &str) -> Option<PadRef> {
        let element = self.elements.get_mut(&id)?;
        if element.template(template)?.presence != PadPresence::Request {
            return None;
        }
        let name = element.new_pad_from_template(template, None)?;
        Some(PadRef::new(id, &name))
    }

    /// Exposes a new `Sometimes` pad carrying `caps`.
    pub fn add_pad(&mut self, id: ElementId, template: &str, caps: Caps) -> Result<PadRef> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or_else(|| GraphError::structure(format!("element {} not found", id)))?;
        let is_sometimes = element
            .template(template)
            .is_some_and(|t| t.presence == PadPresence::Sometimes);
        if !is_sometimes {
            return Err(GraphError::structure(format!(
                "{} has no sometimes pad template {}",
                element.name, template
            )));
        }
        let name = element
            .new_pad_from_template(template, Some(caps))
            .ok_or_else(|| GraphError::structure(format!("pad {} already exists", template)))?;
        Ok(PadRef::new(id, &name))
    }

    /// Unlinks and drops a request or sometimes pad.
    pub fn release_pad(&mut self, pad: &PadRef) {
        self.unlink(pad);
        if let Some(element) = self.elements.get_mut(&pad.element) {
            element
                .pads
                .retain(|p| p.name != pad.pad || p.presence == PadPresence::Always);
        }
    }

    pub fn is_linked(&self, pad: &PadRef) -> bool {
        self.pad(pad).is_some_and(Pad::is_linked)
    }

    /// `element:pad` path used in diagnostics.
    pub fn pad_path(&self, pad: &PadRef) -> String {
        match self.elements.get(&pad.element) {
            Some(element) => format!("{}:{}", element.name, pad.pad),
            None => format!("{}:{}", pad.element, pad.pad),
        }
    }

    fn link_error(&self, src: &PadRef, sink: &PadRef, reason: &str) -> GraphError {
        let caps = |p: &PadRef| self.pad(p).map(|p| p.caps.clone()).unwrap_or_else(Caps::empty);
        GraphError::LinkFailed {
            src: self.pad_path(src),
            src_caps: caps(src),
            sink: self.pad_path(sink),
            sink_caps: caps(sink),
            reason: reason.to_string(),
        }
    }

    pub fn link(&mut self, src: &PadRef, sink: &PadRef) -> Result<()> {
        let (Some(src_pad), Some(sink_pad)) = (self.pad(src), self.pad(sink)) else {
            return Err(self.link_error(src, sink, "no such pad"));
        };
        if src_pad.direction != PadDirection::Src || sink_pad.direction != PadDirection::Sink {
            return Err(self.link_error(src, sink, "wrong direction"));
        }
        if src_pad.is_linked() || sink_pad.is_linked() {
            return Err(self.link_error(src, sink, "was linked"));
        }
        if !src_pad.caps.can_intersect(&sink_pad.caps) {
            return Err(self.link_error(src, sink, "no format"));
        }

        if let Some(p) = self
            .elements
            .get_mut(&src.element)
            .and_then(|e| e.pad_mut(&src.pad))
        {
            p.peer = Some(sink.clone());
        }
        if let Some(p) = self
            .elements
            .get_mut(&sink.element)
            .and_then(|e| e.pad_mut(&sink.pad))
        {
            p.peer = Some(src.clone());
        }
        log::trace!(
            "{}: linked {} -> {}",
            self.name,
            self.pad_path(src),
            self.pad_path(sink)
        );
        Ok(())
    }

    /// Drops the link on `pad`, if any, on both ends.
    pub fn unlink(&mut self, pad: &PadRef) {
        let peer = self
            .elements
            .get_mut(&pad.element)
            .and_then(|e| e.pad_mut(&pad.pad))
            .and_then(|p| p.peer.take());
        if let Some(peer) = peer {
            if let Some(p) = self
                .elements
                .get_mut(&peer.element)
                .and_then(|e| e.pad_mut(&peer.pad))
            {
                p.peer = None;
            }
        }
    }

    pub fn set_property(&mut self, id: ElementId, key: &str, value: impl ToString) -> Result<()> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or_else(|| GraphError::structure(format!("element {} not found", id)))?;
        element.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Sets the state of the root and of every element in the graph.
    pub fn set_root_state(&mut self, state: ElementState) {
        log::debug!("{}: {} -> {}", self.name, self.state, state);
        self.state = state;
        for element in self.elements.values_mut() {
            element.state = state;
        }
    }

    /// Brings `id` (and its children) to the state of its parent.
    pub fn sync_state_with_parent(&mut self, id: ElementId) -> Result<ElementState> {
        let parent = self
            .elements
            .get(&id)
            .ok_or_else(|| GraphError::structure(format!("element {} not found", id)))?
            .parent;
        let state = match parent {
            Some(parent) => self
                .elements
                .get(&parent)
                .map(|p| p.state)
                .ok_or_else(|| GraphError::structure(format!("parent {} not found", parent)))?,
            None => self.state,
        };
        self.set_subtree_state(id, state);
        Ok(state)
    }

    fn set_subtree_state(&mut self, id: ElementId, state: ElementState) {
        if let Some(element) = self.elements.get_mut(&id) {
            element.state = state;
        }
        for child in self.children(Some(id)) {
            self.set_subtree_state(child, state);
        }
    }

    fn parent_name(&self, parent: Option<ElementId>) -> &str {
        parent
            .and_then(|p| self.elements.get(&p))
            .map(|e| e.name.as_str())
            .unwrap_or(&self.name)
    }

    /// Graphviz rendering of the graph; bins become clusters.
    pub fn to_dot(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "digraph \"{}\" {{", self.name);
        let _ = writeln!(out, "  rankdir=LR;");
        let _ = writeln!(out, "  node [shape=box, style=rounded];");
        let _ = writeln!(out, "  label=\"{} [{}]\";", self.name, self.state);
        self.write_dot_level(&mut out, None, 1);

        for (id, element) in &self.elements {
            for pad in &element.pads {
                if pad.direction != PadDirection::Src {
                    continue;
                }
                if let Some(peer) = &pad.peer {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [label=\"{} -> {}\"];",
                        id, peer.element, pad.name, peer.pad
                    );
                }
            }
        }
        out.push_str("}\n");
        out
    }

    fn write_dot_level(&self, out: &mut String, parent: Option<ElementId>, depth: usize) {
        let indent = "  ".repeat(depth);
        for id in self.children(parent) {
            let Some(element) = self.elements.get(&id) else {
                continue;
            };
            let nested = self.children(Some(id));
            if nested.is_empty() {
                let _ = writeln!(
                    out,
                    "{}{} [label=\"{}\\n({})\\n[{}]\"];",
                    indent, id, element.name, element.factory, element.state
                );
            } else {
                let _ = writeln!(out, "{}subgraph cluster_{} {{", indent, id);
                let _ = writeln!(
                    out,
                    "{}  label=\"{}\\n({})\\n[{}]\";",
                    indent, element.name, element.factory, element.state
                );
                let _ = writeln!(out, "{}  {} [shape=point, style=invis];", indent, id);
                self.write_dot_level(out, Some(id), depth + 1);
                let _ = writeln!(out, "{}}}", indent);
            }
        }
    }
}
