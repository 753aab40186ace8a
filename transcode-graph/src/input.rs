//! Input Units: the attachment points of a transcode bin.

use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    bin::BinEvent,
    decoder::DecodeUnit,
    error::{GraphError, Result},
};

pub const MAIN_INPUT: &str = "sink";

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InputName(String);

impl InputName {
    pub fn main() -> Self {
        Self(MAIN_INPUT.to_string())
    }

    fn requested(counter: u32) -> Self {
        Self(format!("{}_{}", MAIN_INPUT, counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_INPUT
    }
}

impl fmt::Display for InputName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InputName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachState {
    Unattached,
    Attached,
    Detaching,
}

pub struct InputUnit {
    pub(crate) name: InputName,
    pub(crate) is_main: bool,
    pub(crate) state: AttachState,
    pub(crate) decode: Option<DecodeUnit>,
}

impl InputUnit {
    fn new(name: InputName, is_main: bool) -> Self {
        Self {
            name,
            is_main,
            state: AttachState::Unattached,
            decode: None,
        }
    }

    pub fn name(&self) -> &InputName {
        &self.name
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn decode(&self) -> Option<&DecodeUnit> {
        self.decode.as_ref()
    }
}

/// Membership of a bin's inputs. Only the bin task mutates it.
pub struct InputSet {
    main: InputUnit,
    other_inputs: BTreeMap<InputName, InputUnit>,
    counter: u32,
}

impl Default for InputSet {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSet {
    pub fn new() -> Self {
        Self {
            main: InputUnit::new(InputName::main(), true),
            other_inputs: BTreeMap::new(),
            counter: 0,
        }
    }

    /// Creates a requested input. Names are never reused.
    pub fn request(&mut self) -> InputName {
        let name = InputName::requested(self.counter);
        self.counter += 1;
        self.other_inputs
            .insert(name.clone(), InputUnit::new(name.clone(), false));
        name
    }

    pub fn get(&self, name: &InputName) -> Option<&InputUnit> {
        if name.is_main() {
            Some(&self.main)
        } else {
            self.other_inputs.get(name)
        }
    }

    pub fn get_mut(&mut self, name: &InputName) -> Option<&mut InputUnit> {
        if name.is_main() {
            Some(&mut self.main)
        } else {
            self.other_inputs.get_mut(name)
        }
    }

    /// Takes a requested input out of the set; the main input stays.
    pub fn remove(&mut self, name: &InputName) -> Result<InputUnit> {
        if name.is_main() {
            return Err(GraphError::InvalidState {
                state: "main input".to_string(),
                operation: "remove".to_string(),
            });
        }
        self.other_inputs
            .remove(name)
            .ok_or_else(|| GraphError::UnknownInput {
                name: name.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &InputUnit> {
        std::iter::once(&self.main).chain(self.other_inputs.values())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InputUnit> {
        std::iter::once(&mut self.main).chain(self.other_inputs.values_mut())
    }

    pub fn len(&self) -> usize {
        1 + self.other_inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Empties the requested inputs, e.g. on shutdown.
    pub(crate) fn drain_requested(&mut self) -> Vec<InputUnit> {
        std::mem::take(&mut self.other_inputs).into_values().collect()
    }
}

/// Final teardown of a detached request input. Runs on its own task, never
/// on the stack of the command that detached it.
pub(crate) async fn release(mut unit: InputUnit, events: broadcast::Sender<BinEvent>) {
    if let Some(mut decode) = unit.decode.take() {
        decode.stop();
    }
    unit.state = AttachState::Unattached;
    log::debug!("input {} released", unit.name);
    let _ = events.send(BinEvent::InputReleased { input: unit.name });
}
