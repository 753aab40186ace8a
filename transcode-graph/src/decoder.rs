//! Decode Units and the drivers behind them.
//!
//! A driver reports what it discovers through [`DecodeEvents`]; the reports
//! are messages into the owning bin's command queue, so a driver may run on
//! any task or thread.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    bin::BinCommand,
    caps::Caps,
    element::{ElementId, PadRef},
    error::Result,
    input::InputName,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct DecodeUnitId(pub(crate) u64);

impl fmt::Display for DecodeUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode-unit-{}", self.0)
    }
}

/// Demultiplex+decode driver bound to one Decode Unit.
pub trait DemuxDecoder: Send {
    /// Begins discovery. Must not block; long work goes to a spawned task.
    fn start(&mut self, events: DecodeEvents) -> anyhow::Result<()>;

    fn stop(&mut self);
}

/// Handle a driver uses to report discovered streams.
#[derive(Clone)]
pub struct DecodeEvents {
    input: InputName,
    unit: DecodeUnitId,
    tx: mpsc::Sender<BinCommand>,
}

impl DecodeEvents {
    pub(crate) fn new(input: InputName, unit: DecodeUnitId, tx: mpsc::Sender<BinCommand>) -> Self {
        Self { input, unit, tx }
    }

    pub fn input(&self) -> &InputName {
        &self.input
    }

    pub fn unit(&self) -> DecodeUnitId {
        self.unit
    }

    pub async fn stream_added(&self, caps: Caps) -> Result<()> {
        self.tx
            .send(BinCommand::StreamDiscovered {
                unit: self.unit,
                caps,
            })
            .await?;
        Ok(())
    }

    pub async fn no_more_streams(&self) -> Result<()> {
        self.tx
            .send(BinCommand::NoMoreStreams { unit: self.unit })
            .await?;
        Ok(())
    }

    /// For drivers running on plain threads, e.g. inside `spawn_blocking`.
    pub fn stream_added_blocking(&self, caps: Caps) -> Result<()> {
        self.tx.blocking_send(BinCommand::StreamDiscovered {
            unit: self.unit,
            caps,
        })?;
        Ok(())
    }

    pub fn no_more_streams_blocking(&self) -> Result<()> {
        self.tx
            .blocking_send(BinCommand::NoMoreStreams { unit: self.unit })?;
        Ok(())
    }
}

/// Driver reporting a fixed list of streams, in order.
pub struct ManifestDecoder {
    streams: Vec<Caps>,
    cancel: CancellationToken,
}

impl ManifestDecoder {
    pub fn new(streams: Vec<Caps>) -> Self {
        Self {
            streams,
            cancel: CancellationToken::new(),
        }
    }
}

impl DemuxDecoder for ManifestDecoder {
    fn start(&mut self, events: DecodeEvents) -> anyhow::Result<()> {
        let streams = self.streams.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for caps in streams {
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = events.stream_added(caps).await {
                    log::debug!("{}: stream report dropped: {}", events.input(), e);
                    return;
                }
            }
            if !cancel.is_cancelled() {
                let _ = events.no_more_streams().await;
            }
        });
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for ManifestDecoder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodePhase {
    Active,
    /// All streams have been reported.
    Finalizing,
}

/// A demux+decode stage owned by one Input Unit.
pub struct DecodeUnit {
    pub(crate) id: DecodeUnitId,
    pub(crate) element: ElementId,
    pub(crate) driver: Box<dyn DemuxDecoder>,
    pub(crate) started: bool,
    pub(crate) phase: DecodePhase,
    pub(crate) streams: Vec<PadRef>,
}

impl DecodeUnit {
    pub(crate) fn new(id: DecodeUnitId, element: ElementId, driver: Box<dyn DemuxDecoder>) -> Self {
        Self {
            id,
            element,
            driver,
            started: false,
            phase: DecodePhase::Active,
            streams: Vec::new(),
        }
    }

    pub fn id(&self) -> DecodeUnitId {
        self.id
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn phase(&self) -> DecodePhase {
        self.phase
    }

    pub fn streams(&self) -> &[PadRef] {
        &self.streams
    }

    pub(crate) fn start(&mut self, events: DecodeEvents) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        self.driver.start(events)?;
        self.started = true;
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if self.started {
            self.driver.stop();
            self.started = false;
        }
    }
}
