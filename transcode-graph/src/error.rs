use std::path::Path;

use crate::caps::Caps;

pub type Result<T, E = GraphError> = std::result::Result<T, E>;

/// Errors raised while assembling or mutating the transcode graph.
///
/// Every variant is `Clone` so the same value can be returned to the caller
/// and published to observers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("no encoding target specified")]
    MissingTarget,

    /// A processing capability is not installed; `factory` names it.
    #[error("missing element '{factory}' - check your installation")]
    MissingCapability { factory: String },

    #[error("unsupported encoding profile '{profile}': {reason}")]
    UnsupportedProfile { profile: String, reason: String },

    /// No installed encoder produces `caps`.
    #[error("stream with caps {caps} can not be encoded in the defined encoding formats (profile '{profile}')")]
    CannotEncode { profile: String, caps: Caps },

    #[error("couldn't link pads ({reason}):\n    {src}: {src_caps}\nand:\n    {sink}: {sink_caps}")]
    LinkFailed {
        src: String,
        src_caps: Caps,
        sink: String,
        sink_caps: Caps,
        reason: String,
    },

    #[error("graph structure error: {message}")]
    Structure { message: String },

    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("cannot {operation} while {state}")]
    InvalidState { state: String, operation: String },

    #[error("unknown input '{name}'")]
    UnknownInput { name: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("transcode bin is closed")]
    Closed,
}

impl GraphError {
    pub fn io(path: &Path, err: std::io::Error) -> Self {
        GraphError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn structure(message: impl Into<String>) -> Self {
        GraphError::Structure {
            message: message.into(),
        }
    }

    /// Policy diagnostics published as warnings rather than errors.
    pub fn is_warning(&self) -> bool {
        matches!(self, GraphError::CannotEncode { .. })
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GraphError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GraphError::Closed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for GraphError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        GraphError::Closed
    }
}
