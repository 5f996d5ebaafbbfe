//! Error types emitted by the build core.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = KilnError> = std::result::Result<T, E>;

/// Various errors produced while tracking values and building nodes.
#[derive(Debug, Error)]
pub enum KilnError {
    /// An entity was constructed with an empty name.
    #[error("entity name is empty")]
    EmptyName,
    /// A raw value that is not a byte string was forced into a signature entity.
    #[error("signature data must be a byte string, got {0}")]
    InvalidSignatureData(&'static str),
    /// Something other than a node, a targets filter or an entity was passed to `depends`.
    #[error("invalid node dependency: {0}")]
    InvalidDependency(String),
    /// Node targets were read before the node was built or its cached result adopted.
    #[error("node targets are not built or set yet: {0}")]
    NoTargets(String),
    /// A batch source has no targets after the batch build completed.
    #[error("source '{source_name}' targets are not built or set yet: {node}")]
    NoSourceTargets { source_name: String, node: String },
    /// A source value handed to a batch node is not one of its sources.
    #[error("unknown batch source value: {0}")]
    UnknownSource(String),
    /// A batch node has no whole-node name or signature.
    #[error("a batch node has no single name or signature")]
    BatchNodeName,
    /// `add_targets` was called on a batch node.
    #[error("add_targets is not allowed for a batch node, use add_source_targets")]
    BatchNodeTargets,
    /// A target or implicit dep was saved while its on-disk state disagrees.
    #[error("value is not actual: {0}")]
    UnactualValue(String),
    /// The fallback directory lock exhausted its retries.
    #[error("lock file '{0}' timeout")]
    LockTimeout(PathBuf),
    #[error(transparent)]
    Io(#[from] KilnIoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl KilnError {
    pub fn io(err: io::Error, path: impl AsRef<Path>) -> Self {
        KilnIoError::new(err, path).into()
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        KilnError::Message(msg.into())
    }
}

/// An `io::Error` annotated with the path it occurred on.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct KilnIoError {
    io: io::Error,
    path: PathBuf,
}

impl KilnIoError {
    pub fn new(io: io::Error, path: impl AsRef<Path>) -> Self {
        Self { io, path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }
}

impl From<KilnIoError> for io::Error {
    fn from(err: KilnIoError) -> Self {
        err.io
    }
}
