//! Crate-wide error type.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type StudioResult<T> = Result<T, StudioError>;

/// Errors that can occur while running the room service, client sync layer,
/// or CSG evaluator.
#[derive(Error, Debug)]
pub enum StudioError {
    /// A CSG node id was not found in the tree it was looked up against.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The room id did not match the accepted grammar.
    #[error("invalid room id: {0}")]
    InvalidRoomId(String),

    /// A `snapshot?at=...` frontier query string was malformed.
    #[error("malformed frontier query: {0}")]
    MalformedFrontier(String),

    /// A wire frame's tag byte was not recognised.
    #[error("unknown wire frame tag: {0:#04x}")]
    UnknownFrameTag(u8),

    /// A wire frame was shorter than its tag required.
    #[error("truncated wire frame")]
    TruncatedFrame,

    /// CRDT import failed because the encoded update could not be decoded.
    #[error("malformed CRDT update: {0}")]
    MalformedUpdate(String),

    /// A merge-point dependency referenced a (peer, counter) not present in
    /// any known change.
    #[error("dangling change dependency: peer {peer} counter {counter}")]
    DanglingDependency { peer: u64, counter: u64 },

    /// Geometry engine failed to build a node's geometry.
    #[error("geometry build failed for node {node_id}: {message}")]
    GeometryBuildFailed { node_id: String, message: String },

    /// Underlying storage failure. Per the room service's error policy this
    /// is always propagated to the caller, never swallowed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Transport-level failure on a WebSocket or HTTP connection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl StudioError {
    /// Whether a client should treat this as transient (reconnect, re-fetch)
    /// rather than surface it as a hard failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, StudioError::Transport(_) | StudioError::Io(_))
    }
}
