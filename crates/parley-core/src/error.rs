use thiserror::Error;

/// Error kinds the router core distinguishes.
///
/// None of these propagate to a panic: input-shaped failures are logged
/// and recovered locally, with the user-visible fallout at worst a
/// polite reply or a dropped turn. Panics are reserved for startup-time
/// conditions (missing required directories, unbindable KV port), which
/// the gateway handles before entering the run loop.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] parley_protocol::ProtocolError),

    #[error("unknown event type {0} for this direction")]
    UnknownEvent(u16),

    #[error("no dialog state for dialog {0}")]
    DialogNotFound(String),

    #[error("failed to spawn worker for intent '{intent}': {source}")]
    WorkerSpawnFailed {
        intent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker for dialog {0} never connected to its socket")]
    WorkerPeerAbsent(String),

    #[error("corrupt frame on worker socket for dialog {0}")]
    WorkerFrameCorrupt(String),

    #[error("clarifier call already in flight for dialog {0}")]
    ClarifierBusy(String),

    #[error("persist write failed: {0}")]
    PersistWriteFailed(#[from] std::io::Error),
}
