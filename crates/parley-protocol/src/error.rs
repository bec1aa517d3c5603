use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("bad frame magic: {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame body of {0} bytes exceeds the limit")]
    BodyTooLarge(u32),

    #[error("unknown event type: {0}")]
    UnknownEvent(u16),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
