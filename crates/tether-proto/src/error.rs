//! Error types for the tether-proto crate

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Stream ended in the middle of a frame")]
    Truncated,
}

impl ProtoError {
    /// True when the error came from the byte stream rather than from the
    /// content of a frame.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtoError::Io(_) | ProtoError::Truncated)
    }
}
