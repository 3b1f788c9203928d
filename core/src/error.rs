use std::fmt;

/// Failure to turn the input bytes into a [`crate::ScanRun`].
///
/// No partial tree accompanies this error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed input at byte {position}: {reason}")]
    MalformedInput { position: u64, reason: String },
}

impl DecodeError {
    pub(crate) fn malformed(position: u64, reason: impl fmt::Display) -> Self {
        DecodeError::MalformedInput {
            position,
            reason: reason.to_string(),
        }
    }

    /// Byte offset into the input at which decoding stopped.
    pub fn position(&self) -> u64 {
        match self {
            DecodeError::MalformedInput { position, .. } => *position,
        }
    }
}
