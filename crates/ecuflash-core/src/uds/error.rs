//! Service layer errors.

use thiserror::Error;

use super::nrc::Nrc;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum UdsError {
    #[error("Negative response to service 0x{service:02X}: {nrc}")]
    NegativeResponse { service: u8, nrc: Nrc },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Unexpected response 0x{actual:02X} to service 0x{request:02X}")]
    UnexpectedService { request: u8, actual: u8 },

    #[error("Response still pending after {waited_ms}ms")]
    PendingTimeout { waited_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl UdsError {
    /// NRC carried by a negative response, if any.
    pub fn nrc(&self) -> Option<Nrc> {
        match self {
            UdsError::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }

    /// Whether repeating the exchange may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            UdsError::NegativeResponse { nrc, .. } => nrc.is_transient(),
            UdsError::Transport(_) | UdsError::PendingTimeout { .. } => true,
            UdsError::Malformed(_) | UdsError::UnexpectedService { .. } => false,
        }
    }
}
