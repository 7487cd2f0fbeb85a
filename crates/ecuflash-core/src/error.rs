//! Error taxonomy for the flashing engine.
//!
//! Transport and protocol failures are retried locally with bounded
//! attempts. Integrity and safety failures are never retried: they end the
//! run and must prevent (or report the consequences of) a device write.

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;
use crate::state::FlashState;
use crate::transport::TransportError;
use crate::uds::UdsError;

/// Data did not match what it was supposed to be.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Checksum mismatch in {path}: expected {expected:08X}, got {actual:08X}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Verify pass {pass} failed: {differing} differing bytes (first at offset {first:?})")]
    VerifyMismatch {
        pass: u8,
        differing: usize,
        first: Option<usize>,
    },

    #[error("Region 0x{offset:X}+0x{size:X} lies outside a {len}-byte dump")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("Backup {path} unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// A safety gate refused to let the run reach a device write.
#[derive(Debug, Error)]
pub enum SafetyAbort {
    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error(
        "Bus quality too low: {successes}/{total} keep-alives answered ({ratio:.2}, must exceed {threshold:.2})"
    )]
    BusQuality {
        successes: u32,
        total: u32,
        ratio: f64,
        threshold: f64,
    },

    #[error("Only {verified} verified backup copies (at least 1 required, target {target})")]
    InsufficientBackups { verified: usize, target: usize },
}

/// Any failure inside the engine.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] UdsError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Safety(#[from] SafetyAbort),

    #[error("Block {block}/{total} failed after {attempts} attempts: {source}")]
    BlockFailed {
        block: u32,
        total: u32,
        attempts: u32,
        #[source]
        source: Box<FlashError>,
    },

    #[error("Read at 0x{address:08X} failed after {attempts} attempts: {source}")]
    ReadFailed {
        address: u32,
        attempts: u32,
        #[source]
        source: Box<FlashError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlashError {
    /// Whether a block-level retry may fix this.
    pub fn is_retryable(&self) -> bool {
        match self {
            FlashError::Transport(_) => true,
            FlashError::Protocol(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the device reported lost privileges.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            FlashError::Protocol(UdsError::NegativeResponse {
                nrc: crate::uds::Nrc::SecurityAccessDenied,
                ..
            })
        )
    }
}

/// Terminal failure of an orchestrated run, with what an operator needs
/// to recover by hand.
#[derive(Debug, Error)]
#[error("Flash run failed in {state}: {error}")]
pub struct FlashFailure {
    /// State the run was in when it failed.
    pub state: FlashState,
    #[source]
    pub error: FlashError,
    /// First verified backup, when one exists.
    pub backup_path: Option<PathBuf>,
    /// Last block acknowledged by the device during `Write`.
    pub last_block: Option<u32>,
    /// Audit log of the run.
    pub audit_path: Option<PathBuf>,
}
