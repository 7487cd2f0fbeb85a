//! CAN bus transport abstraction.
//!
//! Defines the `CanBus` trait for raw frame exchange, allowing
//! different implementations (SocketCAN, mock, simulated ECU).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::frame::CanFrame;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid CAN identifier 0x{0:X} (11-bit identifiers only)")]
    InvalidId(u32),

    #[error("Frame payload too long: {0} bytes")]
    FrameTooLong(usize),

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("Message too long for segmentation: {0} bytes")]
    MessageTooLong(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("No flow control frame within {timeout_ms}ms")]
    NoFlowControl { timeout_ms: u64 },

    /// The device answered with a single frame instead of flow control,
    /// typically a negative response to a segmented request.
    #[error("Device answered before flow control ({} bytes)", .0.len())]
    EarlyResponse(Vec<u8>),

    #[error("Receiver reported overflow")]
    Overflow,

    #[error("Consecutive frame out of sequence: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("Message incomplete after {timeout_ms}ms: {received}/{expected} bytes")]
    AssemblyTimeout {
        timeout_ms: u64,
        received: usize,
        expected: usize,
    },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether the error means "nothing arrived in time".
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::NoFlowControl { .. }
                | TransportError::AssemblyTimeout { .. }
        )
    }
}

/// Abstract CAN bus interface.
///
/// Exactly one conversation is in flight at a time, so implementations
/// only need to be safe to move to the worker thread that owns the run.
pub trait CanBus: Send + Sync {
    /// Put one frame on the bus.
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next frame from any identifier.
    ///
    /// Returns `TransportError::Timeout` when nothing arrived.
    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError>;

    /// Check if the bus is still usable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Human readable name of the interface.
    fn name(&self) -> String;
}

impl<T: CanBus + ?Sized> CanBus for &T {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        (**self).recv(timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

impl<T: CanBus + ?Sized> CanBus for Arc<T> {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        (**self).recv(timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

impl<T: CanBus + ?Sized> CanBus for Box<T> {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        (**self).recv(timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
