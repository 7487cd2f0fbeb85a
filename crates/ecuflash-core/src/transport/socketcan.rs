//! SocketCAN driver (Linux, `socketcan` feature).

use std::io::ErrorKind;
use std::time::Duration;

use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket, StandardId};
use tracing::{debug, info};

use super::frame::CanFrame;
use super::traits::{CanBus, TransportError};

/// Smallest read timeout the socket accepts.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Raw CAN socket on a network interface such as `can0`.
pub struct SocketCanBus {
    socket: CanSocket,
    interface: String,
}

impl SocketCanBus {
    pub fn open(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::Bus(format!("Failed to open CAN socket on {}: {}", interface, e))
        })?;
        info!(interface, "CAN socket opened");
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }
}

impl CanBus for SocketCanBus {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let id = StandardId::new(frame.id()).ok_or(TransportError::InvalidId(frame.id() as u32))?;
        let raw = socketcan::CanFrame::new(id, frame.data())
            .ok_or(TransportError::FrameTooLong(frame.data().len()))?;
        self.socket.write_frame(&raw)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        self.socket.set_read_timeout(timeout.max(MIN_TIMEOUT))?;
        loop {
            let raw = match self.socket.read_frame() {
                Ok(f) => f,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::timeout(timeout));
                }
                Err(e) => return Err(e.into()),
            };
            if raw.is_error_frame() || raw.is_remote_frame() || raw.is_extended() {
                debug!(id = raw.raw_id(), "Skipping non-data or extended frame");
                continue;
            }
            return CanFrame::new(raw.raw_id() as u16, raw.data());
        }
    }

    fn name(&self) -> String {
        format!("socketcan:{}", self.interface)
    }
}
