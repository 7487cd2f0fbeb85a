//! Event system for UI decoupling.
//!
//! Front ends subscribe to engine events through `FlashObserver`. The
//! engine calls observers synchronously and knows nothing about threads;
//! `ChannelObserver` turns events into a plain channel stream.

use std::fmt;
use std::sync::mpsc::Sender;

use crate::state::FlashState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Frame direction on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for FrameDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDirection::Tx => write!(f, "TX"),
            FrameDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted while a flash run progresses.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Orchestrator state changed.
    StateChanged { from: FlashState, to: FlashState },
    /// Progress of a long operation, in bytes.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Frame sent or received.
    Frame {
        direction: FrameDirection,
        id: u16,
        data: Vec<u8>,
    },
    /// Run finished.
    Finished { success: bool },
}

/// Observer trait for receiving flash events.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

impl<T: FlashObserver + ?Sized> FlashObserver for std::sync::Arc<T> {
    fn on_event(&self, event: &FlashEvent) {
        (**self).on_event(event)
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that forwards events to a channel.
///
/// A disconnected receiver is ignored; the run never depends on its UI.
pub struct ChannelObserver {
    sender: Sender<FlashEvent>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<FlashEvent>) -> Self {
        Self { sender }
    }
}

impl FlashObserver for ChannelObserver {
    fn on_event(&self, event: &FlashEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            FlashEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Frame {
                direction,
                id,
                data,
            } => {
                tracing::trace!(
                    dir = %direction,
                    id = %format!("{:03X}", id),
                    len = data.len(),
                    "CAN frame"
                );
            }
            FlashEvent::Finished { success } => {
                tracing::info!(success, "Run finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_event(&FlashEvent::Finished { success: true });
        assert!(matches!(
            rx.try_recv().unwrap(),
            FlashEvent::Finished { success: true }
        ));
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_event(&FlashEvent::Finished { success: false });
    }
}
