//! Mock CAN bus for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::frame::CanFrame;
use super::traits::{CanBus, TransportError};

#[derive(Default)]
struct Inbox {
    frames: Mutex<VecDeque<CanFrame>>,
    ready: Condvar,
}

impl Inbox {
    fn push(&self, frame: CanFrame) {
        self.frames.lock().unwrap().push_back(frame);
        self.ready.notify_one();
    }
}

/// Mock transport for unit testing framing and service logic.
///
/// A standalone mock returns queued frames and captures everything sent.
/// Linked mocks from [`MockBus::pair`] deliver each other's frames, so two
/// channels can talk across threads.
#[derive(Clone)]
pub struct MockBus {
    /// Frames waiting to be received.
    inbox: Arc<Inbox>,
    /// Where sent frames are delivered (linked pairs only).
    peer: Option<Arc<Inbox>>,
    /// Captured sends.
    sent: Arc<Mutex<Vec<CanFrame>>>,
    /// Whether the bus is "connected".
    connected: Arc<Mutex<bool>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            inbox: Arc::new(Inbox::default()),
            peer: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
        }
    }

    /// Two buses wired back to back.
    pub fn pair() -> (Self, Self) {
        let mut a = Self::new();
        let mut b = Self::new();
        a.peer = Some(b.inbox.clone());
        b.peer = Some(a.inbox.clone());
        (a, b)
    }

    /// Queue a frame to be returned on a later `recv`.
    pub fn queue_frame(&self, id: u16, data: &[u8]) {
        let frame = CanFrame::new(id, data).unwrap();
        self.inbox.push(frame);
    }

    /// Get all captured sends.
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().unwrap().clone()
    }

    /// Clear captured sends.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Simulate the adapter going away.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CanBus for MockBus {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().unwrap().push(*frame);
        if let Some(peer) = &self.peer {
            peer.push(*frame);
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let mut frames = self.inbox.frames.lock().unwrap();
        if self.peer.is_none() {
            // Standalone mocks never block: an empty queue is a timeout.
            return frames
                .pop_front()
                .ok_or_else(|| TransportError::timeout(timeout));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = frames.pop_front() {
                return Ok(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::timeout(timeout));
            }
            frames = self.inbox.ready.wait_timeout(frames, deadline - now).unwrap().0;
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
