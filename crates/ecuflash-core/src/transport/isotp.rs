//! ISO 15765-2 style segmentation.
//!
//! Logical messages are carried in 8-byte frames:
//!
//! | PCI nibble | Frame             | Layout                                   |
//! |------------|-------------------|------------------------------------------|
//! | `0`        | Single            | `0L dd dd dd dd dd dd dd` (L <= 7)       |
//! | `1`        | First             | `1L LL dd dd dd dd dd dd` (12-bit length)|
//! | `1`        | First (escape)    | `10 00 LL LL LL LL dd dd` (32-bit length)|
//! | `2`        | Consecutive       | `2N dd dd dd dd dd dd dd` (N wraps 0-15) |
//! | `3`        | Flow control      | `3S BS ST`                               |
//!
//! The pure codec (`segment`, `Pci`, `Reassembler`) is shared by the host
//! channel and the simulated ECU so both sides frame identically.

use std::thread;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use super::frame::{CAN_MAX_DLEN, CanFrame};
use super::traits::{CanBus, TransportError};

/// Largest length expressible in a 12-bit first frame.
pub const MAX_SHORT_LENGTH: usize = 0xFFF;

/// Data bytes carried by a single frame.
pub const SINGLE_FRAME_DATA: usize = 7;

/// Data bytes carried by a consecutive frame.
pub const CONSECUTIVE_FRAME_DATA: usize = 7;

/// A drain never runs longer than this many quiet windows.
const DRAIN_WINDOW_LIMIT: u32 = 10;

/// A drain never consumes more frames than this.
const DRAIN_FRAME_LIMIT: usize = 512;

/// Flow status carried by a flow control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    fn nibble(self) -> u8 {
        match self {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        }
    }
}

/// Protocol control information of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    Single { len: usize },
    First { len: usize },
    Consecutive { index: u8 },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    },
}

impl Pci {
    /// Split a frame payload into its PCI and the data bytes that follow.
    pub fn parse(data: &[u8]) -> Result<(Pci, &[u8]), TransportError> {
        let Some(&b0) = data.first() else {
            return Err(TransportError::MalformedFrame("empty frame".into()));
        };
        let low = (b0 & 0x0F) as usize;
        match b0 >> 4 {
            0 => {
                if low == 0 || low > data.len() - 1 {
                    return Err(TransportError::MalformedFrame(format!(
                        "single frame length {} with {} bytes",
                        low,
                        data.len()
                    )));
                }
                Ok((Pci::Single { len: low }, &data[1..1 + low]))
            }
            1 => {
                if data.len() < 2 {
                    return Err(TransportError::MalformedFrame("truncated first frame".into()));
                }
                let short = (low << 8) | data[1] as usize;
                if short == 0 {
                    if data.len() < 6 {
                        return Err(TransportError::MalformedFrame(
                            "truncated escape first frame".into(),
                        ));
                    }
                    let len = BigEndian::read_u32(&data[2..6]) as usize;
                    if len <= MAX_SHORT_LENGTH {
                        return Err(TransportError::MalformedFrame(format!(
                            "escape first frame with short length {}",
                            len
                        )));
                    }
                    Ok((Pci::First { len }, &data[6..]))
                } else if short <= SINGLE_FRAME_DATA {
                    Err(TransportError::MalformedFrame(format!(
                        "first frame announcing {} bytes",
                        short
                    )))
                } else {
                    Ok((Pci::First { len: short }, &data[2..]))
                }
            }
            2 => Ok((Pci::Consecutive { index: low as u8 }, &data[1..])),
            3 => {
                if data.len() < 3 {
                    return Err(TransportError::MalformedFrame("truncated flow control".into()));
                }
                let status = match low {
                    0 => FlowStatus::ContinueToSend,
                    1 => FlowStatus::Wait,
                    2 => FlowStatus::Overflow,
                    other => {
                        return Err(TransportError::MalformedFrame(format!(
                            "flow status {}",
                            other
                        )));
                    }
                };
                Ok((
                    Pci::FlowControl {
                        status,
                        block_size: data[1],
                        st_min: data[2],
                    },
                    &data[3..],
                ))
            }
            other => Err(TransportError::MalformedFrame(format!(
                "unknown frame type {}",
                other
            ))),
        }
    }
}

/// Decode an STmin byte into a delay.
pub fn st_min_duration(st_min: u8) -> Duration {
    match st_min {
        0x00..=0x7F => Duration::from_millis(st_min as u64),
        0xF1..=0xF9 => Duration::from_micros((st_min - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Build a flow control frame payload.
pub fn flow_control(status: FlowStatus, block_size: u8, st_min: u8, padding: u8) -> [u8; 8] {
    let mut frame = [padding; CAN_MAX_DLEN];
    frame[0] = 0x30 | status.nibble();
    frame[1] = block_size;
    frame[2] = st_min;
    frame
}

/// Split a message into padded frame payloads.
///
/// The first element is a single or first frame; the rest are consecutive
/// frames with indices starting at 1.
pub fn segment(payload: &[u8], padding: u8) -> Result<Vec<[u8; 8]>, TransportError> {
    if payload.is_empty() {
        return Err(TransportError::EmptyMessage);
    }
    if payload.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLong(payload.len()));
    }

    if payload.len() <= SINGLE_FRAME_DATA {
        let mut frame = [padding; CAN_MAX_DLEN];
        frame[0] = payload.len() as u8;
        frame[1..1 + payload.len()].copy_from_slice(payload);
        return Ok(vec![frame]);
    }

    let mut first = [padding; CAN_MAX_DLEN];
    let header = if payload.len() <= MAX_SHORT_LENGTH {
        first[0] = 0x10 | (payload.len() >> 8) as u8;
        first[1] = (payload.len() & 0xFF) as u8;
        2
    } else {
        first[0] = 0x10;
        first[1] = 0x00;
        BigEndian::write_u32(&mut first[2..6], payload.len() as u32);
        6
    };
    let first_data = CAN_MAX_DLEN - header;
    first[header..].copy_from_slice(&payload[..first_data]);

    let rest = &payload[first_data..];
    let mut frames = Vec::with_capacity(1 + rest.len().div_ceil(CONSECUTIVE_FRAME_DATA));
    frames.push(first);

    let mut index: u8 = 1;
    for chunk in rest.chunks(CONSECUTIVE_FRAME_DATA) {
        let mut frame = [padding; CAN_MAX_DLEN];
        frame[0] = 0x20 | index;
        frame[1..1 + chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
        index = (index + 1) & 0x0F;
    }

    Ok(frames)
}

/// Outcome of feeding one frame to a `Reassembler`.
#[derive(Debug, PartialEq, Eq)]
pub enum Assembly {
    /// A full message is available.
    Complete(Vec<u8>),
    /// A first frame opened a new message; the peer expects flow control.
    Started { expected: usize },
    /// A consecutive frame was accepted.
    InProgress,
    /// Frame carries nothing for a receiver in the current state.
    Ignored,
}

/// Receive-side state for one segmented message.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u8>,
    expected: usize,
    next_index: u8,
    active: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
        self.next_index = 0;
        self.active = false;
    }

    /// Bytes received so far and bytes announced, while a message is open.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.active.then_some((self.buf.len(), self.expected))
    }

    pub fn push(&mut self, data: &[u8]) -> Result<Assembly, TransportError> {
        let (pci, body) = Pci::parse(data)?;
        match pci {
            Pci::Single { len } => {
                self.reset();
                Ok(Assembly::Complete(body[..len].to_vec()))
            }
            Pci::First { len } => {
                self.reset();
                self.buf.reserve(len);
                self.buf.extend_from_slice(&body[..body.len().min(len)]);
                self.expected = len;
                self.next_index = 1;
                self.active = true;
                Ok(Assembly::Started { expected: len })
            }
            Pci::Consecutive { index } => {
                if !self.active {
                    return Ok(Assembly::Ignored);
                }
                if index != self.next_index {
                    let expected = self.next_index;
                    self.reset();
                    return Err(TransportError::SequenceMismatch {
                        expected,
                        actual: index,
                    });
                }
                let take = (self.expected - self.buf.len()).min(body.len());
                self.buf.extend_from_slice(&body[..take]);
                self.next_index = (self.next_index + 1) & 0x0F;
                if self.buf.len() >= self.expected {
                    self.active = false;
                    self.expected = 0;
                    Ok(Assembly::Complete(std::mem::take(&mut self.buf)))
                } else {
                    Ok(Assembly::InProgress)
                }
            }
            Pci::FlowControl { .. } => Ok(Assembly::Ignored),
        }
    }
}

fn expired(assembler: &Reassembler, waited: Duration) -> TransportError {
    match assembler.progress() {
        Some((received, expected)) => TransportError::AssemblyTimeout {
            timeout_ms: waited.as_millis() as u64,
            received,
            expected,
        },
        None => TransportError::timeout(waited),
    }
}

/// Segmentation parameters for one channel.
#[derive(Debug, Clone)]
pub struct IsoTpConfig {
    /// Identifier the host transmits on.
    pub tx_id: u16,
    /// Identifier the device answers on.
    pub rx_id: u16,
    /// Filler for unused frame bytes.
    pub padding: u8,
    /// Block size advertised in our flow control frames (0 = unlimited).
    pub block_size: u8,
    /// STmin advertised in our flow control frames.
    pub st_min: u8,
    /// How long the sender waits for a flow control frame.
    pub fc_timeout: Duration,
    /// How long the receiver waits between consecutive frames.
    pub cf_timeout: Duration,
    /// Flow control WAIT frames tolerated before giving up.
    pub max_wait_frames: u8,
    /// Quiet period used when draining stray frames.
    pub drain_window: Duration,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            tx_id: 0x7E0,
            rx_id: 0x7E8,
            padding: 0x00,
            block_size: 0,
            st_min: 0,
            fc_timeout: Duration::from_secs(2),
            cf_timeout: Duration::from_secs(1),
            max_wait_frames: 10,
            drain_window: Duration::from_millis(50),
        }
    }
}

/// A half-duplex segmented channel over a CAN bus.
pub struct IsoTpChannel<B: CanBus> {
    bus: B,
    config: IsoTpConfig,
}

impl<B: CanBus> IsoTpChannel<B> {
    pub fn new(bus: B, config: IsoTpConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &IsoTpConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn transmit(&self, id: u16, payload: &[u8; 8]) -> Result<(), TransportError> {
        let frame = CanFrame::new(id, payload)?;
        trace!(frame = ?frame, "TX");
        self.bus.send(&frame)
    }

    /// Send a complete message to the device.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let frames = segment(payload, self.config.padding)?;
        let tx_id = self.config.tx_id;
        self.transmit(tx_id, &frames[0])?;

        let mut next = 1;
        while next < frames.len() {
            let (block_size, st_min) = self.await_flow_control()?;
            let gap = st_min_duration(st_min);
            let block_end = if block_size == 0 {
                frames.len()
            } else {
                (next + block_size as usize).min(frames.len())
            };
            for (i, frame) in frames[next..block_end].iter().enumerate() {
                if i > 0 && !gap.is_zero() {
                    thread::sleep(gap);
                }
                self.transmit(tx_id, frame)?;
            }
            next = block_end;
        }

        debug!(len = payload.len(), frames = frames.len(), "Message sent");
        Ok(())
    }

    /// Send an unsegmented message on another identifier (functional addressing).
    pub fn send_single(&self, id: u16, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > SINGLE_FRAME_DATA {
            return Err(TransportError::MessageTooLong(payload.len()));
        }
        let frames = segment(payload, self.config.padding)?;
        self.transmit(id, &frames[0])
    }

    fn await_flow_control(&self) -> Result<(u8, u8), TransportError> {
        let fc_timeout = self.config.fc_timeout;
        let no_fc = || TransportError::NoFlowControl {
            timeout_ms: fc_timeout.as_millis() as u64,
        };
        let mut deadline = Instant::now() + fc_timeout;
        let mut waits = 0u8;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(no_fc());
            }
            let frame = match self.bus.recv(deadline - now) {
                Ok(f) => f,
                Err(e) if e.is_timeout() => return Err(no_fc()),
                Err(e) => return Err(e),
            };
            if frame.id() != self.config.rx_id {
                continue;
            }
            match Pci::parse(frame.data()) {
                Ok((
                    Pci::FlowControl {
                        status,
                        block_size,
                        st_min,
                    },
                    _,
                )) => match status {
                    FlowStatus::ContinueToSend => return Ok((block_size, st_min)),
                    FlowStatus::Wait => {
                        waits += 1;
                        if waits > self.config.max_wait_frames {
                            return Err(no_fc());
                        }
                        deadline = Instant::now() + fc_timeout;
                    }
                    FlowStatus::Overflow => return Err(TransportError::Overflow),
                },
                Ok((Pci::Single { .. }, payload)) => {
                    debug!(len = payload.len(), "Device answered before flow control");
                    return Err(TransportError::EarlyResponse(payload.to_vec()));
                }
                Ok((pci, _)) => {
                    debug!(pci = ?pci, "Ignoring frame while waiting for flow control");
                }
                Err(e) => {
                    debug!(error = %e, "Ignoring malformed frame while waiting for flow control");
                }
            }
        }
    }

    /// Receive one complete message from the device.
    ///
    /// An incomplete message is reported as an error, never returned truncated.
    pub fn recv(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut assembler = Reassembler::new();
        let mut deadline = Instant::now() + timeout;
        let mut in_block = 0u8;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(expired(&assembler, timeout));
            }
            let frame = match self.bus.recv(deadline - now) {
                Ok(f) => f,
                Err(e) if e.is_timeout() => return Err(expired(&assembler, timeout)),
                Err(e) => return Err(e),
            };
            if frame.id() != self.config.rx_id {
                trace!(id = frame.id(), "Ignoring frame on foreign identifier");
                continue;
            }
            trace!(frame = ?frame, "RX");

            match assembler.push(frame.data())? {
                Assembly::Complete(message) => return Ok(message),
                Assembly::Started { expected } => {
                    debug!(expected, "First frame received, sending flow control");
                    self.send_flow_control()?;
                    in_block = 0;
                    deadline = Instant::now() + self.config.cf_timeout;
                }
                Assembly::InProgress => {
                    in_block += 1;
                    if self.config.block_size != 0 && in_block == self.config.block_size {
                        self.send_flow_control()?;
                        in_block = 0;
                    }
                    deadline = Instant::now() + self.config.cf_timeout;
                }
                Assembly::Ignored => {}
            }
        }
    }

    fn send_flow_control(&self) -> Result<(), TransportError> {
        let fc = flow_control(
            FlowStatus::ContinueToSend,
            self.config.block_size,
            self.config.st_min,
            self.config.padding,
        );
        self.transmit(self.config.tx_id, &fc)
    }

    /// Discard stray responses pending from the device.
    ///
    /// Stops after one quiet `drain_window` without a frame on `rx_id`.
    /// Foreign traffic is skipped and does not extend the window; the whole
    /// drain is capped in time and in frames. Returns the number of device
    /// frames dropped.
    pub fn drain(&self) -> usize {
        let window = self.config.drain_window;
        let hard_stop = Instant::now() + window * DRAIN_WINDOW_LIMIT;
        let mut quiet_until = Instant::now() + window;
        let mut dropped = 0;

        for _ in 0..DRAIN_FRAME_LIMIT {
            let wait = quiet_until
                .min(hard_stop)
                .saturating_duration_since(Instant::now());
            match self.bus.recv(wait) {
                Ok(frame) if frame.id() == self.config.rx_id => {
                    dropped += 1;
                    quiet_until = Instant::now() + window;
                }
                Ok(_) => {}
                Err(_) => break,
            }
            if !window.is_zero() && Instant::now() >= quiet_until.min(hard_stop) {
                break;
            }
        }
        if dropped > 0 {
            debug!(dropped, "Drained stray frames");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBus;

    fn reassemble(frames: &[[u8; 8]]) -> Vec<u8> {
        let mut r = Reassembler::new();
        for (i, f) in frames.iter().enumerate() {
            match r.push(f).unwrap() {
                Assembly::Complete(msg) => {
                    assert_eq!(i, frames.len() - 1);
                    return msg;
                }
                Assembly::Started { .. } | Assembly::InProgress => {}
                Assembly::Ignored => panic!("frame {} ignored", i),
            }
        }
        panic!("message never completed");
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_segment_roundtrip_lengths() {
        for len in [1usize, 7, 8, 11, 256, 2006, 16384] {
            let payload = pattern(len);
            let frames = segment(&payload, 0xAA).unwrap();
            assert_eq!(reassemble(&frames), payload, "length {}", len);
        }
    }

    #[test]
    fn test_single_frame_layout() {
        let frames = segment(&[0x3E, 0x00], 0x55).unwrap();
        assert_eq!(frames, vec![[0x02, 0x3E, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]]);
    }

    #[test]
    fn test_first_frame_layout() {
        let payload = pattern(11);
        let frames = segment(&payload, 0x00).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..2], &[0x10, 0x0B]);
        assert_eq!(&frames[0][2..], &payload[..6]);
        assert_eq!(frames[1][0], 0x21);
        assert_eq!(&frames[1][1..6], &payload[6..]);
        assert_eq!(&frames[1][6..], &[0x00, 0x00]);
    }

    #[test]
    fn test_escape_first_frame_for_long_messages() {
        let payload = pattern(16384);
        let frames = segment(&payload, 0x00).unwrap();
        assert_eq!(&frames[0][..6], &[0x10, 0x00, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(&frames[0][6..], &payload[..2]);
    }

    #[test]
    fn test_consecutive_index_wraps() {
        let frames = segment(&pattern(6 + 7 * 20), 0x00).unwrap();
        let indices: Vec<u8> = frames[1..].iter().map(|f| f[0] & 0x0F).collect();
        assert_eq!(&indices[..16], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 0]);
        assert_eq!(indices[16], 1);
    }

    #[test]
    fn test_out_of_sequence_is_error() {
        let frames = segment(&pattern(30), 0x00).unwrap();
        let mut r = Reassembler::new();
        r.push(&frames[0]).unwrap();
        r.push(&frames[1]).unwrap();
        let err = r.push(&frames[3]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::SequenceMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert!(r.progress().is_none());
    }

    #[test]
    fn test_stray_consecutive_ignored() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(&[0x21, 1, 2, 3]).unwrap(), Assembly::Ignored);
    }

    #[test]
    fn test_empty_message_rejected() {
        assert!(matches!(segment(&[], 0), Err(TransportError::EmptyMessage)));
    }

    #[test]
    fn test_st_min_decoding() {
        assert_eq!(st_min_duration(0x00), Duration::ZERO);
        assert_eq!(st_min_duration(0x14), Duration::from_millis(20));
        assert_eq!(st_min_duration(0xF3), Duration::from_micros(300));
        assert_eq!(st_min_duration(0x80), Duration::from_millis(127));
    }

    #[test]
    fn test_send_without_flow_control_fails() {
        let bus = MockBus::new();
        let channel = IsoTpChannel::new(bus.clone(), IsoTpConfig::default());
        let err = channel.send(&pattern(20)).unwrap_err();
        assert!(matches!(err, TransportError::NoFlowControl { .. }));
        // Only the first frame went out.
        assert_eq!(bus.sent_frames().len(), 1);
    }

    #[test]
    fn test_single_frame_instead_of_flow_control_is_returned() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x03, 0x7F, 0x34, 0x13]);
        let channel = IsoTpChannel::new(bus.clone(), IsoTpConfig::default());
        match channel.send(&pattern(20)) {
            Err(TransportError::EarlyResponse(payload)) => {
                assert_eq!(payload, vec![0x7F, 0x34, 0x13]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(bus.sent_frames().len(), 1);
    }

    /// Another node transmitting without pause.
    struct ChattyBus;

    impl CanBus for ChattyBus {
        fn send(&self, _frame: &CanFrame) -> Result<(), TransportError> {
            Ok(())
        }

        fn recv(&self, _timeout: Duration) -> Result<CanFrame, TransportError> {
            thread::sleep(Duration::from_millis(1));
            CanFrame::new(0x123, &[0xAA; 8])
        }

        fn name(&self) -> String {
            "chatty".into()
        }
    }

    #[test]
    fn test_drain_ends_despite_foreign_traffic() {
        let config = IsoTpConfig {
            drain_window: Duration::from_millis(20),
            ..IsoTpConfig::default()
        };
        let channel = IsoTpChannel::new(ChattyBus, config);
        let started = Instant::now();
        assert_eq!(channel.drain(), 0);
        assert!(started.elapsed() < Duration::from_millis(500));

        let instant = IsoTpChannel::new(
            ChattyBus,
            IsoTpConfig {
                drain_window: Duration::ZERO,
                ..IsoTpConfig::default()
            },
        );
        assert_eq!(instant.drain(), 0);
    }

    #[test]
    fn test_drain_counts_device_frames_only() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x02, 0x50, 0x03]);
        bus.queue_frame(0x123, &[0x01, 0x02]);
        bus.queue_frame(0x7E8, &[0x02, 0x50, 0x03]);
        let config = IsoTpConfig {
            drain_window: Duration::from_millis(10),
            ..IsoTpConfig::default()
        };
        let channel = IsoTpChannel::new(bus.clone(), config);
        assert_eq!(channel.drain(), 2);
        assert!(bus.recv(Duration::ZERO).is_err());
    }

    #[test]
    fn test_overflow_aborts_send() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &flow_control(FlowStatus::Overflow, 0, 0, 0));
        let channel = IsoTpChannel::new(bus, IsoTpConfig::default());
        assert!(matches!(
            channel.send(&pattern(20)),
            Err(TransportError::Overflow)
        ));
    }

    #[test]
    fn test_recv_filters_foreign_ids_and_answers_first_frame() {
        let bus = MockBus::new();
        let payload = pattern(20);
        let frames = segment(&payload, 0x00).unwrap();
        bus.queue_frame(0x123, &[0x02, 0xDE, 0xAD]);
        bus.queue_frame(0x7E8, &frames[0]);
        bus.queue_frame(0x456, &frames[1]);
        for f in &frames[1..] {
            bus.queue_frame(0x7E8, f);
        }

        let channel = IsoTpChannel::new(bus.clone(), IsoTpConfig::default());
        assert_eq!(channel.recv(Duration::from_millis(100)).unwrap(), payload);

        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x7E0);
        assert_eq!(sent[0].data()[0], 0x30);
    }

    #[test]
    fn test_incomplete_message_is_not_returned() {
        let bus = MockBus::new();
        let frames = segment(&pattern(40), 0x00).unwrap();
        for f in &frames[..3] {
            bus.queue_frame(0x7E8, f);
        }
        let channel = IsoTpChannel::new(bus, IsoTpConfig::default());
        let err = channel.recv(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(
            err,
            TransportError::AssemblyTimeout {
                received: 20,
                expected: 40,
                ..
            }
        ));
    }

    #[test]
    fn test_linked_channels_roundtrip_with_block_size() {
        for len in [1usize, 7, 8, 11, 256, 2006, 16384] {
            let (host_bus, device_bus) = MockBus::pair();
            let host = IsoTpChannel::new(host_bus, IsoTpConfig::default());
            let device = IsoTpChannel::new(
                device_bus,
                IsoTpConfig {
                    tx_id: 0x7E8,
                    rx_id: 0x7E0,
                    block_size: 4,
                    ..IsoTpConfig::default()
                },
            );
            let payload = pattern(len);
            let receiver = std::thread::spawn(move || device.recv(Duration::from_secs(5)));
            host.send(&payload).unwrap();
            assert_eq!(receiver.join().unwrap().unwrap(), payload, "length {}", len);
        }
    }
}
