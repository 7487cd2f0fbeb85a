//! In-memory ECU speaking segmentation and the diagnostic services.
//!
//! Requests are answered synchronously inside `send`, so `recv` never has
//! to wait. Fault knobs let tests drive every failure path of the engine
//! without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use super::frame::CanFrame;
use super::isotp::{Assembly, FlowStatus, Pci, Reassembler, flow_control, segment};
use super::traits::{CanBus, TransportError};
use crate::auth::derive_key;
use crate::memory::BlockCounter;
use crate::profile::DeviceProfile;
use crate::uds::{Nrc, POSITIVE_RESPONSE_OFFSET, service_id, session_type};

/// Upload block size returned by the simulated device.
pub const SIM_UPLOAD_BLOCK: usize = 256;

/// Length of the credential the simulated device accepts.
pub const SIM_CREDENTIAL_LEN: usize = 2006;

/// Advertised maxNumberOfBlockLength: 256 data bytes plus service id and counter.
const MAX_BLOCK_LENGTH: u16 = 0x0102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadTarget {
    Credential,
    Staging,
}

#[derive(Debug)]
struct Download {
    target: DownloadTarget,
    /// Offset into device memory (staging) or into the credential buffer.
    offset: usize,
    length: usize,
    received: usize,
    blocks: u32,
    counter: BlockCounter,
    last_counter: Option<u8>,
    buf: Vec<u8>,
}

struct SimState {
    profile: DeviceProfile,
    memory: Vec<u8>,
    credential: Vec<u8>,

    session: u8,
    seed: u16,
    pending_seed: Option<u16>,
    key_granted: bool,
    unlocked: bool,
    uploads_since_unlock: u32,
    download: Option<Download>,

    reassembler: Reassembler,
    outbox: VecDeque<CanFrame>,
    held: VecDeque<[u8; 8]>,

    requests: Vec<Vec<u8>>,
    transfer_lengths: Vec<usize>,

    drop_keepalives: u32,
    key_nrc: Option<Nrc>,
    privilege_budget: Option<u32>,
    failing_blocks: HashMap<u32, (Nrc, bool)>,
    corrupt_offset: Option<usize>,
    connected: bool,
}

impl SimState {
    fn queue(&mut self, data: &[u8; 8]) {
        match CanFrame::new(self.profile.bus.response_id, data) {
            Ok(frame) => {
                trace!(frame = ?frame, "SIM TX");
                self.outbox.push_back(frame);
            }
            Err(e) => debug!(error = %e, "SIM dropped invalid frame"),
        }
    }

    fn respond(&mut self, payload: &[u8]) {
        let frames = match segment(payload, self.profile.bus.padding) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "SIM cannot segment response");
                return;
            }
        };
        let mut frames = frames.into_iter();
        if let Some(first) = frames.next() {
            self.queue(&first);
        }
        // Consecutive frames wait for the host's flow control.
        self.held = frames.collect();
    }

    fn release(&mut self, block_size: u8) {
        let count = if block_size == 0 {
            self.held.len()
        } else {
            (block_size as usize).min(self.held.len())
        };
        for _ in 0..count {
            if let Some(frame) = self.held.pop_front() {
                self.queue(&frame);
            }
        }
    }

    fn on_frame(&mut self, data: &[u8]) {
        if let Ok((
            Pci::FlowControl {
                status: FlowStatus::ContinueToSend,
                block_size,
                ..
            },
            _,
        )) = Pci::parse(data)
        {
            self.release(block_size);
            return;
        }

        match self.reassembler.push(data) {
            Ok(Assembly::Complete(request)) => self.on_request(request),
            Ok(Assembly::Started { .. }) => {
                let fc = flow_control(FlowStatus::ContinueToSend, 0, 0, self.profile.bus.padding);
                self.queue(&fc);
            }
            Ok(Assembly::InProgress | Assembly::Ignored) => {}
            Err(e) => debug!(error = %e, "SIM discarded frame"),
        }
    }

    fn on_request(&mut self, request: Vec<u8>) {
        let Some(&sid) = request.first() else {
            return;
        };
        self.requests.push(request.clone());
        let body = &request[1..];
        let reply = match sid {
            service_id::TESTER_PRESENT => {
                if self.drop_keepalives > 0 {
                    self.drop_keepalives -= 1;
                    return;
                }
                Ok(vec![0x00])
            }
            service_id::DIAGNOSTIC_SESSION_CONTROL => self.session_control(body),
            service_id::ECU_RESET => self.reset(body),
            service_id::CLEAR_DIAGNOSTIC_INFO => Ok(Vec::new()),
            service_id::SECURITY_ACCESS => self.security_access(body),
            service_id::REQUEST_DOWNLOAD => self.request_download(body),
            service_id::TRANSFER_DATA => self.transfer_data(body),
            service_id::REQUEST_TRANSFER_EXIT => self.transfer_exit(),
            service_id::REQUEST_UPLOAD => self.request_upload(body),
            _ => Err(Nrc::ServiceNotSupported),
        };
        match reply {
            Ok(data) => {
                let mut payload = Vec::with_capacity(1 + data.len());
                payload.push(sid.wrapping_add(POSITIVE_RESPONSE_OFFSET));
                payload.extend_from_slice(&data);
                self.respond(&payload);
            }
            Err(nrc) => {
                trace!(sid = %format!("0x{:02X}", sid), nrc = %nrc, "SIM negative response");
                self.respond(&[service_id::NEGATIVE_RESPONSE, sid, nrc.code()]);
            }
        }
    }

    fn lock_out(&mut self) {
        self.key_granted = false;
        self.unlocked = false;
        self.pending_seed = None;
        self.uploads_since_unlock = 0;
    }

    fn session_control(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        let &[session] = body else {
            return Err(Nrc::IncorrectMessageLength);
        };
        if !(session_type::DEFAULT..=session_type::EXTENDED).contains(&session) {
            return Err(Nrc::SubFunctionNotSupported);
        }
        self.session = session;
        Ok(vec![session])
    }

    fn reset(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        let &[reset_type] = body else {
            return Err(Nrc::IncorrectMessageLength);
        };
        self.lock_out();
        self.download = None;
        self.session = session_type::DEFAULT;
        Ok(vec![reset_type])
    }

    fn security_access(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        let Some(&sub) = body.first() else {
            return Err(Nrc::IncorrectMessageLength);
        };
        if self.session != self.profile.security.session {
            return Err(Nrc::ServiceNotSupportedInActiveSession);
        }
        let level = self.profile.security.level;
        if sub == level {
            let seed = if self.key_granted { 0 } else { self.seed };
            if seed == 0 {
                self.key_granted = true;
            } else {
                self.pending_seed = Some(seed);
            }
            let mut reply = vec![level, 0, 0];
            BigEndian::write_u16(&mut reply[1..], seed);
            return Ok(reply);
        }
        if sub == level.wrapping_add(1) {
            let Some(seed) = self.pending_seed.take() else {
                return Err(Nrc::RequestSequenceError);
            };
            if let Some(nrc) = self.key_nrc {
                return Err(nrc);
            }
            if body.len() != 3 {
                return Err(Nrc::IncorrectMessageLength);
            }
            if BigEndian::read_u16(&body[1..]) != derive_key(seed, self.profile.security.key_xor) {
                return Err(Nrc::InvalidKey);
            }
            self.key_granted = true;
            return Ok(vec![sub]);
        }
        Err(Nrc::SubFunctionNotSupported)
    }

    fn request_download(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        if body.len() != 10 || body[1] != 0x44 {
            return Err(Nrc::IncorrectMessageLength);
        }
        let address = BigEndian::read_u32(&body[2..6]);
        let length = BigEndian::read_u32(&body[6..10]) as usize;
        let layout = &self.profile.memory;

        let download = if address == self.profile.security.credential_address {
            if !self.key_granted {
                return Err(Nrc::SecurityAccessDenied);
            }
            if length != self.credential.len() {
                return Err(Nrc::RequestOutOfRange);
            }
            Download {
                target: DownloadTarget::Credential,
                offset: 0,
                length,
                received: 0,
                blocks: 0,
                counter: BlockCounter::new(),
                last_counter: None,
                buf: Vec::with_capacity(length),
            }
        } else {
            if !self.unlocked {
                return Err(Nrc::SecurityAccessDenied);
            }
            let start = address.wrapping_sub(layout.staging_address) as usize;
            if address < layout.staging_address
                || length == 0
                || start + length > layout.staging_size as usize
            {
                return Err(Nrc::RequestOutOfRange);
            }
            Download {
                target: DownloadTarget::Staging,
                offset: layout.staging_offset as usize + start,
                length,
                received: 0,
                blocks: 0,
                counter: BlockCounter::new(),
                last_counter: None,
                buf: Vec::new(),
            }
        };
        debug!(target = ?download.target, length, "SIM download opened");
        self.download = Some(download);

        let mut reply = vec![0x20, 0, 0];
        BigEndian::write_u16(&mut reply[1..], MAX_BLOCK_LENGTH);
        Ok(reply)
    }

    fn transfer_data(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        let Some((&counter, payload)) = body.split_first() else {
            return Err(Nrc::IncorrectMessageLength);
        };
        let Some(download) = self.download.as_mut() else {
            return Err(Nrc::RequestSequenceError);
        };

        if download.last_counter == Some(counter) {
            trace!(counter, "SIM repeated block acknowledged");
            return Ok(vec![counter]);
        }
        let expected = download.counter.current();
        if counter != expected {
            return Err(Nrc::WrongBlockSequenceCounter);
        }
        if download.received >= download.length {
            return Err(Nrc::RequestSequenceError);
        }

        let block = download.blocks + 1;
        if download.target == DownloadTarget::Staging {
            self.transfer_lengths.push(payload.len());
            if let Some(&(nrc, once)) = self.failing_blocks.get(&block) {
                if once {
                    self.failing_blocks.remove(&block);
                }
                return Err(nrc);
            }
        }

        let take = payload.len().min(download.length - download.received);
        download.blocks = block;
        download.last_counter = Some(download.counter.next());
        match download.target {
            DownloadTarget::Credential => {
                download.buf.extend_from_slice(&payload[..take]);
                download.received += take;
                if download.received == download.length {
                    let accepted = download.buf == self.credential;
                    self.download = None;
                    if !accepted {
                        return Err(Nrc::SecurityAccessDenied);
                    }
                    debug!("SIM credential accepted, privileged mode");
                    self.unlocked = true;
                    self.uploads_since_unlock = 0;
                }
            }
            DownloadTarget::Staging => {
                let at = download.offset + download.received;
                self.memory[at..at + take].copy_from_slice(&payload[..take]);
                if let Some(corrupt) = self.corrupt_offset {
                    let target = corrupt + self.profile.memory.staging_offset as usize;
                    if (at..at + take).contains(&target) {
                        self.memory[target] ^= 0xFF;
                    }
                }
                download.received += take;
            }
        }
        Ok(vec![counter])
    }

    fn transfer_exit(&mut self) -> Result<Vec<u8>, Nrc> {
        match self.download.take() {
            Some(_) => Ok(Vec::new()),
            None => Err(Nrc::RequestSequenceError),
        }
    }

    fn request_upload(&mut self, body: &[u8]) -> Result<Vec<u8>, Nrc> {
        if body.len() != 5 || body[0] != self.profile.memory.upload_format {
            return Err(Nrc::IncorrectMessageLength);
        }
        if !self.unlocked {
            return Err(Nrc::SecurityAccessDenied);
        }
        if let Some(budget) = self.privilege_budget {
            if self.uploads_since_unlock >= budget {
                debug!("SIM privileged session expired");
                self.lock_out();
                return Err(Nrc::SecurityAccessDenied);
            }
        }
        let address = BigEndian::read_u32(&body[1..5]);
        let base = self.profile.memory.read_address;
        if address < base || (address - base) as usize >= self.memory.len() {
            return Err(Nrc::RequestOutOfRange);
        }
        let start = (address - base) as usize;
        let end = (start + SIM_UPLOAD_BLOCK).min(self.memory.len());
        self.uploads_since_unlock += 1;
        Ok(self.memory[start..end].to_vec())
    }
}

/// Simulated ECU on an in-memory bus.
///
/// Clones share the same device.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// A device laid out per `profile`, with deterministic memory contents.
    pub fn new(profile: &DeviceProfile) -> Self {
        let memory = (0..profile.memory.read_size as usize)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(i as u32 >> 8) as u8)
            .collect();
        let credential = (0..SIM_CREDENTIAL_LEN)
            .map(|i| (i as u8).wrapping_mul(13) ^ 0x5A)
            .collect();
        let state = SimState {
            profile: profile.clone(),
            memory,
            credential,
            session: session_type::DEFAULT,
            seed: 0x1234,
            pending_seed: None,
            key_granted: false,
            unlocked: false,
            uploads_since_unlock: 0,
            download: None,
            reassembler: Reassembler::new(),
            outbox: VecDeque::new(),
            held: VecDeque::new(),
            requests: Vec::new(),
            transfer_lengths: Vec::new(),
            drop_keepalives: 0,
            key_nrc: None,
            privilege_budget: None,
            failing_blocks: HashMap::new(),
            corrupt_offset: None,
            connected: true,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock leaves plain data behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The credential this device accepts.
    pub fn credential(&self) -> Vec<u8> {
        self.lock().credential.clone()
    }

    pub fn set_seed(&self, seed: u16) {
        self.lock().seed = seed;
    }

    /// Answer every send-key with `nrc`.
    pub fn reject_key(&self, nrc: Option<Nrc>) {
        self.lock().key_nrc = nrc;
    }

    /// Leave the next `count` keep-alives unanswered.
    pub fn drop_keepalives(&self, count: u32) {
        self.lock().drop_keepalives = count;
    }

    /// Lose privileged mode after `uploads` uploads per unlock.
    pub fn expire_privileges_after(&self, uploads: u32) {
        self.lock().privilege_budget = Some(uploads);
    }

    /// Reject staging block `block` (1-based) every time.
    pub fn fail_write_block(&self, block: u32, nrc: Nrc) {
        self.lock().failing_blocks.insert(block, (nrc, false));
    }

    /// Reject staging block `block` (1-based) once.
    pub fn fail_write_block_once(&self, block: u32, nrc: Nrc) {
        self.lock().failing_blocks.insert(block, (nrc, true));
    }

    /// Flip the byte at `offset` of the staging region as it is written.
    pub fn corrupt_write_at(&self, offset: usize) {
        self.lock().corrupt_offset = Some(offset);
    }

    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock().unlocked
    }

    /// Every complete request received, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.lock().requests.clone()
    }

    /// Whether any request for `sid` was received.
    pub fn received(&self, sid: u8) -> bool {
        self.lock().requests.iter().any(|r| r.first() == Some(&sid))
    }

    /// Payload sizes of staging transfer-data requests.
    pub fn transfer_lengths(&self) -> Vec<usize> {
        self.lock().transfer_lengths.clone()
    }

    /// Whole readable region.
    pub fn read_region(&self) -> Vec<u8> {
        self.lock().memory.clone()
    }

    /// Staging region as stored in device memory.
    pub fn staging(&self) -> Vec<u8> {
        let state = self.lock();
        let start = state.profile.memory.staging_offset as usize;
        let end = start + state.profile.memory.staging_size as usize;
        state.memory[start..end].to_vec()
    }
}

impl CanBus for SimulatedBus {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        let bus = &state.profile.bus;
        if frame.id() == bus.request_id || frame.id() == bus.broadcast_id {
            trace!(frame = ?frame, "SIM RX");
            state.on_frame(frame.data());
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<CanFrame, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state
            .outbox
            .pop_front()
            .ok_or_else(|| TransportError::timeout(timeout))
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn name(&self) -> String {
        "simulated".to_string()
    }
}
