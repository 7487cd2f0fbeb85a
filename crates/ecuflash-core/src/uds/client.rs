//! Blocking request/response client.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::UdsError;
use super::message::{UdsRequest, UdsResponse, parse_max_block_length, parse_seed};
use super::nrc::Nrc;
use crate::transport::{CanBus, IsoTpChannel, TransportError};

const DEFAULT_P2: Duration = Duration::from_millis(1000);
const DEFAULT_P2_STAR: Duration = Duration::from_millis(5000);
const PENDING_LIMIT: Duration = Duration::from_secs(30);

/// Diagnostic client: one request in flight at a time.
pub struct UdsClient<B: CanBus> {
    channel: IsoTpChannel<B>,
    broadcast_id: u16,
    p2: Duration,
    p2_star: Duration,
}

impl<B: CanBus> UdsClient<B> {
    pub fn new(channel: IsoTpChannel<B>, broadcast_id: u16) -> Self {
        Self {
            channel,
            broadcast_id,
            p2: DEFAULT_P2,
            p2_star: DEFAULT_P2_STAR,
        }
    }

    /// Override the response timeout and the extended timeout used after
    /// a response-pending reply.
    pub fn with_timing(mut self, p2: Duration, p2_star: Duration) -> Self {
        self.p2 = p2;
        self.p2_star = p2_star;
        self
    }

    pub fn channel(&self) -> &IsoTpChannel<B> {
        &self.channel
    }

    /// Send a request and wait for its response.
    pub fn exchange(&self, request: &UdsRequest) -> Result<UdsResponse, UdsError> {
        let bytes = request.encode();
        debug!(
            service = %format!("0x{:02X}", request.service),
            len = bytes.len(),
            "Request"
        );
        let mut early = match self.channel.send(&bytes) {
            Ok(()) => None,
            Err(TransportError::EarlyResponse(raw)) => Some(raw),
            Err(e) => return Err(e.into()),
        };

        let started = Instant::now();
        let mut timeout = self.p2;
        loop {
            let raw = match early.take() {
                Some(raw) => raw,
                None => self.channel.recv(timeout)?,
            };
            let response = match UdsResponse::decode(request.service, &raw) {
                Ok(r) => r,
                Err(UdsError::UnexpectedService { actual, .. }) => {
                    warn!(
                        expected = %format!("0x{:02X}", request.service),
                        actual = %format!("0x{:02X}", actual),
                        "Discarding stale response"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if response.nrc() == Some(Nrc::ResponsePending) {
                if started.elapsed() >= PENDING_LIMIT {
                    return Err(UdsError::PendingTimeout {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                debug!("Response pending, waiting");
                timeout = self.p2_star;
                continue;
            }

            if let Some(nrc) = response.nrc() {
                debug!(
                    service = %format!("0x{:02X}", request.service),
                    nrc = %nrc,
                    "Negative response"
                );
            }
            return Ok(response);
        }
    }

    /// Send a request and return positive data; negative responses become errors.
    pub fn request(&self, request: &UdsRequest) -> Result<Vec<u8>, UdsError> {
        self.exchange(request)?.into_result()
    }

    /// Send a single-frame request on the functional (broadcast) identifier.
    ///
    /// Replies are not awaited; callers drain them.
    pub fn broadcast(&self, request: &UdsRequest) -> Result<(), UdsError> {
        self.channel.send_single(self.broadcast_id, &request.encode())?;
        Ok(())
    }

    /// Discard any pending frames.
    pub fn drain(&self) -> usize {
        self.channel.drain()
    }

    pub fn tester_present(&self) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::tester_present())
    }

    pub fn session_control(&self, session: u8) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::session_control(session))
    }

    pub fn ecu_reset(&self, reset_type: u8) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::ecu_reset(reset_type))
    }

    pub fn clear_diagnostics(&self) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::clear_diagnostics())
    }

    /// SecurityAccess request-seed; returns the seed bytes.
    pub fn request_seed(&self, level: u8) -> Result<Vec<u8>, UdsError> {
        let data = self.request(&UdsRequest::request_seed(level))?;
        Ok(parse_seed(&data)?.to_vec())
    }

    pub fn send_key(&self, level: u8, key: &[u8]) -> Result<(), UdsError> {
        self.request(&UdsRequest::send_key(level, key)).map(|_| ())
    }

    /// RequestUpload of one block; returns the block bytes.
    pub fn request_upload(&self, address: u32, format: u8) -> Result<Vec<u8>, UdsError> {
        self.request(&UdsRequest::request_upload(address, format))
    }

    /// RequestDownload; returns the device's maximum block length
    /// (service id and counter included).
    pub fn request_download(&self, address: u32, length: u32) -> Result<usize, UdsError> {
        let data = self.request(&UdsRequest::request_download(address, length))?;
        parse_max_block_length(&data)
    }

    pub fn transfer_data(&self, counter: u8, payload: &[u8]) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::transfer_data(counter, payload))
    }

    pub fn transfer_exit(&self) -> Result<UdsResponse, UdsError> {
        self.exchange(&UdsRequest::transfer_exit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{IsoTpConfig, MockBus};

    fn client(bus: &MockBus) -> UdsClient<MockBus> {
        UdsClient::new(IsoTpChannel::new(bus.clone(), IsoTpConfig::default()), 0x7DF)
    }

    #[test]
    fn test_response_pending_is_waited_out() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x03, 0x7F, 0x11, 0x78]);
        bus.queue_frame(0x7E8, &[0x02, 0x51, 0x01]);
        let resp = client(&bus).ecu_reset(0x01).unwrap();
        assert!(resp.is_positive());
    }

    #[test]
    fn test_stale_response_discarded() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x02, 0x7E, 0x00]);
        bus.queue_frame(0x7E8, &[0x01, 0x54]);
        let resp = client(&bus).clear_diagnostics().unwrap();
        assert_eq!(
            resp,
            UdsResponse::Positive {
                service: 0x14,
                data: vec![]
            }
        );
    }

    #[test]
    fn test_negative_response_returned_as_value() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x03, 0x7F, 0x37, 0x24]);
        let resp = client(&bus).transfer_exit().unwrap();
        assert_eq!(resp.nrc(), Some(Nrc::RequestSequenceError));
    }

    #[test]
    fn test_no_response_is_transport_timeout() {
        let bus = MockBus::new();
        let err = client(&bus).tester_present().unwrap_err();
        assert!(matches!(err, UdsError::Transport(ref t) if t.is_timeout()));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_broadcast_uses_functional_id() {
        let bus = MockBus::new();
        client(&bus)
            .broadcast(&UdsRequest::session_control(0x03))
            .unwrap();
        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x7DF);
        assert_eq!(&sent[0].data()[..3], &[0x02, 0x10, 0x03]);
    }

    #[test]
    fn test_request_seed_strips_level() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x04, 0x67, 0x01, 0x12, 0x34]);
        assert_eq!(client(&bus).request_seed(0x01).unwrap(), vec![0x12, 0x34]);
    }

    #[test]
    fn test_send_key_rejected() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x03, 0x7F, 0x27, 0x35]);
        let err = client(&bus).send_key(0x01, &[0x88, 0xDC]).unwrap_err();
        assert_eq!(err.nrc(), Some(Nrc::InvalidKey));
        assert_eq!(&bus.sent_frames()[0].data()[..5], &[0x04, 0x27, 0x02, 0x88, 0xDC]);
    }

    #[test]
    fn test_rejection_before_flow_control_keeps_nrc() {
        let bus = MockBus::new();
        bus.queue_frame(0x7E8, &[0x03, 0x7F, 0x34, 0x13]);
        let started = Instant::now();
        let err = client(&bus).request_download(0x1000, 0x200).unwrap_err();
        assert!(matches!(
            err,
            UdsError::NegativeResponse {
                nrc: Nrc::IncorrectMessageLength,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_request_download_parses_block_length() {
        let bus = MockBus::new();
        // The 11-byte request is segmented, so flow control comes first.
        bus.queue_frame(0x7E8, &[0x30, 0x00, 0x00]);
        bus.queue_frame(0x7E8, &[0x04, 0x74, 0x20, 0x01, 0x02]);
        assert_eq!(client(&bus).request_download(0x1000, 0x200).unwrap(), 0x102);
    }
}
