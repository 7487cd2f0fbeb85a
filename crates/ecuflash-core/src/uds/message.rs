//! Request encoding and response decoding.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use super::error::UdsError;
use super::nrc::Nrc;
use super::{ADDRESS_AND_LENGTH_FORMAT, ALL_DTC_GROUPS, POSITIVE_RESPONSE_OFFSET, service_id};

/// A diagnostic service request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    pub service: u8,
    pub sub_function: Option<u8>,
    pub data: Vec<u8>,
}

impl UdsRequest {
    pub fn new(service: u8) -> Self {
        Self {
            service,
            sub_function: None,
            data: Vec::new(),
        }
    }

    pub fn with_sub_function(mut self, sub_function: u8) -> Self {
        self.sub_function = Some(sub_function);
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Wire bytes: service id, optional sub-function, data.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.data.len());
        buf.push(self.service);
        buf.extend(self.sub_function);
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn tester_present() -> Self {
        Self::new(service_id::TESTER_PRESENT).with_sub_function(0x00)
    }

    pub fn session_control(session: u8) -> Self {
        Self::new(service_id::DIAGNOSTIC_SESSION_CONTROL).with_sub_function(session)
    }

    pub fn ecu_reset(reset_type: u8) -> Self {
        Self::new(service_id::ECU_RESET).with_sub_function(reset_type)
    }

    pub fn clear_diagnostics() -> Self {
        Self::new(service_id::CLEAR_DIAGNOSTIC_INFO).with_data(&ALL_DTC_GROUPS.to_be_bytes()[1..])
    }

    /// SecurityAccess request-seed; `level` is the odd sub-function.
    pub fn request_seed(level: u8) -> Self {
        Self::new(service_id::SECURITY_ACCESS).with_sub_function(level)
    }

    /// SecurityAccess send-key; uses the sub-function following `level`.
    pub fn send_key(level: u8, key: &[u8]) -> Self {
        Self::new(service_id::SECURITY_ACCESS)
            .with_sub_function(level.wrapping_add(1))
            .with_data(key)
    }

    /// RequestDownload with uncompressed data and 4-byte address/length.
    pub fn request_download(address: u32, length: u32) -> Self {
        let mut data = Vec::with_capacity(10);
        data.push(0x00);
        data.push(ADDRESS_AND_LENGTH_FORMAT);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&length.to_be_bytes());
        Self::new(service_id::REQUEST_DOWNLOAD).with_data(data)
    }

    /// RequestUpload of the block at `address`; `format` selects the block shape.
    pub fn request_upload(address: u32, format: u8) -> Self {
        let mut data = Vec::with_capacity(5);
        data.push(format);
        data.extend_from_slice(&address.to_be_bytes());
        Self::new(service_id::REQUEST_UPLOAD).with_data(data)
    }

    pub fn transfer_data(counter: u8, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(counter);
        data.extend_from_slice(payload);
        Self::new(service_id::TRANSFER_DATA).with_data(data)
    }

    pub fn transfer_exit() -> Self {
        Self::new(service_id::REQUEST_TRANSFER_EXIT)
    }
}

/// A decoded response: either positive data or the NRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// Positive response; `data` excludes the response service id.
    Positive { service: u8, data: Vec<u8> },
    /// Negative response for `service`.
    Negative { service: u8, nrc: Nrc },
}

impl UdsResponse {
    /// Decode the response to a request for `request_service`.
    ///
    /// Negative responses are values, not errors. Only truncated frames or
    /// a reply to a different service fail.
    pub fn decode(request_service: u8, bytes: &[u8]) -> Result<Self, UdsError> {
        let Some(&sid) = bytes.first() else {
            return Err(UdsError::Malformed("empty response".into()));
        };

        if sid == service_id::NEGATIVE_RESPONSE {
            if bytes.len() < 3 {
                return Err(UdsError::Malformed(format!(
                    "negative response with {} bytes",
                    bytes.len()
                )));
            }
            if bytes[1] != request_service {
                return Err(UdsError::UnexpectedService {
                    request: request_service,
                    actual: bytes[1],
                });
            }
            return Ok(UdsResponse::Negative {
                service: request_service,
                nrc: Nrc::from(bytes[2]),
            });
        }

        if sid != request_service.wrapping_add(POSITIVE_RESPONSE_OFFSET) {
            return Err(UdsError::UnexpectedService {
                request: request_service,
                actual: sid,
            });
        }

        Ok(UdsResponse::Positive {
            service: request_service,
            data: bytes[1..].to_vec(),
        })
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, UdsResponse::Positive { .. })
    }

    pub fn nrc(&self) -> Option<Nrc> {
        match self {
            UdsResponse::Negative { nrc, .. } => Some(*nrc),
            UdsResponse::Positive { .. } => None,
        }
    }

    /// Positive data, or the negative response as an error.
    pub fn into_result(self) -> Result<Vec<u8>, UdsError> {
        match self {
            UdsResponse::Positive { data, .. } => Ok(data),
            UdsResponse::Negative { service, nrc } => {
                Err(UdsError::NegativeResponse { service, nrc })
            }
        }
    }
}

/// Extract the seed from SecurityAccess positive data (`[level, seed...]`).
pub fn parse_seed(data: &[u8]) -> Result<&[u8], UdsError> {
    if data.len() < 2 {
        return Err(UdsError::Malformed(format!(
            "seed response with {} bytes",
            data.len()
        )));
    }
    Ok(&data[1..])
}

/// Extract maxNumberOfBlockLength from RequestDownload positive data.
pub fn parse_max_block_length(data: &[u8]) -> Result<usize, UdsError> {
    let Some(&lfi) = data.first() else {
        return Err(UdsError::Malformed("empty download response".into()));
    };
    let width = (lfi >> 4) as usize;
    if width == 0 || width > 8 || data.len() < 1 + width {
        return Err(UdsError::Malformed(format!(
            "download response length format 0x{:02X} with {} bytes",
            lfi,
            data.len()
        )));
    }
    let mut cursor = Cursor::new(&data[1..1 + width]);
    let value = cursor
        .read_uint::<BigEndian>(width)
        .map_err(|e| UdsError::Malformed(e.to_string()))?;
    Ok(value as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        assert_eq!(UdsRequest::tester_present().encode(), vec![0x3E, 0x00]);
        assert_eq!(UdsRequest::session_control(0x03).encode(), vec![0x10, 0x03]);
        assert_eq!(UdsRequest::request_seed(0x01).encode(), vec![0x27, 0x01]);
        assert_eq!(
            UdsRequest::send_key(0x01, &[0x88, 0xDC]).encode(),
            vec![0x27, 0x02, 0x88, 0xDC]
        );
        assert_eq!(
            UdsRequest::clear_diagnostics().encode(),
            vec![0x14, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(UdsRequest::transfer_exit().encode(), vec![0x37]);
    }

    #[test]
    fn test_request_download_layout() {
        let bytes = UdsRequest::request_download(0x0001_2000, 0x4000).encode();
        assert_eq!(
            bytes,
            vec![0x34, 0x00, 0x44, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00, 0x40, 0x00]
        );
    }

    #[test]
    fn test_request_upload_layout() {
        let bytes = UdsRequest::request_upload(0x0080_0100, 0x20).encode();
        assert_eq!(bytes, vec![0x35, 0x20, 0x00, 0x80, 0x01, 0x00]);
    }

    #[test]
    fn test_transfer_data_layout() {
        let bytes = UdsRequest::transfer_data(0x05, &[1, 2, 3]).encode();
        assert_eq!(bytes, vec![0x36, 0x05, 1, 2, 3]);
    }

    #[test]
    fn test_decode_positive() {
        let resp = UdsResponse::decode(0x27, &[0x67, 0x01, 0x12, 0x34]).unwrap();
        assert_eq!(
            resp,
            UdsResponse::Positive {
                service: 0x27,
                data: vec![0x01, 0x12, 0x34]
            }
        );
    }

    #[test]
    fn test_decode_negative_is_a_value() {
        let resp = UdsResponse::decode(0x27, &[0x7F, 0x27, 0x33]).unwrap();
        assert_eq!(resp.nrc(), Some(Nrc::SecurityAccessDenied));
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.nrc(), Some(Nrc::SecurityAccessDenied));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            UdsResponse::decode(0x27, &[]),
            Err(UdsError::Malformed(_))
        ));
        assert!(matches!(
            UdsResponse::decode(0x27, &[0x7F, 0x27]),
            Err(UdsError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_wrong_service() {
        assert!(matches!(
            UdsResponse::decode(0x34, &[0x76, 0x01]),
            Err(UdsError::UnexpectedService {
                request: 0x34,
                actual: 0x76
            })
        ));
        assert!(matches!(
            UdsResponse::decode(0x34, &[0x7F, 0x36, 0x73]),
            Err(UdsError::UnexpectedService { .. })
        ));
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_seed(&[0x01, 0x12, 0x34]).unwrap(), &[0x12, 0x34]);
        assert!(parse_seed(&[0x01]).is_err());
        assert_eq!(parse_max_block_length(&[0x20, 0x01, 0x02]).unwrap(), 0x102);
        assert_eq!(parse_max_block_length(&[0x10, 0x82]).unwrap(), 0x82);
        assert!(parse_max_block_length(&[0x20, 0x01]).is_err());
    }
}
