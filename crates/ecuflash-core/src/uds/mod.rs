//! Diagnostic service layer.
//!
//! Request builders, response decoding with the positive/negative
//! convention, the NRC table and a blocking client on top of the
//! segmented transport.

mod client;
mod error;
mod message;
mod nrc;

pub use client::UdsClient;
pub use error::UdsError;
pub use message::{UdsRequest, UdsResponse, parse_max_block_length, parse_seed};
pub use nrc::Nrc;

/// Offset added to a request service id in its positive response.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Service identifiers.
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const REQUEST_UPLOAD: u8 = 0x35;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// DiagnosticSessionControl (0x10) sessions.
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions.
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    pub const SOFT_RESET: u8 = 0x03;
}

/// addressAndLengthFormatIdentifier for 4-byte address / 4-byte length.
pub const ADDRESS_AND_LENGTH_FORMAT: u8 = 0x44;

/// Group of all DTCs for ClearDiagnosticInformation.
pub const ALL_DTC_GROUPS: u32 = 0xFF_FFFF;
