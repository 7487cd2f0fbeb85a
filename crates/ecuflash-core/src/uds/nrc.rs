//! Negative response codes and their human-readable causes.

use std::fmt;

/// Negative response code returned in a `7F <sid> <nrc>` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLength,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    VoltageTooHigh,
    VoltageTooLow,
    Other(u8),
}

/// Code table: value, variant, cause shown to the operator.
const NRC_TABLE: &[(u8, Nrc, &str)] = &[
    (0x10, Nrc::GeneralReject, "general reject"),
    (0x11, Nrc::ServiceNotSupported, "service not supported"),
    (0x12, Nrc::SubFunctionNotSupported, "sub-function not supported"),
    (0x13, Nrc::IncorrectMessageLength, "incorrect message length or invalid format"),
    (0x14, Nrc::ResponseTooLong, "response too long"),
    (0x21, Nrc::BusyRepeatRequest, "busy, repeat request"),
    (0x22, Nrc::ConditionsNotCorrect, "conditions not correct"),
    (0x24, Nrc::RequestSequenceError, "request sequence error"),
    (0x31, Nrc::RequestOutOfRange, "request out of range"),
    (0x33, Nrc::SecurityAccessDenied, "security access denied"),
    (0x35, Nrc::InvalidKey, "invalid key"),
    (0x36, Nrc::ExceededNumberOfAttempts, "exceeded number of attempts"),
    (0x37, Nrc::RequiredTimeDelayNotExpired, "required time delay not expired"),
    (0x70, Nrc::UploadDownloadNotAccepted, "upload/download not accepted"),
    (0x71, Nrc::TransferDataSuspended, "transfer data suspended"),
    (0x72, Nrc::GeneralProgrammingFailure, "general programming failure"),
    (0x73, Nrc::WrongBlockSequenceCounter, "wrong block sequence counter"),
    (0x78, Nrc::ResponsePending, "request received, response pending"),
    (
        0x7E,
        Nrc::SubFunctionNotSupportedInActiveSession,
        "sub-function not supported in active session",
    ),
    (
        0x7F,
        Nrc::ServiceNotSupportedInActiveSession,
        "service not supported in active session",
    ),
    (0x92, Nrc::VoltageTooHigh, "voltage too high"),
    (0x93, Nrc::VoltageTooLow, "voltage too low"),
];

impl Nrc {
    pub fn code(self) -> u8 {
        match self {
            Nrc::Other(code) => code,
            known => NRC_TABLE
                .iter()
                .find(|(_, nrc, _)| *nrc == known)
                .map(|(code, _, _)| *code)
                .unwrap_or_default(),
        }
    }

    /// Cause text for logs and reports.
    pub fn description(self) -> &'static str {
        NRC_TABLE
            .iter()
            .find(|(_, nrc, _)| *nrc == self)
            .map(|(_, _, text)| *text)
            .unwrap_or("unknown negative response")
    }

    /// Whether repeating the same request later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Nrc::BusyRepeatRequest | Nrc::ResponsePending | Nrc::ConditionsNotCorrect
        )
    }

    /// Whether the device has locked out further security attempts.
    pub fn is_lockout(self) -> bool {
        matches!(
            self,
            Nrc::ExceededNumberOfAttempts | Nrc::RequiredTimeDelayNotExpired
        )
    }
}

impl From<u8> for Nrc {
    fn from(code: u8) -> Self {
        NRC_TABLE
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, nrc, _)| *nrc)
            .unwrap_or(Nrc::Other(code))
    }
}

impl From<Nrc> for u8 {
    fn from(nrc: Nrc) -> Self {
        nrc.code()
    }
}

impl fmt::Display for Nrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_roundtrip() {
        for (code, nrc, _) in NRC_TABLE {
            assert_eq!(Nrc::from(*code), *nrc);
            assert_eq!(nrc.code(), *code);
        }
    }

    #[test]
    fn test_unknown_code_preserved() {
        let nrc = Nrc::from(0xF0);
        assert_eq!(nrc, Nrc::Other(0xF0));
        assert_eq!(u8::from(nrc), 0xF0);
        assert_eq!(nrc.description(), "unknown negative response");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Nrc::SecurityAccessDenied.to_string(),
            "security access denied (0x33)"
        );
        assert_eq!(
            Nrc::from(0x73).to_string(),
            "wrong block sequence counter (0x73)"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Nrc::BusyRepeatRequest.is_transient());
        assert!(!Nrc::SecurityAccessDenied.is_transient());
        assert!(Nrc::ExceededNumberOfAttempts.is_lockout());
        assert!(!Nrc::InvalidKey.is_lockout());
    }
}
