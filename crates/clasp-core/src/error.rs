//! Error types and wire error codes

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Frame shorter than its header or declared payload length.
    #[error("truncated input: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    /// First byte of a frame is not 0x53.
    #[error("bad magic byte: expected 0x53, got 0x{0:02x}")]
    BadMagic(u8),

    /// Payload exceeds the 16-bit length field.
    #[error("payload length {0} exceeds 65535")]
    LengthOverflow(usize),

    /// Payload starts with a byte that is neither a message-type code
    /// nor a MessagePack map marker.
    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// Tagged value carries an unassigned type code.
    #[error("unknown value type: 0x{0:02x}")]
    UnknownValueType(u8),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

/// Wire error codes carried by ERROR messages.
///
/// Families: 1xx protocol, 2xx address, 3xx permission, 4xx state,
/// 5xx internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    BadFrame = 100,
    BadMessage = 101,
    BadVersion = 102,

    BadAddress = 200,
    AddressNotFound = 201,
    BadPattern = 202,

    TokenRejected = 300,
    ScopeViolation = 301,
    TokenRevoked = 302,

    RevisionMismatch = 400,
    LockConflict = 401,
    ValueRejected = 402,
    UnknownGesture = 403,
    ScheduleOutOfTolerance = 404,

    Internal = 500,
    BackpressureExhausted = 501,
    SupervisorFailure = 502,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// The hundreds digit, for per-family statistics.
    pub fn family(code: u16) -> u16 {
        code / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families() {
        assert_eq!(ErrorCode::family(ErrorCode::BadFrame.as_u16()), 1);
        assert_eq!(ErrorCode::family(ErrorCode::ScopeViolation.as_u16()), 3);
        assert_eq!(ErrorCode::family(ErrorCode::LockConflict.as_u16()), 4);
        assert_eq!(ErrorCode::family(ErrorCode::SupervisorFailure.as_u16()), 5);
    }
}
