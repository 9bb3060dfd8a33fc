use thiserror::Error;

/// How far an error reaches: the whole connection, one stream, or the
/// application above us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    Connection,
    Stream,
    Application,
}

/// HTTP/3 and QPACK application error codes with their wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ErrorCode {
    H3GeneralProtocolError = 0x0101,
    H3InternalError = 0x0102,
    H3StreamCreationError = 0x0103,
    H3ClosedCriticalStream = 0x0104,
    H3FrameUnexpected = 0x0105,
    H3FrameError = 0x0106,
    H3ExcessiveLoad = 0x0107,
    H3IdError = 0x0108,
    H3SettingsError = 0x0109,
    H3MissingSettings = 0x010a,
    H3RequestRejected = 0x010b,
    H3RequestCancelled = 0x010c,
    H3RequestIncomplete = 0x010d,
    H3MessageError = 0x010e,
    H3ConnectError = 0x010f,
    H3VersionFallback = 0x0110,
    QpackDecompressionFailed = 0x0200,
    QpackEncoderStreamError = 0x0201,
    QpackDecoderStreamError = 0x0202,
}

impl ErrorCode {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// An error raised by the HTTP/3 engine, carrying its blast radius and the
/// application error code to put on the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{code:?}: {reason}")]
pub struct Http3Error {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub reason: &'static str,
}

impl Http3Error {
    pub fn connection(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            class: ErrorClass::Connection,
            code,
            reason,
        }
    }

    pub fn stream(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            class: ErrorClass::Stream,
            code,
            reason,
        }
    }

    pub fn application(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            class: ErrorClass::Application,
            code,
            reason,
        }
    }

    pub fn is_connection_fatal(&self) -> bool {
        self.class == ErrorClass::Connection
    }
}
