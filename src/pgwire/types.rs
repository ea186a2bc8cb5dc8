//! Message type tags and protocol constants for the Postgres frontend/
//! backend protocol, version 3.

/// Protocol version sent in the startup message.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Authentication code meaning "no authentication required" (trust).
pub const AUTH_OK: i32 = 0;

/// Tags of messages sent by the backend (server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    Authentication,
    BackendKeyData,
    ParameterStatus,
    NoticeResponse,
    ErrorResponse,
    ReadyForQuery,
    CommandComplete,
    RowDescription,
    DataRow,
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription,
    PortalSuspended,
    CopyInResponse,
    CopyOutResponse,
    CopyBothResponse,
    CopyData,
    CopyDone,
    Unknown(u8),
}

impl From<u8> for BackendTag {
    fn from(b: u8) -> BackendTag {
        match b {
            b'R' => BackendTag::Authentication,
            b'K' => BackendTag::BackendKeyData,
            b'S' => BackendTag::ParameterStatus,
            b'N' => BackendTag::NoticeResponse,
            b'E' => BackendTag::ErrorResponse,
            b'Z' => BackendTag::ReadyForQuery,
            b'C' => BackendTag::CommandComplete,
            b'T' => BackendTag::RowDescription,
            b'D' => BackendTag::DataRow,
            b'I' => BackendTag::EmptyQueryResponse,
            b'1' => BackendTag::ParseComplete,
            b'2' => BackendTag::BindComplete,
            b'3' => BackendTag::CloseComplete,
            b'n' => BackendTag::NoData,
            b't' => BackendTag::ParameterDescription,
            b's' => BackendTag::PortalSuspended,
            b'G' => BackendTag::CopyInResponse,
            b'H' => BackendTag::CopyOutResponse,
            b'W' => BackendTag::CopyBothResponse,
            b'd' => BackendTag::CopyData,
            b'c' => BackendTag::CopyDone,
            other => BackendTag::Unknown(other),
        }
    }
}

/// Tags of messages sent by the frontend (us).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendTag {
    Query,
    Parse,
    Bind,
    Describe,
    Execute,
    Sync,
    Flush,
    Close,
    Terminate,
    CopyData,
    CopyDone,
    Password,
}

impl FrontendTag {
    pub fn byte(self) -> u8 {
        match self {
            FrontendTag::Query => b'Q',
            FrontendTag::Parse => b'P',
            FrontendTag::Bind => b'B',
            FrontendTag::Describe => b'D',
            FrontendTag::Execute => b'E',
            FrontendTag::Sync => b'S',
            FrontendTag::Flush => b'H',
            FrontendTag::Close => b'C',
            FrontendTag::Terminate => b'X',
            FrontendTag::CopyData => b'd',
            FrontendTag::CopyDone => b'c',
            FrontendTag::Password => b'p',
        }
    }
}

/// Sub-protocol tags carried inside CopyData payloads during replication.
pub const WAL_DATA: u8 = b'w';
pub const SENDER_KEEPALIVE: u8 = b'k';
pub const STANDBY_STATUS_UPDATE: u8 = b'r';
pub const HOT_STANDBY_FEEDBACK: u8 = b'h';
