//! SSH disconnect reason codes (RFC 4253 section 11.1)

/// Reason code carried on a transport-level disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

impl DisconnectReason {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            DisconnectReason::HostNotAllowedToConnect => "HOST_NOT_ALLOWED_TO_CONNECT",
            DisconnectReason::ProtocolError => "PROTOCOL_ERROR",
            DisconnectReason::KeyExchangeFailed => "KEY_EXCHANGE_FAILED",
            DisconnectReason::Reserved => "RESERVED",
            DisconnectReason::MacError => "MAC_ERROR",
            DisconnectReason::CompressionError => "COMPRESSION_ERROR",
            DisconnectReason::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            DisconnectReason::ProtocolVersionNotSupported => "PROTOCOL_VERSION_NOT_SUPPORTED",
            DisconnectReason::HostKeyNotVerifiable => "HOST_KEY_NOT_VERIFIABLE",
            DisconnectReason::ConnectionLost => "CONNECTION_LOST",
            DisconnectReason::ByApplication => "DISCONNECT_BY_APPLICATION",
            DisconnectReason::TooManyConnections => "TOO_MANY_CONNECTIONS",
            DisconnectReason::AuthCancelledByUser => "AUTH_CANCELLED_BY_USER",
            DisconnectReason::NoMoreAuthMethodsAvailable => "NO_MORE_AUTH_METHODS_AVAILABLE",
            DisconnectReason::IllegalUserName => "ILLEGAL_USER_NAME",
        }
    }

    pub fn from_code(code: u32) -> Option<DisconnectReason> {
        match code {
            1 => Some(DisconnectReason::HostNotAllowedToConnect),
            2 => Some(DisconnectReason::ProtocolError),
            3 => Some(DisconnectReason::KeyExchangeFailed),
            4 => Some(DisconnectReason::Reserved),
            5 => Some(DisconnectReason::MacError),
            6 => Some(DisconnectReason::CompressionError),
            7 => Some(DisconnectReason::ServiceNotAvailable),
            8 => Some(DisconnectReason::ProtocolVersionNotSupported),
            9 => Some(DisconnectReason::HostKeyNotVerifiable),
            10 => Some(DisconnectReason::ConnectionLost),
            11 => Some(DisconnectReason::ByApplication),
            12 => Some(DisconnectReason::TooManyConnections),
            13 => Some(DisconnectReason::AuthCancelledByUser),
            14 => Some(DisconnectReason::NoMoreAuthMethodsAvailable),
            15 => Some(DisconnectReason::IllegalUserName),
            _ => None,
        }
    }
}
