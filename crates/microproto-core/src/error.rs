use serde::{Deserialize, Serialize};

/// On-wire error codes carried by `ERROR` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    pub const SUCCESS: Self = Self(0x0000);
    pub const INVALID_OPCODE: Self = Self(0x0001);
    pub const INVALID_PROPERTY_ID: Self = Self(0x0002);
    pub const INVALID_FUNCTION_ID: Self = Self(0x0003);
    pub const TYPE_MISMATCH: Self = Self(0x0004);
    pub const VALIDATION_FAILED: Self = Self(0x0005);
    pub const OUT_OF_RANGE: Self = Self(0x0006);
    pub const PERMISSION_DENIED: Self = Self(0x0007);
    pub const NOT_IMPLEMENTED: Self = Self(0x0008);
    pub const PROTOCOL_VERSION_MISMATCH: Self = Self(0x0009);
    pub const BUFFER_OVERFLOW: Self = Self(0x000A);

    /// Symbolic name for logging. Codes above `0x000A` are application-specific.
    pub fn name(self) -> &'static str {
        match self.0 {
            0x0000 => "SUCCESS",
            0x0001 => "INVALID_OPCODE",
            0x0002 => "INVALID_PROPERTY_ID",
            0x0003 => "INVALID_FUNCTION_ID",
            0x0004 => "TYPE_MISMATCH",
            0x0005 => "VALIDATION_FAILED",
            0x0006 => "OUT_OF_RANGE",
            0x0007 => "PERMISSION_DENIED",
            0x0008 => "NOT_IMPLEMENTED",
            0x0009 => "PROTOCOL_VERSION_MISMATCH",
            0x000A => "BUFFER_OVERFLOW",
            _ => "APPLICATION",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:04X})", self.name(), self.0)
    }
}

/// Protocol error taxonomy.
///
/// Decode-time errors abort only the message (or batch entry) being processed.
/// `DuplicateId` is raised at registration time and is fatal for startup.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProtoError {
    #[error("truncated message")]
    TruncatedMessage,
    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),
    #[error("unknown property {0}")]
    UnknownProperty(u8),
    #[error("property id {0} is outside the 8-bit id space")]
    PropertyIdOutOfRange(u16),
    #[error("property {0} is read-only")]
    ReadOnlyViolation(u8),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("validation failed for property {id}: {reason}")]
    ValidationFailed { id: u8, reason: String },
    #[error("duplicate property id {0}")]
    DuplicateId(u8),
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocolViolation(String),
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },
    #[error("packet of {size} bytes exceeds limit {limit}")]
    PacketTooLarge { size: usize, limit: usize },
}

impl ProtoError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Code sent back to the peer in an `ERROR` message.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::TruncatedMessage | Self::Malformed(_) => ErrorCode::TYPE_MISMATCH,
            Self::UnknownOpcode(_) => ErrorCode::INVALID_OPCODE,
            Self::UnknownProperty(_) | Self::PropertyIdOutOfRange(_) | Self::DuplicateId(_) => {
                ErrorCode::INVALID_PROPERTY_ID
            }
            Self::ReadOnlyViolation(_) => ErrorCode::PERMISSION_DENIED,
            Self::ValidationFailed { .. } => ErrorCode::VALIDATION_FAILED,
            Self::HandshakeProtocolViolation(_) => ErrorCode::INVALID_OPCODE,
            Self::VersionMismatch { .. } => ErrorCode::PROTOCOL_VERSION_MISMATCH,
            Self::PacketTooLarge { .. } => ErrorCode::BUFFER_OVERFLOW,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::TruncatedMessage => "truncated_message",
            Self::UnknownOpcode(_) => "unknown_opcode",
            Self::UnknownProperty(_) | Self::PropertyIdOutOfRange(_) => "unknown_property",
            Self::ReadOnlyViolation(_) => "read_only_violation",
            Self::Malformed(_) => "malformed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::DuplicateId(_) => "duplicate_id",
            Self::HandshakeProtocolViolation(_) => "handshake_protocol_violation",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::PacketTooLarge { .. } => "packet_too_large",
        }
    }

    /// Errors that end the connection rather than a single message.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::HandshakeProtocolViolation(_) | Self::VersionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
