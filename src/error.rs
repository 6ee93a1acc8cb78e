use thiserror::Error;
use uuid::Uuid;

/// Rejections reported by the fitness machine in a control point indication
///
/// These are ordinary outcomes of a command the machine refused, not engine
/// failures. The engine stays usable after any of them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    /// The machine does not support the requested operation
    #[error("Operation not supported by the fitness machine")]
    NotSupported,

    /// A parameter was outside what the machine accepts
    #[error("Invalid parameter")]
    InvalidParameter,

    /// The machine accepted the request but could not carry it out
    #[error("Operation failed")]
    OperationFailed,

    /// The client does not hold control of the machine
    #[error("Control not permitted")]
    ControlNotPermitted,

    /// A result code this engine does not know about
    #[error("Unknown result code {0:02X}")]
    Unknown(u8),
}

/// Errors that can occur when talking to an FTMS fitness machine
#[derive(Error, Debug)]
pub enum FtmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// A buffer ended before the field being decoded
    #[error("Truncated buffer: needed {needed} byte(s) at offset {offset}, {remaining} remaining")]
    TruncatedBuffer {
        /// Cursor position when the read was attempted
        offset: usize,
        /// Width of the field being read
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Feature or range characteristics could not be interpreted
    #[error("Malformed capability data: {0}")]
    MalformedCapability(String),

    /// A control request is already waiting for its indication
    #[error("Control point busy: op code {pending:02X} is still pending")]
    Busy {
        /// Op code of the request that is still outstanding
        pending: u8,
    },

    /// The indication echoed a different op code than the pending request
    #[error("Protocol mismatch: expected response to {expected:02X}, got {received:02X}")]
    ProtocolMismatch {
        /// Op code of the pending request
        expected: u8,
        /// Op code echoed by the indication
        received: u8,
    },

    /// No indication arrived in time
    #[error("Control request timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Transport reported a disconnect
    #[error("Device disconnected")]
    Disconnected,

    /// The machine rejected a control request
    #[error("Control request rejected: {0}")]
    Control(#[from] ControlError),

    /// Control must be requested again before other commands are accepted
    #[error("Control not acquired - request control first")]
    ControlNotAcquired,

    /// The capability set does not advertise the setting or data
    #[error("Not supported by this machine: {0}")]
    NotSupported(String),

    /// A setting value is outside the range advertised by the machine
    #[error("{setting} value {value} is out of range ({min} - {max})")]
    OutOfRange {
        /// Setting name
        setting: String,
        /// Requested value
        value: f64,
        /// Advertised minimum
        min: f64,
        /// Advertised maximum
        max: f64,
    },

    /// A value cannot be represented in its wire field
    #[error("Value {value} does not fit field {field}")]
    ValueOutOfRange {
        /// Value that was being encoded
        value: f64,
        /// Field format description
        field: String,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Malformed data that is not a plain truncation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The transport does not know the characteristic
    #[error("Characteristic {0} not available")]
    CharacteristicNotFound(Uuid),

    /// Transport-level failure reported by a `Transport` implementation
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for FTMS operations
pub type Result<T> = std::result::Result<T, FtmsError>;

impl FtmsError {
    /// Check if this error came from decoding a notification payload
    #[must_use]
    pub const fn is_decode_error(&self) -> bool {
        matches!(self, Self::TruncatedBuffer { .. } | Self::Protocol(_))
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::Disconnected | Self::Transport(_) | Self::CharacteristicNotFound(_)
        )
    }

    /// Check if the same request may succeed when retried later
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::Timeout { .. }
                | Self::ProtocolMismatch { .. }
                | Self::ControlNotAcquired
                | Self::Control(ControlError::ControlNotPermitted | ControlError::OperationFailed)
        )
    }

    /// Check if this error ends the device session
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::MalformedCapability(_))
    }
}
