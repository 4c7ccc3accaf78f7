//! Error types shared by every layer of the crate.
//!
//! The codec and the planner have their own narrow error enums ([`EncodeError`],
//! [`PlanError`]); the crate-level [`Error`] wraps them transparently together
//! with the transport failures.

/// Raised when a physical value cannot be turned into register content.
///
/// An encode error is always raised before anything is sent over the wire.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// The raw integer for `value` would not fit into the register width.
    #[error("value {value} for `{field}` is out of range ({min}..={max})")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// NaN or infinite values are never encodable.
    #[error("value for `{field}` is not a finite number")]
    NotFinite { field: String },

    /// Fault and status code registers are read-only.
    #[error("`{field}` cannot be encoded from {kind}")]
    NotEncodable { field: String, kind: &'static str },

    /// A flag or sub-field name that is not part of the register's bit layout.
    #[error("`{field}` has no bit field named `{name}`")]
    UnknownBitField { field: String, name: String },
}

/// Raised by the batch planner on invalid input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("unknown field `{0}`")]
    UnknownField(String),

    #[error("field `{0}` requested more than once")]
    DuplicateField(String),

    #[error("address {0:#06x} requested more than once")]
    DuplicateAddress(u16),

    #[error("chunk size must be at least 1")]
    ZeroChunkSize,

    #[error("range {start:#06x} + {count} exceeds the register address space")]
    AddressOverflow { start: u16, count: u32 },
}

/// Every error surfaced by transports and the data assembler.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Credentials were rejected or a re-authentication failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Timeout, busy device or communication error, worth another attempt.
    #[error("transient communication error: {0}")]
    TransientCommunication(String),

    /// Retries were exhausted without the device answering.
    #[error("device {serial} unreachable after {attempts} attempts")]
    DeviceUnreachable { serial: String, attempts: u32 },

    /// The remote side refused the request for good (blocked account, bad parameter).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The device answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    ModbusException(String),

    /// Malformed or partial register response.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The field exists in the catalog of another family but not in this one.
    #[error("field `{field}` is not supported by the {family} family")]
    UnsupportedField { field: String, family: String },

    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    /// The active transport lacks a capability the operation needs.
    #[error("operation not supported by transport: {0}")]
    Unsupported(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry policy may attempt the failed operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientCommunication(_))
    }
}

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn only_communication_errors_are_transient() {
        assert!(Error::TransientCommunication("busy".into()).is_transient());
        assert!(!Error::Authentication("expired".into()).is_transient());
        assert!(!Error::ProtocolDecode("short".into()).is_transient());
        assert!(!Error::Rejected("blocked".into()).is_transient());
    }

    #[test]
    fn encode_error_converts_transparently() {
        let err: Error = EncodeError::NotFinite {
            field: "pv1_voltage".into(),
        }
        .into();
        assert_matches!(err, Error::Encode(EncodeError::NotFinite { .. }));
        assert_eq!(err.to_string(), "value for `pv1_voltage` is not a finite number");
    }
}
