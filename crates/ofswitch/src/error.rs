//! Switch-facing error types and status handling.
//!
//! This module converts OpenFlow error messages (type/code pairs) and
//! connection-level failures into a single `OfError` that the upper layers
//! can classify against the error taxonomy (spec.md section 7): transient
//! peer failures are retried, edit failures are logged and the offending
//! object dropped, fatal errors stop the agent.

use std::fmt;
use thiserror::Error;

/// OpenFlow error message `type` field.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfErrorType {
    HelloFailed = 0,
    BadRequest = 1,
    BadAction = 2,
    BadInstruction = 3,
    BadMatch = 4,
    FlowModFailed = 5,
    GroupModFailed = 6,
    PortModFailed = 7,
    TableModFailed = 8,
    QueueOpFailed = 9,
    SwitchConfigFailed = 10,
    RoleRequestFailed = 11,
    MeterModFailed = 12,
    TableFeaturesFailed = 13,
    Experimenter = 0xffff,
}

impl OfErrorType {
    pub fn from_raw(t: u16) -> Self {
        match t {
            0 => Self::HelloFailed,
            1 => Self::BadRequest,
            2 => Self::BadAction,
            3 => Self::BadInstruction,
            4 => Self::BadMatch,
            5 => Self::FlowModFailed,
            6 => Self::GroupModFailed,
            7 => Self::PortModFailed,
            8 => Self::TableModFailed,
            9 => Self::QueueOpFailed,
            10 => Self::SwitchConfigFailed,
            11 => Self::RoleRequestFailed,
            12 => Self::MeterModFailed,
            13 => Self::TableFeaturesFailed,
            _ => Self::Experimenter,
        }
    }
}

impl fmt::Display for OfErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HelloFailed => "HELLO_FAILED",
            Self::BadRequest => "BAD_REQUEST",
            Self::BadAction => "BAD_ACTION",
            Self::BadInstruction => "BAD_INSTRUCTION",
            Self::BadMatch => "BAD_MATCH",
            Self::FlowModFailed => "FLOW_MOD_FAILED",
            Self::GroupModFailed => "GROUP_MOD_FAILED",
            Self::PortModFailed => "PORT_MOD_FAILED",
            Self::TableModFailed => "TABLE_MOD_FAILED",
            Self::QueueOpFailed => "QUEUE_OP_FAILED",
            Self::SwitchConfigFailed => "SWITCH_CONFIG_FAILED",
            Self::RoleRequestFailed => "ROLE_REQUEST_FAILED",
            Self::MeterModFailed => "METER_MOD_FAILED",
            Self::TableFeaturesFailed => "TABLE_FEATURES_FAILED",
            Self::Experimenter => "EXPERIMENTER",
        };
        write!(f, "{s}")
    }
}

/// A raw (type, code) pair as received in an OpenFlow error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OfErrorCode {
    pub error_type: OfErrorType,
    pub code: u16,
}

impl fmt::Display for OfErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.error_type, self.code)
    }
}

/// Error type for switch-facing operations (C2-C7).
#[derive(Debug, Clone, Error)]
pub enum OfError {
    /// The switch returned an explicit error message for a request.
    #[error("switch rejected request: {code}")]
    SwitchRejected { code: OfErrorCode },

    /// The connection is not currently CONNECTED.
    #[error("not connected to switch")]
    NotConnected,

    /// A blocking Execute timed out waiting for its barrier reply.
    #[error("timed out waiting for barrier reply")]
    Timeout,

    /// Encoding a match/action/instruction failed (malformed builder input).
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// The requested port or table object was not found.
    #[error("not found: {item}")]
    NotFound { item: String },

    /// Two distinct objectIds tried to install an equal (priority, match) flow.
    #[error("flow conflict: {message}")]
    Conflict { message: String },

    /// Internal invariant violation.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl OfError {
    pub fn switch_rejected(error_type: OfErrorType, code: u16) -> Self {
        Self::SwitchRejected {
            code: OfErrorCode { error_type, code },
        }
    }

    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound { item: item.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for errors the caller should treat as transient-peer (spec.md
    /// section 7): worth retrying once the connection recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout)
    }
}

pub type OfResult<T> = Result<T, OfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_from_raw() {
        assert_eq!(OfErrorType::from_raw(5), OfErrorType::FlowModFailed);
        assert_eq!(OfErrorType::from_raw(9999), OfErrorType::Experimenter);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(OfError::NotConnected.is_retryable());
        assert!(OfError::Timeout.is_retryable());
        assert!(!OfError::switch_rejected(OfErrorType::FlowModFailed, 2).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = OfError::switch_rejected(OfErrorType::FlowModFailed, 2);
        assert_eq!(e.to_string(), "switch rejected request: FLOW_MOD_FAILED/2");
    }
}
