//! Error types for the laser controller.
//!
//! `LaserError` is the single error surfaced to callers of the driver. It
//! follows the taxonomy of the device link:
//!
//! - **Transport**: `NotConnected`, `Io`, `NoResponse`. A missing response is
//!   recoverable; the caller may retry.
//! - **Protocol**: `Protocol`, `DeviceRejected`, `UnexpectedResponse`. Device
//!   rejections always carry one of the eight fixed `?N` codes.
//! - **Precondition**: `InvalidArgument` (caught before the wire),
//!   `DeviceNotReady`, `FireInProgress`.
//! - **Sequencing**: `FireFailed`, `LaserUnexpectedlyOff`, `FireDidNotStop`.
//!   Raised by the fire sequence; fatal to that sequence only.
//! - **Task**: `TaskFailed` when the fire task panicked or was cancelled.

use thiserror::Error;

use crate::protocol::{ErrorCode, ProtocolError};
use crate::status::StatusWord;

/// Convenience alias for results using the controller error type.
pub type LaserResult<T> = std::result::Result<T, LaserError>;

/// Controller-facing error.
#[derive(Error, Debug)]
pub enum LaserError {
    /// The transport is closed.
    #[error("serial port is not connected")]
    NotConnected,

    /// I/O failure on the transport.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No terminated response within the read timeout.
    ///
    /// **Error Type**: Transient - retry the command.
    #[error("no response to '{command}' within timeout")]
    NoResponse {
        /// Command as sent, without address or terminator.
        command: String,
    },

    /// Argument outside the valid range, rejected before touching the wire.
    #[error("invalid argument for {keyword}: {value} (allowed {bound})")]
    InvalidArgument {
        /// Keyword of the rejected setter.
        keyword: &'static str,
        /// Value as the caller passed it.
        value: String,
        /// Allowed range, `min..=max`.
        bound: String,
    },

    /// The device answered with an error code.
    #[error("{keyword} rejected by device with {code}: {}", .code.description())]
    DeviceRejected {
        /// Keyword of the rejected command.
        keyword: String,
        /// Code returned by the device.
        code: ErrorCode,
    },

    /// Device state does not allow the operation.
    #[error("device not ready: {0}")]
    DeviceNotReady(String),

    /// `FL 1` was refused; `FL 0` has already been sent.
    #[error("fire command failed: {reason}")]
    FireFailed {
        /// Device code, when the device refused `FL 1` outright.
        code: Option<ErrorCode>,
        /// Human-readable cause.
        reason: String,
    },

    /// A fire sequence is already running.
    #[error("a fire sequence is already in progress")]
    FireInProgress,

    /// The laser stopped firing before the sequence duration elapsed.
    #[error("laser turned off unexpectedly during fire (status {})", .status.encode())]
    LaserUnexpectedlyOff {
        /// Status that showed the laser inactive.
        status: StatusWord,
    },

    /// The laser was still active after the completion grace period.
    #[error("laser still active after fire duration; FL 0 sent")]
    FireDidNotStop,

    /// The response could not be interpreted for this command.
    #[error("unexpected response to '{command}': '{response}'")]
    UnexpectedResponse {
        /// Command the response belongs to.
        command: String,
        /// Response text as received.
        response: String,
    },

    /// Codec failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl LaserError {
    /// True for errors where retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LaserError::NoResponse { .. } | LaserError::FireInProgress => true,
            LaserError::DeviceRejected { code, .. } => *code == ErrorCode::Unavailable,
            LaserError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Device error code carried by this error, if any.
    pub fn device_code(&self) -> Option<ErrorCode> {
        match self {
            LaserError::DeviceRejected { code, .. } => Some(*code),
            LaserError::FireFailed { code, .. } => *code,
            LaserError::Protocol(err) => Some(err.code()),
            _ => None,
        }
    }
}
