//! Error types for kapsule-dbus-proxy.

use std::time::Duration;

use thiserror::Error;
use zbus::message::Type as MessageType;

use crate::routing::NameLocation;

/// Result type alias for kapsule-dbus-proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the D-Bus proxy.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// D-Bus error from zbus.
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Message encoding or decoding error.
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start()` was called while the proxy is already starting or running.
    #[error("Proxy already started")]
    AlreadyStarted,

    /// `run()` was called on a proxy that is not running.
    #[error("Proxy not started")]
    NotStarted,

    /// A proxy is already registered for this container.
    #[error("Proxy already running for container {0}")]
    DuplicateProxy(String),

    /// A bus connection went away.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
}

/// Message-related errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Missing required message header field.
    #[error("Missing message header field: {0}")]
    MissingHeader(String),

    /// Invalid message serial number.
    #[error("Invalid serial number")]
    InvalidSerial,

    /// The message is of a type the operation does not accept.
    #[error("Unexpected message type: {0:?}")]
    UnexpectedType(MessageType),

    /// Message body deserialization failed.
    #[error("Failed to deserialize message body: {0}")]
    DeserializeFailed(String),
}

/// Per-call failures of a forwarded method call.
///
/// None of these take the proxy down; they are reported to the caller of
/// the forward only.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The target bus is not connected (proxy not running).
    #[error("{0} bus is not connected")]
    NotConnected(NameLocation),

    /// Only method calls can be forwarded.
    #[error("Only method calls can be forwarded")]
    NotACall,

    /// The destination is empty or a unique name, so it stays on its own bus.
    #[error("No cross-bus route for destination {0:?}")]
    NoRoute(Option<String>),

    /// The target bus did not reply in time.
    #[error("No reply within {0:?}")]
    NoReply(Duration),

    /// The pending call was cancelled because the proxy stopped.
    #[error("Forwarded call cancelled")]
    Cancelled,

    /// The call could not be re-framed under the forwarded serial.
    #[error("Failed to re-frame forwarded call: {0}")]
    Reframe(String),

    /// Sending on the target bus failed.
    #[error("Failed to send forwarded call: {0}")]
    Send(String),
}
