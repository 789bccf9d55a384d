//! Error types for messaging operations

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Result type returned by message handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Transport failure classes shared by every backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportErrorKind {
    /// The broker could not be reached or the connection dropped
    ConnectionFailure,
    /// The payload could not be encoded for the wire
    SerializationFailure,
    /// The broker refused the message or the operation
    BrokerRejected,
    /// The transport settings cannot work together
    InvalidConfiguration,
}

/// Errors raised by a [`MessageTransport`](crate::messaging::MessageTransport)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionFailure, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::SerializationFailure, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::BrokerRejected, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidConfiguration, message)
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::serialization(err.to_string())
    }
}

impl From<TransportError> for AppError {
    fn from(err: TransportError) -> Self {
        match err.kind {
            TransportErrorKind::ConnectionFailure => AppError::MessagingConnection(err.message),
            TransportErrorKind::SerializationFailure => AppError::Serialization(err.message),
            TransportErrorKind::BrokerRejected => AppError::Messaging(err.message),
            TransportErrorKind::InvalidConfiguration => AppError::Configuration(err.message),
        }
    }
}

/// Failure kinds a handler reports back to the retry policy.
///
/// Handlers never throw untyped errors: every failure is tagged so the
/// policy can decide between redelivery and dead-lettering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Payload did not match the expected message shape
    Deserialization,
    /// Outgoing payload could not be encoded
    Serialization,
    /// Injected by the fault injector
    SimulatedProcessing,
    /// The record store refused the write
    StoreWrite,
    /// Broker unreachable while publishing downstream
    ConnectionFailure,
    /// Broker refused the downstream publish
    BrokerRejected,
    /// Any other processing failure
    Processing,
}

/// Error returned by a [`MessageHandler`](crate::messaging::MessageHandler)
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Deserialization, message)
    }

    pub fn simulated(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SimulatedProcessing, message)
    }

    pub fn store_write(message: impl Into<String>) -> Self {
        Self::new(FailureKind::StoreWrite, message)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Processing, message)
    }
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        let kind = match err.kind {
            TransportErrorKind::ConnectionFailure => FailureKind::ConnectionFailure,
            TransportErrorKind::SerializationFailure => FailureKind::Serialization,
            TransportErrorKind::BrokerRejected => FailureKind::BrokerRejected,
            TransportErrorKind::InvalidConfiguration => FailureKind::Processing,
        };
        HandlerError::new(kind, err.message)
    }
}
