// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Transport
//!
//! `AmqpError` covers every failure the transport can surface to a caller: connection and
//! channel lifecycle, topology declaration, the confirmed-publish outcomes and the
//! settlement calls issued by the consume policy engines.
//!
//! Handler failures are represented separately by `HandlerError`. They never leave the
//! consume policy engine; they are turned into an ack/nack/retry/archive decision.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Dial or handshake failure; the connection stays disconnected
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// An operation needed the shared connection before `connect` succeeded
    #[error("not connected")]
    NotConnected,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The message could not be written to the channel
    #[error("failure to publish")]
    PublishingError,

    /// The channel or the connection closed while a publish was awaiting confirmation
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The broker reported a channel level error while a publish was awaiting confirmation
    #[error("broker error: {0}")]
    BrokerError(String),

    /// A mandatory publish matched no binding and came back from the broker
    #[error("message unroutable with routing key `{0}`")]
    Unroutable(String),

    /// No confirmation arrived before the deadline; the publish may still be in flight
    #[error("publish not confirmed within {0}ms")]
    PublishTimeout(u64),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error publishing an exhausted message to its archive queue
    #[error("failure to publish to archive `{0}`")]
    PublishingToArchiveError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Queue strategy options rejected before touching the broker
    #[error("invalid queue options: {0}")]
    InvalidQueueOptions(String),
}

/// Failure returned by a message handler.
///
/// The consume policy engines log it together with the queue name and convert it into
/// the configured settlement; it is never propagated further.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(err.to_string())
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError::new(err.to_string())
    }
}
