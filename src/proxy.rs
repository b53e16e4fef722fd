// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Proxy
//!
//! Fire-and-forget outbound side: `dispatch` encodes the data and publishes it through the
//! shared client, returning once the message is accepted into the channel buffer.

use crate::{
    channel::{Dialer, LapinDialer},
    client::RabbitClient,
    codec,
    config::ConnectionParams,
    errors::AmqpError,
    publisher::PublishOptions,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// An outbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchMessage {
    /// Routing key, usually the name of the target queue
    pub pattern: String,
    pub data: Value,
    /// Defaults to the default exchange
    pub exchange: Option<String>,
    pub options: PublishOptions,
}

impl DispatchMessage {
    pub fn new(pattern: &str, data: Value) -> DispatchMessage {
        DispatchMessage {
            pattern: pattern.to_owned(),
            data,
            exchange: None,
            options: PublishOptions::default(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

pub struct RabbitProxy<D: Dialer = LapinDialer> {
    client: Arc<RabbitClient<D>>,
}

impl RabbitProxy<LapinDialer> {
    pub fn new(params: ConnectionParams) -> Self {
        RabbitProxy::with_client(Arc::new(RabbitClient::new(params)))
    }
}

impl<D: Dialer> RabbitProxy<D> {
    /// Proxy publishing through an existing client.
    pub fn with_client(client: Arc<RabbitClient<D>>) -> Self {
        RabbitProxy { client }
    }

    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.client.connect().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.client.close().await
    }

    /// Encodes and publishes `message` without waiting for the broker.
    ///
    /// # Parameters
    /// * `message` - Pattern, data and optional exchange of the event
    ///
    /// # Returns
    /// `Ok` once the message is in the channel's write buffer
    pub async fn dispatch(&self, message: DispatchMessage) -> Result<(), AmqpError> {
        let exchange = message.exchange.as_deref().unwrap_or_default();
        let content = codec::encode(&message.data);

        debug!(exchange, routing_key = message.pattern.as_str(), "dispatching event");

        self.client
            .publish(exchange, &message.pattern, &content, &message.options)
            .await
    }

    pub fn client(&self) -> Arc<RabbitClient<D>> {
        self.client.clone()
    }
}
