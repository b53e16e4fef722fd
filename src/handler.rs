// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler is a single-shot async operation: it receives the decoded payload and the
//! delivery context and returns `Ok(value)` or `Err(HandlerError)`. The consume policy
//! engines only look at which of the two it returned.

use crate::errors::{AmqpError, HandlerError};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    BasicProperties,
};
use opentelemetry::Context;
use serde_json::Value;
use std::{future::Future, sync::Arc};
use tracing::error;

/// Settlement handle for one delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl DeliveryAcker for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match Acker::ack(self, BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// The message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl RawMessage {
    pub fn new(data: &[u8]) -> RawMessage {
        RawMessage {
            delivery_tag: 0,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.to_vec(),
        }
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Splits a lapin delivery into the message and its acker.
    pub(crate) fn from_delivery(delivery: Delivery) -> (RawMessage, Acker) {
        let Delivery {
            delivery_tag,
            exchange,
            routing_key,
            redelivered,
            properties,
            data,
            acker,
            ..
        } = delivery;

        (
            RawMessage {
                delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                redelivered,
                properties,
                data,
            },
            acker,
        )
    }
}

/// Everything a handler gets next to the payload.
///
/// `acker` settles the delivery by hand, which is how messages consumed with
/// `AckPolicy::Off` or `NackPolicy::Off` are eventually acknowledged.
#[derive(Clone)]
pub struct DeliveryContext {
    pub queue: String,
    pub message: Arc<RawMessage>,
    pub acker: Arc<dyn DeliveryAcker>,
    /// Trace context extracted from the message headers
    pub trace: Context,
}

/// Business logic invoked for each consumed message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: DeliveryContext) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, ctx: DeliveryContext) -> Result<Value, HandlerError> {
        (self.f)(payload, ctx).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// # Parameters
/// * `f` - Closure receiving the decoded payload and the delivery context
///
/// # Returns
/// The handler, ready to be registered on a queue strategy
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Value, DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
