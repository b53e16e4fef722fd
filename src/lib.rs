// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod confirm;
mod otel;

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod options;
pub mod proxy;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use client::RabbitClient;
pub use config::ConnectionParams;
pub use consumer::Disposition;
pub use dispatcher::RabbitTransport;
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, DeliveryContext, MessageHandler};
pub use options::{AckPolicy, NackPolicy, PureQueueOptions, TernaryQueueOptions};
pub use proxy::{DispatchMessage, RabbitProxy};
