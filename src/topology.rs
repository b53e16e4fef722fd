// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! A topology is an ordered list of exchange declarations, queue declarations and
//! queue-to-exchange bindings which is installed on a channel step by step.
//!
//! The main components are:
//! - `TopologyChannel` trait: the broker calls a topology needs
//! - `AmqpTopology`: ordered topology plan and its installer
//! - `TernaryNames` / `ternary_topology`: the main -> retry -> archive graph

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tracing::{debug, error};

/// Broker calls needed to install a topology.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");

                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A single declaration in a topology plan.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyStep {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

/// Ordered topology plan.
///
/// Steps are installed in the order they were added, so a binding can rely on the
/// exchange and queue declared before it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmqpTopology {
    steps: Vec<TopologyStep>,
}

impl AmqpTopology {
    pub fn new() -> AmqpTopology {
        AmqpTopology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.steps.push(TopologyStep::Exchange(def));
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.steps.push(TopologyStep::Queue(def));
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.steps.push(TopologyStep::Binding(binding));
        self
    }

    pub fn steps(&self) -> &[TopologyStep] {
        &self.steps
    }

    /// Installs the topology, stopping at the first failing step.
    ///
    /// Declarations are idempotent at the broker as long as the arguments match what
    /// already exists, so installing the same plan on every start is safe.
    pub async fn install(&self, channel: &dyn TopologyChannel) -> Result<(), AmqpError> {
        for step in &self.steps {
            match step {
                TopologyStep::Exchange(def) => channel.declare_exchange(def).await?,
                TopologyStep::Queue(def) => channel.declare_queue(def).await?,
                TopologyStep::Binding(binding) => channel.bind_queue(binding).await?,
            }
        }

        Ok(())
    }
}

/// Names derived from a ternary queue base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TernaryNames {
    pub main_queue: String,
    pub retry_queue: String,
    pub archive_queue: String,
    pub main_exchange: String,
    pub retry_exchange: String,
    pub main_key: String,
    pub retry_key: String,
}

impl TernaryNames {
    pub fn new(name: &str) -> TernaryNames {
        TernaryNames {
            main_queue: format!("{}.main.queue", name),
            retry_queue: format!("{}.retry.queue", name),
            archive_queue: format!("{}.archive.queue", name),
            main_exchange: format!("{}.main.exchange", name),
            retry_exchange: format!("{}.retry.exchange", name),
            main_key: format!("{}.main.key", name),
            retry_key: format!("{}.retry.key", name),
        }
    }
}

/// Builds the main -> retry -> archive graph for `name`.
///
/// Rejected messages leave `main.queue` through its dead-letter arguments into
/// `retry.exchange`, wait `ttl_ms` in `retry.queue`, then expire back into
/// `main.exchange`. Every hop bumps the broker's `x-death` count, which is the only
/// attempt counter. `archive.queue` is a terminal sink without dead-lettering.
///
/// # Parameters
/// * `name` - Base name of the queue graph
/// * `ttl_ms` - Delay a rejected message spends in `retry.queue`
///
/// # Returns
/// The seven step plan, in declaration order
pub fn ternary_topology(name: &str, ttl_ms: u32) -> AmqpTopology {
    let names = TernaryNames::new(name);

    AmqpTopology::new()
        .exchange(
            ExchangeDefinition::new(&names.main_exchange)
                .kind(ExchangeKind::Direct)
                .durable(),
        )
        .queue(
            QueueDefinition::new(&names.main_queue)
                .durable()
                .dead_letter(&names.retry_exchange, &names.retry_key),
        )
        .queue_binding(
            QueueBinding::new(&names.main_queue)
                .exchange(&names.main_exchange)
                .routing_key(&names.main_key),
        )
        .queue(QueueDefinition::new(&names.archive_queue).durable())
        .exchange(
            ExchangeDefinition::new(&names.retry_exchange)
                .kind(ExchangeKind::Direct)
                .durable(),
        )
        .queue(
            QueueDefinition::new(&names.retry_queue)
                .durable()
                .dead_letter(&names.main_exchange, &names.main_key)
                .ttl(ttl_ms),
        )
        .queue_binding(
            QueueBinding::new(&names.retry_queue)
                .exchange(&names.retry_exchange)
                .routing_key(&names.retry_key),
        )
}
