// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! Exchange definitions plus the process-wide `ExchangeBinder`, which declares each
//! exchange at most once and binds queues to it with the `<queue>.key` routing key.

use crate::{errors::AmqpError, queue::QueueBinding, topology::TopologyChannel};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};
use tracing::debug;

/// Represents the types of exchanges a queue can be bound to.
///
/// `Match` is passed to the broker verbatim as the `match` type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Match,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Match => lapin::ExchangeKind::Custom("match".to_owned()),
        }
    }
}

/// Definition of a RabbitMQ exchange with its declaration options.
///
/// This struct implements the builder pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default, the exchange is created as a Direct exchange with default parameters.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Adds a single declaration argument to the exchange.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// Routing key used when binding `queue` to a caller supplied exchange.
///
/// # Parameters
/// * `queue` - The bound queue
///
/// # Returns
/// `<queue>.key`
pub fn binding_key(queue: &str) -> String {
    format!("{}.key", queue)
}

/// Declares exchanges once per process and binds queues to them.
///
/// Membership is keyed by exchange name only, so the first declaration's kind and
/// options win. The set is a round-trip saver: re-declaring an identical exchange is a
/// no-op at the broker.
#[derive(Debug, Default)]
pub struct ExchangeBinder {
    declared: Mutex<HashSet<String>>,
}

impl ExchangeBinder {
    pub fn new() -> ExchangeBinder {
        ExchangeBinder::default()
    }

    /// Declares every exchange not yet seen and binds `queue` to all of them with
    /// `<queue>.key`.
    ///
    /// # Parameters
    /// * `channel` - The declaration channel
    /// * `queue` - The queue to bind
    /// * `exchanges` - Exchanges to declare and bind
    ///
    /// # Returns
    /// The first declaration or binding error, if any
    pub async fn bind_exchanges(
        &self,
        channel: &dyn TopologyChannel,
        queue: &str,
        exchanges: &[ExchangeDefinition],
    ) -> Result<(), AmqpError> {
        for exchange in exchanges {
            if !self.is_declared(&exchange.name) {
                channel.declare_exchange(exchange).await?;
                self.mark_declared(&exchange.name);
            } else {
                debug!(exchange = exchange.name.as_str(), "exchange already declared");
            }

            let binding = QueueBinding::new(queue)
                .exchange(&exchange.name)
                .routing_key(&binding_key(queue));

            channel.bind_queue(&binding).await?;
        }

        Ok(())
    }

    pub fn is_declared(&self, name: &str) -> bool {
        match self.declared.lock() {
            Ok(set) => set.contains(name),
            Err(poisoned) => poisoned.into_inner().contains(name),
        }
    }

    fn mark_declared(&self, name: &str) {
        match self.declared.lock() {
            Ok(mut set) => set.insert(name.to_owned()),
            Err(poisoned) => poisoned.into_inner().insert(name.to_owned()),
        };
    }
}
