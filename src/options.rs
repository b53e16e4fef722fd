// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Strategy Options
//!
//! Options for the two consume strategies:
//!
//! - `PureQueueOptions`: a single queue declared the way the caller describes it, settled
//!   with an ack policy on success and a nack policy on failure.
//! - `TernaryQueueOptions`: the main -> retry -> archive graph with a bounded number of
//!   handler attempts and a fixed retry delay.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition};
use lapin::types::{AMQPValue, FieldTable, ShortString};

/// Default number of handler attempts for a ternary queue
pub const DEFAULT_ATTEMPTS: u32 = 3;
/// Default delay in milliseconds a failed message spends in the retry queue
pub const DEFAULT_RETRY_TTL_MS: u32 = 5000;

/// Settlement applied when the handler succeeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge the delivery
    #[default]
    Auto,
    /// Leave the delivery unacknowledged
    Off,
}

/// Settlement applied when the handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NackPolicy {
    /// Nack with requeue; the broker redelivers without any limit
    Requeue,
    /// Acknowledge anyway, discarding the message
    #[default]
    Skip,
    /// Nack without requeue, routing to the queue's dead-letter target if any
    Dlx,
    /// No settlement at all
    Off,
}

/// Consume options of a pure queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeOptions {
    pub ack_policy: AckPolicy,
    pub nack_policy: NackPolicy,
    /// Generated when absent
    pub consumer_tag: Option<String>,
    /// The broker settles deliveries itself; no policy is applied
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub arguments: FieldTable,
}

impl ConsumeOptions {
    pub fn new() -> ConsumeOptions {
        ConsumeOptions::default()
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn nack_policy(mut self, policy: NackPolicy) -> Self {
        self.nack_policy = policy;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }
}

/// Options of a pure queue strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct PureQueueOptions {
    pub name: String,
    pub exchanges: Vec<ExchangeDefinition>,
    pub queue: QueueDefinition,
    pub consume: ConsumeOptions,
    pub prefetch: Option<u16>,
}

impl PureQueueOptions {
    /// A durable queue named `name` with the default policies.
    pub fn new(name: &str) -> PureQueueOptions {
        PureQueueOptions {
            name: name.to_owned(),
            exchanges: vec![],
            queue: QueueDefinition::new(name).durable(),
            consume: ConsumeOptions::default(),
            prefetch: None,
        }
    }

    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchanges.push(exchange);
        self
    }

    /// Replaces the queue declaration; the queue keeps the strategy's name.
    pub fn queue(mut self, queue: QueueDefinition) -> Self {
        self.queue = QueueDefinition {
            name: self.name.clone(),
            ..queue
        };
        self
    }

    pub fn consume(mut self, consume: ConsumeOptions) -> Self {
        self.consume = consume;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }
}

/// Options of a ternary queue strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct TernaryQueueOptions {
    pub name: String,
    pub exchanges: Vec<ExchangeDefinition>,
    /// Maximum handler invocations per message
    pub attempts: u32,
    /// Delay before a failed message re-enters the main queue
    pub ttl_ms: u32,
    pub prefetch: Option<u16>,
}

impl TernaryQueueOptions {
    pub fn new(name: &str) -> TernaryQueueOptions {
        TernaryQueueOptions {
            name: name.to_owned(),
            exchanges: vec![],
            attempts: DEFAULT_ATTEMPTS,
            ttl_ms: DEFAULT_RETRY_TTL_MS,
            prefetch: None,
        }
    }

    pub fn exchange(mut self, exchange: ExchangeDefinition) -> Self {
        self.exchanges.push(exchange);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: u32) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.attempts == 0 {
            return Err(AmqpError::InvalidQueueOptions(format!(
                "ternary queue `{}` needs at least one attempt",
                self.name
            )));
        }

        Ok(())
    }
}

/// A queue strategy with its options, as registered on the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueStrategy {
    Pure(PureQueueOptions),
    Ternary(TernaryQueueOptions),
}

impl QueueStrategy {
    pub fn name(&self) -> &str {
        match self {
            QueueStrategy::Pure(opts) => &opts.name,
            QueueStrategy::Ternary(opts) => &opts.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_policies() {
        let consume = ConsumeOptions::default();
        assert_eq!(consume.ack_policy, AckPolicy::Auto);
        assert_eq!(consume.nack_policy, NackPolicy::Skip);
        assert!(!consume.no_ack);

        let ternary = TernaryQueueOptions::new("orders");
        assert_eq!(ternary.attempts, 3);
        assert_eq!(ternary.ttl_ms, 5000);
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let result = TernaryQueueOptions::new("orders").attempts(0).validate();

        assert!(matches!(result, Err(AmqpError::InvalidQueueOptions(_))));
        assert!(TernaryQueueOptions::new("orders").attempts(1).validate().is_ok());
    }

    #[test]
    fn pure_queue_declaration_keeps_the_strategy_name() {
        let opts = PureQueueOptions::new("billing")
            .queue(QueueDefinition::new("ignored").exclusive().ttl(1000));

        assert_eq!(opts.queue.name(), "billing");
        assert!(opts.queue.exclusive);
        assert_eq!(opts.queue.ttl, Some(1000));
    }

    #[test]
    fn strategy_name() {
        let pure = QueueStrategy::Pure(PureQueueOptions::new("billing"));
        let ternary = QueueStrategy::Ternary(TernaryQueueOptions::new("orders"));

        assert_eq!(pure.name(), "billing");
        assert_eq!(ternary.name(), "orders");
    }
}
