// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client
//!
//! `RabbitClient` is the explicitly owned handle every collaborator shares: the transport
//! sets its queue strategies up through it and outbound callers publish through it. It
//! bundles the connection manager, the process-wide exchange binder and the confirm
//! deadline used by confirmed publishes.

use crate::{
    channel::{BrokerSession, ConnectionManager, ConnectionState, Dialer, LapinDialer},
    config::ConnectionParams,
    consumer::{ConsumePolicy, PureQueueConsumer, TernaryQueueConsumer},
    dispatcher::spawn_consumer,
    errors::AmqpError,
    exchange::{ExchangeBinder, ExchangeDefinition},
    handler::MessageHandler,
    options::{ConsumeOptions, PureQueueOptions, TernaryQueueOptions},
    publisher::{PublishOptions, RabbitMQPublisher, CONFIRM_TIMEOUT},
    topology::{ternary_topology, AmqpTopology, TernaryNames, TopologyChannel},
};
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    Channel, Consumer,
};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

pub struct RabbitClient<D: Dialer = LapinDialer> {
    connection: ConnectionManager<D>,
    binder: ExchangeBinder,
    confirm_timeout: Duration,
}

impl RabbitClient<LapinDialer> {
    pub fn new(params: ConnectionParams) -> Self {
        RabbitClient::with_dialer(LapinDialer, params)
    }
}

impl<D: Dialer> RabbitClient<D> {
    pub fn with_dialer(dialer: D, params: ConnectionParams) -> Self {
        RabbitClient {
            connection: ConnectionManager::with_dialer(dialer, params),
            binder: ExchangeBinder::new(),
            confirm_timeout: CONFIRM_TIMEOUT,
        }
    }

    /// Overrides the confirmed-publish deadline.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.connection.connect().await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.connection.close().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn params(&self) -> &ConnectionParams {
        self.connection.params()
    }

    /// Publisher over the shared confirm channel.
    pub fn publisher(&self) -> Result<RabbitMQPublisher, AmqpError> {
        let session = self.connection.session()?;

        Ok(RabbitMQPublisher::new(session.confirm_channel())
            .with_confirm_timeout(self.confirm_timeout))
    }

    /// Fire-and-forget publish; see [`RabbitMQPublisher::publish`].
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publisher()?
            .publish(exchange, routing_key, content, options)
            .await
    }

    /// Broker-confirmed publish; see [`RabbitMQPublisher::publish_confirmed`].
    pub async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publisher()?
            .publish_confirmed(exchange, routing_key, content, options)
            .await
    }

    /// Declares the exchanges not declared yet by this client and binds `queue` to each.
    ///
    /// # Parameters
    /// * `queue` - The queue to bind
    /// * `exchanges` - Exchanges the queue listens to
    pub async fn bind_exchanges(
        &self,
        queue: &str,
        exchanges: &[ExchangeDefinition],
    ) -> Result<(), AmqpError> {
        let session = self.connection.session()?;

        self.binder
            .bind_exchanges(session.topology_channel().as_ref(), queue, exchanges)
            .await
    }

    /// Installs a topology plan on the shared declaration channel.
    pub async fn install_topology(&self, topology: &AmqpTopology) -> Result<(), AmqpError> {
        let session = self.connection.session()?;
        topology.install(session.topology_channel().as_ref()).await
    }
}

impl RabbitClient<LapinDialer> {
    /// Declares a pure queue on its own channel and starts consuming it.
    ///
    /// The returned task runs until the consumer is cancelled or the channel closes.
    ///
    /// # Parameters
    /// * `opts` - Declaration, consume and ack/nack options of the queue
    /// * `handler` - Handler invoked for every delivery
    ///
    /// # Returns
    /// The consumer task
    pub async fn assert_pure_queue(
        &self,
        opts: &PureQueueOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>, AmqpError> {
        let channel = self.consuming_channel(opts.prefetch).await?;

        channel.declare_queue(&opts.queue).await?;

        if !opts.exchanges.is_empty() {
            self.bind_exchanges(&opts.name, &opts.exchanges).await?;
        }

        let consumer = start_consumer(&channel, &opts.name, &opts.consume).await?;
        let policy: Arc<dyn ConsumePolicy> = Arc::new(PureQueueConsumer::new(opts, handler));

        debug!(queue = opts.name.as_str(), "pure queue consumer started");
        Ok(spawn_consumer(consumer, policy))
    }

    /// Declares the main -> retry -> archive graph on its own channel and starts consuming
    /// the main queue.
    ///
    /// # Parameters
    /// * `opts` - Base name, attempts and retry delay of the queue
    /// * `handler` - Handler invoked for every delivery
    ///
    /// # Returns
    /// The consumer task, or `InvalidQueueOptions` when `attempts` is zero
    pub async fn assert_ternary_queue(
        &self,
        opts: &TernaryQueueOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<JoinHandle<()>, AmqpError> {
        opts.validate()?;

        let names = TernaryNames::new(&opts.name);
        let channel = self.consuming_channel(opts.prefetch).await?;

        ternary_topology(&opts.name, opts.ttl_ms)
            .install(&channel)
            .await?;

        if !opts.exchanges.is_empty() {
            self.bind_exchanges(&names.main_queue, &opts.exchanges)
                .await?;
        }

        let consumer =
            start_consumer(&channel, &names.main_queue, &ConsumeOptions::default()).await?;
        let policy: Arc<dyn ConsumePolicy> = Arc::new(TernaryQueueConsumer::new(
            opts,
            handler,
            self.publisher()?,
        ));

        debug!(
            queue = names.main_queue.as_str(),
            attempts = opts.attempts,
            ttl_ms = opts.ttl_ms,
            "ternary queue consumer started"
        );
        Ok(spawn_consumer(consumer, policy))
    }

    /// Opens a dedicated channel for one queue strategy.
    async fn consuming_channel(&self, prefetch: Option<u16>) -> Result<Channel, AmqpError> {
        let session = self.connection.session()?;
        let channel = session.create_channel().await?;

        if let Some(count) = prefetch {
            if let Err(err) = channel
                .basic_qos(count, BasicQosOptions { global: false })
                .await
            {
                error!(error = err.to_string(), "error to configure qos");
                return Err(AmqpError::QoSDeclarationError(err.to_string()));
            }
        }

        Ok(channel)
    }
}

async fn start_consumer(
    channel: &Channel,
    queue: &str,
    opts: &ConsumeOptions,
) -> Result<Consumer, AmqpError> {
    let tag = opts
        .consumer_tag
        .clone()
        .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4()));

    match channel
        .basic_consume(
            queue,
            &tag,
            BasicConsumeOptions {
                no_local: opts.no_local,
                no_ack: opts.no_ack,
                exclusive: opts.exclusive,
                nowait: false,
            },
            opts.arguments.clone(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), queue, "error to create the consumer");
            Err(AmqpError::BindingConsumerError(queue.to_owned()))
        }
        Ok(c) => Ok(c),
    }
}
