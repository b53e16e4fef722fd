// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! `RabbitTransport` is the consuming side of the crate. Queue strategies are registered
//! together with their handlers; `listen` connects the shared client, sets every
//! registration up in registration order and then emits the `connect` event.
//!
//! Each strategy consumes on its own channel in its own task. Deliveries of one queue
//! are processed one after the other, in broker delivery order.

use crate::{
    client::RabbitClient,
    config::ConnectionParams,
    consumer::ConsumePolicy,
    errors::AmqpError,
    events::{EventKind, EventRegistry, ListenerResult, TransportEvent},
    handler::{DeliveryAcker, MessageHandler, RawMessage},
    options::{PureQueueOptions, QueueStrategy, TernaryQueueOptions},
};
use futures_util::StreamExt;
use lapin::Consumer;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Drives `consumer` through `policy` until the stream ends.
pub(crate) fn spawn_consumer(
    mut consumer: Consumer,
    policy: Arc<dyn ConsumePolicy>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let (message, acker) = RawMessage::from_delivery(delivery);
                    let acker: Arc<dyn DeliveryAcker> = Arc::new(acker);

                    if let Err(err) = policy.consume(message, acker).await {
                        error!(
                            error = err.to_string(),
                            queue = policy.queue(),
                            "error consume msg"
                        );
                    }
                }

                Err(err) => error!(error = err.to_string(), "errors consume msg"),
            }
        }

        debug!(queue = policy.queue(), "consumer stream ended");
    })
}

/// A queue strategy and the handler consuming it.
#[derive(Clone)]
pub struct QueueRegistration {
    pub strategy: QueueStrategy,
    pub handler: Arc<dyn MessageHandler>,
}

pub struct RabbitTransport {
    client: Arc<RabbitClient>,
    registrations: Vec<QueueRegistration>,
    events: EventRegistry,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl RabbitTransport {
    pub fn new(params: ConnectionParams) -> Self {
        RabbitTransport::with_client(Arc::new(RabbitClient::new(params)))
    }

    /// Transport sharing an existing client, and therefore its connection.
    pub fn with_client(client: Arc<RabbitClient>) -> Self {
        RabbitTransport {
            client,
            registrations: vec![],
            events: EventRegistry::with_default_listeners(),
            consumers: Mutex::new(vec![]),
        }
    }

    pub fn register(mut self, strategy: QueueStrategy, handler: Arc<dyn MessageHandler>) -> Self {
        self.registrations
            .push(QueueRegistration { strategy, handler });
        self
    }

    pub fn pure_queue(self, opts: PureQueueOptions, handler: Arc<dyn MessageHandler>) -> Self {
        self.register(QueueStrategy::Pure(opts), handler)
    }

    pub fn ternary_queue(
        self,
        opts: TernaryQueueOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.register(QueueStrategy::Ternary(opts), handler)
    }

    pub fn registrations(&self) -> &[QueueRegistration] {
        &self.registrations
    }

    /// Adds an event listener; earlier listeners are kept.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TransportEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.events.on(kind, listener);
    }

    /// Connects, sets every registered strategy up and emits `connect`.
    ///
    /// Options are validated before dialing. Any failure aborts startup and is returned;
    /// consumers already started are stopped and the connection is closed again, without
    /// a `disconnect` event.
    ///
    /// # Returns
    ///
    /// `Ok` once every strategy consumes, otherwise the first setup error.
    pub async fn listen(&self) -> Result<(), AmqpError> {
        for registration in &self.registrations {
            if let QueueStrategy::Ternary(opts) = &registration.strategy {
                opts.validate()?;
            }
        }

        self.client.connect().await?;

        if let Err(err) = self.start_consumers().await {
            error!(error = err.to_string(), "error setting queues up, closing");
            if let Err(close_err) = self.teardown().await {
                error!(error = close_err.to_string(), "error closing after failed setup");
            }
            return Err(err);
        }

        let params = self.client.params();
        self.events.emit(&TransportEvent::Connect {
            host: params.host.clone(),
            port: params.port,
        });

        Ok(())
    }

    /// Stops every consumer, closes the shared connection and emits `disconnect`.
    pub async fn close(&self, reason: Option<&str>) -> Result<(), AmqpError> {
        self.teardown().await?;

        self.events.emit(&TransportEvent::Disconnect {
            reason: reason.map(str::to_owned),
        });

        Ok(())
    }

    pub fn client(&self) -> Arc<RabbitClient> {
        self.client.clone()
    }

    async fn start_consumers(&self) -> Result<(), AmqpError> {
        for registration in &self.registrations {
            let handler = registration.handler.clone();
            let handle = match &registration.strategy {
                QueueStrategy::Pure(opts) => self.client.assert_pure_queue(opts, handler).await?,
                QueueStrategy::Ternary(opts) => {
                    self.client.assert_ternary_queue(opts, handler).await?
                }
            };

            self.track(handle);
        }

        Ok(())
    }

    /// Aborts the consumer tasks and closes the shared connection.
    async fn teardown(&self) -> Result<(), AmqpError> {
        let handles = match self.consumers.lock() {
            Ok(mut consumers) => std::mem::take(&mut *consumers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        for handle in handles {
            handle.abort();
        }

        self.client.close().await
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.consumers.lock() {
            Ok(mut consumers) => consumers.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::HandlerError, handler::handler_fn};
    use futures_util::future;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_, _| async { Ok::<_, HandlerError>(Value::Null) })
    }

    #[test]
    fn registrations_keep_their_order() {
        let transport = RabbitTransport::new(ConnectionParams::default())
            .ternary_queue(TernaryQueueOptions::new("orders"), noop())
            .pure_queue(PureQueueOptions::new("billing"), noop());

        let names = transport
            .registrations()
            .iter()
            .map(|r| r.strategy.name())
            .collect::<Vec<_>>();

        assert_eq!(names, vec!["orders", "billing"]);
    }

    #[tokio::test]
    async fn invalid_options_fail_before_dialing() {
        let transport = RabbitTransport::new(ConnectionParams::default())
            .ternary_queue(TernaryQueueOptions::new("orders").attempts(0), noop());

        let result = transport.listen().await;

        assert!(matches!(result, Err(AmqpError::InvalidQueueOptions(_))));
        assert!(!transport.client().is_connected());
    }

    #[tokio::test]
    async fn teardown_stops_started_consumers_without_emitting() {
        let transport = RabbitTransport::new(ConnectionParams::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        transport.on(EventKind::Disconnect, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let held = Arc::new(());
        let task_held = held.clone();
        transport.track(tokio::spawn(async move {
            let _held = task_held;
            future::pending::<()>().await;
        }));

        transport.teardown().await.unwrap();
        for _ in 0..10 {
            if Arc::strong_count(&held) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(Arc::strong_count(&held), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert!(!transport.client().is_connected());
    }

    #[tokio::test]
    async fn close_without_connection_still_emits_disconnect() {
        let transport = RabbitTransport::new(ConnectionParams::default());
        let reasons = Arc::new(Mutex::new(vec![]));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let (r, d) = (reasons.clone(), disconnects.clone());
        transport.on(EventKind::Disconnect, move |event| {
            if let TransportEvent::Disconnect { reason } = event {
                r.lock().unwrap().push(reason.clone());
            }
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        transport.close(Some("shutdown")).await.unwrap();

        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            reasons.lock().unwrap().as_slice(),
            &[Some("shutdown".to_owned())]
        );
    }
}
