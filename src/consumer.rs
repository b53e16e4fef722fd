// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The consume policy engines. Each delivery is decoded, handed to the handler inside a
//! consumer span and then settled according to the strategy:
//!
//! - pure queues apply the configured ack policy on success and nack policy on failure;
//! - ternary queues ack on success, nack into the retry path on failure and archive the
//!   message once the broker's death count reaches the configured attempts.
//!
//! Handler failures, panics included, never leave this module: they are logged with the
//! queue name and turned into a [`Disposition`].

use crate::{
    codec,
    errors::{AmqpError, HandlerError},
    handler::{DeliveryAcker, DeliveryContext, MessageHandler, RawMessage},
    options::{AckPolicy, NackPolicy, PureQueueOptions, TernaryQueueOptions},
    otel,
    publisher::{PublishOptions, RabbitMQPublisher},
    topology::TernaryNames,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::{
    trace::{Span, Status},
    KeyValue,
};
use serde_json::Value;
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// How a delivery ended up once its consume callback finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged after a successful handler run
    Acked,
    /// Nacked with requeue
    Requeued,
    /// Nacked without requeue towards the queue's dead-letter target
    DeadLettered,
    /// Acknowledged although the handler failed
    Skipped,
    /// Left unsettled for manual handling
    Pending,
    /// Nacked into the ternary retry path
    Retried,
    /// Published to the archive queue and acknowledged
    Archived,
    /// Consumed in no-ack mode, the broker already settled it
    BrokerSettled,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Requeued => "requeued",
            Disposition::DeadLettered => "dead-lettered",
            Disposition::Skipped => "skipped",
            Disposition::Pending => "pending",
            Disposition::Retried => "retried",
            Disposition::Archived => "archived",
            Disposition::BrokerSettled => "broker-settled",
        }
    }
}

/// Number of times the broker dead-lettered the message, `0` when the header is absent.
///
/// Only the first `x-death` entry is read: the broker keeps the most recent queue/reason
/// pair first, which for a ternary queue is the main queue rejection.
///
/// # Parameters
/// * `props` - Properties of the delivery
///
/// # Returns
/// The death count, `0` for a first delivery
pub fn death_count(props: &AMQPProperties) -> i64 {
    let Some(headers) = props.headers() else {
        return 0;
    };

    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return 0;
    };

    let Some(AMQPValue::FieldTable(death)) = deaths.as_slice().first() else {
        return 0;
    };

    match death.inner().get(AMQP_HEADERS_COUNT) {
        Some(AMQPValue::LongLongInt(count)) => *count,
        Some(AMQPValue::LongInt(count)) => i64::from(*count),
        Some(AMQPValue::LongUInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortUInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortShortInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortShortUInt(count)) => i64::from(*count),
        _ => 0,
    }
}

/// A consume strategy bound to one queue.
#[async_trait]
pub(crate) trait ConsumePolicy: Send + Sync {
    /// The queue the strategy consumes from.
    fn queue(&self) -> &str;

    /// Handles one delivery and settles it.
    async fn consume(
        &self,
        message: RawMessage,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Result<Disposition, AmqpError>;
}

/// Runs the handler, turning a panic into a handler failure.
async fn invoke(
    handler: &dyn MessageHandler,
    payload: Value,
    ctx: DeliveryContext,
) -> Result<Value, HandlerError> {
    match AssertUnwindSafe(handler.handle(payload, ctx))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => Err(HandlerError::new("handler panicked")),
    }
}

fn finish_span<S: Span>(span: &mut S, result: &Result<Disposition, AmqpError>) {
    match result {
        Ok(disposition) => {
            span.set_attribute(KeyValue::new(
                "messaging.rabbitmq.disposition",
                disposition.as_str(),
            ));
            span.set_status(Status::Ok);
        }
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
    span.end();
}

/// Pure queue engine: ack policy on success, nack policy on failure.
pub(crate) struct PureQueueConsumer {
    queue: String,
    ack_policy: AckPolicy,
    nack_policy: NackPolicy,
    no_ack: bool,
    handler: Arc<dyn MessageHandler>,
}

impl PureQueueConsumer {
    pub(crate) fn new(opts: &PureQueueOptions, handler: Arc<dyn MessageHandler>) -> Self {
        PureQueueConsumer {
            queue: opts.name.clone(),
            ack_policy: opts.consume.ack_policy,
            nack_policy: opts.consume.nack_policy,
            no_ack: opts.consume.no_ack,
            handler,
        }
    }

    async fn on_success(&self, acker: &dyn DeliveryAcker) -> Result<Disposition, AmqpError> {
        match self.ack_policy {
            AckPolicy::Auto => {
                acker.ack().await?;
                Ok(Disposition::Acked)
            }
            AckPolicy::Off => Ok(Disposition::Pending),
        }
    }

    async fn on_failure(&self, acker: &dyn DeliveryAcker) -> Result<Disposition, AmqpError> {
        match self.nack_policy {
            NackPolicy::Requeue => {
                acker.nack(true).await?;
                Ok(Disposition::Requeued)
            }
            NackPolicy::Dlx => {
                acker.nack(false).await?;
                Ok(Disposition::DeadLettered)
            }
            NackPolicy::Skip => {
                acker.ack().await?;
                Ok(Disposition::Skipped)
            }
            NackPolicy::Off => Ok(Disposition::Pending),
        }
    }
}

#[async_trait]
impl ConsumePolicy for PureQueueConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn consume(
        &self,
        message: RawMessage,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Result<Disposition, AmqpError> {
        let (trace, mut span) = otel::consumer_span(&message.properties, &self.queue);

        debug!(
            queue = self.queue.as_str(),
            delivery_tag = message.delivery_tag,
            "message received"
        );

        let payload = codec::decode(&message.data);
        let ctx = DeliveryContext {
            queue: self.queue.clone(),
            message: Arc::new(message),
            acker: acker.clone(),
            trace,
        };

        let outcome = invoke(self.handler.as_ref(), payload, ctx).await;

        let result = if self.no_ack {
            Ok(Disposition::BrokerSettled)
        } else {
            match outcome {
                Ok(_) => self.on_success(acker.as_ref()).await,
                Err(err) => {
                    warn!(
                        error = err.message(),
                        queue = self.queue.as_str(),
                        "error whiling handling msg"
                    );
                    span.record_error(&err);
                    self.on_failure(acker.as_ref()).await
                }
            }
        };

        if let Ok(disposition) = &result {
            debug!(
                queue = self.queue.as_str(),
                disposition = disposition.as_str(),
                "message settled"
            );
        }

        finish_span(&mut span, &result);
        result
    }
}

/// Ternary queue engine over the main -> retry -> archive graph.
pub(crate) struct TernaryQueueConsumer {
    names: TernaryNames,
    attempts: u32,
    handler: Arc<dyn MessageHandler>,
    publisher: RabbitMQPublisher,
}

impl TernaryQueueConsumer {
    pub(crate) fn new(
        opts: &TernaryQueueOptions,
        handler: Arc<dyn MessageHandler>,
        publisher: RabbitMQPublisher,
    ) -> Self {
        TernaryQueueConsumer {
            names: TernaryNames::new(&opts.name),
            attempts: opts.attempts,
            handler,
            publisher,
        }
    }

    /// Moves an exhausted message to the archive queue.
    ///
    /// If the archive publish fails the message goes through the retry path once more
    /// and archiving is attempted again on its next arrival.
    async fn archive(
        &self,
        message: &RawMessage,
        acker: &dyn DeliveryAcker,
    ) -> Result<Disposition, AmqpError> {
        error!(
            queue = self.names.main_queue.as_str(),
            attempts = self.attempts,
            "too many attempts, archiving message"
        );

        let content = codec::encode(&codec::decode(&message.data));
        let options = PublishOptions::new().persistent();

        match self
            .publisher
            .publish_confirmed("", &self.names.archive_queue, &content, &options)
            .await
        {
            Ok(()) => {
                acker.ack().await?;
                Ok(Disposition::Archived)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.names.archive_queue.as_str(),
                    "error whiling archiving msg"
                );
                acker.nack(false).await?;
                Err(AmqpError::PublishingToArchiveError(
                    self.names.archive_queue.clone(),
                ))
            }
        }
    }
}

#[async_trait]
impl ConsumePolicy for TernaryQueueConsumer {
    fn queue(&self) -> &str {
        &self.names.main_queue
    }

    async fn consume(
        &self,
        message: RawMessage,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Result<Disposition, AmqpError> {
        let queue = self.names.main_queue.as_str();
        let count = death_count(&message.properties);
        let attempt = count + 1;

        let (trace, mut span) = otel::consumer_span(&message.properties, queue);
        span.set_attribute(KeyValue::new("messaging.rabbitmq.attempt", attempt));

        if count >= i64::from(self.attempts) {
            let result = self.archive(&message, acker.as_ref()).await;
            finish_span(&mut span, &result);
            return result;
        }

        debug!(
            queue,
            attempt,
            attempts = self.attempts,
            delivery_tag = message.delivery_tag,
            "message received"
        );

        let payload = codec::decode(&message.data);
        let ctx = DeliveryContext {
            queue: queue.to_owned(),
            message: Arc::new(message),
            acker: acker.clone(),
            trace,
        };

        let result = match invoke(self.handler.as_ref(), payload, ctx).await {
            Ok(_) => acker.ack().await.map(|_| Disposition::Acked),
            Err(err) => {
                warn!(
                    error = err.message(),
                    queue,
                    attempt,
                    attempts = self.attempts,
                    "error whiling handling msg, requeuing for latter"
                );
                span.record_error(&err);
                acker.nack(false).await.map(|_| Disposition::Retried)
            }
        };

        finish_span(&mut span, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{handler_fn, MockDeliveryAcker},
        options::ConsumeOptions,
        publisher::{ChannelEvent, MockConfirmChannel, PublishConfirm},
    };
    use futures_util::future;
    use lapin::{
        types::{FieldArray, FieldTable, ShortString},
        BasicProperties,
    };
    use mockall::predicate::{always, eq};
    use serde_json::json;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::sync::broadcast;

    fn with_deaths(count: AMQPValue) -> BasicProperties {
        let mut death = FieldTable::default();
        death.insert(ShortString::from(AMQP_HEADERS_COUNT), count);
        death.insert(
            ShortString::from("queue"),
            AMQPValue::LongString("orders.main.queue".into()),
        );

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(death)])),
        );

        BasicProperties::default().with_headers(headers)
    }

    fn message(count: i64) -> RawMessage {
        let msg = RawMessage::new(br#"{"id":7}"#);
        if count == 0 {
            return msg;
        }
        msg.with_properties(with_deaths(AMQPValue::LongLongInt(count)))
    }

    /// Handler failing `failures` times before succeeding, counting every call.
    fn flaky_handler(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |payload, _ctx| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    return Err(HandlerError::new("not yet"));
                }
                Ok(payload)
            }
        })
    }

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _: Value, _: DeliveryContext) -> Result<Value, HandlerError> {
            panic!("handler blew up")
        }
    }

    /// Acker recording every settlement, used to drive whole retry cycles.
    #[derive(Default)]
    struct RecordingAcker {
        settlements: Mutex<Vec<&'static str>>,
    }

    impl RecordingAcker {
        fn settlements(&self) -> Vec<&'static str> {
            self.settlements.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.settlements.lock().unwrap().push("ack");
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            self.settlements
                .lock()
                .unwrap()
                .push(if requeue { "nack-requeue" } else { "nack" });
            Ok(())
        }
    }

    fn pure(consume: ConsumeOptions, handler: Arc<dyn MessageHandler>) -> PureQueueConsumer {
        PureQueueConsumer::new(&PureQueueOptions::new("billing").consume(consume), handler)
    }

    fn archive_channel(
        archived: Arc<AtomicUsize>,
        confirm: Result<(), AmqpError>,
    ) -> MockConfirmChannel {
        let (events, _) = broadcast::channel::<ChannelEvent>(8);
        let mut channel = MockConfirmChannel::new();
        channel
            .expect_subscribe()
            .returning(move || events.subscribe());
        channel
            .expect_basic_publish()
            .with(eq(""), eq("orders.archive.queue"), always(), always())
            .returning(move |_, _, content, _| {
                assert_eq!(codec::decode(content), json!({"id": 7}));
                archived.fetch_add(1, Ordering::SeqCst);
                Ok(PublishConfirm::acked())
            });
        channel
            .expect_wait_for_confirms()
            .returning(move || Box::pin(future::ready(confirm.clone())));
        channel
    }

    fn ternary(
        attempts: u32,
        handler: Arc<dyn MessageHandler>,
        channel: MockConfirmChannel,
    ) -> TernaryQueueConsumer {
        TernaryQueueConsumer::new(
            &TernaryQueueOptions::new("orders").attempts(attempts),
            handler,
            RabbitMQPublisher::new(Arc::new(channel)),
        )
    }

    #[test]
    fn death_count_defaults_to_zero() {
        assert_eq!(death_count(&BasicProperties::default()), 0);
        assert_eq!(
            death_count(&BasicProperties::default().with_headers(FieldTable::default())),
            0
        );
    }

    #[test]
    fn death_count_accepts_integer_widths() {
        assert_eq!(death_count(&with_deaths(AMQPValue::LongLongInt(4))), 4);
        assert_eq!(death_count(&with_deaths(AMQPValue::LongInt(2))), 2);
        assert_eq!(death_count(&with_deaths(AMQPValue::ShortUInt(1))), 1);
        assert_eq!(
            death_count(&with_deaths(AMQPValue::LongString("3".into()))),
            0
        );
    }

    #[tokio::test]
    async fn pure_success_with_auto_ack_acks() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let calls = Arc::new(AtomicUsize::new(0));
        let consumer = pure(Default::default(), flaky_handler(0, calls.clone()));

        let result = consumer.consume(message(0), Arc::new(acker)).await;

        assert_eq!(result, Ok(Disposition::Acked));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pure_success_with_ack_off_stays_pending() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let consumer = pure(
            ConsumeOptions::new().ack_policy(AckPolicy::Off),
            flaky_handler(0, Arc::new(AtomicUsize::new(0))),
        );

        assert_eq!(
            consumer.consume(message(0), Arc::new(acker)).await,
            Ok(Disposition::Pending)
        );
    }

    #[tokio::test]
    async fn pure_failure_follows_the_nack_policy() {
        let cases = [
            (NackPolicy::Requeue, Some(true), false, Disposition::Requeued),
            (NackPolicy::Dlx, Some(false), false, Disposition::DeadLettered),
            (NackPolicy::Skip, None, true, Disposition::Skipped),
            (NackPolicy::Off, None, false, Disposition::Pending),
        ];

        for (policy, nack, ack, expected) in cases {
            let mut acker = MockDeliveryAcker::new();
            match nack {
                Some(requeue) => {
                    acker
                        .expect_nack()
                        .with(eq(requeue))
                        .times(1)
                        .returning(|_| Ok(()));
                }
                None => {
                    acker.expect_nack().never();
                }
            }
            acker.expect_ack().times(usize::from(ack)).returning(|| Ok(()));

            let consumer = pure(
                ConsumeOptions::new().nack_policy(policy),
                flaky_handler(1, Arc::new(AtomicUsize::new(0))),
            );

            assert_eq!(
                consumer.consume(message(0), Arc::new(acker)).await,
                Ok(expected),
                "policy {:?}",
                policy
            );
        }
    }

    #[tokio::test]
    async fn pure_no_ack_applies_no_policy() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker.expect_nack().never();

        let consumer = pure(
            ConsumeOptions::new()
                .no_ack()
                .nack_policy(NackPolicy::Requeue),
            flaky_handler(1, Arc::new(AtomicUsize::new(0))),
        );

        assert_eq!(
            consumer.consume(message(0), Arc::new(acker)).await,
            Ok(Disposition::BrokerSettled)
        );
    }

    #[tokio::test]
    async fn pure_ack_failure_is_reported() {
        let mut acker = MockDeliveryAcker::new();
        acker
            .expect_ack()
            .returning(|| Err(AmqpError::AckMessageError));

        let consumer = pure(
            ConsumeOptions::default(),
            flaky_handler(0, Arc::new(AtomicUsize::new(0))),
        );

        assert_eq!(
            consumer.consume(message(0), Arc::new(acker)).await,
            Err(AmqpError::AckMessageError)
        );
    }

    #[tokio::test]
    async fn handler_panic_is_a_failure() {
        let mut acker = MockDeliveryAcker::new();
        acker
            .expect_nack()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));

        let consumer = pure(
            ConsumeOptions::new().nack_policy(NackPolicy::Requeue),
            Arc::new(PanickingHandler),
        );

        assert_eq!(
            consumer.consume(message(0), Arc::new(acker)).await,
            Ok(Disposition::Requeued)
        );
    }

    #[tokio::test]
    async fn handler_receives_decoded_payload_and_context() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().returning(|| Ok(()));

        let handler = handler_fn(|payload, ctx| async move {
            assert_eq!(payload, json!({"id": 7}));
            assert_eq!(ctx.queue, "billing");
            assert_eq!(ctx.message.data, br#"{"id":7}"#.to_vec());
            Ok::<_, HandlerError>(Value::Null)
        });

        let consumer = pure(Default::default(), handler);
        assert_eq!(
            consumer.consume(message(0), Arc::new(acker)).await,
            Ok(Disposition::Acked)
        );
    }

    #[tokio::test]
    async fn ternary_success_acks() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let archived = Arc::new(AtomicUsize::new(0));
        let consumer = ternary(
            3,
            flaky_handler(0, Arc::new(AtomicUsize::new(0))),
            archive_channel(archived.clone(), Ok(())),
        );

        assert_eq!(
            consumer.consume(message(1), Arc::new(acker)).await,
            Ok(Disposition::Acked)
        );
        assert_eq!(archived.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ternary_failure_nacks_without_requeue() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        let consumer = ternary(
            3,
            flaky_handler(1, Arc::new(AtomicUsize::new(0))),
            archive_channel(Arc::new(AtomicUsize::new(0)), Ok(())),
        );

        assert_eq!(
            consumer.consume(message(2), Arc::new(acker)).await,
            Ok(Disposition::Retried)
        );
    }

    #[tokio::test]
    async fn ternary_exhausted_message_is_archived_without_invoking_the_handler() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let calls = Arc::new(AtomicUsize::new(0));
        let archived = Arc::new(AtomicUsize::new(0));
        let consumer = ternary(
            3,
            flaky_handler(0, calls.clone()),
            archive_channel(archived.clone(), Ok(())),
        );

        assert_eq!(
            consumer.consume(message(3), Arc::new(acker)).await,
            Ok(Disposition::Archived)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(archived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ternary_archive_failure_sends_the_message_around_again() {
        let mut acker = MockDeliveryAcker::new();
        acker.expect_ack().never();
        acker
            .expect_nack()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        let consumer = ternary(
            1,
            flaky_handler(0, Arc::new(AtomicUsize::new(0))),
            archive_channel(
                Arc::new(AtomicUsize::new(0)),
                Err(AmqpError::ChannelClosed("gone".to_owned())),
            ),
        );

        assert_eq!(
            consumer.consume(message(1), Arc::new(acker)).await,
            Err(AmqpError::PublishingToArchiveError(
                "orders.archive.queue".to_owned()
            ))
        );
    }

    /// Feeds the message through the consumer the way the broker would, bumping the death
    /// count on every rejection, until it leaves the cycle.
    async fn run_cycle(consumer: &TernaryQueueConsumer) -> (Disposition, Vec<&'static str>) {
        let acker = Arc::new(RecordingAcker::default());
        let mut count = 0;

        loop {
            let disposition = consumer
                .consume(message(count), acker.clone())
                .await
                .unwrap();

            if disposition != Disposition::Retried {
                return (disposition, acker.settlements());
            }
            count += 1;
        }
    }

    #[tokio::test]
    async fn always_failing_handler_runs_exactly_attempts_times_then_archives_once() {
        for attempts in 1..=5 {
            let calls = Arc::new(AtomicUsize::new(0));
            let archived = Arc::new(AtomicUsize::new(0));
            let consumer = ternary(
                attempts,
                flaky_handler(usize::MAX, calls.clone()),
                archive_channel(archived.clone(), Ok(())),
            );

            let (disposition, settlements) = run_cycle(&consumer).await;

            assert_eq!(disposition, Disposition::Archived);
            assert_eq!(calls.load(Ordering::SeqCst), attempts as usize);
            assert_eq!(archived.load(Ordering::SeqCst), 1);
            assert_eq!(settlements.len(), attempts as usize + 1);
            assert_eq!(settlements.last(), Some(&"ack"));
        }
    }

    #[tokio::test]
    async fn handler_recovering_before_the_limit_is_never_archived() {
        let attempts = 4;

        for failures in 0..attempts as usize {
            let calls = Arc::new(AtomicUsize::new(0));
            let archived = Arc::new(AtomicUsize::new(0));
            let consumer = ternary(
                attempts,
                flaky_handler(failures, calls.clone()),
                archive_channel(archived.clone(), Ok(())),
            );

            let (disposition, _) = run_cycle(&consumer).await;

            assert_eq!(disposition, Disposition::Acked);
            assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
            assert_eq!(archived.load(Ordering::SeqCst), 0);
        }
    }
}
