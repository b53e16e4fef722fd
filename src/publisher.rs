// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing goes through the single confirm channel owned by the connection. Two
//! flavours are offered:
//!
//! - `publish`: returns once the frames were accepted by the channel. Writing suspends
//!   while the channel applies back-pressure.
//! - `publish_confirmed`: sets `mandatory`, then races broker confirmation against
//!   channel errors, closure, returned messages and a deadline (see [`crate::confirm`]).
//!
//! The confirmation wait is channel-wide: a call settles once every outstanding publish on
//! the channel is confirmed. The verdict is then read from the call's own confirm, so a
//! message the broker returned is reported as `Unroutable` even when another publish was
//! confirmed alongside it.

use crate::{confirm::ConfirmWait, errors::AmqpError, otel};
use async_trait::async_trait;
use futures_util::future::{self, BoxFuture};
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Deadline for broker confirmation of a confirmed publish.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_millis(5000);

/// AMQP delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Header values accepted on outbound messages.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    Uint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
}

/// Per-publish options layered over the channel defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub persistent: bool,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds
    pub expiration: Option<u64>,
    pub priority: Option<u8>,
    pub headers: HashMap<String, HeaderValue>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn expiration(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Builds the AMQP properties, injecting the current trace context in the headers.
    pub(crate) fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut btree);
        header_table(&self.headers, &mut btree);

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(btree));

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.as_str()));
        }
        if let Some(msg_type) = &self.msg_type {
            props = props.with_type(ShortString::from(msg_type.as_str()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.as_str()));
        }
        if let Some(expiration) = self.expiration {
            props = props.with_expiration(ShortString::from(expiration.to_string()));
        }
        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }
        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

/// Converts the option headers into AMQP header values.
fn header_table(
    headers: &HashMap<String, HeaderValue>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.as_str())),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
            HeaderValue::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(*v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }
}

/// Asynchronous channel signals observed while a confirmed publish is pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel level error reported by the broker
    Error(String),
    /// The channel or its connection went away
    Closed(String),
}

/// The broker's verdict on a single publish.
///
/// Resolves to `Unroutable` when the message came back, `BrokerError` when it was nacked
/// and `Ok` once it was acked. Dropping it leaves the verdict to the channel-wide wait.
pub struct PublishConfirm(BoxFuture<'static, Result<(), AmqpError>>);

impl PublishConfirm {
    pub fn new(
        verdict: impl std::future::Future<Output = Result<(), AmqpError>> + Send + 'static,
    ) -> PublishConfirm {
        PublishConfirm(Box::pin(verdict))
    }

    /// A verdict that is already an ack.
    pub fn acked() -> PublishConfirm {
        PublishConfirm::new(future::ready(Ok(())))
    }

    pub(crate) fn into_verdict(self) -> BoxFuture<'static, Result<(), AmqpError>> {
        self.0
    }
}

/// The confirm-mode channel used for every outbound publish.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmChannel: Send + Sync {
    /// Writes a message, suspending while the channel is back-pressured.
    ///
    /// # Returns
    /// The publish's own confirm once the frames were handed to the connection.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishConfirm, AmqpError>;

    /// Resolves once every outstanding publish on the channel is confirmed.
    fn wait_for_confirms(&self) -> BoxFuture<'static, Result<(), AmqpError>>;

    /// New subscription to the channel's error and close signals.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

/// Publisher bound to the shared confirm channel.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    channel: Arc<dyn ConfirmChannel>,
    confirm_timeout: Duration,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<dyn ConfirmChannel>) -> RabbitMQPublisher {
        RabbitMQPublisher {
            channel,
            confirm_timeout: CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Publishes without waiting for the broker.
    ///
    /// Returns once the message is in the channel's write buffer; nothing beyond that is
    /// guaranteed.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `""` for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `content` - Encoded body
    /// * `options` - Message properties and flags
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(exchange, routing_key, content, options)
            .await
            .map(drop)
    }

    /// Publishes with `mandatory` set and waits for the broker's verdict.
    ///
    /// A timed out publish may still reach the broker; it is not retried here.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `""` for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `content` - Encoded body
    /// * `options` - Message properties; `mandatory` is always set
    ///
    /// # Returns
    /// `Ok` once the broker confirmed the message, otherwise `Unroutable`, `ChannelClosed`,
    /// `BrokerError` or `PublishTimeout`.
    pub async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let options = options.clone().mandatory();

        // armed before writing so signals raised during the write are not missed
        let wait = ConfirmWait::arm(self.channel.as_ref(), self.confirm_timeout);

        let own = self
            .channel
            .basic_publish(exchange, routing_key, content, &options)
            .await?;

        match wait.settle(self.channel.wait_for_confirms(), own).await {
            Ok(()) => {
                debug!(exchange, routing_key, "publish confirmed");
                Ok(())
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "confirmed publish failed"
                );
                Err(err)
            }
        }
    }
}

/// `ConfirmChannel` over a lapin channel in confirm mode.
pub struct LapinConfirmChannel {
    channel: Channel,
    events: broadcast::Sender<ChannelEvent>,
}

impl LapinConfirmChannel {
    pub(crate) fn new(channel: Channel, events: broadcast::Sender<ChannelEvent>) -> Self {
        LapinConfirmChannel { channel, events }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

/// Maps a lapin failure raised while publishing or confirming to the publish taxonomy.
pub(crate) fn classify_error(err: &lapin::Error) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => AmqpError::ChannelClosed(err.to_string()),
        _ => AmqpError::BrokerError(err.to_string()),
    }
}

/// Maps a failed write: a closed channel or connection is `ChannelClosed`, anything else
/// is a plain `PublishingError`.
pub(crate) fn publish_error(err: &lapin::Error) -> AmqpError {
    match classify_error(err) {
        closed @ AmqpError::ChannelClosed(_) => closed,
        _ => AmqpError::PublishingError,
    }
}

#[async_trait]
impl ConfirmChannel for LapinConfirmChannel {
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: &[u8],
        options: &PublishOptions,
    ) -> Result<PublishConfirm, AmqpError> {
        // lapin only resolves this once the frames were handed to the connection, which
        // is where back-pressure suspends the caller
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: options.mandatory,
                },
                content,
                options.properties(&Context::current()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                return Err(publish_error(&err));
            }
            Ok(confirm) => confirm,
        };

        // lapin hands a returned message to the confirm of the publish it belongs to
        Ok(PublishConfirm::new(async move {
            match confirm.await {
                Ok(Confirmation::Ack(Some(returned))) | Ok(Confirmation::Nack(Some(returned))) => {
                    warn!(
                        routing_key = returned.delivery.routing_key.as_str(),
                        reply_text = returned.reply_text.as_str(),
                        "message returned by the broker"
                    );
                    Err(AmqpError::Unroutable(
                        returned.delivery.routing_key.to_string(),
                    ))
                }
                Ok(Confirmation::Nack(None)) => {
                    Err(AmqpError::BrokerError("publish nacked by broker".to_owned()))
                }
                Ok(_) => Ok(()),
                Err(err) => Err(classify_error(&err)),
            }
        }))
    }

    fn wait_for_confirms(&self) -> BoxFuture<'static, Result<(), AmqpError>> {
        let channel = self.channel.clone();

        Box::pin(async move {
            match channel.wait_for_confirms().await {
                Ok(returned) => {
                    // returns of fire-and-forget publishes whose confirm was dropped
                    for msg in returned {
                        warn!(
                            routing_key = msg.delivery.routing_key.as_str(),
                            reply_text = msg.reply_text.as_str(),
                            "unconfirmed publish returned by the broker"
                        );
                    }
                    Ok(())
                }
                Err(err) => Err(classify_error(&err)),
            }
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;
    use mockall::predicate::{always, eq, function};

    fn channel_with_events(
        events: &broadcast::Sender<ChannelEvent>,
    ) -> MockConfirmChannel {
        let mut channel = MockConfirmChannel::new();
        let tx = events.clone();
        channel.expect_subscribe().returning(move || tx.subscribe());
        channel
    }

    #[tokio::test]
    async fn publish_passes_caller_options_through() {
        let mut channel = MockConfirmChannel::new();
        channel
            .expect_basic_publish()
            .with(
                eq("orders"),
                eq("orders.created"),
                function(|content: &[u8]| content == b"{}"),
                function(|opts: &PublishOptions| !opts.mandatory && opts.persistent),
            )
            .times(1)
            .returning(|_, _, _, _| Ok(PublishConfirm::acked()));
        channel.expect_wait_for_confirms().never();

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        publisher
            .publish(
                "orders",
                "orders.created",
                b"{}",
                &PublishOptions::new().persistent(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn confirmed_publish_forces_mandatory_and_succeeds_on_confirm() {
        let (events, _) = broadcast::channel(8);
        let mut channel = channel_with_events(&events);
        channel
            .expect_basic_publish()
            .with(always(), always(), always(), function(|o: &PublishOptions| o.mandatory))
            .times(1)
            .returning(|_, _, _, _| Ok(PublishConfirm::acked()));
        channel
            .expect_wait_for_confirms()
            .times(1)
            .returning(|| Box::pin(future::ready(Ok(()))));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));

        assert_eq!(
            publisher
                .publish_confirmed("", "jobs", b"payload", &PublishOptions::new())
                .await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn write_failure_skips_the_confirm_wait() {
        let (events, _) = broadcast::channel(8);
        let mut channel = channel_with_events(&events);
        channel
            .expect_basic_publish()
            .returning(|_, _, _, _| Err(AmqpError::PublishingError));
        channel.expect_wait_for_confirms().never();

        let publisher = RabbitMQPublisher::new(Arc::new(channel));

        assert_eq!(
            publisher
                .publish_confirmed("", "jobs", b"payload", &PublishOptions::new())
                .await,
            Err(AmqpError::PublishingError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_publish_times_out_after_five_seconds() {
        let (events, _) = broadcast::channel(8);
        let mut channel = channel_with_events(&events);
        channel.expect_basic_publish().returning(|_, _, _, _| Ok(PublishConfirm::acked()));
        channel
            .expect_wait_for_confirms()
            .returning(|| Box::pin(future::pending()));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let started = tokio::time::Instant::now();

        let result = publisher
            .publish_confirmed("", "jobs", b"payload", &PublishOptions::new())
            .await;

        assert_eq!(result, Err(AmqpError::PublishTimeout(5000)));
        assert!(started.elapsed() >= CONFIRM_TIMEOUT);
    }

    #[tokio::test]
    async fn return_carried_by_the_own_confirm_is_unroutable() {
        let (events, _) = broadcast::channel(8);
        let mut channel = channel_with_events(&events);
        channel.expect_basic_publish().returning(|_, routing_key, _, _| {
            let routing_key = routing_key.to_owned();
            // the verdict is only ready after the channel-wide wait has been polled
            Ok(PublishConfirm::new(async move {
                tokio::task::yield_now().await;
                Err(AmqpError::Unroutable(routing_key))
            }))
        });
        channel
            .expect_wait_for_confirms()
            .returning(|| Box::pin(future::ready(Ok(()))));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));

        assert_eq!(
            publisher
                .publish_confirmed("events", "nowhere", b"x", &PublishOptions::new())
                .await,
            Err(AmqpError::Unroutable("nowhere".to_owned()))
        );
    }

    #[tokio::test]
    async fn nacked_publish_is_a_broker_error() {
        let (events, _) = broadcast::channel(8);
        let mut channel = channel_with_events(&events);
        channel.expect_basic_publish().returning(|_, _, _, _| {
            Ok(PublishConfirm::new(future::ready(Err(AmqpError::BrokerError(
                "publish nacked by broker".to_owned(),
            )))))
        });
        channel
            .expect_wait_for_confirms()
            .returning(|| Box::pin(future::ready(Ok(()))));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));

        assert!(matches!(
            publisher
                .publish_confirmed("", "jobs", b"x", &PublishOptions::new())
                .await,
            Err(AmqpError::BrokerError(_))
        ));
    }

    #[test]
    fn write_on_a_closed_channel_is_channel_closed() {
        let closed = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        assert!(matches!(
            publish_error(&closed),
            AmqpError::ChannelClosed(_)
        ));

        let closing = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closing);
        assert!(matches!(
            publish_error(&closing),
            AmqpError::ChannelClosed(_)
        ));

        assert_eq!(
            publish_error(&lapin::Error::ChannelsLimitReached),
            AmqpError::PublishingError
        );
    }

    #[test]
    fn properties_carry_options_and_headers() {
        let props = PublishOptions::new()
            .persistent()
            .content_type(JSON_CONTENT_TYPE)
            .message_id("msg-1")
            .expiration(1500)
            .header("tenant", HeaderValue::LongString("acme".to_owned()))
            .properties(&Context::new());

        assert_eq!(props.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type(),
            &Some(ShortString::from(JSON_CONTENT_TYPE))
        );
        assert_eq!(props.message_id(), &Some(ShortString::from("msg-1")));
        assert_eq!(props.expiration(), &Some(ShortString::from("1500")));

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::LongString(LongString::from("acme")))
        );
    }

    #[test]
    fn generated_message_id_when_absent() {
        let props = PublishOptions::new().properties(&Context::new());
        assert!(props.message_id().is_some());
    }
}
