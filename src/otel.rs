// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in the AMQP message headers. Publishes inject the caller's
//! context and consumers extract it to parent the span that wraps the handler.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Instrumentation scope of every span created by the transport
pub(crate) const TRACER_NAME: &str = "rabbitmq-transport";

/// Writes trace context entries into outbound message headers.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads trace context entries from inbound message headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| match header_value {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects `cx` into `headers` with the globally configured propagator.
pub(crate) fn inject_context(cx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector { headers })
    });
}

/// Extracts the remote context carried by `props`.
pub(crate) fn extract_context(props: &AMQPProperties) -> Context {
    let headers = props.headers().clone().unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor {
            headers: headers.inner(),
        })
    })
}

/// Starts the consumer span wrapping one delivery of `queue`.
///
/// Returns the extracted parent context together with the span.
pub(crate) fn consumer_span(props: &AMQPProperties, queue: &str) -> (Context, BoxedSpan) {
    let ctx = extract_context(props);
    let tracer = global::tracer(TRACER_NAME);

    let span = tracer
        .span_builder(Cow::from(format!("{} process", queue)))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.destination.name", queue.to_owned()),
        ])
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}
