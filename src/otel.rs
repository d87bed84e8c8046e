// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module propagates trace context through AMQP message headers and opens
//! producer and consumer spans. Without a globally installed tracer and
//! propagator every call here is a no-op, and messaging behaves the same.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

const TRACER_NAME: &str = "amqp-reliable";

/// An adapter for injecting and extracting OpenTelemetry context from RabbitMQ headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

pub(crate) fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Writes the current trace context into outgoing headers.
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(headers))
    });
}

/// Opens a producer span for a publish to `name`.
fn producer_span(tracer: &BoxedTracer, ctx: &Context, name: &str) -> BoxedSpan {
    tracer
        .span_builder(Cow::from(format!("{} publish", name)))
        .with_kind(SpanKind::Producer)
        .start_with_context(tracer, ctx)
}

/// Opens a producer span and returns `ctx` with it as the active span, so
/// injecting the result makes the consumer span a child of the publish.
pub(crate) fn producer_context(tracer: &BoxedTracer, ctx: &Context, name: &str) -> Context {
    ctx.with_span(producer_span(tracer, ctx, name))
}

/// Extracts the context carried by a delivery and opens a consumer span.
pub(crate) fn consumer_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props
        .headers()
        .clone()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(format!("{} process", name)))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
