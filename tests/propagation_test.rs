//! Trace context carried across every header representation

use async_nats::HeaderMap as NatsHeaders;
use axum::http::{HeaderMap, HeaderValue};
use billing_pipeline::messaging::{
    AmqpHeaderReader, AmqpHeaderWriter, CarrierReader, HttpHeaderReader, KafkaHeaderReader,
    KafkaHeaderWriter, MessageHeaders, NatsHeaderReader, NatsHeaderWriter, Propagator,
    TraceContext, TRACEPARENT_HEADER, TRACESTATE_HEADER,
};
use lapin::types::FieldTable;
use rdkafka::message::OwnedHeaders;
use std::collections::HashMap;

const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const INBOUND_TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

fn inbound_http() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static(INBOUND_TRACEPARENT));
    headers.insert(TRACESTATE_HEADER, HeaderValue::from_static("congo=t61rcWkgMzE"));
    headers
}

#[test]
fn test_http_request_context_is_inherited() {
    let http = inbound_http();
    let context = Propagator::new().try_extract(&HttpHeaderReader(&http)).unwrap();

    assert_eq!(context.trace_id().to_string(), TRACE_ID);
    assert_eq!(context.span_id().to_string(), "00f067aa0ba902b7");
    assert!(context.is_sampled());
    assert_eq!(context.trace_state().header(), "congo=t61rcWkgMzE");
    assert_eq!(context.traceparent(), INBOUND_TRACEPARENT);
}

/// HTTP -> Kafka -> NATS -> AMQP -> HashMap, one child span per hop
#[test]
fn test_trace_survives_every_hop() {
    let propagator = Propagator::new();
    let http = inbound_http();
    let inbound = propagator.try_extract(&HttpHeaderReader(&http)).unwrap();

    let billing = inbound.child();
    let mut kafka = OwnedHeaders::new();
    propagator.inject(&billing, &mut KafkaHeaderWriter(&mut kafka));

    let received = propagator.try_extract(&KafkaHeaderReader(&kafka)).unwrap();
    assert!(received.same_span(&billing));
    let payment = received.child();
    let mut nats = NatsHeaders::new();
    propagator.inject(&payment, &mut NatsHeaderWriter(&mut nats));

    let received = propagator.try_extract(&NatsHeaderReader(&nats)).unwrap();
    assert!(received.same_span(&payment));
    let invoice = received.child();
    let mut amqp = FieldTable::default();
    propagator.inject(&invoice, &mut AmqpHeaderWriter(&mut amqp));

    let received = propagator.try_extract(&AmqpHeaderReader(&amqp)).unwrap();
    assert!(received.same_span(&invoice));
    let mut map: HashMap<String, String> = HashMap::new();
    propagator.inject(&received, &mut map);

    let last = propagator.try_extract(&map).unwrap();
    for hop in [&billing, &payment, &invoice, &last] {
        assert_eq!(hop.trace_id().to_string(), TRACE_ID);
        assert_eq!(hop.trace_state().header(), "congo=t61rcWkgMzE");
    }
    assert_eq!(billing.parent_span_id(), Some(inbound.span_id()));
    assert_eq!(payment.parent_span_id(), Some(billing.span_id()));
    assert_eq!(invoice.parent_span_id(), Some(payment.span_id()));
    assert_ne!(billing.span_id(), payment.span_id());
    assert_ne!(payment.span_id(), invoice.span_id());
}

#[test]
fn test_reinjection_replaces_previous_context() {
    let propagator = Propagator::new();
    let first = TraceContext::new_root();
    let second = TraceContext::new_root();

    let mut headers = MessageHeaders::new().with("x-message-key", "T1");
    propagator.inject(&first, &mut headers);
    propagator.inject(&second, &mut headers);

    assert_eq!(headers.get(TRACEPARENT_HEADER), Some(second.traceparent().as_str()));
    assert_eq!(headers.get("x-message-key"), Some("T1"));
    let extracted = propagator.try_extract(&headers).unwrap();
    assert!(extracted.same_span(&second));
}

#[test]
fn test_headers_copied_between_carriers_keep_context() {
    let propagator = Propagator::new();
    let context = TraceContext::new_root();

    let mut nats = NatsHeaders::new();
    propagator.inject(&context, &mut NatsHeaderWriter(&mut nats));
    let copied = MessageHeaders::from_reader(&NatsHeaderReader(&nats));

    let mut kafka = OwnedHeaders::new();
    copied.write_to(&mut KafkaHeaderWriter(&mut kafka));
    let extracted = propagator.try_extract(&KafkaHeaderReader(&kafka)).unwrap();
    assert!(extracted.same_span(&context));
}

#[test]
fn test_malformed_or_missing_context_falls_back() {
    let propagator = Propagator::new();
    let fallback = TraceContext::new_root();

    let garbage = MessageHeaders::new().with(TRACEPARENT_HEADER, "00-not-a-trace-01");
    assert!(propagator.try_extract(&garbage).is_none());
    assert!(propagator.extract(&garbage, fallback.clone()).same_span(&fallback));

    let zeros = MessageHeaders::new().with(
        TRACEPARENT_HEADER,
        "00-00000000000000000000000000000000-0000000000000000-01",
    );
    assert!(propagator.try_extract(&zeros).is_none());

    let empty = HeaderMap::new();
    let root = propagator.extract_or_root(&HttpHeaderReader(&empty));
    assert!(root.parent_span_id().is_none());
    assert!(root.is_sampled());
}

#[test]
fn test_propagator_fields() {
    let fields = Propagator::new().fields();
    assert!(fields.iter().any(|f| f == TRACEPARENT_HEADER));
    assert!(fields.iter().any(|f| f == TRACESTATE_HEADER));
}

#[test]
fn test_unrelated_headers_are_visible_to_readers() {
    let http = inbound_http();
    let reader = HttpHeaderReader(&http);
    let mut keys = reader.keys();
    keys.sort_unstable();
    assert_eq!(keys, vec![TRACEPARENT_HEADER, TRACESTATE_HEADER]);
}
