//! W3C trace-context propagation over broker-agnostic carriers

use crate::messaging::carrier::{CarrierReader, CarrierWriter};
use crate::messaging::context::TraceContext;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing::debug;

/// Header carrying the W3C trace parent
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header carrying vendor trace state
pub const TRACESTATE_HEADER: &str = "tracestate";

struct ReaderBridge<'a, C: ?Sized>(&'a C);

impl<C: CarrierReader + ?Sized> Extractor for ReaderBridge<'_, C> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys()
    }
}

struct WriterBridge<'a, C: ?Sized>(&'a mut C);

impl<C: CarrierWriter + ?Sized> Injector for WriterBridge<'_, C> {
    fn set(&mut self, key: &str, value: String) {
        self.0.set(key, value);
    }
}

/// Encodes and decodes [`TraceContext`] as `traceparent`/`tracestate` headers.
///
/// Stateless; one instance can be shared by every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Propagator;

impl Propagator {
    pub fn new() -> Self {
        Self
    }

    /// Decode the context from a carrier.
    ///
    /// Missing or malformed headers never fail the message: the caller's
    /// `fallback` is returned instead.
    pub fn extract<C: CarrierReader + ?Sized>(
        &self,
        carrier: &C,
        fallback: TraceContext,
    ) -> TraceContext {
        self.try_extract(carrier).unwrap_or_else(|| {
            debug!(
                trace_id = %fallback.trace_id(),
                "No valid traceparent on carrier, using fallback context"
            );
            fallback
        })
    }

    /// Decode the context, or start a new root trace
    pub fn extract_or_root<C: CarrierReader + ?Sized>(&self, carrier: &C) -> TraceContext {
        self.try_extract(carrier)
            .unwrap_or_else(TraceContext::new_root)
    }

    /// Decode the context if the carrier holds a valid one
    pub fn try_extract<C: CarrierReader + ?Sized>(&self, carrier: &C) -> Option<TraceContext> {
        let cx = TraceContextPropagator::new().extract(&ReaderBridge(carrier));
        let span = cx.span();
        TraceContext::from_span_context(span.span_context())
    }

    /// Write the context into a carrier, replacing any existing trace headers
    pub fn inject<C: CarrierWriter + ?Sized>(&self, context: &TraceContext, carrier: &mut C) {
        let cx = Context::new().with_remote_span_context(context.to_span_context());
        TraceContextPropagator::new().inject_context(&cx, &mut WriterBridge(carrier));
    }

    /// Header names this propagator reads and writes
    pub fn fields(&self) -> Vec<String> {
        TraceContextPropagator::new()
            .fields()
            .map(str::to_string)
            .collect()
    }
}
