//! Trace context identity carried from stage to stage

use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use std::fmt;

/// Position of one unit of work within a distributed trace.
///
/// The trace id is shared by every stage of a correlation; each stage
/// creates a child with a fresh span id whose parent is the upstream span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    flags: TraceFlags,
    parent_span_id: Option<SpanId>,
    trace_state: TraceState,
}

impl TraceContext {
    /// Start a new sampled trace
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            trace_id: ids.new_trace_id(),
            span_id: ids.new_span_id(),
            flags: TraceFlags::SAMPLED,
            parent_span_id: None,
            trace_state: TraceState::default(),
        }
    }

    /// Child span in the same trace, parented to `self`
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: RandomIdGenerator::default().new_span_id(),
            flags: self.flags,
            parent_span_id: Some(self.span_id),
            trace_state: self.trace_state.clone(),
        }
    }

    /// Build from a decoded span context. Returns `None` for invalid ids.
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        if !span_context.is_valid() {
            return None;
        }
        Some(Self {
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
            flags: span_context.trace_flags(),
            parent_span_id: None,
            trace_state: span_context.trace_state().clone(),
        })
    }

    /// Remote span context suitable for the W3C encoder
    pub fn to_span_context(&self) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.span_id,
            self.flags,
            true,
            self.trace_state.clone(),
        )
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn flags(&self) -> TraceFlags {
        self.flags
    }

    pub fn is_sampled(&self) -> bool {
        self.flags.is_sampled()
    }

    pub fn trace_state(&self) -> &TraceState {
        &self.trace_state
    }

    /// `traceparent` header value for this context
    pub fn traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            self.flags.to_u8()
        )
    }

    /// Same trace position, ignoring parent linkage
    pub fn same_span(&self, other: &TraceContext) -> bool {
        self.trace_id == other.trace_id
            && self.span_id == other.span_id
            && self.flags == other.flags
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.traceparent())
    }
}
