//! Trace context propagation between hops.
//!
//! Each message carries a W3C trace-context carrier in its `trace_parent`
//! field. A handler extracts it, opens a child span for its own unit of work
//! ([`Tracer::start_span`]) and injects that span, not the inbound carrier,
//! into anything it publishes ([`Tracer::inject`]). Hop N+1 therefore sees
//! hop N's span as its parent and the trace ID stays the same end to end.
//!
//! The [`Tracer`] is an ordinary value handed to each handler; no global
//! propagator or tracer provider is installed.

use std::collections::BTreeMap;

use opentelemetry::Context;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use serde::{Deserialize, Serialize};

/// Text-map carrier holding serialized trace context headers.
///
/// Serialized as a JSON object (`{"traceparent": "00-…"}`). Inbound, a bare
/// `traceparent` string is accepted as well, and any other shape is treated
/// as an empty carrier so a bad carrier never fails a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CarrierRepr")]
pub struct TraceCarrier(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum CarrierRepr {
    Headers(BTreeMap<String, String>),
    Traceparent(String),
    Other(serde::de::IgnoredAny),
}

impl From<CarrierRepr> for TraceCarrier {
    fn from(repr: CarrierRepr) -> Self {
        match repr {
            CarrierRepr::Headers(headers) => Self(
                headers
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v))
                    .collect(),
            ),
            CarrierRepr::Traceparent(value) => {
                Self(BTreeMap::from([("traceparent".to_string(), value)]))
            }
            CarrierRepr::Other(_) => Self::default(),
        }
    }
}

impl TraceCarrier {
    /// Returns true if the carrier holds no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a single header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Consumes the carrier, returning its headers for use as message headers.
    pub fn into_headers(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for TraceCarrier {
    fn from(headers: BTreeMap<String, String>) -> Self {
        CarrierRepr::Headers(headers).into()
    }
}

impl Injector for TraceCarrier {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

impl Extractor for TraceCarrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.header(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// The span a handler opened for one unit of work.
#[derive(Debug, Clone)]
pub struct HopSpan {
    name: &'static str,
    context: SpanContext,
    parent: Option<SpanContext>,
}

impl HopSpan {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id()
    }

    pub fn span_id(&self) -> SpanId {
        self.context.span_id()
    }

    /// The span this one continues, if the inbound carrier held a valid one.
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent.as_ref().map(SpanContext::span_id)
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.context
    }

    /// A `tracing` span carrying this hop's IDs, for log correlation.
    pub fn tracing_span(&self) -> tracing::Span {
        let span = tracing::info_span!(
            "hop",
            name = self.name,
            trace_id = %self.trace_id(),
            span_id = %self.span_id(),
            parent_span_id = tracing::field::Empty,
        );
        if let Some(parent) = self.parent_span_id() {
            span.record("parent_span_id", tracing::field::display(parent));
        }
        span
    }
}

/// Opens hop spans and moves their context in and out of carriers.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    propagator: TraceContextPropagator,
    ids: RandomIdGenerator,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a valid span context from `carrier`, if there is one.
    pub fn extract(&self, carrier: &TraceCarrier) -> Option<SpanContext> {
        let cx = self.propagator.extract_with_context(&Context::new(), carrier);
        let span_context = cx.span().span_context().clone();
        span_context.is_valid().then_some(span_context)
    }

    /// Opens a span named `name`.
    ///
    /// With a valid parent in `carrier` the span joins the parent's trace
    /// and keeps its sampling decision and trace state; otherwise it starts
    /// a new sampled trace.
    pub fn start_span(&self, name: &'static str, carrier: Option<&TraceCarrier>) -> HopSpan {
        let parent = carrier.and_then(|c| self.extract(c));
        if carrier.is_some_and(|c| !c.is_empty()) && parent.is_none() {
            tracing::debug!(span = name, "ignoring unusable trace carrier");
        }

        let (trace_id, flags, state) = match &parent {
            Some(parent) => (
                parent.trace_id(),
                parent.trace_flags(),
                parent.trace_state().clone(),
            ),
            None => (
                self.ids.new_trace_id(),
                TraceFlags::SAMPLED,
                TraceState::default(),
            ),
        };

        HopSpan {
            name,
            context: SpanContext::new(trace_id, self.ids.new_span_id(), flags, false, state),
            parent,
        }
    }

    /// Serializes `span` into a fresh carrier.
    pub fn inject(&self, span: &HopSpan) -> TraceCarrier {
        let cx = Context::new().with_remote_span_context(span.context.clone());
        let mut carrier = TraceCarrier::default();
        self.propagator.inject_context(&cx, &mut carrier);
        carrier
    }
}
