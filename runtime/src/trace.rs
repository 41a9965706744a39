//! W3C trace-context propagation.
//!
//! Both planes carry trace context the same way: the standard `traceparent`
//! / `tracestate` pair, injected into outbound HTTP headers and AMQP message
//! headers, extracted on the receiving side to parent the handler span.
//! The header set is a plain `HashMap<String, String>` so the HTTP client
//! and the broker share one implementation.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context as OtelContext;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Inject the span's trace context into a header map.
///
/// Returns an empty map when no subscriber-level trace context is active,
/// which downstream treats as "start a new trace".
#[must_use]
pub fn inject_trace_headers(span: &Span) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let propagator = TraceContextPropagator::new();
    propagator.inject_context(&span.context(), &mut headers);
    headers
}

/// Extract trace context from a header map.
///
/// Returns `None` when the headers carry no valid `traceparent`.
#[must_use]
pub fn extract_trace_context<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<OtelContext> {
    let propagator = TraceContextPropagator::new();
    let context = propagator.extract(headers);
    if context.span().span_context().is_valid() {
        Some(context)
    } else {
        None
    }
}

/// Create a consumer span named after the event type, parented to the
/// producer's context when one was propagated.
#[must_use]
pub fn consumer_span(event_type: &str, headers: &HashMap<String, String>) -> Span {
    let span = tracing::info_span!("consume", otel.name = %event_type, event_type = %event_type);
    if let Some(context) = extract_trace_context(headers) {
        span.set_parent(context);
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_headers_extract_nothing() {
        let headers = HashMap::new();
        assert!(extract_trace_context(&headers).is_none());
    }

    #[test]
    fn well_formed_traceparent_extracts() {
        let mut headers = HashMap::new();
        headers.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        assert!(extract_trace_context(&headers).is_some());
    }

    #[test]
    fn garbage_traceparent_extracts_nothing() {
        let mut headers = HashMap::new();
        headers.insert("traceparent".to_string(), "not-a-traceparent".to_string());
        assert!(extract_trace_context(&headers).is_none());
    }

    #[test]
    fn consumer_span_tolerates_missing_context() {
        let headers = HashMap::new();
        let span = consumer_span("order.created", &headers);
        let _guard = span.enter();
    }
}
