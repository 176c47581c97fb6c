use uuid::Uuid;

/// Generate an OpenTelemetry-compatible trace ID (32 hex characters).
pub fn generate_trace_id() -> String {
    // A UUID without hyphens is exactly 32 hex chars.
    Uuid::new_v4().as_simple().to_string()
}

/// Generate a span ID (16 hex characters).
pub fn generate_span_id() -> String {
    Uuid::new_v4().as_simple().to_string()[..16].to_string()
}

/// Root span for one sync operation. Returns the span and its trace ID so
/// task spans can join the same trace.
pub fn create_operation_span(kind: &str, operation_id: &str, project: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span_id = generate_span_id();
    let span = tracing::info_span!(
        "operation",
        trace_id = %trace_id,
        span_id = %span_id,
        operation_id = %operation_id,
        kind = %kind,
        project = %project,
    );
    (span, trace_id)
}

/// Span for one task under an existing trace ID.
pub fn create_child_span(trace_id: &str, task: &str) -> tracing::Span {
    let span_id = generate_span_id();
    tracing::info_span!(
        "task",
        trace_id = %trace_id,
        span_id = %span_id,
        task = %task,
    )
}
