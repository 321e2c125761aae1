//! Execution trace records and their collector.
//!
//! Evaluation workers emit [`TraceEvent`]s while candidates run; the
//! collector freezes them into [`ExecutionTrace`] records, deduplicated by
//! trace id. There is no global bus here: whatever instrumentation the host
//! uses binds to [`TraceCollector::ingest`] explicitly.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use evolv_shared::{EvolvId, TraceEvent};

/// Event-name prefix marking a model call.
pub const LLM_EVENT_PREFIX: &str = "llm.";

/// Event-name prefix marking a module lifecycle event.
pub const MODULE_EVENT_PREFIX: &str = "module.";

/// Classification of a collected trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// A model call: `llm.`-prefixed event carrying model/token attributes.
    Llm,
    /// A recognized module lifecycle event (`module.` prefix).
    Module,
    Other,
}

/// One observed execution event, frozen at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    trace_id: String,
    event_name: String,
    timestamp: DateTime<Utc>,
    span_id: Option<String>,
    attributes: BTreeMap<String, serde_json::Value>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl ExecutionTrace {
    /// Freeze an ingestion event into a trace record, generating a trace id
    /// when the event carries none.
    #[must_use]
    pub fn from_event(event: TraceEvent) -> Self {
        let trace_id = event
            .trace_id
            .unwrap_or_else(|| EvolvId::new_trace_id().to_string());
        Self {
            trace_id,
            event_name: event.event_name,
            timestamp: event.timestamp,
            span_id: event.span_id,
            attributes: event.attributes,
            metadata: event.metadata,
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.attributes
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Classify this trace by event-name convention and attribute shape.
    #[must_use]
    pub fn kind(&self) -> TraceKind {
        if self.event_name.starts_with(LLM_EVENT_PREFIX) && self.has_model_signals() {
            TraceKind::Llm
        } else if self.event_name.starts_with(MODULE_EVENT_PREFIX) {
            TraceKind::Module
        } else {
            TraceKind::Other
        }
    }

    fn has_model_signals(&self) -> bool {
        self.attributes.contains_key("model")
            || self
                .attributes
                .keys()
                .any(|key| key.ends_with("_tokens"))
    }

    #[must_use]
    pub fn is_llm_trace(&self) -> bool {
        self.kind() == TraceKind::Llm
    }

    #[must_use]
    pub fn is_module_trace(&self) -> bool {
        self.kind() == TraceKind::Module
    }

    /// Model name reported on the call, if any.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.attributes.get("model").and_then(|v| v.as_str())
    }

    /// Summed token usage reported on the call. Prefers an explicit
    /// `total_tokens` attribute, otherwise sums prompt + completion tokens.
    #[must_use]
    pub fn token_usage(&self) -> u64 {
        if let Some(total) = self.attributes.get("total_tokens").and_then(|v| v.as_u64()) {
            return total;
        }
        let prompt = self
            .attributes
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion = self
            .attributes
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        prompt + completion
    }

    /// Wall-clock latency in milliseconds, when recorded.
    #[must_use]
    pub fn latency_ms(&self) -> Option<f64> {
        self.attributes.get("latency_ms").and_then(|v| v.as_f64())
    }

    /// True when the event recorded a failed call.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.attributes
            .get("error")
            .map(|v| !v.is_null() && v.as_bool() != Some(false))
            .unwrap_or(false)
    }
}

/// Concurrent trace store with exactly-once recording per trace id.
///
/// Many evaluation workers write simultaneously; duplicate ids resolve
/// last-writer-wins, and the collected count never exceeds the number of
/// distinct ids seen.
#[derive(Default)]
pub struct TraceCollector {
    records: DashMap<String, ExecutionTrace>,
}

impl TraceCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an execution event, returning the trace id under which it was
    /// stored (generated when the event carried none).
    pub fn ingest(&self, event: TraceEvent) -> String {
        let trace = ExecutionTrace::from_event(event);
        let trace_id = trace.trace_id().to_string();
        if self.records.insert(trace_id.clone(), trace).is_some() {
            tracing::debug!(trace_id = %trace_id, "Duplicate trace id, keeping latest record");
        }
        trace_id
    }

    #[must_use]
    pub fn collected_count(&self) -> usize {
        self.records.len()
    }

    /// All traces in (timestamp, trace_id) order for deterministic reads.
    #[must_use]
    pub fn all_traces(&self) -> Vec<ExecutionTrace> {
        let mut traces: Vec<ExecutionTrace> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        traces.sort_by(|a, b| {
            a.timestamp()
                .cmp(&b.timestamp())
                .then_with(|| a.trace_id().cmp(b.trace_id()))
        });
        traces
    }

    #[must_use]
    pub fn traces_of_kind(&self, kind: TraceKind) -> Vec<ExecutionTrace> {
        self.all_traces()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect()
    }

    #[must_use]
    pub fn llm_traces(&self) -> Vec<ExecutionTrace> {
        self.traces_of_kind(TraceKind::Llm)
    }

    #[must_use]
    pub fn module_traces(&self) -> Vec<ExecutionTrace> {
        self.traces_of_kind(TraceKind::Module)
    }

    /// Traces belonging to one evaluation run (span).
    #[must_use]
    pub fn traces_for_span(&self, span_id: &str) -> Vec<ExecutionTrace> {
        self.all_traces()
            .into_iter()
            .filter(|t| t.span_id() == Some(span_id))
            .collect()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}
