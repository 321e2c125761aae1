use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub mod llm;

/// SDK version constant for consistent version reporting across adapters.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Instruction text reported by programs that carry no instruction of their own.
pub const DEFAULT_INSTRUCTION: &str = "Given the input fields, produce the output fields.";

/// Unique identifier within the Evolv platform (traces, spans, candidates).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvolvId(Uuid);

impl std::fmt::Display for EvolvId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default generates a random UUID v4 (intentional design).
/// Each default EvolvId is unique, suitable for trace IDs and ephemeral identifiers.
/// For deterministic IDs, use `EvolvId::from_name()` instead.
impl Default for EvolvId {
    fn default() -> Self {
        Self::new()
    }
}

impl EvolvId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Generate an ID for a trace record.
    pub fn new_trace_id() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_name(name: &str) -> Self {
        let namespace = Uuid::NAMESPACE_DNS;
        Self(Uuid::new_v5(&namespace, name.as_bytes()))
    }
}

// Explicit serde tagging for consistent serialization across adapters
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum EvolvError {
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Operator failure: {operator} - {message}")]
    Operator { operator: String, message: String },
    #[error("Reflection parse error: {0}")]
    ReflectionParse(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Timeout occurred: {0}")]
    Timeout(String),
    #[error("Model error: {0}")]
    Model(String),
}

pub type EvolvResult<T> = std::result::Result<T, EvolvError>;

/// A single training example: input fields and the outputs expected for them.
/// Owned by the caller's training set; never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub inputs: BTreeMap<String, String>,
    pub expected: BTreeMap<String, String>,
}

impl Example {
    pub fn new(
        inputs: impl IntoIterator<Item = (String, String)>,
        expected: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            expected: expected.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn input(&self, field: &str) -> Option<&str> {
        self.inputs.get(field).map(String::as_str)
    }

    #[must_use]
    pub fn expected_output(&self, field: &str) -> Option<&str> {
        self.expected.get(field).map(String::as_str)
    }
}

/// Token accounting for a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Output of one program call: the declared output fields plus call telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub outputs: BTreeMap<String, String>,
    pub usage: TokenUsage,
    pub model: Option<String>,
}

impl Prediction {
    pub fn new(outputs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            outputs: outputs.into_iter().collect(),
            usage: TokenUsage::default(),
            model: None,
        }
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.outputs.get(field).map(String::as_str)
    }

    /// Flattened response text, used by batch-level consistency metrics.
    #[must_use]
    pub fn text(&self) -> String {
        self.outputs
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An LLM-backed predictor the optimizer evolves.
///
/// The engine never mutates a program in place: `with_instruction` returns a
/// new program value. Programs that do not support instruction mutation rely
/// on the default implementation, which returns an unmodified clone — the
/// no-op conformance for instruction-less programs.
#[async_trait]
pub trait Program: Send + Sync {
    /// Invoke the predictor on one example's input fields.
    async fn call(&self, inputs: &BTreeMap<String, String>) -> anyhow::Result<Prediction>;

    /// The current instruction, or a default description when absent.
    fn instruction_text(&self) -> String {
        DEFAULT_INSTRUCTION.to_string()
    }

    /// A new program value with the instruction replaced (pure).
    fn with_instruction(&self, _instruction: &str) -> Arc<dyn Program> {
        self.clone_program()
    }

    /// An unmodified copy of this program behind a trait object.
    fn clone_program(&self) -> Arc<dyn Program>;
}

/// Quality metric scoring a prediction against its example, in [0.0, 1.0].
pub trait Metric: Send + Sync {
    fn score(&self, example: &Example, prediction: &Prediction) -> f64;
}

impl<F> Metric for F
where
    F: Fn(&Example, &Prediction) -> f64 + Send + Sync,
{
    fn score(&self, example: &Example, prediction: &Prediction) -> f64 {
        self(example, prediction)
    }
}

/// An execution event submitted for trace collection.
///
/// This is the ingestion contract: any host event bus binds to
/// `TraceCollector::ingest` by building one of these. A missing `trace_id`
/// is generated on ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: Option<String>,
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    pub span_id: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TraceEvent {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            trace_id: None,
            event_name: event_name.into(),
            timestamp: Utc::now(),
            span_id: None,
            attributes: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    #[must_use]
    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(span_id.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
