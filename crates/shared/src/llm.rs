//! Reflection language-model contract.
//!
//! The optimizer core never talks to a provider directly. A host adapter
//! implements [`ReflectionModel`] on top of whatever wire protocol it uses
//! and hands the engine typed responses. The field set is fixed; the core
//! validates values on receipt and degrades gracefully when they are out of
//! range, so adapters are free to pass provider output through unchecked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Request sent to the reflection model: a compact summary of collected
/// execution traces plus framing about the current optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub trace_summary: String,
    pub optimization_context: String,
}

/// Structured response expected back from the reflection model.
///
/// `confidence` should be in [0.0, 1.0] and `suggested_mutations` should
/// name known mutation kinds (`rewrite`, `expand`, `combine`, `simplify`,
/// `rephrase`), but neither is enforced here — the engine filters and
/// falls back on invalid values rather than failing the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionResponse {
    pub diagnosis: String,
    #[serde(default)]
    pub improvements: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_mutations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Vec<String>>,
}

/// Pluggable reflection model (optional collaborator).
#[async_trait]
pub trait ReflectionModel: Send + Sync {
    /// A stable reference for logging and configuration matching,
    /// e.g. a provider/model identifier.
    fn model_ref(&self) -> String;

    async fn reflect(&self, request: ReflectionRequest) -> anyhow::Result<ReflectionResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_deserializes_with_missing_optional_fields() {
        let json = serde_json::json!({
            "diagnosis": "high token usage on retrieval steps",
            "confidence": 0.7
        });
        let resp: ReflectionResponse = serde_json::from_value(json).unwrap();
        assert!(resp.improvements.is_empty());
        assert!(resp.suggested_mutations.is_empty());
        assert!(resp.insights.is_none());
        assert!((resp.confidence - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_request_round_trip() {
        let req = ReflectionRequest {
            trace_summary: "12 llm traces, 4800 tokens".to_string(),
            optimization_context: "generation 3, trend declining".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ReflectionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trace_summary, req.trace_summary);
    }
}
