//! Shared helpers for unit and integration tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evolv_shared::{Example, Prediction, Program, TokenUsage, TraceEvent};

use crate::traces::ExecutionTrace;

/// Deterministic in-process stand-in for an LLM-backed program.
///
/// The call counter is shared across clones and instruction variants, so a
/// test can observe how many real evaluations an engine performed across a
/// whole population derived from one seed.
#[derive(Clone)]
pub struct MockProgram {
    instruction: String,
    response: Option<String>,
    fail_always: bool,
    fail_calls: Vec<usize>,
    delay: Option<Duration>,
    usage: TokenUsage,
    calls: Arc<AtomicUsize>,
}

impl MockProgram {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            response: None,
            fail_always: false,
            fail_calls: Vec::new(),
            delay: None,
            usage: TokenUsage {
                prompt_tokens: 20,
                completion_tokens: 10,
            },
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fixed `answer` output for every call.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Every call fails.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// The given call ordinals (0-based, across all clones) fail.
    #[must_use]
    pub fn failing_on(mut self, ordinals: &[usize]) -> Self {
        self.fail_calls = ordinals.to_vec();
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage {
            prompt_tokens,
            completion_tokens,
        };
        self
    }

    /// Shared counter of calls made through this program and all programs
    /// derived from it.
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Program for MockProgram {
    async fn call(&self, inputs: &BTreeMap<String, String>) -> anyhow::Result<Prediction> {
        let ordinal = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_always || self.fail_calls.contains(&ordinal) {
            anyhow::bail!("mock program failure on call {ordinal}");
        }

        let answer = self.response.clone().unwrap_or_else(|| {
            let question = inputs
                .values()
                .next()
                .cloned()
                .unwrap_or_else(|| "input".to_string());
            format!("response to {question}")
        });

        Ok(Prediction {
            outputs: BTreeMap::from([
                ("answer".to_string(), answer),
                ("instruction".to_string(), self.instruction.clone()),
            ]),
            usage: self.usage,
            model: Some("mock-model".to_string()),
        })
    }

    fn instruction_text(&self) -> String {
        self.instruction.clone()
    }

    fn with_instruction(&self, instruction: &str) -> Arc<dyn Program> {
        let mut next = self.clone();
        next.instruction = instruction.to_string();
        Arc::new(next)
    }

    fn clone_program(&self) -> Arc<dyn Program> {
        Arc::new(self.clone())
    }
}

/// Metric scoring 1.0 when the expected `answer` appears in the predicted
/// `answer`, 0.0 otherwise.
pub fn keyword_metric() -> impl Fn(&Example, &Prediction) -> f64 + Send + Sync {
    |example: &Example, prediction: &Prediction| {
        let expected = example.expected_output("answer").unwrap_or_default();
        let produced = prediction.get("answer").unwrap_or_default();
        if !expected.is_empty() && produced.contains(expected) {
            1.0
        } else {
            0.0
        }
    }
}

/// A frozen LLM-call trace with the given total token usage.
#[must_use]
pub fn llm_trace(trace_id: &str, total_tokens: u64, model: &str) -> ExecutionTrace {
    ExecutionTrace::from_event(
        TraceEvent::new("llm.call")
            .with_trace_id(trace_id)
            .with_attribute("model", json!(model))
            .with_attribute("total_tokens", json!(total_tokens))
            .with_attribute("latency_ms", json!(100.0)),
    )
}
