//! Trace-driven reflection.
//!
//! Reflection turns collected execution traces into a diagnosis of the
//! current candidate's weaknesses and a set of suggested mutation kinds.
//! The rule-based path always works; an optional reflection model can be
//! plugged in, and anything malformed it returns degrades to a
//! low-confidence fallback instead of failing the run.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use evolv_shared::llm::{ReflectionModel, ReflectionRequest, ReflectionResponse};

use crate::config::ReflectionThresholds;
use crate::traces::ExecutionTrace;

use super::types::{MutationKind, OptimizationContext, ReflectionResult, Trend};

/// Confidence assigned to fallback results produced from malformed or
/// failed model responses. Kept below 0.5 so downstream consumers can
/// distinguish degraded reflections from trusted ones.
const PARSE_FALLBACK_CONFIDENCE: f64 = 0.25;

/// Aggregate signals extracted from a trace batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPatterns {
    pub llm_trace_count: usize,
    pub module_trace_count: usize,
    pub total_tokens: u64,
    pub unique_models: BTreeSet<String>,
    pub error_count: usize,
    pub mean_latency_ms: Option<f64>,
}

/// Diagnoses execution traces and proposes instruction mutations.
pub struct ReflectionEngine {
    thresholds: ReflectionThresholds,
    model: Option<Arc<dyn ReflectionModel>>,
}

impl ReflectionEngine {
    #[must_use]
    pub fn new(thresholds: ReflectionThresholds) -> Self {
        Self {
            thresholds,
            model: None,
        }
    }

    /// Attach a reflection model for the LLM-assisted path.
    #[must_use]
    pub fn with_model(mut self, model: Arc<dyn ReflectionModel>) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Count and aggregate what the traces show: model calls vs module
    /// lifecycle events, token totals, models observed, failures, latency.
    #[must_use]
    pub fn analyze_execution_patterns(&self, traces: &[ExecutionTrace]) -> ExecutionPatterns {
        let mut patterns = ExecutionPatterns::default();
        let mut latencies: Vec<f64> = Vec::new();

        for trace in traces {
            if trace.is_llm_trace() {
                patterns.llm_trace_count += 1;
                patterns.total_tokens += trace.token_usage();
                if let Some(model) = trace.model() {
                    patterns.unique_models.insert(model.to_string());
                }
            } else if trace.is_module_trace() {
                patterns.module_trace_count += 1;
            }
            if trace.is_error() {
                patterns.error_count += 1;
            }
            if let Some(latency) = trace.latency_ms() {
                latencies.push(latency);
            }
        }

        if !latencies.is_empty() {
            patterns.mean_latency_ms =
                Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
        }
        patterns
    }

    /// Rule-based suggestions. High-token and low-token patterns produce
    /// deliberately different guidance.
    #[must_use]
    pub fn generate_improvement_suggestions(&self, patterns: &ExecutionPatterns) -> Vec<String> {
        let mut suggestions = Vec::new();

        if patterns.llm_trace_count == 0 {
            suggestions
                .push("No model calls were observed; verify evaluation instrumentation".to_string());
            return suggestions;
        }

        if patterns.total_tokens > self.thresholds.high_token_usage {
            suggestions.push(format!(
                "Token usage is high ({} tokens); tighten the instruction and drop redundant guidance",
                patterns.total_tokens
            ));
            suggestions.push(
                "Ask for shorter outputs or restrict the response to the requested fields"
                    .to_string(),
            );
        } else {
            suggestions.push(format!(
                "Token usage is modest ({} tokens); there is room to add clarifying detail",
                patterns.total_tokens
            ));
            suggestions.push(
                "Spell out the expected output format and add a worked hint".to_string(),
            );
        }

        let error_rate = patterns.error_count as f64
            / (patterns.llm_trace_count + patterns.module_trace_count).max(1) as f64;
        if error_rate > self.thresholds.error_rate_cutoff {
            suggestions.push(format!(
                "{} of {} traces failed; make the instruction more robust to malformed inputs",
                patterns.error_count,
                patterns.llm_trace_count + patterns.module_trace_count
            ));
        }

        if let Some(latency) = patterns.mean_latency_ms {
            if latency > self.thresholds.slow_call_ms as f64 {
                suggestions.push(
                    "Calls are slow; reduce requested reasoning depth or output length".to_string(),
                );
            }
        }

        if patterns.unique_models.len() > 1 {
            suggestions.push(format!(
                "Multiple models observed ({}); phrase the instruction model-neutrally",
                patterns.unique_models.len()
            ));
        }

        suggestions
    }

    /// Map pattern signals onto the closed mutation-kind set.
    #[must_use]
    pub fn suggest_mutations(&self, patterns: &ExecutionPatterns) -> Vec<MutationKind> {
        let mut kinds: Vec<MutationKind> = Vec::new();
        let mut push = |kind: MutationKind| {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        };

        if patterns.total_tokens > self.thresholds.high_token_usage {
            push(MutationKind::Simplify);
            push(MutationKind::Rewrite);
        } else {
            push(MutationKind::Expand);
            push(MutationKind::Combine);
        }

        let total_traces = patterns.llm_trace_count + patterns.module_trace_count;
        if total_traces > 0
            && patterns.error_count as f64 / total_traces as f64
                > self.thresholds.error_rate_cutoff
        {
            push(MutationKind::Rewrite);
        }

        if patterns.unique_models.len() > 1 {
            push(MutationKind::Rephrase);
        }

        kinds
    }

    /// Analyze a trace batch. Empty input is the terminal case: a
    /// zero-confidence result stating that no traces were available.
    #[must_use]
    pub fn reflect_on_traces(&self, traces: &[ExecutionTrace]) -> ReflectionResult {
        if traces.is_empty() {
            return build_result(
                String::new(),
                "No execution traces were available for analysis".to_string(),
                Vec::new(),
                0.0,
                "Reflection requires at least one collected trace".to_string(),
                Vec::new(),
                BTreeMap::new(),
            );
        }

        let patterns = self.analyze_execution_patterns(traces);
        let improvements = self.generate_improvement_suggestions(&patterns);
        let mutations = self.suggest_mutations(&patterns);

        // Confidence grows with observed evidence, capped well under 1.0:
        // rule-based reflection never claims certainty.
        let confidence = (0.4 + 0.08 * patterns.llm_trace_count.min(5) as f64).clamp(0.0, 0.9);

        let diagnosis = format!(
            "Observed {} model call(s) and {} module event(s) using {} token(s); {} failure(s)",
            patterns.llm_trace_count,
            patterns.module_trace_count,
            patterns.total_tokens,
            patterns.error_count
        );
        let reasoning = format!(
            "Rule-based analysis over {} trace(s) against a token budget of {}",
            traces.len(),
            self.thresholds.high_token_usage
        );

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), json!("rules"));
        metadata.insert("total_tokens".to_string(), json!(patterns.total_tokens));

        build_result(
            traces[0].trace_id().to_string(),
            diagnosis,
            improvements,
            confidence,
            reasoning,
            mutations,
            metadata,
        )
    }

    /// LLM-assisted reflection. Falls back to the rule-based path when no
    /// model is attached, and degrades (never raises) when the model call
    /// fails or returns an invalid structure.
    pub async fn reflect_with_llm(&self, traces: &[ExecutionTrace]) -> ReflectionResult {
        if traces.is_empty() {
            return self.reflect_on_traces(traces);
        }
        let Some(model) = &self.model else {
            return self.reflect_on_traces(traces);
        };

        let patterns = self.analyze_execution_patterns(traces);
        let request = ReflectionRequest {
            trace_summary: summarize_patterns(&patterns, traces.len()),
            optimization_context:
                "Propose instruction improvements and mutation kinds (rewrite, expand, combine, simplify, rephrase)"
                    .to_string(),
        };

        match model.reflect(request).await {
            Ok(response) => self.parse_llm_reflection(response, traces),
            Err(e) => {
                tracing::warn!(model = %model.model_ref(), error = %e, "Reflection model call failed");
                build_result(
                    traces[0].trace_id().to_string(),
                    format!("Reflection model call failed: {e}"),
                    Vec::new(),
                    PARSE_FALLBACK_CONFIDENCE,
                    "Falling back after a reflection model error".to_string(),
                    Vec::new(),
                    BTreeMap::from([("source".to_string(), json!("llm_error"))]),
                )
            }
        }
    }

    /// Validate a structured model response. Out-of-range confidence or an
    /// empty diagnosis degrades to a parse-error result; mutation names
    /// outside the fixed set are filtered out rather than propagated.
    #[must_use]
    pub fn parse_llm_reflection(
        &self,
        response: ReflectionResponse,
        traces: &[ExecutionTrace],
    ) -> ReflectionResult {
        let trace_id = traces
            .first()
            .map(|t| t.trace_id().to_string())
            .unwrap_or_default();

        let confidence_valid =
            response.confidence.is_finite() && (0.0..=1.0).contains(&response.confidence);
        if !confidence_valid || response.diagnosis.trim().is_empty() {
            tracing::warn!(
                confidence = response.confidence,
                "Malformed reflection response, degrading to fallback"
            );
            return build_result(
                trace_id,
                "Reflection response could not be parsed; treating analysis as inconclusive"
                    .to_string(),
                Vec::new(),
                PARSE_FALLBACK_CONFIDENCE,
                "The reflection model returned an invalid structure".to_string(),
                Vec::new(),
                BTreeMap::from([("source".to_string(), json!("llm_parse_error"))]),
            );
        }

        let mutations: Vec<MutationKind> = response
            .suggested_mutations
            .iter()
            .filter_map(|name| {
                let parsed = MutationKind::parse(name);
                if parsed.is_none() {
                    tracing::warn!(kind = %name, "Dropping unknown mutation kind from reflection response");
                }
                parsed
            })
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), json!("llm"));
        if let Some(insights) = response.insights {
            metadata.insert("insights".to_string(), json!(insights));
        }

        build_result(
            trace_id,
            response.diagnosis,
            response.improvements,
            response.confidence,
            response.reasoning,
            mutations,
            metadata,
        )
    }

    /// Reflection that accounts for the run so far: mutation kinds used
    /// heavily in recent generations are de-prioritized in the suggestion
    /// order, and the run context is recorded on the result.
    #[must_use]
    pub fn reflection_with_context(
        &self,
        traces: &[ExecutionTrace],
        context: &OptimizationContext,
    ) -> ReflectionResult {
        let base = self.reflect_on_traces(traces);
        if base.suggested_mutations().is_empty() {
            return base;
        }

        let usage = |kind: MutationKind| {
            context
                .recent_mutations
                .iter()
                .filter(|&&k| k == kind)
                .count()
        };
        let mut reordered: Vec<MutationKind> = base.suggested_mutations().to_vec();
        reordered.sort_by_key(|&kind| usage(kind));

        // An overused kind is dropped entirely when alternatives remain.
        if reordered.len() > 1 {
            let half = context.recent_mutations.len() / 2;
            if half > 0 {
                let filtered: Vec<MutationKind> = reordered
                    .iter()
                    .copied()
                    .filter(|&kind| usage(kind) <= half)
                    .collect();
                if !filtered.is_empty() {
                    reordered = filtered;
                }
            }
        }

        let trend_note = match context.trend {
            Some(Trend::Declining) => "; fitness is declining, favor bolder edits",
            Some(Trend::Improving) => "; fitness is improving, prefer incremental edits",
            _ => "",
        };
        let operator_note = if !context.recent_crossovers.is_empty()
            && super::crossover::crossover_diversity(&context.recent_crossovers) < 0.34
        {
            "; recent crossover operator usage lacks variety"
        } else {
            ""
        };

        let mut metadata = base.metadata().clone();
        metadata.insert("generation".to_string(), json!(context.generation));

        build_result(
            base.trace_id().to_string(),
            base.diagnosis().to_string(),
            base.improvements().to_vec(),
            base.confidence(),
            format!("{}{trend_note}{operator_note}", base.reasoning()),
            reordered,
            metadata,
        )
    }
}

/// Construct a result from values this module already keeps in range.
fn build_result(
    trace_id: String,
    diagnosis: String,
    improvements: Vec<String>,
    confidence: f64,
    reasoning: String,
    mutations: Vec<MutationKind>,
    metadata: BTreeMap<String, serde_json::Value>,
) -> ReflectionResult {
    ReflectionResult::new(
        trace_id,
        diagnosis,
        improvements,
        confidence.clamp(0.0, 1.0),
        reasoning,
        mutations,
        metadata,
    )
    .expect("confidence is clamped into range")
}

fn summarize_patterns(patterns: &ExecutionPatterns, trace_count: usize) -> String {
    format!(
        "{} trace(s): {} model call(s), {} module event(s), {} token(s) total, {} failure(s), models: [{}]",
        trace_count,
        patterns.llm_trace_count,
        patterns.module_trace_count,
        patterns.total_tokens,
        patterns.error_count,
        patterns
            .unique_models
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::llm_trace;
    use async_trait::async_trait;

    struct FixedModel {
        response: ReflectionResponse,
    }

    #[async_trait]
    impl ReflectionModel for FixedModel {
        fn model_ref(&self) -> String {
            "mock/reflector".to_string()
        }

        async fn reflect(&self, _request: ReflectionRequest) -> anyhow::Result<ReflectionResponse> {
            Ok(self.response.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ReflectionModel for FailingModel {
        fn model_ref(&self) -> String {
            "mock/failing".to_string()
        }

        async fn reflect(&self, _request: ReflectionRequest) -> anyhow::Result<ReflectionResponse> {
            anyhow::bail!("provider unavailable")
        }
    }

    fn engine() -> ReflectionEngine {
        ReflectionEngine::new(ReflectionThresholds::default())
    }

    // ── Terminal case ──

    #[test]
    fn test_empty_traces_is_terminal() {
        let result = engine().reflect_on_traces(&[]);
        assert_eq!(result.confidence(), 0.0);
        assert!(result.diagnosis().to_lowercase().contains("no execution traces"));
        assert!(result.improvements().is_empty());
        assert!(result.suggested_mutations().is_empty());
    }

    // ── Patterns ──

    #[test]
    fn test_analyze_patterns_counts_and_models() {
        let traces = vec![
            llm_trace("t1", 300, "model-a"),
            llm_trace("t2", 200, "model-b"),
            llm_trace("t3", 100, "model-a"),
        ];
        let patterns = engine().analyze_execution_patterns(&traces);
        assert_eq!(patterns.llm_trace_count, 3);
        assert_eq!(patterns.total_tokens, 600);
        assert_eq!(patterns.unique_models.len(), 2);
    }

    // ── Suggestions ──

    #[test]
    fn test_suggestions_differ_for_token_extremes() {
        let eng = engine();
        let heavy = ExecutionPatterns {
            llm_trace_count: 4,
            total_tokens: 50_000,
            ..Default::default()
        };
        let light = ExecutionPatterns {
            llm_trace_count: 4,
            total_tokens: 40,
            ..Default::default()
        };
        let heavy_out = eng.generate_improvement_suggestions(&heavy);
        let light_out = eng.generate_improvement_suggestions(&light);
        assert!(!heavy_out.is_empty());
        assert!(!light_out.is_empty());
        assert_ne!(heavy_out, light_out);
    }

    #[test]
    fn test_mutations_stay_in_fixed_set() {
        let eng = engine();
        for patterns in [
            ExecutionPatterns {
                llm_trace_count: 3,
                total_tokens: 100_000,
                error_count: 3,
                ..Default::default()
            },
            ExecutionPatterns {
                llm_trace_count: 3,
                total_tokens: 10,
                ..Default::default()
            },
        ] {
            let kinds = eng.suggest_mutations(&patterns);
            assert!(!kinds.is_empty());
            for kind in kinds {
                assert!(MutationKind::ALL.contains(&kind));
            }
        }
    }

    #[test]
    fn test_token_heavy_suggests_simplify() {
        let patterns = ExecutionPatterns {
            llm_trace_count: 2,
            total_tokens: 100_000,
            ..Default::default()
        };
        let kinds = engine().suggest_mutations(&patterns);
        assert!(kinds.contains(&MutationKind::Simplify));
    }

    // ── LLM path ──

    #[tokio::test]
    async fn test_llm_reflection_filters_unknown_mutations() {
        let model = FixedModel {
            response: ReflectionResponse {
                diagnosis: "Instruction is ambiguous about output format".to_string(),
                improvements: vec!["State the output schema".to_string()],
                confidence: 0.8,
                reasoning: "Failures cluster on formatting".to_string(),
                suggested_mutations: vec![
                    "rewrite".to_string(),
                    "transmogrify".to_string(),
                    "simplify".to_string(),
                ],
                insights: Some(vec!["formatting".to_string()]),
            },
        };
        let eng = engine().with_model(Arc::new(model));
        let result = eng.reflect_with_llm(&[llm_trace("t1", 100, "m")]).await;
        assert_eq!(
            result.suggested_mutations(),
            &[MutationKind::Rewrite, MutationKind::Simplify]
        );
        assert!((result.confidence() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_llm_reflection_degrades_on_bad_confidence() {
        let model = FixedModel {
            response: ReflectionResponse {
                diagnosis: "something".to_string(),
                improvements: vec![],
                confidence: 7.5,
                reasoning: String::new(),
                suggested_mutations: vec![],
                insights: None,
            },
        };
        let eng = engine().with_model(Arc::new(model));
        let result = eng.reflect_with_llm(&[llm_trace("t1", 100, "m")]).await;
        assert!(result.confidence() < 0.5);
        assert!(result.diagnosis().to_lowercase().contains("parse"));
    }

    #[tokio::test]
    async fn test_llm_reflection_degrades_on_model_error() {
        let eng = engine().with_model(Arc::new(FailingModel));
        let result = eng.reflect_with_llm(&[llm_trace("t1", 100, "m")]).await;
        assert!(result.confidence() < 0.5);
        assert!(!result.diagnosis().is_empty());
    }

    #[tokio::test]
    async fn test_llm_reflection_without_model_uses_rules() {
        let eng = engine();
        let result = eng.reflect_with_llm(&[llm_trace("t1", 100, "m")]).await;
        assert_eq!(
            result.metadata().get("source"),
            Some(&serde_json::json!("rules"))
        );
    }

    // ── Context ──

    #[test]
    fn test_context_deprioritizes_overused_kind() {
        let eng = engine();
        let traces = vec![llm_trace("t1", 100_000, "m")];
        // Token-heavy traces suggest Simplify first; saturate its recent use.
        let context = OptimizationContext {
            generation: 4,
            recent_mutations: vec![
                MutationKind::Simplify,
                MutationKind::Simplify,
                MutationKind::Simplify,
                MutationKind::Rewrite,
            ],
            recent_crossovers: vec![],
            trend: Some(Trend::Declining),
        };
        let plain = eng.reflect_on_traces(&traces);
        assert_eq!(plain.suggested_mutations().first(), Some(&MutationKind::Simplify));

        let contextual = eng.reflection_with_context(&traces, &context);
        assert_ne!(
            contextual.suggested_mutations().first(),
            Some(&MutationKind::Simplify),
            "overused kind must lose priority"
        );
        assert!(!contextual.suggested_mutations().is_empty());
    }
}
