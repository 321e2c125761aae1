//! Candidate fitness evaluation.
//!
//! Evaluation is I/O-bound: each example may invoke a remote model call, so
//! per-example calls run through a bounded, order-preserving concurrent
//! pipeline. Failures never escape an evaluation — a failing example scores
//! zero and is counted, a failing candidate gets a zero score with its
//! error count in metadata.

use futures::stream::{self, StreamExt};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use evolv_shared::{EvolvId, Example, Metric, Program, TraceEvent};

use crate::config::EvolutionConfig;
use crate::traces::TraceCollector;

use super::types::{FitnessScore, ScoreWeights};

/// Telemetry from one example call, consumed by secondary metrics.
#[derive(Debug, Clone)]
pub struct CallObservation {
    pub score: f64,
    pub tokens: u64,
    pub latency_ms: f64,
    pub response_len: usize,
    pub failed: bool,
}

/// A batch-level objective computed over a candidate's call telemetry.
/// Implementations must return values in [0.0, 1.0].
pub trait SecondaryMetric: Send + Sync {
    fn name(&self) -> &'static str;
    fn score(&self, observations: &[CallObservation]) -> f64;
}

/// Decreasing function of mean token usage per example: 1.0 at or below
/// the budget, asymptotically penalized above it.
pub struct TokenEfficiency {
    pub budget: u64,
}

impl SecondaryMetric for TokenEfficiency {
    fn name(&self) -> &'static str {
        "token_efficiency"
    }

    fn score(&self, observations: &[CallObservation]) -> f64 {
        if observations.is_empty() {
            return 1.0;
        }
        let mean = observations.iter().map(|o| o.tokens as f64).sum::<f64>()
            / observations.len() as f64;
        let budget = self.budget.max(1) as f64;
        if mean <= budget {
            1.0
        } else {
            budget / mean
        }
    }
}

/// Structural similarity of the batch's response texts: the inverse of the
/// coefficient of variation of response lengths.
pub struct Consistency;

impl SecondaryMetric for Consistency {
    fn name(&self) -> &'static str {
        "consistency"
    }

    fn score(&self, observations: &[CallObservation]) -> f64 {
        let lens: Vec<f64> = observations
            .iter()
            .filter(|o| !o.failed)
            .map(|o| o.response_len as f64)
            .collect();
        if lens.len() <= 1 {
            return 1.0;
        }
        let mean = lens.iter().sum::<f64>() / lens.len() as f64;
        if mean <= f64::EPSILON {
            return 1.0;
        }
        let variance = lens.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / lens.len() as f64;
        let cv = variance.sqrt() / mean;
        (1.0 / (1.0 + cv)).clamp(0.0, 1.0)
    }
}

/// Decreasing function of mean per-call wall-clock time.
pub struct Latency {
    pub target_ms: f64,
}

impl SecondaryMetric for Latency {
    fn name(&self) -> &'static str {
        "latency"
    }

    fn score(&self, observations: &[CallObservation]) -> f64 {
        if observations.is_empty() {
            return 1.0;
        }
        let mean = observations.iter().map(|o| o.latency_ms).sum::<f64>()
            / observations.len() as f64;
        (self.target_ms / (self.target_ms + mean)).clamp(0.0, 1.0)
    }
}

/// Scores candidate programs over a training set.
pub struct FitnessEvaluator {
    metric: Arc<dyn Metric>,
    weights: ScoreWeights,
    max_concurrency: usize,
    example_timeout: Duration,
    secondary_metrics: Vec<Arc<dyn SecondaryMetric>>,
    collector: Option<Arc<TraceCollector>>,
}

impl FitnessEvaluator {
    #[must_use]
    pub fn new(metric: Arc<dyn Metric>, config: &EvolutionConfig) -> Self {
        let secondary_metrics: Vec<Arc<dyn SecondaryMetric>> = vec![
            Arc::new(TokenEfficiency {
                budget: config.token_budget,
            }),
            Arc::new(Consistency),
            Arc::new(Latency { target_ms: 1000.0 }),
        ];
        Self {
            metric,
            weights: config.weights,
            max_concurrency: config.max_concurrency.max(1),
            example_timeout: Duration::from_secs(config.example_timeout_secs),
            secondary_metrics,
            collector: None,
        }
    }

    /// Route evaluation trace events into the given collector.
    #[must_use]
    pub fn with_collector(mut self, collector: Arc<TraceCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Register an additional secondary metric, replacing any existing
    /// metric with the same name.
    #[must_use]
    pub fn with_secondary_metric(mut self, metric: Arc<dyn SecondaryMetric>) -> Self {
        self.secondary_metrics.retain(|m| m.name() != metric.name());
        self.secondary_metrics.push(metric);
        self
    }

    /// Evaluate one candidate over the training set.
    ///
    /// Never fails: per-example errors and timeouts score zero and are
    /// counted in `errors_count`; a candidate whose every example fails
    /// scores zero overall.
    pub async fn evaluate_candidate(
        &self,
        program: &Arc<dyn Program>,
        trainset: &[Example],
    ) -> FitnessScore {
        if trainset.is_empty() {
            return FitnessScore::failed(0)
                .with_metadata("empty_trainset", json!(true));
        }

        let span_id = EvolvId::new().to_string();
        let observations: Vec<CallObservation> = stream::iter(0..trainset.len())
            .map(|index| {
                let program = program.clone();
                let span_id = span_id.clone();
                async move {
                    let example = &trainset[index];
                    self.evaluate_example(&program, example, index, &span_id).await
                }
            })
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let errors = observations.iter().filter(|o| o.failed).count() as u64;
        self.emit_trace(
            TraceEvent::new("module.evaluate")
                .with_span_id(&span_id)
                .with_attribute("examples", json!(trainset.len()))
                .with_attribute("errors", json!(errors)),
        );

        if errors as usize == trainset.len() {
            return FitnessScore::failed(errors);
        }

        let primary = observations.iter().map(|o| o.score).sum::<f64>()
            / observations.len() as f64;
        let secondary: BTreeMap<String, f64> = self
            .secondary_metrics
            .iter()
            .map(|m| (m.name().to_string(), m.score(&observations).clamp(0.0, 1.0)))
            .collect();

        match FitnessScore::new(primary.clamp(0.0, 1.0), secondary, &self.weights) {
            Ok(score) => {
                if errors > 0 {
                    score.with_metadata("errors_count", json!(errors))
                } else {
                    score
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Fitness construction failed, scoring candidate as failed");
                FitnessScore::failed(errors)
            }
        }
    }

    async fn evaluate_example(
        &self,
        program: &Arc<dyn Program>,
        example: &Example,
        index: usize,
        span_id: &str,
    ) -> CallObservation {
        let started = std::time::Instant::now();
        let outcome = timeout(self.example_timeout, program.call(&example.inputs)).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut event = TraceEvent::new("llm.call")
            .with_span_id(span_id)
            .with_attribute("latency_ms", json!(latency_ms))
            .with_metadata("example_index", json!(index));

        match outcome {
            Ok(Ok(prediction)) => {
                let raw = self.metric.score(example, &prediction);
                // A metric returning garbage fails the example, not the run.
                let (score, failed) = if raw.is_finite() {
                    (raw.clamp(0.0, 1.0), false)
                } else {
                    tracing::warn!(example = index, "Metric returned non-finite score");
                    (0.0, true)
                };
                event = event
                    .with_attribute("prompt_tokens", json!(prediction.usage.prompt_tokens))
                    .with_attribute("completion_tokens", json!(prediction.usage.completion_tokens));
                if let Some(model) = &prediction.model {
                    event = event.with_attribute("model", json!(model));
                }
                self.emit_trace(event);
                CallObservation {
                    score,
                    tokens: prediction.usage.total(),
                    latency_ms,
                    response_len: prediction.text().len(),
                    failed,
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(example = index, error = %e, "Example call failed");
                self.emit_trace(
                    event
                        .with_attribute("error", json!(true))
                        .with_metadata("error_message", json!(e.to_string())),
                );
                CallObservation {
                    score: 0.0,
                    tokens: 0,
                    latency_ms,
                    response_len: 0,
                    failed: true,
                }
            }
            Err(_) => {
                tracing::debug!(example = index, "Example call timed out");
                self.emit_trace(
                    event
                        .with_attribute("error", json!(true))
                        .with_metadata("error_message", json!("timeout")),
                );
                CallObservation {
                    score: 0.0,
                    tokens: 0,
                    latency_ms,
                    response_len: 0,
                    failed: true,
                }
            }
        }
    }

    fn emit_trace(&self, event: TraceEvent) {
        if let Some(collector) = &self.collector {
            collector.ingest(event);
        }
    }

    /// Evaluate a batch of programs, order-preserving. Empty input yields
    /// empty output.
    pub async fn batch_evaluate(
        &self,
        programs: &[Arc<dyn Program>],
        trainset: &[Example],
    ) -> Vec<FitnessScore> {
        let mut scores = Vec::with_capacity(programs.len());
        for program in programs {
            scores.push(self.evaluate_candidate(program, trainset).await);
        }
        scores
    }

    /// Order two scores by overall quality. Antisymmetric; equal inputs
    /// compare equal.
    #[must_use]
    pub fn compare_candidates(a: &FitnessScore, b: &FitnessScore) -> Ordering {
        a.overall_score()
            .partial_cmp(&b.overall_score())
            .unwrap_or(Ordering::Equal)
    }

    /// Indices of `scores` sorted best-first; stable for ties.
    #[must_use]
    pub fn rank_candidates(scores: &[FitnessScore]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| Self::compare_candidates(&scores[b], &scores[a]));
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{keyword_metric, MockProgram};
    use crate::traces::TraceCollector;

    fn trainset(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| {
                Example::new(
                    [("question".to_string(), format!("q{i}"))],
                    [("answer".to_string(), "expected".to_string())],
                )
            })
            .collect()
    }

    fn evaluator() -> FitnessEvaluator {
        FitnessEvaluator::new(Arc::new(keyword_metric()), &EvolutionConfig::default())
    }

    // ── Candidate evaluation ──

    #[tokio::test]
    async fn test_perfect_candidate_scores_full_primary() {
        let program: Arc<dyn Program> =
            Arc::new(MockProgram::new("Answer").with_response("expected"));
        let score = evaluator().evaluate_candidate(&program, &trainset(3)).await;
        assert!((score.primary_score() - 1.0).abs() < 1e-9);
        // Lower bound: overall >= primary * primary_weight
        assert!(score.overall_score() >= score.primary_score() * 0.6 - 1e-9);
        assert_eq!(score.errors_count(), 0);
    }

    #[tokio::test]
    async fn test_all_failures_score_zero_with_counted_errors() {
        let program: Arc<dyn Program> = Arc::new(MockProgram::new("Answer").failing());
        let score = evaluator().evaluate_candidate(&program, &trainset(4)).await;
        assert_eq!(score.overall_score(), 0.0);
        assert_eq!(score.errors_count(), 4);
    }

    #[tokio::test]
    async fn test_partial_failures_keep_evaluating() {
        let program: Arc<dyn Program> = Arc::new(
            MockProgram::new("Answer")
                .with_response("expected")
                .failing_on(&[1, 3]),
        );
        let score = evaluator().evaluate_candidate(&program, &trainset(4)).await;
        // 2 of 4 examples succeed
        assert!((score.primary_score() - 0.5).abs() < 1e-9);
        assert_eq!(score.errors_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_trainset() {
        let program: Arc<dyn Program> = Arc::new(MockProgram::new("Answer"));
        let score = evaluator().evaluate_candidate(&program, &[]).await;
        assert_eq!(score.overall_score(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_scored_failure() {
        let config = EvolutionConfig {
            example_timeout_secs: 1,
            ..Default::default()
        };
        let program: Arc<dyn Program> = Arc::new(
            MockProgram::new("Answer")
                .with_response("expected")
                .with_delay(Duration::from_secs(5)),
        );
        let eval = FitnessEvaluator::new(Arc::new(keyword_metric()), &config);

        let score = eval.evaluate_candidate(&program, &trainset(1)).await;
        assert_eq!(score.overall_score(), 0.0);
        assert_eq!(score.errors_count(), 1);
    }

    #[tokio::test]
    async fn test_traces_emitted_per_example() {
        let collector = Arc::new(TraceCollector::new());
        let program: Arc<dyn Program> =
            Arc::new(MockProgram::new("Answer").with_response("expected"));
        let eval = evaluator().with_collector(collector.clone());
        eval.evaluate_candidate(&program, &trainset(3)).await;

        assert_eq!(collector.llm_traces().len(), 3);
        assert_eq!(collector.module_traces().len(), 1);
    }

    // ── Batch ──

    #[tokio::test]
    async fn test_batch_evaluate_order_preserving() {
        let good: Arc<dyn Program> =
            Arc::new(MockProgram::new("Answer").with_response("expected"));
        let bad: Arc<dyn Program> = Arc::new(MockProgram::new("Answer").failing());
        let scores = evaluator()
            .batch_evaluate(&[bad.clone(), good.clone(), bad], &trainset(2))
            .await;
        assert_eq!(scores.len(), 3);
        assert_eq!(scores[0].overall_score(), 0.0);
        assert!(scores[1].overall_score() > 0.0);
        assert_eq!(scores[2].overall_score(), 0.0);
    }

    #[tokio::test]
    async fn test_batch_evaluate_empty() {
        let scores = evaluator().batch_evaluate(&[], &trainset(2)).await;
        assert!(scores.is_empty());
    }

    // ── Comparison & ranking ──

    #[test]
    fn test_compare_antisymmetry_and_reflexivity() {
        let weights = ScoreWeights::default();
        let a = FitnessScore::new(0.3, BTreeMap::new(), &weights).unwrap();
        let b = FitnessScore::new(0.8, BTreeMap::new(), &weights).unwrap();
        assert_eq!(
            FitnessEvaluator::compare_candidates(&a, &b),
            FitnessEvaluator::compare_candidates(&b, &a).reverse()
        );
        assert_eq!(
            FitnessEvaluator::compare_candidates(&a, &a),
            Ordering::Equal
        );
    }

    #[test]
    fn test_rank_candidates_best_first_stable() {
        let weights = ScoreWeights::default();
        let scores = vec![
            FitnessScore::new(0.5, BTreeMap::new(), &weights).unwrap(),
            FitnessScore::new(0.9, BTreeMap::new(), &weights).unwrap(),
            FitnessScore::new(0.5, BTreeMap::new(), &weights).unwrap(),
        ];
        assert_eq!(FitnessEvaluator::rank_candidates(&scores), vec![1, 0, 2]);
        assert!(FitnessEvaluator::rank_candidates(&[]).is_empty());
        assert_eq!(
            FitnessEvaluator::rank_candidates(&scores[..1]),
            vec![0]
        );
    }

    // ── Secondary metrics ──

    fn obs(tokens: u64, latency_ms: f64, response_len: usize) -> CallObservation {
        CallObservation {
            score: 1.0,
            tokens,
            latency_ms,
            response_len,
            failed: false,
        }
    }

    #[test]
    fn test_token_efficiency_decreases_above_budget() {
        let metric = TokenEfficiency { budget: 100 };
        let low = metric.score(&[obs(50, 0.0, 10)]);
        let at = metric.score(&[obs(100, 0.0, 10)]);
        let high = metric.score(&[obs(400, 0.0, 10)]);
        assert_eq!(low, 1.0);
        assert_eq!(at, 1.0);
        assert!(high < at);
        assert!(high > 0.0);
    }

    #[test]
    fn test_consistency_rewards_similar_lengths() {
        let metric = Consistency;
        let uniform = metric.score(&[obs(0, 0.0, 100), obs(0, 0.0, 100), obs(0, 0.0, 100)]);
        let varied = metric.score(&[obs(0, 0.0, 10), obs(0, 0.0, 500), obs(0, 0.0, 90)]);
        assert!((uniform - 1.0).abs() < 1e-9);
        assert!(varied < uniform);
    }

    #[test]
    fn test_latency_decreasing() {
        let metric = Latency { target_ms: 1000.0 };
        let fast = metric.score(&[obs(0, 50.0, 10)]);
        let slow = metric.score(&[obs(0, 5000.0, 10)]);
        assert!(fast > slow);
        assert!(slow > 0.0);
    }
}
