//! Instruction-level genetic operators: crossover and mutation.
//!
//! Operators work on whitespace-tokenizable instruction text and never fail
//! outward: any internal problem degrades to passing the parents through
//! unchanged.

use rand::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use evolv_shared::Program;

use super::types::{CrossoverType, MutationKind};

/// Window of recent operator applications kept for diversity reporting.
const TYPE_HISTORY_LIMIT: usize = 32;

/// Filler words excluded when collecting salient vocabulary for blending.
const STOP_WORDS: [&str; 16] = [
    "the", "a", "an", "and", "or", "of", "to", "in", "on", "for", "with", "is", "are", "be",
    "that", "this",
];

// ══════════════════════════════════════════════════════════════
// Crossover
// ══════════════════════════════════════════════════════════════

/// Combines two parent programs' instructions into offspring instructions.
pub struct CrossoverEngine {
    crossover_rate: f64,
    types: Vec<CrossoverType>,
    rng: StdRng,
    type_history: Vec<CrossoverType>,
}

impl CrossoverEngine {
    #[must_use]
    pub fn new(crossover_rate: f64, types: Vec<CrossoverType>) -> Self {
        Self {
            crossover_rate,
            types,
            rng: StdRng::from_entropy(),
            type_history: Vec::new(),
        }
    }

    /// Fixed RNG seed for reproducible operator choices.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    #[must_use]
    pub fn recent_types(&self) -> &[CrossoverType] {
        &self.type_history
    }

    /// Cross two parents, returning two offspring. With probability
    /// `1 - crossover_rate`, or when an operator produces unusable output,
    /// the parents are returned unchanged.
    pub fn crossover_programs(
        &mut self,
        parent_a: &Arc<dyn Program>,
        parent_b: &Arc<dyn Program>,
    ) -> [Arc<dyn Program>; 2] {
        let pass_through = [parent_a.clone(), parent_b.clone()];

        if self.crossover_rate <= 0.0 || !self.rng.gen_bool(self.crossover_rate.clamp(0.0, 1.0)) {
            return pass_through;
        }

        let instr_a = parent_a.instruction_text();
        let instr_b = parent_b.instruction_text();
        let ty = self.select_crossover_type(&instr_a, &instr_b);
        let [child_a, child_b] = self.apply_crossover(&instr_a, &instr_b, ty);

        // Operator failure: unusable offspring fall back to the parents.
        if child_a.split_whitespace().next().is_none()
            || child_b.split_whitespace().next().is_none()
        {
            tracing::warn!(crossover_type = %ty, "Crossover produced empty offspring, passing parents through");
            return pass_through;
        }

        self.type_history.push(ty);
        if self.type_history.len() > TYPE_HISTORY_LIMIT {
            self.type_history.remove(0);
        }

        [
            parent_a.with_instruction(&child_a),
            parent_b.with_instruction(&child_b),
        ]
    }

    /// Choose an operator from the configured set, steered by instruction
    /// shape: short instructions blend well, strongly asymmetric pairs suit
    /// the structured template, everything else is sampled.
    pub fn select_crossover_type(&mut self, instr_a: &str, instr_b: &str) -> CrossoverType {
        let len_a = instr_a.split_whitespace().count();
        let len_b = instr_b.split_whitespace().count();

        let preferred = if len_a <= 8 && len_b <= 8 {
            CrossoverType::Blend
        } else if len_a.abs_diff(len_b) > len_a.min(len_b) {
            CrossoverType::Structured
        } else {
            CrossoverType::Uniform
        };

        if self.types.contains(&preferred) {
            preferred
        } else {
            *self
                .types
                .choose(&mut self.rng)
                .unwrap_or(&CrossoverType::Uniform)
        }
    }

    /// Apply one operator to a pair of instructions. A type outside the
    /// configured set returns the inputs unchanged.
    #[must_use]
    pub fn apply_crossover(
        &self,
        instr_a: &str,
        instr_b: &str,
        ty: CrossoverType,
    ) -> [String; 2] {
        if !self.types.contains(&ty) {
            return [instr_a.to_string(), instr_b.to_string()];
        }
        match ty {
            CrossoverType::Uniform => uniform_crossover(instr_a, instr_b),
            CrossoverType::Blend => blend_crossover(instr_a, instr_b),
            CrossoverType::Structured => structured_crossover(instr_a, instr_b),
        }
    }

    /// Cross sequential pairs of a population. An odd final member passes
    /// through unmodified; output size equals input size.
    pub fn batch_crossover(&mut self, population: &[Arc<dyn Program>]) -> Vec<Arc<dyn Program>> {
        let mut next = Vec::with_capacity(population.len());
        let mut chunks = population.chunks_exact(2);
        for pair in chunks.by_ref() {
            let [a, b] = self.crossover_programs(&pair[0], &pair[1]);
            next.push(a);
            next.push(b);
        }
        if let [odd] = chunks.remainder() {
            next.push(odd.clone());
        }
        next
    }
}

/// Variety of recent operator usage in [0.0, 1.0]: 0.0 for an empty or
/// all-identical history, 1.0 when every configured kind appears.
#[must_use]
pub fn crossover_diversity(type_history: &[CrossoverType]) -> f64 {
    if type_history.is_empty() {
        return 0.0;
    }
    let mut seen = [false; CrossoverType::ALL.len()];
    for ty in type_history {
        seen[*ty as usize] = true;
    }
    let distinct = seen.iter().filter(|&&s| s).count();
    (distinct as f64 - 1.0) / (CrossoverType::ALL.len() as f64 - 1.0)
}

/// Deterministic seed for a parent pair: identical inputs must yield
/// identical uniform-crossover outputs.
fn pair_seed(instr_a: &str, instr_b: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(instr_a.as_bytes());
    hasher.update([0u8]);
    hasher.update(instr_b.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Token-level interleave: each output position takes its token from a
/// parent chosen by a content-seeded coin flip, the second offspring taking
/// the complement.
fn uniform_crossover(instr_a: &str, instr_b: &str) -> [String; 2] {
    let tokens_a: Vec<&str> = instr_a.split_whitespace().collect();
    let tokens_b: Vec<&str> = instr_b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return [instr_a.to_string(), instr_b.to_string()];
    }

    let mut rng = StdRng::seed_from_u64(pair_seed(instr_a, instr_b));
    let len = tokens_a.len().max(tokens_b.len());
    let mut child_a = Vec::with_capacity(len);
    let mut child_b = Vec::with_capacity(len);

    for i in 0..len {
        let from_a = tokens_a.get(i).copied();
        let from_b = tokens_b.get(i).copied();
        let take_a_first = rng.gen_bool(0.5);
        let (first, second) = if take_a_first {
            (from_a, from_b)
        } else {
            (from_b, from_a)
        };
        if let Some(token) = first.or(second) {
            child_a.push(token);
        }
        if let Some(token) = second.or(first) {
            child_b.push(token);
        }
    }

    [child_a.join(" "), child_b.join(" ")]
}

/// Salient (non-stop-word, deduplicated) vocabulary of an instruction.
fn salient_terms(instruction: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in instruction.split_whitespace() {
        let word: String = token
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if word.len() > 3 && !STOP_WORDS.contains(&word.as_str()) && !seen.contains(&word) {
            seen.push(word);
        }
    }
    seen
}

/// Keep each parent's sentence skeleton and fold in the other parent's
/// salient vocabulary, so both offspring reflect both parents.
fn blend_crossover(instr_a: &str, instr_b: &str) -> [String; 2] {
    let blend = |base: &str, other: &str| {
        let base_terms = salient_terms(base);
        let borrowed: Vec<String> = salient_terms(other)
            .into_iter()
            .filter(|term| !base_terms.contains(term))
            .take(4)
            .collect();
        if borrowed.is_empty() {
            base.to_string()
        } else {
            format!(
                "{} Pay attention to {}.",
                base.trim_end(),
                borrowed.join(", ")
            )
        }
    };
    [blend(instr_a, instr_b), blend(instr_b, instr_a)]
}

/// Leading/trailing halves of an instruction's tokens.
fn split_halves(instruction: &str) -> (String, String) {
    let tokens: Vec<&str> = instruction.split_whitespace().collect();
    let mid = tokens.len().div_ceil(2);
    (tokens[..mid].join(" "), tokens[mid..].join(" "))
}

/// Fill a fixed grammatical template with content segments from each
/// parent: offspring A opens with A's head and closes with B's tail,
/// offspring B the reverse.
fn structured_crossover(instr_a: &str, instr_b: &str) -> [String; 2] {
    let (head_a, tail_a) = split_halves(instr_a);
    let (head_b, tail_b) = split_halves(instr_b);

    let compose = |head: &str, tail: &str| {
        let head = if head.is_empty() { "proceed" } else { head };
        if tail.is_empty() {
            format!("First, {head}. Then check the result before answering.")
        } else {
            format!("First, {head}. Then, {tail}. Check the result before answering.")
        }
    };

    [compose(&head_a, &tail_b), compose(&head_b, &tail_a)]
}

// ══════════════════════════════════════════════════════════════
// Mutation
// ══════════════════════════════════════════════════════════════

const EXPANSION_CLAUSES: [&str; 4] = [
    "Think through the problem step by step before answering.",
    "Include the key details that justify the answer.",
    "Be explicit about any assumptions you make.",
    "Double-check edge cases before finalizing the answer.",
];

const COMBINE_CLAUSES: [&str; 3] = [
    "Verify the answer against the original question.",
    "Summarize the reasoning in one sentence at the end.",
    "Prefer precise wording over general statements.",
];

const REPHRASE_PAIRS: [(&str, &str); 5] = [
    ("answer", "respond to"),
    ("question", "query"),
    ("describe", "explain"),
    ("list", "enumerate"),
    ("write", "compose"),
];

/// Apply one mutation kind to an instruction, producing a new instruction.
#[must_use]
pub fn mutate_instruction(rng: &mut StdRng, instruction: &str, kind: MutationKind) -> String {
    let trimmed = instruction.trim();
    if trimmed.is_empty() {
        return EXPANSION_CLAUSES[0].to_string();
    }

    match kind {
        MutationKind::Rewrite => {
            // Rotate sentence order; a single sentence gets a fresh framing.
            let sentences: Vec<&str> = trimmed
                .split_inclusive(['.', '!', '?'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if sentences.len() > 1 {
                let pivot = rng.gen_range(1..sentences.len());
                let mut rotated = sentences[pivot..].to_vec();
                rotated.extend_from_slice(&sentences[..pivot]);
                rotated.join(" ")
            } else {
                format!("Approach it this way: {trimmed}")
            }
        }
        MutationKind::Expand => {
            let clause = EXPANSION_CLAUSES.choose(rng).unwrap_or(&EXPANSION_CLAUSES[0]);
            format!("{trimmed} {clause}")
        }
        MutationKind::Combine => {
            let clause = COMBINE_CLAUSES.choose(rng).unwrap_or(&COMBINE_CLAUSES[0]);
            format!("{trimmed} Additionally: {clause}")
        }
        MutationKind::Simplify => {
            let first_sentence = trimmed
                .split_inclusive(['.', '!', '?'])
                .next()
                .unwrap_or(trimmed)
                .trim();
            let tokens: Vec<&str> = first_sentence.split_whitespace().collect();
            if tokens.len() > 12 {
                format!("{}.", tokens[..12].join(" ").trim_end_matches('.'))
            } else {
                first_sentence.to_string()
            }
        }
        MutationKind::Rephrase => {
            let lowered = trimmed.to_lowercase();
            for (from, to) in REPHRASE_PAIRS {
                if lowered.contains(from) {
                    return replace_word_case_insensitive(trimmed, from, to);
                }
            }
            format!("Your task: {trimmed}")
        }
    }
}

fn replace_word_case_insensitive(text: &str, from: &str, to: &str) -> String {
    text.split_whitespace()
        .map(|token| {
            let stripped: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
            if stripped.eq_ignore_ascii_case(from) {
                token.to_lowercase().replace(from, to)
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Seed-instruction perturbation used to build the initial population.
/// Variant 0 is always the unmodified seed; later variants append distinct
/// emphasis clauses, cycling with a numbered suffix past the clause list.
#[must_use]
pub fn perturb_seed_instruction(seed: &str, variant_index: usize) -> String {
    const VARIANT_CLAUSES: [&str; 6] = [
        "Think step by step.",
        "Be concise and specific.",
        "Consider edge cases carefully.",
        "Explain the reasoning briefly.",
        "Focus on accuracy over speed.",
        "State the answer first, then justify it.",
    ];

    if variant_index == 0 {
        return seed.to_string();
    }
    let clause_index = (variant_index - 1) % VARIANT_CLAUSES.len();
    let cycle = (variant_index - 1) / VARIANT_CLAUSES.len();
    if cycle == 0 {
        format!("{} {}", seed.trim_end(), VARIANT_CLAUSES[clause_index])
    } else {
        // Keep instructions distinct beyond one full pass over the clauses.
        format!(
            "{} {} (variant {})",
            seed.trim_end(),
            VARIANT_CLAUSES[clause_index],
            variant_index
        )
    }
}
