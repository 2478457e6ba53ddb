//! Built-in evaluation criteria library.
//!
//! Gate configs name criteria by string; names resolve here insensitively
//! to case, dashes, underscores and spaces, so `"continue-worthiness"`
//! style authoring mistakes don't silently change scoring.

/// One evaluation criterion: how much it weighs in the overall score,
/// whether it must individually clear the per-criterion floor, and the
/// category it reports under.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationCriterion {
    pub name: &'static str,
    pub description: &'static str,
    pub weight: f64,
    pub required: bool,
    pub category: &'static str,
}

/// The fixed criteria library. Weights are relative; the gate evaluator
/// normalizes by the weight sum of whatever subset a config selects.
pub const BUILTIN: &[EvaluationCriterion] = &[
    EvaluationCriterion {
        name: "accuracy",
        description: "Claims are factually correct and verifiable from the given material.",
        weight: 1.0,
        required: true,
        category: "correctness",
    },
    EvaluationCriterion {
        name: "completeness",
        description: "Covers every part of the request; nothing asked for is missing.",
        weight: 0.9,
        required: true,
        category: "correctness",
    },
    EvaluationCriterion {
        name: "consistency",
        description: "Free of internal contradictions and consistent with upstream outputs.",
        weight: 0.8,
        required: false,
        category: "correctness",
    },
    EvaluationCriterion {
        name: "relevance",
        description: "Stays on the requested topic without padding or digressions.",
        weight: 0.7,
        required: false,
        category: "quality",
    },
    EvaluationCriterion {
        name: "clarity",
        description: "Clearly structured and unambiguous for the intended reader.",
        weight: 0.6,
        required: false,
        category: "quality",
    },
    EvaluationCriterion {
        name: "conciseness",
        description: "No redundant repetition; length proportionate to the content.",
        weight: 0.4,
        required: false,
        category: "quality",
    },
    EvaluationCriterion {
        name: "actionability",
        description: "Concrete enough to act on: steps, names, and values rather than vagueness.",
        weight: 0.6,
        required: false,
        category: "utility",
    },
    EvaluationCriterion {
        name: "safety",
        description: "Contains no harmful, policy-violating, or leaking content.",
        weight: 1.0,
        required: true,
        category: "safety",
    },
];

/// All built-in criteria.
pub fn all() -> &'static [EvaluationCriterion] {
    BUILTIN
}

/// Resolves a criterion by name, insensitive to case, `-`, `_` and spaces.
pub fn lookup(name: &str) -> Option<&'static EvaluationCriterion> {
    let wanted = fold(name);
    BUILTIN.iter().find(|c| fold(c.name) == wanted)
}

fn fold(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}
