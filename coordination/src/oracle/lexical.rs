//! Deterministic text heuristics.

use std::collections::HashSet;

const NEGATIONS: [&str; 5] = ["not", "never", "no", "cannot", "impossible"];

/// Lowercased whitespace tokens.
pub fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// `|A∩B| / |A∪B|` over lowercased tokens. 0 if either side is empty.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// Cosine similarity. 0 for mismatched lengths or a zero vector.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let na: f64 = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// One side negates what the other asserts, over a shared core of more
/// than three words.
pub fn contradiction(a: &str, b: &str) -> bool {
    let (ta, tb) = (tokens(a), tokens(b));
    NEGATIONS.iter().any(|neg| {
        if ta.contains(*neg) == tb.contains(*neg) {
            return false;
        }
        let shared = ta
            .intersection(&tb)
            .filter(|w| w.as_str() != *neg)
            .count();
        shared > 3
    })
}

/// Keyword check of a claim against a constraint.
///
/// A `must`/`required` constraint is broken when none of its key terms
/// (longer than four characters) appear in the claim. A `must not` /
/// `cannot` constraint is broken when one of its terms (longer than
/// three characters) appears.
pub fn violation(claim: &str, constraint: &str) -> bool {
    let claim = claim.to_lowercase();
    let constraint = constraint.to_lowercase();
    let prohibitive = constraint.contains("must not") || constraint.contains("cannot");

    if !prohibitive && (constraint.contains("must") || constraint.contains("required")) {
        let key_terms: Vec<&str> = constraint
            .split_whitespace()
            .filter(|w| w.len() > 4 && !matches!(*w, "must" | "required" | "should"))
            .collect();
        if !key_terms.is_empty() && !key_terms.iter().any(|t| claim.contains(t)) {
            return true;
        }
    }

    if prohibitive {
        let stripped = constraint.replace("must not", "").replace("cannot", "");
        return stripped
            .split_whitespace()
            .filter(|t| t.len() > 3)
            .any(|t| claim.contains(t));
    }

    false
}

/// Reasoned attacks are longer than 20 characters and argue causally.
pub fn attack_is_reasoned(reasoning: &str) -> bool {
    let lower = reasoning.to_lowercase();
    reasoning.len() > 20 && (lower.contains("because") || lower.contains("therefore"))
}
