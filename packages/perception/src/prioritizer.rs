//! Smart candidate prioritization for PDP verification.
//!
//! Verifying every extracted candidate is expensive. This module scores
//! candidates by likelihood of matching the requirements, safely rejects
//! candidates that are definitely the wrong category, and returns a sorted
//! list for verification with early stopping.

use serde::{Deserialize, Serialize};

use crate::models::{FusedProduct, Requirements};

/// Titles that can never satisfy an NVIDIA-GPU laptop requirement.
const WRONG_CATEGORY_MARKERS: &[&str] = &["chromebook", "macbook", "ipad", "tablet"];

/// Integrated-only GPU strings; fatal when a dedicated NVIDIA GPU is required.
const INTEGRATED_GPU_MARKERS: &[&str] = &["intel uhd", "intel iris", "integrated graphics", "radeon graphics"];

const NVIDIA_MARKERS: &[&str] = &["nvidia", "rtx", "geforce", "gtx"];

/// Priority tier after scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    High,
    Medium,
    Low,
}

/// A scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub product: FusedProduct,
    pub score: f32,
    pub tier: PriorityTier,
    pub signals: Vec<String>,
}

/// A safely rejected candidate with its reason.
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub product: FusedProduct,
    pub rejection_reason: String,
}

/// Result of prioritization.
#[derive(Debug, Clone, Default)]
pub struct PrioritizationStats {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub rejected: usize,
}

pub struct PrioritizationResult {
    /// Sorted by score, rejects removed, capped at `2 * max_to_verify`.
    pub prioritized: Vec<ScoredCandidate>,
    pub rejected: Vec<RejectedCandidate>,
    pub stats: PrioritizationStats,
}

/// Score and partition candidates against the requirements.
pub fn prioritize(
    candidates: Vec<FusedProduct>,
    requirements: &Requirements,
    query: &str,
    max_to_verify: usize,
) -> PrioritizationResult {
    let mut scored = Vec::new();
    let mut rejected = Vec::new();
    let mut stats = PrioritizationStats {
        total: candidates.len(),
        ..Default::default()
    };

    let wants_nvidia = wants_nvidia_gpu(requirements, query);
    let query_terms = significant_terms(query);
    let requirement_terms: Vec<String> = requirements
        .hard_requirements
        .iter()
        .flat_map(|r| significant_terms(r))
        .collect();

    for product in candidates {
        if let Some(reason) = safe_reject_reason(&product, wants_nvidia) {
            tracing::debug!(title = %product.title, reason, "candidate safely rejected");
            rejected.push(RejectedCandidate {
                product,
                rejection_reason: reason,
            });
            continue;
        }

        let (score, signals) = score_candidate(&product, &query_terms, &requirement_terms, requirements);
        let tier = if score >= 0.6 {
            PriorityTier::High
        } else if score >= 0.3 {
            PriorityTier::Medium
        } else {
            PriorityTier::Low
        };
        scored.push(ScoredCandidate {
            product,
            score,
            tier,
            signals,
        });
    }

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(max_to_verify * 2);

    for candidate in &scored {
        match candidate.tier {
            PriorityTier::High => stats.high += 1,
            PriorityTier::Medium => stats.medium += 1,
            PriorityTier::Low => stats.low += 1,
        }
    }
    stats.rejected = rejected.len();

    tracing::info!(
        total = stats.total,
        high = stats.high,
        medium = stats.medium,
        low = stats.low,
        rejected = stats.rejected,
        "candidates prioritized"
    );

    PrioritizationResult {
        prioritized: scored,
        rejected,
        stats,
    }
}

/// Does the query or a requirement demand a dedicated NVIDIA GPU?
fn wants_nvidia_gpu(requirements: &Requirements, query: &str) -> bool {
    let combined = format!("{} {}", query.to_lowercase(), requirements.all_text());
    NVIDIA_MARKERS.iter().any(|m| combined.contains(m))
        || combined.contains("dedicated gpu")
        || combined.contains("dedicated graphics")
}

/// A reject is only safe when the candidate is definitively wrong, never
/// merely unknown.
fn safe_reject_reason(product: &FusedProduct, wants_nvidia: bool) -> Option<String> {
    if !wants_nvidia {
        return None;
    }
    let text = format!("{} {}", product.title, product.url).to_lowercase();
    let has_nvidia = NVIDIA_MARKERS.iter().any(|m| text.contains(m));
    if has_nvidia {
        return None;
    }

    if let Some(marker) = WRONG_CATEGORY_MARKERS.iter().find(|m| text.contains(**m)) {
        return Some(format!(
            "wrong category: '{marker}' cannot carry the required NVIDIA GPU"
        ));
    }
    if let Some(marker) = INTEGRATED_GPU_MARKERS.iter().find(|m| text.contains(**m)) {
        return Some(format!(
            "missing NVIDIA GPU: only integrated graphics ('{marker}')"
        ));
    }
    None
}

fn score_candidate(
    product: &FusedProduct,
    query_terms: &[String],
    requirement_terms: &[String],
    requirements: &Requirements,
) -> (f32, Vec<String>) {
    let text = format!(
        "{} {} {}",
        product.title, product.url, product.description
    )
    .to_lowercase();
    let mut signals = Vec::new();

    let query_hits = query_terms.iter().filter(|t| text.contains(t.as_str())).count();
    let query_score = if query_terms.is_empty() {
        0.0
    } else {
        query_hits as f32 / query_terms.len() as f32
    };
    if query_score > 0.5 {
        signals.push(format!("query match {query_hits}/{}", query_terms.len()));
    }

    let req_hits = requirement_terms
        .iter()
        .filter(|t| text.contains(t.as_str()))
        .count();
    let req_score = if requirement_terms.is_empty() {
        query_score
    } else {
        req_hits as f32 / requirement_terms.len() as f32
    };
    if req_hits > 0 {
        signals.push(format!("requirement match {req_hits}/{}", requirement_terms.len()));
    }

    let mut score = query_score * 0.5 + req_score * 0.5;

    // Price inside the requested range is a strong signal.
    if let (Some(price), Some(max)) = (product.best_price(), requirements.price_range.max) {
        if price <= max {
            score += 0.1;
            signals.push("price within budget".to_string());
        } else if price > max * 1.5 {
            score -= 0.2;
            signals.push("price far over budget".to_string());
        }
    }

    if requirements
        .recommended_brands
        .iter()
        .any(|b| text.contains(&b.to_lowercase()))
    {
        score += 0.1;
        signals.push("recommended brand".to_string());
    }

    (score.clamp(0.0, 1.0), signals)
}

fn significant_terms(text: &str) -> Vec<String> {
    const STOP_WORDS: &[&str] = &[
        "find", "search", "buy", "get", "want", "need", "looking", "for", "the", "a", "an",
        "with", "and", "or", "under", "over", "about",
    ];
    text.to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(t))
        .map(str::to_string)
        .collect()
}
