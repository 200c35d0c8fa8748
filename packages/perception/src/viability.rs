//! Solver-driven viability filtering of verified products.
//!
//! Classifies each product against hard requirements and nice-to-haves.
//! The solver's JSON envelope is parsed tolerantly, sanity-checked against
//! its own summary, and backstopped by a keyword match so a flaky rejection
//! cannot throw away an obviously matching product.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use solver_client::{ChatMessage, Solver};

use crate::error::Result;
use crate::models::{Requirements, VerifiedProduct};

/// A product with its viability verdict.
#[derive(Debug, Clone)]
pub struct EvaluatedProduct {
    pub product: VerifiedProduct,
    pub viable: bool,
    pub viability_score: f32,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub rejection_reason: Option<String>,
}

/// Outcome of a filtering pass.
#[derive(Debug, Clone, Default)]
pub struct ViabilityStats {
    pub evaluated: usize,
    pub viable: usize,
    pub rejected: usize,
    pub keyword_overrides: usize,
}

pub struct ViabilityResult {
    pub viable: Vec<EvaluatedProduct>,
    pub rejected: Vec<EvaluatedProduct>,
    pub stats: ViabilityStats,
}

/// Mine structured specs out of a product URL slug. Retailer URLs often
/// encode the full configuration.
pub fn parse_specs_from_url(url: &str) -> HashMap<String, String> {
    let mut specs = HashMap::new();
    let Ok(parsed) = url::Url::parse(url) else {
        return specs;
    };
    let text = parsed
        .path()
        .to_lowercase()
        .replace(['-', '_', '/'], " ");

    static GPU: OnceLock<Regex> = OnceLock::new();
    let gpu = GPU.get_or_init(|| {
        Regex::new(r"(rtx|gtx)\s*(\d{3,4})\s*(ti|super)?").expect("valid gpu regex")
    });
    if let Some(caps) = gpu.captures(&text) {
        let suffix = caps
            .get(3)
            .map(|m| format!(" {}", m.as_str().to_uppercase()))
            .unwrap_or_default();
        specs.insert(
            "gpu".to_string(),
            format!("{} {}{}", caps[1].to_uppercase(), &caps[2], suffix),
        );
    }

    static RAM: OnceLock<Regex> = OnceLock::new();
    let ram = RAM.get_or_init(|| Regex::new(r"(\d+)\s*gb\s*(ddr\d)?").expect("valid ram regex"));
    if let Some(caps) = ram.captures(&text) {
        let kind = caps
            .get(2)
            .map(|m| format!(" {}", m.as_str().to_uppercase()))
            .unwrap_or_default();
        specs.insert("ram".to_string(), format!("{}GB{kind}", &caps[1]));
    }

    static STORAGE: OnceLock<Regex> = OnceLock::new();
    let storage = STORAGE
        .get_or_init(|| Regex::new(r"(\d+)\s*(gb|tb)\s*(?:pcie\s*)?(ssd|nvme|hdd)").expect("valid storage regex"));
    if let Some(caps) = storage.captures(&text) {
        specs.insert(
            "storage".to_string(),
            format!(
                "{}{} {}",
                &caps[1],
                caps[2].to_uppercase(),
                caps[3].to_uppercase()
            ),
        );
    }

    static CPU: OnceLock<Regex> = OnceLock::new();
    let cpu = CPU.get_or_init(|| {
        Regex::new(r"(intel\s*core\s*i\d|amd\s*ryzen\s*\d|core\s*i\d\s*\d+|ryzen\s*\d\s*\d+)")
            .expect("valid cpu regex")
    });
    if let Some(caps) = cpu.captures(&text) {
        specs.insert("cpu".to_string(), caps[1].to_string());
    }

    static DISPLAY: OnceLock<Regex> = OnceLock::new();
    let display =
        DISPLAY.get_or_init(|| Regex::new(r"(\d{3,4})\s*hz|(wuxga|fhd|qhd|uhd|4k)").expect("valid display regex"));
    if let Some(caps) = display.captures(&text) {
        if let Some(hz) = caps.get(1) {
            specs.insert("refresh_rate".to_string(), format!("{}Hz", hz.as_str()));
        } else if let Some(res) = caps.get(2) {
            specs.insert("resolution".to_string(), res.as_str().to_uppercase());
        }
    }

    specs
}

/// Keyword-based viability fallback.
///
/// Returns `Some(true)` when the product text clearly matches the query,
/// `Some(false)` when it clearly does not, `None` when uncertain.
pub fn check_keyword_viability(
    product: &VerifiedProduct,
    requirements: &Requirements,
    query: &str,
) -> Option<bool> {
    const STOP_WORDS: &[&str] = &[
        "find", "search", "buy", "get", "want", "need", "looking", "for", "the", "a", "an",
        "with", "and", "or", "under", "over", "about",
    ];

    let url_specs = parse_specs_from_url(&product.url);
    let specs_text = product
        .specs
        .values()
        .chain(url_specs.values())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let text = format!("{} {} {}", product.title, product.url, specs_text).to_lowercase();

    let query_lower = query.to_lowercase();
    let query_terms: Vec<&str> = query_lower
        .split_whitespace()
        .filter(|t| t.len() > 2 && !STOP_WORDS.contains(t))
        .collect();
    if query_terms.is_empty() {
        return None;
    }

    let matches = query_terms.iter().filter(|t| text.contains(**t)).count();
    let match_ratio = matches as f32 / query_terms.len() as f32;

    let req_ratio = if requirements.hard_requirements.is_empty() {
        match_ratio
    } else {
        let hits = requirements
            .hard_requirements
            .iter()
            .filter(|req| {
                req.split_whitespace()
                    .any(|w| w.len() > 3 && text.contains(&w.to_lowercase()))
            })
            .count();
        hits as f32 / requirements.hard_requirements.len() as f32
    };

    if match_ratio >= 0.6 || req_ratio >= 0.5 {
        return Some(true);
    }
    if match_ratio < 0.2 && req_ratio < 0.2 {
        return Some(false);
    }
    None
}

/// The solver-backed viability filter.
pub struct ViabilityFilter {
    solver: Arc<dyn Solver>,
}

impl ViabilityFilter {
    pub fn new(solver: Arc<dyn Solver>) -> Self {
        Self { solver }
    }

    /// Evaluate products against the requirements, at most `max_per_vendor`
    /// viable per vendor.
    pub async fn filter_viable(
        &self,
        products: Vec<VerifiedProduct>,
        requirements: &Requirements,
        query: &str,
        max_per_vendor: usize,
    ) -> Result<ViabilityResult> {
        if products.is_empty() {
            return Ok(ViabilityResult {
                viable: Vec::new(),
                rejected: Vec::new(),
                stats: ViabilityStats::default(),
            });
        }

        let prompt = build_prompt(&products, requirements, query);
        let response = self
            .solver
            .complete_with_temperature(&[ChatMessage::user(prompt)], 0.2)
            .await?;

        let evaluations = parse_envelope(&response, products.len());
        let mut stats = ViabilityStats {
            evaluated: products.len(),
            ..Default::default()
        };

        let mut viable = Vec::new();
        let mut rejected = Vec::new();
        let mut per_vendor: HashMap<String, usize> = HashMap::new();

        for (index, product) in products.into_iter().enumerate() {
            let evaluation = evaluations.get(&index);
            let mut evaluated = match evaluation {
                Some(e) => EvaluatedProduct {
                    product,
                    viable: e.viable,
                    viability_score: e.score,
                    strengths: e.strengths.clone(),
                    weaknesses: e.weaknesses.clone(),
                    rejection_reason: e.rejection_reason.clone(),
                },
                // Unevaluated products fall through to the keyword check.
                None => EvaluatedProduct {
                    product,
                    viable: false,
                    viability_score: 0.0,
                    strengths: Vec::new(),
                    weaknesses: Vec::new(),
                    rejection_reason: None,
                },
            };

            // Keyword backstop for unclear rejections.
            if !evaluated.viable && is_unclear_rejection(evaluated.rejection_reason.as_deref()) {
                if check_keyword_viability(&evaluated.product, requirements, query) == Some(true) {
                    evaluated.viable = true;
                    evaluated.viability_score = 0.55;
                    evaluated.rejection_reason = None;
                    evaluated
                        .weaknesses
                        .push("viability uncertain, matched by keywords only".to_string());
                    stats.keyword_overrides += 1;
                }
            }

            if evaluated.viable {
                let count = per_vendor.entry(evaluated.product.vendor.clone()).or_insert(0);
                if *count < max_per_vendor {
                    *count += 1;
                    stats.viable += 1;
                    viable.push(evaluated);
                } else {
                    evaluated.viable = false;
                    evaluated.rejection_reason =
                        Some(format!("vendor cap of {max_per_vendor} reached"));
                    stats.rejected += 1;
                    rejected.push(evaluated);
                }
            } else {
                if evaluated.rejection_reason.is_none() {
                    evaluated.rejection_reason = Some("did not meet requirements".to_string());
                }
                stats.rejected += 1;
                rejected.push(evaluated);
            }
        }

        viable.sort_by(|a, b| {
            b.viability_score
                .partial_cmp(&a.viability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        tracing::info!(
            viable = stats.viable,
            rejected = stats.rejected,
            overrides = stats.keyword_overrides,
            "viability filtering complete"
        );
        Ok(ViabilityResult {
            viable,
            rejected,
            stats,
        })
    }
}

struct Evaluation {
    viable: bool,
    score: f32,
    strengths: Vec<String>,
    weaknesses: Vec<String>,
    rejection_reason: Option<String>,
}

fn build_prompt(products: &[VerifiedProduct], requirements: &Requirements, query: &str) -> String {
    let mut listing = String::new();
    for (i, product) in products.iter().enumerate() {
        let mut specs: Vec<String> = product
            .specs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for (k, v) in parse_specs_from_url(&product.url) {
            specs.push(format!("{k}={v} (from url)"));
        }
        listing.push_str(&format!(
            "[{i}] {} | price: {} | vendor: {} | stock: {} | specs: {} | url: {}\n",
            product.title,
            product
                .price
                .map(|p| format!("${p:.2}"))
                .unwrap_or_else(|| "unknown".to_string()),
            product.vendor,
            product.stock_status,
            specs.join(", "),
            product.url,
        ));
    }

    let price_note = match (requirements.price_range.min, requirements.price_range.max) {
        (Some(min), Some(max)) => format!("${min:.0} to ${max:.0}"),
        (None, Some(max)) => format!("up to ${max:.0}"),
        (Some(min), None) => format!("at least ${min:.0}"),
        (None, None) => "unconstrained".to_string(),
    };

    let base = crate::prompts::load("product_viability", crate::prompts::VIABILITY_FALLBACK);
    format!(
        "{base}\n\n\
         User query: \"{query}\"\n\n\
         HARD REQUIREMENTS (every one must be met):\n{hard}\n\n\
         NICE TO HAVES (preferences, not dealbreakers):\n{nice}\n\n\
         Price range: {price_note}\n\n\
         Products:\n{listing}\n\
         Respond with JSON: {{\"evaluations\": [{{\"index\": 0, \"viable\": true, \
         \"viability_score\": 0.0, \"meets_requirements\": {{}}, \"strengths\": [], \
         \"weaknesses\": [], \"rejection_reason\": null}}], \"summary\": \"...\"}}. \
         A product failing any HARD requirement is not viable and needs a concrete \
         rejection_reason.",
        hard = bullet_list(&requirements.hard_requirements),
        nice = bullet_list(&requirements.nice_to_haves),
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        "- (none)".to_string()
    } else {
        items
            .iter()
            .map(|i| format!("- {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse the evaluation envelope defensively, keyed by product index.
fn parse_envelope(response: &str, product_count: usize) -> HashMap<usize, Evaluation> {
    let mut evaluations = HashMap::new();

    let envelope = crate::jsonx::extract_json_object(response);
    let entries: Vec<Value> = match &envelope {
        Some(value) => value
            .get("evaluations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        None => crate::jsonx::salvage_objects(response)
            .into_iter()
            .filter(|o| o.get("index").is_some())
            .collect(),
    };

    // Consistency check: a summary claiming nothing matched overrides any
    // stray viable entries; the model failed its own structure.
    if let Some(summary) = envelope
        .as_ref()
        .and_then(|v| v.get("summary"))
        .and_then(Value::as_str)
    {
        let lower = summary.to_lowercase();
        let says_none = lower.contains("no matching products")
            || lower.contains("no viable products")
            || lower.contains("none of the products");
        let any_viable = entries
            .iter()
            .any(|e| e.get("viable").and_then(Value::as_bool).unwrap_or(false));
        if says_none && any_viable {
            tracing::warn!("summary contradicts evaluations, discarding viable flags");
            return HashMap::new();
        }
    }

    for entry in entries {
        let Some(index) = entry.get("index").and_then(Value::as_u64).map(|i| i as usize) else {
            continue;
        };
        if index >= product_count {
            continue;
        }
        evaluations.insert(
            index,
            Evaluation {
                viable: entry.get("viable").and_then(Value::as_bool).unwrap_or(false),
                score: entry
                    .get("viability_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32,
                strengths: string_vec(&entry, "strengths"),
                weaknesses: string_vec(&entry, "weaknesses"),
                rejection_reason: entry
                    .get("rejection_reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        );
    }
    evaluations
}

fn string_vec(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// An empty or generic rejection reason does not justify discarding a
/// product without a second look.
fn is_unclear_rejection(reason: Option<&str>) -> bool {
    match reason {
        None => true,
        Some(reason) => {
            let lower = reason.trim().to_lowercase();
            lower.is_empty()
                || lower == "not viable"
                || lower == "does not match"
                || lower == "not a match"
                || lower == "unknown"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VerificationMethod;
    use solver_client::MockSolver;

    fn product(title: &str, url: &str, price: f64) -> VerifiedProduct {
        VerifiedProduct {
            title: title.to_string(),
            price: Some(price),
            url: url.to_string(),
            vendor: "shop.example".to_string(),
            in_stock: true,
            stock_status: "in_stock".to_string(),
            original_price: None,
            condition: "new".to_string(),
            rating: None,
            review_count: None,
            specs: HashMap::new(),
            image_url: None,
            extraction_confidence: 0.9,
            extraction_source: "json_ld".to_string(),
            verification_method: VerificationMethod::DirectPdp,
            original_title: None,
        }
    }

    fn requirements() -> Requirements {
        Requirements {
            hard_requirements: vec!["NVIDIA RTX GPU".to_string(), "gaming laptop".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_url_spec_mining() {
        let specs = parse_specs_from_url(
            "https://shop.example/ASUS-TUF-Gaming-A16-NVIDIA-GeForce-RTX-4050-16GB-DDR5-512GB-PCIe-SSD-144Hz",
        );
        assert_eq!(specs.get("gpu").map(String::as_str), Some("RTX 4050"));
        assert_eq!(specs.get("ram").map(String::as_str), Some("16GB DDR5"));
        assert_eq!(specs.get("storage").map(String::as_str), Some("512GB SSD"));
        assert_eq!(specs.get("refresh_rate").map(String::as_str), Some("144Hz"));
    }

    #[test]
    fn test_keyword_viability_clear_match() {
        let p = product(
            "Acer Nitro V 16 RTX 4060 gaming laptop",
            "https://shop.example/product/acer-nitro-rtx-4060-gaming-laptop",
            1099.0,
        );
        assert_eq!(
            check_keyword_viability(&p, &requirements(), "rtx 4060 gaming laptop"),
            Some(true)
        );
    }

    #[test]
    fn test_keyword_viability_clear_mismatch() {
        let p = product(
            "Espresso Machine Deluxe",
            "https://shop.example/product/espresso-machine-deluxe",
            450.0,
        );
        assert_eq!(
            check_keyword_viability(&p, &Requirements::default(), "rtx 4060 gaming laptop"),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_filter_viable_straightforward() {
        let solver = MockSolver::new().with_response(
            r#"{"evaluations": [
                {"index": 0, "viable": true, "viability_score": 0.9, "strengths": ["has RTX 4060"], "weaknesses": [], "rejection_reason": null},
                {"index": 1, "viable": false, "viability_score": 0.1, "strengths": [], "weaknesses": ["no dedicated GPU"], "rejection_reason": "integrated graphics only, no NVIDIA GPU"}
            ], "summary": "one product matches"}"#,
        );
        let filter = ViabilityFilter::new(Arc::new(solver));

        let products = vec![
            product("Acer Nitro RTX 4060", "https://shop.example/product/acer-nitro", 1099.0),
            product("Office Laptop UHD", "https://shop.example/product/office", 499.0),
        ];

        let result = filter
            .filter_viable(products, &requirements(), "rtx 4060 gaming laptop", 5)
            .await
            .unwrap();

        assert_eq!(result.viable.len(), 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(
            result.rejected[0].rejection_reason.as_deref(),
            Some("integrated graphics only, no NVIDIA GPU")
        );
    }

    #[tokio::test]
    async fn test_keyword_fallback_overrides_unclear_rejection() {
        let solver = MockSolver::new().with_response(
            r#"{"evaluations": [
                {"index": 0, "viable": false, "viability_score": 0.0, "rejection_reason": "not viable"}
            ], "summary": "evaluated"}"#,
        );
        let filter = ViabilityFilter::new(Arc::new(solver));

        let products = vec![product(
            "Acer Nitro V 16 RTX 4060 gaming laptop",
            "https://shop.example/product/acer-nitro-rtx-4060-gaming-laptop",
            1099.0,
        )];

        let result = filter
            .filter_viable(products, &requirements(), "rtx 4060 gaming laptop", 5)
            .await
            .unwrap();

        assert_eq!(result.viable.len(), 1);
        assert_eq!(result.stats.keyword_overrides, 1);
        assert!((result.viable[0].viability_score - 0.55).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_summary_consistency_override() {
        // The envelope contradicts itself; evaluations are discarded, and
        // only the keyword backstop can save a product.
        let solver = MockSolver::new().with_response(
            r#"{"evaluations": [
                {"index": 0, "viable": true, "viability_score": 0.9}
            ], "summary": "no matching products were found"}"#,
        );
        let filter = ViabilityFilter::new(Arc::new(solver));

        let products = vec![product(
            "Espresso Machine",
            "https://shop.example/product/espresso",
            450.0,
        )];

        let result = filter
            .filter_viable(products, &requirements(), "rtx 4060 gaming laptop", 5)
            .await
            .unwrap();
        assert!(result.viable.is_empty());
        assert_eq!(result.rejected.len(), 1);
    }

    #[tokio::test]
    async fn test_vendor_cap() {
        let solver = MockSolver::new().with_response(
            r#"{"evaluations": [
                {"index": 0, "viable": true, "viability_score": 0.9},
                {"index": 1, "viable": true, "viability_score": 0.8},
                {"index": 2, "viable": true, "viability_score": 0.7}
            ], "summary": "all match"}"#,
        );
        let filter = ViabilityFilter::new(Arc::new(solver));

        let products = vec![
            product("RTX laptop A", "https://shop.example/product/a", 999.0),
            product("RTX laptop B", "https://shop.example/product/b", 1099.0),
            product("RTX laptop C", "https://shop.example/product/c", 1199.0),
        ];

        let result = filter
            .filter_viable(products, &requirements(), "rtx laptop", 2)
            .await
            .unwrap();
        assert_eq!(result.viable.len(), 2);
        assert_eq!(result.rejected.len(), 1);
        assert!(result.rejected[0]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("vendor cap"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_salvage() {
        let solver = MockSolver::new().with_response(
            "Here are the results:\n```json\n{\"evaluations\": [{\"index\": 0, \"viable\": true, \"viability_score\": 0.8},], \"summary\": \"ok\"}\n```",
        );
        let filter = ViabilityFilter::new(Arc::new(solver));

        let products = vec![product(
            "RTX laptop",
            "https://shop.example/product/rtx-laptop",
            999.0,
        )];
        let result = filter
            .filter_viable(products, &requirements(), "rtx laptop", 5)
            .await
            .unwrap();
        assert_eq!(result.viable.len(), 1);
    }
}
