//! Data model for hybrid vision+HTML product extraction.
//!
//! The stages of the pipeline each have their own record type:
//!
//! - [`VisualProduct`] - product identified by OCR/vision
//! - [`HtmlCandidate`] - potential product URL from HTML
//! - [`FusedProduct`] - product combining both sources
//! - [`PdpData`] - authoritative data extracted from a product detail page
//! - [`VerifiedProduct`] - terminal output record after PDP verification

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Screen coordinates for a visual element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width) * i64::from(self.height)
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.x + self.width >= other.x + other.width
            && self.y + self.height >= other.y + other.height
    }

    pub fn overlaps(&self, other: &BoundingBox) -> bool {
        !(self.x + self.width < other.x
            || other.x + other.width < self.x
            || self.y + self.height < other.y
            || other.y + other.height < self.y)
    }
}

/// Single OCR text detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrItem {
    pub text: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Product identified by the vision system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualProduct {
    pub title: String,
    /// Raw string like "$1,299.99".
    pub price: Option<String>,
    pub price_numeric: Option<f64>,
    /// Anchor on screen, from the OCR item containing the price.
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub raw_ocr_lines: Vec<String>,
}

/// Where an HTML candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    JsonLd,
    UrlPattern,
    DomHeuristic,
    UniversalJs,
    SchemaDriven,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::JsonLd => "json_ld",
            CandidateSource::UrlPattern => "url_pattern",
            CandidateSource::DomHeuristic => "dom_heuristic",
            CandidateSource::UniversalJs => "universal_js",
            CandidateSource::SchemaDriven => "schema_driven",
        }
    }
}

/// Potential product URL extracted from HTML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlCandidate {
    pub url: String,
    pub link_text: String,
    /// Surrounding text for fuzzy matching.
    pub context_text: String,
    pub source: CandidateSource,
    pub confidence: f32,
}

/// How a fused product got its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Fusion,
    HtmlOnly,
    VisionOnly,
    ClickResolved,
    SchemaDriven,
    UniversalJs,
    PdpDirect,
}

/// Verified product data from a product detail page. Authoritative over
/// anything read off a listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PdpData {
    pub price: Option<f64>,
    pub title: Option<String>,
    /// Strikethrough price when on sale.
    pub original_price: Option<f64>,
    pub in_stock: bool,
    pub stock_status: String,
    pub condition: String,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    /// Normalized keys: gpu, cpu, ram, storage, display, battery, os, ...
    pub specs: HashMap<String, String>,
    pub seller_name: Option<String>,
    pub ships_from: Option<String>,
    pub shipping_price: Option<f64>,
    pub delivery_estimate: Option<String>,
    pub image_url: Option<String>,
    pub extraction_source: String,
    pub extraction_confidence: f32,
}

impl PdpData {
    pub fn new() -> Self {
        Self {
            in_stock: true,
            stock_status: "unknown".to_string(),
            condition: "new".to_string(),
            ..Default::default()
        }
    }
}

/// Final product combining vision + HTML data, optionally PDP-verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedProduct {
    pub title: String,
    pub price: Option<f64>,
    pub price_str: String,
    pub url: String,
    /// Retailer domain, always the host of `url` without `www.`.
    pub vendor: String,
    pub confidence: f32,
    pub extraction_method: ExtractionMethod,
    pub vision_verified: bool,
    pub url_source: String,
    pub description: String,
    pub bbox: Option<BoundingBox>,
    pub match_score: f32,
    pub pdp_verified: bool,
    pub pdp_data: Option<PdpData>,
    pub verified_price: Option<f64>,
    pub verified_title: Option<String>,
    /// Listing price minus PDP price, when both are known.
    pub price_discrepancy: Option<f64>,
}

impl FusedProduct {
    /// The most accurate price: verified when present, listing otherwise.
    pub fn best_price(&self) -> Option<f64> {
        self.verified_price.or(self.price)
    }

    /// The most accurate title.
    pub fn best_title(&self) -> &str {
        self.verified_title.as_deref().unwrap_or(&self.title)
    }
}

/// How a verified product reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    DirectPdp,
    PdpNavigation,
    ListingFallback,
    Unverified,
}

/// Terminal output record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedProduct {
    pub title: String,
    pub price: Option<f64>,
    pub url: String,
    pub vendor: String,
    pub in_stock: bool,
    pub stock_status: String,
    pub original_price: Option<f64>,
    pub condition: String,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub specs: HashMap<String, String>,
    pub image_url: Option<String>,
    pub extraction_confidence: f32,
    pub extraction_source: String,
    pub verification_method: VerificationMethod,
    /// Title as seen on the listing, before PDP correction.
    pub original_title: Option<String>,
}

/// Per-run pipeline statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub html_candidates: usize,
    pub vision_products: usize,
    pub fusion_matches: usize,
    pub click_resolved: usize,
    pub pdp_verified: usize,
    pub price_discrepancies: usize,
    pub extraction_time_ms: u64,
    pub errors: Vec<String>,
}

/// Price bounds from the research plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// User requirements, split hard vs preference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub hard_requirements: Vec<String>,
    #[serde(default)]
    pub nice_to_haves: Vec<String>,
    #[serde(default)]
    pub price_range: PriceRange,
    #[serde(default)]
    pub recommended_brands: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Explicit keyed requirements, e.g. "gpu" -> "nvidia rtx".
    #[serde(default)]
    pub keyed: HashMap<String, String>,
}

impl Requirements {
    /// All requirement text, for keyword scans.
    pub fn all_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        parts.extend(self.hard_requirements.iter().map(String::as_str));
        parts.extend(self.keyed.values().map(String::as_str));
        if let Some(category) = &self.category {
            parts.push(category);
        }
        parts.join(" ").to_lowercase()
    }
}

/// Parse a price string like "$1,299.99" into a number.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let price: f64 = cleaned.parse().ok()?;
    if price > 0.0 && price < 100_000.0 {
        Some(price)
    } else {
        None
    }
}

/// Normalize a URL for deduplication: scheme + host + path, no query or
/// fragment. Idempotent.
pub fn normalize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            format!("{}://{}{}", parsed.scheme(), host, parsed.path())
        }
        Err(_) => url.to_string(),
    }
}

/// Vendor domain of a URL: host without a leading `www.`.
pub fn vendor_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str()
                .map(|h| h.trim_start_matches("www.").to_string())
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center_and_containment() {
        let outer = BoundingBox::new(0, 0, 100, 100);
        let inner = BoundingBox::new(10, 10, 20, 20);
        let apart = BoundingBox::new(200, 200, 10, 10);

        assert_eq!(inner.center(), (20, 20));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.overlaps(&inner));
        assert!(!outer.overlaps(&apart));
    }

    #[test]
    fn test_parse_price() {
        assert_eq!(parse_price("$1,299.99"), Some(1299.99));
        assert_eq!(parse_price("$999"), Some(999.0));
        assert_eq!(parse_price("1299.99"), Some(1299.99));
        assert_eq!(parse_price("free"), None);
        assert_eq!(parse_price("$0"), None);
        assert_eq!(parse_price("$250000"), None);
    }

    #[test]
    fn test_normalize_url_strips_query_and_fragment() {
        let normalized = normalize_url("https://www.shop.example/product/x-123?ref=abc#reviews");
        assert_eq!(normalized, "https://www.shop.example/product/x-123");
    }

    #[test]
    fn test_normalize_url_is_idempotent() {
        let once = normalize_url("https://shop.example/p/abc?q=1");
        assert_eq!(normalize_url(&once), once);
    }

    #[test]
    fn test_vendor_of_strips_www() {
        assert_eq!(vendor_of("https://www.bestbuy.com/site/x"), "bestbuy.com");
        assert_eq!(vendor_of("https://shop.example/p/1"), "shop.example");
        assert_eq!(vendor_of("not a url"), "");
    }

    #[test]
    fn test_best_price_prefers_verified() {
        let mut product = FusedProduct {
            title: "X".to_string(),
            price: Some(999.0),
            price_str: "$999".to_string(),
            url: "https://shop.example/p/x".to_string(),
            vendor: "shop.example".to_string(),
            confidence: 0.9,
            extraction_method: ExtractionMethod::Fusion,
            vision_verified: true,
            url_source: "json_ld".to_string(),
            description: String::new(),
            bbox: None,
            match_score: 0.8,
            pdp_verified: false,
            pdp_data: None,
            verified_price: None,
            verified_title: None,
            price_discrepancy: None,
        };
        assert_eq!(product.best_price(), Some(999.0));

        product.verified_price = Some(949.0);
        assert_eq!(product.best_price(), Some(949.0));
    }
}
