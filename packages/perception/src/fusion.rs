//! Product fusion: match vision products to HTML URL candidates.
//!
//! Fuzzy title matching decides which URL belongs to which visually
//! identified product. A matched URL is consumed and never reused for a
//! later product.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::config::PerceptionConfig;
use crate::models::{
    parse_price, vendor_of, CandidateSource, ExtractionMethod, FusedProduct, HtmlCandidate,
    VisualProduct,
};
use crate::similarity::{char_similarity, normalize_text, word_overlap};

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$[\d,]+\.?\d*").expect("valid price regex"))
}

/// Match vision products to HTML URLs.
pub fn fuse(
    vision_products: Vec<VisualProduct>,
    html_candidates: &[HtmlCandidate],
    base_url: &str,
    config: &PerceptionConfig,
) -> Vec<FusedProduct> {
    let vendor = vendor_of(base_url);
    let mut fused = Vec::new();
    let mut used_urls: HashSet<String> = HashSet::new();

    tracing::info!(
        vision = vision_products.len(),
        html = html_candidates.len(),
        "fusion matching"
    );

    for vp in vision_products {
        let (best, best_score) = find_best_match(&vp, html_candidates, &used_urls);

        match best {
            Some(candidate) if best_score >= config.similarity_threshold => {
                used_urls.insert(candidate.url.clone());
                fused.push(FusedProduct {
                    title: vp.title.clone(),
                    price: vp.price_numeric,
                    price_str: vp.price.clone().unwrap_or_default(),
                    url: candidate.url.clone(),
                    vendor: vendor.clone(),
                    confidence: (vp.confidence + config.boost_on_match).min(0.98),
                    extraction_method: ExtractionMethod::Fusion,
                    vision_verified: true,
                    url_source: candidate.source.as_str().to_string(),
                    description: String::new(),
                    bbox: Some(vp.bbox),
                    match_score: best_score,
                    pdp_verified: false,
                    pdp_data: None,
                    verified_price: None,
                    verified_title: None,
                    price_discrepancy: None,
                });
                tracing::debug!(title = %vp.title, score = best_score, "fusion match");
            }
            _ => {
                // Unmatched: keep the product, fall back to the page URL.
                fused.push(FusedProduct {
                    title: vp.title.clone(),
                    price: vp.price_numeric,
                    price_str: vp.price.clone().unwrap_or_default(),
                    url: base_url.to_string(),
                    vendor: vendor.clone(),
                    confidence: vp.confidence * 0.7,
                    extraction_method: ExtractionMethod::VisionOnly,
                    vision_verified: true,
                    url_source: "fallback".to_string(),
                    description: String::new(),
                    bbox: Some(vp.bbox),
                    match_score: best_score,
                    pdp_verified: false,
                    pdp_data: None,
                    verified_price: None,
                    verified_title: None,
                    price_discrepancy: None,
                });
                tracing::debug!(title = %vp.title, score = best_score, "no fusion match");
            }
        }
    }

    let matched = fused.iter().filter(|p| p.url_source != "fallback").count();
    tracing::info!(matched, total = fused.len(), "fusion complete");
    fused
}

fn find_best_match<'a>(
    vision_product: &VisualProduct,
    candidates: &'a [HtmlCandidate],
    used_urls: &HashSet<String>,
) -> (Option<&'a HtmlCandidate>, f32) {
    let vision_title = normalize_text(&vision_product.title);
    let mut best: Option<&HtmlCandidate> = None;
    let mut best_score = 0.0f32;

    for candidate in candidates {
        if used_urls.contains(&candidate.url) {
            continue;
        }

        let link_text = normalize_text(&candidate.link_text);
        let mut score = char_similarity(&vision_title, &link_text);

        // Short link text often means the real title sits in the context.
        if candidate.link_text.len() < 25 && !candidate.context_text.is_empty() {
            let context = normalize_text(&candidate.context_text);
            score = score.max(char_similarity(&vision_title, &context) * 0.9);
        }

        score = score.max(word_overlap(&vision_title, &link_text));

        if score > best_score {
            best_score = score;
            best = Some(candidate);
        }
    }

    (best, best_score)
}

/// Build fused products from HTML candidates alone, when vision produced
/// nothing usable.
pub fn match_html_only(
    html_candidates: &[HtmlCandidate],
    base_url: &str,
    max_products: usize,
) -> Vec<FusedProduct> {
    let vendor = vendor_of(base_url);
    let mut products = Vec::new();

    for candidate in html_candidates.iter().take(max_products * 3) {
        if products.len() >= max_products {
            break;
        }
        let link_text = candidate.link_text.trim();
        if link_text.len() < 5 {
            continue;
        }
        if crate::filters::is_garbage_link_text(link_text) {
            continue;
        }
        let lower = link_text.to_lowercase();
        if ["click to", "tap to", "select to"]
            .iter()
            .any(|p| lower.starts_with(p))
        {
            continue;
        }
        if !link_text.chars().any(|c| c.is_alphabetic()) {
            continue;
        }

        let context = if candidate.context_text.is_empty() {
            &candidate.link_text
        } else {
            &candidate.context_text
        };
        let price_str = price_regex()
            .find(context)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let price = if price_str.is_empty() {
            None
        } else {
            parse_price(&price_str)
        };

        let method = if candidate.source == CandidateSource::UniversalJs {
            ExtractionMethod::UniversalJs
        } else {
            ExtractionMethod::HtmlOnly
        };

        products.push(FusedProduct {
            title: candidate.link_text.clone(),
            price,
            price_str,
            url: candidate.url.clone(),
            vendor: vendor.clone(),
            confidence: candidate.confidence * 0.8,
            extraction_method: method,
            vision_verified: false,
            url_source: candidate.source.as_str().to_string(),
            description: String::new(),
            bbox: None,
            match_score: 0.0,
            pdp_verified: false,
            pdp_data: None,
            verified_price: None,
            verified_title: None,
            price_discrepancy: None,
        });
    }
    products
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    fn visual(title: &str, price: f64) -> VisualProduct {
        VisualProduct {
            title: title.to_string(),
            price: Some(format!("${price}")),
            price_numeric: Some(price),
            bbox: BoundingBox::new(10, 10, 100, 40),
            confidence: 0.85,
            raw_ocr_lines: vec![],
        }
    }

    fn candidate(url: &str, text: &str) -> HtmlCandidate {
        HtmlCandidate {
            url: url.to_string(),
            link_text: text.to_string(),
            context_text: String::new(),
            source: CandidateSource::UrlPattern,
            confidence: 0.85,
        }
    }

    #[test]
    fn test_fusion_matches_similar_titles() {
        let vision = vec![visual("Acer Nitro V 16 Gaming Laptop RTX 4060", 1099.0)];
        let html = vec![
            candidate("https://shop.example/product/acer-nitro-v16", "Acer Nitro V 16 Gaming Laptop NVIDIA RTX 4060"),
            candidate("https://shop.example/product/hp-victus", "HP Victus 15 Gaming Laptop"),
        ];

        let fused = fuse(
            vision,
            &html,
            "https://www.shop.example/s?q=laptop",
            &PerceptionConfig::default(),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].url, "https://shop.example/product/acer-nitro-v16");
        assert_eq!(fused[0].extraction_method, ExtractionMethod::Fusion);
        assert_eq!(fused[0].vendor, "shop.example");
        assert!(fused[0].match_score >= 0.40);
    }

    #[test]
    fn test_unmatched_product_falls_back_with_penalty() {
        let vision = vec![visual("Completely Different Espresso Machine", 450.0)];
        let html = vec![candidate(
            "https://shop.example/product/gaming-laptop",
            "Gaming Laptop RTX 4060",
        )];

        let fused = fuse(
            vision,
            &html,
            "https://shop.example/s",
            &PerceptionConfig::default(),
        );
        assert_eq!(fused[0].url, "https://shop.example/s");
        assert_eq!(fused[0].extraction_method, ExtractionMethod::VisionOnly);
        assert_eq!(fused[0].url_source, "fallback");
        assert!((fused[0].confidence - 0.85 * 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_urls_not_reused_across_products() {
        let vision = vec![
            visual("Acer Nitro V 16 Gaming Laptop", 1099.0),
            visual("Acer Nitro V 16 Gaming Laptop", 1099.0),
        ];
        let html = vec![candidate(
            "https://shop.example/product/acer-nitro-v16",
            "Acer Nitro V 16 Gaming Laptop",
        )];

        let fused = fuse(
            vision,
            &html,
            "https://shop.example/s",
            &PerceptionConfig::default(),
        );
        assert_eq!(fused[0].url, "https://shop.example/product/acer-nitro-v16");
        // Second product cannot reuse the consumed URL.
        assert_eq!(fused[1].url, "https://shop.example/s");
    }

    #[test]
    fn test_vendor_equals_url_host_sans_www() {
        let vision = vec![visual("Thing", 10.0)];
        let fused = fuse(
            vision,
            &[],
            "https://www.bestbuy.com/site/searchpage.jsp",
            &PerceptionConfig::default(),
        );
        assert_eq!(fused[0].vendor, "bestbuy.com");
    }

    #[test]
    fn test_match_html_only_filters_garbage() {
        let candidates = vec![
            candidate("https://shop.example/product/a", "Add to Cart"),
            candidate("https://shop.example/product/b", "123"),
            candidate("https://shop.example/product/c", "Lenovo LOQ 15 Gaming Laptop"),
        ];

        let products = match_html_only(&candidates, "https://shop.example/s", 20);
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].title, "Lenovo LOQ 15 Gaming Laptop");
        assert_eq!(products[0].extraction_method, ExtractionMethod::HtmlOnly);
        assert!(!products[0].vision_verified);
    }

    #[test]
    fn test_match_html_only_parses_context_price() {
        let mut c = candidate("https://shop.example/product/c", "Lenovo LOQ 15 Gaming Laptop");
        c.context_text = "Lenovo LOQ 15 Gaming Laptop $949.99 free shipping".to_string();

        let products = match_html_only(&[c], "https://shop.example/s", 20);
        assert_eq!(products[0].price, Some(949.99));
        assert_eq!(products[0].price_str, "$949.99");
    }

    #[test]
    fn test_match_html_only_respects_cap() {
        let candidates: Vec<HtmlCandidate> = (0..30)
            .map(|i| {
                candidate(
                    &format!("https://shop.example/product/p{i}"),
                    &format!("Gaming Laptop Model Number {i}"),
                )
            })
            .collect();
        assert_eq!(match_html_only(&candidates, "https://shop.example/s", 5).len(), 5);
    }
}
