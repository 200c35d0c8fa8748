//! PDP verification loop.
//!
//! Navigates from a listing to each candidate's product detail page,
//! extracts authoritative data, and walks back. Verification is the primary
//! extraction path; listing data is only a fallback.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use browser::{detect_blocker, DrivenPage, InterventionBroker, PageSnapshot, WaitPolicy, SETTLE_DELAY};

use crate::config::PerceptionConfig;
use crate::filters::is_valid_product_url;
use crate::models::{
    FusedProduct, Requirements, VerificationMethod, VerifiedProduct,
};
use crate::pdp::PdpExtractor;

/// Pacing between PDP visits, to avoid tripping rate limiters.
const PDP_PACING: Duration = Duration::from_secs(3);

/// How long to wait for a human when a PDP turns out to be blocked.
const INTERVENTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Known hardware brands, used to build click search patterns.
const BRANDS: &[&str] = &[
    "acer", "asus", "dell", "hp", "lenovo", "msi", "razer", "alienware", "samsung", "lg",
    "gigabyte", "microsoft", "apple", "toshiba", "huawei", "xiaomi",
];

/// Drives PDP verification for a listing's candidates.
pub struct ProductVerifier {
    pdp: Arc<PdpExtractor>,
    broker: Option<Arc<InterventionBroker>>,
    config: PerceptionConfig,
    max_products: usize,
}

impl ProductVerifier {
    pub fn new(
        pdp: Arc<PdpExtractor>,
        broker: Option<Arc<InterventionBroker>>,
        config: PerceptionConfig,
    ) -> Self {
        let max_products = config.pdp_max_verify_per_retailer;
        Self {
            pdp,
            broker,
            config,
            max_products,
        }
    }

    pub fn with_max_products(mut self, max_products: usize) -> Self {
        self.max_products = max_products;
        self
    }

    /// Verify up to `max_products` candidates via PDP navigation.
    pub async fn verify_products(
        &self,
        page: &DrivenPage,
        candidates: &[FusedProduct],
        listing_url: &str,
        vendor: &str,
        goal: Option<&str>,
        session_id: &str,
    ) -> Vec<VerifiedProduct> {
        let mut verified = Vec::new();
        for (i, candidate) in candidates.iter().take(self.max_products).enumerate() {
            tracing::info!(
                index = i,
                title = %candidate.title,
                "verifying candidate"
            );
            match self
                .verify_single(page, candidate, listing_url, vendor, goal, session_id)
                .await
            {
                Some(product) => verified.push(product),
                None => {
                    if let Some(fallback) = listing_fallback(candidate, listing_url) {
                        verified.push(fallback);
                    }
                }
            }
            tokio::time::sleep(PDP_PACING).await;
        }
        verified
    }

    /// Verification with early stopping: stop as soon as `target_viable`
    /// products pass the quick viability check.
    pub async fn verify_products_with_early_stop(
        &self,
        page: &DrivenPage,
        candidates: &[FusedProduct],
        listing_url: &str,
        vendor: &str,
        goal: Option<&str>,
        session_id: &str,
        target_viable: usize,
        requirements: &Requirements,
        query: &str,
    ) -> Vec<VerifiedProduct> {
        let to_verify: Vec<&FusedProduct> = candidates.iter().take(self.max_products * 2).collect();
        tracing::info!(
            candidates = to_verify.len(),
            target_viable,
            "verification with early stop starting"
        );

        let mut verified = Vec::new();
        let mut viable_count = 0usize;

        for (i, candidate) in to_verify.iter().enumerate() {
            if viable_count >= target_viable {
                tracing::info!(
                    verified = verified.len(),
                    viable = viable_count,
                    "early stop: target reached"
                );
                break;
            }
            if verified.len() >= self.max_products {
                break;
            }

            tracing::info!(
                index = i,
                viable = viable_count,
                target = target_viable,
                title = %candidate.title,
                "verifying candidate"
            );

            match self
                .verify_single(page, candidate, listing_url, vendor, goal, session_id)
                .await
            {
                Some(product) => {
                    if quick_viability_check(&product, requirements, query) {
                        viable_count += 1;
                        tracing::info!(viable = viable_count, target = target_viable, "product viable");
                    }
                    verified.push(product);
                }
                None => {
                    if let Some(fallback) = listing_fallback(candidate, listing_url) {
                        verified.push(fallback);
                    }
                }
            }
            tokio::time::sleep(PDP_PACING).await;
        }

        tracing::info!(
            verified = verified.len(),
            viable = viable_count,
            skipped = to_verify.len().saturating_sub(verified.len()),
            "verification complete"
        );
        verified
    }

    async fn verify_single(
        &self,
        page: &DrivenPage,
        candidate: &FusedProduct,
        listing_url: &str,
        vendor: &str,
        goal: Option<&str>,
        session_id: &str,
    ) -> Option<VerifiedProduct> {
        let direct = candidate.url != listing_url && is_valid_product_url(&candidate.url);

        let (pdp_url, method) = if direct {
            if page
                .navigate(&candidate.url, WaitPolicy::DomContentLoaded)
                .await
                .is_err()
            {
                return None;
            }
            let url = page.current_url().await.ok()?;
            (url, VerificationMethod::DirectPdp)
        } else {
            let url = self.click_to_pdp(page, candidate, listing_url).await?;
            (url, VerificationMethod::PdpNavigation)
        };

        if !is_valid_product_url(&pdp_url) {
            tracing::warn!(url = %pdp_url, "navigation landed on a non-product url");
            self.return_to_listing(page, listing_url).await;
            return None;
        }

        if !self.handle_blocker(page, &pdp_url, session_id).await {
            self.return_to_listing(page, listing_url).await;
            return None;
        }

        let pdp_data = match self.pdp.extract(page, &pdp_url, goal).await {
            Ok(Some(data)) => data,
            _ => {
                tracing::warn!(url = %pdp_url, "pdp extraction failed");
                self.return_to_listing(page, listing_url).await;
                return None;
            }
        };

        // Price-discrepancy monitoring between listing and PDP.
        if self.config.pdp_track_discrepancies {
            let mut fused = candidate.clone();
            crate::pipeline::apply_verification(
                &mut fused,
                pdp_data.price,
                pdp_data.title.clone(),
                self.config.pdp_discrepancy_threshold,
            );
        }

        let product = VerifiedProduct {
            title: pdp_data
                .title
                .clone()
                .unwrap_or_else(|| candidate.title.clone()),
            price: pdp_data.price,
            url: pdp_url,
            vendor: vendor.to_string(),
            in_stock: pdp_data.in_stock,
            stock_status: pdp_data.stock_status.clone(),
            original_price: pdp_data.original_price,
            condition: pdp_data.condition.clone(),
            rating: pdp_data.rating,
            review_count: pdp_data.review_count,
            specs: pdp_data.specs.clone(),
            image_url: pdp_data.image_url.clone(),
            extraction_confidence: pdp_data.extraction_confidence,
            extraction_source: pdp_data.extraction_source.clone(),
            verification_method: method,
            original_title: Some(candidate.title.clone()),
        };

        self.return_to_listing(page, listing_url).await;
        Some(product)
    }

    /// Click-navigate to a PDP: link text patterns first, then a coordinate
    /// click at the candidate's bbox.
    async fn click_to_pdp(
        &self,
        page: &DrivenPage,
        candidate: &FusedProduct,
        listing_url: &str,
    ) -> Option<String> {
        let patterns = generate_search_patterns(&candidate.title);

        for (i, pattern) in patterns.iter().enumerate() {
            tracing::debug!(pattern = %pattern, attempt = i + 1, "link text search");
            let links = page.collect_links("a[href]").await.ok()?;
            let pattern_lower = pattern.to_lowercase();
            let matched = links.iter().find(|(text, href)| {
                text.to_lowercase().contains(&pattern_lower) && is_valid_product_url(href)
            });
            if let Some((_, href)) = matched {
                if page.navigate(href, WaitPolicy::DomContentLoaded).await.is_ok() {
                    let url = page.current_url().await.ok()?;
                    if url != listing_url {
                        return Some(url);
                    }
                }
            }
        }

        // Coordinate click at the bbox center, translated to viewport space.
        if let Some(bbox) = candidate.bbox {
            let (cx, cy) = bbox.center();
            let scroll_y = (cy - 400).max(0);
            let viewport_y = cy - scroll_y;
            let _ = page
                .evaluate(&format!("window.scrollTo(0, {scroll_y})"))
                .await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            if page.click_at(f64::from(cx), f64::from(viewport_y)).await.is_ok() {
                // Poll for the URL to change, within the click-resolve budget.
                let deadline = tokio::time::Instant::now()
                    + Duration::from_millis(self.config.click_resolve_timeout_ms);
                while tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    if let Ok(url) = page.current_url().await {
                        if url != listing_url {
                            return Some(url);
                        }
                    }
                }
            }
        }
        None
    }

    /// Blocker gate on an arrived PDP. Returns true when the page is usable.
    async fn handle_blocker(&self, page: &DrivenPage, url: &str, session_id: &str) -> bool {
        let Ok(content) = page.content().await else {
            return false;
        };
        let snapshot = PageSnapshot {
            url,
            content: &content,
            status_code: None,
        };
        let Some(detection) = detect_blocker(&snapshot) else {
            return true;
        };

        let Some(broker) = &self.broker else {
            tracing::warn!(url, kind = detection.kind.as_str(), "blocker on pdp, no broker");
            return false;
        };

        let screenshot_dir = std::path::Path::new("research_screenshots");
        let _ = std::fs::create_dir_all(screenshot_dir);
        let screenshot_path = screenshot_dir.join(format!("blocked-{session_id}.png"));
        let screenshot = page
            .screenshot(&screenshot_path, false)
            .await
            .ok()
            .map(|p| p.to_string_lossy().into_owned());

        let intervention = match broker.request_intervention(
            detection.kind,
            url,
            screenshot,
            session_id,
            Some(serde_json::json!({"evidence": detection.evidence})),
        ) {
            Ok(intervention) => intervention,
            Err(e) => {
                tracing::error!(error = %e, "failed to file intervention");
                return false;
            }
        };

        let resolved = broker
            .wait_for_resolution(&intervention.id, INTERVENTION_TIMEOUT)
            .await;
        if resolved {
            // Settle before touching the page again; immediate navigation
            // re-trips the challenge.
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        resolved
    }

    async fn return_to_listing(&self, page: &DrivenPage, listing_url: &str) {
        if page.evaluate("history.back()").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(800)).await;
            if let Ok(url) = page.current_url().await {
                if url == listing_url {
                    return;
                }
            }
        }
        let _ = page.navigate(listing_url, WaitPolicy::DomContentLoaded).await;
    }
}

/// A failed verification still yields a record, anchored to the listing,
/// unless the candidate itself is garbage.
pub fn listing_fallback(candidate: &FusedProduct, listing_url: &str) -> Option<VerifiedProduct> {
    let title = candidate.title.trim();
    if title.len() < 5 || crate::filters::is_garbage_link_text(title) {
        return None;
    }
    Some(VerifiedProduct {
        title: candidate.title.clone(),
        price: candidate.best_price(),
        url: listing_url.to_string(),
        vendor: candidate.vendor.clone(),
        in_stock: true,
        stock_status: "unknown".to_string(),
        original_price: None,
        condition: "new".to_string(),
        rating: None,
        review_count: None,
        specs: Default::default(),
        image_url: None,
        extraction_confidence: 0.5,
        extraction_source: "listing".to_string(),
        verification_method: VerificationMethod::ListingFallback,
        original_title: Some(candidate.title.clone()),
    })
}

/// Progressively shorter search patterns from a title, most specific first.
pub fn generate_search_patterns(title: &str) -> Vec<String> {
    let clean: String = title
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}'))
        .collect();
    let words: Vec<&str> = clean.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let brand = words
        .iter()
        .take(3)
        .enumerate()
        .find(|(_, w)| BRANDS.contains(&w.to_lowercase().as_str()))
        .map(|(i, w)| (i, w.to_string()));

    let mut patterns = Vec::new();
    if words.len() >= 4 {
        patterns.push(words[..words.len().min(5)].join(" "));
        patterns.push(words[..4].join(" "));
    }
    if words.len() >= 3 {
        patterns.push(words[..3].join(" "));
    }
    if let Some((idx, brand_word)) = &brand {
        if idx + 1 < words.len() {
            patterns.push(format!("{brand_word} {}", words[idx + 1]));
        }
    }
    if words.len() >= 2 {
        patterns.push(words[..2].join(" "));
    }
    if let Some((_, brand_word)) = &brand {
        patterns.push(brand_word.clone());
    }

    let mut seen = HashSet::new();
    patterns
        .into_iter()
        .filter(|p| p.len() >= 3 && seen.insert(p.to_lowercase()))
        .take(6)
        .collect()
}

/// Lightweight local viability check used for early-stopping decisions; the
/// full solver-driven filter runs later.
pub fn quick_viability_check(
    product: &VerifiedProduct,
    requirements: &Requirements,
    query: &str,
) -> bool {
    let title = product.title.to_lowercase();
    let query_lower = query.to_lowercase();

    let wants_nvidia = ["nvidia", "rtx", "geforce", "gtx"]
        .iter()
        .any(|kw| query_lower.contains(kw))
        || requirements
            .keyed
            .get("gpu")
            .map(|g| {
                let g = g.to_lowercase();
                ["nvidia", "rtx", "geforce"].iter().any(|kw| g.contains(kw))
            })
            .unwrap_or(false);

    if wants_nvidia {
        let gpu_spec = product
            .specs
            .get("gpu")
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        let has_nvidia = ["rtx", "geforce", "nvidia", "gtx"]
            .iter()
            .any(|kw| title.contains(kw) || gpu_spec.contains(kw));

        if !has_nvidia {
            let integrated = ["intel uhd", "intel iris", "integrated"]
                .iter()
                .any(|kw| title.contains(kw) || gpu_spec.contains(kw));
            if integrated {
                return false;
            }
            // Unknown GPU stays in play; the full filter decides later.
        }

        let wrong_category = ["chromebook", "macbook", "ipad", "tablet"]
            .iter()
            .any(|cat| title.contains(cat));
        if wrong_category {
            return false;
        }
    }

    if let (Some(max), Some(price)) = (requirements.price_range.max, product.price) {
        // 10% tolerance over the ceiling.
        if price > max * 1.1 {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractionMethod, PriceRange};
    use std::collections::HashMap;

    fn fused(title: &str, url: &str) -> FusedProduct {
        FusedProduct {
            title: title.to_string(),
            price: Some(999.0),
            price_str: "$999".to_string(),
            url: url.to_string(),
            vendor: "shop.example".to_string(),
            confidence: 0.8,
            extraction_method: ExtractionMethod::Fusion,
            vision_verified: true,
            url_source: "url_pattern".to_string(),
            description: String::new(),
            bbox: None,
            match_score: 0.5,
            pdp_verified: false,
            pdp_data: None,
            verified_price: None,
            verified_title: None,
            price_discrepancy: None,
        }
    }

    fn verified(title: &str, price: Option<f64>, specs: HashMap<String, String>) -> VerifiedProduct {
        VerifiedProduct {
            title: title.to_string(),
            price,
            url: "https://shop.example/product/x".to_string(),
            vendor: "shop.example".to_string(),
            in_stock: true,
            stock_status: "in_stock".to_string(),
            original_price: None,
            condition: "new".to_string(),
            rating: None,
            review_count: None,
            specs,
            image_url: None,
            extraction_confidence: 0.9,
            extraction_source: "json_ld".to_string(),
            verification_method: VerificationMethod::DirectPdp,
            original_title: None,
        }
    }

    #[test]
    fn test_search_patterns_progressively_shorter() {
        let patterns =
            generate_search_patterns("Acer Nitro V 16S Gaming Laptop RTX 4060 16GB DDR5");
        assert!(patterns.len() <= 6);
        assert_eq!(patterns[0], "Acer Nitro V 16S Gaming");
        assert!(patterns.iter().any(|p| p == "Acer Nitro"));
        assert_eq!(patterns.last().map(String::as_str), Some("Acer"));
        // Progressively fewer words.
        for window in patterns.windows(2) {
            assert!(window[1].split(' ').count() <= window[0].split(' ').count());
        }
    }

    #[test]
    fn test_search_patterns_empty_title() {
        assert!(generate_search_patterns("").is_empty());
        assert!(generate_search_patterns("((()))").is_empty());
    }

    #[test]
    fn test_quick_viability_nvidia_requirement() {
        let requirements = Requirements::default();

        let with_gpu = verified("Acer Nitro RTX 4060 Laptop", Some(999.0), HashMap::new());
        assert!(quick_viability_check(&with_gpu, &requirements, "rtx gaming laptop"));

        let chromebook = verified("HP Chromebook 14", Some(299.0), HashMap::new());
        assert!(!quick_viability_check(&chromebook, &requirements, "rtx gaming laptop"));

        let mut integrated_specs = HashMap::new();
        integrated_specs.insert("gpu".to_string(), "Intel UHD Graphics".to_string());
        let integrated = verified("Office Laptop 15", Some(499.0), integrated_specs);
        assert!(!quick_viability_check(&integrated, &requirements, "nvidia laptop"));

        // Unknown GPU stays viable for the full filter to decide.
        let unknown = verified("Mystery Gaming Laptop 16", Some(899.0), HashMap::new());
        assert!(quick_viability_check(&unknown, &requirements, "nvidia laptop"));
    }

    #[test]
    fn test_quick_viability_price_tolerance() {
        let requirements = Requirements {
            price_range: PriceRange {
                min: None,
                max: Some(1000.0),
            },
            ..Default::default()
        };

        let just_over = verified("Laptop", Some(1050.0), HashMap::new());
        assert!(quick_viability_check(&just_over, &requirements, "laptop"));

        let way_over = verified("Laptop", Some(1200.0), HashMap::new());
        assert!(!quick_viability_check(&way_over, &requirements, "laptop"));
    }

    #[test]
    fn test_listing_fallback_keeps_real_candidates() {
        let candidate = fused(
            "Acer Nitro V 16 Gaming Laptop",
            "https://shop.example/product/acer",
        );
        let fallback = listing_fallback(&candidate, "https://shop.example/s?q=laptop").unwrap();
        assert_eq!(fallback.url, "https://shop.example/s?q=laptop");
        assert_eq!(fallback.verification_method, VerificationMethod::ListingFallback);
        assert_eq!(fallback.extraction_confidence, 0.5);
        assert_eq!(fallback.price, Some(999.0));
    }

    #[test]
    fn test_listing_fallback_drops_garbage() {
        let garbage = fused("Add to Cart", "https://shop.example/product/x");
        assert!(listing_fallback(&garbage, "https://shop.example/s").is_none());

        let tiny = fused("abc", "https://shop.example/product/x");
        assert!(listing_fallback(&tiny, "https://shop.example/s").is_none());
    }
}
