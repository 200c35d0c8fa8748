//! The hybrid listing-extraction pipeline.
//!
//! Composes the extraction family over a live listing page: learned schema
//! and HTML strategies first, the universal DOM walk when they come up
//! short, vision+fusion when hybrid mode is on, and an HTML-only fallback
//! when it is not or when vision fails.

use std::sync::Arc;
use std::time::Instant;

use browser::DrivenPage;

use crate::config::PerceptionConfig;
use crate::error::Result;
use crate::fusion;
use crate::html::HtmlExtractor;
use crate::intelligence::PageIntelligence;
use crate::models::{
    CandidateSource, ExtractionStats, FusedProduct, HtmlCandidate,
};
use crate::universal;
use crate::vision::VisionExtractor;

/// Runs the full listing extraction against a live page.
pub struct PerceptionPipeline {
    config: PerceptionConfig,
    html: HtmlExtractor,
    vision: VisionExtractor,
    intelligence: Arc<PageIntelligence>,
}

impl PerceptionPipeline {
    pub fn new(
        config: PerceptionConfig,
        vision: VisionExtractor,
        intelligence: Arc<PageIntelligence>,
    ) -> Self {
        Self {
            html: HtmlExtractor::new(config.clone()),
            config,
            vision,
            intelligence,
        }
    }

    /// Extract fused products from a listing page.
    pub async fn extract_listing(
        &self,
        page: &DrivenPage,
        url: &str,
        query: &str,
    ) -> Result<(Vec<FusedProduct>, ExtractionStats)> {
        let started = Instant::now();
        let mut stats = ExtractionStats::default();
        let mut candidates: Vec<HtmlCandidate> = Vec::new();

        // Learned schema first, when one exists and is healthy.
        match self.schema_candidates(page, url).await {
            Ok(schema_candidates) => candidates.extend(schema_candidates),
            Err(e) => {
                tracing::debug!(error = %e, "schema extraction unavailable");
                stats.errors.push(format!("schema: {e}"));
            }
        }

        // Static HTML strategies.
        let content = page.content().await?;
        candidates.extend(self.html.extract(&content, url));

        // Universal price-anchored walk when the cheap paths came up short.
        if candidates.len() < 5 {
            match universal::extract_universal(page, url).await {
                Ok(universal_candidates) => candidates.extend(universal_candidates),
                Err(e) => {
                    tracing::warn!(error = %e, "universal extraction failed");
                    stats.errors.push(format!("universal: {e}"));
                }
            }
        }

        let candidates = crate::html::deduplicate(candidates);
        stats.html_candidates = candidates.len();

        // Vision + fusion, when hybrid mode is on.
        let products = if self.config.enable_hybrid {
            match self.vision_products(page, query).await {
                Ok(vision_products) if !vision_products.is_empty() => {
                    stats.vision_products = vision_products.len();
                    let fused = fusion::fuse(vision_products, &candidates, url, &self.config);
                    stats.fusion_matches =
                        fused.iter().filter(|p| p.url_source != "fallback").count();
                    fused
                }
                Ok(_) => {
                    tracing::info!("vision produced nothing, falling back to html only");
                    self.html_only(&candidates, url)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vision extraction failed");
                    stats.errors.push(format!("vision: {e}"));
                    if self.config.fallback_to_html_only {
                        self.html_only(&candidates, url)
                    } else {
                        Vec::new()
                    }
                }
            }
        } else {
            self.html_only(&candidates, url)
        };

        stats.extraction_time_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            products = products.len(),
            html_candidates = stats.html_candidates,
            vision = stats.vision_products,
            fused = stats.fusion_matches,
            elapsed_ms = stats.extraction_time_ms,
            "listing extraction complete"
        );
        Ok((products, stats))
    }

    async fn schema_candidates(
        &self,
        page: &DrivenPage,
        url: &str,
    ) -> Result<Vec<HtmlCandidate>> {
        let domain = crate::models::vendor_of(url);
        let page_type = PageIntelligence::guess_page_type(url);
        let force_refresh = self
            .intelligence
            .needs_recalibration(&domain, page_type.as_str());

        if !self.config.enable_proactive_calibration && force_refresh {
            return Ok(Vec::new());
        }

        let understanding = self
            .intelligence
            .understand_page(page, url, force_refresh)
            .await?;
        let items = self.intelligence.extract(page, &understanding).await?;

        let base = url::Url::parse(url).ok();
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let href = item.url?;
                let absolute = if href.starts_with("http") {
                    href
                } else {
                    base.as_ref()?.join(&href).ok()?.to_string()
                };
                Some(HtmlCandidate {
                    url: absolute,
                    link_text: item.title,
                    context_text: item.price.unwrap_or_default(),
                    source: CandidateSource::SchemaDriven,
                    confidence: 0.9,
                })
            })
            .collect())
    }

    async fn vision_products(
        &self,
        page: &DrivenPage,
        query: &str,
    ) -> Result<Vec<crate::models::VisualProduct>> {
        let dir = if self.config.save_debug_screenshots {
            self.config.debug_output_dir.clone()
        } else {
            std::env::temp_dir()
        };
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("listing-capture.png");
        page.screenshot(&path, true).await?;

        let products = self.vision.extract(&path, query).await;
        if !self.config.save_debug_screenshots {
            let _ = std::fs::remove_file(&path);
        }
        products
    }

    fn html_only(&self, candidates: &[HtmlCandidate], url: &str) -> Vec<FusedProduct> {
        fusion::match_html_only(candidates, url, self.config.max_products_per_retailer)
    }
}

/// Attach PDP-verified numbers to a fused product and flag discrepancies
/// beyond the configured threshold.
pub fn apply_verification(
    product: &mut FusedProduct,
    verified_price: Option<f64>,
    verified_title: Option<String>,
    threshold: f64,
) -> bool {
    product.pdp_verified = true;
    product.verified_price = verified_price;
    product.verified_title = verified_title;

    if let (Some(listing), Some(verified)) = (product.price, verified_price) {
        let discrepancy = listing - verified;
        product.price_discrepancy = Some(discrepancy);
        if verified > 0.0 && (discrepancy.abs() / verified) > threshold {
            tracing::warn!(
                title = %product.title,
                listing,
                verified,
                "price discrepancy beyond threshold"
            );
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractionMethod;

    fn product(price: Option<f64>) -> FusedProduct {
        FusedProduct {
            title: "X".to_string(),
            price,
            price_str: String::new(),
            url: "https://shop.example/product/x".to_string(),
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

    #[test]
    fn test_apply_verification_flags_discrepancy() {
        let mut p = product(Some(999.0));
        // ~18% apart.
        let flagged = apply_verification(&mut p, Some(845.0), None, 0.10);
        assert!(flagged);
        assert!(p.pdp_verified);
        assert_eq!(p.verified_price, Some(845.0));
        assert!((p.price_discrepancy.unwrap() - 154.0).abs() < 1e-6);
    }

    #[test]
    fn test_apply_verification_within_threshold() {
        let mut p = product(Some(999.0));
        let flagged = apply_verification(&mut p, Some(979.0), None, 0.10);
        assert!(!flagged);
        assert_eq!(p.best_price(), Some(979.0));
    }

    #[test]
    fn test_apply_verification_without_listing_price() {
        let mut p = product(None);
        let flagged = apply_verification(&mut p, Some(500.0), Some("Full Title".to_string()), 0.10);
        assert!(!flagged);
        assert!(p.price_discrepancy.is_none());
        assert_eq!(p.best_title(), "Full Title");
    }
}
