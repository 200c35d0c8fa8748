//! The research control loop.
//!
//! plan -> search -> classify -> extract -> prioritize -> verify -> filter
//! -> decide_next -> report. One request may touch several vendors; each
//! vendor runs in its own browser session, and blockers anywhere in the loop
//! park the session on an intervention.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use browser::{ContextKey, InterventionBroker, RecoveryManager, SessionManager, WaitPolicy};
use perception::{
    prioritize, ExtractionStats, PerceptionConfig, PerceptionPipeline, PdpExtractor,
    ProductVerifier, RejectionTracker, Requirements, VerificationMethod, VerifiedProduct,
    ViabilityFilter,
};
use solver_client::Solver;

use crate::classify;
use crate::engines::{self, SearchHit};
use crate::error::{ResearchError, Result};
use crate::events::{EventEmitter, ResearchEvent};
use crate::planner::{self, ResearchPlan};

/// Tunables for the outer loop.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    /// Bounded hop budget for refine-and-retry.
    pub max_hops: u32,
    /// Early-stop target per vendor.
    pub target_viable: usize,
    /// Below this many viable products across vendors, another hop runs.
    pub min_viable_floor: usize,
    /// Vendor pages visited per query.
    pub max_vendors_per_query: usize,
    pub max_viable_per_vendor: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            target_viable: 4,
            min_viable_floor: 2,
            max_vendors_per_query: 3,
            max_viable_per_vendor: 5,
        }
    }
}

/// A research request from the HTTP surface.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub query: String,
    pub session_id: String,
    pub user_id: String,
    /// `deep` mode raises the hop budget by one.
    pub deep: bool,
}

/// Products for one vendor in the final report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VendorProducts {
    pub vendor: String,
    pub products: Vec<VerifiedProduct>,
}

/// The assembled answer set.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResearchOutcome {
    pub by_vendor: Vec<VendorProducts>,
    pub viable_count: usize,
    pub rejected: Vec<RejectionSummary>,
    pub caveats: Vec<String>,
    pub passes: u32,
    pub queries_run: Vec<String>,
    /// Extraction counters summed over every vendor page visited.
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RejectionSummary {
    pub title: String,
    pub vendor: String,
    pub reason: String,
}

/// The outer control loop over the whole stack.
pub struct ResearchOrchestrator {
    solver: Arc<dyn Solver>,
    sessions: Arc<SessionManager>,
    recovery: Arc<RecoveryManager>,
    broker: Arc<InterventionBroker>,
    pipeline: Arc<PerceptionPipeline>,
    pdp: Arc<PdpExtractor>,
    verifier: Arc<ProductVerifier>,
    viability: Arc<ViabilityFilter>,
    rejections: Arc<RejectionTracker>,
    perception_config: PerceptionConfig,
    config: ResearchConfig,
}

impl ResearchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        solver: Arc<dyn Solver>,
        sessions: Arc<SessionManager>,
        recovery: Arc<RecoveryManager>,
        broker: Arc<InterventionBroker>,
        pipeline: Arc<PerceptionPipeline>,
        pdp: Arc<PdpExtractor>,
        verifier: Arc<ProductVerifier>,
        viability: Arc<ViabilityFilter>,
        rejections: Arc<RejectionTracker>,
        perception_config: PerceptionConfig,
        config: ResearchConfig,
    ) -> Self {
        Self {
            solver,
            sessions,
            recovery,
            broker,
            pipeline,
            pdp,
            verifier,
            viability,
            rejections,
            perception_config,
            config,
        }
    }

    /// Run one research request to completion.
    pub async fn research(
        &self,
        request: &ResearchRequest,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Result<ResearchOutcome> {
        events.phase_started("plan");
        let mut plan = planner::plan(&self.solver, &request.query).await?;
        events.phase_complete("plan");

        let max_hops = if request.deep {
            self.config.max_hops + 1
        } else {
            self.config.max_hops
        };

        let mut all_viable: Vec<VerifiedProduct> = Vec::new();
        let mut all_rejected: Vec<RejectionSummary> = Vec::new();
        let mut caveats: Vec<String> = Vec::new();
        let mut queries_run: Vec<String> = Vec::new();
        let mut run_stats = ExtractionStats::default();
        let mut passes = 0u32;

        for hop in 0..max_hops {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }
            passes = hop + 1;

            let queries = plan.search_queries.clone();
            for query in &queries {
                if cancel.is_cancelled() {
                    return Err(ResearchError::Cancelled);
                }
                queries_run.push(query.clone());

                let hits = match self.run_search(request, query, &events).await {
                    Ok(hits) => hits,
                    Err(ResearchError::InterventionTimedOut { url }) => {
                        caveats.push(format!("blocked at {url}, human intervention timed out"));
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(query, error = %e, "search hop failed");
                        caveats.push(format!("search failed for '{query}': {e}"));
                        continue;
                    }
                };

                let commerce_hits = select_vendor_hits(&hits, self.config.max_vendors_per_query);
                events.progress(
                    format!("visiting {} vendor pages", commerce_hits.len()),
                    0,
                    commerce_hits.len(),
                );

                for (i, hit) in commerce_hits.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return Err(ResearchError::Cancelled);
                    }
                    events.emit(ResearchEvent::CandidateChecking {
                        url: hit.url.clone(),
                        title: hit.title.clone(),
                    });

                    match self
                        .work_vendor_page(request, query, hit, &plan.requirements, &events)
                        .await
                    {
                        Ok((mut viable, mut rejected, stats)) => {
                            all_viable.append(&mut viable);
                            all_rejected.append(&mut rejected);
                            merge_stats(&mut run_stats, stats);
                        }
                        Err(e) => {
                            tracing::warn!(url = %hit.url, error = %e, "vendor page failed");
                            events.emit(ResearchEvent::CandidateRejected {
                                url: hit.url.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    events.progress("vendor pages", i + 1, commerce_hits.len());
                }
            }

            // decide_next: enough viable products ends the loop; otherwise
            // refine the plan with what the rejection tracker learned.
            if all_viable.len() >= self.config.min_viable_floor {
                break;
            }
            if hop + 1 < max_hops {
                let mut refinements: Vec<String> = Vec::new();
                for query in &queries {
                    for vendor in all_rejected.iter().map(|r| r.vendor.clone()) {
                        refinements.extend(self.rejections.get_query_refinements(&vendor, query));
                    }
                }
                refinements.sort();
                refinements.dedup();
                planner::apply_refinements(&mut plan, &refinements);
                tracing::info!(hop = hop + 1, viable = all_viable.len(), "refining and retrying");
            }
        }

        if all_viable.is_empty() {
            caveats.push("no viable products found".to_string());
        }

        let by_vendor = group_by_vendor(all_viable);
        let viable_count = by_vendor.iter().map(|v| v.products.len()).sum();
        events.emit(ResearchEvent::ResearchComplete {
            total_products: viable_count,
            viable_products: viable_count,
            vendors: by_vendor.iter().map(|v| v.vendor.clone()).collect(),
        });

        Ok(ResearchOutcome {
            by_vendor,
            viable_count,
            rejected: all_rejected,
            caveats,
            passes,
            queries_run,
            stats: run_stats,
        })
    }

    /// Drive a search engine inside this request's session.
    async fn run_search(
        &self,
        request: &ResearchRequest,
        query: &str,
        events: &EventEmitter,
    ) -> Result<Vec<SearchHit>> {
        let key = ContextKey::new("search", &request.session_id, &request.user_id);
        let context = self.sessions.get_or_create(&key).await?;
        let hits = engines::search(
            &context.page,
            query,
            &self.broker,
            &request.session_id,
            events,
        )
        .await?;
        self.sessions.registry().touch(&request.session_id);
        Ok(hits)
    }

    /// Visit one vendor result: classify, extract, prioritize, verify,
    /// filter, record rejections.
    async fn work_vendor_page(
        &self,
        request: &ResearchRequest,
        query: &str,
        hit: &SearchHit,
        requirements: &Requirements,
        events: &EventEmitter,
    ) -> Result<(Vec<VerifiedProduct>, Vec<RejectionSummary>, ExtractionStats)> {
        let vendor = perception::models::vendor_of(&hit.url);
        let key = ContextKey::new(&vendor, &request.session_id, &request.user_id);

        // Navigation runs under the recovery manager: a dead page or context
        // is rebuilt and the navigation retried once.
        let target = hit.url.clone();
        let context = self
            .recovery
            .execute_with_recovery(
                &key,
                move |ctx| {
                    let target = target.clone();
                    async move {
                        ctx.page.navigate(&target, WaitPolicy::NetworkIdle).await?;
                        Ok(ctx)
                    }
                },
                1,
            )
            .await?;
        let page = &context.page;
        let landed_url = page.current_url().await?;
        self.sessions
            .registry()
            .update_url(&request.session_id, &landed_url);

        let content = page.content().await?;
        let is_pdp = classify::is_pdp(&landed_url, Some(&content));

        let mut page_stats = ExtractionStats::default();
        let verified: Vec<VerifiedProduct> = if is_pdp {
            // Direct PDP: extract in place, no navigation loop needed.
            match self.pdp.extract(page, &landed_url, Some(query)).await? {
                Some(data) => vec![VerifiedProduct {
                    title: data.title.clone().unwrap_or_else(|| hit.title.clone()),
                    price: data.price,
                    url: landed_url.clone(),
                    vendor: vendor.clone(),
                    in_stock: data.in_stock,
                    stock_status: data.stock_status.clone(),
                    original_price: data.original_price,
                    condition: data.condition.clone(),
                    rating: data.rating,
                    review_count: data.review_count,
                    specs: data.specs.clone(),
                    image_url: data.image_url.clone(),
                    extraction_confidence: data.extraction_confidence,
                    extraction_source: data.extraction_source.clone(),
                    verification_method: VerificationMethod::DirectPdp,
                    original_title: Some(hit.title.clone()),
                }],
                None => Vec::new(),
            }
        } else {
            // Listing: hybrid extraction, prioritize, verify with early stop.
            let (products, stats) = self.pipeline.extract_listing(page, &landed_url, query).await?;
            page_stats = stats;
            let prioritized = prioritize(
                products,
                requirements,
                query,
                self.perception_config.pdp_max_verify_per_retailer,
            );

            for rejected in &prioritized.rejected {
                events.emit(ResearchEvent::CandidateRejected {
                    url: rejected.product.url.clone(),
                    reason: rejected.rejection_reason.clone(),
                });
            }
            // Safe rejects feed the tracker too.
            let reject_reasons: Vec<String> = prioritized
                .rejected
                .iter()
                .map(|r| r.rejection_reason.clone())
                .collect();
            if !reject_reasons.is_empty() {
                let _ = self.rejections.record_rejections(
                    &vendor,
                    query,
                    &reject_reasons,
                    prioritized.stats.total,
                );
            }

            let candidates: Vec<perception::FusedProduct> = prioritized
                .prioritized
                .into_iter()
                .map(|c| c.product)
                .collect();
            self.verifier
                .verify_products_with_early_stop(
                    page,
                    &candidates,
                    &landed_url,
                    &vendor,
                    Some(query),
                    &request.session_id,
                    self.config.target_viable,
                    requirements,
                    query,
                )
                .await
        };

        page_stats.pdp_verified = verified
            .iter()
            .filter(|p| p.verification_method != VerificationMethod::ListingFallback)
            .count();

        if verified.is_empty() {
            return Ok((Vec::new(), Vec::new(), page_stats));
        }
        let total_verified = verified.len();

        let result = self
            .viability
            .filter_viable(
                verified,
                requirements,
                query,
                self.config.max_viable_per_vendor,
            )
            .await?;

        let rejected_summaries: Vec<RejectionSummary> = result
            .rejected
            .iter()
            .map(|r| RejectionSummary {
                title: r.product.title.clone(),
                vendor: vendor.clone(),
                reason: r
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "did not meet requirements".to_string()),
            })
            .collect();

        let reasons: Vec<String> = rejected_summaries.iter().map(|r| r.reason.clone()).collect();
        if !reasons.is_empty() {
            let _ = self
                .rejections
                .record_rejections(&vendor, query, &reasons, total_verified);
        }

        for product in &result.viable {
            events.emit(ResearchEvent::CandidateAccepted {
                url: product.product.url.clone(),
                title: product.product.title.clone(),
            });
        }

        let viable: Vec<VerifiedProduct> =
            result.viable.into_iter().map(|e| e.product).collect();

        self.sessions.save_state(&key).await.ok();
        Ok((viable, rejected_summaries, page_stats))
    }
}

fn merge_stats(into: &mut ExtractionStats, from: ExtractionStats) {
    into.html_candidates += from.html_candidates;
    into.vision_products += from.vision_products;
    into.fusion_matches += from.fusion_matches;
    into.click_resolved += from.click_resolved;
    into.pdp_verified += from.pdp_verified;
    into.price_discrepancies += from.price_discrepancies;
    into.extraction_time_ms += from.extraction_time_ms;
    into.errors.extend(from.errors);
}

/// Prefer hits that look like retailer pages over informational ones.
pub fn select_vendor_hits(hits: &[SearchHit], max: usize) -> Vec<SearchHit> {
    let mut seen_vendors = std::collections::HashSet::new();
    let mut selected = Vec::new();

    for hit in hits {
        let vendor = perception::models::vendor_of(&hit.url);
        if vendor.is_empty() || !seen_vendors.insert(vendor) {
            continue;
        }
        let lower = hit.url.to_lowercase();
        let commerce = classify::is_pdp_by_url(&hit.url) == Some(true)
            || lower.contains("/shop")
            || lower.contains("/s?")
            || lower.contains("search")
            || lower.contains("/b/")
            || lower.contains("category");
        if commerce || selected.len() < max {
            selected.push(hit.clone());
        }
        if selected.len() >= max {
            break;
        }
    }
    selected
}

/// Aggregate verified products per vendor for the report.
pub fn group_by_vendor(products: Vec<VerifiedProduct>) -> Vec<VendorProducts> {
    let mut by_vendor: HashMap<String, Vec<VerifiedProduct>> = HashMap::new();
    for product in products {
        by_vendor
            .entry(product.vendor.clone())
            .or_default()
            .push(product);
    }
    let mut groups: Vec<VendorProducts> = by_vendor
        .into_iter()
        .map(|(vendor, products)| VendorProducts { vendor, products })
        .collect();
    groups.sort_by(|a, b| b.products.len().cmp(&a.products.len()));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(vendor: &str, title: &str) -> VerifiedProduct {
        VerifiedProduct {
            title: title.to_string(),
            price: Some(999.0),
            url: format!("https://{vendor}/product/{title}"),
            vendor: vendor.to_string(),
            in_stock: true,
            stock_status: "in_stock".to_string(),
            original_price: None,
            condition: "new".to_string(),
            rating: None,
            review_count: None,
            specs: Default::default(),
            image_url: None,
            extraction_confidence: 0.9,
            extraction_source: "json_ld".to_string(),
            verification_method: VerificationMethod::DirectPdp,
            original_title: None,
        }
    }

    #[test]
    fn test_group_by_vendor_sorts_by_count() {
        let products = vec![
            product("bestbuy.com", "a"),
            product("newegg.com", "b"),
            product("newegg.com", "c"),
        ];
        let groups = group_by_vendor(products);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].vendor, "newegg.com");
        assert_eq!(groups[0].products.len(), 2);
    }

    #[test]
    fn test_select_vendor_hits_one_per_vendor() {
        let hits = vec![
            SearchHit {
                title: "Best Buy laptops".to_string(),
                url: "https://www.bestbuy.com/site/searchpage.jsp?st=laptop".to_string(),
            },
            SearchHit {
                title: "Best Buy deal page".to_string(),
                url: "https://www.bestbuy.com/product/deal".to_string(),
            },
            SearchHit {
                title: "Newegg gaming laptops".to_string(),
                url: "https://www.newegg.com/p/pl?d=gaming+laptop".to_string(),
            },
        ];
        let selected = select_vendor_hits(&hits, 3);
        assert_eq!(selected.len(), 2);
        assert!(selected[0].url.contains("bestbuy"));
        assert!(selected[1].url.contains("newegg"));
    }

    #[test]
    fn test_select_vendor_hits_caps() {
        let hits: Vec<SearchHit> = (0..10)
            .map(|i| SearchHit {
                title: format!("Vendor {i}"),
                url: format!("https://vendor{i}.example/search?q=x"),
            })
            .collect();
        assert_eq!(select_vendor_hits(&hits, 3).len(), 3);
    }
}
