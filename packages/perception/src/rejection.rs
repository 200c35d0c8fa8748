//! Rejection pattern tracking.
//!
//! Records why products were excluded per (vendor, normalized query) and
//! turns dominant patterns into query-refinement hints for future searches.
//! The document persists as a single JSON file updated atomically.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// The normalized rejection reason categories.
pub const REASON_MISSING_GPU: &str = "missing_gpu";
pub const REASON_WRONG_CATEGORY: &str = "wrong_category";
pub const REASON_PRICE_MISMATCH: &str = "price_mismatch";
pub const REASON_INSUFFICIENT_RAM: &str = "insufficient_ram";
pub const REASON_INSUFFICIENT_STORAGE: &str = "insufficient_storage";
pub const REASON_OUT_OF_STOCK: &str = "out_of_stock";
pub const REASON_BRAND_MISMATCH: &str = "brand_mismatch";
pub const REASON_OTHER: &str = "other";

/// Aggregated history for one (vendor, normalized query) key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectionPattern {
    #[serde(default)]
    pub total_extractions: u64,
    #[serde(default)]
    pub total_rejections: u64,
    #[serde(default)]
    pub rejection_reasons: HashMap<String, u64>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Persistent tracker of rejection patterns.
pub struct RejectionTracker {
    path: PathBuf,
    patterns: Mutex<HashMap<String, RejectionPattern>>,
}

impl RejectionTracker {
    /// Load the tracker from its JSON document, starting empty when the file
    /// is absent or unreadable.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let patterns = std::fs::read_to_string(&path)
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or_default();
        Self {
            path,
            patterns: Mutex::new(patterns),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record rejections for a vendor/query combination and persist.
    pub fn record_rejections(
        &self,
        vendor: &str,
        query: &str,
        rejection_reasons: &[String],
        total_products: usize,
    ) -> Result<()> {
        if rejection_reasons.is_empty() {
            return Ok(());
        }
        let key = pattern_key(vendor, query);
        let now = Utc::now();

        {
            let mut patterns = self.patterns.lock();
            let entry = patterns.entry(key).or_default();
            entry.total_extractions += total_products as u64;
            entry.total_rejections += rejection_reasons.len() as u64;
            entry.last_updated = Some(now);
            if entry.first_seen.is_none() {
                entry.first_seen = Some(now);
            }
            for reason in rejection_reasons {
                let category = categorize_reason(reason);
                *entry.rejection_reasons.entry(category.to_string()).or_insert(0) += 1;
            }
        }

        tracing::info!(
            vendor,
            rejections = rejection_reasons.len(),
            total = total_products,
            "rejections recorded"
        );
        self.persist()
    }

    /// Query refinements earned from past rejections. Only speaks with at
    /// least 5 extractions of history; a reason must account for more than
    /// half of them to produce a hint.
    pub fn get_query_refinements(&self, vendor: &str, query: &str) -> Vec<String> {
        let key = pattern_key(vendor, query);
        let patterns = self.patterns.lock();
        let Some(entry) = patterns.get(&key) else {
            return Vec::new();
        };
        let total = entry.total_extractions;
        if total < 5 {
            return Vec::new();
        }

        let share = |reason: &str| {
            entry.rejection_reasons.get(reason).copied().unwrap_or(0) * 2 > total
        };

        let mut refinements = Vec::new();
        if share(REASON_MISSING_GPU) {
            refinements.push("nvidia rtx gpu".to_string());
        }
        if share(REASON_WRONG_CATEGORY) {
            refinements.push("laptop notebook".to_string());
        }
        if share(REASON_INSUFFICIENT_RAM) {
            refinements.push("16GB 32GB RAM".to_string());
        }
        // Price and stock problems are handled at the URL-filter level, not
        // in the query text.
        if share(REASON_PRICE_MISMATCH) {
            tracing::info!(vendor, "high price-mismatch rate");
        }
        if share(REASON_OUT_OF_STOCK) {
            tracing::info!(vendor, "high out-of-stock rate");
        }
        refinements
    }

    /// Aggregated stats across all queries for one vendor.
    pub fn vendor_stats(&self, vendor: &str) -> (u64, u64, Vec<(String, u64)>) {
        let prefix = format!("{vendor}:");
        let patterns = self.patterns.lock();

        let mut extractions = 0;
        let mut rejections = 0;
        let mut reasons: HashMap<String, u64> = HashMap::new();
        for (key, entry) in patterns.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            extractions += entry.total_extractions;
            rejections += entry.total_rejections;
            for (reason, count) in &entry.rejection_reasons {
                *reasons.entry(reason.clone()).or_insert(0) += count;
            }
        }
        let mut top: Vec<(String, u64)> = reasons.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(5);
        (extractions, rejections, top)
    }

    pub fn pattern(&self, vendor: &str, query: &str) -> Option<RejectionPattern> {
        self.patterns.lock().get(&pattern_key(vendor, query)).cloned()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = {
            let patterns = self.patterns.lock();
            serde_json::to_string_pretty(&*patterns)?
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// `vendor:normalized_query` where the query normalizes to its first five
/// words, sorted and joined.
pub fn pattern_key(vendor: &str, query: &str) -> String {
    format!("{vendor}:{}", normalize_query(query))
}

fn normalize_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    let mut words: Vec<&str> = lowered.split_whitespace().take(5).collect();
    words.sort_unstable();
    words.join("_")
}

/// Map a free-text rejection reason onto the fixed category set.
pub fn categorize_reason(reason: &str) -> &'static str {
    let lower = reason.to_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(&["gpu", "graphics", "nvidia", "rtx", "geforce", "radeon"]) {
        REASON_MISSING_GPU
    } else if has(&["desktop", "tower", "not a laptop", "wrong type", "monitor", "wrong category", "chromebook", "tablet"]) {
        REASON_WRONG_CATEGORY
    } else if has(&["price", "budget", "expensive", "cost"]) {
        REASON_PRICE_MISMATCH
    } else if has(&["ram", "memory"]) {
        REASON_INSUFFICIENT_RAM
    } else if has(&["storage", "ssd", "hdd", "drive"]) {
        REASON_INSUFFICIENT_STORAGE
    } else if has(&["stock", "available", "sold out"]) {
        REASON_OUT_OF_STOCK
    } else if has(&["brand", "manufacturer"]) {
        REASON_BRAND_MISMATCH
    } else {
        REASON_OTHER
    }
}
