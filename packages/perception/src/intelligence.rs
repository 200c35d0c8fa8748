//! Per-domain page intelligence.
//!
//! A `PageUnderstanding` is a learned structural description of a domain's
//! page layout: its type, zones and selectors. Calibration runs in three
//! phases - zone identification, selector generation, strategy choice - all
//! driven by the solver over a simplified DOM snapshot. Understandings are
//! cached in a bounded LRU and persisted append-only as JSONL, newest record
//! winning.

use chrono::{DateTime, Utc};
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use solver_client::{ChatMessage, Solver};

use browser::DrivenPage;

use crate::error::{PerceptionError, Result};
use crate::jsonx;
use crate::models::vendor_of;

/// In-memory understanding cache capacity.
const CACHE_CAPACITY: usize = 64;

/// What kind of page this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    SearchResults,
    ProductListing,
    ProductDetail,
    Category,
    Homepage,
    Unknown,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::SearchResults => "search_results",
            PageType::ProductListing => "product_listing",
            PageType::ProductDetail => "product_detail",
            PageType::Category => "category",
            PageType::Homepage => "homepage",
            PageType::Unknown => "unknown",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "search_results" => PageType::SearchResults,
            "product_listing" | "listing" => PageType::ProductListing,
            "product_detail" | "pdp" => PageType::ProductDetail,
            "category" => PageType::Category,
            "homepage" => PageType::Homepage,
            _ => PageType::Unknown,
        }
    }
}

/// Page-level availability signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    AvailableOnline,
    InStoreOnly,
    OutOfStock,
    LimitedAvailability,
    ContactForAvailability,
    Unknown,
}

/// A per-field selector with its own confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSelector {
    pub selector: String,
    pub confidence: f32,
}

/// A labeled region of the page with DOM anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub zone_type: String,
    pub anchors: Vec<String>,
    #[serde(default)]
    pub fields: HashMap<String, FieldSelector>,
    pub confidence: f32,
}

/// Learned structural description of a domain's page layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageUnderstanding {
    pub domain: String,
    pub page_type: PageType,
    pub zones: Vec<Zone>,
    pub primary_zone: Option<String>,
    #[serde(default)]
    pub notices: Vec<String>,
    pub availability_status: AvailabilityStatus,
    #[serde(default)]
    pub purchase_constraints: Vec<String>,
    pub extraction_strategy: String,
    pub created_at: DateTime<Utc>,
    pub confidence: f32,
}

impl PageUnderstanding {
    pub fn zone(&self, zone_type: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.zone_type == zone_type)
    }

    /// The zone the primary tag points at. By construction a set
    /// `primary_zone` always names an existing zone.
    pub fn primary(&self) -> Option<&Zone> {
        self.primary_zone.as_deref().and_then(|z| self.zone(z))
    }
}

/// Flat projection of an understanding: the selector table mechanical
/// extractors use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub domain: String,
    pub page_type: String,
    #[serde(default)]
    pub product_card_selector: String,
    #[serde(default)]
    pub title_selector: String,
    #[serde(default)]
    pub price_selector: String,
    #[serde(default)]
    pub link_selector: String,
    #[serde(default)]
    pub image_selector: String,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionSchema {
    pub fn new(domain: &str, page_type: &str) -> Self {
        let now = Utc::now();
        Self {
            domain: domain.to_string(),
            page_type: page_type.to_string(),
            product_card_selector: String::new(),
            title_selector: String::new(),
            price_selector: String::new(),
            link_selector: String::new(),
            image_selector: String::new(),
            success_count: 0,
            failure_count: 0,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Project the primary zone of an understanding into the flat form.
    pub fn from_understanding(understanding: &PageUnderstanding) -> Self {
        let mut schema = Self::new(&understanding.domain, understanding.page_type.as_str());
        if let Some(zone) = understanding.primary() {
            schema.product_card_selector = zone.anchors.first().cloned().unwrap_or_default();
            for (field, selector) in &zone.fields {
                match field.as_str() {
                    "title" => schema.title_selector = selector.selector.clone(),
                    "price" => schema.price_selector = selector.selector.clone(),
                    "link" => schema.link_selector = selector.selector.clone(),
                    "image" => schema.image_selector = selector.selector.clone(),
                    _ => {}
                }
            }
        }
        schema
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        self.last_failure_reason = None;
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.failure_count += 1;
        self.last_failure_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
    }

    /// Recalibrate when failures dominate: a failure reason is recorded AND
    /// failures have reached twice the successes.
    pub fn needs_recalibration(&self) -> bool {
        self.last_failure_reason.is_some() && self.failure_count >= self.success_count * 2
    }
}

/// CSS-in-JS hashed class names churn on every deploy; learned selectors
/// must never depend on them.
pub fn is_stable_selector(selector: &str) -> bool {
    static HASHED: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = HASHED.get_or_init(|| {
        vec![
            Regex::new(r"-sc-[a-f0-9]+").expect("valid selector pattern"),
            Regex::new(r"\bcss-[a-f0-9]+").expect("valid selector pattern"),
            Regex::new(r"__[A-Za-z]+-[a-f0-9]{4,}").expect("valid selector pattern"),
        ]
    });
    !selector.is_empty() && !patterns.iter().any(|p| p.is_match(selector))
}

/// Append-only JSONL store for schemas and understandings, one file per
/// domain. The newest record for a `(domain, page_type)` wins.
pub struct SchemaStore {
    dir: PathBuf,
}

impl SchemaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, domain: &str) -> PathBuf {
        let safe: String = domain
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    pub fn append_schema(&self, schema: &ExtractionSchema) -> Result<()> {
        self.append_line(&schema.domain, &serde_json::json!({"schema": schema}))
    }

    pub fn append_understanding(&self, understanding: &PageUnderstanding) -> Result<()> {
        self.append_line(
            &understanding.domain,
            &serde_json::json!({"understanding": understanding}),
        )
    }

    fn append_line(&self, domain: &str, record: &Value) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(domain))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Latest flat schema for `(domain, page_type)`.
    pub fn latest_schema(&self, domain: &str, page_type: &str) -> Result<Option<ExtractionSchema>> {
        let mut newest: Option<ExtractionSchema> = None;
        for record in self.read_records(domain)? {
            if let Some(value) = record.get("schema") {
                if let Ok(schema) = serde_json::from_value::<ExtractionSchema>(value.clone()) {
                    if schema.page_type == page_type {
                        newest = Some(schema);
                    }
                }
            }
        }
        Ok(newest)
    }

    /// Latest understanding for `(domain, page_type)`.
    pub fn latest_understanding(
        &self,
        domain: &str,
        page_type: PageType,
    ) -> Result<Option<PageUnderstanding>> {
        let mut newest: Option<PageUnderstanding> = None;
        for record in self.read_records(domain)? {
            if let Some(value) = record.get("understanding") {
                if let Ok(u) = serde_json::from_value::<PageUnderstanding>(value.clone()) {
                    if u.page_type == page_type {
                        newest = Some(u);
                    }
                }
            }
        }
        Ok(newest)
    }

    fn read_records(&self, domain: &str) -> Result<Vec<Value>> {
        let path = self.file_for(domain);
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

/// An item extracted through a learned schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaItem {
    pub title: String,
    pub price: Option<String>,
    pub url: Option<String>,
    pub image: Option<String>,
}

/// In-page snapshot routine: tag, id, non-utility classes, data-testid,
/// text snippets, hrefs, and repeated-class statistics.
const DOM_SNAPSHOT_JS: &str = r#"(() => {
    const classCounts = {};
    for (const el of document.querySelectorAll('[class]')) {
        for (const cls of el.classList) {
            classCounts[cls] = (classCounts[cls] || 0) + 1;
        }
    }
    const repeated = Object.entries(classCounts)
        .filter(([, n]) => n >= 4)
        .sort((a, b) => b[1] - a[1])
        .slice(0, 40)
        .map(([cls, n]) => ({cls, count: n}));

    const elements = [];
    const interesting = document.querySelectorAll('h1, h2, h3, a[href], [data-testid], [itemprop]');
    for (const el of Array.from(interesting).slice(0, 150)) {
        elements.push({
            tag: el.tagName.toLowerCase(),
            id: el.id || null,
            classes: Array.from(el.classList).slice(0, 5),
            testid: el.getAttribute('data-testid'),
            itemprop: el.getAttribute('itemprop'),
            text: (el.textContent || '').trim().substring(0, 80),
            href: el.getAttribute('href'),
        });
    }

    return {
        title: document.title,
        repeated_classes: repeated,
        elements: elements,
        body_text_sample: document.body.innerText.substring(0, 1500),
    };
})()"#;

/// The per-domain calibration service.
pub struct PageIntelligence {
    solver: Arc<dyn Solver>,
    store: SchemaStore,
    cache: Mutex<LruCache<String, PageUnderstanding>>,
}

impl PageIntelligence {
    pub fn new(solver: Arc<dyn Solver>, schema_dir: impl Into<PathBuf>) -> Self {
        Self {
            solver,
            store: SchemaStore::new(schema_dir),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    fn cache_key(domain: &str, page_type: PageType) -> String {
        format!("{domain}|{}", page_type.as_str())
    }

    /// Coarse page-type guess from the URL alone, used as the cache key
    /// before any calibration has run.
    pub fn guess_page_type(url: &str) -> PageType {
        let lower = url.to_lowercase();
        if crate::filters::is_valid_product_url(url) && !lower.contains("search") {
            PageType::ProductDetail
        } else if lower.contains("search") || lower.contains("?q=") || lower.contains("&q=") {
            PageType::SearchResults
        } else {
            PageType::ProductListing
        }
    }

    /// Produce or retrieve a `PageUnderstanding` for the page.
    pub async fn understand_page(
        &self,
        page: &DrivenPage,
        url: &str,
        force_refresh: bool,
    ) -> Result<PageUnderstanding> {
        let domain = vendor_of(url);
        let guessed = Self::guess_page_type(url);
        let key = Self::cache_key(&domain, guessed);

        if !force_refresh {
            if let Some(cached) = self.cache.lock().await.get(&key) {
                tracing::debug!(domain, "understanding cache hit");
                return Ok(cached.clone());
            }
            if let Some(persisted) = self.store.latest_understanding(&domain, guessed)? {
                self.cache.lock().await.put(key, persisted.clone());
                return Ok(persisted);
            }
        }

        let snapshot = page.evaluate(DOM_SNAPSHOT_JS).await?;
        let understanding = self.calibrate(&domain, url, &snapshot).await?;

        self.store.append_understanding(&understanding)?;
        self.store
            .append_schema(&ExtractionSchema::from_understanding(&understanding))?;
        let key = Self::cache_key(&domain, understanding.page_type);
        self.cache.lock().await.put(key, understanding.clone());
        Ok(understanding)
    }

    /// Three-phase calibration over a DOM snapshot.
    pub async fn calibrate(
        &self,
        domain: &str,
        url: &str,
        snapshot: &Value,
    ) -> Result<PageUnderstanding> {
        // Phase 1: zone identification.
        let base = crate::prompts::load("zone_analysis", crate::prompts::ZONE_ANALYSIS_FALLBACK);
        let zone_prompt = format!(
            "{base}\n\nURL: {url}\nSimplified DOM:\n{snapshot}\n\n\
             What kind of page is this, and where do the relevant repeated items \
             live? Respond with JSON: {{\"page_type\": \
             \"search_results|product_listing|product_detail|category|homepage|unknown\", \
             \"zones\": [{{\"zone_type\": \"product_grid|navigation|filters|pagination|other\", \
             \"anchors\": [\"css selector\", ...], \"confidence\": 0.0}}], \
             \"primary_zone\": \"zone_type or null\", \"notices\": [\"...\"], \
             \"availability_status\": \"available_online|in_store_only|out_of_stock|limited_availability|contact_for_availability|unknown\", \
             \"purchase_constraints\": [\"...\"]}}"
        );
        let zone_response = self
            .solver
            .complete_with_temperature(&[ChatMessage::user(zone_prompt)], 0.2)
            .await?;
        let zone_value = jsonx::extract_json_object(&zone_response).ok_or_else(|| {
            PerceptionError::ExtractionFailed {
                reason: "zone identification returned no JSON".to_string(),
            }
        })?;

        let page_type = PageType::parse(
            zone_value
                .get("page_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        );
        let mut zones = parse_zones(&zone_value);
        let mut primary_zone = zone_value
            .get("primary_zone")
            .and_then(Value::as_str)
            .map(str::to_string);
        // The invariant: a set primary_zone must name an existing zone.
        if let Some(primary) = &primary_zone {
            if !zones.iter().any(|z| &z.zone_type == primary) {
                primary_zone = zones.first().map(|z| z.zone_type.clone());
            }
        }

        // Phase 2: selector generation for the primary zone.
        let mut overall_confidence = 0.5f32;
        if let Some(primary) = primary_zone.clone() {
            let anchors = zones
                .iter()
                .find(|z| z.zone_type == primary)
                .map(|z| z.anchors.join(", "))
                .unwrap_or_default();
            let selector_prompt = format!(
                "For the repeated items inside the zone anchored at `{anchors}` on \
                 {url}, give an item selector and per-field selectors. Prefer \
                 data-testid, stable ids, or semantic class names like `price` or \
                 `product-title`; never use hashed CSS-in-JS classes.\n\n\
                 Simplified DOM:\n{snapshot}\n\nRespond with JSON: \
                 {{\"item_selector\": \"...\", \"fields\": {{\"title\": \"...\", \
                 \"price\": \"...\", \"link\": \"...\", \"image\": \"...\"}}, \
                 \"confidence\": 0.0}}"
            );
            let selector_response = self
                .solver
                .complete_with_temperature(&[ChatMessage::user(selector_prompt)], 0.2)
                .await?;
            if let Some(selector_value) = jsonx::extract_json_object(&selector_response) {
                overall_confidence = selector_value
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5) as f32;
                apply_selectors(&mut zones, &primary, &selector_value, overall_confidence);
            }
        }

        // Phase 3: strategy choice.
        let extraction_strategy = if primary_zone.is_none() || overall_confidence < 0.3 {
            "vision"
        } else if overall_confidence < 0.6 {
            "hybrid"
        } else if page_type == PageType::ProductDetail {
            "prose"
        } else {
            "selector"
        };

        let understanding = PageUnderstanding {
            domain: domain.to_string(),
            page_type,
            zones,
            primary_zone,
            notices: string_array(&zone_value, "notices"),
            availability_status: parse_availability(
                zone_value
                    .get("availability_status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown"),
            ),
            purchase_constraints: string_array(&zone_value, "purchase_constraints"),
            extraction_strategy: extraction_strategy.to_string(),
            created_at: Utc::now(),
            confidence: overall_confidence,
        };

        tracing::info!(
            domain,
            page_type = understanding.page_type.as_str(),
            strategy = %understanding.extraction_strategy,
            confidence = understanding.confidence,
            "page calibrated"
        );
        Ok(understanding)
    }

    /// Apply the learned selectors on the live page.
    ///
    /// Surfaces an extraction-failure signal when the item count is below 2
    /// and the understanding's confidence is low.
    pub async fn extract(
        &self,
        page: &DrivenPage,
        understanding: &PageUnderstanding,
    ) -> Result<Vec<SchemaItem>> {
        let Some(zone) = understanding.primary() else {
            return Err(PerceptionError::ExtractionFailed {
                reason: "no primary zone".to_string(),
            });
        };
        let schema = ExtractionSchema::from_understanding(understanding);
        let script = schema_extraction_js(&schema, zone);
        let value = page.evaluate(&script).await?;
        let items = parse_schema_items(&value);

        if items.len() < 2 && understanding.confidence < 0.6 {
            self.record_failure(
                &understanding.domain,
                understanding.page_type.as_str(),
                "schema extraction produced too few items",
            )?;
            return Err(PerceptionError::ExtractionFailed {
                reason: format!("schema extraction found {} items", items.len()),
            });
        }

        self.record_success(&understanding.domain, understanding.page_type.as_str())?;
        Ok(items)
    }

    /// `understand_page` then `extract`.
    pub async fn quick_extract(&self, page: &DrivenPage, url: &str) -> Result<Vec<SchemaItem>> {
        let understanding = self.understand_page(page, url, false).await?;
        self.extract(page, &understanding).await
    }

    /// Record a successful schema application.
    pub fn record_success(&self, domain: &str, page_type: &str) -> Result<()> {
        let mut schema = self
            .store
            .latest_schema(domain, page_type)?
            .unwrap_or_else(|| ExtractionSchema::new(domain, page_type));
        schema.record_success();
        self.store.append_schema(&schema)
    }

    /// Record a failed schema application.
    pub fn record_failure(&self, domain: &str, page_type: &str, reason: &str) -> Result<()> {
        let mut schema = self
            .store
            .latest_schema(domain, page_type)?
            .unwrap_or_else(|| ExtractionSchema::new(domain, page_type));
        schema.record_failure(reason);
        let recalibrate = schema.needs_recalibration();
        self.store.append_schema(&schema)?;
        if recalibrate {
            tracing::warn!(domain, page_type, "schema flagged for recalibration");
        }
        Ok(())
    }

    /// Whether the stored schema has decayed enough to rebuild.
    pub fn needs_recalibration(&self, domain: &str, page_type: &str) -> bool {
        self.store
            .latest_schema(domain, page_type)
            .ok()
            .flatten()
            .map(|s| s.needs_recalibration())
            .unwrap_or(false)
    }
}

fn parse_zones(value: &Value) -> Vec<Zone> {
    let Some(zones) = value.get("zones").and_then(Value::as_array) else {
        return Vec::new();
    };
    zones
        .iter()
        .filter_map(|z| {
            let zone_type = z.get("zone_type").and_then(Value::as_str)?;
            let anchors: Vec<String> = z
                .get("anchors")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .filter(|s| is_stable_selector(s))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(Zone {
                zone_type: zone_type.to_string(),
                anchors,
                fields: HashMap::new(),
                confidence: z.get("confidence").and_then(Value::as_f64).unwrap_or(0.5) as f32,
            })
        })
        .collect()
}

fn apply_selectors(zones: &mut [Zone], primary: &str, value: &Value, confidence: f32) {
    let Some(zone) = zones.iter_mut().find(|z| z.zone_type == primary) else {
        return;
    };
    if let Some(item_selector) = value.get("item_selector").and_then(Value::as_str) {
        if is_stable_selector(item_selector) {
            zone.anchors.insert(0, item_selector.to_string());
        }
    }
    if let Some(fields) = value.get("fields").and_then(Value::as_object) {
        for (name, selector) in fields {
            if let Some(selector) = selector.as_str() {
                if is_stable_selector(selector) {
                    zone.fields.insert(
                        name.clone(),
                        FieldSelector {
                            selector: selector.to_string(),
                            confidence,
                        },
                    );
                }
            }
        }
    }
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn parse_availability(s: &str) -> AvailabilityStatus {
    match s {
        "available_online" => AvailabilityStatus::AvailableOnline,
        "in_store_only" => AvailabilityStatus::InStoreOnly,
        "out_of_stock" => AvailabilityStatus::OutOfStock,
        "limited_availability" => AvailabilityStatus::LimitedAvailability,
        "contact_for_availability" => AvailabilityStatus::ContactForAvailability,
        _ => AvailabilityStatus::Unknown,
    }
}

fn schema_extraction_js(schema: &ExtractionSchema, zone: &Zone) -> String {
    let card = if schema.product_card_selector.is_empty() {
        zone.anchors.first().cloned().unwrap_or_default()
    } else {
        schema.product_card_selector.clone()
    };
    format!(
        r#"(() => {{
    const items = [];
    for (const card of document.querySelectorAll({card:?})) {{
        const pick = (sel, attr) => {{
            if (!sel) return null;
            const el = card.querySelector(sel);
            if (!el) return null;
            return attr ? el.getAttribute(attr) : (el.textContent || '').trim();
        }};
        items.push({{
            title: pick({title:?}, null),
            price: pick({price:?}, null),
            url: pick({link:?}, 'href'),
            image: pick({image:?}, 'src'),
        }});
        if (items.length >= 40) break;
    }}
    return items;
}})()"#,
        card = card,
        title = schema.title_selector,
        price = schema.price_selector,
        link = schema.link_selector,
        image = schema.image_selector,
    )
}

fn parse_schema_items(value: &Value) -> Vec<SchemaItem> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let title = item.get("title").and_then(Value::as_str)?.trim().to_string();
            if title.is_empty() {
                return None;
            }
            Some(SchemaItem {
                title,
                price: item.get("price").and_then(Value::as_str).map(str::to_string),
                url: item.get("url").and_then(Value::as_str).map(str::to_string),
                image: item.get("image").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solver_client::MockSolver;

    #[test]
    fn test_selector_hygiene() {
        assert!(is_stable_selector("[data-testid=\"product-card\"]"));
        assert!(is_stable_selector(".product-title"));
        assert!(is_stable_selector("#main-price"));
        assert!(!is_stable_selector(".ProductCard-sc-1a2b3c"));
        assert!(!is_stable_selector(".css-4f9a2b"));
        assert!(!is_stable_selector(".Card__Title-9f8e7d6c"));
        assert!(!is_stable_selector(""));
    }

    #[test]
    fn test_needs_recalibration_rule() {
        let mut schema = ExtractionSchema::new("shop.example", "product_listing");
        assert!(!schema.needs_recalibration());

        schema.record_success();
        schema.record_failure("no items");
        assert!(!schema.needs_recalibration());

        schema.record_failure("no items");
        // 2 failures >= 2 * 1 success, with a failure reason set.
        assert!(schema.needs_recalibration());

        schema.record_success();
        // Success clears the failure reason.
        assert!(!schema.needs_recalibration());
    }

    #[test]
    fn test_schema_store_newest_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());

        let mut schema = ExtractionSchema::new("shop.example", "product_listing");
        schema.price_selector = ".old-price".to_string();
        store.append_schema(&schema).unwrap();

        schema.price_selector = ".new-price".to_string();
        schema.record_success();
        store.append_schema(&schema).unwrap();

        let loaded = store
            .latest_schema("shop.example", "product_listing")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.price_selector, ".new-price");
        assert_eq!(loaded.success_count, 1);

        // Other page types are invisible to this key.
        assert!(store
            .latest_schema("shop.example", "product_detail")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_calibration_builds_understanding() {
        let solver = MockSolver::new()
            .with_response(
                r#"{"page_type": "product_listing",
                    "zones": [
                        {"zone_type": "product_grid", "anchors": ["[data-testid=\"product-card\"]"], "confidence": 0.9},
                        {"zone_type": "navigation", "anchors": ["nav.main"], "confidence": 0.8}
                    ],
                    "primary_zone": "product_grid",
                    "notices": ["Only 3 left in stock"],
                    "availability_status": "available_online",
                    "purchase_constraints": []}"#,
            )
            .with_response(
                r#"{"item_selector": "[data-testid=\"product-card\"]",
                    "fields": {"title": ".product-title", "price": ".price", "link": "a.product-link", "image": "img.hero"},
                    "confidence": 0.85}"#,
            );

        let dir = tempfile::tempdir().unwrap();
        let intelligence = PageIntelligence::new(Arc::new(solver), dir.path());

        let understanding = intelligence
            .calibrate(
                "shop.example",
                "https://shop.example/s?q=laptop",
                &serde_json::json!({"elements": []}),
            )
            .await
            .unwrap();

        assert_eq!(understanding.domain, "shop.example");
        assert_eq!(understanding.page_type, PageType::ProductListing);
        assert_eq!(understanding.primary_zone.as_deref(), Some("product_grid"));
        // Invariant: the primary zone exists.
        assert!(understanding.primary().is_some());
        assert_eq!(understanding.extraction_strategy, "selector");

        let schema = ExtractionSchema::from_understanding(&understanding);
        assert_eq!(schema.title_selector, ".product-title");
        assert_eq!(schema.price_selector, ".price");
        assert_eq!(schema.product_card_selector, "[data-testid=\"product-card\"]");
    }

    #[tokio::test]
    async fn test_calibration_drops_hashed_selectors() {
        let solver = MockSolver::new()
            .with_response(
                r#"{"page_type": "product_listing",
                    "zones": [{"zone_type": "product_grid", "anchors": [".Grid-sc-9a8b7c"], "confidence": 0.9}],
                    "primary_zone": "product_grid",
                    "availability_status": "unknown"}"#,
            )
            .with_response(
                r#"{"item_selector": ".css-1a2b3c",
                    "fields": {"title": ".product-title", "price": ".css-9d8e7f"},
                    "confidence": 0.7}"#,
            );

        let dir = tempfile::tempdir().unwrap();
        let intelligence = PageIntelligence::new(Arc::new(solver), dir.path());
        let understanding = intelligence
            .calibrate("shop.example", "https://shop.example/s", &serde_json::json!({}))
            .await
            .unwrap();

        let zone = understanding.primary().unwrap();
        assert!(zone.anchors.is_empty());
        assert!(zone.fields.contains_key("title"));
        assert!(!zone.fields.contains_key("price"));
    }

    #[test]
    fn test_guess_page_type() {
        assert_eq!(
            PageIntelligence::guess_page_type("https://shop.example/product/acer-nitro"),
            PageType::ProductDetail
        );
        assert_eq!(
            PageIntelligence::guess_page_type("https://shop.example/search?q=laptop"),
            PageType::SearchResults
        );
        assert_eq!(
            PageIntelligence::guess_page_type("https://shop.example/laptops"),
            PageType::ProductListing
        );
    }

    #[test]
    fn test_parse_schema_items_skips_untitled() {
        let value = serde_json::json!([
            {"title": "Laptop A", "price": "$999", "url": "/p/a", "image": null},
            {"title": "", "price": "$1", "url": "/p/b"},
            {"price": "$2"}
        ]);
        let items = parse_schema_items(&value);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Laptop A");
    }
}
