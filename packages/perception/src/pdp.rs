//! Product detail page extraction.
//!
//! Strict strategy ladder, first non-null price wins:
//! JSON-LD, known-site selectors, solver-calibrated selectors, vision.
//! Specs are collected up front from every source and attached to whichever
//! strategy succeeds.

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use solver_client::{ChatMessage, Solver};

use browser::DrivenPage;

use crate::config::PerceptionConfig;
use crate::error::Result;
use crate::intelligence::{ExtractionSchema, PageIntelligence};
use crate::models::{parse_price, vendor_of, OcrItem, PdpData};
use crate::ocr::OcrEngine;

/// Hand-verified selectors for major retailers.
struct SiteSelectors {
    price: &'static str,
    price_alt: &'static str,
    title: &'static str,
    /// Prices below this are rejected as badges or per-month figures.
    min_price: f64,
}

const KNOWN_SITE_SELECTORS: &[(&str, SiteSelectors)] = &[
    (
        "bestbuy.com",
        SiteSelectors {
            price: r#"[data-testid="customer-price"] span[aria-hidden="true"]"#,
            price_alt: r#".priceView-hero-price span[aria-hidden="true"]"#,
            title: r#".sku-title h1, [data-testid="sku-title"]"#,
            min_price: 50.0,
        },
    ),
    (
        "amazon.com",
        SiteSelectors {
            price: "#corePrice_feature_div .a-offscreen, .a-price .a-offscreen",
            price_alt: "#priceblock_ourprice, #priceblock_dealprice",
            title: "#productTitle",
            min_price: 50.0,
        },
    ),
    (
        "walmart.com",
        SiteSelectors {
            price: r#"[itemprop="price"], [data-testid="price-wrap"]"#,
            price_alt: ".price-characteristic",
            title: r#"h1[itemprop="name"]"#,
            min_price: 50.0,
        },
    ),
    (
        "newegg.com",
        SiteSelectors {
            price: ".price-current",
            price_alt: ".product-price .price",
            title: ".product-title",
            min_price: 50.0,
        },
    ),
    (
        "petco.com",
        SiteSelectors {
            price: r#"[data-testid*="price"] span, [data-testid*="Price"] span"#,
            price_alt: r#"[class*="PurchaseTypePrice"], [class*="mainPrice"]"#,
            title: "h1",
            min_price: 1.0,
        },
    ),
    (
        "petsmart.com",
        SiteSelectors {
            price: r#"[data-testid*="price"], .product-price"#,
            price_alt: r#"[class*="price"]"#,
            title: "h1",
            min_price: 1.0,
        },
    ),
];

/// Selectors tried while waiting for price content to render.
const PRICE_WAIT_SELECTORS: &[&str] = &[
    r#"[data-testid*="price"]"#,
    r#"[class*="price"]"#,
    r#"[class*="Price"]"#,
    r#"[itemprop="price"]"#,
    ".priceView-hero-price",
    ".price-characteristic",
    "#priceblock_ourprice",
    ".a-price-whole",
    ".product-price",
    "[data-price]",
];

/// Spec keys are normalized through this table.
const SPEC_KEY_MAPPINGS: &[(&str, &str)] = &[
    ("graphics card", "gpu"),
    ("graphics processor", "gpu"),
    ("dedicated graphics", "gpu"),
    ("video card", "gpu"),
    ("graphics", "gpu"),
    ("video", "gpu"),
    ("gpu", "gpu"),
    ("processor type", "cpu"),
    ("processor model", "cpu"),
    ("processor", "cpu"),
    ("cpu", "cpu"),
    ("chip", "cpu"),
    ("system memory", "ram"),
    ("installed ram", "ram"),
    ("memory size", "ram"),
    ("memory", "ram"),
    ("ram", "ram"),
    ("solid state drive", "storage"),
    ("storage capacity", "storage"),
    ("internal storage", "storage"),
    ("hard drive", "storage"),
    ("hard disk", "storage"),
    ("storage", "storage"),
    ("ssd", "storage"),
    ("hdd", "storage"),
    ("screen size", "display"),
    ("display size", "display"),
    ("resolution", "display"),
    ("screen", "display"),
    ("display", "display"),
    ("monitor", "display"),
    ("battery life", "battery"),
    ("battery capacity", "battery"),
    ("battery", "battery"),
    ("operating system", "os"),
    ("platform", "os"),
    ("os", "os"),
    ("product weight", "weight"),
    ("weight", "weight"),
    ("brand name", "brand"),
    ("brand", "brand"),
    ("model number", "model"),
    ("model", "model"),
    ("sku", "sku"),
];

/// Phrases meaning the price is only available on request.
const CONTACT_PRICING_PHRASES: &[&str] = &[
    "contact for pricing",
    "call for price",
    "request a quote",
    "contact us for price",
    "price available in cart",
];

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\s*[\d,]+(?:\.\d{2})?").expect("valid price regex"))
}

/// Normalize a raw spec label to its canonical key.
pub fn normalize_spec_key(key: &str) -> String {
    let lower = key.to_lowercase();
    let lower = lower.trim();
    for (pattern, normalized) in SPEC_KEY_MAPPINGS {
        if lower.contains(pattern) {
            return (*normalized).to_string();
        }
    }
    lower.replace([' ', '-'], "_")
}

/// Extract `PdpData` from a page assumed to be on a product detail URL.
pub struct PdpExtractor {
    solver: Arc<dyn Solver>,
    ocr: Arc<dyn OcrEngine>,
    intelligence: Arc<PageIntelligence>,
    config: PerceptionConfig,
}

impl PdpExtractor {
    pub fn new(
        solver: Arc<dyn Solver>,
        ocr: Arc<dyn OcrEngine>,
        intelligence: Arc<PageIntelligence>,
        config: PerceptionConfig,
    ) -> Self {
        Self {
            solver,
            ocr,
            intelligence,
            config,
        }
    }

    /// Run the ladder. Returns `None` when every strategy fails.
    pub async fn extract(
        &self,
        page: &DrivenPage,
        url: &str,
        goal: Option<&str>,
    ) -> Result<Option<PdpData>> {
        tracing::info!(url, "pdp extraction starting");

        self.wait_for_price_content(page).await;
        let html = page.content().await?;

        // Specs first: attached to whichever strategy wins.
        let mut specs = specs_from_json_ld(&html);
        for (key, value) in specs_from_html(&html) {
            specs.entry(key).or_insert(value);
        }
        if let Some(goal) = goal {
            if needs_llm_specs(&specs, goal) {
                for (key, value) in self.specs_from_solver(&html, goal).await.unwrap_or_default() {
                    specs.entry(key).or_insert(value);
                }
            }
        }
        if !specs.is_empty() {
            tracing::debug!(keys = ?specs.keys().collect::<Vec<_>>(), "specs collected");
        }

        // Strategy 1: JSON-LD.
        if let Some(mut data) = parse_json_ld_product(&html) {
            if data.price.is_some() {
                data.specs = specs;
                tracing::info!(price = ?data.price, "pdp extracted via json-ld");
                return Ok(Some(data));
            }
        }

        // Strategy 2: known-site selectors.
        if let Some(mut data) = self.extract_with_known_selectors(page, url).await? {
            data.specs = specs;
            tracing::info!(price = ?data.price, "pdp extracted via known selectors");
            return Ok(Some(data));
        }

        // Strategy 3: solver-calibrated selectors.
        if let Some(mut data) = self.extract_with_learned_selectors(page, url).await? {
            data.specs = specs;
            tracing::info!(price = ?data.price, "pdp extracted via learned selectors");
            return Ok(Some(data));
        }

        // Strategy 4: vision.
        if let Some(mut data) = self.extract_with_vision(page, url).await? {
            data.specs = specs;
            tracing::info!(price = ?data.price, "pdp extracted via vision");
            return Ok(Some(data));
        }

        tracing::warn!(url, "all pdp extraction strategies failed");
        Ok(None)
    }

    /// Wait for price content to render, scrolling it into view when found.
    async fn wait_for_price_content(&self, page: &DrivenPage) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

        for selector in PRICE_WAIT_SELECTORS {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            if page.wait_for_selector(selector, Duration::from_millis(800)).await {
                let _ = page.scroll_into_view(selector).await;
                tokio::time::sleep(Duration::from_millis(300)).await;
                return;
            }
        }

        // No selector matched; if the page shows any dollar amount, scroll a
        // little to reveal the buy box.
        if let Ok(content) = page.content().await {
            if content.contains('$') {
                let _ = page.scroll_by(300).await;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    async fn extract_with_known_selectors(
        &self,
        page: &DrivenPage,
        url: &str,
    ) -> Result<Option<PdpData>> {
        let vendor = vendor_of(url);
        let Some((_, selectors)) = KNOWN_SITE_SELECTORS
            .iter()
            .find(|(domain, _)| vendor.ends_with(domain))
        else {
            return Ok(None);
        };

        let mut price_text = page.query_text(selectors.price).await?;
        if price_text.as_deref().map(str::trim).unwrap_or("").is_empty() {
            price_text = page.query_text(selectors.price_alt).await?;
        }
        let Some(price) = price_text.as_deref().and_then(parse_price) else {
            return Ok(None);
        };
        if price < selectors.min_price {
            tracing::debug!(price, min = selectors.min_price, "price below site sanity floor");
            return Ok(None);
        }

        let title = page
            .query_text(selectors.title)
            .await?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut data = PdpData::new();
        data.price = Some(price);
        data.title = title;
        data.extraction_source = "known_selectors".to_string();
        data.extraction_confidence = 0.95;
        Ok(Some(data))
    }

    /// Learned selectors: cached per domain, calibrated by the solver over a
    /// structured snapshot of candidate elements on first use.
    async fn extract_with_learned_selectors(
        &self,
        page: &DrivenPage,
        url: &str,
    ) -> Result<Option<PdpData>> {
        let domain = vendor_of(url);
        let store = self.intelligence.store();

        let mut schema = store.latest_schema(&domain, "product_detail")?;
        if schema.as_ref().map(|s| s.price_selector.is_empty()).unwrap_or(true) {
            schema = self.calibrate_pdp_selectors(page, &domain).await?;
        }
        let Some(schema) = schema else {
            return Ok(None);
        };
        if schema.price_selector.is_empty() {
            return Ok(None);
        }

        let price = page
            .query_text(&schema.price_selector)
            .await?
            .as_deref()
            .and_then(parse_price);
        let title = if schema.title_selector.is_empty() {
            None
        } else {
            page.query_text(&schema.title_selector)
                .await?
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        };

        match price {
            Some(price) => {
                self.intelligence.record_success(&domain, "product_detail")?;
                let mut data = PdpData::new();
                data.price = Some(price);
                data.title = title;
                data.extraction_source = "learned_selectors".to_string();
                data.extraction_confidence = 0.90;
                Ok(Some(data))
            }
            None => {
                self.intelligence
                    .record_failure(&domain, "product_detail", "price selector matched nothing")?;
                Ok(None)
            }
        }
    }

    async fn calibrate_pdp_selectors(
        &self,
        page: &DrivenPage,
        domain: &str,
    ) -> Result<Option<ExtractionSchema>> {
        let snapshot = page.evaluate(PDP_SNAPSHOT_JS).await?;
        let base = crate::prompts::load("pdp_selectors", crate::prompts::PDP_SELECTORS_FALLBACK);
        let prompt = format!(
            "This is a snapshot of a product detail page on {domain}: candidate \
             price elements (selector, text, y), title candidates, cart-like \
             buttons and meta tags.\n\n{snapshot}\n\n{base} Respond with JSON: \
             {{\"price_selector\": \"...\", \"title_selector\": \"...\", \
             \"cart_button_selector\": \"...\"}}"
        );
        let response = self
            .solver
            .complete_with_temperature(&[ChatMessage::user(prompt)], 0.1)
            .await?;
        let Some(value) = crate::jsonx::extract_json_object(&response) else {
            return Ok(None);
        };

        let mut schema = ExtractionSchema::new(domain, "product_detail");
        if let Some(sel) = value.get("price_selector").and_then(Value::as_str) {
            if crate::intelligence::is_stable_selector(sel) {
                schema.price_selector = sel.to_string();
            }
        }
        if let Some(sel) = value.get("title_selector").and_then(Value::as_str) {
            if crate::intelligence::is_stable_selector(sel) {
                schema.title_selector = sel.to_string();
            }
        }
        if schema.price_selector.is_empty() {
            return Ok(None);
        }
        self.intelligence.store().append_schema(&schema)?;
        tracing::info!(domain, price_selector = %schema.price_selector, "pdp selectors calibrated");
        Ok(Some(schema))
    }

    /// Vision fallback: screenshot, OCR, anchor the price to the cart button.
    async fn extract_with_vision(&self, page: &DrivenPage, url: &str) -> Result<Option<PdpData>> {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pdp-{}.png", uuid_suffix()));
        if page.screenshot(&path, false).await.is_err() {
            return Ok(None);
        }

        let spans = match self.ocr.recognize(&path).await {
            Ok(spans) => spans,
            Err(e) => {
                tracing::warn!(error = %e, "pdp vision ocr failed");
                return Ok(None);
            }
        };
        let items: Vec<OcrItem> = spans
            .into_iter()
            .filter(|s| s.confidence >= self.config.ocr_confidence_min)
            .map(|s| s.into_item())
            .collect();
        let _ = std::fs::remove_file(&path);

        let vendor = vendor_of(url);
        let min_price = KNOWN_SITE_SELECTORS
            .iter()
            .find(|(domain, _)| vendor.ends_with(domain))
            .map(|(_, s)| s.min_price)
            .unwrap_or(1.0);

        Ok(analyze_spatial_layout(&items, min_price))
    }

    async fn specs_from_solver(&self, html: &str, goal: &str) -> Result<HashMap<String, String>> {
        let text = main_content_text(html);
        let base = crate::prompts::load("pdp_specs", crate::prompts::PDP_SPECS_FALLBACK);
        let prompt = format!(
            "{base}\n\nGoal: \"{goal}\". Respond with JSON like {{\"gpu\": \"...\", \
             \"cpu\": \"...\", \"ram\": \"...\", \"storage\": \"...\", \"display\": \
             \"...\"}} including only fields present in the text.\n\n{text}"
        );
        let response = self
            .solver
            .complete_with_temperature(&[ChatMessage::user(prompt)], 0.1)
            .await?;
        let Some(value) = crate::jsonx::extract_json_object(&response) else {
            return Ok(HashMap::new());
        };
        let Some(object) = value.as_object() else {
            return Ok(HashMap::new());
        };
        Ok(object
            .iter()
            .filter_map(|(k, v)| {
                v.as_str()
                    .map(|s| (normalize_spec_key(k), s.to_string()))
            })
            .collect())
    }
}

fn uuid_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}

/// Candidate-element snapshot used to calibrate PDP selectors.
const PDP_SNAPSHOT_JS: &str = r#"(() => {
    const priceLike = [];
    for (const el of document.querySelectorAll('[class*="price"], [data-testid*="price"], [itemprop="price"], [data-price]')) {
        const text = (el.textContent || '').trim();
        if (!text || text.length > 40) continue;
        const rect = el.getBoundingClientRect();
        const sel = el.getAttribute('data-testid')
            ? `[data-testid="${el.getAttribute('data-testid')}"]`
            : (el.id ? `#${el.id}` : el.className ? '.' + String(el.className).split(' ')[0] : el.tagName.toLowerCase());
        priceLike.push({selector: sel, text: text.substring(0, 40), y: Math.round(rect.y)});
        if (priceLike.length >= 20) break;
    }
    const titles = [];
    for (const el of document.querySelectorAll('h1, h2, [itemprop="name"]')) {
        const text = (el.textContent || '').trim();
        if (text.length < 10) continue;
        titles.push({tag: el.tagName.toLowerCase(), id: el.id || null, text: text.substring(0, 120)});
        if (titles.length >= 5) break;
    }
    const buttons = [];
    for (const el of document.querySelectorAll('button, [role="button"], input[type="submit"]')) {
        const text = (el.textContent || el.value || '').trim().toLowerCase();
        if (text.includes('cart') || text.includes('buy')) {
            buttons.push({text: text.substring(0, 40), id: el.id || null, testid: el.getAttribute('data-testid')});
        }
        if (buttons.length >= 5) break;
    }
    const metas = [];
    for (const el of document.querySelectorAll('meta[property], meta[itemprop]')) {
        metas.push({key: el.getAttribute('property') || el.getAttribute('itemprop'), content: (el.getAttribute('content') || '').substring(0, 80)});
        if (metas.length >= 15) break;
    }
    return {prices: priceLike, titles, buttons, metas};
})()"#;

/// Parse the first JSON-LD Product with a price out of raw HTML.
pub fn parse_json_ld_product(html: &str) -> Option<PdpData> {
    let document = Html::parse_document(html);
    let script_sel = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;

    for script in document.select(&script_sel) {
        let body: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        let mut products = Vec::new();
        crate::html::find_products_in_json_ld(&data, &mut products);

        for product in products {
            if let Some(parsed) = pdp_from_json_ld_value(product) {
                return Some(parsed);
            }
        }
    }
    None
}

fn pdp_from_json_ld_value(product: &Value) -> Option<PdpData> {
    let offers = product.get("offers");
    let offer = match offers {
        Some(Value::Array(items)) => items.first(),
        other => other,
    };

    let price = offer.and_then(|o| {
        o.get("price")
            .or_else(|| o.get("lowPrice"))
            .and_then(value_as_price)
    })?;

    let mut data = PdpData::new();
    data.price = Some(price);
    data.title = product
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);
    data.image_url = match product.get("image") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    if let Some(availability) = offer
        .and_then(|o| o.get("availability"))
        .and_then(Value::as_str)
    {
        if availability.contains("OutOfStock") {
            data.in_stock = false;
            data.stock_status = "out_of_stock".to_string();
        } else if availability.contains("PreOrder") {
            data.stock_status = "preorder".to_string();
        } else if availability.contains("InStock") {
            data.in_stock = true;
            data.stock_status = "in_stock".to_string();
        }
    }

    if let Some(rating) = product.get("aggregateRating") {
        data.rating = rating
            .get("ratingValue")
            .and_then(value_as_f64);
        data.review_count = rating
            .get("reviewCount")
            .or_else(|| rating.get("ratingCount"))
            .and_then(value_as_f64)
            .map(|v| v as u32);
    }

    data.extraction_source = "json_ld".to_string();
    data.extraction_confidence = 0.95;
    Some(data)
}

fn value_as_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|p| *p > 0.0),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Specs from JSON-LD `additionalProperty` plus brand/model/sku.
pub fn specs_from_json_ld(html: &str) -> HashMap<String, String> {
    let mut specs = HashMap::new();
    let document = Html::parse_document(html);
    let Ok(script_sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return specs;
    };

    for script in document.select(&script_sel) {
        let body: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        let mut products = Vec::new();
        crate::html::find_products_in_json_ld(&data, &mut products);

        for product in products {
            if let Some(props) = product.get("additionalProperty").and_then(Value::as_array) {
                for prop in props {
                    let Some(name) = prop.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let value = prop
                        .get("value")
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default();
                    if !value.is_empty() {
                        specs.entry(normalize_spec_key(name)).or_insert(value);
                    }
                }
            }
            if let Some(brand) = product.pointer("/brand/name").and_then(Value::as_str) {
                specs.entry("brand".to_string()).or_insert(brand.to_string());
            }
            if let Some(model) = product.get("model").and_then(Value::as_str) {
                specs.entry("model".to_string()).or_insert(model.to_string());
            }
            if let Some(sku) = product.get("sku").and_then(Value::as_str) {
                specs.entry("sku".to_string()).or_insert(sku.to_string());
            }
        }
    }
    specs
}

/// Specs from HTML tables, definition lists and label/value spec rows.
pub fn specs_from_html(html: &str) -> HashMap<String, String> {
    let mut specs = HashMap::new();
    let document = Html::parse_document(html);

    // Small tables: spec tables have few rows, data tables have many.
    if let (Ok(table_sel), Ok(row_sel), Ok(cell_sel)) = (
        Selector::parse("table"),
        Selector::parse("tr"),
        Selector::parse("td, th"),
    ) {
        for table in document.select(&table_sel) {
            let rows: Vec<_> = table.select(&row_sel).collect();
            if rows.is_empty() || rows.len() > 40 {
                continue;
            }
            for row in rows {
                let cells: Vec<String> = row
                    .select(&cell_sel)
                    .map(|c| c.text().collect::<Vec<_>>().join(" ").trim().to_string())
                    .collect();
                if cells.len() == 2 && !cells[0].is_empty() && !cells[1].is_empty() {
                    specs
                        .entry(normalize_spec_key(&cells[0]))
                        .or_insert_with(|| cells[1].clone());
                }
            }
        }
    }

    // Definition lists.
    if let (Ok(dl_sel), Ok(dt_sel), Ok(dd_sel)) = (
        Selector::parse("dl"),
        Selector::parse("dt"),
        Selector::parse("dd"),
    ) {
        for dl in document.select(&dl_sel) {
            let terms: Vec<String> = dl
                .select(&dt_sel)
                .map(|t| t.text().collect::<Vec<_>>().join(" ").trim().to_string())
                .collect();
            let values: Vec<String> = dl
                .select(&dd_sel)
                .map(|d| d.text().collect::<Vec<_>>().join(" ").trim().to_string())
                .collect();
            for (term, value) in terms.iter().zip(values.iter()) {
                if !term.is_empty() && !value.is_empty() {
                    specs
                        .entry(normalize_spec_key(term))
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }

    // Spec-class divs with label/value children.
    if let (Ok(spec_sel), Ok(label_sel), Ok(value_sel)) = (
        Selector::parse(r#"[class*="spec"] [class*="row"], [class*="specification"] li"#),
        Selector::parse(r#"[class*="label"], [class*="name"]"#),
        Selector::parse(r#"[class*="value"], [class*="data"]"#),
    ) {
        for row in document.select(&spec_sel) {
            let label = row
                .select(&label_sel)
                .next()
                .map(|l| l.text().collect::<Vec<_>>().join(" ").trim().to_string());
            let value = row
                .select(&value_sel)
                .next()
                .map(|v| v.text().collect::<Vec<_>>().join(" ").trim().to_string());
            if let (Some(label), Some(value)) = (label, value) {
                if !label.is_empty() && !value.is_empty() {
                    specs.entry(normalize_spec_key(&label)).or_insert(value);
                }
            }
        }
    }

    specs
}

/// Do we still need solver help for critical specs on an electronics goal?
pub fn needs_llm_specs(specs: &HashMap<String, String>, goal: &str) -> bool {
    let goal_lower = goal.to_lowercase();
    let electronics = ["laptop", "gpu", "nvidia", "desktop", "gaming", "graphics", "computer"]
        .iter()
        .any(|kw| goal_lower.contains(kw));
    electronics && (!specs.contains_key("gpu") || !specs.contains_key("cpu"))
}

fn main_content_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_sel = Selector::parse("body").ok();
    let text = body_sel
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|b| b.text().collect::<Vec<_>>().join(" "))
        })
        .unwrap_or_default();
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(6000)
        .collect()
}

/// Cart-anchored spatial analysis of OCR output.
///
/// Price = the dollar amount closest to an "Add to Cart"-like anchor, or the
/// most prominent one without an anchor. Title = the longest non-price,
/// non-button line above the price.
pub fn analyze_spatial_layout(items: &[OcrItem], min_price: f64) -> Option<PdpData> {
    if items.is_empty() {
        return None;
    }

    // Contact-for-pricing pages have no extractable price but are valid.
    let combined = items
        .iter()
        .map(|i| i.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if let Some(phrase) = CONTACT_PRICING_PHRASES
        .iter()
        .find(|p| combined.contains(**p))
    {
        let mut data = PdpData::new();
        data.price = None;
        data.stock_status = "contact_for_availability".to_string();
        data.title = find_title_above(items, i32::MAX);
        data.extraction_source = "vision".to_string();
        data.extraction_confidence = 0.7;
        tracing::info!(phrase, "contact-for-pricing page detected");
        return Some(data);
    }

    let cart = items.iter().find(|item| {
        let lower = item.text.to_lowercase();
        lower.contains("add to cart") || lower.contains("add to bag") || lower.contains("buy now")
    });

    let prices: Vec<(f64, &OcrItem)> = items
        .iter()
        .filter_map(|item| {
            let m = price_regex().find(&item.text)?;
            let price = parse_price(m.as_str())?;
            if price >= min_price {
                Some((price, item))
            } else {
                None
            }
        })
        .collect();
    if prices.is_empty() {
        return None;
    }

    let (price, price_item, confidence) = match cart {
        Some(cart_item) => {
            let (cx, cy) = cart_item.bbox.center();
            let closest = prices.iter().min_by_key(|(_, item)| {
                let (px, py) = item.bbox.center();
                i64::from(px - cx).pow(2) + i64::from(py - cy).pow(2)
            })?;
            (closest.0, closest.1, 0.85)
        }
        None => {
            // Prominence: big text near the top.
            let prominent = prices.iter().max_by_key(|(_, item)| {
                i64::from(item.bbox.height) * 1000 - i64::from(item.bbox.y)
            })?;
            (prominent.0, prominent.1, 0.70)
        }
    };

    let mut data = PdpData::new();
    data.price = Some(price);
    data.title = find_title_above(items, price_item.bbox.y);
    data.extraction_source = "vision".to_string();
    data.extraction_confidence = confidence;
    Some(data)
}

fn find_title_above(items: &[OcrItem], below_y: i32) -> Option<String> {
    items
        .iter()
        .filter(|item| item.bbox.y < below_y)
        .filter(|item| !price_regex().is_match(&item.text))
        .filter(|item| {
            let lower = item.text.to_lowercase();
            !lower.contains("add to cart")
                && !lower.contains("buy now")
                && !lower.contains("sign in")
        })
        .filter(|item| item.text.trim().len() >= 10)
        .max_by_key(|item| item.text.len())
        .map(|item| item.text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoundingBox;

    #[test]
    fn test_spec_key_normalization() {
        assert_eq!(normalize_spec_key("Graphics Card"), "gpu");
        assert_eq!(normalize_spec_key("Video Card"), "gpu");
        assert_eq!(normalize_spec_key("GPU"), "gpu");
        assert_eq!(normalize_spec_key("Processor Model"), "cpu");
        assert_eq!(normalize_spec_key("System Memory"), "ram");
        assert_eq!(normalize_spec_key("Solid State Drive"), "storage");
        assert_eq!(normalize_spec_key("Screen Size"), "display");
        assert_eq!(normalize_spec_key("Operating System"), "os");
        assert_eq!(normalize_spec_key("Color Family"), "color_family");
    }

    #[test]
    fn test_json_ld_product_extraction() {
        let html = r#"<html><head><script type="application/ld+json">
        {"@type": "Product", "name": "ACME XYZ",
         "offers": {"price": "129.99", "availability": "https://schema.org/InStock"},
         "aggregateRating": {"ratingValue": "4.6", "reviewCount": 128}}
        </script></head></html>"#;

        let data = parse_json_ld_product(html).unwrap();
        assert_eq!(data.price, Some(129.99));
        assert_eq!(data.title.as_deref(), Some("ACME XYZ"));
        assert!(data.in_stock);
        assert_eq!(data.stock_status, "in_stock");
        assert_eq!(data.rating, Some(4.6));
        assert_eq!(data.review_count, Some(128));
        assert_eq!(data.extraction_source, "json_ld");
        assert_eq!(data.extraction_confidence, 0.95);
    }

    #[test]
    fn test_json_ld_low_price_and_out_of_stock() {
        let html = r#"<script type="application/ld+json">
        {"@type": "Product", "name": "Range Thing",
         "offers": {"lowPrice": 899.0, "availability": "http://schema.org/OutOfStock"}}
        </script>"#;

        let data = parse_json_ld_product(html).unwrap();
        assert_eq!(data.price, Some(899.0));
        assert!(!data.in_stock);
        assert_eq!(data.stock_status, "out_of_stock");
    }

    #[test]
    fn test_json_ld_without_price_is_none() {
        let html = r#"<script type="application/ld+json">
        {"@type": "Product", "name": "No Offer Product"}
        </script>"#;
        assert!(parse_json_ld_product(html).is_none());
    }

    #[test]
    fn test_specs_from_html_table_and_dl() {
        let html = r#"<body>
            <table>
                <tr><td>Graphics Card</td><td>NVIDIA GeForce RTX 4060</td></tr>
                <tr><td>Processor</td><td>Intel Core i7-13620H</td></tr>
            </table>
            <dl>
                <dt>Memory</dt><dd>16GB DDR5</dd>
                <dt>Storage</dt><dd>512GB SSD</dd>
            </dl>
        </body>"#;

        let specs = specs_from_html(html);
        assert_eq!(specs.get("gpu").map(String::as_str), Some("NVIDIA GeForce RTX 4060"));
        assert_eq!(specs.get("cpu").map(String::as_str), Some("Intel Core i7-13620H"));
        assert_eq!(specs.get("ram").map(String::as_str), Some("16GB DDR5"));
        assert_eq!(specs.get("storage").map(String::as_str), Some("512GB SSD"));
    }

    #[test]
    fn test_specs_from_json_ld_additional_property() {
        let html = r#"<script type="application/ld+json">
        {"@type": "Product", "name": "X", "sku": "SKU123",
         "brand": {"@type": "Brand", "name": "Acer"},
         "additionalProperty": [
            {"name": "Graphics", "value": "RTX 4060"},
            {"name": "Installed RAM", "value": "16GB"}
         ]}
        </script>"#;

        let specs = specs_from_json_ld(html);
        assert_eq!(specs.get("gpu").map(String::as_str), Some("RTX 4060"));
        assert_eq!(specs.get("ram").map(String::as_str), Some("16GB"));
        assert_eq!(specs.get("brand").map(String::as_str), Some("Acer"));
        assert_eq!(specs.get("sku").map(String::as_str), Some("SKU123"));
    }

    #[test]
    fn test_needs_llm_specs_only_for_electronics_gaps() {
        let mut specs = HashMap::new();
        assert!(needs_llm_specs(&specs, "nvidia gaming laptop"));
        assert!(!needs_llm_specs(&specs, "dog food"));

        specs.insert("gpu".to_string(), "RTX 4060".to_string());
        specs.insert("cpu".to_string(), "i7".to_string());
        assert!(!needs_llm_specs(&specs, "nvidia gaming laptop"));
    }

    fn ocr(text: &str, x: i32, y: i32, w: i32, h: i32) -> OcrItem {
        OcrItem {
            text: text.to_string(),
            bbox: BoundingBox::new(x, y, w, h),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_spatial_price_anchored_to_cart() {
        let items = vec![
            ocr("Acer Nitro V 16 Gaming Laptop RTX 4060", 100, 80, 500, 30),
            ocr("$349.99", 700, 100, 80, 20),
            ocr("$1,099.99", 650, 380, 110, 30),
            ocr("Add to Cart", 650, 440, 140, 40),
        ];

        let data = analyze_spatial_layout(&items, 50.0).unwrap();
        assert_eq!(data.price, Some(1099.99));
        assert_eq!(data.extraction_source, "vision");
        assert_eq!(data.extraction_confidence, 0.85);
        assert_eq!(
            data.title.as_deref(),
            Some("Acer Nitro V 16 Gaming Laptop RTX 4060")
        );
    }

    #[test]
    fn test_spatial_min_price_floor() {
        let items = vec![
            ocr("Some Gaming Laptop Name Here", 100, 80, 500, 30),
            ocr("$12.99", 650, 380, 110, 30),
            ocr("Add to Cart", 650, 440, 140, 40),
        ];
        // Electronics floor rejects the badge price.
        assert!(analyze_spatial_layout(&items, 50.0).is_none());
        // Pet-store floor accepts it.
        assert!(analyze_spatial_layout(&items, 1.0).is_some());
    }

    #[test]
    fn test_spatial_contact_for_pricing() {
        let items = vec![
            ocr("Industrial Widget Press XL-9000", 100, 80, 500, 30),
            ocr("Contact for pricing", 650, 380, 200, 30),
        ];

        let data = analyze_spatial_layout(&items, 50.0).unwrap();
        assert_eq!(data.price, None);
        assert_eq!(data.stock_status, "contact_for_availability");
    }

    #[test]
    fn test_spatial_empty_items() {
        assert!(analyze_spatial_layout(&[], 1.0).is_none());
    }
}
