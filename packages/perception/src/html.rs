//! HTML-based product URL extraction.
//!
//! Strategies in order of reliability:
//! 1. JSON-LD structured data
//! 2. URL pattern matching
//! 3. DOM heuristics (links near prices)

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use url::Url;

use crate::config::PerceptionConfig;
use crate::filters;
use crate::models::{normalize_url, CandidateSource, HtmlCandidate};

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$[\d,]+\.?\d*").expect("valid price regex"))
}

/// Extract product URL candidates from raw HTML.
pub struct HtmlExtractor {
    config: PerceptionConfig,
}

impl HtmlExtractor {
    pub fn new(config: PerceptionConfig) -> Self {
        Self { config }
    }

    /// Run all enabled strategies, deduplicate, and drop sponsored URLs.
    pub fn extract(&self, html: &str, base_url: &str) -> Vec<HtmlCandidate> {
        if html.trim().is_empty() {
            return Vec::new();
        }
        let document = Html::parse_document(html);
        let mut candidates = Vec::new();

        if self.config.enable_json_ld {
            let found = extract_json_ld(&document, base_url);
            tracing::debug!(count = found.len(), "json-ld candidates");
            candidates.extend(found);
        }

        if self.config.enable_url_patterns {
            let found = extract_url_patterns(&document, base_url);
            tracing::debug!(count = found.len(), "url-pattern candidates");
            candidates.extend(found);
        }

        // Heuristics only when the cheap strategies came up short.
        if self.config.enable_dom_heuristics && candidates.len() < 5 {
            let found = extract_heuristics(&document, base_url);
            tracing::debug!(count = found.len(), "dom-heuristic candidates");
            candidates.extend(found);
        }

        let unique = deduplicate(candidates);
        let before = unique.len();
        let filtered: Vec<HtmlCandidate> = unique
            .into_iter()
            .filter(|c| !filters::is_sponsored_url(&c.url))
            .collect();

        if filtered.len() < before {
            tracing::info!(dropped = before - filtered.len(), "filtered sponsored urls");
        }
        tracing::info!(
            count = filtered.len(),
            base_url,
            "html extraction complete"
        );
        filtered
    }
}

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("valid css selector")
}

fn resolve(base_url: &str, href: &str) -> Option<String> {
    let base = Url::parse(base_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

/// Strategy 1: schema.org Product objects in `application/ld+json` blocks.
fn extract_json_ld(document: &Html, base_url: &str) -> Vec<HtmlCandidate> {
    let script_sel = selector(r#"script[type="application/ld+json"]"#);
    let mut candidates = Vec::new();

    for script in document.select(&script_sel) {
        let body: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&body) else {
            continue;
        };
        let mut products = Vec::new();
        find_products_in_json_ld(&data, &mut products);

        for product in products {
            let url = product
                .get("url")
                .and_then(Value::as_str)
                .or_else(|| product.pointer("/offers/url").and_then(Value::as_str));
            let Some(url) = url else { continue };
            let Some(absolute) = resolve(base_url, url) else {
                continue;
            };

            let name = product.get("name").and_then(Value::as_str).unwrap_or("");
            let description = product
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");

            candidates.push(HtmlCandidate {
                url: absolute,
                link_text: name.to_string(),
                context_text: description.chars().take(200).collect(),
                source: CandidateSource::JsonLd,
                confidence: 0.95,
            });
        }
    }
    candidates
}

/// Recursively collect Product-family objects, following `@graph`, arrays
/// and nested values.
pub fn find_products_in_json_ld<'a>(data: &'a Value, out: &mut Vec<&'a Value>) {
    match data {
        Value::Object(map) => {
            let item_type = match map.get("@type") {
                Some(Value::String(s)) => s.as_str(),
                Some(Value::Array(items)) => items.first().and_then(Value::as_str).unwrap_or(""),
                _ => "",
            };
            if matches!(item_type, "Product" | "IndividualProduct" | "ProductModel") {
                out.push(data);
            }
            for value in map.values() {
                if value.is_object() || value.is_array() {
                    find_products_in_json_ld(value, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                find_products_in_json_ld(item, out);
            }
        }
        _ => {}
    }
}

/// Strategy 2: anchors whose href matches a known product URL shape.
fn extract_url_patterns(document: &Html, base_url: &str) -> Vec<HtmlCandidate> {
    let anchor_sel = selector("a[href]");
    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for link in document.select(&anchor_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        if href.is_empty() || href.starts_with("javascript:") || href == "#" {
            continue;
        }
        if !filters::matches_product_pattern(href) || filters::is_skip_url(href) {
            continue;
        }
        let Some(full_url) = resolve(base_url, href) else {
            continue;
        };
        if !seen.insert(full_url.clone()) {
            continue;
        }

        let mut link_text = element_text(&link);
        // Icon or image anchors carry their text on an ancestor.
        if link_text.len() < 5 {
            link_text = ancestor_text(&link).unwrap_or(link_text);
        }
        if link_text.len() < 3 || filters::is_garbage_link_text(&link_text) {
            continue;
        }

        candidates.push(HtmlCandidate {
            url: full_url,
            link_text: link_text.chars().take(200).collect(),
            context_text: String::new(),
            source: CandidateSource::UrlPattern,
            confidence: 0.85,
        });
    }
    candidates
}

/// Strategy 3: links inside small containers that also show a price.
fn extract_heuristics(document: &Html, base_url: &str) -> Vec<HtmlCandidate> {
    let container_sel = selector("div, li, article, section");
    let anchor_sel = selector("a[href]");
    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for container in document.select(&container_sel) {
        let text = element_text(&container);
        if !price_regex().is_match(&text) {
            continue;
        }
        // Large blocks are page sections, not product cards.
        if text.len() > 2000 {
            continue;
        }

        for link in container.select(&anchor_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            if href.is_empty() || filters::is_skip_url(href) {
                continue;
            }
            let Some(full_url) = resolve(base_url, href) else {
                continue;
            };
            if !seen.insert(full_url.clone()) {
                continue;
            }

            let link_text = element_text(&link);
            if link_text.len() < 3 || filters::is_garbage_link_text(&link_text) {
                continue;
            }

            candidates.push(HtmlCandidate {
                url: full_url,
                link_text: link_text.chars().take(200).collect(),
                context_text: text.chars().take(300).collect(),
                source: CandidateSource::DomHeuristic,
                confidence: 0.7,
            });
        }
    }
    candidates
}

/// Keep the highest-confidence candidate per normalized URL.
pub fn deduplicate(candidates: Vec<HtmlCandidate>) -> Vec<HtmlCandidate> {
    let mut by_url: HashMap<String, HtmlCandidate> = HashMap::new();
    for candidate in candidates {
        let key = normalize_url(&candidate.url);
        match by_url.get(&key) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                by_url.insert(key, candidate);
            }
        }
    }
    by_url.into_values().collect()
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn ancestor_text(link: &ElementRef<'_>) -> Option<String> {
    for ancestor in link.ancestors().take(4) {
        if let Some(element) = ElementRef::wrap(ancestor) {
            if matches!(element.value().name(), "h2" | "h3" | "h4" | "div" | "span") {
                let text = element_text(&element);
                if text.len() >= 5 {
                    return Some(text.chars().take(150).collect());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HtmlExtractor {
        HtmlExtractor::new(PerceptionConfig::default())
    }

    #[test]
    fn test_empty_html_yields_nothing() {
        assert!(extractor().extract("", "https://shop.example").is_empty());
        assert!(extractor().extract("   \n  ", "https://shop.example").is_empty());
    }

    #[test]
    fn test_json_ld_product() {
        let html = r#"<html><head><script type="application/ld+json">
        {"@type": "Product", "name": "ACME XYZ", "url": "/product/acme-xyz",
         "description": "A very good widget", "offers": {"price": "129.99"}}
        </script></head><body></body></html>"#;

        let candidates = extractor().extract(html, "https://store.example");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://store.example/product/acme-xyz");
        assert_eq!(candidates[0].link_text, "ACME XYZ");
        assert_eq!(candidates[0].source, CandidateSource::JsonLd);
        assert_eq!(candidates[0].confidence, 0.95);
    }

    #[test]
    fn test_json_ld_graph_nesting() {
        let html = r#"<script type="application/ld+json">
        {"@graph": [{"@type": "WebPage"}, {"@type": "Product", "name": "Nested", "url": "/p/nested"}]}
        </script>"#;

        let candidates = extractor().extract(html, "https://store.example");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://store.example/p/nested");
    }

    #[test]
    fn test_url_pattern_extraction_skips_garbage_text() {
        let html = r#"<body>
            <a href="/product/gaming-laptop-rtx">Acer Nitro V Gaming Laptop</a>
            <a href="/product/another-laptop">Add to Cart</a>
            <a href="/search?q=laptop">laptop search</a>
        </body>"#;

        let candidates = extractor().extract(html, "https://shop.example");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].link_text, "Acer Nitro V Gaming Laptop");
        assert_eq!(candidates[0].source, CandidateSource::UrlPattern);
    }

    #[test]
    fn test_heuristic_needs_price_in_container() {
        let html = r#"<body>
            <div><a href="/deal/widget-pro-x">Widget Pro X</a> <span>$49.99</span></div>
            <div><a href="/deal/widget-no-price">Widget Without Price</a></div>
        </body>"#;

        let candidates = extractor().extract(html, "https://shop.example");
        let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert!(urls.contains(&"https://shop.example/deal/widget-pro-x"));
        assert!(!urls.contains(&"https://shop.example/deal/widget-no-price"));
    }

    #[test]
    fn test_sponsored_urls_filtered() {
        let html = r#"<body>
            <a href="https://aax-us-east.amazon-adsystem.com/product/promoted-thing">Promoted Gaming Laptop</a>
            <a href="/product/real-thing">Real Gaming Laptop</a>
        </body>"#;

        let candidates = extractor().extract(html, "https://www.amazon.com");
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].url.contains("real-thing"));
    }

    #[test]
    fn test_dedup_keeps_highest_confidence() {
        let candidates = vec![
            HtmlCandidate {
                url: "https://shop.example/p/x?a=1".to_string(),
                link_text: "X".to_string(),
                context_text: String::new(),
                source: CandidateSource::DomHeuristic,
                confidence: 0.7,
            },
            HtmlCandidate {
                url: "https://shop.example/p/x?b=2".to_string(),
                link_text: "X full".to_string(),
                context_text: String::new(),
                source: CandidateSource::JsonLd,
                confidence: 0.95,
            },
        ];

        let unique = deduplicate(candidates);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].confidence, 0.95);
    }

    #[test]
    fn test_ten_card_listing_extracts_all() {
        let mut html = String::from("<body>");
        for i in 0..10 {
            html.push_str(&format!(
                r#"<div class="card"><a href="/product/laptop-{i}">Gaming Laptop Model {i}</a><span>$49.99</span></div>"#
            ));
        }
        html.push_str("</body>");

        let candidates = extractor().extract(&html, "https://shop.example");
        assert_eq!(candidates.len(), 10);
    }
}
