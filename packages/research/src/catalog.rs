//! Vendor catalog exploration.
//!
//! Walks a vendor's catalog pages: detects pagination and category links,
//! extracts item listings page by page, and scrapes contact information.

use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

use perception::config::PerceptionConfig;
use perception::html::HtmlExtractor;
use perception::models::HtmlCandidate;

use crate::error::Result;
use crate::fetcher::ResilientFetcher;

/// Navigation structure detected on a catalog page.
#[derive(Debug, Clone, Default)]
pub struct CatalogStructure {
    pub pagination_links: Vec<String>,
    pub category_links: Vec<(String, String)>,
    pub item_links: Vec<String>,
    pub has_pagination: bool,
}

/// One explored catalog item.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogItem {
    pub title: String,
    pub url: String,
    pub price: Option<f64>,
    pub availability: String,
}

/// Result of a catalog exploration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogResult {
    pub vendor_name: String,
    pub items: Vec<CatalogItem>,
    pub pages_visited: usize,
    pub contact: ContactInfo,
}

/// Contact details scraped from the vendor's pages.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ContactInfo {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

/// Detect pagination, category and item links in a page.
pub fn detect_catalog_structure(html: &str, base_url: &str) -> CatalogStructure {
    let mut structure = CatalogStructure::default();
    let document = Html::parse_document(html);
    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return structure;
    };
    let base = Url::parse(base_url).ok();

    const CATEGORY_WORDS: &[&str] = &[
        "available", "retired", "upcoming", "sold", "shop", "catalog", "inventory",
    ];
    const ITEM_MARKERS: &[&str] = &["/item/", "/listing/", "/product/", "/detail/", "/p/"];

    for link in document.select(&anchor_sel) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let text = link
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_lowercase();

        let absolute = if href.starts_with("http") {
            href.to_string()
        } else {
            match base.as_ref().and_then(|b| b.join(href).ok()) {
                Some(joined) => joined.to_string(),
                None => continue,
            }
        };

        let is_page_number = !text.is_empty() && text.chars().all(|c| c.is_ascii_digit());
        if text.contains("next") || text.contains("more") || text.contains('→') || is_page_number {
            structure.pagination_links.push(absolute);
            structure.has_pagination = true;
        } else if CATEGORY_WORDS.iter().any(|w| text.contains(w)) {
            structure.category_links.push((text, absolute));
        } else if ITEM_MARKERS.iter().any(|m| absolute.contains(m)) {
            structure.item_links.push(absolute);
        }
    }
    structure
}

/// Pull emails and phone numbers out of page text.
pub fn scrape_contact_info(html: &str) -> ContactInfo {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    static PHONE: OnceLock<Regex> = OnceLock::new();
    let email = EMAIL.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
    });
    let phone = PHONE.get_or_init(|| {
        Regex::new(r"\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}").expect("valid phone regex")
    });

    let mut emails: Vec<String> = email
        .find_iter(html)
        .map(|m| m.as_str().to_lowercase())
        .filter(|e| !e.ends_with(".png") && !e.ends_with(".jpg") && !e.ends_with(".svg"))
        .collect();
    emails.sort();
    emails.dedup();

    let mut phones: Vec<String> = phone.find_iter(html).map(|m| m.as_str().to_string()).collect();
    phones.sort();
    phones.dedup();

    ContactInfo { emails, phones }
}

/// Explore a vendor catalog through the resilient fetcher, following
/// pagination until `max_items` items are collected.
pub async fn explore_catalog(
    fetcher: &ResilientFetcher,
    vendor_url: &str,
    vendor_name: &str,
    max_items: usize,
) -> Result<CatalogResult> {
    let extractor = HtmlExtractor::new(PerceptionConfig::default());
    let mut items: Vec<CatalogItem> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: Vec<String> = vec![vendor_url.to_string()];
    let mut contact = ContactInfo::default();
    let mut pages_visited = 0usize;

    // Pagination walks are bounded regardless of what the site links.
    const MAX_PAGES: usize = 10;

    while let Some(url) = queue.pop() {
        if items.len() >= max_items || pages_visited >= MAX_PAGES {
            break;
        }
        if !visited.insert(perception::models::normalize_url(&url)) {
            continue;
        }

        let fetched = fetcher.fetch(&url).await;
        if !fetched.success {
            tracing::warn!(url, "catalog page fetch failed");
            continue;
        }
        pages_visited += 1;

        let page_contact = scrape_contact_info(&fetched.html);
        contact.emails.extend(page_contact.emails);
        contact.phones.extend(page_contact.phones);

        let candidates = extractor.extract(&fetched.html, &fetched.final_url);
        for candidate in candidates {
            if items.len() >= max_items {
                break;
            }
            if items.iter().any(|i| i.url == candidate.url) {
                continue;
            }
            items.push(to_item(&candidate, &fetched.html));
        }

        let structure = detect_catalog_structure(&fetched.html, &fetched.final_url);
        for next in structure.pagination_links {
            if !visited.contains(&perception::models::normalize_url(&next)) {
                queue.push(next);
            }
        }
    }

    contact.emails.sort();
    contact.emails.dedup();
    contact.phones.sort();
    contact.phones.dedup();

    tracing::info!(
        vendor = vendor_name,
        items = items.len(),
        pages = pages_visited,
        "catalog exploration complete"
    );
    Ok(CatalogResult {
        vendor_name: vendor_name.to_string(),
        items,
        pages_visited,
        contact,
    })
}

fn to_item(candidate: &HtmlCandidate, _html: &str) -> CatalogItem {
    let availability = availability_from_text(&candidate.context_text);
    let price = perception::models::parse_price(&candidate.context_text);
    CatalogItem {
        title: candidate.link_text.clone(),
        url: candidate.url.clone(),
        price,
        availability,
    }
}

/// Availability status from surrounding listing text.
pub fn availability_from_text(text: &str) -> String {
    let lower = text.to_lowercase();
    if lower.contains("sold out") || lower.contains("sold") {
        "sold".to_string()
    } else if lower.contains("out of stock") || lower.contains("unavailable") {
        "out_of_stock".to_string()
    } else if lower.contains("upcoming") || lower.contains("coming soon") {
        "upcoming".to_string()
    } else if lower.contains("retired") {
        "retired".to_string()
    } else {
        "available".to_string()
    }
}
