//! Universal price-anchored DOM extraction.
//!
//! Instead of finding product cards and extracting from them, find prices
//! first and walk UP the DOM to the enclosing card. Works on any site
//! without calibration: prices are universal, and the card around a price
//! always carries the title and link too.

use serde_json::Value;

use crate::filters;
use crate::models::{CandidateSource, HtmlCandidate};
use browser::DrivenPage;

/// The in-page walking routine. Returns `[{url, title, price, source}]`.
const UNIVERSAL_EXTRACTION_JS: &str = r#"(() => {
    const results = [];
    const seen = new Set();
    const pricePattern = /\$[\d,]+\.?\d{0,2}/;

    const walker = document.createTreeWalker(
        document.body,
        NodeFilter.SHOW_TEXT,
        {
            acceptNode: function(node) {
                const text = node.textContent.trim();
                if (pricePattern.test(text) && text.length < 20) {
                    return NodeFilter.FILTER_ACCEPT;
                }
                return NodeFilter.FILTER_SKIP;
            }
        }
    );

    const priceNodes = [];
    while (walker.nextNode()) {
        priceNodes.push(walker.currentNode);
    }

    for (const priceNode of priceNodes) {
        let element = priceNode.parentElement;
        let card = null;
        let attempts = 0;

        while (element && attempts < 10) {
            const links = element.querySelectorAll('a[href]');
            const hasProductLink = Array.from(links).some(a => {
                const href = a.href || '';
                return href.includes('/product') || href.includes('/p/') ||
                       href.includes('/dp/') || href.includes('/ip/') ||
                       href.includes('/item') || href.includes('/pd/') ||
                       (href.startsWith('http') && !href.includes('/search') &&
                        !href.includes('/category') && !href.includes('javascript:'));
            });
            const hasTitle = element.querySelector('h1, h2, h3, h4, [class*="title"], [class*="name"], [class*="product"]');

            if (hasProductLink && hasTitle) {
                card = element;
                break;
            }
            element = element.parentElement;
            attempts++;
        }

        if (!card) continue;

        const priceText = priceNode.textContent.trim();
        const priceMatch = priceText.match(/\$[\d,]+\.?\d{0,2}/);
        const price = priceMatch ? priceMatch[0] : '';

        let productUrl = '';
        let title = '';
        const cardLinks = card.querySelectorAll('a[href]');

        for (const link of cardLinks) {
            const href = link.href || '';
            if (!href || href.includes('javascript:') || href === '#') continue;

            const isProductUrl = href.includes('/product') || href.includes('/p/') ||
                                 href.includes('/dp/') || href.includes('/ip/') ||
                                 href.includes('/item') || href.includes('/pd/') ||
                                 href.includes('/shop/');

            if (isProductUrl || !productUrl) {
                productUrl = href;
                title = link.textContent?.trim() || '';
                if (title.length < 10) {
                    const heading = card.querySelector('h1, h2, h3, h4, [class*="title"], [class*="name"]');
                    if (heading) title = heading.textContent?.trim() || '';
                }
                if (isProductUrl) break;
            }
        }

        if (!productUrl || seen.has(productUrl)) continue;
        if (productUrl.includes('/search') || productUrl.includes('/category')) continue;

        const titleLower = title.toLowerCase();
        const navWords = ['your list', 'quick view', 'leave feedback',
                          'any category', 'sign in', 'my cart', 'wishlist', 'compare',
                          'filter by', 'sort by', 'refine by', 'see all deals', 'view all',
                          'ad feedback', 'shop all', 'browse all'];
        if (title.length < 12 || navWords.some(w => titleLower.includes(w))) continue;

        const urlLower = productUrl.toLowerCase();
        const isProductPage = urlLower.includes('/dp/') || urlLower.includes('/product') ||
                              urlLower.includes('/p/') || urlLower.includes('/ip/') ||
                              urlLower.includes('/item') || urlLower.includes('/pd/') ||
                              urlLower.includes('/gp/product') || urlLower.includes('ref=') ||
                              urlLower.includes('/n82e');
        if (!isProductPage) continue;

        seen.add(productUrl);
        results.push({
            url: productUrl,
            title: title.substring(0, 200),
            price: price,
            source: 'universal_js'
        });

        if (results.length >= 20) break;
    }

    if (results.length < 3) {
        const cardSelectors = [
            '[data-testid*="product"]',
            '[data-component*="product"]',
            '[class*="product-card"]',
            '[class*="product-item"]',
            '[class*="sku-item"]',
            'article[class*="product"]',
            'li[class*="product"]'
        ];

        for (const selector of cardSelectors) {
            const cards = document.querySelectorAll(selector);
            if (cards.length < 3) continue;

            for (const card of cards) {
                const link = card.querySelector('a[href]');
                const priceEl = card.querySelector('[class*="price"]');
                const titleEl = card.querySelector('h1, h2, h3, h4, [class*="title"], [class*="name"]');

                if (!link) continue;
                const href = link.href || '';
                if (!href || seen.has(href)) continue;
                if (href.includes('/search') || href.includes('/category')) continue;

                const title = (titleEl?.textContent || link.textContent || '').trim();
                const titleLower = title.toLowerCase();
                const navWords = ['your list', 'quick view', 'leave feedback',
                                  'any category', 'sign in', 'my cart', 'wishlist', 'compare'];
                if (title.length < 12 || navWords.some(w => titleLower.includes(w))) continue;

                seen.add(href);
                results.push({
                    url: href,
                    title: title.substring(0, 200),
                    price: priceEl?.textContent?.match(/\$[\d,]+\.?\d{0,2}/)?.[0] || '',
                    source: 'universal_js'
                });

                if (results.length >= 20) break;
            }
            if (results.length >= 3) break;
        }
    }

    return results;
})()"#;

/// Run the price-anchored walk on a live page.
pub async fn extract_universal(
    page: &DrivenPage,
    base_url: &str,
) -> crate::error::Result<Vec<HtmlCandidate>> {
    let value = page.evaluate(UNIVERSAL_EXTRACTION_JS).await?;
    let candidates = parse_universal_results(&value, base_url);
    tracing::info!(count = candidates.len(), "universal js extraction complete");
    Ok(candidates)
}

/// Convert the in-page routine's JSON into candidates, re-applying the
/// shared garbage filters on the Rust side.
pub fn parse_universal_results(value: &Value, base_url: &str) -> Vec<HtmlCandidate> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    let mut candidates = Vec::new();
    for item in items {
        let Some(href) = item.get("url").and_then(Value::as_str) else {
            continue;
        };
        if href.is_empty() {
            continue;
        }

        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            match url::Url::parse(base_url).ok().and_then(|b| b.join(href).ok()) {
                Some(joined) => joined.to_string(),
                None => continue,
            }
        };

        if filters::is_sponsored_url(&url) || filters::is_skip_url(&url) {
            continue;
        }

        let title = item.get("title").and_then(Value::as_str).unwrap_or("");
        if filters::is_garbage_link_text(title) {
            continue;
        }
        let price = item.get("price").and_then(Value::as_str).unwrap_or("");

        candidates.push(HtmlCandidate {
            url,
            link_text: title.chars().take(200).collect(),
            context_text: price.chars().take(50).collect(),
            source: CandidateSource::UniversalJs,
            confidence: 0.85,
        });
    }
    candidates
}
