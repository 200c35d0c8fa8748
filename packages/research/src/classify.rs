//! Page classification: is a URL a product detail page or a listing?
//!
//! A URL-pattern quick check answers most cases; ambiguous pages fall back
//! to a body-content heuristic counting distinct prices and cart phrases.

use regex::Regex;
use std::sync::OnceLock;

use perception::filters;

/// Quick check from the URL alone. `None` means inconclusive.
pub fn is_pdp_by_url(url: &str) -> Option<bool> {
    let lower = url.to_lowercase();
    if filters::is_skip_url(&lower) {
        return Some(false);
    }
    if filters::matches_product_pattern(&lower) {
        return Some(true);
    }
    if lower.contains("?q=") || lower.contains("&q=") || lower.contains("/s?") {
        return Some(false);
    }
    None
}

/// Content heuristic: one price next to an add-to-cart control reads as a
/// PDP; a grid of distinct prices with filter chrome reads as a listing.
pub fn is_pdp_by_content(html: &str) -> bool {
    static PRICE: OnceLock<Regex> = OnceLock::new();
    let price = PRICE.get_or_init(|| Regex::new(r"\$[\d,]+\.?\d{0,2}").expect("valid price regex"));

    let lower = html.to_lowercase();
    let mut pdp_signals = 0i32;
    let mut listing_signals = 0i32;

    const CART_PATTERNS: &[&str] = &[
        "add to cart",
        "add-to-cart",
        "addtocart",
        "add to bag",
        "buy now",
        "add to basket",
    ];
    let cart_hits = CART_PATTERNS.iter().filter(|p| lower.contains(**p)).count();
    if cart_hits > 0 {
        pdp_signals += 2;
    }

    if lower.contains("filter") && (lower.contains("price") || lower.contains("brand")) {
        listing_signals += 1;
    }

    let mut unique_prices: std::collections::HashSet<&str> = std::collections::HashSet::new();
    for m in price.find_iter(&lower).take(100) {
        unique_prices.insert(m.as_str());
    }
    match unique_prices.len() {
        1 => pdp_signals += 2,
        n if n > 3 => listing_signals += 2,
        _ => {}
    }

    pdp_signals > listing_signals
}

/// Combined classification: URL first, body as a fallback.
pub fn is_pdp(url: &str, html: Option<&str>) -> bool {
    match is_pdp_by_url(url) {
        Some(verdict) => verdict,
        None => html.map(is_pdp_by_content).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_quick_check() {
        assert_eq!(is_pdp_by_url("https://www.amazon.com/dp/B0ABCDEF12"), Some(true));
        assert_eq!(
            is_pdp_by_url("https://www.bestbuy.com/product/acer-nitro"),
            Some(true)
        );
        assert_eq!(
            is_pdp_by_url("https://www.bestbuy.com/search?q=laptop"),
            Some(false)
        );
        assert_eq!(is_pdp_by_url("https://shop.example/deals-of-the-week"), None);
    }

    #[test]
    fn test_content_single_price_with_cart_is_pdp() {
        let html = r#"<body>
            <h1>Acer Nitro V 16</h1>
            <span class="price">$1,099.99</span>
            <button>Add to Cart</button>
        </body>"#;
        assert!(is_pdp_by_content(html));
    }

    #[test]
    fn test_content_price_grid_is_listing() {
        let mut html = String::from("<body><div>Filter by price and brand</div>");
        for i in 0..8 {
            html.push_str(&format!("<div class=\"card\">Laptop {i} <span>${i}99.99</span></div>"));
        }
        html.push_str("</body>");
        assert!(!is_pdp_by_content(&html));
    }

    #[test]
    fn test_combined_prefers_url_verdict() {
        // URL says listing even though content is ambiguous.
        assert!(!is_pdp("https://shop.example/search?q=x", Some("<body>$9.99 Add to cart</body>")));
        // Inconclusive URL defers to content.
        assert!(is_pdp(
            "https://shop.example/deals-of-the-week",
            Some("<body><span>$1,099.99</span><button>Add to Cart</button></body>")
        ));
    }
}
