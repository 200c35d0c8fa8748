//! Shared URL and link-text filters for the extraction family.
//!
//! Every extractor applies the same noise filters: sponsored/ad URLs, UI
//! link text, and non-product URL shapes.

use regex::RegexSet;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Known product URL path shapes across major retailers.
const PRODUCT_URL_PATTERNS: &[&str] = &[
    r"/dp/[A-Z0-9]{10}",
    r"/gp/product/[A-Z0-9]+",
    r"/product/[\w-]+",
    r"/p/[\w-]+",
    r"/item/[\w-]+",
    r"/site/[^/]+/\d+\.p",
    r"/ip/\d+",
    r"/products/[\w-]+",
    r"/pd/[\w-]+",
];

/// URL shapes that are never product pages.
const SKIP_URL_PATTERNS: &[&str] = &[
    r"/search",
    r"/category",
    r"/filter",
    r"/sort",
    r"/help",
    r"/account",
    r"/cart",
    r"/wishlist",
    r"/signin",
    r"/reviews",
    r"#",
    r"javascript:",
];

/// Sponsored/ad URL markers.
const SPONSORED_URL_PATTERNS: &[&str] = &[
    r"/sponsored/",
    r"/sspa/",
    r"/slredirect/",
    r"/gp/r\.html",
    r"aax-us-east",
    r"aax-us-iad",
    r"/adclick",
    r"/clicktracker",
    r"/advertisement/",
    r"doubleclick\.net",
    r"googlesyndication",
    r"/beacon/",
    r"/pixel/",
];

/// Link text that belongs to UI chrome, never to a product.
const GARBAGE_LINK_TEXT: &[&str] = &[
    // Buttons
    "quick view", "add to cart", "add to bag", "buy now", "shop now",
    "view details", "see details", "learn more", "read more",
    "next", "previous", "prev", "back", "forward",
    "compare", "save", "share", "wishlist", "notify me",
    "sold out", "out of stock", "in stock", "available",
    "free shipping", "fast delivery", "best seller", "new arrival",
    "see more", "show more", "load more", "view all", "see all",
    "sign in", "sign up", "login", "register", "subscribe",
    "close", "dismiss", "skip", "cancel", "ok", "yes", "no",
    // Navigation
    "home", "menu", "search", "account", "cart", "checkout",
    "order status", "saved items", "recently viewed",
    "help", "support", "contact us", "customer service",
    "all departments", "all categories", "browse all",
    "stores", "locations", "store locator",
    "department", "departments", "shop by category",
    "shop all", "shop by brand", "brands",
    "see options", "featured", "trending", "top deals",
    "gift ideas", "gift cards", "deal of the day",
    // Retailer names used as navigation links
    "best buy", "amazon", "amazon.com", "newegg", "newegg.com",
    "walmart", "walmart.com", "target", "target.com",
    // Category/breadcrumb names
    "computers", "computers & tablets", "tablets",
    "electronics", "gaming", "gaming laptops",
    "laptops", "laptop computers", "notebooks",
    "desktops", "desktop computers",
    "phones", "cell phones", "smartphones",
    "tv", "tvs", "televisions",
    "appliances", "home appliances",
    "video games", "pc gaming",
    "audio", "headphones", "speakers",
    "cameras", "camera", "drones",
    "smart home", "wearables",
];

fn product_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(PRODUCT_URL_PATTERNS).expect("product url patterns are valid")
    })
}

fn skip_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| RegexSet::new(SKIP_URL_PATTERNS).expect("skip url patterns are valid"))
}

fn sponsored_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(SPONSORED_URL_PATTERNS).expect("sponsored url patterns are valid")
    })
}

fn garbage_text_set() -> &'static HashSet<&'static str> {
    static SET: OnceLock<HashSet<&'static str>> = OnceLock::new();
    SET.get_or_init(|| GARBAGE_LINK_TEXT.iter().copied().collect())
}

/// Does the URL match a known product path shape?
pub fn matches_product_pattern(url: &str) -> bool {
    product_set().is_match(url)
}

/// Is this a search/category/etc URL that can never be a product?
pub fn is_skip_url(url: &str) -> bool {
    skip_set().is_match(url)
}

/// Is this a sponsored or ad-network URL?
pub fn is_sponsored_url(url: &str) -> bool {
    sponsored_set().is_match(url)
}

/// Is this link text a UI element rather than a product title?
pub fn is_garbage_link_text(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    garbage_text_set().contains(normalized.as_str())
}

/// Gate applied after navigation: does the arrived URL look like a real
/// product detail page?
pub fn is_valid_product_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }
    let url_lower = url.to_lowercase();
    let Ok(parsed) = url::Url::parse(&url_lower) else {
        return false;
    };
    let path = parsed.path().trim_end_matches('/');
    let host = parsed.host_str().unwrap_or_default();

    // Homepage-ish paths
    if matches!(path, "" | "/" | "/home" | "/index" | "/search" | "/category" | "/browse") {
        return false;
    }

    // Navigation refs
    if url_lower.contains("ref=nav_") || url_lower.contains("ref=logo") {
        return false;
    }

    // Ad-server hosts redirect to promoted products
    if host.contains("aax-us-east") || host.starts_with("aax-") {
        return false;
    }

    // Filter/search/category URLs
    const REJECT_SUBSTRINGS: &[&str] = &[
        "searchpage.jsp",
        "_facet",
        "modelfamily_facet",
        "/browse/",
        "/category/",
        "qp=",
    ];
    if REJECT_SUBSTRINGS.iter().any(|s| url_lower.contains(s)) {
        return false;
    }

    // Landing on one of these means we were blocked, not navigated
    const BLOCK_PATHS: &[&str] = &[
        "/splashui/captcha",
        "/blocked",
        "/captcha",
        "/challenge",
        "/verify",
        "/sorry/",
        "blocked?url=",
    ];
    if BLOCK_PATHS.iter().any(|p| url_lower.contains(p)) {
        return false;
    }

    const PRODUCT_PATHS: &[&str] = &["/dp/", "/product/", "/p/", "/ip/", "/pd/", "/sku/", "/item/"];
    if PRODUCT_PATHS.iter().any(|p| path.contains(p)) {
        return true;
    }

    // PHP-style product URLs on smaller retailers
    const PHP_MARKERS: &[&str] = &["product_info", "products_id=", "product_id=", "pid=", "item_id="];
    if PHP_MARKERS.iter().any(|m| url_lower.contains(m)) {
        return true;
    }

    // A long slug is usually a product page
    path.len() > 15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_pattern_shapes() {
        assert!(matches_product_pattern("https://www.amazon.com/dp/B0ABCDEF12"));
        assert!(matches_product_pattern("https://shop.example/product/gaming-laptop"));
        assert!(matches_product_pattern("https://www.walmart.com/ip/12345"));
        assert!(matches_product_pattern("https://store.example/products/widget"));
        assert!(!matches_product_pattern("https://shop.example/about-us"));
    }

    #[test]
    fn test_sponsored_urls_rejected() {
        assert!(is_sponsored_url("https://aax-us-east.amazon-adsystem.com/x/c/x"));
        assert!(is_sponsored_url("https://www.amazon.com/sspa/click?x=1"));
        assert!(is_sponsored_url("https://ad.doubleclick.net/ddm/clk"));
        assert!(!is_sponsored_url("https://www.amazon.com/dp/B0ABCDEF12"));
    }

    #[test]
    fn test_garbage_link_text() {
        assert!(is_garbage_link_text("Add to Cart"));
        assert!(is_garbage_link_text("  see all  "));
        assert!(is_garbage_link_text("Best Buy"));
        assert!(is_garbage_link_text("gaming laptops"));
        assert!(!is_garbage_link_text("Acer Nitro V 16 Gaming Laptop"));
    }

    #[test]
    fn test_valid_product_url_accepts_product_shapes() {
        assert!(is_valid_product_url("https://www.bestbuy.com/product/acer-nitro-v"));
        assert!(is_valid_product_url("https://www.amazon.com/dp/B0ABCDEF12"));
        assert!(is_valid_product_url(
            "https://tiny.example/index.php?main_page=product_info&products_id=9"
        ));
        // Long slug fallback
        assert!(is_valid_product_url(
            "https://shop.example/acer-nitro-v-16-gaming-laptop-rtx-4060"
        ));
    }

    #[test]
    fn test_valid_product_url_rejects_noise() {
        assert!(!is_valid_product_url("https://www.bestbuy.com/"));
        assert!(!is_valid_product_url("https://www.amazon.com/ref=nav_logo"));
        assert!(!is_valid_product_url("https://aax-us-east.amazon-adsystem.com/pdp/123"));
        assert!(!is_valid_product_url("https://www.ebay.com/splashui/captcha?x=1"));
        assert!(!is_valid_product_url(
            "https://www.bestbuy.com/site/searchpage.jsp?st=laptop"
        ));
        assert!(!is_valid_product_url("https://www.walmart.com/blocked?url=abc"));
        assert!(!is_valid_product_url("https://shop.example/browse"));
    }
}
