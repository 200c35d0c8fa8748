//! End-to-end extraction scenarios over static inputs.

use perception::config::PerceptionConfig;
use perception::html::HtmlExtractor;
use perception::intelligence::{ExtractionSchema, SchemaStore};
use perception::models::normalize_url;
use perception::pdp::parse_json_ld_product;
use perception::rejection::RejectionTracker;
use perception::universal::parse_universal_results;

#[test]
fn commerce_pdp_with_json_ld_yields_verified_record() {
    let html = r#"<html><head>
        <script type="application/ld+json">
        {"@type": "Product", "name": "ACME XYZ",
         "offers": {"price": "129.99", "availability": "https://schema.org/InStock"}}
        </script>
    </head><body><h1>ACME XYZ</h1></body></html>"#;

    let data = parse_json_ld_product(html).expect("json-ld product");
    assert_eq!(data.price, Some(129.99));
    assert_eq!(data.title.as_deref(), Some("ACME XYZ"));
    assert!(data.in_stock);
    assert_eq!(data.stock_status, "in_stock");
    assert_eq!(data.extraction_source, "json_ld");
    assert_eq!(data.extraction_confidence, 0.95);
}

#[test]
fn listing_with_ten_cards_extracts_every_candidate() {
    let mut html = String::from("<body>");
    for i in 0..10 {
        html.push_str(&format!(
            r#"<div class="sku-item">
                <h4><a href="/product/gaming-laptop-{i}">Gaming Laptop Model {i}</a></h4>
                <span class="price">$49.99</span>
            </div>"#
        ));
    }
    // Ad and chrome links that must not survive extraction.
    html.push_str(
        r#"<a href="https://aax-us-east.amazon-adsystem.com/product/ad">Promoted Gaming Laptop</a>
           <a href="/product/nav-laptop">See All</a></body>"#,
    );

    let extractor = HtmlExtractor::new(PerceptionConfig::default());
    let candidates = extractor.extract(&html, "https://shop.example/s?q=laptop");

    assert_eq!(candidates.len(), 10);
    assert!(candidates.iter().all(|c| !c.url.contains("aax-us-east")));
    assert!(candidates.iter().all(|c| c.link_text.starts_with("Gaming Laptop")));
}

#[test]
fn universal_results_keep_price_anchored_candidates() {
    let value = serde_json::json!([
        {"url": "https://shop.example/product/laptop-a", "title": "Gaming Laptop Model A", "price": "$999.99"},
        {"url": "https://shop.example/product/laptop-b", "title": "Gaming Laptop Model B", "price": "$1,199.99"}
    ]);
    let candidates = parse_universal_results(&value, "https://shop.example/s?q=laptop");
    assert_eq!(candidates.len(), 2);
    for candidate in &candidates {
        assert_eq!(candidate.confidence, 0.85);
        assert!(candidate.context_text.starts_with('$'));
    }
}

#[test]
fn empty_and_whitespace_html_yield_zero_items() {
    let extractor = HtmlExtractor::new(PerceptionConfig::default());
    assert!(extractor.extract("", "https://shop.example").is_empty());
    assert!(extractor.extract("  \n\t ", "https://shop.example").is_empty());
}

#[test]
fn url_normalization_dedups_within_host_and_path_only() {
    let a = normalize_url("https://shop.example/p/x?utm=1");
    let b = normalize_url("https://shop.example/p/x#reviews");
    let c = normalize_url("https://other.example/p/x");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(normalize_url(&a), a);
}

#[test]
fn schema_store_survives_reload_and_tracks_decay() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = SchemaStore::new(dir.path());
        let mut schema = ExtractionSchema::new("shop.example", "product_listing");
        schema.price_selector = ".price".to_string();
        schema.record_success();
        store.append_schema(&schema).unwrap();

        schema.record_failure("selectors matched nothing");
        schema.record_failure("selectors matched nothing");
        store.append_schema(&schema).unwrap();
    }

    // A fresh store over the same directory sees the newest record.
    let store = SchemaStore::new(dir.path());
    let loaded = store
        .latest_schema("shop.example", "product_listing")
        .unwrap()
        .unwrap();
    assert_eq!(loaded.success_count, 1);
    assert_eq!(loaded.failure_count, 2);
    assert!(loaded.needs_recalibration());
}

#[test]
fn rejection_tracker_feeds_future_queries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rejection_patterns.json");
    let query = "rtx 4060 gaming laptop";

    {
        let tracker = RejectionTracker::new(&path);
        let reasons: Vec<String> = (0..5)
            .map(|_| "no dedicated NVIDIA GPU".to_string())
            .collect();
        tracker
            .record_rejections("bestbuy.com", query, &reasons, 8)
            .unwrap();
    }

    let tracker = RejectionTracker::new(&path);
    assert_eq!(
        tracker.get_query_refinements("bestbuy.com", query),
        vec!["nvidia rtx gpu".to_string()]
    );
    let pattern = tracker.pattern("bestbuy.com", query).unwrap();
    assert!(pattern.total_rejections <= pattern.total_extractions);
}
