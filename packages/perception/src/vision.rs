//! Vision-based product extraction from full-page screenshots.
//!
//! OCR identifies text spans, spatial grouping turns them into card
//! candidates, and the solver structures each group into products.

use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use solver_client::{ChatMessage, Solver};

use crate::config::PerceptionConfig;
use crate::error::Result;
use crate::models::{parse_price, BoundingBox, OcrItem, VisualProduct};
use crate::ocr::OcrEngine;

fn price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\s*[\d,]+(?:\.\d{2})?").expect("valid price regex"))
}

fn alt_price_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\d,]+\.\d{2}").expect("valid alt price regex"))
}

/// Phrases retailers show on empty result pages.
const NO_RESULTS_PHRASES: &[&str] = &[
    "we found 0 items",
    "found 0 items",
    "0 items found",
    "0 results found",
    "0 results for",
    "0 products found",
    "no items found",
    "no results found",
    "no products found",
    "no matching products",
    "no items match",
    "no matches found",
    "sorry, no results",
    "sorry, we couldn't find",
    "we couldn't find any",
    "we could not find",
    "did not match any products",
    "didn't match any products",
    "does not match any",
    "nothing matched your search",
    "your search did not match",
    "try a different search",
    "try searching for something else",
    "no items available",
    "we have found 0 items that match",
];

/// Title substrings marking sponsored or non-product rows.
const SPONSORED_TITLE_MARKERS: &[&str] = &[
    "sponsored",
    "advertisement",
    "[ad]",
    "(ad)",
    "promoted",
    "featured partner",
    "partner product",
    "adchoices",
    "why this ad",
    "free shipping",
    "best seller",
    "top rated",
    "trending now",
    "people also bought",
    "customers also viewed",
    "similar items",
    "you may also like",
];

/// Extracts structured products from a screenshot.
pub struct VisionExtractor {
    solver: Arc<dyn Solver>,
    ocr: Arc<dyn OcrEngine>,
    config: PerceptionConfig,
}

impl VisionExtractor {
    pub fn new(solver: Arc<dyn Solver>, ocr: Arc<dyn OcrEngine>, config: PerceptionConfig) -> Self {
        Self {
            solver,
            ocr,
            config,
        }
    }

    /// Full pipeline: OCR, guard, group, structure, filter.
    pub async fn extract(&self, screenshot_path: &Path, query: &str) -> Result<Vec<VisualProduct>> {
        let spans = self.ocr.recognize(screenshot_path).await?;
        let items: Vec<OcrItem> = spans
            .into_iter()
            .filter(|span| span.confidence >= self.config.ocr_confidence_min)
            .map(|span| span.into_item())
            .collect();

        tracing::info!(count = items.len(), "ocr items after confidence filter");
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(phrase) = detect_no_results(&items) {
            tracing::warn!(phrase, "no-results page detected, skipping vision extraction");
            return Ok(Vec::new());
        }

        let groups = group_items(items, &self.config);
        tracing::info!(count = groups.len(), "spatial groups formed");
        if groups.is_empty() {
            return Ok(Vec::new());
        }

        let raw = self.structure_groups(&groups, query).await?;
        let products = build_products(raw, &groups);
        let filtered = filter_sponsored_titles(products);
        tracing::info!(count = filtered.len(), "vision products after filters");
        Ok(filtered)
    }

    /// One solver call structures all groups at once.
    async fn structure_groups(
        &self,
        groups: &[Vec<OcrItem>],
        query: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let groups_text = format_groups(groups, self.config.max_ocr_groups);
        let base = crate::prompts::load("ocr_items", crate::prompts::OCR_ITEMS_FALLBACK);
        let prompt = format!(
            "{base}\n\n\
             User's search query: \"{query}\"\n\n\
             OCR text groups:\n{groups_text}\n\n\
             Return ONLY the JSON array."
        );

        let content = self
            .solver
            .complete_with_temperature(&[ChatMessage::user(prompt)], 0.1)
            .await?;
        Ok(crate::jsonx::extract_json_array(&content))
    }
}

/// Scan combined OCR text for empty-results phrases.
pub fn detect_no_results(items: &[OcrItem]) -> Option<&'static str> {
    let all_text = items
        .iter()
        .map(|i| i.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    NO_RESULTS_PHRASES
        .iter()
        .find(|phrase| all_text.contains(**phrase))
        .copied()
}

/// Group OCR items top-to-bottom: a vertical gap of `y_group_threshold` or
/// more starts a new group. Group count is capped.
pub fn group_items(mut items: Vec<OcrItem>, config: &PerceptionConfig) -> Vec<Vec<OcrItem>> {
    items.sort_by_key(|item| item.bbox.y);

    let mut groups: Vec<Vec<OcrItem>> = Vec::new();
    let mut current: Vec<OcrItem> = Vec::new();
    let mut current_y = 0f64;

    for item in items {
        if current.is_empty() {
            current_y = f64::from(item.bbox.y);
            current.push(item);
            continue;
        }

        let gap = f64::from(item.bbox.y) - current_y;
        if gap < f64::from(config.y_group_threshold) {
            current.push(item);
            // Track the running average so tall cards stay together.
            current_y =
                current.iter().map(|i| f64::from(i.bbox.y)).sum::<f64>() / current.len() as f64;
        } else {
            groups.push(std::mem::take(&mut current));
            current_y = f64::from(item.bbox.y);
            current.push(item);
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let filtered: Vec<Vec<OcrItem>> = groups
        .into_iter()
        .filter(|group| {
            if !config.require_price_pattern {
                return true;
            }
            let text: String = group
                .iter()
                .map(|i| i.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            price_regex().is_match(&text) || alt_price_regex().is_match(&text)
        })
        .take(config.max_ocr_groups)
        .collect();
    filtered
}

fn format_groups(groups: &[Vec<OcrItem>], max_groups: usize) -> String {
    let mut parts = Vec::new();
    for (i, group) in groups.iter().take(max_groups).enumerate() {
        parts.push(format!("\n--- Group {} ---", i + 1));
        for item in group {
            parts.push(item.text.clone());
        }
    }
    parts.join("\n")
}

/// Turn solver output into products, anchoring each to the OCR item that
/// holds its price.
fn build_products(raw: Vec<serde_json::Value>, groups: &[Vec<OcrItem>]) -> Vec<VisualProduct> {
    let mut products = Vec::new();
    let mut used_groups = std::collections::HashSet::new();

    for (i, entry) in raw.into_iter().enumerate() {
        let title = entry
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if title.len() < 3 {
            continue;
        }
        let price_str = entry
            .get("price")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();
        let mut price_numeric = entry.get("price_numeric").and_then(serde_json::Value::as_f64);
        if price_numeric.is_none() && !price_str.is_empty() {
            price_numeric = parse_price(&price_str);
        }

        let (bbox, raw_lines, confidence) =
            match find_matching_group(&title, &price_str, groups) {
                Some((idx, anchor)) => {
                    used_groups.insert(idx);
                    let group = &groups[idx];
                    let avg = group.iter().map(|g| g.confidence).sum::<f32>() / group.len() as f32;
                    (
                        anchor.bbox,
                        group.iter().map(|g| g.text.clone()).collect(),
                        avg,
                    )
                }
                // Positional fallback: the i-th product usually came from the
                // i-th group.
                None if i < groups.len() && !groups[i].is_empty() && !used_groups.contains(&i) => {
                    let group = &groups[i];
                    let anchor = group
                        .iter()
                        .find(|item| price_regex().is_match(&item.text))
                        .unwrap_or(&group[0]);
                    let avg = group.iter().map(|g| g.confidence).sum::<f32>() / group.len() as f32;
                    (
                        anchor.bbox,
                        group.iter().map(|g| g.text.clone()).collect(),
                        avg,
                    )
                }
                None => (BoundingBox::default(), Vec::new(), 0.7),
            };

        products.push(VisualProduct {
            title,
            price: if price_str.is_empty() {
                None
            } else {
                Some(price_str)
            },
            price_numeric,
            bbox,
            confidence: confidence * 0.9,
            raw_ocr_lines: raw_lines,
        });
    }
    products
}

/// Find the group best matching a structured product, and the OCR item
/// inside it to anchor the bbox on: the price item, else the longest
/// title-word item, else the item nearest the group's vertical center.
pub fn find_matching_group<'a>(
    title: &str,
    price_str: &str,
    groups: &'a [Vec<OcrItem>],
) -> Option<(usize, &'a OcrItem)> {
    if title.is_empty() {
        return None;
    }
    let title_lower = title.to_lowercase();
    let title_words: std::collections::HashSet<&str> = title_lower.split_whitespace().collect();

    let mut best: Option<(usize, f32)> = None;
    for (idx, group) in groups.iter().enumerate() {
        if group.is_empty() {
            continue;
        }
        let group_text = group
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let group_words: std::collections::HashSet<&str> = group_text.split_whitespace().collect();

        let overlap = title_words.intersection(&group_words).count();
        if overlap == 0 {
            continue;
        }
        let mut score = overlap as f32 / title_words.len() as f32;

        if !price_str.is_empty() {
            let price_clean = price_str.replace(' ', "");
            if group_text.replace(' ', "").contains(&price_clean) {
                score += 0.5;
            }
        }

        if best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((idx, score));
        }
    }

    let (idx, _) = best?;
    let group = &groups[idx];

    let price_item = group.iter().find(|item| price_regex().is_match(&item.text));
    if let Some(item) = price_item {
        return Some((idx, item));
    }

    let title_item = group
        .iter()
        .filter(|item| {
            let lower = item.text.to_lowercase();
            title_words.iter().any(|w| w.len() > 3 && lower.contains(*w))
        })
        .max_by_key(|item| item.text.len());
    if let Some(item) = title_item {
        return Some((idx, item));
    }

    let center_y: f64 =
        group.iter().map(|i| f64::from(i.bbox.y)).sum::<f64>() / group.len() as f64;
    group
        .iter()
        .min_by_key(|item| (f64::from(item.bbox.y) - center_y).abs() as i64)
        .map(|item| (idx, item))
}

/// Drop products whose titles mark them as sponsored or non-product rows.
pub fn filter_sponsored_titles(products: Vec<VisualProduct>) -> Vec<VisualProduct> {
    products
        .into_iter()
        .filter(|p| {
            let title_lower = p.title.to_lowercase();
            let sponsored = SPONSORED_TITLE_MARKERS
                .iter()
                .any(|marker| title_lower.contains(marker))
                || title_lower.starts_with("ad ");
            if sponsored {
                tracing::debug!(title = %p.title, "filtered sponsored vision product");
            }
            !sponsored
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::OcrSpan;
    use crate::testing::MockOcr;
    use solver_client::MockSolver;

    fn item(text: &str, y: i32) -> OcrItem {
        OcrItem {
            text: text.to_string(),
            bbox: BoundingBox::new(50, y, 200, 20),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_no_results_detection() {
        let items = vec![item("Sorry, no results for your search", 100)];
        assert_eq!(detect_no_results(&items), Some("sorry, no results"));

        let items = vec![item("Gaming Laptop $999.99", 100)];
        assert_eq!(detect_no_results(&items), None);
    }

    #[test]
    fn test_grouping_splits_on_vertical_gap() {
        let config = PerceptionConfig::default();
        let items = vec![
            item("Laptop A", 100),
            item("$999.99", 130),
            item("Laptop B", 400),
            item("$1,299.99", 430),
            item("Laptop C", 700),
        ];

        let groups = group_items(items, &config);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn test_grouping_caps_group_count() {
        let config = PerceptionConfig {
            max_ocr_groups: 3,
            ..Default::default()
        };
        let items: Vec<OcrItem> = (0..10).map(|i| item("Row", i * 200)).collect();
        assert_eq!(group_items(items, &config).len(), 3);
    }

    #[test]
    fn test_require_price_pattern_filters_priceless_groups() {
        let config = PerceptionConfig {
            require_price_pattern: true,
            ..Default::default()
        };
        let items = vec![
            item("Laptop A", 100),
            item("$999.99", 130),
            item("Navigation menu", 500),
        ];
        let groups = group_items(items, &config);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_find_matching_group_anchors_on_price_item() {
        let groups = vec![
            vec![item("Filters", 10)],
            vec![item("Acer Nitro V 16 Gaming Laptop", 300), item("$1,099.99", 330)],
        ];

        let (idx, anchor) = find_matching_group("Acer Nitro V 16", "$1,099.99", &groups).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(anchor.text, "$1,099.99");
        assert_eq!(anchor.bbox.y, 330);
    }

    #[test]
    fn test_sponsored_title_filter() {
        let products = vec![
            VisualProduct {
                title: "Sponsored - Gaming Laptop".to_string(),
                price: None,
                price_numeric: None,
                bbox: BoundingBox::default(),
                confidence: 0.8,
                raw_ocr_lines: vec![],
            },
            VisualProduct {
                title: "Acer Nitro V 16".to_string(),
                price: Some("$999".to_string()),
                price_numeric: Some(999.0),
                bbox: BoundingBox::default(),
                confidence: 0.8,
                raw_ocr_lines: vec![],
            },
        ];

        let filtered = filter_sponsored_titles(products);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "Acer Nitro V 16");
    }

    #[tokio::test]
    async fn test_extract_three_grouped_products() {
        let spans = vec![
            OcrSpan {
                polygon: vec![(50, 100), (400, 100), (400, 120), (50, 120)],
                text: "Acer Nitro V 16 Gaming Laptop".to_string(),
                confidence: 0.95,
            },
            OcrSpan {
                polygon: vec![(50, 130), (150, 130), (150, 150), (50, 150)],
                text: "$1,099.99".to_string(),
                confidence: 0.97,
            },
            OcrSpan {
                polygon: vec![(50, 400), (400, 400), (400, 420), (50, 420)],
                text: "ASUS TUF Gaming A16".to_string(),
                confidence: 0.94,
            },
            OcrSpan {
                polygon: vec![(50, 430), (150, 430), (150, 450), (50, 450)],
                text: "$1,299.00".to_string(),
                confidence: 0.96,
            },
            OcrSpan {
                polygon: vec![(50, 700), (400, 700), (400, 720), (50, 720)],
                text: "Lenovo LOQ 15 RTX 4060".to_string(),
                confidence: 0.93,
            },
            OcrSpan {
                polygon: vec![(50, 730), (150, 730), (150, 750), (50, 750)],
                text: "$949.99".to_string(),
                confidence: 0.95,
            },
        ];

        let solver = MockSolver::new().with_response(
            r#"[
                {"title": "Acer Nitro V 16 Gaming Laptop", "price": "$1,099.99", "price_numeric": 1099.99},
                {"title": "ASUS TUF Gaming A16", "price": "$1,299.00", "price_numeric": 1299.00},
                {"title": "Lenovo LOQ 15 RTX 4060", "price": "$949.99", "price_numeric": 949.99}
            ]"#,
        );

        let extractor = VisionExtractor::new(
            Arc::new(solver),
            Arc::new(MockOcr::new().with_spans(spans)),
            PerceptionConfig::default(),
        );

        let products = extractor
            .extract(Path::new("/tmp/shot.png"), "rtx 4060 gaming laptop")
            .await
            .unwrap();

        assert_eq!(products.len(), 3);
        // Each bbox anchors to the OCR item containing the price.
        assert_eq!(products[0].bbox.y, 130);
        assert_eq!(products[1].bbox.y, 430);
        assert_eq!(products[2].bbox.y, 730);
        assert_eq!(products[0].price_numeric, Some(1099.99));
    }

    #[tokio::test]
    async fn test_extract_returns_empty_on_no_results_page() {
        let spans = vec![OcrSpan {
            polygon: vec![(50, 100), (500, 100), (500, 130), (50, 130)],
            text: "We found 0 items that match your search".to_string(),
            confidence: 0.99,
        }];

        let solver = MockSolver::new();
        let extractor = VisionExtractor::new(
            Arc::new(solver.clone()),
            Arc::new(MockOcr::new().with_spans(spans)),
            PerceptionConfig::default(),
        );

        let products = extractor
            .extract(Path::new("/tmp/shot.png"), "laptop")
            .await
            .unwrap();
        assert!(products.is_empty());
        // The solver is never consulted for an empty page.
        assert!(solver.calls().is_empty());
    }
}
