//! Search engines, driven like a human.
//!
//! Each engine entry carries the selectors needed to type a query into the
//! box and read result anchors. Engines are tried in order; a blocker or an
//! empty result page falls through to the next one.

use std::sync::Arc;
use std::time::Duration;

use browser::{detect_blocker, DrivenPage, InterventionBroker, PageSnapshot, WaitPolicy, SETTLE_DELAY};

use crate::error::{ResearchError, Result};
use crate::events::{EventEmitter, ResearchEvent};

/// How long to wait for result anchors after submitting a query.
const RESULTS_TIMEOUT: Duration = Duration::from_secs(8);

/// How long to wait for a human when the SERP is blocked.
const INTERVENTION_TIMEOUT: Duration = Duration::from_secs(120);

/// One search engine's driving recipe.
#[derive(Debug, Clone, Copy)]
pub struct SearchEngine {
    pub name: &'static str,
    pub home_url: &'static str,
    pub search_box: &'static str,
    pub result_anchors: &'static str,
}

/// The fallback chain, most bot-tolerant first.
pub const ENGINES: &[SearchEngine] = &[
    SearchEngine {
        name: "duckduckgo",
        home_url: "https://duckduckgo.com/",
        search_box: "input[name=\"q\"]",
        result_anchors: "a[data-testid=\"result-title-a\"], article a[href]",
    },
    SearchEngine {
        name: "bing",
        home_url: "https://www.bing.com/",
        search_box: "input[name=\"q\"], #sb_form_q",
        result_anchors: "li.b_algo h2 a",
    },
    SearchEngine {
        name: "google",
        home_url: "https://www.google.com/",
        search_box: "textarea[name=\"q\"], input[name=\"q\"]",
        result_anchors: "div#search a h3",
    },
];

/// One search result anchor.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
}

/// Drive the engine chain until one yields results.
pub async fn search(
    page: &DrivenPage,
    query: &str,
    broker: &Arc<InterventionBroker>,
    session_id: &str,
    events: &EventEmitter,
) -> Result<Vec<SearchHit>> {
    for engine in ENGINES {
        events.emit(ResearchEvent::SearchStarted {
            query: query.to_string(),
            engine: engine.name.to_string(),
        });

        match drive_engine(page, engine, query, broker, session_id).await {
            Ok(hits) if !hits.is_empty() => {
                tracing::info!(engine = engine.name, hits = hits.len(), "search succeeded");
                return Ok(hits);
            }
            Ok(_) => {
                tracing::warn!(engine = engine.name, "search returned nothing, trying next engine");
            }
            Err(e) => {
                tracing::warn!(engine = engine.name, error = %e, "engine failed, trying next");
            }
        }
    }
    Err(ResearchError::SearchFailed {
        query: query.to_string(),
    })
}

/// Type the query like a person: focus the box, type, Enter, wait, read.
async fn drive_engine(
    page: &DrivenPage,
    engine: &SearchEngine,
    query: &str,
    broker: &Arc<InterventionBroker>,
    session_id: &str,
) -> Result<Vec<SearchHit>> {
    page.navigate(engine.home_url, WaitPolicy::DomContentLoaded)
        .await?;

    if !check_blocker(page, broker, session_id).await? {
        return Ok(Vec::new());
    }

    if !page
        .wait_for_selector(engine.search_box, Duration::from_secs(5))
        .await
    {
        return Ok(Vec::new());
    }
    page.type_into(engine.search_box, query).await?;
    page.press_key(engine.search_box, "Enter").await?;

    if !page
        .wait_for_selector(engine.result_anchors, RESULTS_TIMEOUT)
        .await
    {
        // Results did not render: either a blocker or a dead SERP.
        if !check_blocker(page, broker, session_id).await? {
            return Ok(Vec::new());
        }
        if !page
            .wait_for_selector(engine.result_anchors, Duration::from_secs(3))
            .await
        {
            return Ok(Vec::new());
        }
    }

    let links = page.collect_links(engine.result_anchors).await?;
    Ok(filter_hits(links, engine.name))
}

/// Detect a blocker on the current page; when found, file an intervention
/// and wait. Returns false when the page is unusable.
async fn check_blocker(
    page: &DrivenPage,
    broker: &Arc<InterventionBroker>,
    session_id: &str,
) -> Result<bool> {
    let content = page.content().await?;
    let url = page.current_url().await?;
    let snapshot = PageSnapshot {
        url: &url,
        content: &content,
        status_code: None,
    };
    let Some(detection) = detect_blocker(&snapshot) else {
        return Ok(true);
    };

    tracing::warn!(url = %url, kind = detection.kind.as_str(), "blocker on search page");
    let intervention = broker.request_intervention(
        detection.kind,
        &url,
        None,
        session_id,
        Some(serde_json::json!({"evidence": detection.evidence})),
    )?;

    let resolved = broker
        .wait_for_resolution(&intervention.id, INTERVENTION_TIMEOUT)
        .await;
    if resolved {
        tokio::time::sleep(SETTLE_DELAY).await;
        return Ok(true);
    }
    Err(ResearchError::InterventionTimedOut { url })
}

/// Keep real external result anchors, dropping engine chrome and duplicate
/// URLs.
pub fn filter_hits(links: Vec<(String, String)>, engine_name: &str) -> Vec<SearchHit> {
    let mut seen = std::collections::HashSet::new();
    links
        .into_iter()
        .filter(|(title, href)| {
            href.starts_with("http")
                && !href.contains(engine_name)
                && !href.contains("duckduckgo.com")
                && !href.contains("bing.com")
                && !href.contains("google.")
                && title.trim().len() >= 5
        })
        .filter(|(_, href)| seen.insert(perception::models::normalize_url(href)))
        .map(|(title, url)| SearchHit {
            title: title.trim().to_string(),
            url,
        })
        .take(20)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_hits_drops_engine_chrome_and_dupes() {
        let links = vec![
            ("Settings".to_string(), "https://duckduckgo.com/settings".to_string()),
            (
                "Acer Nitro V at Best Buy".to_string(),
                "https://www.bestbuy.com/product/acer-nitro-v".to_string(),
            ),
            (
                "Acer Nitro V at Best Buy (dup)".to_string(),
                "https://www.bestbuy.com/product/acer-nitro-v?ref=serp".to_string(),
            ),
            ("".to_string(), "https://www.newegg.com/p/abc".to_string()),
            (
                "Gaming laptops at Newegg".to_string(),
                "https://www.newegg.com/p/abc".to_string(),
            ),
        ];

        let hits = filter_hits(links, "duckduckgo");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].url.contains("bestbuy.com"));
        assert!(hits[1].url.contains("newegg.com"));
    }

    #[test]
    fn test_engine_chain_order() {
        assert_eq!(ENGINES[0].name, "duckduckgo");
        assert_eq!(ENGINES.last().unwrap().name, "google");
    }
}
