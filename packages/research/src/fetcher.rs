//! Resilient web fetching with an ordered transport chain.
//!
//! Transports are tried in order until one succeeds: async HTTP, blocking
//! HTTP off the async path, a headless browser page, and finally a `curl`
//! subprocess. Every transport applies the same per-domain pacing.

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::collections::HashMap;
use std::time::Duration;

use browser::{BrowserProcess, LaunchOptions, WaitPolicy};

use crate::error::Result;

const DEFAULT_USER_AGENT: &str = "HamperResearch/1.0 Shopping Research Assistant";

/// Minimum body length for a fetch to count as a success.
const MIN_BODY_BYTES: usize = 100;

type DomainLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Result of a fetch attempt.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub html: String,
    pub final_url: String,
    pub method_used: String,
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub success: bool,
    pub error: Option<String>,
}

impl FetchResult {
    fn failure(url: &str, method: &str, error: impl Into<String>) -> Self {
        Self {
            html: String::new(),
            final_url: url.to_string(),
            method_used: method.to_string(),
            status_code: None,
            headers: HashMap::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Fetches a URL as text through the fallback chain.
pub struct ResilientFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
    /// Two per second per domain with no burst: a hard 500 ms gap.
    limiter: DomainLimiter,
}

impl ResilientFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let quota = Quota::per_second(nonzero!(2u32)).allow_burst(nonzero!(1u32));
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(true)
                .user_agent(DEFAULT_USER_AGENT)
                .build()
                .unwrap_or_default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout,
            limiter: RateLimiter::keyed(quota),
        }
    }

    /// Fetch through the chain. The returned result is the first success, or
    /// a failure summarizing what each transport reported.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        let mut errors: Vec<String> = Vec::new();

        for method in ["http", "http_blocking", "browser", "curl"] {
            tracing::info!(method, url, "fetch attempt");
            let result = match method {
                "http" => self.fetch_async(url).await,
                "http_blocking" => self.fetch_blocking(url).await,
                "browser" => self.fetch_browser(url).await,
                _ => self.fetch_curl(url).await,
            };

            if result.success {
                tracing::info!(method, url, status = ?result.status_code, "fetch succeeded");
                return result;
            }
            let error = result.error.unwrap_or_else(|| "unknown".to_string());
            tracing::warn!(method, url, error = %error, "fetch transport failed");
            errors.push(format!("{method}: {error}"));
        }

        tracing::error!(url, attempts = errors.len(), "all fetch transports failed");
        FetchResult::failure(
            url,
            "none",
            format!(
                "all transports failed: {}",
                errors.iter().take(3).cloned().collect::<Vec<_>>().join("; ")
            ),
        )
    }

    async fn pace(&self, url: &str) {
        let domain = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        self.limiter.until_key_ready(&domain).await;
    }

    async fn fetch_async(&self, url: &str) -> FetchResult {
        // One retry inside the transport.
        for attempt in 0..2 {
            self.pace(url).await;
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let final_url = response.url().to_string();
                    let headers: HashMap<String, String> = response
                        .headers()
                        .iter()
                        .filter_map(|(k, v)| {
                            v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                        })
                        .collect();
                    match response.text().await {
                        Ok(html) => {
                            let success = status == 200 && html.len() >= MIN_BODY_BYTES;
                            return FetchResult {
                                success,
                                error: if success {
                                    None
                                } else {
                                    Some(format!("status {status}, {} bytes", html.len()))
                                },
                                html,
                                final_url,
                                method_used: "http".to_string(),
                                status_code: Some(status),
                                headers,
                            };
                        }
                        Err(e) if attempt == 0 => {
                            tracing::debug!(error = %e, "body read failed, retrying");
                        }
                        Err(e) => return FetchResult::failure(url, "http", e.to_string()),
                    }
                }
                Err(e) if attempt == 0 => {
                    tracing::debug!(error = %e, "request failed, retrying");
                }
                Err(e) => return FetchResult::failure(url, "http", e.to_string()),
            }
        }
        FetchResult::failure(url, "http", "retries exhausted")
    }

    /// Blocking reqwest run on the worker pool, off the scheduler path.
    async fn fetch_blocking(&self, url: &str) -> FetchResult {
        self.pace(url).await;
        let url_owned = url.to_string();
        let user_agent = self.user_agent.clone();
        let timeout = self.timeout;

        let outcome = tokio::task::spawn_blocking(move || {
            let client = reqwest::blocking::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(true)
                .user_agent(user_agent)
                .build()
                .map_err(|e| e.to_string())?;
            let response = client.get(&url_owned).send().map_err(|e| e.to_string())?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let html = response.text().map_err(|e| e.to_string())?;
            Ok::<_, String>((status, final_url, html))
        })
        .await;

        match outcome {
            Ok(Ok((status, final_url, html))) => {
                let success = status == 200 && html.len() >= MIN_BODY_BYTES;
                FetchResult {
                    success,
                    error: if success {
                        None
                    } else {
                        Some(format!("status {status}, {} bytes", html.len()))
                    },
                    html,
                    final_url,
                    method_used: "http_blocking".to_string(),
                    status_code: Some(status),
                    headers: HashMap::new(),
                }
            }
            Ok(Err(e)) => FetchResult::failure(url, "http_blocking", e),
            Err(e) => FetchResult::failure(url, "http_blocking", e.to_string()),
        }
    }

    /// Throwaway headless browser, for JS-heavy pages the HTTP paths cannot
    /// render.
    async fn fetch_browser(&self, url: &str) -> FetchResult {
        self.pace(url).await;
        let process = match BrowserProcess::launch(&LaunchOptions::default()).await {
            Ok(process) => process,
            Err(e) => return FetchResult::failure(url, "browser", e.to_string()),
        };

        let result = async {
            let page = process.new_page(None).await?;
            page.set_user_agent(&self.user_agent).await?;
            page.navigate(url, WaitPolicy::DomContentLoaded).await?;
            let html = page.content().await?;
            let final_url = page.current_url().await?;
            Ok::<_, browser::BrowserError>((html, final_url))
        }
        .await;

        process.shutdown().await;

        match result {
            Ok((html, final_url)) => {
                let success = html.len() >= MIN_BODY_BYTES;
                FetchResult {
                    success,
                    error: if success {
                        None
                    } else {
                        Some(format!("{} bytes rendered", html.len()))
                    },
                    html,
                    final_url,
                    method_used: "browser".to_string(),
                    status_code: Some(200),
                    headers: HashMap::new(),
                }
            }
            Err(e) => FetchResult::failure(url, "browser", e.to_string()),
        }
    }

    async fn fetch_curl(&self, url: &str) -> FetchResult {
        self.pace(url).await;
        let output = tokio::process::Command::new("curl")
            .args([
                "-L",
                "-s",
                "-A",
                &self.user_agent,
                "--max-time",
                &self.timeout.as_secs().to_string(),
                "--insecure",
                url,
            ])
            .output()
            .await;

        match output {
            Ok(output) => {
                let html = String::from_utf8_lossy(&output.stdout).into_owned();
                let success = output.status.success() && html.len() >= MIN_BODY_BYTES;
                FetchResult {
                    success,
                    error: if success {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&output.stderr).into_owned())
                    },
                    html,
                    final_url: url.to_string(),
                    method_used: "curl".to_string(),
                    status_code: if success { Some(200) } else { None },
                    headers: HashMap::new(),
                }
            }
            Err(e) => FetchResult::failure(url, "curl", e.to_string()),
        }
    }
}

impl Default for ResilientFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper returning an error for a failed fetch.
pub async fn fetch_text(fetcher: &ResilientFetcher, url: &str) -> Result<FetchResult> {
    let result = fetcher.fetch(url).await;
    if result.success {
        Ok(result)
    } else {
        Err(crate::error::ResearchError::FetchFailed {
            url: url.to_string(),
            summary: result.error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_success_predicate_shape() {
        let ok = FetchResult {
            html: "x".repeat(200),
            final_url: "https://shop.example".to_string(),
            method_used: "http".to_string(),
            status_code: Some(200),
            headers: HashMap::new(),
            success: true,
            error: None,
        };
        assert!(ok.success);

        let short = FetchResult::failure("https://shop.example", "http", "status 200, 42 bytes");
        assert!(!short.success);
        assert!(short.error.unwrap().contains("42 bytes"));
    }

    #[tokio::test]
    async fn test_domain_pacing_enforces_min_gap() {
        let fetcher = ResilientFetcher::new();
        let url = "https://pacing-test.example/page";

        let start = Instant::now();
        fetcher.pace(url).await;
        fetcher.pace(url).await;
        fetcher.pace(url).await;
        let elapsed = start.elapsed();

        // Three permits at 2/sec with burst 1: at least ~1s of waiting.
        assert!(
            elapsed >= Duration::from_millis(900),
            "pacing too fast: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_pacing_is_per_domain() {
        let fetcher = ResilientFetcher::new();

        let start = Instant::now();
        fetcher.pace("https://a.example/x").await;
        fetcher.pace("https://b.example/x").await;
        fetcher.pace("https://c.example/x").await;
        let elapsed = start.elapsed();

        // Different domains never wait on each other.
        assert!(elapsed < Duration::from_millis(300), "cross-domain stall: {elapsed:?}");
    }
}
