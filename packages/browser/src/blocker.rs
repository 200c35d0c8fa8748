//! Blocker detection over fetched page snapshots.
//!
//! Classifies a `(url, content, status)` triple as one of the known
//! anti-bot mechanisms. Detection is pattern-based: element markers and URL
//! path hints count as strong signals, body phrases as weak ones. A page
//! with enough ordinary text is treated as clean even when a weak phrase
//! appears somewhere in it.

use serde::{Deserialize, Serialize};

/// Detection threshold: findings below this confidence are discarded.
pub const DETECTION_THRESHOLD: f32 = 0.7;

/// Minimum non-blocker body text for the clean-page guard.
const CLEAN_PAGE_MIN_CHARS: usize = 200;

/// The closed set of blocker variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockerKind {
    Recaptcha,
    Hcaptcha,
    Cloudflare,
    GenericCaptcha,
    RateLimit,
    LoginRequired,
    GeoBlock,
    Unknown,
}

impl BlockerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockerKind::Recaptcha => "recaptcha",
            BlockerKind::Hcaptcha => "hcaptcha",
            BlockerKind::Cloudflare => "cloudflare",
            BlockerKind::GenericCaptcha => "generic-captcha",
            BlockerKind::RateLimit => "rate-limit",
            BlockerKind::LoginRequired => "login-required",
            BlockerKind::GeoBlock => "geo-block",
            BlockerKind::Unknown => "unknown",
        }
    }
}

/// Input to detection: what we know about the fetched page.
#[derive(Debug, Clone)]
pub struct PageSnapshot<'a> {
    pub url: &'a str,
    pub content: &'a str,
    pub status_code: Option<u16>,
}

/// A positive detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerDetection {
    pub kind: BlockerKind,
    pub confidence: f32,
    /// Which pattern fired, for intervention records and logs.
    pub evidence: String,
}

/// URL path fragments that indicate a block/captcha interstitial.
const URL_HINTS: &[(&str, BlockerKind)] = &[
    ("/sorry/", BlockerKind::GenericCaptcha),
    ("/captcha", BlockerKind::GenericCaptcha),
    ("/splashui/captcha", BlockerKind::GenericCaptcha),
    ("/blocked?url=", BlockerKind::GenericCaptcha),
];

/// Strong in-body markers: widget class names and challenge scaffolding.
const STRONG_MARKERS: &[(&str, BlockerKind, f32)] = &[
    ("g-recaptcha", BlockerKind::Recaptcha, 0.95),
    ("grecaptcha.execute", BlockerKind::Recaptcha, 0.9),
    ("recaptcha/api.js", BlockerKind::Recaptcha, 0.9),
    ("h-captcha", BlockerKind::Hcaptcha, 0.95),
    ("hcaptcha.com/1/api.js", BlockerKind::Hcaptcha, 0.9),
    ("cf-challenge", BlockerKind::Cloudflare, 0.9),
    ("cf-browser-verification", BlockerKind::Cloudflare, 0.9),
    ("cdn-cgi/challenge-platform", BlockerKind::Cloudflare, 0.9),
    ("turnstile", BlockerKind::Cloudflare, 0.8),
];

/// Weak phrases: only trusted on pages with little other text.
const WEAK_PHRASES: &[(&str, BlockerKind)] = &[
    ("verify you are a human", BlockerKind::GenericCaptcha),
    ("are you a robot", BlockerKind::GenericCaptcha),
    ("unusual traffic from your computer network", BlockerKind::GenericCaptcha),
    ("checking your browser before accessing", BlockerKind::Cloudflare),
    ("just a moment...", BlockerKind::Cloudflare),
    ("attention required! | cloudflare", BlockerKind::Cloudflare),
    ("too many requests", BlockerKind::RateLimit),
    ("rate limit exceeded", BlockerKind::RateLimit),
    ("you have been rate limited", BlockerKind::RateLimit),
    ("sign in to continue", BlockerKind::LoginRequired),
    ("please log in to view", BlockerKind::LoginRequired),
    ("login required", BlockerKind::LoginRequired),
    ("not available in your country", BlockerKind::GeoBlock),
    ("not available in your region", BlockerKind::GeoBlock),
];

/// Classify a page snapshot. Returns `None` when the page looks clean or the
/// best finding is below [`DETECTION_THRESHOLD`].
pub fn detect_blocker(snapshot: &PageSnapshot<'_>) -> Option<BlockerDetection> {
    let url_lower = snapshot.url.to_lowercase();
    let content_lower = snapshot.content.to_lowercase();

    let mut best: Option<BlockerDetection> = None;
    let mut consider = |kind: BlockerKind, confidence: f32, evidence: &str| {
        if best.as_ref().map(|b| b.confidence).unwrap_or(0.0) < confidence {
            best = Some(BlockerDetection {
                kind,
                confidence,
                evidence: evidence.to_string(),
            });
        }
    };

    if snapshot.status_code == Some(429) {
        consider(BlockerKind::RateLimit, 0.95, "status 429");
    }

    for (hint, kind) in URL_HINTS {
        if url_lower.contains(hint) {
            consider(*kind, 0.9, hint);
        }
    }

    for (marker, kind, confidence) in STRONG_MARKERS {
        if content_lower.contains(marker) {
            consider(*kind, *confidence, marker);
        }
    }

    // Weak phrases only count on pages that are mostly blocker interstitial.
    let non_blocker_chars = non_blocker_text_len(&content_lower);
    for (phrase, kind) in WEAK_PHRASES {
        if content_lower.contains(phrase) {
            let confidence = if non_blocker_chars < CLEAN_PAGE_MIN_CHARS {
                0.8
            } else {
                0.4
            };
            consider(*kind, confidence, phrase);
        }
    }

    match best {
        Some(detection) if detection.confidence >= DETECTION_THRESHOLD => {
            tracing::info!(
                url = %snapshot.url,
                kind = detection.kind.as_str(),
                confidence = detection.confidence,
                evidence = %detection.evidence,
                "blocker detected"
            );
            Some(detection)
        }
        _ => None,
    }
}

/// Visible text length once markup and known blocker phrases are stripped.
fn non_blocker_text_len(content_lower: &str) -> usize {
    let mut text = strip_tags(content_lower);
    for (phrase, _) in WEAK_PHRASES {
        text = text.replace(phrase, "");
    }
    text.split_whitespace().map(str::len).sum()
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}
