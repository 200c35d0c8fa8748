//! Configuration for the perception pipeline.
//!
//! Populated from `PERCEPTION_*` environment variables at startup and
//! immutable afterwards.

use std::path::PathBuf;

/// Tunables for hybrid product extraction.
#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    // Feature flags
    pub enable_hybrid: bool,
    pub enable_click_resolve: bool,
    pub enable_json_ld: bool,
    pub enable_url_patterns: bool,
    pub enable_dom_heuristics: bool,

    // Limits
    pub max_click_resolves: usize,
    pub max_products_per_retailer: usize,
    pub max_ocr_groups: usize,

    // OCR settings
    pub ocr_use_gpu: bool,
    pub ocr_confidence_min: f32,
    pub ocr_timeout_ms: u64,

    // Fusion settings
    pub similarity_threshold: f32,
    pub boost_on_match: f32,

    // Spatial grouping for OCR. Tight grouping avoids merging different
    // products into one card.
    pub y_group_threshold: i32,
    pub x_group_threshold: i32,
    pub require_price_pattern: bool,

    // Timeouts (milliseconds)
    pub llm_timeout_ms: u64,
    pub click_resolve_timeout_ms: u64,

    // Fallback behavior
    pub fallback_to_html_only: bool,

    // PDP verification
    pub enable_pdp_verification: bool,
    pub pdp_verification_timeout_ms: u64,
    pub pdp_max_verify_per_retailer: usize,
    pub pdp_track_discrepancies: bool,
    pub pdp_discrepancy_threshold: f64,

    // Proactive calibration
    pub enable_proactive_calibration: bool,
    pub calibration_timeout_ms: u64,
    pub calibration_min_confidence: f32,

    // Debug
    pub save_debug_screenshots: bool,
    pub debug_output_dir: PathBuf,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            enable_hybrid: true,
            enable_click_resolve: true,
            enable_json_ld: true,
            enable_url_patterns: true,
            enable_dom_heuristics: true,
            max_click_resolves: 5,
            max_products_per_retailer: 20,
            max_ocr_groups: 25,
            ocr_use_gpu: false,
            ocr_confidence_min: 0.5,
            ocr_timeout_ms: 30_000,
            similarity_threshold: 0.40,
            boost_on_match: 0.1,
            y_group_threshold: 80,
            x_group_threshold: 400,
            require_price_pattern: false,
            llm_timeout_ms: 30_000,
            click_resolve_timeout_ms: 5_000,
            fallback_to_html_only: true,
            enable_pdp_verification: true,
            pdp_verification_timeout_ms: 3_000,
            pdp_max_verify_per_retailer: 5,
            pdp_track_discrepancies: true,
            pdp_discrepancy_threshold: 0.10,
            enable_proactive_calibration: true,
            calibration_timeout_ms: 15_000,
            calibration_min_confidence: 0.5,
            save_debug_screenshots: false,
            debug_output_dir: PathBuf::from("/tmp/product_perception_debug"),
        }
    }
}

impl PerceptionConfig {
    /// Load configuration from `PERCEPTION_*` environment variables,
    /// defaulting any unset value.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.enable_hybrid = env_bool("PERCEPTION_ENABLE_HYBRID", config.enable_hybrid);
        config.enable_click_resolve =
            env_bool("PERCEPTION_ENABLE_CLICK_RESOLVE", config.enable_click_resolve);
        config.max_click_resolves =
            env_parse("PERCEPTION_MAX_CLICK_RESOLVES", config.max_click_resolves);
        config.max_products_per_retailer =
            env_parse("PERCEPTION_MAX_PRODUCTS", config.max_products_per_retailer);
        config.ocr_use_gpu = env_bool("PERCEPTION_OCR_USE_GPU", config.ocr_use_gpu);
        config.ocr_confidence_min =
            env_parse("PERCEPTION_OCR_CONFIDENCE_MIN", config.ocr_confidence_min);
        config.ocr_timeout_ms = env_parse("PERCEPTION_OCR_TIMEOUT_MS", config.ocr_timeout_ms);
        config.similarity_threshold =
            env_parse("PERCEPTION_SIMILARITY_THRESHOLD", config.similarity_threshold);
        config.fallback_to_html_only =
            env_bool("PERCEPTION_FALLBACK_HTML", config.fallback_to_html_only);
        config.y_group_threshold =
            env_parse("PERCEPTION_Y_GROUP_THRESHOLD", config.y_group_threshold);
        config.x_group_threshold =
            env_parse("PERCEPTION_X_GROUP_THRESHOLD", config.x_group_threshold);
        config.require_price_pattern =
            env_bool("PERCEPTION_REQUIRE_PRICE_PATTERN", config.require_price_pattern);
        config.enable_pdp_verification =
            env_bool("PERCEPTION_ENABLE_PDP_VERIFY", config.enable_pdp_verification);
        config.pdp_verification_timeout_ms =
            env_parse("PERCEPTION_PDP_TIMEOUT_MS", config.pdp_verification_timeout_ms);
        config.pdp_max_verify_per_retailer =
            env_parse("PERCEPTION_PDP_MAX_VERIFY", config.pdp_max_verify_per_retailer);
        config.pdp_track_discrepancies = env_bool(
            "PERCEPTION_PDP_TRACK_DISCREPANCY",
            config.pdp_track_discrepancies,
        );
        config.pdp_discrepancy_threshold = env_parse(
            "PERCEPTION_PDP_DISCREPANCY_THRESHOLD",
            config.pdp_discrepancy_threshold,
        );
        config.enable_proactive_calibration = env_bool(
            "PERCEPTION_PROACTIVE_CALIBRATION",
            config.enable_proactive_calibration,
        );
        config.calibration_timeout_ms =
            env_parse("PERCEPTION_CALIBRATION_TIMEOUT_MS", config.calibration_timeout_ms);
        config.calibration_min_confidence = env_parse(
            "PERCEPTION_CALIBRATION_MIN_CONFIDENCE",
            config.calibration_min_confidence,
        );
        config.save_debug_screenshots = env_bool("PERCEPTION_DEBUG", config.save_debug_screenshots);
        if let Ok(dir) = std::env::var("PERCEPTION_DEBUG_DIR") {
            config.debug_output_dir = PathBuf::from(dir);
        }
        config
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
