//! OCR engine seam.
//!
//! The OCR engine is an external collaborator: it takes an image path and
//! returns text spans with polygons and confidences. The trait keeps the
//! vision extractor testable; the HTTP client talks to the OCR sidecar.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{PerceptionError, Result};
use crate::models::{BoundingBox, OcrItem};

/// A recognized text span: polygon corners, text, confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSpan {
    /// Polygon corner points as (x, y).
    pub polygon: Vec<(i32, i32)>,
    pub text: String,
    pub confidence: f32,
}

impl OcrSpan {
    /// Axis-aligned bbox from the polygon's min/max corners.
    pub fn bbox(&self) -> BoundingBox {
        if self.polygon.is_empty() {
            return BoundingBox::default();
        }
        let min_x = self.polygon.iter().map(|p| p.0).min().unwrap_or(0);
        let max_x = self.polygon.iter().map(|p| p.0).max().unwrap_or(0);
        let min_y = self.polygon.iter().map(|p| p.1).min().unwrap_or(0);
        let max_y = self.polygon.iter().map(|p| p.1).max().unwrap_or(0);
        BoundingBox::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn into_item(self) -> OcrItem {
        let bbox = self.bbox();
        OcrItem {
            text: self.text,
            bbox,
            confidence: self.confidence,
        }
    }
}

/// The OCR engine contract.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Recognize text in an image file.
    async fn recognize(&self, image_path: &Path) -> Result<Vec<OcrSpan>>;
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    image_path: &'a str,
    use_gpu: bool,
}

#[derive(Deserialize)]
struct OcrResponse {
    spans: Vec<OcrSpan>,
}

/// Client for the OCR sidecar service.
pub struct HttpOcr {
    client: reqwest::Client,
    base_url: String,
    use_gpu: bool,
}

impl HttpOcr {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64, use_gpu: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            use_gpu,
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcr {
    async fn recognize(&self, image_path: &Path) -> Result<Vec<OcrSpan>> {
        let url = format!("{}/ocr", self.base_url.trim_end_matches('/'));
        let request = OcrRequest {
            image_path: image_path.to_str().unwrap_or_default(),
            use_gpu: self.use_gpu,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PerceptionError::Ocr(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PerceptionError::Ocr(format!(
                "ocr sidecar returned HTTP {}",
                response.status()
            )));
        }

        let parsed: OcrResponse = response
            .json()
            .await
            .map_err(|e| PerceptionError::Ocr(e.to_string()))?;
        Ok(parsed.spans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_from_polygon_min_max() {
        let span = OcrSpan {
            polygon: vec![(10, 20), (110, 22), (108, 44), (12, 42)],
            text: "$49.99".to_string(),
            confidence: 0.93,
        };
        let bbox = span.bbox();
        assert_eq!(bbox.x, 10);
        assert_eq!(bbox.y, 20);
        assert_eq!(bbox.width, 100);
        assert_eq!(bbox.height, 24);
    }

    #[test]
    fn test_empty_polygon_yields_zero_bbox() {
        let span = OcrSpan {
            polygon: vec![],
            text: "x".to_string(),
            confidence: 0.5,
        };
        assert_eq!(span.bbox(), BoundingBox::default());
    }
}
