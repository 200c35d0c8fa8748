//! Mock implementations for testing the pipeline without real engines.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{PerceptionError, Result};
use crate::ocr::{OcrEngine, OcrSpan};

/// A mock OCR engine that replays scripted spans and records calls.
#[derive(Default, Clone)]
pub struct MockOcr {
    spans: Arc<RwLock<Vec<OcrSpan>>>,
    calls: Arc<RwLock<Vec<PathBuf>>>,
    fail: Arc<RwLock<bool>>,
}

impl MockOcr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spans every recognition returns.
    pub fn with_spans(self, spans: Vec<OcrSpan>) -> Self {
        *self.spans.write().unwrap() = spans;
        self
    }

    /// Make recognition fail, for resource-unavailability paths.
    pub fn failing(self) -> Self {
        *self.fail.write().unwrap() = true;
        self
    }

    /// Image paths recognized so far.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl OcrEngine for MockOcr {
    async fn recognize(&self, image_path: &Path) -> Result<Vec<OcrSpan>> {
        self.calls.write().unwrap().push(image_path.to_path_buf());
        if *self.fail.read().unwrap() {
            return Err(PerceptionError::Ocr("mock ocr failure".to_string()));
        }
        Ok(self.spans.read().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_ocr_replays_and_records() {
        let spans = vec![OcrSpan {
            polygon: vec![(0, 0), (10, 0), (10, 10), (0, 10)],
            text: "x".to_string(),
            confidence: 0.9,
        }];
        let ocr = MockOcr::new().with_spans(spans);

        let result = ocr.recognize(Path::new("/tmp/a.png")).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(ocr.calls(), vec![PathBuf::from("/tmp/a.png")]);
    }

    #[tokio::test]
    async fn test_mock_ocr_failure_mode() {
        let ocr = MockOcr::new().failing();
        assert!(ocr.recognize(Path::new("/tmp/a.png")).await.is_err());
    }
}
