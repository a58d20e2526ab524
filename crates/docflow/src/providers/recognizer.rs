//! Recognition provider: turns a payload into text

use async_trait::async_trait;
use std::time::Duration;

use crate::config::RecognitionConfig;
use crate::error::{Error, Result};
use crate::types::RecognitionResult;

/// Text returned by [`MockRecognizer`] unless configured otherwise
pub const SAMPLE_INVOICE_TEXT: &str = "\
ACME SUPPLIES LTD
Invoice Number: INV-2025-001
Customer: Acme Corp
Date: 2025-07-08
Total: 1234.56 USD
Currency: USD
Thank you for your business.";

/// Trait for recognition backends
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Recognize the text in a document payload
    async fn recognize(&self, filename: &str, payload: &[u8]) -> Result<RecognitionResult>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Stand-in recognizer: returns fixed text after a delay
pub struct MockRecognizer {
    text: String,
    confidence: f32,
    language: String,
    delay: Duration,
}

impl MockRecognizer {
    /// Create with explicit text and no delay
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: 0.95,
            language: "en".to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Create from config
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            text: config
                .text
                .clone()
                .unwrap_or_else(|| SAMPLE_INVOICE_TEXT.to_string()),
            confidence: config.confidence.clamp(0.0, 1.0),
            language: config.language.clone(),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new(SAMPLE_INVOICE_TEXT)
    }
}

#[async_trait]
impl Recognizer for MockRecognizer {
    async fn recognize(&self, filename: &str, payload: &[u8]) -> Result<RecognitionResult> {
        if payload.is_empty() {
            return Err(Error::recognition(format!("'{}' has an empty payload", filename)));
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        tracing::debug!(filename, bytes = payload.len(), "Mock recognition complete");

        Ok(RecognitionResult {
            text: self.text.clone(),
            confidence: self.confidence,
            language: self.language.clone(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_configured_text() {
        let recognizer = MockRecognizer::from_config(&RecognitionConfig {
            delay_ms: 0,
            text: Some("hello".to_string()),
            confidence: 0.5,
            language: "de".to_string(),
        });

        let result = recognizer.recognize("scan.png", b"\x89PNG").await.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.confidence, 0.5);
        assert_eq!(result.language, "de");
    }

    #[tokio::test]
    async fn test_default_text_is_sample_invoice() {
        let result = MockRecognizer::default().recognize("a.pdf", b"x").await.unwrap();
        assert!(result.text.contains("INV-2025-001"));
    }

    #[tokio::test]
    async fn test_rejects_empty_payload() {
        let err = MockRecognizer::default().recognize("a.pdf", b"").await.unwrap_err();
        assert!(matches!(err, Error::Recognition(_)));
    }
}
