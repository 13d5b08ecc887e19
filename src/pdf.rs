//! PDF text extraction: an HTTP microservice with tunable extraction
//! parameters, health-checked before use, with a local extractor fallback
//! when the service is disabled or down.

use crate::config::PdfConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extracts per-page text from a PDF byte stream
#[async_trait]
pub trait PdfExtractor: Send + Sync {
    async fn extract_pages(&self, data: &[u8]) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    pages: Vec<String>,
}

/// Client for the extractor microservice
pub struct PdfService {
    client: reqwest::Client,
    config: PdfConfig,
}

impl PdfService {
    pub fn new(config: PdfConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn enabled(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    /// Cheap liveness probe before handing the service real work
    pub async fn healthy(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        let url = format!("{}/health", self.config.base_url.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("PDF service health check failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl PdfExtractor for PdfService {
    async fn extract_pages(&self, data: &[u8]) -> Result<Vec<String>> {
        let url = format!("{}/extract", self.config.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .query(&[
                ("mode", self.config.mode.as_str()),
                ("wm", "1"),
                ("cm", "1"),
                ("lm", "0"),
                ("bf", "1"),
                ("flow", "1"),
                ("xt", "2"),
                ("yt", "2"),
            ])
            .body(data.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Config(format!("PDF extraction failed: {body}")));
        }

        let parsed: ExtractResponse = response.json().await?;
        info!("PDF service extracted {} pages", parsed.pages.len());
        Ok(parsed.pages)
    }
}

/// In-process fallback extractor
#[derive(Default)]
pub struct LocalPdfExtractor;

#[async_trait]
impl PdfExtractor for LocalPdfExtractor {
    async fn extract_pages(&self, data: &[u8]) -> Result<Vec<String>> {
        let data = data.to_vec();
        // pdf parsing is CPU-bound; keep it off the reactor
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&data))
            .await
            .map_err(|e| EngineError::Config(e.to_string()))?
            .map_err(|e| EngineError::Config(format!("PDF parse failed: {e}")))?;

        Ok(split_pages(&text))
    }
}

/// Page texts from a form-feed separated document body
pub fn split_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\u{c}')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    if pages.is_empty() && !text.trim().is_empty() {
        vec![text.trim().to_string()]
    } else {
        pages
    }
}

/// Service-first extraction pipeline with local fallback
pub struct PdfPipeline {
    service: PdfService,
    local: LocalPdfExtractor,
}

impl PdfPipeline {
    pub fn new(config: PdfConfig) -> Result<Self> {
        Ok(Self { service: PdfService::new(config)?, local: LocalPdfExtractor })
    }

    pub async fn extract_pages(&self, data: &[u8]) -> Result<Vec<String>> {
        if self.service.healthy().await {
            match self.service.extract_pages(data).await {
                Ok(pages) => return Ok(pages),
                Err(e) => warn!("PDF service failed, falling back to local extraction: {e}"),
            }
        }
        self.local.extract_pages(data).await
    }
}
