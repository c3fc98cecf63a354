use serde_json::Value;
use tracing::debug;

use super::retry::read_success_body;
use super::{ProviderFuture, TranslationProvider, TranslationRequest};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://translate.googleapis.com";

/// The public web translator endpoint (`client=gtx`). No key, but it throttles
/// aggressively, so the chain spaces calls out with a courtesy delay.
#[derive(Debug, Clone)]
pub struct Google {
    base_url: String,
    client: reqwest::Client,
}

impl Default for Google {
    fn default() -> Self {
        Self::new()
    }
}

impl Google {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    async fn call(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        let url = format!("{}/translate_a/single", self.base_url);
        debug!("google: GET {} ({} -> {})", url, request.source_lang, request.target_lang);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("client", "gtx"),
                ("sl", web_tag(&request.source_lang)),
                ("tl", web_tag(&request.target_lang)),
                ("dt", "t"),
                ("q", request.text.as_str()),
            ])
            .send()
            .await?;
        let text = read_success_body(response).await?;
        parse_segments(&text)
    }
}

impl TranslationProvider for Google {
    fn name(&self) -> &str {
        "google"
    }

    fn translate<'a>(&'a self, request: &'a TranslationRequest) -> ProviderFuture<'a> {
        Box::pin(self.call(request))
    }
}

/// The endpoint wants two-letter tags; engine-style tags are mapped.
fn web_tag(tag: &str) -> &str {
    match tag.trim() {
        "jpn" | "jpn_vert" => "ja",
        "eng" => "en",
        "spa" => "es",
        "fra" => "fr",
        "deu" => "de",
        "chi_sim" => "zh-CN",
        "chi_tra" => "zh-TW",
        "kor" => "ko",
        "" => "auto",
        other => other,
    }
}

/// Concatenates the translated segments of `[[["Hola","こんにちは",..],..],..]`.
fn parse_segments(body: &str) -> Result<String, ProviderError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| ProviderError::Malformed(format!("google response JSON: {}", err)))?;
    let segments = value
        .get(0)
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::Malformed("google response has no segments".to_string()))?;
    let mut out = String::new();
    for segment in segments {
        if let Some(part) = segment.get(0).and_then(Value::as_str) {
            out.push_str(part);
        }
    }
    let out = out.trim().to_string();
    if out.is_empty() {
        return Err(ProviderError::Malformed(
            "google returned an empty translation".to_string(),
        ));
    }
    Ok(out)
}
