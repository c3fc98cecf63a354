use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::retry::read_success_body;
use super::{ProviderFuture, TranslationProvider, TranslationRequest, language_name};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat-completions translation.
#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAI {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: base_url(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        if self.key.trim().is_empty() {
            return Err(ProviderError::Unavailable(
                "OPENAI_API_KEY is not set".to_string(),
            ));
        }
        let url = format!("{}/chat/completions", self.base_url);
        let body = request_body(&self.model, request);
        debug!("openai: POST {} ({})", url, self.model);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.key)
            .json(&body)
            .send()
            .await?;
        let text = read_success_body(response).await.map_err(|err| match err {
            ProviderError::Status { status: 401, body } => {
                ProviderError::Unavailable(format!(
                    "rejected API key: {}",
                    extract_openai_error(&body).unwrap_or(body)
                ))
            }
            other => other,
        })?;
        extract_content(&text)
    }
}

impl TranslationProvider for OpenAI {
    fn name(&self) -> &str {
        "openai"
    }

    fn translate<'a>(&'a self, request: &'a TranslationRequest) -> ProviderFuture<'a> {
        Box::pin(self.call(request))
    }
}

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL")
        .ok()
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn request_body(model: &str, request: &TranslationRequest) -> serde_json::Value {
    let system = format!(
        "You are a translator. Translate the user's text from {} to {}. \
         Reply with the translation only, without notes, quotes or explanations.",
        language_name(&request.source_lang),
        language_name(&request.target_lang)
    );
    json!({
        "model": model,
        "temperature": 0,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": request.text}
        ]
    })
}

fn extract_content(text: &str) -> Result<String, ProviderError> {
    let payload: OpenAIResponse = serde_json::from_str(text)
        .map_err(|err| ProviderError::Malformed(format!("OpenAI response JSON: {}", err)))?;
    let content = payload
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ProviderError::Malformed(
            "no message content returned from OpenAI".to_string(),
        ));
    }
    Ok(content)
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    let mut parts = Vec::new();
    if let Some(message) = error.message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(code) = error.code
        && !code.trim().is_empty()
    {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" | "))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}
