use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ProviderError;

mod google;
mod ollama;
mod openai;
pub(crate) mod retry;

pub use google::Google;
pub use ollama::Ollama;
pub use openai::OpenAI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAI,
    Google,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Local subprocesses get a longer budget than network calls.
    pub fn default_timeout(&self) -> Duration {
        match self {
            ProviderKind::Ollama => Duration::from_secs(40),
            ProviderKind::OpenAI | ProviderKind::Google => Duration::from_secs(8),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "openai" | "chatgpt" | "gpt" => Ok(ProviderKind::OpenAI),
            "google" | "gtx" => Ok(ProviderKind::Google),
            "ollama" | "local" => Ok(ProviderKind::Ollama),
            other => Err(format!(
                "unknown provider '{}' (expected openai, google, ollama)",
                other
            )),
        }
    }
}

/// One text item to translate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }
}

pub type ProviderFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>>;

pub trait TranslationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn translate<'a>(&'a self, request: &'a TranslationRequest) -> ProviderFuture<'a>;
}

const LANGUAGE_NAMES: &[(&[&str], &str)] = &[
    (&["ja", "jpn", "jpn_vert"], "Japanese"),
    (&["en", "eng"], "English"),
    (&["es", "spa"], "Spanish"),
    (&["fr", "fra"], "French"),
    (&["de", "deu"], "German"),
    (&["it", "ita"], "Italian"),
    (&["pt", "por"], "Portuguese"),
    (&["zh", "zh-cn", "chi_sim"], "Simplified Chinese"),
    (&["zh-tw", "chi_tra"], "Traditional Chinese"),
    (&["ko", "kor"], "Korean"),
    (&["ru", "rus"], "Russian"),
];

/// English name for a language tag, used in prompts. Unknown tags are passed
/// through as given.
pub(crate) fn language_name(tag: &str) -> String {
    let lower = tag.trim().to_lowercase();
    LANGUAGE_NAMES
        .iter()
        .find(|(tags, _)| tags.contains(&lower.as_str()))
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| tag.trim().to_string())
}
