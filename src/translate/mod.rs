use serde::Serialize;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, ProviderError};
use crate::providers::retry::cooldown_after;
use crate::providers::{TranslationProvider, TranslationRequest};

pub const DEFAULT_FAILURE_TEXT: &str = "[translation failed]";
pub const DEFAULT_COURTESY_DELAY: Duration = Duration::from_millis(1500);

/// How the chain treats one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub timeout: Duration,
    /// Wait before every call; zero for providers that do not need spacing.
    pub courtesy_delay: Duration,
}

impl ProviderPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            courtesy_delay: Duration::ZERO,
        }
    }

    pub fn with_courtesy_delay(mut self, delay: Duration) -> Self {
        self.courtesy_delay = delay;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TranslationOutcome {
    Translated { text: String, provider: String },
    /// Nothing to translate, or source and target are the same language.
    Unchanged { text: String },
    Failed {
        sentinel: String,
        failures: Vec<ProviderFailure>,
    },
}

impl TranslationOutcome {
    /// Text to display: the translation, the untouched input or the sentinel.
    pub fn text(&self) -> &str {
        match self {
            TranslationOutcome::Translated { text, .. } => text,
            TranslationOutcome::Unchanged { text } => text,
            TranslationOutcome::Failed { sentinel, .. } => sentinel,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            TranslationOutcome::Translated { provider, .. } => Some(provider),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TranslationOutcome::Failed { .. })
    }
}

struct ProviderSlot {
    provider: Box<dyn TranslationProvider>,
    policy: ProviderPolicy,
    cooldown: Mutex<Duration>,
    disabled: OnceLock<String>,
}

impl ProviderSlot {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn wait_before_call(&self) -> Duration {
        let cooldown = self
            .cooldown
            .lock()
            .map(|value| *value)
            .unwrap_or_default();
        cooldown.max(self.policy.courtesy_delay)
    }

    fn set_cooldown(&self, value: Duration) {
        if let Ok(mut cooldown) = self.cooldown.lock() {
            *cooldown = value;
        }
    }

    fn raise_cooldown(&self, retry_after: Option<Duration>) -> Duration {
        let Ok(mut cooldown) = self.cooldown.lock() else {
            return Duration::ZERO;
        };
        *cooldown = cooldown_after(*cooldown, retry_after);
        *cooldown
    }
}

/// Ordered list of providers tried one after another until one answers.
///
/// Every provider is called at most once per request and each call is bounded
/// by its own timeout. A provider that reports itself unavailable is skipped
/// for the rest of the session; a rate-limited one waits longer before its
/// next call. When nothing answers the outcome carries the sentinel text
/// instead of an error.
pub struct TranslationChain {
    slots: Vec<ProviderSlot>,
    failure_text: String,
}

impl Default for TranslationChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationChain {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            failure_text: DEFAULT_FAILURE_TEXT.to_string(),
        }
    }

    pub fn with_failure_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.failure_text = text;
        }
        self
    }

    pub fn push(
        mut self,
        provider: impl TranslationProvider + 'static,
        policy: ProviderPolicy,
    ) -> Self {
        self.push_boxed(Box::new(provider), policy);
        self
    }

    pub fn push_boxed(&mut self, provider: Box<dyn TranslationProvider>, policy: ProviderPolicy) {
        self.slots.push(ProviderSlot {
            provider,
            policy,
            cooldown: Mutex::new(Duration::ZERO),
            disabled: OnceLock::new(),
        });
    }

    pub fn providers(&self) -> Vec<&str> {
        self.slots.iter().map(ProviderSlot::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn failure_text(&self) -> &str {
        &self.failure_text
    }

    /// Providers switched off for the session, with the reason.
    pub fn disabled_providers(&self) -> Vec<(&str, &str)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.disabled.get().map(|reason| (slot.name(), reason.as_str())))
            .collect()
    }

    pub async fn translate(&self, request: &TranslationRequest) -> TranslationOutcome {
        let text = prepare_text(&request.text);
        if text.is_empty() {
            return TranslationOutcome::Unchanged { text };
        }
        if same_language(&request.source_lang, &request.target_lang) {
            debug!("source and target are both '{}'; skipping translation", request.target_lang);
            return TranslationOutcome::Unchanged { text };
        }
        let request = TranslationRequest {
            text,
            source_lang: request.source_lang.clone(),
            target_lang: request.target_lang.clone(),
        };

        let mut failures = Vec::new();
        for slot in &self.slots {
            if let Some(reason) = slot.disabled.get() {
                failures.push(ProviderFailure {
                    provider: slot.name().to_string(),
                    reason: format!("disabled: {}", reason),
                    timed_out: false,
                });
                continue;
            }

            let wait = slot.wait_before_call();
            if !wait.is_zero() {
                debug!("waiting {:.1}s before {}", wait.as_secs_f32(), slot.name());
                sleep(wait).await;
            }

            let result = match timeout(slot.policy.timeout, slot.provider.translate(&request)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
                Ok(Ok(_)) => Err(ProviderError::Malformed("empty translation".to_string())),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ProviderError::Timeout(slot.policy.timeout)),
            };

            match result {
                Ok(text) => {
                    slot.set_cooldown(Duration::ZERO);
                    info!("translated {} chars with {}", text.chars().count(), slot.name());
                    return TranslationOutcome::Translated {
                        text,
                        provider: slot.name().to_string(),
                    };
                }
                Err(err) => {
                    if err.disables_provider() {
                        warn!("{} disabled for this session: {}", slot.name(), err);
                        let _ = slot.disabled.set(err.to_string());
                    } else if let ProviderError::RateLimited { retry_after, .. } = &err {
                        let cooldown = slot.raise_cooldown(*retry_after);
                        warn!(
                            "{} rate limited; next call waits {:.1}s",
                            slot.name(),
                            cooldown.as_secs_f32()
                        );
                    } else {
                        warn!("{} failed: {}", slot.name(), err);
                    }
                    failures.push(ProviderFailure {
                        provider: slot.name().to_string(),
                        reason: err.to_string(),
                        timed_out: matches!(err, ProviderError::Timeout(_)),
                    });
                }
            }
        }

        warn!("all translation providers failed");
        TranslationOutcome::Failed {
            sentinel: self.failure_text.clone(),
            failures,
        }
    }

    /// Same as [`translate`](Self::translate) but reports total failure as an
    /// error. A lone timeout is reported as such.
    pub async fn translate_strict(&self, request: &TranslationRequest) -> Result<String, PipelineError> {
        match self.translate(request).await {
            TranslationOutcome::Translated { text, .. } | TranslationOutcome::Unchanged { text } => Ok(text),
            TranslationOutcome::Failed { failures, .. } => {
                if let [only] = failures.as_slice()
                    && only.timed_out
                {
                    let after = self
                        .slots
                        .iter()
                        .find(|slot| slot.name() == only.provider)
                        .map(|slot| slot.policy.timeout)
                        .unwrap_or_default();
                    return Err(PipelineError::ProviderTimeout {
                        provider: only.provider.clone(),
                        after,
                    });
                }
                Err(PipelineError::AllTranslationProvidersFailed {
                    failures: failures
                        .into_iter()
                        .map(|failure| format!("{}: {}", failure.provider, failure.reason))
                        .collect(),
                })
            }
        }
    }
}

/// Trims each line and collapses runs of blanks. Line breaks survive.
pub fn prepare_text(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn same_language(source: &str, target: &str) -> bool {
    let primary = |tag: &str| {
        tag.trim()
            .to_lowercase()
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_string()
    };
    let source = primary(source);
    !source.is_empty() && source != "auto" && source == primary(target)
}
