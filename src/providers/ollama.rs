use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{ProviderFuture, TranslationProvider, TranslationRequest, language_name};
use crate::error::ProviderError;
use crate::process::command_exists;

const DEFAULT_BINARY: &str = "ollama";
pub(crate) const DEFAULT_MODEL: &str = "qwen2.5:3b";
pub(crate) const DEFAULT_PROMPT: &str = "Translate the following text from {source} to {target}. \
Reply with the translation only, in a natural and precise tone, without notes or explanations.\n\n{text}";

/// Local model run through `ollama run <model> <prompt>`.
#[derive(Debug, Clone)]
pub struct Ollama {
    binary: String,
    model: String,
    prompt: String,
}

impl Default for Ollama {
    fn default() -> Self {
        Self {
            binary: DEFAULT_BINARY.to_string(),
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl Ollama {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let mut ollama = Self::default();
        if !model.trim().is_empty() {
            ollama.model = model;
        }
        ollama
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        let binary = binary.into();
        if !binary.trim().is_empty() {
            self.binary = binary;
        }
        self
    }

    /// Template with `{source}`, `{target}` and `{text}` placeholders.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        if prompt.contains("{text}") {
            self.prompt = prompt;
        }
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn render_prompt(&self, request: &TranslationRequest) -> String {
        self.prompt
            .replace("{source}", &language_name(&request.source_lang))
            .replace("{target}", &language_name(&request.target_lang))
            .replace("{text}", &request.text)
    }

    async fn call(&self, request: &TranslationRequest) -> Result<String, ProviderError> {
        if !command_exists(&self.binary) {
            return Err(ProviderError::Unavailable(format!(
                "{} was not found on PATH",
                self.binary
            )));
        }
        debug!("ollama: running {} with {}", self.binary, self.model);
        let output = Command::new(&self.binary)
            .arg("run")
            .arg(&self.model)
            .arg(self.render_prompt(request))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    ProviderError::Unavailable(format!("{} is not installed", self.binary))
                } else {
                    ProviderError::Process {
                        code: None,
                        stderr: err.to_string(),
                    }
                }
            })?;

        if !output.status.success() {
            return Err(ProviderError::Process {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let text = clean_output(&String::from_utf8_lossy(&output.stdout));
        if text.is_empty() {
            return Err(ProviderError::Malformed(
                "ollama produced no output".to_string(),
            ));
        }
        Ok(text)
    }
}

impl TranslationProvider for Ollama {
    fn name(&self) -> &str {
        "ollama"
    }

    fn translate<'a>(&'a self, request: &'a TranslationRequest) -> ProviderFuture<'a> {
        Box::pin(self.call(request))
    }
}

/// Drops terminal control sequences the CLI emits for its spinner.
fn clean_output(stdout: &str) -> String {
    let mut out = String::with_capacity(stdout.len());
    let mut chars = stdout.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if ch.is_control() && ch != '\n' {
            continue;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_embeds_language_names_and_text() {
        let ollama = Ollama::new("llama3").with_prompt("{source}>{target}: {text}");
        let prompt = ollama.render_prompt(&TranslationRequest::new("こんにちは", "ja", "es"));
        assert_eq!(prompt, "Japanese>Spanish: こんにちは");
    }

    #[test]
    fn templates_without_text_are_ignored() {
        let ollama = Ollama::default().with_prompt("translate please");
        assert_eq!(ollama.prompt, DEFAULT_PROMPT);
    }

    #[test]
    fn spinner_sequences_are_removed() {
        assert_eq!(
            clean_output("\u{1b}[?25l\u{1b}[2K\rHola mundo\n\u{1b}[?25h"),
            "Hola mundo"
        );
    }

    #[tokio::test]
    async fn missing_binary_disables_provider() {
        let ollama = Ollama::default().with_binary("definitely-not-ollama-7f1e");
        let err = ollama
            .translate(&TranslationRequest::new("hi", "en", "es"))
            .await
            .unwrap_err();
        assert!(err.disables_provider());
    }
}
