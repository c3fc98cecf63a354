use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::error::ProviderError;

pub(crate) const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);
pub(crate) const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(60);
const ERROR_BODY_LIMIT: usize = 300;

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    None
}

/// Doubles the current cooldown, starting from the base delay and capped at
/// the maximum.
pub(crate) fn next_delay(current: Duration) -> Duration {
    let next_secs = current
        .as_secs()
        .saturating_mul(2)
        .max(RATE_LIMIT_BASE_DELAY.as_secs());
    let next = Duration::from_secs(next_secs);
    if next > RATE_LIMIT_MAX_DELAY {
        RATE_LIMIT_MAX_DELAY
    } else {
        next
    }
}

/// Cooldown to apply after a rate-limited response.
pub(crate) fn cooldown_after(current: Duration, retry_after: Option<Duration>) -> Duration {
    let doubled = next_delay(current);
    let wait = match retry_after {
        Some(requested) if requested > doubled => requested,
        _ => doubled,
    };
    wait.min(RATE_LIMIT_MAX_DELAY)
}

/// Reads a response body and maps non-success statuses to provider errors.
pub(crate) async fn read_success_body(
    response: reqwest::Response,
) -> Result<String, ProviderError> {
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let text = response.text().await.unwrap_or_default();
    if status.is_success() {
        return Ok(text);
    }
    if is_rate_limited(status, &text) {
        return Err(ProviderError::RateLimited {
            status: status.as_u16(),
            retry_after,
        });
    }
    Err(ProviderError::Status {
        status: status.as_u16(),
        body: truncate(&text, ERROR_BODY_LIMIT),
    })
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(limit).collect::<String>();
    out.push('…');
    out
}
