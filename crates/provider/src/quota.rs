//! Quota and credential-failure detection for Gemini API responses
//!
//! Gemini reports throttling as HTTP 429 with `RESOURCE_EXHAUSTED`, and invalid
//! keys as 400 `INVALID_ARGUMENT` with an `API_KEY_INVALID` reason (or 401/403).
//! Classification is done once here, from status and body, so every call site
//! agrees on what counts as a quota error.

use crate::ErrorClassification;

/// Upstream bodies are cut to this many characters in error messages.
pub const ERROR_BODY_LIMIT: usize = 500;

/// Body fragments that mean the key's allowance is used up.
const QUOTA_PATTERNS: &[&str] = &[
    "resource_exhausted",
    "resource has been exhausted",
    "quota exceeded",
    "exceeded your current quota",
    "rate limit",
];

/// Body fragments that mean the key itself is unusable.
const INVALID_KEY_PATTERNS: &[&str] = &[
    "api_key_invalid",
    "api key not valid",
    "api key expired",
    "permission_denied",
];

/// Classify a response body on its own, independent of status.
///
/// Returns `None` when the body says nothing recognisable.
pub fn classify_body(body: &str) -> Option<ErrorClassification> {
    let lower = body.to_lowercase();
    if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorClassification::QuotaExceeded);
    }
    if INVALID_KEY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorClassification::Permanent);
    }
    None
}

/// Classify an upstream error by HTTP status and response body.
///
/// 429 is always a quota error. 401/403 are Permanent. Any other status
/// defers to the body (a 400 carrying `API_KEY_INVALID` is Permanent) and
/// falls back to Transient.
pub fn classify_status(status: u16, body: &str) -> ErrorClassification {
    match status {
        429 => ErrorClassification::QuotaExceeded,
        401 | 403 => ErrorClassification::Permanent,
        _ => classify_body(body).unwrap_or(ErrorClassification::Transient),
    }
}

/// Cut an upstream body down for inclusion in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
