//! Log Redaction Layer
//!
//! Scrubs subscription keys, bearer tokens, and signed-URL secrets from strings prior to logging.

use regex::Regex;
use std::sync::LazyLock;

static SUBSCRIPTION_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(ocp-apim-subscription-key[\x22']?\s*[:=]\s*[\x22']?)[A-Za-z0-9]{16,}").unwrap()
});
static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Bearer\s+[a-zA-Z0-9\-\._~+/]+=*").unwrap());
static SAS_SIGNATURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([?&](?:sig|key|code)=)[^&\s\x22']+").unwrap());

/// Redacts sensitive patterns in a string.
pub fn redact_sensitive_data(input: &str) -> String {
    let mut redacted = input.to_string();

    // Provider subscription keys echoed back in error bodies or headers
    redacted = SUBSCRIPTION_KEY_RE
        .replace_all(&redacted, "${1}[REDACTED_KEY]")
        .to_string();

    redacted = BEARER_RE.replace_all(&redacted, "[REDACTED_TOKEN]").to_string();

    // Blob SAS signatures and function keys in image URLs
    redacted = SAS_SIGNATURE_RE
        .replace_all(&redacted, "${1}[REDACTED]")
        .to_string();

    redacted
}
