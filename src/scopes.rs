//! Scope string validation and the small rules that govern scope sets.
//!
//! Scope names are restricted to the OAuth scope-token character set.
//! The `email` scope discloses address data from a stored h-card, so it
//! is never honoured without `profile`.

use tracing::debug;

/// A scope name is a non-empty string of characters from
/// {0x21, 0x23..=0x5B, 0x5D..=0x7E}: printable ASCII minus space, `"`, `\`.
pub fn scope_valid(scope: &str) -> bool {
    !scope.is_empty()
        && scope.bytes().all(|b| {
            b == 0x21 || (0x23..=0x5b).contains(&b) || (0x5d..=0x7e).contains(&b)
        })
}

/// Split a space-separated scope string, silently dropping invalid
/// tokens and duplicates. Order of first occurrence is preserved.
pub fn split_scope_string(raw: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for token in raw.split_ascii_whitespace() {
        if !scope_valid(token) {
            debug!(scope = %token, "dropping invalid scope token");
            continue;
        }
        if !seen.iter().any(|s: &String| s == token) {
            seen.push(token.to_string());
        }
    }
    seen
}

/// Filter a list of individually-submitted scopes (consent checkboxes or
/// ad-hoc entries), dropping invalid names and duplicates.
pub fn filter_scopes(raw: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for token in raw {
        if !scope_valid(token) {
            debug!(scope = %token, "dropping invalid scope");
            continue;
        }
        if !seen.iter().any(|s| s == token) {
            seen.push(token.clone());
        }
    }
    seen
}

/// Enforce the email-requires-profile rule on an accepted scope set.
/// Returns true when `email` was removed.
pub fn strip_email_without_profile(scopes: &mut Vec<String>) -> bool {
    if scopes.iter().any(|s| s == "email") && !scopes.iter().any(|s| s == "profile") {
        scopes.retain(|s| s != "email");
        return true;
    }
    false
}

/// True when a requested scope set violates the email-requires-profile
/// rule. Requests are refused rather than silently narrowed; only the
/// consent form gets the silent treatment.
pub fn email_without_profile(scopes: &[String]) -> bool {
    scopes.iter().any(|s| s == "email") && !scopes.iter().any(|s| s == "profile")
}
