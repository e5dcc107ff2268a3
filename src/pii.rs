//! PII redaction for message text.
//!
//! The filter is a pure text transform. When enabled it runs an ordered list
//! of independent rules over the text; each rule sees the output of the rules
//! before it, so the first rule to claim an overlapping span wins.

use std::borrow::Cow;

use regex::Regex;

use crate::error::{GatewayError, Result};

/// How PII filtering is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiMode {
    /// Text passes through untouched
    Disabled,
    /// Pattern-based redaction
    Regex,
}

impl PiiMode {
    /// Parse the configured mode. Empty disables filtering; unknown modes
    /// also disable filtering.
    #[must_use]
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "regex" => Self::Regex,
            "" => Self::Disabled,
            other => {
                tracing::warn!(mode = other, "Unknown PII filter mode, filtering disabled");
                Self::Disabled
            },
        }
    }
}

struct RedactionRule {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

/// Rule table, in application order.
const RULES: &[(&str, &str, &str)] = &[
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b", "[REDACTED-SSN]"),
    ("credit_card", r"\b(?:\d{4}[- ]?){3,4}\d{1,4}\b", "[REDACTED-CC]"),
    (
        "bank_account",
        r"(?i)\b(?:account|acct)\.?\s*#?\s*\d{8,17}\b",
        "[REDACTED-ACCOUNT]",
    ),
    ("routing_number", r"(?i)\b(?:routing|aba)\.?\s*#?\s*\d{9}\b", "[REDACTED-ROUTING]"),
    (
        "password",
        r"(?i)\b(?:password|passwd|pwd|pin|passcode)[:\s]+\S+",
        "[REDACTED-PASSWORD]",
    ),
    (
        "api_key",
        r"(?i)\b(?:api[_-]?key|token|secret|bearer)[:\s]+[A-Za-z0-9_\-]{20,}\b",
        "[REDACTED-KEY]",
    ),
];

/// Stateless PII filter.
pub struct PiiFilter {
    mode: PiiMode,
    rules: Vec<RedactionRule>,
}

impl std::fmt::Debug for PiiFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiiFilter")
            .field("mode", &self.mode)
            .field("rules", &self.rules.iter().map(|r| r.name).collect::<Vec<_>>())
            .finish()
    }
}

impl PiiFilter {
    /// Create a filter for the given mode
    pub fn new(mode: PiiMode) -> Result<Self> {
        let rules = RULES
            .iter()
            .map(|&(name, pattern, replacement)| {
                Regex::new(pattern)
                    .map(|pattern| RedactionRule {
                        name,
                        pattern,
                        replacement,
                    })
                    .map_err(|e| GatewayError::Config(format!("Failed to compile {name} PII pattern: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { mode, rules })
    }

    /// A filter that never changes text.
    pub fn disabled() -> Result<Self> {
        Self::new(PiiMode::Disabled)
    }

    /// The active mode.
    #[must_use]
    pub const fn mode(&self) -> PiiMode {
        self.mode
    }

    /// Filter optional text. `None` stays `None`.
    #[must_use]
    pub fn filter(&self, text: Option<&str>) -> Option<String> {
        text.map(|t| self.filter_text(t).into_owned())
    }

    /// Filter text, borrowing when nothing was redacted.
    #[must_use]
    pub fn filter_text<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if self.mode == PiiMode::Disabled || text.is_empty() {
            return Cow::Borrowed(text);
        }

        let mut redacted: Option<String> = None;
        for rule in &self.rules {
            let current = redacted.as_deref().unwrap_or(text);
            let replaced = match rule.pattern.replace_all(current, rule.replacement) {
                Cow::Borrowed(_) => continue,
                Cow::Owned(replaced) => replaced,
            };
            tracing::trace!(rule = rule.name, "PII redacted");
            redacted = Some(replaced);
        }
        redacted.map_or(Cow::Borrowed(text), Cow::Owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_filter() -> PiiFilter {
        PiiFilter::new(PiiMode::Regex).unwrap()
    }

    #[test]
    fn test_ssn_redacted() {
        let out = regex_filter().filter_text("my ssn is 123-45-6789 ok");
        assert_eq!(out, "my ssn is [REDACTED-SSN] ok");
    }

    #[test]
    fn test_credit_card_redacted() {
        let out = regex_filter().filter_text("card 4111 1111 1111 1111 thanks");
        assert_eq!(out, "card [REDACTED-CC] thanks");
    }

    #[test]
    fn test_credit_card_wins_over_account_for_bare_digits() {
        let out = regex_filter().filter_text("account 4111111111111111");
        assert_eq!(out, "account [REDACTED-CC]");
    }

    #[test]
    fn test_labeled_account_and_routing() {
        let filter = regex_filter();
        assert_eq!(filter.filter_text("acct# 12345678"), "[REDACTED-ACCOUNT]");
        assert_eq!(filter.filter_text("routing 021000021"), "[REDACTED-ROUTING]");
    }

    #[test]
    fn test_password_and_key() {
        let filter = regex_filter();
        assert_eq!(filter.filter_text("Password: hunter2 now"), "[REDACTED-PASSWORD] now");
        assert_eq!(
            filter.filter_text("token: abcdefghijklmnopqrstuvwxyz"),
            "[REDACTED-KEY]"
        );
    }

    #[test]
    fn test_disabled_is_identity() {
        let filter = PiiFilter::disabled().unwrap();
        assert_eq!(filter.filter_text("123-45-6789"), "123-45-6789");
    }

    #[test]
    fn test_none_and_empty() {
        let filter = regex_filter();
        assert_eq!(filter.filter(None), None);
        assert_eq!(filter.filter(Some("")), Some(String::new()));
    }

    #[test]
    fn test_clean_text_is_borrowed() {
        let out = regex_filter().filter_text("see you at 5pm");
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    #[test]
    fn test_mode_from_setting() {
        assert_eq!(PiiMode::from_setting("regex"), PiiMode::Regex);
        assert_eq!(PiiMode::from_setting("REGEX"), PiiMode::Regex);
        assert_eq!(PiiMode::from_setting(""), PiiMode::Disabled);
        assert_eq!(PiiMode::from_setting("presidio"), PiiMode::Disabled);
    }
}
