//! Text search over plain-text history and URL extraction over messages.
//!
//! Search reads `imsg history` without `--json`, which is much faster for
//! large scans. Each line has the shape
//! `2026-01-31T12:25:21.879Z [recv] +15551234567: message text`; attachment
//! markers such as `(2 attachments)` sit on their own lines and are skipped.

use regex::Regex;

use crate::error::{GatewayError, Result};
use crate::metrics::MetricsCollector;
use crate::models::{ExtractedLink, Message};
use crate::normalizer::{clean_text, parse_datetime, MessageNormalizer};

const TEXT_LINE_PATTERN: &str = r"^(\d{4}-\d{2}-\d{2}T[\d:.]+Z)\s+\[(sent|recv)\]\s+([^:]+):\s*(.*)$";

const URL_PATTERN: &str = r#"(?i)https?://(?:[\w-]+\.)+[\w-]+(?:/[^\s<>"'\)\]]*)?"#;

/// Characters of context kept on each side of a link.
pub const DEFAULT_CONTEXT_CHARS: usize = 50;

/// Context length used when the link cannot be located in the text.
const FALLBACK_CONTEXT_CHARS: usize = 100;

/// Sender recorded on links from outgoing messages.
pub const SENDER_ME: &str = "me";

/// Substring search and link extraction.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    normalizer: MessageNormalizer,
    line_pattern: Regex,
    url_pattern: Regex,
    metrics: MetricsCollector,
}

impl SearchEngine {
    /// Create an engine that sanitizes parsed text with `normalizer`.
    pub fn new(normalizer: MessageNormalizer) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| GatewayError::Config(format!("Failed to compile search pattern: {e}")))
        };
        Ok(Self {
            normalizer,
            line_pattern: compile(TEXT_LINE_PATTERN)?,
            url_pattern: compile(URL_PATTERN)?,
            metrics: MetricsCollector::default(),
        })
    }

    /// Parse one plain-text history line. The line index doubles as the
    /// message id, since the text output carries no row ids.
    #[must_use]
    pub fn parse_text_line(&self, line: &str, chat_id: i64, line_idx: usize) -> Option<Message> {
        let caps = self.line_pattern.captures(line)?;
        let (date, direction, sender, text) = (&caps[1], &caps[2], &caps[3], &caps[4]);

        Some(Message {
            id: i64::try_from(line_idx).ok(),
            chat_id,
            guid: format!("search-{chat_id}-{line_idx}"),
            reply_to_guid: None,
            sender: Some(sender.trim().to_string()),
            is_from_me: direction == "sent",
            text: Some(self.normalizer.sanitize(text)),
            created_at: parse_datetime(date).unwrap_or_else(chrono::Utc::now),
            attachments: Vec::new(),
            reactions: None,
        })
    }

    /// Scan plain-text history for a case-insensitive substring, in output
    /// order, stopping after `result_limit` matches.
    #[must_use]
    pub fn scan_history(&self, output: &str, thread_id: i64, query: &str, result_limit: usize) -> Vec<Message> {
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        let mut line_idx = 0;

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('(') {
                continue;
            }

            // cheap pre-filter on the raw line
            if !line.to_lowercase().contains(&needle) {
                line_idx += 1;
                continue;
            }

            // match again after cleaning and redaction
            if let Some(message) = self.parse_text_line(line, thread_id, line_idx) {
                let verified = message
                    .text
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle));
                if verified {
                    matches.push(message);
                    if matches.len() >= result_limit {
                        line_idx += 1;
                        break;
                    }
                }
            }

            line_idx += 1;
        }

        tracing::debug!(thread_id, scanned = line_idx, matched = matches.len(), "Search scan finished");
        self.metrics.record_search(line_idx, matches.len());
        matches
    }

    /// All http(s) URLs in `text`, after invisible characters are removed.
    #[must_use]
    pub fn extract_urls(&self, text: &str) -> Vec<String> {
        let cleaned = clean_text(text);
        self.url_pattern
            .find_iter(&cleaned)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Collect links from messages, most recent first.
    ///
    /// `messages` is expected oldest first, as history returns it.
    /// `from_me` restricts to outgoing (`Some(true)`) or incoming
    /// (`Some(false)`) messages.
    #[must_use]
    pub fn collect_links(&self, messages: &[Message], limit: usize, from_me: Option<bool>) -> Vec<ExtractedLink> {
        let mut links = Vec::new();

        'messages: for message in messages.iter().rev() {
            if links.len() >= limit {
                break;
            }
            if from_me.is_some_and(|wanted| wanted != message.is_from_me) {
                continue;
            }
            let Some(text) = message.text.as_deref().filter(|t| !t.is_empty()) else {
                continue;
            };

            for url in self.extract_urls(text) {
                if links.len() >= limit {
                    break 'messages;
                }
                let sender = if message.is_from_me {
                    Some(SENDER_ME.to_string())
                } else {
                    message.sender.clone()
                };
                links.push(ExtractedLink {
                    context: Some(link_context(text, &url, DEFAULT_CONTEXT_CHARS)),
                    url,
                    message_id: message.id,
                    sender,
                    sent_at: message.created_at,
                });
            }
        }

        self.metrics.record_links(links.len());
        links
    }
}

/// Text around the first occurrence of `url`, `width` characters each side,
/// with `...` where the text was cut.
#[must_use]
pub fn link_context(text: &str, url: &str, width: usize) -> String {
    let cleaned = clean_text(text);
    let Some(byte_idx) = cleaned.find(url) else {
        return cleaned.chars().take(FALLBACK_CONTEXT_CHARS).collect();
    };

    let chars: Vec<char> = cleaned.chars().collect();
    let url_start = cleaned[..byte_idx].chars().count();
    let start = url_start.saturating_sub(width);
    let end = (url_start + url.chars().count() + width).min(chars.len());

    let mut context: String = chars[start..end].iter().collect();
    if start > 0 {
        context.insert_str(0, "...");
    }
    if end < chars.len() {
        context.push_str("...");
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pii::{PiiFilter, PiiMode};
    use std::sync::Arc;

    fn engine() -> SearchEngine {
        let pii = Arc::new(PiiFilter::new(PiiMode::Regex).unwrap());
        SearchEngine::new(MessageNormalizer::new(pii)).unwrap()
    }

    #[test]
    fn test_parse_text_line() {
        let msg = engine()
            .parse_text_line("2026-01-31T12:25:21.879Z [recv] +15551234567: see you soon", 4, 12)
            .unwrap();
        assert_eq!(msg.id, Some(12));
        assert_eq!(msg.guid, "search-4-12");
        assert_eq!(msg.sender.as_deref(), Some("+15551234567"));
        assert_eq!(msg.text.as_deref(), Some("see you soon"));
        assert!(!msg.is_from_me);
    }

    #[test]
    fn test_parse_text_line_rejects_malformed() {
        assert!(engine().parse_text_line("not a history line", 1, 0).is_none());
    }

    #[test]
    fn test_scan_skips_attachment_lines_and_counts_indices() {
        let output = "\
2026-01-01T00:00:00Z [recv] +1555: hello there
  (1 attachment)
2026-01-01T00:01:00Z [sent] me: nothing here
2026-01-01T00:02:00Z [recv] +1555: Hello again
";
        let matches = engine().scan_history(output, 2, "hello", 10);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, Some(0));
        assert_eq!(matches[1].id, Some(2));
    }

    #[test]
    fn test_scan_reverifies_after_redaction() {
        let output = "2026-01-01T00:00:00Z [recv] +1555: my ssn 123-45-6789\n";
        assert!(engine().scan_history(output, 1, "123-45", 10).is_empty());
    }

    #[test]
    fn test_extract_urls() {
        let urls = engine().extract_urls("a https://example.com/x?y=1 and (http://foo.org) 'https://bar.io/p'");
        assert_eq!(urls, vec!["https://example.com/x?y=1", "http://foo.org", "https://bar.io/p"]);
    }

    #[test]
    fn test_link_context_short_text_has_no_ellipsis() {
        let ctx = link_context("check out https://example.com/page for details", "https://example.com/page", 50);
        assert_eq!(ctx, "check out https://example.com/page for details");
    }

    #[test]
    fn test_link_context_missing_url_falls_back_to_prefix() {
        let text = "x".repeat(150);
        assert_eq!(link_context(&text, "https://nowhere.example", 50).len(), 100);
    }
}
