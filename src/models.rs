//! Data models for threads, messages and contacts
//!
//! Threads, messages and attachments are recomputed from the `imsg` CLI on
//! every request. Contacts are owned by [`crate::contacts::ContactCache`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attachment metadata on a message. Every field is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment filename
    pub filename: Option<String>,
    /// Name used while the file was transferred
    pub transfer_name: Option<String>,
    /// Uniform Type Identifier
    pub uti: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// File size in bytes
    pub total_bytes: Option<u64>,
    /// Whether the attachment is a sticker
    pub is_sticker: bool,
    /// Original path on disk
    pub original_path: Option<String>,
    /// Whether the file is missing on disk
    pub missing: bool,
}

/// Participant in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Phone number, email or service handle
    pub handle: String,
    /// Display name if available
    pub display_name: Option<String>,
}

/// A message thread (chat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    /// Thread id (imsg chat id)
    pub id: i64,
    /// Display name if available
    pub name: Option<String>,
    /// Thread identifier string
    pub identifier: Option<String>,
    /// Service: `imessage`, `sms` or `auto`
    pub service: Option<String>,
    /// When the last message was sent
    pub last_message_at: Option<DateTime<Utc>>,
    /// Thread participants
    pub participants: Vec<Participant>,
}

/// A single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message row id
    pub id: Option<i64>,
    /// Thread id this message belongs to (valid within one result set)
    pub chat_id: i64,
    /// Message GUID
    pub guid: String,
    /// GUID of the message being replied to
    pub reply_to_guid: Option<String>,
    /// Sender handle
    pub sender: Option<String>,
    /// Whether the local user sent this message
    pub is_from_me: bool,
    /// Cleaned and PII-filtered text
    pub text: Option<String>,
    /// When the message was created
    pub created_at: DateTime<Utc>,
    /// Attachments
    pub attachments: Vec<Attachment>,
    /// Reaction metadata, passed through untouched
    pub reactions: Option<serde_json::Value>,
}

/// A URL found in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLink {
    /// The URL
    pub url: String,
    /// Id of the message containing the link
    pub message_id: Option<i64>,
    /// Sender handle, or `"me"` for outgoing messages
    pub sender: Option<String>,
    /// When the message was sent
    pub sent_at: DateTime<Utc>,
    /// Text surrounding the link
    pub context: Option<String>,
}

/// A contact in the resolution cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Contact UUID
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Phone numbers as supplied
    #[serde(default)]
    pub phones: BTreeSet<String>,
    /// Email addresses as supplied
    #[serde(default)]
    pub emails: BTreeSet<String>,
    /// Nicknames and aliases
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    /// Last update time
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Contact {
    /// Create a contact with a fresh identifier.
    #[must_use]
    pub fn new(data: ContactUpsert) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: data.name.filter(|n| !n.trim().is_empty()),
            phones: data.phones.into_iter().collect(),
            emails: data.emails.into_iter().collect(),
            aliases: data.aliases.into_iter().collect(),
            updated_at: now,
            created_at: now,
        }
    }

    /// Merge an upsert into this contact. A non-empty new name wins; all
    /// sets are unioned.
    pub fn merge(&mut self, data: ContactUpsert) {
        if let Some(name) = data.name.filter(|n| !n.trim().is_empty()) {
            self.name = Some(name);
        }
        self.phones.extend(data.phones);
        self.emails.extend(data.emails);
        self.aliases.extend(data.aliases);
        self.updated_at = Utc::now();
    }

    /// The handle to address this contact by: first phone, else first email.
    #[must_use]
    pub fn preferred_handle(&self) -> Option<&str> {
        self.phones
            .iter()
            .next()
            .or_else(|| self.emails.iter().next())
            .map(String::as_str)
    }

    /// Name for display in candidate lists.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// Input for creating or updating a contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactUpsert {
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Phone numbers
    #[serde(default)]
    pub phones: Vec<String>,
    /// Email addresses
    #[serde(default)]
    pub emails: Vec<String>,
    /// Nicknames and aliases
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Outcome of resolving a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContactResolution {
    /// Exactly one contact matched
    Ok {
        /// The matched contact
        contact: Contact,
    },
    /// Several contacts matched at the same precedence tier
    Ambiguous {
        /// All matches at that tier
        candidates: Vec<Contact>,
    },
    /// Nothing matched
    NotFound,
}

impl ContactResolution {
    /// Status string: `ok`, `ambiguous` or `not_found`.
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Ok { .. } => "ok",
            Self::Ambiguous { .. } => "ambiguous",
            Self::NotFound => "not_found",
        }
    }
}

/// History query for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Thread id
    pub thread_id: i64,
    /// Maximum messages to return
    pub limit: usize,
    /// Start of time range
    pub start: Option<DateTime<Utc>>,
    /// End of time range
    pub end: Option<DateTime<Utc>>,
    /// Only messages involving these handles
    pub participants: Vec<String>,
    /// Include attachment metadata
    pub include_attachments: bool,
}

impl HistoryQuery {
    /// A plain query for the most recent `limit` messages in a thread.
    #[must_use]
    pub const fn new(thread_id: i64, limit: usize) -> Self {
        Self {
            thread_id,
            limit,
            start: None,
            end: None,
            participants: Vec::new(),
            include_attachments: false,
        }
    }
}

/// Full-text search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Case-insensitive substring to find
    pub query: String,
    /// Thread to search
    pub thread_id: Option<i64>,
    /// Recipient whose thread to search, when no thread id is given
    pub recipient: Option<String>,
    /// Maximum history lines to scan
    pub scan_limit: usize,
    /// Maximum matches to return
    pub result_limit: usize,
    /// Start of time range
    pub start: Option<DateTime<Utc>>,
    /// End of time range
    pub end: Option<DateTime<Utc>>,
}

/// Link extraction request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    /// Thread to scan
    pub thread_id: Option<i64>,
    /// Recipient whose thread to scan, when no thread id is given
    pub recipient: Option<String>,
    /// Maximum links to return
    pub limit: usize,
    /// Maximum messages to scan
    pub message_limit: usize,
    /// `Some(true)` only my links, `Some(false)` only theirs
    pub from_me: Option<bool>,
    /// Start of time range
    pub start: Option<DateTime<Utc>>,
    /// End of time range
    pub end: Option<DateTime<Utc>>,
}

/// Live watch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
    /// Thread to watch
    pub thread_id: i64,
    /// Only messages after this row id
    pub since_rowid: Option<i64>,
    /// Debounce interval in milliseconds
    pub debounce_ms: u64,
    /// Include attachment metadata
    pub include_attachments: bool,
}

/// Outgoing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSend {
    /// Recipient phone number, email or contact name
    pub to: String,
    /// Message text
    pub text: Option<String>,
    /// Absolute paths of files to attach
    #[serde(default)]
    pub files: Vec<String>,
    /// `imessage`, `sms` or `auto`
    #[serde(default = "default_service")]
    pub service: String,
    /// Region for phone number normalization by the CLI
    pub region: Option<String>,
}

fn default_service() -> String {
    "auto".to_string()
}

/// Result of a send or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    /// Whether the send succeeded
    pub ok: bool,
    /// Recipient
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Command that was or would be executed (dry run)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Error message if the send failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    /// A failed outcome carrying a message.
    #[must_use]
    pub fn failed(to: Option<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            to,
            command: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(name: Option<&str>, phones: &[&str]) -> ContactUpsert {
        ContactUpsert {
            name: name.map(str::to_string),
            phones: phones.iter().map(|p| (*p).to_string()).collect(),
            ..ContactUpsert::default()
        }
    }

    #[test]
    fn test_merge_keeps_name_when_new_is_blank() {
        let mut contact = Contact::new(upsert(Some("Alice"), &["+15551234567"]));
        contact.merge(upsert(Some("  "), &["+15559999999"]));
        assert_eq!(contact.name.as_deref(), Some("Alice"));
        assert_eq!(contact.phones.len(), 2);
    }

    #[test]
    fn test_merge_unions_without_duplicates() {
        let mut contact = Contact::new(upsert(None, &["+15551234567"]));
        contact.merge(upsert(Some("Alice"), &["+15551234567"]));
        assert_eq!(contact.phones.len(), 1);
        assert_eq!(contact.name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_preferred_handle() {
        let mut contact = Contact::new(ContactUpsert {
            emails: vec!["a@example.com".into()],
            ..ContactUpsert::default()
        });
        assert_eq!(contact.preferred_handle(), Some("a@example.com"));
        contact.phones.insert("+15550001111".into());
        assert_eq!(contact.preferred_handle(), Some("+15550001111"));
    }

    #[test]
    fn test_resolution_serializes_with_status_tag() {
        let json = serde_json::to_value(ContactResolution::NotFound).unwrap();
        assert_eq!(json["status"], "not_found");
    }

    #[test]
    fn test_contact_deserializes_with_defaults() {
        let contact: Contact = serde_json::from_str(r#"{"id": "abc"}"#).unwrap();
        assert!(contact.name.is_none());
        assert!(contact.phones.is_empty());
    }
}
