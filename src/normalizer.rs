//! Normalization of raw CLI records into the canonical model.
//!
//! `imsg` has emitted several JSON shapes over its versions (camelCase,
//! snake_case, alternate key names). Each canonical field has a fixed alias
//! list, tried in order; the first key that is present with a usable value
//! wins. Nothing here infers schema from the data.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::models::{Attachment, Message, Participant, Thread};
use crate::pii::PiiFilter;

/// Code points stripped from message text before anything else sees it.
pub const INVISIBLE_CHARS: &[char] = &[
    '\u{0000}', // null
    '\u{FFFC}', // object replacement
    '\u{FFFD}', // replacement character
    '\u{200B}', // zero-width space
    '\u{200C}', // zero-width non-joiner
    '\u{200D}', // zero-width joiner
    '\u{FEFF}', // byte-order mark
];

/// Field alias tables, tried left to right.
pub mod fields {
    /// Message row id
    pub const MESSAGE_ID: &[&str] = &["id", "rowid"];
    /// Message thread id
    pub const CHAT_ID: &[&str] = &["chatId", "chat_id"];
    /// Message GUID
    pub const GUID: &[&str] = &["guid"];
    /// Reply target GUID
    pub const REPLY_TO_GUID: &[&str] = &["replyToGuid", "reply_to_guid"];
    /// Sender handle
    pub const SENDER: &[&str] = &["sender", "handle"];
    /// Direction flag
    pub const IS_FROM_ME: &[&str] = &["isFromMe", "is_from_me"];
    /// Message body
    pub const TEXT: &[&str] = &["text"];
    /// Message timestamp
    pub const CREATED_AT: &[&str] = &["date", "created_at"];
    /// Attachment list
    pub const ATTACHMENTS: &[&str] = &["attachments"];
    /// Reaction metadata
    pub const REACTIONS: &[&str] = &["reactions"];

    /// Thread id
    pub const THREAD_ID: &[&str] = &["id"];
    /// Thread display name
    pub const THREAD_NAME: &[&str] = &["displayName", "name"];
    /// Thread identifier string
    pub const THREAD_IDENTIFIER: &[&str] = &["identifier"];
    /// Thread service
    pub const THREAD_SERVICE: &[&str] = &["service"];
    /// Thread last activity
    pub const LAST_MESSAGE_AT: &[&str] = &["lastMessageDate", "last_message_at"];
    /// Thread participants
    pub const PARTICIPANTS: &[&str] = &["participants"];

    /// Participant handle
    pub const HANDLE: &[&str] = &["handle", "id"];
    /// Participant display name
    pub const DISPLAY_NAME: &[&str] = &["displayName", "display_name"];

    /// Attachment filename
    pub const FILENAME: &[&str] = &["filename"];
    /// Attachment transfer name
    pub const TRANSFER_NAME: &[&str] = &["transferName", "transfer_name"];
    /// Attachment UTI
    pub const UTI: &[&str] = &["uti"];
    /// Attachment MIME type
    pub const MIME_TYPE: &[&str] = &["mimeType", "mime_type"];
    /// Attachment size
    pub const TOTAL_BYTES: &[&str] = &["totalBytes", "total_bytes"];
    /// Sticker flag
    pub const IS_STICKER: &[&str] = &["isSticker", "is_sticker"];
    /// Attachment path
    pub const ORIGINAL_PATH: &[&str] = &["originalPath", "original_path"];
    /// Missing flag
    pub const MISSING: &[&str] = &["missing"];
}

/// One JSON object from CLI output, with typed field extractors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    /// Wrap a JSON object.
    #[must_use]
    pub const fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap any JSON value; non-objects yield `None`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    fn first<T>(&self, aliases: &[&str], extract: impl Fn(&Value) -> Option<T>) -> Option<T> {
        aliases
            .iter()
            .filter_map(|key| self.0.get(*key))
            .find_map(extract)
    }

    /// First alias holding a non-empty string.
    #[must_use]
    pub fn string(&self, aliases: &[&str]) -> Option<String> {
        self.first(aliases, |v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
    }

    /// First alias holding a string, empty strings included.
    #[must_use]
    pub fn raw_string(&self, aliases: &[&str]) -> Option<String> {
        self.first(aliases, |v| v.as_str().map(str::to_string))
    }

    /// First alias holding an integer, or a string that parses as one.
    #[must_use]
    pub fn integer(&self, aliases: &[&str]) -> Option<i64> {
        self.first(aliases, |v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// First alias holding a boolean (or 0/1).
    #[must_use]
    pub fn boolean(&self, aliases: &[&str]) -> Option<bool> {
        self.first(aliases, |v| match v {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            _ => None,
        })
    }

    /// First alias holding a parseable timestamp.
    #[must_use]
    pub fn datetime(&self, aliases: &[&str]) -> Option<DateTime<Utc>> {
        self.first(aliases, |v| v.as_str().and_then(parse_datetime))
    }

    /// First alias holding an array.
    #[must_use]
    pub fn array(&self, aliases: &[&str]) -> Option<&Vec<Value>> {
        aliases
            .iter()
            .filter_map(|key| self.0.get(*key))
            .find_map(Value::as_array)
    }

    /// First alias holding any non-null value.
    #[must_use]
    pub fn value(&self, aliases: &[&str]) -> Option<Value> {
        self.first(aliases, |v| (!v.is_null()).then(|| v.clone()))
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Parse an ISO-8601 timestamp. Naive timestamps are taken as UTC.
#[must_use]
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Format a timestamp the way `imsg` expects it: UTC, second precision, `Z`.
#[must_use]
pub fn format_cli_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Remove invisible and replacement characters, then trim.
#[must_use]
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| !INVISIBLE_CHARS.contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Turns raw records into messages, threads and attachments.
#[derive(Debug, Clone)]
pub struct MessageNormalizer {
    pii: Arc<PiiFilter>,
}

impl MessageNormalizer {
    /// Create a normalizer applying the given PII filter to message text
    #[must_use]
    pub const fn new(pii: Arc<PiiFilter>) -> Self {
        Self { pii }
    }

    /// Clean and PII-filter a piece of message text.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> String {
        let cleaned = clean_text(text);
        self.pii.filter_text(&cleaned).into_owned()
    }

    /// Normalize one message record. Missing timestamps default to now.
    #[must_use]
    pub fn message(&self, record: &RawRecord) -> Message {
        let attachments = record
            .array(fields::ATTACHMENTS)
            .map(|items| items.iter().filter_map(|v| v.as_object()).map(attachment_from_map).collect())
            .unwrap_or_default();

        Message {
            id: record.integer(fields::MESSAGE_ID),
            chat_id: record.integer(fields::CHAT_ID).unwrap_or(0),
            guid: record.string(fields::GUID).unwrap_or_default(),
            reply_to_guid: record.string(fields::REPLY_TO_GUID),
            sender: record.string(fields::SENDER),
            is_from_me: record.boolean(fields::IS_FROM_ME).unwrap_or(false),
            text: record.raw_string(fields::TEXT).map(|t| self.sanitize(&t)),
            created_at: record.datetime(fields::CREATED_AT).unwrap_or_else(Utc::now),
            attachments,
            reactions: record.value(fields::REACTIONS),
        }
    }

    /// Normalize a batch of message records.
    #[must_use]
    pub fn messages(&self, records: &[RawRecord]) -> Vec<Message> {
        records.iter().map(|r| self.message(r)).collect()
    }

    /// Normalize one thread record.
    #[must_use]
    pub fn thread(&self, record: &RawRecord) -> Thread {
        thread(record)
    }
}

/// Normalize one thread record. Threads carry no message text, so no
/// filtering applies.
#[must_use]
pub fn thread(record: &RawRecord) -> Thread {
    let participants = record
        .array(fields::PARTICIPANTS)
        .map(|items| items.iter().filter_map(participant).collect())
        .unwrap_or_default();

    Thread {
        id: record.integer(fields::THREAD_ID).unwrap_or(0),
        name: record.string(fields::THREAD_NAME),
        identifier: record.string(fields::THREAD_IDENTIFIER),
        service: record.string(fields::THREAD_SERVICE),
        last_message_at: record.datetime(fields::LAST_MESSAGE_AT),
        participants,
    }
}

/// A participant is either a bare handle string or an object.
#[must_use]
pub fn participant(value: &Value) -> Option<Participant> {
    match value {
        Value::String(handle) => Some(Participant {
            handle: handle.clone(),
            display_name: None,
        }),
        Value::Object(map) => {
            let record = RawRecord::new(map.clone());
            Some(Participant {
                handle: record.string(fields::HANDLE).unwrap_or_default(),
                display_name: record.string(fields::DISPLAY_NAME),
            })
        },
        _ => None,
    }
}

fn attachment_from_map(map: &Map<String, Value>) -> Attachment {
    attachment(&RawRecord::new(map.clone()))
}

/// Normalize one attachment record.
#[must_use]
pub fn attachment(record: &RawRecord) -> Attachment {
    Attachment {
        filename: record.string(fields::FILENAME),
        transfer_name: record.string(fields::TRANSFER_NAME),
        uti: record.string(fields::UTI),
        mime_type: record.string(fields::MIME_TYPE),
        total_bytes: record.integer(fields::TOTAL_BYTES).and_then(|n| u64::try_from(n).ok()),
        is_sticker: record.boolean(fields::IS_STICKER).unwrap_or(false),
        original_path: record.string(fields::ORIGINAL_PATH),
        missing: record.boolean(fields::MISSING).unwrap_or(false),
    }
}
