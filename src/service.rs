use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::contacts::ContactCache;
use crate::error::{ErrorKind, GatewayError, Result};
use crate::metrics::{MetricsCollector, MetricsTimer};
use crate::models::{
    ContactResolution, ExtractedLink, HistoryQuery, LinkRequest, Message, MessageSend, SearchRequest, SendOutcome,
    Thread, WatchRequest,
};
use crate::normalizer::{self, MessageNormalizer};
use crate::pii::{PiiFilter, PiiMode};
use crate::repository::{send_args, ImsgRepository, MessageRepository};
use crate::search::SearchEngine;
use crate::validation::{limits, InputValidator};
use crate::watch::MessageStream;

/// Messages scanned when looking for someone to reply to.
const REPLY_LOOKBACK: usize = 10;

/// Knobs the service needs from the application config.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Region passed to `imsg send` when a message has none
    pub default_region: String,
    /// Recent threads probed when mapping a recipient to a thread
    pub recipient_probe_threads: usize,
    /// Handles allowed as send targets; empty allows all
    pub send_allowlist: Vec<String>,
    /// Default lookback window in days
    pub days_back: u32,
}

impl ServiceSettings {
    /// Settings from the loaded application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_region: config.imsg.default_region.clone(),
            recipient_probe_threads: config.imsg.recipient_probe_threads,
            send_allowlist: config.messages.allowlist(),
            days_back: config.messages.days_back,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Whether a recipient string is already a handle rather than a name.
#[must_use]
pub fn looks_like_handle(recipient: &str) -> bool {
    recipient.contains('@') || recipient.chars().filter(char::is_ascii_digit).count() >= 7
}

/// Typed message operations over a [`MessageRepository`].
pub struct MessageService {
    repository: Arc<dyn MessageRepository>,
    normalizer: MessageNormalizer,
    search: SearchEngine,
    contacts: Arc<ContactCache>,
    settings: ServiceSettings,
    metrics: MetricsCollector,
}

impl MessageService {
    /// Service over an arbitrary repository.
    pub fn new(
        repository: Arc<dyn MessageRepository>,
        pii: Arc<PiiFilter>,
        contacts: Arc<ContactCache>,
        settings: ServiceSettings,
    ) -> Result<Self> {
        let normalizer = MessageNormalizer::new(pii);
        let search = SearchEngine::new(normalizer.clone())?;
        Ok(Self {
            repository,
            normalizer,
            search,
            contacts,
            settings,
            metrics: MetricsCollector::default(),
        })
    }

    /// Service over the real `imsg` binary.
    pub fn from_config(config: &AppConfig, contacts: Arc<ContactCache>) -> Result<Self> {
        let pii = PiiFilter::new(PiiMode::from_setting(&config.privacy.pii_filter))?;
        Self::new(
            Arc::new(ImsgRepository::from_config(&config.imsg)),
            Arc::new(pii),
            contacts,
            ServiceSettings::from_config(config),
        )
    }

    /// The shared contact cache.
    #[must_use]
    pub fn contacts(&self) -> &ContactCache {
        &self.contacts
    }

    async fn timed<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timer = MetricsTimer::new(self.metrics, operation);
        let result = fut.await;
        timer.finish(&result);
        result
    }

    /// Start of the query window: the explicit start, else `days_back`
    /// days ago (falling back to the configured default).
    #[must_use]
    pub fn effective_start(&self, start: Option<DateTime<Utc>>, days_back: Option<u32>) -> DateTime<Utc> {
        start.unwrap_or_else(|| {
            let days = days_back.unwrap_or(self.settings.days_back);
            Utc::now() - ChronoDuration::days(i64::from(days))
        })
    }

    // Threads

    /// Recent threads, most recent first.
    pub async fn list_threads(&self, limit: usize) -> Result<Vec<Thread>> {
        InputValidator::validate_range("limit", limit, limits::THREADS)?;
        self.timed("list_threads", async {
            let records = self.repository.chats(Some(limit)).await?;
            Ok(records.iter().map(normalizer::thread).collect())
        })
        .await
    }

    /// One thread by id. `imsg` cannot fetch a single chat, so this lists
    /// every chat and filters.
    pub async fn get_thread(&self, thread_id: i64) -> Result<Option<Thread>> {
        InputValidator::validate_thread_id(thread_id)?;
        self.timed("get_thread", async {
            let records = self.repository.chats(None).await?;
            Ok(records.iter().map(normalizer::thread).find(|t| t.id == thread_id))
        })
        .await
    }

    /// Map a recipient to a handle. Phone numbers and emails pass through;
    /// anything else is looked up by name in the contact cache and passes
    /// through when no contact matches.
    pub fn resolve_handle(&self, recipient: &str) -> Result<String> {
        let recipient = recipient.trim();
        if looks_like_handle(recipient) {
            return Ok(recipient.to_string());
        }

        match self.contacts.resolve(None, None, Some(recipient)) {
            ContactResolution::Ok { contact } => {
                let handle = contact.preferred_handle().unwrap_or(recipient).to_string();
                debug!(recipient, handle = %handle, "Resolved recipient from contacts");
                Ok(handle)
            },
            ContactResolution::Ambiguous { candidates } => Err(GatewayError::AmbiguousRecipient {
                recipient: recipient.to_string(),
                candidates: candidates.iter().map(|c| c.display_name()).collect(),
            }),
            ContactResolution::NotFound => Ok(recipient.to_string()),
        }
    }

    /// Id of the first recent thread that has a message with `recipient`.
    ///
    /// Only the most recent threads are probed and the first hit wins, so a
    /// recipient with several threads maps to the most recently active one.
    pub async fn find_thread_by_recipient(&self, recipient: &str) -> Result<Option<i64>> {
        InputValidator::validate_recipient(recipient)?;
        let handle = self.resolve_handle(recipient)?;

        self.timed("find_thread_by_recipient", async {
            let threads = self.repository.chats(Some(self.settings.recipient_probe_threads)).await?;

            for thread in threads.iter().map(normalizer::thread) {
                let probe = HistoryQuery {
                    participants: vec![handle.clone()],
                    ..HistoryQuery::new(thread.id, 1)
                };
                match self.repository.history(&probe).await {
                    Ok(records) if !records.is_empty() => {
                        debug!(recipient = %handle, thread_id = thread.id, "Found thread for recipient");
                        return Ok(Some(thread.id));
                    },
                    Ok(_) => {},
                    Err(e) if matches!(e.kind(), ErrorKind::ToolFailed | ErrorKind::Timeout) => {
                        warn!(thread_id = thread.id, error = %e, "Probe failed, skipping thread");
                    },
                    Err(e) => return Err(e),
                }
            }

            debug!(recipient = %handle, "No thread found for recipient");
            Ok(None)
        })
        .await
    }

    /// The thread for a recipient, if one can be found.
    pub async fn thread_for_recipient(&self, recipient: &str) -> Result<Option<Thread>> {
        match self.find_thread_by_recipient(recipient).await? {
            Some(thread_id) => self.get_thread(thread_id).await,
            None => Ok(None),
        }
    }

    async fn target_thread(&self, thread_id: Option<i64>, recipient: Option<&str>) -> Result<Option<i64>> {
        match (thread_id, recipient) {
            (Some(id), _) => Ok(Some(id)),
            (None, Some(recipient)) => self.find_thread_by_recipient(recipient).await,
            (None, None) => Ok(None),
        }
    }

    // Messages

    /// Message history for one thread, oldest first.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<Message>> {
        InputValidator::validate_thread_id(query.thread_id)?;
        InputValidator::validate_range("limit", query.limit, limits::HISTORY)?;
        InputValidator::validate_date_range(query.start, query.end)?;
        self.fetch_history("history", query).await
    }

    async fn fetch_history(&self, operation: &'static str, query: &HistoryQuery) -> Result<Vec<Message>> {
        self.timed(operation, async {
            let records = self.repository.history(query).await?;
            let messages = self.normalizer.messages(&records);
            self.metrics.record_messages_normalized(messages.len(), operation);
            Ok(messages)
        })
        .await
    }

    /// History with a recipient. `query.thread_id` is replaced by the
    /// recipient's thread; no thread yields an empty list.
    pub async fn history_by_recipient(&self, recipient: &str, query: &HistoryQuery) -> Result<Vec<Message>> {
        InputValidator::validate_range("limit", query.limit, limits::HISTORY)?;
        InputValidator::validate_date_range(query.start, query.end)?;

        let Some(thread_id) = self.find_thread_by_recipient(recipient).await? else {
            return Ok(Vec::new());
        };
        let query = HistoryQuery {
            thread_id,
            ..query.clone()
        };
        self.fetch_history("history", &query).await
    }

    /// Case-insensitive text search in one thread, in history order.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Message>> {
        InputValidator::validate_query(&request.query)?;
        InputValidator::validate_scope(request.thread_id, request.recipient.as_deref())?;
        InputValidator::validate_range("scan_limit", request.scan_limit, limits::SEARCH_SCAN)?;
        InputValidator::validate_range("result_limit", request.result_limit, limits::SEARCH_RESULTS)?;
        InputValidator::validate_date_range(request.start, request.end)?;

        let Some(thread_id) = self.target_thread(request.thread_id, request.recipient.as_deref()).await? else {
            return Ok(Vec::new());
        };

        self.timed("search", async {
            let query = HistoryQuery {
                start: request.start,
                end: request.end,
                ..HistoryQuery::new(thread_id, request.scan_limit)
            };
            let output = self.repository.history_text(&query).await?;
            let matches = self
                .search
                .scan_history(&output, thread_id, &request.query, request.result_limit);
            info!(thread_id, matches = matches.len(), "Search completed");
            Ok(matches)
        })
        .await
    }

    /// Links shared in one thread, most recent first.
    pub async fn extract_links(&self, request: &LinkRequest) -> Result<Vec<ExtractedLink>> {
        InputValidator::validate_scope(request.thread_id, request.recipient.as_deref())?;
        InputValidator::validate_range("limit", request.limit, limits::LINKS)?;
        InputValidator::validate_range("message_limit", request.message_limit, limits::LINK_SCAN)?;
        InputValidator::validate_date_range(request.start, request.end)?;

        let Some(thread_id) = self.target_thread(request.thread_id, request.recipient.as_deref()).await? else {
            return Ok(Vec::new());
        };

        let query = HistoryQuery {
            start: request.start,
            end: request.end,
            ..HistoryQuery::new(thread_id, request.message_limit)
        };
        let messages = self.fetch_history("extract_links", &query).await?;
        Ok(self.search.collect_links(&messages, request.limit, request.from_me))
    }

    /// Stream new messages from a thread until cancelled.
    pub async fn watch(&self, request: &WatchRequest) -> Result<MessageStream> {
        InputValidator::validate_thread_id(request.thread_id)?;
        InputValidator::validate_range("debounce_ms", request.debounce_ms, limits::DEBOUNCE_MS)?;

        let lines = self.repository.watch(request).await?;
        info!(thread_id = request.thread_id, pid = ?lines.id(), "Watching thread");
        Ok(MessageStream::spawn(lines, self.normalizer.clone(), request.thread_id))
    }

    // Sending

    fn check_allowlist(&self, requested: &str, handle: &str) -> Result<()> {
        let allowlist = &self.settings.send_allowlist;
        if allowlist.is_empty() || allowlist.iter().any(|a| a == requested || a == handle) {
            return Ok(());
        }
        Err(GatewayError::Validation(format!(
            "Recipient '{requested}' is not in the send allowlist"
        )))
    }

    /// Full `imsg send` command line for a message, as it would be run.
    #[must_use]
    pub fn build_send_command(&self, message: &MessageSend) -> String {
        self.repository
            .command_line(&send_args(message, &self.settings.default_region))
    }

    /// Send a message. CLI failures are reported in the outcome.
    pub async fn send(&self, message: &MessageSend, dry_run: bool) -> Result<SendOutcome> {
        InputValidator::validate_send(message)?;
        let handle = self.resolve_handle(&message.to)?;
        self.check_allowlist(&message.to, &handle)?;

        let message = MessageSend {
            to: handle,
            ..message.clone()
        };
        let command = self.build_send_command(&message);

        if dry_run {
            self.metrics.record_send(true, true);
            return Ok(SendOutcome {
                ok: true,
                to: Some(message.to),
                command: Some(command),
                error: None,
            });
        }

        debug!(command = %command, "Sending message");
        let args = send_args(&message, &self.settings.default_region);
        let result = self.timed("send", self.repository.send(&args)).await;
        self.metrics.record_send(result.is_ok(), false);

        Ok(match result {
            Ok(()) => SendOutcome {
                ok: true,
                to: Some(message.to),
                command: None,
                error: None,
            },
            Err(e) => {
                warn!(to = %message.to, error = %e, "Send failed");
                SendOutcome::failed(Some(message.to), describe_send_error(&e))
            },
        })
    }

    /// Reply in a thread, or directly to a recipient when one is given.
    ///
    /// Without a recipient, the last inbound sender among the thread's
    /// recent messages is used, then the thread's first participant.
    pub async fn reply(
        &self,
        text: &str,
        thread_id: Option<i64>,
        recipient: Option<&str>,
        dry_run: bool,
    ) -> Result<SendOutcome> {
        let reply_to = |to: String| MessageSend {
            to,
            text: Some(text.to_string()),
            files: Vec::new(),
            service: "auto".to_string(),
            region: None,
        };

        if let Some(recipient) = recipient.filter(|r| !r.trim().is_empty()) {
            return self.send(&reply_to(recipient.to_string()), dry_run).await;
        }

        let Some(thread_id) = thread_id else {
            return Ok(SendOutcome::failed(None, "Either thread_id or recipient must be provided."));
        };

        let recent = self.history(&HistoryQuery::new(thread_id, REPLY_LOOKBACK)).await?;
        let mut recipient = recent
            .iter()
            .rev()
            .find(|m| !m.is_from_me)
            .and_then(|m| m.sender.clone());

        if recipient.is_none() {
            recipient = self
                .get_thread(thread_id)
                .await?
                .and_then(|t| t.participants.into_iter().next())
                .map(|p| p.handle)
                .filter(|h| !h.is_empty());
        }

        match recipient {
            Some(to) => self.send(&reply_to(to), dry_run).await,
            None => Ok(SendOutcome::failed(
                None,
                format!("Could not determine recipient for thread {thread_id}. Send with an explicit recipient."),
            )),
        }
    }
}

fn describe_send_error(err: &GatewayError) -> String {
    match err {
        GatewayError::ToolFailed { stderr, .. } if !stderr.is_empty() => format!("{err}: {stderr}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContactUpsert;
    use crate::normalizer::RawRecord;
    use crate::repository::MockMessageRepository;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    fn service_with(repo: MockMessageRepository, dir: &tempfile::TempDir) -> MessageService {
        let contacts = Arc::new(ContactCache::open(dir.path().join("contacts.json")));
        MessageService::new(
            Arc::new(repo),
            Arc::new(PiiFilter::new(PiiMode::Regex).unwrap()),
            contacts,
            ServiceSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_looks_like_handle() {
        assert!(looks_like_handle("+1 (555) 123-4567"));
        assert!(looks_like_handle("a@example.com"));
        assert!(!looks_like_handle("Alice"));
        assert!(!looks_like_handle("Room 101"));
    }

    #[tokio::test]
    async fn test_probe_skips_failed_threads() {
        let mut repo = MockMessageRepository::new();
        repo.expect_chats()
            .returning(|_| Ok(vec![record(json!({"id": 1})), record(json!({"id": 2}))]));
        repo.expect_history().returning(|query| {
            if query.thread_id == 1 {
                Err(GatewayError::tool_failed("imsg", 1, "boom", ""))
            } else {
                assert_eq!(query.participants, vec!["+15551234567".to_string()]);
                assert_eq!(query.limit, 1);
                Ok(vec![record(json!({"id": 10}))])
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let service = service_with(repo, &dir);
        assert_eq!(service.find_thread_by_recipient("+15551234567").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_probe_propagates_missing_binary() {
        let mut repo = MockMessageRepository::new();
        repo.expect_chats().returning(|_| {
            Err(GatewayError::ToolNotFound {
                tool: "imsg".into(),
                hint: String::new(),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let err = service_with(repo, &dir)
            .find_thread_by_recipient("a@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolNotFound);
    }

    #[tokio::test]
    async fn test_search_without_thread_is_empty() {
        let mut repo = MockMessageRepository::new();
        repo.expect_chats().returning(|_| Ok(Vec::new()));
        repo.expect_history_text().never();

        let dir = tempfile::tempdir().unwrap();
        let request = SearchRequest {
            query: "dinner".into(),
            thread_id: None,
            recipient: Some("a@example.com".into()),
            scan_limit: 1000,
            result_limit: 10,
            start: None,
            end: None,
        };
        assert!(service_with(repo, &dir).search(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_name_recipient_resolved_through_contacts() {
        let mut repo = MockMessageRepository::new();
        repo.expect_command_line().returning(|args| args.join(" "));

        let dir = tempfile::tempdir().unwrap();
        let service = service_with(repo, &dir);
        service
            .contacts()
            .upsert(ContactUpsert {
                name: Some("Alice Smith".into()),
                phones: vec!["+15551234567".into()],
                ..ContactUpsert::default()
            })
            .unwrap();

        let message = MessageSend {
            to: "alice smith".into(),
            text: Some("hi".into()),
            files: vec![],
            service: "auto".into(),
            region: None,
        };
        let outcome = service.send(&message, true).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.to.as_deref(), Some("+15551234567"));
        assert_eq!(outcome.command.as_deref(), Some("send --to +15551234567 --text hi --region US"));
    }

    #[tokio::test]
    async fn test_ambiguous_recipient_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with(MockMessageRepository::new(), &dir);
        for phone in ["+15550000001", "+15550000002"] {
            service
                .contacts()
                .upsert(ContactUpsert {
                    name: Some("Sam".into()),
                    phones: vec![phone.into()],
                    ..ContactUpsert::default()
                })
                .unwrap();
        }
        let err = service.resolve_handle("sam").unwrap_err();
        assert!(matches!(err, GatewayError::AmbiguousRecipient { ref candidates, .. } if candidates.len() == 2));
    }

    #[tokio::test]
    async fn test_send_failure_reported_in_outcome() {
        let mut repo = MockMessageRepository::new();
        repo.expect_command_line().returning(|args| args.join(" "));
        repo.expect_send()
            .returning(|_| Err(GatewayError::tool_failed("imsg", 1, "", "Error: unknown handle")));

        let dir = tempfile::tempdir().unwrap();
        let message = MessageSend {
            to: "+15551234567".into(),
            text: Some("hi".into()),
            files: vec![],
            service: "auto".into(),
            region: None,
        };
        let outcome = service_with(repo, &dir).send(&message, false).await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(
            outcome.error.as_deref(),
            Some("imsg failed with exit code 1: Error: unknown handle")
        );
    }

    #[tokio::test]
    async fn test_reply_uses_last_inbound_sender() {
        let mut repo = MockMessageRepository::new();
        repo.expect_history().returning(|_| {
            Ok(vec![
                record(json!({"id": 1, "sender": "+15550000001", "isFromMe": false, "text": "a"})),
                record(json!({"id": 2, "sender": "+15550000002", "isFromMe": false, "text": "b"})),
                record(json!({"id": 3, "isFromMe": true, "text": "c"})),
            ])
        });
        repo.expect_command_line().returning(|args| args.join(" "));

        let dir = tempfile::tempdir().unwrap();
        let outcome = service_with(repo, &dir).reply("ok", Some(4), None, true).await.unwrap();
        assert_eq!(outcome.to.as_deref(), Some("+15550000002"));
    }
}
