use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ImsgConfig;
use crate::error::Result;
use crate::models::{HistoryQuery, MessageSend, WatchRequest};
use crate::normalizer::{format_cli_datetime, RawRecord};
use crate::process::{CliTool, CommandRunner, LineStream, ProcessRunner, ToolSpec};

/// Source of raw message data. Implemented over the `imsg` CLI.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Recent chats, most recent first. `None` lists every chat.
    async fn chats(&self, limit: Option<usize>) -> Result<Vec<RawRecord>>;

    /// Structured history for one thread, oldest first.
    async fn history(&self, query: &HistoryQuery) -> Result<Vec<RawRecord>>;

    /// Plain-text history for one thread, one message per line.
    async fn history_text(&self, query: &HistoryQuery) -> Result<String>;

    /// Start streaming new messages for a thread.
    async fn watch(&self, request: &WatchRequest) -> Result<LineStream>;

    /// Execute a send built by [`send_args`].
    async fn send(&self, args: &[String]) -> Result<()>;

    /// Printable command line for `args`.
    fn command_line(&self, args: &[String]) -> String;
}

/// Arguments for `imsg chats`.
#[must_use]
pub fn chats_args(limit: Option<usize>) -> Vec<String> {
    let mut args = vec!["chats".to_string()];
    if let Some(limit) = limit {
        args.extend(["--limit".to_string(), limit.to_string()]);
    }
    args.push("--json".to_string());
    args
}

/// Arguments for `imsg history`, structured or plain text.
#[must_use]
pub fn history_args(query: &HistoryQuery, json: bool) -> Vec<String> {
    let mut args = vec![
        "history".to_string(),
        "--chat-id".to_string(),
        query.thread_id.to_string(),
        "--limit".to_string(),
        query.limit.to_string(),
    ];
    if json {
        args.push("--json".to_string());
    }
    if let Some(start) = &query.start {
        args.extend(["--start".to_string(), format_cli_datetime(start)]);
    }
    if let Some(end) = &query.end {
        args.extend(["--end".to_string(), format_cli_datetime(end)]);
    }
    if !query.participants.is_empty() {
        args.extend(["--participants".to_string(), query.participants.join(",")]);
    }
    if query.include_attachments {
        args.push("--attachments".to_string());
    }
    args
}

/// Arguments for `imsg watch`.
#[must_use]
pub fn watch_args(request: &WatchRequest) -> Vec<String> {
    let mut args = vec![
        "watch".to_string(),
        "--chat-id".to_string(),
        request.thread_id.to_string(),
        "--debounce".to_string(),
        format!("{}ms", request.debounce_ms),
        "--json".to_string(),
    ];
    if let Some(rowid) = request.since_rowid {
        args.extend(["--since-rowid".to_string(), rowid.to_string()]);
    }
    if request.include_attachments {
        args.push("--attachments".to_string());
    }
    args
}

/// Arguments for `imsg send`. The message region wins over `default_region`.
#[must_use]
pub fn send_args(message: &MessageSend, default_region: &str) -> Vec<String> {
    let mut args = vec!["send".to_string(), "--to".to_string(), message.to.clone()];
    if let Some(text) = message.text.as_deref().filter(|t| !t.is_empty()) {
        args.extend(["--text".to_string(), text.to_string()]);
    }
    for file in &message.files {
        args.extend(["--file".to_string(), file.clone()]);
    }
    if !message.service.is_empty() && message.service != "auto" {
        args.extend(["--service".to_string(), message.service.clone()]);
    }
    let region = message
        .region
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or(default_region);
    args.extend(["--region".to_string(), region.to_string()]);
    args
}

/// [`MessageRepository`] backed by the `imsg` binary.
#[derive(Debug, Clone)]
pub struct ImsgRepository {
    tool: CliTool,
    config: ImsgConfig,
}

impl ImsgRepository {
    /// Repository using `runner` to execute `imsg`.
    #[must_use]
    pub fn new(config: ImsgConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tool: CliTool::new(ToolSpec::imsg(&config.path), runner),
            config,
        }
    }

    /// Repository spawning real processes.
    #[must_use]
    pub fn from_config(config: &ImsgConfig) -> Self {
        Self::new(config.clone(), Arc::new(ProcessRunner))
    }
}

#[async_trait]
impl MessageRepository for ImsgRepository {
    async fn chats(&self, limit: Option<usize>) -> Result<Vec<RawRecord>> {
        self.tool.run_json(&chats_args(limit), self.config.timeout()).await
    }

    async fn history(&self, query: &HistoryQuery) -> Result<Vec<RawRecord>> {
        let timeout = self.config.history_timeout(query.limit);
        self.tool.run_json(&history_args(query, true), timeout).await
    }

    async fn history_text(&self, query: &HistoryQuery) -> Result<String> {
        self.tool.run_raw(&history_args(query, false), self.config.timeout()).await
    }

    async fn watch(&self, request: &WatchRequest) -> Result<LineStream> {
        self.tool.stream(&watch_args(request)).await
    }

    async fn send(&self, args: &[String]) -> Result<()> {
        self.tool.run_raw(args, self.config.timeout()).await.map(|_| ())
    }

    fn command_line(&self, args: &[String]) -> String {
        self.tool.command_line(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::parse_datetime;
    use crate::process::{MockCommandRunner, ToolOutput};
    use std::time::Duration;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_history_args_full() {
        let query = HistoryQuery {
            start: parse_datetime("2026-01-01T00:00:00.500Z"),
            end: parse_datetime("2026-02-01T00:00:00Z"),
            participants: vec!["+15551234567".into(), "a@example.com".into()],
            include_attachments: true,
            ..HistoryQuery::new(7, 50)
        };
        assert_eq!(
            history_args(&query, true),
            args(&[
                "history",
                "--chat-id",
                "7",
                "--limit",
                "50",
                "--json",
                "--start",
                "2026-01-01T00:00:00Z",
                "--end",
                "2026-02-01T00:00:00Z",
                "--participants",
                "+15551234567,a@example.com",
                "--attachments",
            ])
        );
    }

    #[test]
    fn test_history_text_args_have_no_json_flag() {
        let built = history_args(&HistoryQuery::new(3, 10_000), false);
        assert!(!built.contains(&"--json".to_string()));
    }

    #[test]
    fn test_watch_args() {
        let request = WatchRequest {
            thread_id: 9,
            since_rowid: Some(1200),
            debounce_ms: 250,
            include_attachments: false,
        };
        assert_eq!(
            watch_args(&request),
            args(&["watch", "--chat-id", "9", "--debounce", "250ms", "--json", "--since-rowid", "1200"])
        );
    }

    #[test]
    fn test_send_args() {
        let message = MessageSend {
            to: "+15551234567".into(),
            text: Some("hi".into()),
            files: vec!["/tmp/a.jpg".into()],
            service: "sms".into(),
            region: None,
        };
        assert_eq!(
            send_args(&message, "US"),
            args(&[
                "send",
                "--to",
                "+15551234567",
                "--text",
                "hi",
                "--file",
                "/tmp/a.jpg",
                "--service",
                "sms",
                "--region",
                "US"
            ])
        );
    }

    #[test]
    fn test_send_args_auto_service_and_region_override() {
        let message = MessageSend {
            to: "a@example.com".into(),
            text: Some("hi".into()),
            files: vec![],
            service: "auto".into(),
            region: Some("GB".into()),
        };
        let built = send_args(&message, "US");
        assert!(!built.contains(&"--service".to_string()));
        assert_eq!(built[built.len() - 1], "GB");
    }

    #[tokio::test]
    async fn test_history_uses_scaled_timeout() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|tool, args, limit| {
                tool.name == "imsg" && args[0] == "history" && *limit == Duration::from_secs(80)
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(ToolOutput {
                    stdout: "{\"id\": 1, \"text\": \"hi\"}\n".into(),
                    stderr: String::new(),
                    code: Some(0),
                })
            });

        let repo = ImsgRepository::new(ImsgConfig::default(), Arc::new(runner));
        let records = repo.history(&HistoryQuery::new(1, 500)).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_chats_passes_limit() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, args, _| args.iter().map(String::as_str).eq(["chats", "--limit", "5", "--json"]))
            .times(1)
            .returning(|_, _, _| {
                Ok(ToolOutput {
                    stdout: "[{\"id\": 1}, {\"id\": 2}]\n".into(),
                    stderr: String::new(),
                    code: Some(0),
                })
            });

        let repo = ImsgRepository::new(ImsgConfig::default(), Arc::new(runner));
        assert_eq!(repo.chats(Some(5)).await.unwrap().len(), 2);
    }
}
