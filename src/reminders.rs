//! Apple Reminders through the `remindctl` CLI.
//!
//! `remindctl` prints one JSON document per call (`--json` is always
//! appended). Commands that only have side effects may print nothing.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RemindersConfig;
use crate::error::{truncate_chars, GatewayError, Result, MAX_DIAGNOSTIC_CHARS};
use crate::normalizer::RawRecord;
use crate::process::{CliTool, CommandRunner, ProcessRunner, ToolSpec};
use crate::validation::InputValidator;

mod fields {
    pub(super) const ID: &[&str] = &["id", "externalId"];
    pub(super) const TITLE: &[&str] = &["title"];
    pub(super) const LIST: &[&str] = &["list", "listName"];
    pub(super) const DUE: &[&str] = &["dueDate"];
    pub(super) const COMPLETED: &[&str] = &["isCompleted"];
    pub(super) const COMPLETED_DATE: &[&str] = &["completionDate"];
    pub(super) const NOTES: &[&str] = &["notes"];
    pub(super) const PRIORITY: &[&str] = &["priority"];
    pub(super) const REMINDER_COUNT: &[&str] = &["reminderCount"];
}

/// Which reminders `show` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderFilter {
    /// Due today
    Today,
    /// Due tomorrow
    Tomorrow,
    /// Due within the next seven days
    Week,
    /// Past due and not completed
    Overdue,
    /// Incomplete with a future due date
    Upcoming,
    /// Already completed
    Completed,
    /// Everything, optionally narrowed to one date
    #[default]
    All,
}

impl ReminderFilter {
    /// CLI spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Tomorrow => "tomorrow",
            Self::Week => "week",
            Self::Overdue => "overdue",
            Self::Upcoming => "upcoming",
            Self::Completed => "completed",
            Self::All => "all",
        }
    }
}

impl FromStr for ReminderFilter {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "today" => Ok(Self::Today),
            "tomorrow" => Ok(Self::Tomorrow),
            "week" => Ok(Self::Week),
            "overdue" => Ok(Self::Overdue),
            "upcoming" => Ok(Self::Upcoming),
            "completed" => Ok(Self::Completed),
            "all" => Ok(Self::All),
            other => Err(GatewayError::Validation(format!("Unknown reminder filter: {other}"))),
        }
    }
}

/// Reminder priority, valued as EventKit does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReminderPriority {
    /// No priority (0)
    #[default]
    None,
    /// High priority (1)
    High,
    /// Medium priority (5)
    Medium,
    /// Low priority (9)
    Low,
}

impl ReminderPriority {
    /// Numeric value: none 0, high 1, medium 5, low 9.
    #[must_use]
    pub const fn value(self) -> i64 {
        match self {
            Self::None => 0,
            Self::High => 1,
            Self::Medium => 5,
            Self::Low => 9,
        }
    }

    /// CLI spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Numeric priority from CLI output, which may be a number or a name.
    #[must_use]
    pub fn parse_value(value: Option<&Value>) -> i64 {
        match value {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::String(s)) => s.parse::<Self>().map_or(0, Self::value),
            _ => 0,
        }
    }
}

impl FromStr for ReminderPriority {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "high" | "1" => Ok(Self::High),
            "medium" | "5" => Ok(Self::Medium),
            "low" | "9" => Ok(Self::Low),
            other => Err(GatewayError::Validation(format!("Unknown reminder priority: {other}"))),
        }
    }
}

/// A reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    pub list: String,
    pub due: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// 0 none, 1 high, 5 medium, 9 low
    pub priority: i64,
}

impl Reminder {
    fn from_record(record: &RawRecord) -> Self {
        Self {
            id: record.raw_string(fields::ID).unwrap_or_default(),
            title: record.raw_string(fields::TITLE).unwrap_or_default(),
            list: record.raw_string(fields::LIST).unwrap_or_default(),
            due: record.datetime(fields::DUE),
            completed: record.boolean(fields::COMPLETED).unwrap_or(false),
            completed_date: record.datetime(fields::COMPLETED_DATE),
            notes: record.string(fields::NOTES),
            priority: ReminderPriority::parse_value(record.value(fields::PRIORITY).as_ref()),
        }
    }
}

/// A reminder list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderList {
    pub name: String,
    pub count: i64,
}

impl ReminderList {
    fn from_record(record: &RawRecord, fallback_name: &str) -> Self {
        Self {
            name: record
                .raw_string(fields::TITLE)
                .unwrap_or_else(|| fallback_name.to_string()),
            count: record.integer(fields::REMINDER_COUNT).unwrap_or(0),
        }
    }
}

/// New reminder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderCreate {
    pub title: String,
    pub list: Option<String>,
    /// ISO 8601 or natural language (`today`, `tomorrow`)
    pub due: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: ReminderPriority,
}

/// Changes to an existing reminder. Unset fields stay as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderUpdate {
    pub title: Option<String>,
    pub list: Option<String>,
    pub due: Option<String>,
    #[serde(default)]
    pub clear_due: bool,
    pub notes: Option<String>,
    pub priority: Option<ReminderPriority>,
    pub completed: Option<bool>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn records(value: Value) -> Vec<RawRecord> {
    match value {
        Value::Array(items) => items.into_iter().filter_map(RawRecord::from_value).collect(),
        other => RawRecord::from_value(other).into_iter().collect(),
    }
}

/// Client for `remindctl`.
#[derive(Debug, Clone)]
pub struct RemindersClient {
    tool: CliTool,
    timeout: Duration,
}

impl RemindersClient {
    /// Client using `runner` to execute `remindctl`.
    #[must_use]
    pub fn new(config: &RemindersConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tool: CliTool::new(ToolSpec::remindctl(&config.path), runner),
            timeout: config.timeout(),
        }
    }

    /// Client spawning real processes.
    #[must_use]
    pub fn from_config(config: &RemindersConfig) -> Self {
        Self::new(config, Arc::new(ProcessRunner))
    }

    async fn run(&self, mut args: Vec<String>, allow_empty: bool) -> Result<Option<Value>> {
        args.push("--json".to_string());
        self.tool.run_document(&args, self.timeout, allow_empty).await
    }

    async fn run_required(&self, args: Vec<String>) -> Result<Value> {
        self.run(args, false).await?.ok_or_else(|| self.unexpected("no output"))
    }

    fn unexpected(&self, detail: impl Into<String>) -> GatewayError {
        GatewayError::UnexpectedOutput {
            tool: self.tool.spec().name.clone(),
            detail: detail.into(),
        }
    }

    fn single_reminder(&self, value: Value) -> Result<Reminder> {
        match value {
            Value::Object(map) => Ok(Reminder::from_record(&RawRecord::new(map))),
            other => Err(self.unexpected(format!(
                "expected a reminder object, got {}",
                truncate_chars(&other.to_string(), MAX_DIAGNOSTIC_CHARS)
            ))),
        }
    }

    /// Reminders matching `filter`. A `date` is used only with the `All`
    /// filter.
    pub async fn list(
        &self,
        filter: ReminderFilter,
        date: Option<&str>,
        list_name: Option<&str>,
    ) -> Result<Vec<Reminder>> {
        let mut args = vec!["show".to_string()];
        if filter != ReminderFilter::All {
            args.push(filter.as_str().to_string());
        } else if let Some(date) = non_empty(date) {
            args.push(date.to_string());
        }
        if let Some(list_name) = non_empty(list_name) {
            args.extend(["--list".to_string(), list_name.to_string()]);
        }

        match self.run_required(args).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(RawRecord::from_value)
                .map(|r| Reminder::from_record(&r))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// All reminder lists.
    pub async fn lists(&self) -> Result<Vec<ReminderList>> {
        match self.run_required(vec!["list".to_string()]).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(RawRecord::from_value)
                .map(|r| ReminderList::from_record(&r, ""))
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Create a reminder.
    pub async fn create(&self, data: &ReminderCreate) -> Result<Reminder> {
        InputValidator::validate_title("Reminder title", &data.title)?;

        let mut args = vec!["add".to_string(), data.title.clone()];
        if let Some(list) = non_empty(data.list.as_deref()) {
            args.extend(["--list".to_string(), list.to_string()]);
        }
        if let Some(due) = non_empty(data.due.as_deref()) {
            args.extend(["--due".to_string(), due.to_string()]);
        }
        if let Some(notes) = non_empty(data.notes.as_deref()) {
            args.extend(["--notes".to_string(), InputValidator::sanitize_text(notes)]);
        }
        if data.priority != ReminderPriority::None {
            args.extend(["--priority".to_string(), data.priority.as_str().to_string()]);
        }

        let value = self.run_required(args).await?;
        self.single_reminder(value)
    }

    /// Edit a reminder.
    pub async fn update(&self, id: &str, data: &ReminderUpdate) -> Result<Reminder> {
        InputValidator::validate_reminder_ids(&[id.to_string()])?;
        if let Some(title) = data.title.as_deref() {
            InputValidator::validate_title("Reminder title", title)?;
        }

        let mut args = vec!["edit".to_string(), id.to_string()];
        if let Some(title) = non_empty(data.title.as_deref()) {
            args.extend(["--title".to_string(), title.to_string()]);
        }
        if let Some(list) = non_empty(data.list.as_deref()) {
            args.extend(["--list".to_string(), list.to_string()]);
        }
        if data.clear_due {
            args.push("--clear-due".to_string());
        } else if let Some(due) = non_empty(data.due.as_deref()) {
            args.extend(["--due".to_string(), due.to_string()]);
        }
        if let Some(notes) = non_empty(data.notes.as_deref()) {
            args.extend(["--notes".to_string(), InputValidator::sanitize_text(notes)]);
        }
        if let Some(priority) = data.priority {
            args.extend(["--priority".to_string(), priority.as_str().to_string()]);
        }
        match data.completed {
            Some(true) => args.push("--complete".to_string()),
            Some(false) => args.push("--incomplete".to_string()),
            None => {},
        }

        let value = self.run_required(args).await?;
        self.single_reminder(value)
    }

    /// Mark one reminder complete.
    pub async fn complete(&self, id: &str) -> Result<Reminder> {
        InputValidator::validate_reminder_ids(&[id.to_string()])?;
        let value = self.run_required(vec!["complete".to_string(), id.to_string()]).await?;
        self.single_reminder(value)
    }

    /// Delete one reminder.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.bulk_delete(&[id.to_string()]).await
    }

    /// Mark several reminders complete.
    pub async fn bulk_complete(&self, ids: &[String]) -> Result<Vec<Reminder>> {
        InputValidator::validate_reminder_ids(ids)?;
        let mut args = vec!["complete".to_string()];
        args.extend(ids.iter().cloned());

        match self.run_required(args).await? {
            value @ (Value::Array(_) | Value::Object(_)) => {
                Ok(records(value).iter().map(Reminder::from_record).collect())
            },
            other => Err(self.unexpected(format!("expected reminders, got {other}"))),
        }
    }

    /// Delete several reminders.
    pub async fn bulk_delete(&self, ids: &[String]) -> Result<()> {
        InputValidator::validate_reminder_ids(ids)?;
        let mut args = vec!["delete".to_string()];
        args.extend(ids.iter().cloned());
        args.push("--force".to_string());
        self.run(args, true).await.map(|_| ())
    }

    /// Create a reminder list.
    pub async fn create_list(&self, name: &str) -> Result<ReminderList> {
        InputValidator::validate_title("List name", name)?;
        let value = self
            .run_required(vec!["list".to_string(), name.to_string(), "--create".to_string()])
            .await?;

        records(value)
            .first()
            .map(|r| ReminderList::from_record(r, name))
            .ok_or_else(|| self.unexpected("expected the created list"))
    }

    /// Rename a reminder list. The CLI prints nothing, so the count is unknown.
    pub async fn rename_list(&self, name: &str, new_name: &str) -> Result<ReminderList> {
        InputValidator::validate_title("List name", name)?;
        InputValidator::validate_title("New list name", new_name)?;
        self.run(
            vec!["list".to_string(), name.to_string(), "--rename".to_string(), new_name.to_string()],
            true,
        )
        .await?;
        Ok(ReminderList {
            name: new_name.to_string(),
            count: 0,
        })
    }

    /// Delete a reminder list.
    pub async fn delete_list(&self, name: &str) -> Result<()> {
        InputValidator::validate_title("List name", name)?;
        self.run(
            vec!["list".to_string(), name.to_string(), "--delete".to_string(), "--force".to_string()],
            true,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockCommandRunner, ToolOutput};

    fn client_returning(expected: &'static [&'static str], stdout: &'static str) -> RemindersClient {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |tool, args, _| tool.name == "remindctl" && args.iter().map(String::as_str).eq(expected.iter().copied()))
            .times(1)
            .returning(move |_, _, _| {
                Ok(ToolOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    code: Some(0),
                })
            });
        RemindersClient::new(&RemindersConfig::default(), Arc::new(runner))
    }

    #[tokio::test]
    async fn test_list_with_filter_and_list_name() {
        let client = client_returning(
            &["show", "today", "--list", "Home", "--json"],
            r#"[{"externalId": "r1", "title": "Milk", "listName": "Home", "priority": "high", "isCompleted": false}]"#,
        );
        let reminders = client.list(ReminderFilter::Today, Some("2026-01-01"), Some("Home")).await.unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].id, "r1");
        assert_eq!(reminders[0].list, "Home");
        assert_eq!(reminders[0].priority, 1);
    }

    #[tokio::test]
    async fn test_create_sends_priority_name() {
        let client = client_returning(
            &["add", "Call mom", "--due", "tomorrow", "--priority", "low", "--json"],
            r#"{"id": "r2", "title": "Call mom", "list": "Inbox", "dueDate": "2026-02-03T09:00:00Z", "priority": 9}"#,
        );
        let reminder = client
            .create(&ReminderCreate {
                title: "Call mom".into(),
                due: Some("tomorrow".into()),
                priority: ReminderPriority::Low,
                ..ReminderCreate::default()
            })
            .await
            .unwrap();
        assert_eq!(reminder.priority, 9);
        assert!(reminder.due.is_some());
    }

    #[tokio::test]
    async fn test_update_clear_due_wins_over_due() {
        let client = client_returning(
            &["edit", "r3", "--clear-due", "--incomplete", "--json"],
            r#"{"id": "r3", "title": "x", "list": "Inbox"}"#,
        );
        let update = ReminderUpdate {
            due: Some("today".into()),
            clear_due: true,
            completed: Some(false),
            ..ReminderUpdate::default()
        };
        assert_eq!(client.update("r3", &update).await.unwrap().id, "r3");
    }

    #[tokio::test]
    async fn test_delete_allows_empty_output() {
        let client = client_returning(&["delete", "r4", "--force", "--json"], "");
        client.delete("r4").await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_output() {
        let client = client_returning(&["complete", "r5", "--json"], "  ");
        let err = client.complete("r5").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedOutput { .. }));
    }

    #[tokio::test]
    async fn test_create_list_reads_first_entry() {
        let client = client_returning(
            &["list", "Groceries", "--create", "--json"],
            r#"[{"title": "Groceries", "reminderCount": 0}]"#,
        );
        assert_eq!(client.create_list("Groceries").await.unwrap().name, "Groceries");
    }

    #[tokio::test]
    async fn test_flag_like_ids_are_rejected_before_running() {
        let client = RemindersClient::new(&RemindersConfig::default(), Arc::new(MockCommandRunner::new()));
        let err = client.bulk_delete(&["--all".to_string()]).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(ReminderPriority::parse_value(Some(&Value::from("medium"))), 5);
        assert_eq!(ReminderPriority::parse_value(Some(&Value::from(9))), 9);
        assert_eq!(ReminderPriority::parse_value(None), 0);
        assert_eq!("HIGH".parse::<ReminderPriority>().unwrap(), ReminderPriority::High);
    }

    #[test]
    fn test_filter_cli_spelling_round_trips() {
        use ReminderFilter::{All, Completed, Overdue, Today, Tomorrow, Upcoming, Week};

        for filter in [Today, Tomorrow, Week, Overdue, Upcoming, Completed, All] {
            assert_eq!(filter.as_str().parse::<ReminderFilter>().unwrap(), filter);
            assert_eq!(serde_json::to_value(filter).unwrap(), Value::from(filter.as_str()));
        }
        assert!("someday".parse::<ReminderFilter>().is_err());
    }
}
