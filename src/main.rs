use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

use imsg_gateway::config::AppConfig;
use imsg_gateway::contacts::ContactCache;
use imsg_gateway::error::{ErrorBody, ErrorKind, GatewayError};
use imsg_gateway::logging::{init_logging, OperationTimer};
use imsg_gateway::metrics::MetricsCollector;
use imsg_gateway::models::{ContactUpsert, HistoryQuery, LinkRequest, MessageSend, SearchRequest, WatchRequest};
use imsg_gateway::normalizer::parse_datetime;
use imsg_gateway::reminders::{ReminderCreate, ReminderFilter, ReminderPriority, ReminderUpdate, RemindersClient};
use imsg_gateway::service::MessageService;
use imsg_gateway::validation::{limits, InputValidator};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List recent threads
    Threads {
        /// Maximum number of threads
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one thread
    Thread {
        /// Thread id
        id: i64,
    },
    /// Find the thread for a recipient
    Lookup {
        /// Phone number, email or contact name
        recipient: String,
    },
    /// Show message history
    History {
        /// Thread id
        #[arg(short, long, required_unless_present = "recipient")]
        thread_id: Option<i64>,

        /// Phone number, email or contact name
        #[arg(short, long)]
        recipient: Option<String>,

        /// Maximum number of messages
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Start of the time range (ISO 8601 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: Option<DateTime<Utc>>,

        /// End of the time range (ISO 8601 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: Option<DateTime<Utc>>,

        /// Look back this many days when no start is given
        #[arg(long)]
        days_back: Option<u32>,

        /// Only messages involving these handles
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,

        /// Include attachment metadata
        #[arg(long)]
        attachments: bool,
    },
    /// Search message text in a thread
    Search {
        /// Text to look for
        query: String,

        /// Thread id
        #[arg(short, long)]
        thread_id: Option<i64>,

        /// Phone number, email or contact name
        #[arg(short, long)]
        recipient: Option<String>,

        /// Messages to scan
        #[arg(long, default_value = "5000")]
        scan_limit: usize,

        /// Maximum matches
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Start of the time range (ISO 8601 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        start: Option<DateTime<Utc>>,

        /// End of the time range (ISO 8601 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        end: Option<DateTime<Utc>>,

        /// Look back this many days when no start is given
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// List links shared in a thread
    Links {
        /// Thread id
        #[arg(short, long)]
        thread_id: Option<i64>,

        /// Phone number, email or contact name
        #[arg(short, long)]
        recipient: Option<String>,

        /// Maximum number of links
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Messages to scan
        #[arg(long, default_value = "1000")]
        message_limit: usize,

        /// Only links I sent
        #[arg(long, conflicts_with = "received")]
        sent: bool,

        /// Only links I received
        #[arg(long)]
        received: bool,

        /// Look back this many days
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Stream new messages from a thread until interrupted
    Watch {
        /// Thread id
        #[arg(short, long)]
        thread_id: i64,

        /// Start after this message row id
        #[arg(long)]
        since_rowid: Option<i64>,

        /// Debounce interval in milliseconds
        #[arg(long)]
        debounce_ms: Option<u64>,

        /// Include attachment metadata
        #[arg(long)]
        attachments: bool,
    },
    /// Send a message
    Send {
        /// Phone number, email or contact name
        #[arg(long)]
        to: String,

        /// Message text
        #[arg(long)]
        text: Option<String>,

        /// Absolute path of a file to attach
        #[arg(long = "file")]
        files: Vec<String>,

        /// imessage, sms or auto
        #[arg(long, default_value = "auto")]
        service: String,

        /// Region for phone number parsing
        #[arg(long)]
        region: Option<String>,

        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Reply in a thread
    Reply {
        /// Message text
        #[arg(long)]
        text: String,

        /// Thread id
        #[arg(short, long, required_unless_present = "recipient")]
        thread_id: Option<i64>,

        /// Send to this recipient instead of guessing from the thread
        #[arg(short, long)]
        recipient: Option<String>,

        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the contact cache
    Contacts {
        #[command(subcommand)]
        command: ContactCommands,
    },
    /// Manage reminders
    Reminders {
        #[command(subcommand)]
        command: ReminderCommands,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Create a contact or merge into an existing one
    Upsert {
        /// Display name
        #[arg(short, long)]
        name: Option<String>,

        /// Phone number (repeatable)
        #[arg(short, long = "phone")]
        phones: Vec<String>,

        /// Email address (repeatable)
        #[arg(short, long = "email")]
        emails: Vec<String>,

        /// Alias or nickname (repeatable)
        #[arg(short, long = "alias")]
        aliases: Vec<String>,
    },
    /// Resolve a contact by phone, email or name
    Resolve {
        /// Phone number
        #[arg(short, long)]
        phone: Option<String>,

        /// Email address
        #[arg(short, long)]
        email: Option<String>,

        /// Name or alias
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Search contacts
    Search {
        /// Text to look for
        query: String,

        /// Maximum results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List every contact
    List,
    /// Delete a contact
    Delete {
        /// Contact id
        id: String,
    },
}

#[derive(Subcommand)]
enum ReminderCommands {
    /// List reminders
    List {
        /// today, tomorrow, week, overdue, upcoming, completed or all
        #[arg(short, long, default_value = "all")]
        filter: ReminderFilter,

        /// Specific date, used with the `all` filter
        #[arg(short, long)]
        date: Option<String>,

        /// Only this list
        #[arg(short, long)]
        list: Option<String>,
    },
    /// List reminder lists
    Lists,
    /// Create a reminder
    Add {
        /// Title
        title: String,

        /// Target list
        #[arg(short, long)]
        list: Option<String>,

        /// Due date (ISO 8601, today, tomorrow)
        #[arg(short, long)]
        due: Option<String>,

        /// Notes
        #[arg(short, long)]
        notes: Option<String>,

        /// none, high, medium or low
        #[arg(short, long, default_value = "none")]
        priority: ReminderPriority,
    },
    /// Edit a reminder
    Edit {
        /// Reminder id
        id: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// Move to this list
        #[arg(long)]
        list: Option<String>,

        /// New due date
        #[arg(long, conflicts_with = "clear_due")]
        due: Option<String>,

        /// Remove the due date
        #[arg(long)]
        clear_due: bool,

        /// New notes
        #[arg(long)]
        notes: Option<String>,

        /// none, high, medium or low
        #[arg(long)]
        priority: Option<ReminderPriority>,

        /// Mark complete
        #[arg(long, conflicts_with = "incomplete")]
        complete: bool,

        /// Mark incomplete
        #[arg(long)]
        incomplete: bool,
    },
    /// Complete one or more reminders
    Complete {
        /// Reminder ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete one or more reminders
    Delete {
        /// Reminder ids
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Create a reminder list
    ListCreate {
        /// List name
        name: String,
    },
    /// Rename a reminder list
    ListRename {
        /// Current name
        name: String,

        /// New name
        new_name: String,
    },
    /// Delete a reminder list
    ListDelete {
        /// List name
        name: String,
    },
}

/// Shared instances built once at startup.
struct App {
    config: AppConfig,
    contacts: Arc<ContactCache>,
    messages: MessageService,
    reminders: RemindersClient,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let config = AppConfig::load_from(cli.config.as_deref())?;

    // Initialize logging; the guard keeps the file writer flushing
    let _log_guard = init_logging(
        Some(&config.get_log_level()),
        config.logging.file_path.as_deref().map(Path::new),
        &config.logging.format,
    )?;

    if let Err(e) = MetricsCollector::init() {
        warn!(error = %e, "Metrics recorder unavailable");
    }

    info!("Starting imsg-gateway");

    let contacts = Arc::new(ContactCache::open(&config.contacts.path));
    let messages =
        MessageService::from_config(&config, Arc::clone(&contacts)).context("Failed to build message service")?;
    let reminders = RemindersClient::from_config(&config.reminders);

    let app = App {
        config,
        contacts,
        messages,
        reminders,
    };

    match cli.command {
        Commands::Contacts { command } => run_contacts(&app, command),
        Commands::Reminders { command } => run_reminders(&app, command).await,
        command => run_messages(&app, command).await,
    }
}

async fn run_messages(app: &App, command: Commands) -> Result<()> {
    let service = &app.messages;

    match command {
        Commands::Threads { limit } => {
            let timer = OperationTimer::new("threads");
            let threads = service.list_threads(limit).await?;
            timer.finish();
            emit(&threads)
        },
        Commands::Thread { id } => {
            let thread = service.get_thread(id).await?;
            emit(&thread)
        },
        Commands::Lookup { recipient } => {
            let thread = service.thread_for_recipient(&recipient).await?;
            emit(&thread)
        },
        Commands::History {
            thread_id,
            recipient,
            limit,
            start,
            end,
            days_back,
            participants,
            attachments,
        } => {
            let timer = OperationTimer::new("history");
            let query = HistoryQuery {
                start: match (start, days_back) {
                    (None, Some(_)) => Some(window_start(service, None, days_back)?),
                    _ => start,
                },
                end,
                participants,
                include_attachments: attachments,
                ..HistoryQuery::new(thread_id.unwrap_or_default(), limit)
            };
            let messages = match (thread_id, recipient) {
                (Some(_), _) => service.history(&query).await?,
                (None, Some(recipient)) => service.history_by_recipient(&recipient, &query).await?,
                (None, None) => Vec::new(),
            };
            timer.finish();
            emit(&messages)
        },
        Commands::Search {
            query,
            thread_id,
            recipient,
            scan_limit,
            limit,
            start,
            end,
            days_back,
        } => {
            let timer = OperationTimer::new("search");
            let request = SearchRequest {
                query,
                thread_id,
                recipient,
                scan_limit,
                result_limit: limit,
                start: Some(window_start(service, start, days_back)?),
                end,
            };
            let matches = service.search(&request).await?;
            timer.finish();
            emit(&matches)
        },
        Commands::Links {
            thread_id,
            recipient,
            limit,
            message_limit,
            sent,
            received,
            days_back,
        } => {
            let timer = OperationTimer::new("links");
            let request = LinkRequest {
                thread_id,
                recipient,
                limit,
                message_limit,
                from_me: (sent || received).then_some(sent),
                start: Some(window_start(service, None, days_back)?),
                end: None,
            };
            let links = service.extract_links(&request).await?;
            timer.finish();
            emit(&links)
        },
        Commands::Watch {
            thread_id,
            since_rowid,
            debounce_ms,
            attachments,
        } => {
            let request = WatchRequest {
                thread_id,
                since_rowid,
                debounce_ms: debounce_ms.unwrap_or(app.config.imsg.watch_debounce_ms),
                include_attachments: attachments,
            };
            watch(service, &request).await
        },
        Commands::Send {
            to,
            text,
            files,
            service: transport,
            region,
            dry_run,
        } => {
            let message = MessageSend {
                to,
                text,
                files,
                service: transport,
                region,
            };
            let outcome = service.send(&message, dry_run).await?;
            emit(&outcome)
        },
        Commands::Reply {
            text,
            thread_id,
            recipient,
            dry_run,
        } => {
            let outcome = service
                .reply(&text, thread_id, recipient.as_deref(), dry_run)
                .await?;
            emit(&outcome)
        },
        Commands::Contacts { .. } | Commands::Reminders { .. } => Ok(()),
    }
}

/// Print messages as JSON lines until the watch ends or Ctrl-C.
async fn watch(service: &MessageService, request: &WatchRequest) -> Result<()> {
    let mut stream = service.watch(request).await?;
    let mut out = std::io::stdout().lock();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!(thread_id = request.thread_id, "Interrupted, stopping watch");
                stream.cancel().await;
                return Ok(());
            }
            item = stream.next() => match item {
                Some(Ok(message)) => {
                    serde_json::to_writer(&mut out, &message)?;
                    writeln!(out)?;
                    out.flush()?;
                },
                Some(Err(e)) => {
                    stream.cancel().await;
                    return Err(e.into());
                },
                None => {
                    debug!(thread_id = request.thread_id, "Watch ended");
                    return Ok(());
                },
            },
        }
    }
}

fn run_contacts(app: &App, command: ContactCommands) -> Result<()> {
    let contacts = &app.contacts;

    match command {
        ContactCommands::Upsert {
            name,
            phones,
            emails,
            aliases,
        } => {
            let data = ContactUpsert {
                name,
                phones,
                emails,
                aliases,
            };
            InputValidator::validate_contact_upsert(&data)?;
            let contact = contacts.upsert(data).context("Failed to save contact")?;
            info!(id = %contact.id, "Contact saved");
            emit(&contact)
        },
        ContactCommands::Resolve { phone, email, name } => {
            InputValidator::validate_resolve(phone.as_deref(), email.as_deref(), name.as_deref())?;
            emit(&contacts.resolve(phone.as_deref(), email.as_deref(), name.as_deref()))
        },
        ContactCommands::Search { query, limit } => {
            InputValidator::validate_query(&query)?;
            InputValidator::validate_range("limit", limit, limits::CONTACT_SEARCH)?;
            emit(&contacts.search(&query, limit))
        },
        ContactCommands::List => emit(&contacts.list_all()),
        ContactCommands::Delete { id } => {
            let deleted = contacts.delete(&id).context("Failed to delete contact")?;
            emit(&serde_json::json!({ "id": id, "deleted": deleted }))
        },
    }
}

async fn run_reminders(app: &App, command: ReminderCommands) -> Result<()> {
    let client = &app.reminders;

    match command {
        ReminderCommands::List { filter, date, list } => {
            emit(&client.list(filter, date.as_deref(), list.as_deref()).await?)
        },
        ReminderCommands::Lists => emit(&client.lists().await?),
        ReminderCommands::Add {
            title,
            list,
            due,
            notes,
            priority,
        } => {
            let data = ReminderCreate {
                title,
                list,
                due,
                notes,
                priority,
            };
            emit(&client.create(&data).await?)
        },
        ReminderCommands::Edit {
            id,
            title,
            list,
            due,
            clear_due,
            notes,
            priority,
            complete,
            incomplete,
        } => {
            let data = ReminderUpdate {
                title,
                list,
                due,
                clear_due,
                notes,
                priority,
                completed: (complete || incomplete).then_some(complete),
            };
            emit(&client.update(&id, &data).await?)
        },
        ReminderCommands::Complete { ids } => match ids.as_slice() {
            [id] => emit(&client.complete(id).await?),
            _ => emit(&client.bulk_complete(&ids).await?),
        },
        ReminderCommands::Delete { ids } => {
            client.bulk_delete(&ids).await?;
            emit(&serde_json::json!({ "deleted": ids }))
        },
        ReminderCommands::ListCreate { name } => emit(&client.create_list(&name).await?),
        ReminderCommands::ListRename { name, new_name } => emit(&client.rename_list(&name, &new_name).await?),
        ReminderCommands::ListDelete { name } => {
            client.delete_list(&name).await?;
            emit(&serde_json::json!({ "deleted": name }))
        },
    }
}

/// Start of the query window after checking `days_back`.
fn window_start(service: &MessageService, start: Option<DateTime<Utc>>, days_back: Option<u32>) -> Result<DateTime<Utc>> {
    if let Some(days) = days_back {
        InputValidator::validate_range("days_back", days, limits::DAYS_BACK)?;
    }
    Ok(service.effective_start(start, days_back))
}

/// Parse a CLI date: full ISO 8601, or a bare day taken as UTC midnight.
fn parse_date(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_datetime(value)
        .or_else(|| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
        .ok_or_else(|| format!("Invalid date '{value}', use ISO 8601 or YYYY-MM-DD"))
}

/// Write a result to stdout as pretty JSON.
fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).context("Failed to write output")?;
    writeln!(out)?;
    Ok(())
}

/// Write the stable error body to stderr.
fn report_error(err: &anyhow::Error) {
    let body = err.downcast_ref::<GatewayError>().map_or_else(
        || ErrorBody {
            error: format!("{err:#}"),
            kind: ErrorKind::Internal,
            code: -1,
            stderr: None,
            hint: None,
        },
        GatewayError::to_body,
    );

    let mut out = std::io::stderr().lock();
    if serde_json::to_writer_pretty(&mut out, &body).is_ok() {
        let _ = writeln!(out);
    }
}
