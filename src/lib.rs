//! imsg Gateway - Local Messages and Reminders Core
//!
//! A Rust library that wraps the `imsg` and `remindctl` command-line tools
//! and turns their output into typed, privacy-filtered records.
//!
//! # Features
//!
//! - Run external CLIs with timeouts, install hints and bounded diagnostics
//! - Normalize loosely-shaped NDJSON into stable message and thread records
//! - Redact sensitive numbers and secrets from message text
//! - Fast substring search and link extraction over thread history
//! - Cancellable live watch streams
//! - Persistent contact cache for name-to-handle resolution
//! - Reminder and reminder list management

/// Configuration management
pub mod config;
/// Contact resolution cache
pub mod contacts;
/// Error types
pub mod error;
/// Logging setup and utilities
pub mod logging;
/// Metrics collection
pub mod metrics;
/// Data models and structures
pub mod models;
/// Record normalization
pub mod normalizer;
/// Sensitive data redaction
pub mod pii;
/// External process execution
pub mod process;
/// Reminders over `remindctl`
pub mod reminders;
/// Repository pattern for message data access
pub mod repository;
/// Text search and link extraction
pub mod search;
/// Message operations
pub mod service;
/// Input validation and sanitization
pub mod validation;
/// Live message streams
pub mod watch;

// Re-export key components for easier access
pub use contacts::ContactCache;
pub use error::{ErrorBody, ErrorKind, GatewayError, Result};
pub use models::{Contact, ContactResolution, ExtractedLink, Message, Thread};
pub use pii::{PiiFilter, PiiMode};
pub use reminders::RemindersClient;
pub use service::MessageService;
pub use watch::MessageStream;
