use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::{GatewayError, Result};
use crate::models::{ContactUpsert, MessageSend};

/// Accepted limit ranges, inclusive.
pub mod limits {
    pub const THREADS: (usize, usize) = (1, 100);
    pub const HISTORY: (usize, usize) = (1, 500);
    pub const SEARCH_RESULTS: (usize, usize) = (1, 1000);
    pub const SEARCH_SCAN: (usize, usize) = (100, 50_000);
    pub const LINKS: (usize, usize) = (1, 500);
    pub const LINK_SCAN: (usize, usize) = (1, 5000);
    pub const DEBOUNCE_MS: (u64, u64) = (50, 5000);
    pub const DAYS_BACK: (u32, u32) = (1, 3650);
    pub const CONTACT_SEARCH: (usize, usize) = (1, 100);
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Validation(message.into())
}

/// Validation utilities for input sanitization and edge case handling
///
/// Everything here runs before any subprocess is started.
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate a value against an inclusive range
    pub fn validate_range<T>(name: &str, value: T, (min, max): (T, T)) -> Result<()>
    where
        T: PartialOrd + std::fmt::Display + Copy,
    {
        if value < min || value > max {
            return Err(invalid(format!("{name} must be between {min} and {max}, got {value}")));
        }
        Ok(())
    }

    /// Validate a thread id
    pub fn validate_thread_id(thread_id: i64) -> Result<()> {
        if thread_id <= 0 {
            return Err(invalid(format!("Invalid thread id: {thread_id}")));
        }
        Ok(())
    }

    /// Validate that a request names a thread, directly or through a recipient
    pub fn validate_scope(thread_id: Option<i64>, recipient: Option<&str>) -> Result<()> {
        match (thread_id, recipient) {
            (Some(id), _) => Self::validate_thread_id(id),
            (None, Some(recipient)) => Self::validate_recipient(recipient),
            (None, None) => Err(invalid("Either thread_id or recipient must be provided")),
        }
    }

    /// Validate a recipient identifier (phone, email, handle or contact name)
    pub fn validate_recipient(recipient: &str) -> Result<()> {
        if recipient.trim().is_empty() {
            return Err(invalid("Recipient cannot be empty"));
        }

        if recipient.len() > 254 {
            return Err(invalid("Recipient too long (max 254 characters)"));
        }

        if recipient.contains('\0') || recipient.contains('\r') || recipient.contains('\n') {
            return Err(invalid("Recipient contains invalid characters"));
        }

        Ok(())
    }

    /// Validate a search query
    pub fn validate_query(query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Err(invalid("Search query cannot be empty"));
        }

        if query.chars().count() > 500 {
            return Err(invalid("Search query too long (max 500 characters)"));
        }

        Ok(())
    }

    /// Validate date range
    pub fn validate_date_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
        if let (Some(start_date), Some(end_date)) = (start, end) {
            if start_date > end_date {
                return Err(invalid("Start date cannot be after end date"));
            }

            // Warn about very large date ranges that may impact performance
            let days = (end_date - start_date).num_days();
            if days > 365 * 5 {
                tracing::warn!(
                    "Large date range ({} days / {:.1} years) may slow down the imsg query",
                    days,
                    days as f64 / 365.0
                );
            }

            // Error on extremely large ranges
            if days > 365 * 10 {
                return Err(invalid(format!(
                    "Date range too large ({days} days / {} years). Maximum supported range is 10 years.",
                    days / 365
                )));
            }
        }

        Ok(())
    }

    /// Validate a resolve request: at least one key must be supplied
    pub fn validate_resolve(phone: Option<&str>, email: Option<&str>, name: Option<&str>) -> Result<()> {
        let supplied = [phone, email, name]
            .iter()
            .flatten()
            .any(|value| !value.trim().is_empty());
        if !supplied {
            return Err(invalid("At least one of phone, email or name is required"));
        }
        Ok(())
    }

    /// Validate contact upsert data
    pub fn validate_contact_upsert(data: &ContactUpsert) -> Result<()> {
        let has_name = data.name.as_deref().is_some_and(|n| !n.trim().is_empty());
        if !has_name && data.phones.is_empty() && data.emails.is_empty() && data.aliases.is_empty() {
            return Err(invalid("Contact needs at least a name, phone, email or alias"));
        }

        if let Some(name) = data.name.as_deref().filter(|n| !n.trim().is_empty()) {
            Self::validate_contact_name(name)?;
        }
        for phone in &data.phones {
            Self::validate_phone(phone)?;
        }
        for email in &data.emails {
            Self::validate_email(email)?;
        }
        for alias in &data.aliases {
            Self::validate_contact_name(alias)?;
        }

        Ok(())
    }

    /// Validate contact name
    pub fn validate_contact_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(invalid("Contact name cannot be empty"));
        }

        if name.len() > 100 {
            return Err(invalid("Contact name too long (max 100 characters)"));
        }

        // Check for potentially dangerous characters
        if name.contains('\0') || name.contains('\r') || name.contains('\n') {
            return Err(invalid("Contact name contains invalid characters"));
        }

        Ok(())
    }

    /// Validate phone number format
    pub fn validate_phone(phone: &str) -> Result<()> {
        if phone.trim().is_empty() {
            return Err(invalid("Phone number cannot be empty"));
        }

        if phone
            .chars()
            .any(|c| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.')))
        {
            return Err(invalid(format!("Phone number contains invalid characters: {phone}")));
        }

        let digits_only = phone.chars().filter(char::is_ascii_digit).count();
        if !(7..=15).contains(&digits_only) {
            return Err(invalid("Phone number must be between 7 and 15 digits"));
        }

        if phone.trim().chars().skip(1).any(|c| c == '+') {
            return Err(invalid("Phone number may only have + as its first character"));
        }

        Ok(())
    }

    /// Validate email format
    pub fn validate_email(email: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(invalid("Email cannot be empty"));
        }

        if email.len() > 254 {
            return Err(invalid("Email too long (max 254 characters)"));
        }

        let Some((local_part, domain_part)) = email.split_once('@') else {
            return Err(invalid("Email must contain @ symbol"));
        };

        if domain_part.contains('@') {
            return Err(invalid("Email must have exactly one @ symbol"));
        }

        if local_part.is_empty() || local_part.len() > 64 {
            return Err(invalid("Email local part invalid"));
        }

        if domain_part.is_empty() || !domain_part.contains('.') {
            return Err(invalid("Email domain invalid"));
        }

        Ok(())
    }

    /// Validate an attachment path for sending
    pub fn validate_file_path(path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.is_empty() {
            return Err(invalid("File path cannot be empty"));
        }

        if !path.is_absolute() {
            return Err(invalid(format!("File path must be absolute: {path_str}")));
        }

        // Check for path traversal attempts
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(invalid("File path contains potentially dangerous characters"));
        }

        // Check path length
        if path_str.len() > 4096 {
            return Err(invalid("File path too long (max 4096 characters)"));
        }

        Ok(())
    }

    /// Validate an outgoing message
    pub fn validate_send(message: &MessageSend) -> Result<()> {
        Self::validate_recipient(&message.to)?;

        let has_text = message.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        if !has_text && message.files.is_empty() {
            return Err(invalid("Message needs text or at least one file"));
        }

        for file in &message.files {
            Self::validate_file_path(Path::new(file))?;
        }

        let valid_services = ["auto", "imessage", "sms"];
        if !valid_services.contains(&message.service.as_str()) {
            return Err(invalid(format!(
                "Invalid service: {}. Must be one of: {:?}",
                message.service, valid_services
            )));
        }

        Ok(())
    }

    /// Validate a reminder title or list name
    pub fn validate_title(kind: &str, title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(invalid(format!("{kind} cannot be empty")));
        }

        if title.len() > 500 {
            return Err(invalid(format!("{kind} too long (max 500 characters)")));
        }

        Ok(())
    }

    /// Validate reminder ids for single and bulk operations
    pub fn validate_reminder_ids(ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Err(invalid("At least one reminder id is required"));
        }

        if let Some(bad) = ids.iter().find(|id| id.trim().is_empty() || id.starts_with('-')) {
            return Err(invalid(format!("Invalid reminder id: '{bad}'")));
        }

        Ok(())
    }

    /// Sanitize text input
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }
}
