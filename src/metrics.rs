use anyhow::Result;
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metrics collection and management
#[derive(Debug, Clone, Copy)]
pub struct MetricsCollector {
    // Subprocess metrics
    pub tool_invocations_total: &'static str,
    pub tool_invocation_duration: &'static str,
    pub tool_lines_skipped_total: &'static str,

    // Message metrics
    pub messages_normalized_total: &'static str,
    pub search_lines_scanned_total: &'static str,
    pub search_matches_total: &'static str,
    pub links_extracted_total: &'static str,
    pub messages_sent_total: &'static str,

    // Watch metrics
    pub watch_streams_active: &'static str,
    pub watch_messages_total: &'static str,

    // Contact metrics
    pub contacts_cached: &'static str,
    pub contact_resolutions_total: &'static str,

    // Operation metrics
    pub operation_duration: &'static str,
    pub errors_total: &'static str,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            tool_invocations_total: "imsg_gateway_tool_invocations_total",
            tool_invocation_duration: "imsg_gateway_tool_invocation_duration_seconds",
            tool_lines_skipped_total: "imsg_gateway_tool_lines_skipped_total",

            messages_normalized_total: "imsg_gateway_messages_normalized_total",
            search_lines_scanned_total: "imsg_gateway_search_lines_scanned_total",
            search_matches_total: "imsg_gateway_search_matches_total",
            links_extracted_total: "imsg_gateway_links_extracted_total",
            messages_sent_total: "imsg_gateway_messages_sent_total",

            watch_streams_active: "imsg_gateway_watch_streams_active",
            watch_messages_total: "imsg_gateway_watch_messages_total",

            contacts_cached: "imsg_gateway_contacts_cached",
            contact_resolutions_total: "imsg_gateway_contact_resolutions_total",

            operation_duration: "imsg_gateway_operation_duration_seconds",
            errors_total: "imsg_gateway_errors_total",
        }
    }
}

impl MetricsCollector {
    /// Initialize metrics collection
    pub fn init() -> Result<()> {
        metrics::set_global_recorder(metrics::NoopRecorder)
            .map_err(|e| anyhow::anyhow!("Failed to initialize metrics recorder: {}", e))?;

        Ok(())
    }

    /// Record one external CLI invocation
    pub fn record_tool_call(&self, tool: &str, outcome: &str, duration: Duration) {
        counter!(self.tool_invocations_total, "tool" => tool.to_string(), "outcome" => outcome.to_string())
            .increment(1);
        histogram!(self.tool_invocation_duration, "tool" => tool.to_string()).record(duration.as_secs_f64());
    }

    /// Record output lines that could not be parsed
    pub fn record_lines_skipped(&self, tool: &str, count: usize) {
        counter!(self.tool_lines_skipped_total, "tool" => tool.to_string()).increment(count as u64);
    }

    /// Record normalized messages
    pub fn record_messages_normalized(&self, count: usize, operation: &str) {
        counter!(self.messages_normalized_total, "operation" => operation.to_string()).increment(count as u64);
    }

    /// Record a search scan
    pub fn record_search(&self, scanned: usize, matched: usize) {
        counter!(self.search_lines_scanned_total).increment(scanned as u64);
        counter!(self.search_matches_total).increment(matched as u64);
    }

    /// Record extracted links
    pub fn record_links(&self, count: usize) {
        counter!(self.links_extracted_total).increment(count as u64);
    }

    /// Record a send attempt
    pub fn record_send(&self, ok: bool, dry_run: bool) {
        let status = match (dry_run, ok) {
            (true, _) => "dry_run",
            (false, true) => "success",
            (false, false) => "error",
        };
        counter!(self.messages_sent_total, "status" => status).increment(1);
    }

    /// A watch stream started
    pub fn watch_started(&self) {
        gauge!(self.watch_streams_active).increment(1.0);
    }

    /// A watch stream ended
    pub fn watch_stopped(&self) {
        gauge!(self.watch_streams_active).decrement(1.0);
    }

    /// Record a message delivered by a watch stream
    pub fn record_watch_message(&self) {
        counter!(self.watch_messages_total).increment(1);
    }

    /// Update the number of cached contacts
    pub fn set_contacts_cached(&self, count: usize) {
        gauge!(self.contacts_cached).set(count as f64);
    }

    /// Record a contact resolution outcome
    pub fn record_contact_resolution(&self, status: &str) {
        counter!(self.contact_resolutions_total, "status" => status.to_string()).increment(1);
    }

    /// Record error metrics
    pub fn record_error(&self, error_kind: &str, operation: &str) {
        counter!(self.errors_total, "kind" => error_kind.to_string(), "operation" => operation.to_string())
            .increment(1);
    }

    /// Record how long an operation took
    pub fn record_operation(&self, operation: &str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "error" };
        histogram!(self.operation_duration, "operation" => operation.to_string(), "status" => status)
            .record(duration.as_secs_f64());
    }
}

/// Performance timing wrapper for metrics
pub struct MetricsTimer {
    collector: MetricsCollector,
    operation: &'static str,
    start: Instant,
}

impl MetricsTimer {
    pub fn new(collector: MetricsCollector, operation: &'static str) -> Self {
        Self {
            collector,
            operation,
            start: Instant::now(),
        }
    }

    /// Record the duration, and the error kind on failure
    pub fn finish<T>(self, result: &crate::error::Result<T>) {
        let duration = self.start.elapsed();
        self.collector.record_operation(self.operation, duration, result.is_ok());
        if let Err(e) = result {
            let kind = serde_json::to_value(e.kind())
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "internal".to_string());
            self.collector.record_error(&kind, self.operation);
        }
    }
}
