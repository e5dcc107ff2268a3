//! Comprehensive unit tests for metrics.rs module

use std::time::Duration;

use imsg_gateway::error::{GatewayError, Result};
use imsg_gateway::metrics::{MetricsCollector, MetricsTimer};

#[test]
fn test_metrics_collector_default_names() {
    let collector = MetricsCollector::default();

    assert_eq!(collector.tool_invocations_total, "imsg_gateway_tool_invocations_total");
    assert_eq!(
        collector.tool_invocation_duration,
        "imsg_gateway_tool_invocation_duration_seconds"
    );
    assert_eq!(collector.watch_streams_active, "imsg_gateway_watch_streams_active");
    assert_eq!(collector.contacts_cached, "imsg_gateway_contacts_cached");
    assert_eq!(collector.errors_total, "imsg_gateway_errors_total");
}

#[test]
fn test_metric_names_are_unique_and_prefixed() {
    let c = MetricsCollector::default();
    let names = [
        c.tool_invocations_total,
        c.tool_invocation_duration,
        c.tool_lines_skipped_total,
        c.messages_normalized_total,
        c.search_lines_scanned_total,
        c.search_matches_total,
        c.links_extracted_total,
        c.messages_sent_total,
        c.watch_streams_active,
        c.watch_messages_total,
        c.contacts_cached,
        c.contact_resolutions_total,
        c.operation_duration,
        c.errors_total,
    ];

    let mut sorted = names.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), names.len());
    assert!(names.iter().all(|n| n.starts_with("imsg_gateway_")));
}

#[test]
fn test_metrics_initialization() {
    let result = MetricsCollector::init();
    assert!(result.is_ok());
}

#[test]
fn test_record_tool_calls() {
    let collector = MetricsCollector::default();
    collector.record_tool_call("imsg", "success", Duration::from_millis(120));
    collector.record_tool_call("remindctl", "timeout", Duration::from_secs(30));
    collector.record_lines_skipped("imsg", 2);
}

#[test]
fn test_record_message_pipeline() {
    let collector = MetricsCollector::default();
    collector.record_messages_normalized(50, "history");
    collector.record_search(5000, 12);
    collector.record_links(3);
    collector.record_send(true, false);
    collector.record_send(false, false);
    collector.record_send(true, true);
}

#[test]
fn test_watch_gauge_balanced() {
    let collector = MetricsCollector::default();
    collector.watch_started();
    collector.record_watch_message();
    collector.watch_stopped();
}

#[test]
fn test_contact_metrics() {
    let collector = MetricsCollector::default();
    collector.set_contacts_cached(42);
    collector.record_contact_resolution("ok");
    collector.record_contact_resolution("ambiguous");
    collector.record_contact_resolution("not_found");
}

#[test]
fn test_record_operation_and_error() {
    let collector = MetricsCollector::default();
    collector.record_operation("search", Duration::from_millis(10), true);
    collector.record_operation("search", Duration::from_millis(10), false);
    collector.record_error("timeout", "search");
}

#[test]
fn test_metrics_timer_success() {
    let timer = MetricsTimer::new(MetricsCollector::default(), "list_threads");
    let result: Result<usize> = Ok(3);
    timer.finish(&result);
}

#[test]
fn test_metrics_timer_failure() {
    let timer = MetricsTimer::new(MetricsCollector::default(), "history");
    let result: Result<()> = Err(GatewayError::Timeout {
        tool: "imsg".to_string(),
        seconds: 30.0,
    });
    timer.finish(&result);
}

#[test]
fn test_collector_is_copy() {
    let collector = MetricsCollector::default();
    let copy = collector;
    assert_eq!(collector.errors_total, copy.errors_total);
}
