use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "banns_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "banns_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "banns_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "banns_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "banns_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "banns_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "banns_wal_flush_batch_size";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: bookings rejected by evaluation. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "banns_conflicts_total";

/// Counter: weddings booked.
pub const WEDDINGS_SCHEDULED_TOTAL: &str = "banns_weddings_scheduled_total";

/// Counter: reminders handed to the sink. Labels: kind.
pub const REMINDERS_SENT_TOTAL: &str = "banns_reminders_sent_total";

/// Counter: reminder deliveries that failed and will be retried.
pub const REMINDER_FAILURES_TOTAL: &str = "banns_reminder_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWedding { .. } => "insert_wedding",
        Command::UpdateWedding { .. } => "update_wedding",
        Command::DeleteWedding { .. } => "delete_wedding",
        Command::SelectWeddings { .. } => "select_weddings",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectProclamations { .. } => "select_proclamations",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectStatistics { .. } => "select_statistics",
        Command::SelectReminders { .. } => "select_reminders",
        Command::InsertLocation { .. } => "insert_location",
        Command::UpdateLocation { .. } => "update_location",
        Command::SelectLocations { .. } => "select_locations",
        Command::InsertCelebrant { .. } => "insert_celebrant",
        Command::UpdateCelebrant { .. } => "update_celebrant",
        Command::SelectCelebrants { .. } => "select_celebrants",
        Command::SetConfig { .. } => "set_config",
        Command::SelectConfig { .. } => "select_config",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
