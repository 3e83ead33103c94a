use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "gymbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "gymbook_query_duration_seconds";

/// Counter: bookings confirmed. Labels: command.
pub const BOOKINGS_CREATED_TOTAL: &str = "gymbook_bookings_created_total";

/// Counter: bookings cancelled, including class cascades.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "gymbook_bookings_cancelled_total";

/// Counter: booking attempts refused. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "gymbook_bookings_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "gymbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "gymbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "gymbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gymbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gymbook_wal_flush_batch_size";

/// Counter: identity or subscription lookups that failed. Labels: service, policy.
pub const DEPENDENCY_FAILURES_TOTAL: &str = "gymbook_dependency_failures_total";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "gymbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::BookSession { .. } => "book_session",
        Command::BookClass { .. } => "book_class",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::CreateClass { .. } => "create_class",
        Command::ProposeSchedule { .. } => "propose_schedule",
        Command::ApproveSchedule { .. } => "approve_schedule",
        Command::RejectSchedule { .. } => "reject_schedule",
        Command::CancelClass { .. } => "cancel_class",
        Command::CompleteClass { .. } => "complete_class",
        Command::RescheduleClass { .. } => "reschedule_class",
        Command::DeleteClass { .. } => "delete_class",
        Command::SetAvailability { .. } => "set_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectClasses { .. } => "select_classes",
        Command::SelectPending { .. } => "select_pending",
        Command::SelectParticipants { .. } => "select_participants",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectEntitlements { .. } => "select_entitlements",
    }
}
