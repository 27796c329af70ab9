use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── Booking engine ──────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (created, replayed, conflict, rejected).
pub const BOOKING_ATTEMPTS_TOTAL: &str = "innkeep_booking_attempts_total";

/// Counter: booking state transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "innkeep_booking_transitions_total";

/// Histogram: time spent waiting for a property's write lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "innkeep_lock_wait_seconds";

/// Counter: payment callbacks. Labels: result (applied, duplicate, ignored, unknown).
pub const PAYMENT_CALLBACKS_TOTAL: &str = "innkeep_payment_callbacks_total";

/// Counter: pending-payment bookings cancelled by the timeout reaper.
pub const PAYMENT_TIMEOUTS_TOTAL: &str = "innkeep_payment_timeouts_total";

// ── Calendar sync ───────────────────────────────────────────────

/// Counter: calendar imports. Labels: status (ok, error).
pub const CALENDAR_SYNCS_TOTAL: &str = "innkeep_calendar_syncs_total";

/// Histogram: duration of one link import (fetch + diff + write), in seconds.
pub const CALENDAR_SYNC_DURATION_SECONDS: &str = "innkeep_calendar_sync_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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
        Command::InsertProperty { .. } => "insert_property",
        Command::UpdateProperty { .. } => "update_property",
        Command::DeleteProperty { .. } => "delete_property",
        Command::InsertPricingRule { .. } => "insert_pricing_rule",
        Command::DeletePricingRule { .. } => "delete_pricing_rule",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::Approve { .. } => "approve",
        Command::Decline { .. } => "decline",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::Payment { .. } => "payment",
        Command::InsertCalendarLink { .. } => "insert_calendar_link",
        Command::DeleteCalendarLink { .. } => "delete_calendar_link",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectPriceQuote { .. } => "select_price_quote",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectCalendarLinks { .. } => "select_calendar_links",
    }
}
