use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "shiftline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "shiftline_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "shiftline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "shiftline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "shiftline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "shiftline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "shiftline_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "shiftline_wal_compactions_total";

// ── Scheduling metrics ──────────────────────────────────────────

/// Counter: delay evaluations. Labels: outcome (noise, minor, significant, catching_up).
pub const DELAY_EVALUATIONS_TOTAL: &str = "shiftline_delay_evaluations_total";

/// Counter: downstream appointments whose delay changed in a ripple.
pub const RIPPLE_UPDATES_TOTAL: &str = "shiftline_ripple_updates_total";

/// Counter: client/provider notices. Labels: kind, status (sent, failed).
pub const NOTIFICATIONS_TOTAL: &str = "shiftline_notifications_total";

/// Counter: crisis alerts. Labels: status (sent, suppressed).
pub const CRISIS_ALERTS_TOTAL: &str = "shiftline_crisis_alerts_total";

/// Counter: autopilot cycles. Labels: role (leader, standby).
pub const AUTOPILOT_CYCLES_TOTAL: &str = "shiftline_autopilot_cycles_total";

/// Counter: autopilot tasks executed. Labels: kind (start, end), status.
pub const AUTOPILOT_TASKS_TOTAL: &str = "shiftline_autopilot_tasks_total";

/// Counter: reassignments applied. Labels: mode (manual, smart, transfer).
pub const REASSIGNMENTS_TOTAL: &str = "shiftline_reassignments_total";

/// Counter: overrunning sessions detected by the scan.
pub const OVERRUNS_TOTAL: &str = "shiftline_overruns_total";

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
        Command::InsertBusiness(_) => "insert_business",
        Command::InsertProvider(_) => "insert_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::InsertWorkingHours { .. } => "insert_working_hours",
        Command::InsertBreak { .. } => "insert_break",
        Command::DeleteBreak { .. } => "delete_break",
        Command::InsertSkill { .. } => "insert_skill",
        Command::DeleteSkill { .. } => "delete_skill",
        Command::InsertClient(_) => "insert_client",
        Command::InsertAppointment(_) => "insert_appointment",
        Command::StartAppointment { .. } => "start_appointment",
        Command::EndAppointment { .. } => "end_appointment",
        Command::CloseAppointment { .. } => "close_appointment",
        Command::ShiftAppointment { .. } => "shift_appointment",
        Command::SetPresence { .. } => "set_presence",
        Command::InsertTransfer { .. } => "insert_transfer",
        Command::ResolveTransfer { .. } => "resolve_transfer",
        Command::ApplyReassignments { .. } => "apply_reassignments",
        Command::AcquireLease { .. } => "acquire_lease",
        Command::SelectBusinesses => "select_businesses",
        Command::SelectProviders { .. } => "select_providers",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectTransfers { .. } => "select_transfers",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSlotCheck { .. } => "select_slot_check",
        Command::SelectNextSlot { .. } => "select_next_slot",
        Command::SelectReassignments { .. } => "select_reassignments",
        Command::SelectHealth { .. } => "select_health",
        Command::SelectLease { .. } => "select_lease",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
