//! Structured logging for the driver.
//!
//! Every event is emitted under the `major_compactor` target and carries a
//! `component` field (`compactor`, `topology`, `queue`, `requester`, `monitor`)
//! and a snake_case `event` field, so `RUST_LOG=major_compactor=debug` isolates
//! the driver from the host application. Per-pair events are debug level; run
//! summaries are info. Nothing here installs a subscriber.
//!
//! Planning and the monitored phase of a run execute inside [`run_span`], which
//! tags nested events with the table and phase.

use tracing::Span;

/// Target for all driver log events.
pub(crate) const LOG_TARGET: &str = "major_compactor";

macro_rules! driver_event {
    ($level:ident, $($field:tt)*) => {
        ::tracing::$level!(target: $crate::observability::LOG_TARGET, $($field)*)
    };
}

macro_rules! log_info {
    ($($field:tt)*) => { $crate::observability::driver_event!(info, $($field)*) };
}

macro_rules! log_debug {
    ($($field:tt)*) => { $crate::observability::driver_event!(debug, $($field)*) };
}

macro_rules! log_warn {
    ($($field:tt)*) => { $crate::observability::driver_event!(warn, $($field)*) };
}

macro_rules! log_error {
    ($($field:tt)*) => { $crate::observability::driver_event!(error, $($field)*) };
}

pub(crate) use driver_event;
pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

/// Span wrapping one phase (`plan` or `run`) of a compaction run over `table`.
pub(crate) fn run_span(table: &str, phase: &'static str) -> Span {
    tracing::info_span!(target: LOG_TARGET, "major_compaction", table = %table, phase)
}
