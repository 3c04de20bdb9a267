//! Structured logging setup (spec §6 `/rotate-logs`, `/set-log-level`).
//!
//! Xolo logs through `tracing` rather than the teacher's bespoke
//! `info!`/`success!`/`warning!`/`error!` macros. A `tracing_subscriber::reload`
//! handle lets `/set-log-level` adjust the active `EnvFilter` without
//! restarting the process; `tracing-appender` writes to a daily-rotating
//! file so `/rotate-logs` has something to report on — the appender already
//! rotates automatically at day boundaries, so the route is an audit hook
//! recording that an operator asked for one, not a trigger the crate exposes.

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

pub struct LogControl {
    filter_handle: FilterHandle,
    log_dir: PathBuf,
}

impl LogControl {
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    /// spec §6 `/set-log-level`: swaps the active filter directive (e.g.
    /// `"debug"`, `"xolo=trace,tower_http=info"`) without a restart.
    pub fn set_level(&self, directive: &str) -> Result<(), String> {
        let filter = EnvFilter::try_new(directive).map_err(|e| e.to_string())?;
        self.filter_handle.reload(filter).map_err(|e| e.to_string())
    }
}

/// Initializes the process-wide subscriber: a daily-rotating file appender
/// plus a reloadable `EnvFilter` seeded from `RUST_LOG`, defaulting to
/// `info`. Must be called exactly once, before any other module logs.
pub fn init(log_dir: PathBuf) -> (LogControl, tracing_appender::non_blocking::WorkerGuard) {
    let appender = tracing_appender::rolling::daily(&log_dir, "xolo.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    let fmt_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

    Registry::default().with(filter_layer).with(fmt_layer).init();

    (LogControl { filter_handle, log_dir }, guard)
}
