//! Configuration for the Xolo server process.
//!
//! Unlike the teacher's `config.rs`, which exposes a bag of free functions
//! that each call `env::var(...).expect(...)` on demand, Xolo loads its
//! environment once at startup into a single long-lived [`Config`] struct
//! and passes it down explicitly — Design Note §9 calls out hidden
//! module-level singletons as something to avoid, and per-call `env::var`
//! lookups are the same anti-pattern in miniature.

use std::path::PathBuf;
use std::time::Duration;

/// All tunables for a running Xolo process.
///
/// Loaded once in `main` and handed to [`crate::state::AppState::new`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk title/version store (spec §4.1).
    pub data_dir: PathBuf,
    /// Address the HTTPS listener binds to.
    pub bind_addr: String,
    /// PEM certificate path (self-signed acceptable for internal calls, spec §6).
    pub tls_cert_path: Option<PathBuf>,
    /// PEM private key path.
    pub tls_key_path: Option<PathBuf>,

    /// Base URL of the upstream Patch Catalog service.
    pub catalog_base_url: String,
    pub catalog_token: String,

    /// Base URL of the downstream Fleet Management service.
    pub fleet_base_url: String,
    pub fleet_token: String,

    /// Jamf/LDAP-style group whose members may call `SERVER_ADMIN_ROUTES`.
    pub server_admin_group: String,
    /// Group whose members may call ordinary authenticated routes.
    pub admin_group: String,

    /// Local clock hour at which the scheduler's cleanup workflow is eligible to run (spec §4.9).
    pub cleanup_hour: u32,
    /// Deprecated versions older than this are deleted by cleanup. `<= 0` disables.
    pub deprecated_lifetime_days: i64,
    /// If set, skipped versions are never auto-deleted by cleanup.
    pub keep_skipped_versions: bool,
    /// Days a title's newest version may sit in `pilot` before a notification email fires.
    pub unreleased_pilots_notification_days: i64,

    /// When set, `ClientDataBuilder::build_and_upload` is a no-op (spec §4.11).
    pub developer_mode: bool,

    /// Bound on the patch-visibility / EA-acceptance watchers (spec §4.7).
    pub max_wait_for_catalog: Duration,
    /// Bound the package-deletion pool waits for on shutdown (spec §4.8).
    pub max_wait_for_pkg_deletion: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads `.env` (from `config_path`, or the data directory if unset,
    /// following the teacher's `dotenv`/`dirs` pattern) and then builds a
    /// `Config` from the process environment, applying documented defaults
    /// for anything unset.
    pub async fn load(config_path: Option<PathBuf>) -> Self {
        let env_path = match config_path {
            Some(p) => p,
            None => {
                let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
                p.push("xolo/.env");
                p
            }
        };
        if let Some(parent) = env_path.parent() {
            let _ = async_fs::create_dir_all(parent).await;
        }
        let _ = dotenv::from_path(&env_path);

        let data_dir = std::env::var("XOLO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
                p.push("xolo/data");
                p
            });

        Config {
            data_dir,
            bind_addr: env_or("XOLO_BIND_ADDR", "0.0.0.0:443"),
            tls_cert_path: std::env::var("XOLO_TLS_CERT").ok().map(PathBuf::from),
            tls_key_path: std::env::var("XOLO_TLS_KEY").ok().map(PathBuf::from),

            catalog_base_url: env_or("XOLO_CATALOG_URL", "https://catalog.internal"),
            catalog_token: env_or("XOLO_CATALOG_TOKEN", ""),

            fleet_base_url: env_or("XOLO_FLEET_URL", "https://fleet.internal"),
            fleet_token: env_or("XOLO_FLEET_TOKEN", ""),

            server_admin_group: env_or("XOLO_SERVER_ADMIN_GROUP", "xolo-server-admins"),
            admin_group: env_or("XOLO_ADMIN_GROUP", "xolo-admins"),

            cleanup_hour: env_i64("XOLO_CLEANUP_HOUR", 2) as u32,
            deprecated_lifetime_days: env_i64("XOLO_DEPRECATED_LIFETIME_DAYS", 30),
            keep_skipped_versions: env_bool("XOLO_KEEP_SKIPPED_VERSIONS", false),
            unreleased_pilots_notification_days: env_i64(
                "XOLO_UNRELEASED_PILOTS_NOTIFICATION_DAYS",
                180,
            ),

            developer_mode: env_bool("XOLO_DEVELOPER_MODE", false),

            max_wait_for_catalog: Duration::from_secs(
                env_i64("XOLO_MAX_WAIT_FOR_CATALOG_SECS", 3600).max(0) as u64,
            ),
            max_wait_for_pkg_deletion: Duration::from_secs(
                env_i64("XOLO_MAX_WAIT_FOR_PKG_DELETION_SECS", 1800).max(0) as u64,
            ),
        }
    }
}
