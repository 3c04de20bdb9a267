//! Process-wide application state (spec §5 "Shared-resource policy", §9
//! "Module-level mutable state").
//!
//! Every long-lived structure the spec calls out as module-level state —
//! the lock maps, the changelog locks (both inside [`LockManager`]), the
//! scheduler, the ClientData mutex, the package-deletion pool, the internal
//! loopback auth token, and the shutdown flag — is an explicit field here,
//! owned by the server process and handed to workflows by reference. There
//! is deliberately no `static`/`lazy_static` singleton anywhere in the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::catalog::{CatalogClient, HttpCatalogClient};
use crate::client_data::ClientDataBuilder;
use crate::config::Config;
use crate::fleet::{FleetClient, HttpFleetClient};
use crate::lock::LockManager;
use crate::logging::LogControl;
use crate::pkg_deletion::{self, PkgDeletionPool};
use crate::progress::ProgressRegistry;
use crate::release::ReleaseEngine;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::Store;
use crate::title::TitleService;
use crate::version::VersionService;
use crate::watchers::WatcherRegistry;

/// Generates the per-process loopback bearer token: 64 CSPRNG bytes,
/// hex-encoded to 128 characters (spec §6: "the `Authorization` header
/// equals `Bearer <per-process 128-hex token>`").
fn generate_internal_token() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub active_locks: usize,
    pub active_watchers: usize,
    pub outstanding_progress: usize,
    pub outstanding_pkg_deletions: usize,
    pub shutting_down: bool,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub locks: Arc<LockManager>,
    pub catalog: Arc<dyn CatalogClient>,
    pub fleet: Arc<dyn FleetClient>,
    pub watchers: Arc<WatcherRegistry>,
    pub progress: Arc<ProgressRegistry>,
    pub pkg_deletion: PkgDeletionPool,

    pub titles: Arc<TitleService>,
    pub versions: Arc<VersionService>,
    pub releases: Arc<ReleaseEngine>,
    pub client_data: Arc<ClientDataBuilder>,
    pub scheduler: Arc<Scheduler>,
    scheduler_task: std::sync::Mutex<Option<JoinHandle<()>>>,

    /// Per-process bearer token internal calls must present (spec §6,
    /// SPEC_FULL.md's loopback-auth supplement).
    pub internal_token: String,
    pub log_control: LogControl,
    started_at: std::time::Instant,
    shutting_down: AtomicBool,
}

impl AppState {
    pub fn new(config: Config, log_control: LogControl) -> Arc<Self> {
        let store = Arc::new(Store::new(config.data_dir.clone()));
        let locks = Arc::new(LockManager::new());
        let catalog: Arc<dyn CatalogClient> = Arc::new(HttpCatalogClient::new(
            config.catalog_base_url.clone(),
            config.catalog_token.clone(),
        ));
        let fleet: Arc<dyn FleetClient> = Arc::new(HttpFleetClient::new(
            config.fleet_base_url.clone(),
            config.fleet_token.clone(),
        ));
        let watchers = Arc::new(WatcherRegistry::with_max_wait(config.max_wait_for_catalog));
        let progress = Arc::new(ProgressRegistry::new(config.data_dir.join("progress")));
        let (pkg_deletion, _pkg_deletion_worker) = PkgDeletionPool::spawn(Arc::clone(&fleet));

        let titles = Arc::new(TitleService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
            Arc::clone(&watchers),
        ));
        let versions = Arc::new(VersionService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
            Arc::clone(&watchers),
            pkg_deletion.clone(),
        ));
        let releases = Arc::new(ReleaseEngine::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&catalog),
            Arc::clone(&fleet),
        ));
        let client_data = Arc::new(ClientDataBuilder::new(
            Arc::clone(&store),
            Arc::clone(&fleet),
            None,
            config.developer_mode,
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&fleet),
            Arc::clone(&versions),
            SchedulerConfig {
                cleanup_hour: config.cleanup_hour,
                deprecated_lifetime_days: config.deprecated_lifetime_days,
                keep_skipped_versions: config.keep_skipped_versions,
                unreleased_pilots_notification_days: config.unreleased_pilots_notification_days,
            },
        ));

        let internal_token = generate_internal_token();

        Arc::new(AppState {
            config,
            store,
            locks,
            catalog,
            fleet,
            watchers,
            progress,
            pkg_deletion,
            titles,
            versions,
            releases,
            client_data,
            scheduler,
            scheduler_task: std::sync::Mutex::new(None),
            internal_token,
            log_control,
            started_at: std::time::Instant::now(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// spec §6 `/state`: a snapshot of process health (counts, not secrets),
    /// mirroring the teacher's `/health` handler's shape.
    pub async fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_locks: self.locks.active_lock_count(),
            active_watchers: self.watchers.active_count(),
            outstanding_progress: self.progress.outstanding_count().await,
            outstanding_pkg_deletions: self.pkg_deletion.outstanding_count(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Spawns the scheduler's dedicated timer worker (spec §5: "The
    /// Scheduler runs its timer on a dedicated worker").
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let scheduler = Arc::clone(&self.scheduler);
        let handle = tokio::spawn(async move { scheduler.run_forever().await });
        *self.scheduler_task.lock().unwrap() = Some(handle);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst) || self.locks.is_shutting_down()
    }

    /// Graceful shutdown (spec §5): flip the flag so new requests 503, drain
    /// the progress/watcher/deletion pools under their configured budgets,
    /// and wait for entity locks to clear.
    pub async fn shutdown(&self) {
        info!("shutdown: beginning graceful shutdown sequence");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.scheduler.begin_shutdown();

        self.progress.drain(Duration::from_secs(30)).await;
        self.watchers.drain(self.config.max_wait_for_catalog).await;

        pkg_deletion::drain(self.pkg_deletion.clone(), self.config.max_wait_for_pkg_deletion).await;

        self.locks.begin_shutdown_and_wait(Duration::from_secs(1)).await;
        info!("shutdown: complete");
    }
}
