//! Health check capability (`dataspace:health-check-service`).
//!
//! # Responsibility
//! - Collect liveness, readiness and startup status providers.
//! - Cache the latest evaluation; refresh on demand or periodically.
//!
//! # Invariants
//! - Providers are evaluated outside the provider and cache locks.
//! - An empty provider list reports healthy.

use crate::monitor::Monitor;
use crate::system::capability::{ServiceKey, CAPABILITY_HEALTH_CHECK_SERVICE};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Outcome of one status provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthCheckResult {
    Success,
    Failed { reason: String },
}

impl HealthCheckResult {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Aggregate of all results for one check kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub results: Vec<HealthCheckResult>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.results.iter().all(HealthCheckResult::is_healthy)
    }
}

/// Status provider callback.
pub type StatusProvider = Box<dyn Fn() -> HealthCheckResult + Send + Sync>;

pub const HEALTH_CHECK_SERVICE: ServiceKey<dyn HealthCheckService> =
    ServiceKey::new(CAPABILITY_HEALTH_CHECK_SERVICE);

/// Health check surface consumed by the runtime and modules.
pub trait HealthCheckService: Send + Sync {
    fn add_liveness_provider(&self, provider: StatusProvider);

    fn add_readiness_provider(&self, provider: StatusProvider);

    fn add_startup_status_provider(&self, provider: StatusProvider);

    fn liveness(&self) -> HealthStatus;

    fn readiness(&self) -> HealthStatus;

    fn startup_status(&self) -> HealthStatus;

    /// Re-evaluates every provider and replaces the cached statuses.
    fn refresh(&self);
}

/// Refresh periods for the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckServiceConfiguration {
    pub liveness_period: Duration,
    pub readiness_period: Duration,
    pub startup_status_period: Duration,
}

impl HealthCheckServiceConfiguration {
    /// Worker tick: the shortest configured period.
    pub fn refresh_period(&self) -> Duration {
        self.liveness_period
            .min(self.readiness_period)
            .min(self.startup_status_period)
    }
}

impl Default for HealthCheckServiceConfiguration {
    fn default() -> Self {
        let period = Duration::from_secs(60);
        Self {
            liveness_period: period,
            readiness_period: period,
            startup_status_period: period,
        }
    }
}

type SharedProvider = Arc<dyn Fn() -> HealthCheckResult + Send + Sync>;

#[derive(Default, Clone)]
struct ProviderLists {
    liveness: Vec<SharedProvider>,
    readiness: Vec<SharedProvider>,
    startup: Vec<SharedProvider>,
}

#[derive(Default, Clone)]
struct CachedStatus {
    liveness: HealthStatus,
    readiness: HealthStatus,
    startup: HealthStatus,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Default health check service with an optional refresh worker.
pub struct HealthCheckServiceImpl {
    config: HealthCheckServiceConfiguration,
    providers: Mutex<ProviderLists>,
    cache: Mutex<CachedStatus>,
    worker: Mutex<Option<Worker>>,
}

impl HealthCheckServiceImpl {
    pub fn new(config: HealthCheckServiceConfiguration) -> Self {
        Self {
            config,
            providers: Mutex::new(ProviderLists::default()),
            cache: Mutex::new(CachedStatus::default()),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the periodic refresh worker. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>, monitor: Arc<dyn Monitor>) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return Ok(());
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let period = self.config.refresh_period();
        let service = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("health-check".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => service.refresh(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        monitor.debug(&format!(
            "health check worker started, period={}ms",
            period.as_millis()
        ));
        *worker = Some(Worker { stop, handle });
        Ok(())
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            let _ = worker.handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn push(
        &self,
        select: impl FnOnce(&mut ProviderLists) -> &mut Vec<SharedProvider>,
        provider: StatusProvider,
    ) {
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        select(&mut providers).push(Arc::from(provider));
    }

    fn cached(&self) -> CachedStatus {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HealthCheckService for HealthCheckServiceImpl {
    fn add_liveness_provider(&self, provider: StatusProvider) {
        self.push(|lists| &mut lists.liveness, provider);
    }

    fn add_readiness_provider(&self, provider: StatusProvider) {
        self.push(|lists| &mut lists.readiness, provider);
    }

    fn add_startup_status_provider(&self, provider: StatusProvider) {
        self.push(|lists| &mut lists.startup, provider);
    }

    fn liveness(&self) -> HealthStatus {
        self.cached().liveness
    }

    fn readiness(&self) -> HealthStatus {
        self.cached().readiness
    }

    fn startup_status(&self) -> HealthStatus {
        self.cached().startup
    }

    fn refresh(&self) {
        // Providers may register further providers, so none runs under the lock.
        let providers = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let evaluate = |list: &[SharedProvider]| HealthStatus {
            results: list.iter().map(|provider| provider()).collect(),
        };
        let fresh = CachedStatus {
            liveness: evaluate(&providers.liveness),
            readiness: evaluate(&providers.readiness),
            startup: evaluate(&providers.startup),
        };
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
    }
}
