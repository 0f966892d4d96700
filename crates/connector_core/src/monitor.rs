//! Monitor capability: the logging sink modules write to.
//!
//! # Responsibility
//! - Define the `Monitor` contract consumed through `dataspace:monitor`.
//! - Hold the process-wide monitor installed by the runtime.
//!
//! # Invariants
//! - Monitors never fail; emission errors are swallowed by the backend.
//! - The process-wide instance falls back to `LogMonitor` until installed.

use crate::system::capability::{ServiceKey, CAPABILITY_MONITOR};
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use std::error::Error;
use std::sync::{Arc, PoisonError, RwLock};

/// Logging sink handed to modules.
pub trait Monitor: Send + Sync {
    fn debug(&self, message: &str);

    fn info(&self, message: &str);

    fn warning(&self, message: &str);

    /// Reports a severe condition, optionally with its cause.
    fn severe(&self, message: &str, cause: Option<&(dyn Error + 'static)>);
}

pub const MONITOR: ServiceKey<dyn Monitor> = ServiceKey::new(CAPABILITY_MONITOR);

/// Discoverable monitor backend, loaded before any service extension.
pub trait MonitorExtension: Send {
    fn name(&self) -> &str;

    fn monitor(&self) -> Arc<dyn Monitor>;
}

/// Default monitor forwarding to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMonitor;

impl Monitor for LogMonitor {
    fn debug(&self, message: &str) {
        debug!("{message}");
    }

    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn warning(&self, message: &str) {
        warn!("{message}");
    }

    fn severe(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        match cause {
            Some(err) => error!("{message}: {}", error_chain(err)),
            None => error!("{message}"),
        }
    }
}

/// Fans every call out to several monitors.
pub struct MultiplexingMonitor {
    monitors: Vec<Arc<dyn Monitor>>,
}

impl MultiplexingMonitor {
    pub fn new(monitors: Vec<Arc<dyn Monitor>>) -> Self {
        Self { monitors }
    }
}

impl Monitor for MultiplexingMonitor {
    fn debug(&self, message: &str) {
        self.monitors.iter().for_each(|m| m.debug(message));
    }

    fn info(&self, message: &str) {
        self.monitors.iter().for_each(|m| m.info(message));
    }

    fn warning(&self, message: &str) {
        self.monitors.iter().for_each(|m| m.warning(message));
    }

    fn severe(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        self.monitors.iter().for_each(|m| m.severe(message, cause));
    }
}

/// Renders an error and its `source()` chain on one line.
pub fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

static INSTANCE: Lazy<RwLock<Option<Arc<dyn Monitor>>>> = Lazy::new(|| RwLock::new(None));

/// Installs the process-wide monitor, replacing any previous one.
pub fn set_instance(monitor: Arc<dyn Monitor>) {
    let mut slot = INSTANCE.write().unwrap_or_else(PoisonError::into_inner);
    *slot = Some(monitor);
}

/// Returns the process-wide monitor.
pub fn instance() -> Arc<dyn Monitor> {
    let slot = INSTANCE.read().unwrap_or_else(PoisonError::into_inner);
    match slot.as_ref() {
        Some(monitor) => Arc::clone(monitor),
        None => Arc::new(LogMonitor),
    }
}
