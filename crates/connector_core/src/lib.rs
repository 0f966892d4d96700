//! Connector runtime core.
//! Module system, boot sequence and the singleton services every module
//! can rely on.

pub mod config;
pub mod core_services;
pub mod health;
pub mod launcher;
pub mod logging;
pub mod monitor;
pub mod runtime;
pub mod system;
pub mod types;
pub mod vault;

pub use config::{Config, ConfigError, ConfigFactory, ConfigResult, ConfigurationExtension};
pub use health::{
    HealthCheckResult, HealthCheckService, HealthCheckServiceImpl, HealthStatus,
    HEALTH_CHECK_SERVICE,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use monitor::{LogMonitor, Monitor, MonitorExtension, MultiplexingMonitor, MONITOR};
pub use runtime::{BaseRuntime, DefaultRuntimeHooks, RuntimeHandle, RuntimeHooks, ShutdownHook};
pub use system::capability::{CapabilityId, ServiceKey};
pub use system::context::{ServiceExtensionContext, ServiceResolutionError};
pub use system::extension::{
    ExtensionError, ExtensionResult, ExtensionState, Requirement, ServiceExtension,
};
pub use system::injection::{DefaultInjector, InjectionContainer, InjectionPoint, Injector};
pub use system::loader::{BootError, ExtensionLoader, LifecycleLimits, ShutdownFailure};
pub use system::locator::{
    DiscoveryError, ManifestEntry, ManifestFactory, ManifestServiceLocator,
    OverrideServiceLocator, ServiceLocator, ServiceLocatorExt, EXTENSION_MANIFEST,
};
pub use types::{TypeManager, TYPE_MANAGER};
pub use vault::{InMemoryVault, Vault, VaultExtension, VAULT};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
