//! In-process runtime for integration tests.
//!
//! Boots the same sequence as the production runtime with three
//! differences: service mocks are pinned into the context before any module
//! runs, system extensions can be supplied in memory, and boot failures are
//! returned instead of terminating the process.

use crate::config::{Config, ConfigFactory};
use crate::health::HealthCheckResult;
use crate::monitor::Monitor;
use crate::runtime::{BaseRuntime, RuntimeHandle, RuntimeHooks, ShutdownHook};
use crate::system::capability::{CapabilityId, ServiceKey};
use crate::system::context::{ServiceExtensionContext, ServiceHandle, ServiceResolutionError};
use crate::system::loader::{load_vault, BootError, ShutdownFailure};
use crate::system::locator::{
    ExtensionPoint, ManifestServiceLocator, OverrideServiceLocator, ServiceLocator,
};
use crate::types::TypeManager;
use crate::vault::VAULT;
use std::collections::BTreeMap;
use std::sync::Arc;

const TEST_ORIGIN: &str = "test";

struct TestHooks {
    locator: Option<OverrideServiceLocator>,
    mocks: Vec<(CapabilityId, ServiceHandle)>,
    settings: BTreeMap<String, String>,
}

impl RuntimeHooks for TestHooks {
    fn create_service_locator(&mut self) -> Box<dyn ServiceLocator> {
        match self.locator.take() {
            Some(locator) => Box::new(locator),
            None => Box::new(ManifestServiceLocator::new()),
        }
    }

    fn create_context(
        &mut self,
        type_manager: Arc<TypeManager>,
        monitor: Arc<dyn Monitor>,
        locator: Box<dyn ServiceLocator>,
    ) -> ServiceExtensionContext {
        let mut context = ServiceExtensionContext::new(type_manager, monitor, locator);
        context.set_config_overrides(ConfigFactory::from_map(self.settings.clone()));
        for (capability, handle) in self.mocks.drain(..) {
            context.register_pinned_service_handle(capability, handle);
        }
        context
    }

    fn initialize_vault(
        &mut self,
        context: &mut ServiceExtensionContext,
    ) -> Result<(), BootError> {
        if context.has_service(VAULT.id()) {
            return Ok(());
        }
        load_vault(context)
    }

    fn install_shutdown_hook(&mut self, _hook: ShutdownHook, _monitor: &dyn Monitor) {}

    fn on_error(&mut self, error: &BootError, monitor: &dyn Monitor) {
        monitor.severe("Error booting test runtime", Some(error));
    }
}

/// Test harness booting a full runtime inside the current process.
///
/// ```ignore
/// let mut runtime = TestRuntime::new();
/// runtime.register_service_mock(VAULT, Arc::new(InMemoryVault::new()));
/// runtime.boot()?;
/// let health = runtime.service(HEALTH_CHECK_SERVICE)?;
/// ```
pub struct TestRuntime {
    runtime: BaseRuntime<TestHooks>,
    handle: Option<RuntimeHandle>,
}

impl TestRuntime {
    /// Runtime discovering modules from the static manifest.
    pub fn new() -> Self {
        Self::with_delegate(Box::new(ManifestServiceLocator::new()))
    }

    /// Runtime that only sees in-memory registrations.
    pub fn without_manifest() -> Self {
        Self::with_delegate(Box::new(ManifestServiceLocator::with_entries(&[])))
    }

    pub fn with_delegate(delegate: Box<dyn ServiceLocator>) -> Self {
        Self {
            runtime: BaseRuntime::with_hooks(TestHooks {
                locator: Some(OverrideServiceLocator::new(delegate)),
                mocks: Vec::new(),
                settings: BTreeMap::new(),
            }),
            handle: None,
        }
    }

    /// Pins `service` under `key`; modules providing the same capability
    /// cannot replace it.
    pub fn register_service_mock<T: ?Sized + Send + Sync + 'static>(
        &mut self,
        key: ServiceKey<T>,
        service: Arc<T>,
    ) {
        self.runtime
            .hooks_mut()
            .mocks
            .push((key.capability(), ServiceHandle::new(service)));
    }

    /// Adds an in-memory implementation of an extension point.
    pub fn register_system_extension<I>(&mut self, extension: Box<I>)
    where
        I: ExtensionPoint + ?Sized,
        Box<I>: Send,
    {
        match &self.runtime.hooks().locator {
            Some(locator) => locator.register(TEST_ORIGIN, extension),
            None => log::warn!(
                "system extension for {} registered after boot is ignored",
                I::NAME
            ),
        }
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.runtime
            .hooks_mut()
            .settings
            .insert(key.into(), value.into());
    }

    /// Boots once; later calls are no-ops.
    pub fn boot(&mut self) -> Result<(), BootError> {
        if self.handle.is_none() {
            self.handle = Some(self.runtime.boot()?);
        }
        Ok(())
    }

    pub fn is_booted(&self) -> bool {
        self.handle.is_some()
    }

    /// Startup status as reported to the health check, also before and
    /// after a failed boot.
    pub fn startup_status(&self) -> HealthCheckResult {
        self.runtime.startup_status()
    }

    pub fn context(&self) -> Option<&ServiceExtensionContext> {
        self.handle.as_ref().map(RuntimeHandle::context)
    }

    pub fn handle(&self) -> Option<&RuntimeHandle> {
        self.handle.as_ref()
    }

    pub fn config(&self) -> Config {
        self.context()
            .map(|context| context.config().clone())
            .unwrap_or_default()
    }

    /// Typed lookup against the booted context.
    pub fn service<T: ?Sized + 'static>(
        &self,
        key: ServiceKey<T>,
    ) -> Result<Arc<T>, ServiceResolutionError> {
        match self.context() {
            Some(context) => context.get_service(key),
            None => Err(ServiceResolutionError::Missing(key.capability())),
        }
    }

    /// Runs the shutdown sequence of a booted runtime.
    pub fn shutdown(&mut self) -> Vec<ShutdownFailure> {
        match &self.handle {
            Some(handle) => handle.shutdown(),
            None => Vec::new(),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::TestRuntime;
    use crate::core_services::CoreServicesExtension;
    use crate::system::extension::ServiceExtension;
    use crate::vault::{InMemoryVault, Vault, VAULT};
    use std::sync::Arc;

    #[test]
    fn service_lookup_before_boot_is_missing() {
        let runtime = TestRuntime::without_manifest();
        assert!(runtime.service(VAULT).is_err());
        assert!(!runtime.is_booted());
    }

    #[test]
    fn boots_in_memory_modules_with_pinned_mock() {
        let mut runtime = TestRuntime::without_manifest();
        let vault = Arc::new(InMemoryVault::new());
        vault.store_secret("api-key", "s3cret").expect("store secret");
        let shared: Arc<dyn Vault> = vault;
        runtime.register_service_mock(VAULT, shared);
        runtime.register_system_extension::<dyn ServiceExtension>(Box::new(
            CoreServicesExtension::default(),
        ));
        runtime.set_setting("edc.connector.name", "test-connector");

        runtime.boot().expect("test runtime boots");

        let resolved = runtime.service(VAULT).expect("vault mock registered");
        assert_eq!(resolved.resolve_secret("api-key").as_deref(), Some("s3cret"));
        assert_eq!(
            runtime.context().map(|context| context.connector_id().to_string()),
            Some("test-connector".to_string())
        );
        assert!(runtime
            .handle()
            .map(|handle| handle.startup_status().is_healthy())
            .unwrap_or(false));
        assert!(runtime.shutdown().is_empty());
    }
}
