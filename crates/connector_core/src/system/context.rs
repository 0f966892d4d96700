//! Capability registry and the context handed to service extensions.
//!
//! # Responsibility
//! - Map capability ids to the instances providing them.
//! - Own the boot-time collaborators: config, monitor, type manager and the
//!   discovery mechanism.
//!
//! # Invariants
//! - A capability is visible only after the module registering it has run
//!   `initialize`; the loader's ordering guarantees providers run first.
//! - Entries are never removed during normal operation.
//! - Overwriting a registration is allowed but reported as a warning.

use crate::config::{Config, ConfigFactory, ConfigurationExtension};
use crate::monitor::{Monitor, MONITOR};
use crate::system::capability::{CapabilityId, ServiceKey};
use crate::system::extension::ServiceExtension;
use crate::system::injection::InjectionContainer;
use crate::system::loader::BootError;
use crate::system::locator::{DiscoveryError, ServiceLocator, ServiceLocatorExt};
use crate::types::{TypeManager, TYPE_MANAGER};
use figment::Figment;
use std::any::Any;
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Setting holding the connector id.
pub const CONNECTOR_NAME_SETTING: &str = "edc.connector.name";

/// Type-erased service instance stored in the registry.
///
/// Wraps an `Arc<T>` so trait-object services keep their vtable.
#[derive(Clone)]
pub struct ServiceHandle {
    instance: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ServiceHandle {
    pub fn new<T: ?Sized + Send + Sync + 'static>(service: Arc<T>) -> Self {
        Self {
            instance: Arc::new(service),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Returns the service as `Arc<T>` when it was registered as `T`.
    pub fn downcast<T: ?Sized + 'static>(&self) -> Option<Arc<T>> {
        self.instance.downcast_ref::<Arc<T>>().cloned()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServiceHandle").field(&self.type_name).finish()
    }
}

impl Borrow<str> for CapabilityId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Capability id to provider table.
///
/// Shared between the context and the shutdown hook, which clears it once
/// every module has stopped.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<BTreeMap<CapabilityId, ServiceHandle>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle`, returning the handle it replaced.
    pub fn register(
        &self,
        capability: CapabilityId,
        handle: ServiceHandle,
    ) -> Option<ServiceHandle> {
        self.write().insert(capability, handle)
    }

    /// Looks up a provider; absence is an error only when `required`.
    pub fn resolve(
        &self,
        capability: &CapabilityId,
        required: bool,
    ) -> Result<Option<ServiceHandle>, ServiceResolutionError> {
        match self.read().get(capability) {
            Some(handle) => Ok(Some(handle.clone())),
            None if required => Err(ServiceResolutionError::Missing(capability.clone())),
            None => Ok(None),
        }
    }

    pub fn has(&self, capability: &str) -> bool {
        self.read().contains_key(capability)
    }

    /// Registered capability ids, sorted.
    pub fn capabilities(&self) -> Vec<CapabilityId> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drops every registration. Only for process teardown.
    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<CapabilityId, ServiceHandle>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<CapabilityId, ServiceHandle>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Context handed to every service extension.
pub struct ServiceExtensionContext {
    registry: Arc<ServiceRegistry>,
    pinned: BTreeSet<CapabilityId>,
    config: Config,
    config_overrides: Config,
    monitor: Arc<dyn Monitor>,
    type_manager: Arc<TypeManager>,
    locator: Box<dyn ServiceLocator>,
    connector_id: String,
}

impl ServiceExtensionContext {
    /// Creates the context and publishes the monitor and type manager.
    pub fn new(
        type_manager: Arc<TypeManager>,
        monitor: Arc<dyn Monitor>,
        locator: Box<dyn ServiceLocator>,
    ) -> Self {
        let mut context = Self {
            registry: Arc::new(ServiceRegistry::new()),
            pinned: BTreeSet::new(),
            config: Config::default(),
            config_overrides: Config::default(),
            monitor: Arc::clone(&monitor),
            type_manager: Arc::clone(&type_manager),
            locator,
            connector_id: String::new(),
        };
        context.register_service(MONITOR, monitor);
        context.register_service(TYPE_MANAGER, type_manager);
        context
    }

    /// Settings applied over every other configuration source.
    pub fn set_config_overrides(&mut self, overrides: Config) {
        self.config_overrides = overrides;
    }

    /// Loads configuration and derives the connector id.
    ///
    /// Sources, lowest precedence first: the optional configuration
    /// extension, environment variables, programmatic overrides.
    pub fn initialize(&mut self) -> Result<(), BootError> {
        let mut sources = Figment::new();
        let extension = self
            .locator
            .load_singleton_implementor::<dyn ConfigurationExtension>(false)?;
        if let Some(mut extension) = extension {
            extension
                .initialize(self.monitor.as_ref())
                .map_err(BootError::Config)?;
            self.monitor.info(&format!("Initialized {}", extension.name()));
            sources = sources.merge(extension.config());
        }
        let sources = sources
            .merge(ConfigFactory::environment())
            .merge(self.config_overrides.clone());
        let config = ConfigFactory::from_figment(&sources).map_err(BootError::Config)?;

        self.connector_id = config.get_string_or(
            CONNECTOR_NAME_SETTING,
            &format!("edc-{}", Uuid::new_v4()),
        );
        self.config = config;
        Ok(())
    }

    /// Discovers every service extension and wraps it for injection.
    pub fn load_service_extensions(&self) -> Result<Vec<InjectionContainer>, DiscoveryError> {
        let extensions = self
            .locator
            .load_implementors::<dyn ServiceExtension>(true)?;
        Ok(extensions.into_iter().map(InjectionContainer::new).collect())
    }

    pub fn register_service<T: ?Sized + Send + Sync + 'static>(
        &mut self,
        key: ServiceKey<T>,
        service: Arc<T>,
    ) {
        self.register_service_handle(key.capability(), ServiceHandle::new(service));
    }

    /// Untyped registration, used when the key type is erased.
    pub fn register_service_handle(&mut self, capability: CapabilityId, handle: ServiceHandle) {
        let replaced_type = handle.type_name();
        if self.pinned.contains(&capability) {
            self.monitor.warning(&format!(
                "capability {capability} is pinned, registration of {replaced_type} skipped"
            ));
            return;
        }
        if let Some(previous) = self.registry.register(capability.clone(), handle) {
            self.monitor.warning(&format!(
                "capability {capability} re-registered: {} replaced by {replaced_type}",
                previous.type_name()
            ));
        }
    }

    /// Registers a service that later registrations cannot replace.
    pub fn register_pinned_service_handle(
        &mut self,
        capability: CapabilityId,
        handle: ServiceHandle,
    ) {
        self.registry.register(capability.clone(), handle);
        self.pinned.insert(capability);
    }

    /// Resolves `capability`; absence fails only when `required`.
    pub fn resolve(
        &self,
        capability: &CapabilityId,
        required: bool,
    ) -> Result<Option<ServiceHandle>, ServiceResolutionError> {
        self.registry.resolve(capability, required)
    }

    /// Returns the required service registered under `key`.
    pub fn get_service<T: ?Sized + 'static>(
        &self,
        key: ServiceKey<T>,
    ) -> Result<Arc<T>, ServiceResolutionError> {
        let capability = key.capability();
        let handle = self
            .registry
            .resolve(&capability, true)?
            .ok_or_else(|| ServiceResolutionError::Missing(capability.clone()))?;
        handle
            .downcast::<T>()
            .ok_or_else(|| ServiceResolutionError::TypeMismatch {
                capability,
                expected: std::any::type_name::<T>(),
                actual: handle.type_name(),
            })
    }

    /// Returns the service under `key`, or `None` when absent or registered
    /// with another type.
    pub fn find_service<T: ?Sized + 'static>(&self, key: ServiceKey<T>) -> Option<Arc<T>> {
        match self.get_service(key) {
            Ok(service) => Some(service),
            Err(ServiceResolutionError::Missing(_)) => None,
            Err(err) => {
                self.monitor.warning(&err.to_string());
                None
            }
        }
    }

    pub fn has_service(&self, capability: &str) -> bool {
        self.registry.has(capability)
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Shared handle on the registry, for teardown after shutdown.
    pub fn registry_handle(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn locator(&self) -> &dyn ServiceLocator {
        self.locator.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get_setting(&self, key: &str, default_value: &str) -> String {
        self.config.get_string_or(key, default_value)
    }

    pub fn monitor(&self) -> Arc<dyn Monitor> {
        Arc::clone(&self.monitor)
    }

    pub fn type_manager(&self) -> Arc<TypeManager> {
        Arc::clone(&self.type_manager)
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }
}

/// Registry lookup failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResolutionError {
    Missing(CapabilityId),
    TypeMismatch {
        capability: CapabilityId,
        expected: &'static str,
        actual: &'static str,
    },
}

impl Display for ServiceResolutionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(capability) => {
                write!(f, "no service registered for capability {capability}")
            }
            Self::TypeMismatch {
                capability,
                expected,
                actual,
            } => write!(
                f,
                "capability {capability} is registered as {actual}, requested as {expected}"
            ),
        }
    }
}

impl Error for ServiceResolutionError {}
