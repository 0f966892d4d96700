//! Runtime entry point.
//!
//! # Responsibility
//! - Drive the boot sequence: core services, context, vault, discovery,
//!   shutdown hook, module lifecycle, startup status.
//! - Expose every step through `RuntimeHooks` so embedders can replace it.
//!
//! # Invariants
//! - A failed boot never runs module shutdown.
//! - The shutdown sequence runs at most once per boot and empties the
//!   service registry once every module has stopped.
//! - Startup status reports failure until every module has started.

use crate::health::{HealthCheckResult, HEALTH_CHECK_SERVICE};
use crate::monitor::{self, LogMonitor, Monitor};
use crate::system::context::{ServiceExtensionContext, ServiceRegistry};
use crate::system::injection::InjectionContainer;
use crate::system::loader::{
    load_monitor, load_vault, shutdown_extensions, BootError, ExtensionLoader, LifecycleLimits,
    ShutdownFailure,
};
use crate::system::locator::{ManifestServiceLocator, ServiceLocator};
use crate::types::TypeManager;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Overridable boot steps. Defaults implement the production runtime.
pub trait RuntimeHooks {
    fn create_type_manager(&mut self) -> Arc<TypeManager> {
        Arc::new(TypeManager::new())
    }

    fn create_service_locator(&mut self) -> Box<dyn ServiceLocator> {
        Box::new(ManifestServiceLocator::new())
    }

    fn create_monitor(
        &mut self,
        locator: &dyn ServiceLocator,
    ) -> Result<Arc<dyn Monitor>, BootError> {
        Ok(load_monitor(locator)?)
    }

    fn create_context(
        &mut self,
        type_manager: Arc<TypeManager>,
        monitor: Arc<dyn Monitor>,
        locator: Box<dyn ServiceLocator>,
    ) -> ServiceExtensionContext {
        ServiceExtensionContext::new(type_manager, monitor, locator)
    }

    fn initialize_context(
        &mut self,
        context: &mut ServiceExtensionContext,
    ) -> Result<(), BootError> {
        context.initialize()
    }

    fn initialize_vault(
        &mut self,
        context: &mut ServiceExtensionContext,
    ) -> Result<(), BootError> {
        load_vault(context)
    }

    fn create_extensions(
        &mut self,
        context: &ServiceExtensionContext,
    ) -> Result<Vec<InjectionContainer>, BootError> {
        Ok(context.load_service_extensions()?)
    }

    /// Registers `hook` to run on SIGINT/SIGTERM.
    fn install_shutdown_hook(&mut self, hook: ShutdownHook, monitor: &dyn Monitor) {
        if let Err(err) = ctrlc::set_handler(move || {
            hook.run();
        }) {
            monitor.warning(&format!("shutdown hook not installed: {err}"));
        }
    }

    fn boot_extensions(
        &mut self,
        context: &mut ServiceExtensionContext,
        extensions: Vec<InjectionContainer>,
        limits: LifecycleLimits,
    ) -> Result<Vec<InjectionContainer>, BootError> {
        ExtensionLoader::new()
            .with_limits(limits)
            .boot(context, extensions)
    }

    fn runtime_name(&self, _context: &ServiceExtensionContext) -> String {
        "EDC".to_string()
    }

    /// Reports a boot failure and terminates the process.
    fn on_error(&mut self, error: &BootError, monitor: &dyn Monitor) {
        monitor.severe("Error booting runtime", Some(error));
        std::process::exit(-1);
    }
}

/// Production hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRuntimeHooks;

impl RuntimeHooks for DefaultRuntimeHooks {}

/// Boot completion flag read by the startup health provider.
#[derive(Clone)]
pub struct StartupStatus(Arc<Mutex<HealthCheckResult>>);

impl StartupStatus {
    fn pending() -> Self {
        Self(Arc::new(Mutex::new(HealthCheckResult::failed(
            "Startup not complete",
        ))))
    }

    fn set(&self, result: HealthCheckResult) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    pub fn get(&self) -> HealthCheckResult {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum HookState {
    Pending,
    Armed(Vec<InjectionContainer>, Arc<ServiceRegistry>),
    Done,
}

struct HookShared {
    state: Mutex<HookState>,
    done: Condvar,
    monitor: Arc<dyn Monitor>,
    limits: LifecycleLimits,
}

/// Run-once trigger for the reverse-order shutdown.
///
/// A request arriving before the modules are handed over is remembered and
/// honored as soon as they are. The registry handed over with the modules is
/// cleared after they stop, so no service outlives its provider.
#[derive(Clone)]
pub struct ShutdownHook {
    shared: Arc<HookShared>,
}

impl ShutdownHook {
    pub fn new(monitor: Arc<dyn Monitor>, limits: LifecycleLimits) -> Self {
        Self {
            shared: Arc::new(HookShared {
                state: Mutex::new(HookState::Pending),
                done: Condvar::new(),
                monitor,
                limits,
            }),
        }
    }

    /// Hands over the booted modules and the registry their services live in.
    pub fn arm(&self, extensions: Vec<InjectionContainer>, registry: Arc<ServiceRegistry>) {
        let mut state = self.lock();
        if matches!(*state, HookState::Pending) {
            *state = HookState::Armed(extensions, registry);
            return;
        }
        drop(state);
        let mut extensions = extensions;
        self.stop(&mut extensions, &registry);
    }

    /// Marks the hook finished without stopping anything.
    pub fn disarm(&self) {
        let mut state = self.lock();
        *state = HookState::Done;
        self.shared.done.notify_all();
    }

    /// Runs the shutdown sequence; later calls are no-ops.
    pub fn run(&self) -> Vec<ShutdownFailure> {
        let mut state = self.lock();
        let failures = match std::mem::replace(&mut *state, HookState::Done) {
            HookState::Armed(mut extensions, registry) => self.stop(&mut extensions, &registry),
            HookState::Pending | HookState::Done => Vec::new(),
        };
        self.shared.done.notify_all();
        failures
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.lock(), HookState::Done)
    }

    /// Blocks until `run` or `disarm` was called.
    pub fn wait(&self) {
        let mut state = self.lock();
        while !matches!(*state, HookState::Done) {
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn stop(
        &self,
        extensions: &mut [InjectionContainer],
        registry: &ServiceRegistry,
    ) -> Vec<ShutdownFailure> {
        let monitor = self.shared.monitor.as_ref();
        let failures = shutdown_extensions(extensions, monitor, self.shared.limits);
        registry.clear();
        if failures.is_empty() {
            monitor.info("Shutdown complete");
        } else {
            monitor.warning(&format!(
                "Shutdown complete with {} failed extension(s)",
                failures.len()
            ));
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HookState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A booted runtime.
pub struct RuntimeHandle {
    name: String,
    context: ServiceExtensionContext,
    hook: ShutdownHook,
    startup_status: StartupStatus,
}

impl RuntimeHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &ServiceExtensionContext {
        &self.context
    }

    pub fn startup_status(&self) -> HealthCheckResult {
        self.startup_status.get()
    }

    pub fn shutdown_hook(&self) -> ShutdownHook {
        self.hook.clone()
    }

    pub fn shutdown(&self) -> Vec<ShutdownFailure> {
        self.hook.run()
    }

    pub fn wait_for_shutdown(&self) {
        self.hook.wait();
    }
}

/// Boot driver parameterized by its hooks.
pub struct BaseRuntime<H: RuntimeHooks = DefaultRuntimeHooks> {
    hooks: H,
    startup_status: StartupStatus,
}

impl BaseRuntime {
    pub fn new() -> Self {
        Self::with_hooks(DefaultRuntimeHooks)
    }
}

impl Default for BaseRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: RuntimeHooks> BaseRuntime<H> {
    pub fn with_hooks(hooks: H) -> Self {
        Self {
            hooks,
            startup_status: StartupStatus::pending(),
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn startup_status(&self) -> HealthCheckResult {
        self.startup_status.get()
    }

    /// Runs the full boot sequence.
    ///
    /// Any failure goes through `RuntimeHooks::on_error` before it is
    /// returned.
    pub fn boot(&mut self) -> Result<RuntimeHandle, BootError> {
        let type_manager = self.hooks.create_type_manager();
        let locator = self.hooks.create_service_locator();
        let monitor = match self.hooks.create_monitor(locator.as_ref()) {
            Ok(monitor) => monitor,
            Err(err) => {
                self.hooks.on_error(&err, &LogMonitor);
                return Err(err);
            }
        };
        monitor::set_instance(Arc::clone(&monitor));

        match self.boot_with(type_manager, Arc::clone(&monitor), locator) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.hooks.on_error(&err, monitor.as_ref());
                Err(err)
            }
        }
    }

    fn boot_with(
        &mut self,
        type_manager: Arc<TypeManager>,
        monitor: Arc<dyn Monitor>,
        locator: Box<dyn ServiceLocator>,
    ) -> Result<RuntimeHandle, BootError> {
        let mut context = self
            .hooks
            .create_context(type_manager, Arc::clone(&monitor), locator);
        self.hooks.initialize_context(&mut context)?;
        self.hooks.initialize_vault(&mut context)?;
        let extensions = self.hooks.create_extensions(&context)?;

        let limits = LifecycleLimits::from_config(context.config()).map_err(BootError::Config)?;
        let hook = ShutdownHook::new(Arc::clone(&monitor), limits);
        self.hooks.install_shutdown_hook(hook.clone(), monitor.as_ref());

        let booted = match self
            .hooks
            .boot_extensions(&mut context, extensions, limits)
        {
            Ok(booted) => booted,
            Err(err) => {
                hook.disarm();
                return Err(err);
            }
        };
        let health = match context.get_service(HEALTH_CHECK_SERVICE) {
            Ok(health) => health,
            Err(err) => {
                hook.disarm();
                return Err(BootError::HealthCheck(err));
            }
        };
        hook.arm(booted, context.registry_handle());

        let status = self.startup_status.clone();
        health.add_startup_status_provider(Box::new(move || status.get()));
        self.startup_status.set(HealthCheckResult::success());
        health.refresh();

        let name = self.hooks.runtime_name(&context);
        monitor.info(&format!("{name} ready"));
        Ok(RuntimeHandle {
            name,
            context,
            hook,
            startup_status: self.startup_status.clone(),
        })
    }
}
