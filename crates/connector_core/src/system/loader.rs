//! Extension loader: dependency ordering and the shared lifecycle.
//!
//! # Responsibility
//! - Order discovered modules so every provider initializes before its
//!   consumers.
//! - Drive inject/initialize, then start, then reverse-order shutdown.
//! - Load the monitor and vault singletons ahead of the service modules.
//!
//! # Invariants
//! - Malformed capability ids, cycles and missing required providers are
//!   detected before any module runs `initialize`.
//! - Modules without an ordering constraint are ordered by name, then by
//!   discovery position.
//! - `start` runs only after every module finished `initialize`.
//! - Shutdown visits started modules in exact reverse order and never stops
//!   early on a failing module.
//! - Lifecycle calls are not interrupted; an `initialize` or `start` that
//!   returns after the timeout fails the boot.

use crate::config::{Config, ConfigError, ConfigResult};
use crate::monitor::{LogMonitor, Monitor, MonitorExtension, MultiplexingMonitor};
use crate::system::capability::{CapabilityId, CapabilityIdError};
use crate::system::context::{ServiceExtensionContext, ServiceRegistry, ServiceResolutionError};
use crate::system::extension::{ExtensionError, ExtensionState, Requirement};
use crate::system::injection::{DefaultInjector, InjectionContainer, InjectionError, Injector};
use crate::system::locator::{DiscoveryError, ServiceLocator, ServiceLocatorExt};
use crate::vault::{InMemoryVault, Vault, VaultError, VaultExtension, VAULT};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Setting: lifecycle calls slower than this many milliseconds are reported.
pub const LIFECYCLE_WARN_THRESHOLD_SETTING: &str = "edc.core.system.lifecycle.warn-threshold-ms";

/// Setting: `initialize` or `start` returning after this many milliseconds
/// fails the boot; a slow `shutdown` is reported as a shutdown failure.
pub const LIFECYCLE_TIMEOUT_SETTING: &str = "edc.core.system.lifecycle.timeout-ms";

pub const DEFAULT_LIFECYCLE_WARN_THRESHOLD: Duration = Duration::from_millis(5000);

pub const DEFAULT_LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time budgets for module lifecycle calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleLimits {
    pub warn_threshold: Duration,
    pub timeout: Duration,
}

impl LifecycleLimits {
    /// Reads both budgets; negative or non-numeric values are errors.
    pub fn from_config(config: &Config) -> ConfigResult<Self> {
        let warn_threshold = config.get_unsigned_or(
            LIFECYCLE_WARN_THRESHOLD_SETTING,
            millis_of(DEFAULT_LIFECYCLE_WARN_THRESHOLD),
        )?;
        let timeout =
            config.get_unsigned_or(LIFECYCLE_TIMEOUT_SETTING, millis_of(DEFAULT_LIFECYCLE_TIMEOUT))?;
        Ok(Self {
            warn_threshold: Duration::from_millis(warn_threshold),
            timeout: Duration::from_millis(timeout),
        })
    }
}

impl Default for LifecycleLimits {
    fn default() -> Self {
        Self {
            warn_threshold: DEFAULT_LIFECYCLE_WARN_THRESHOLD,
            timeout: DEFAULT_LIFECYCLE_TIMEOUT,
        }
    }
}

fn millis_of(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// "Depends on" relation between discovered modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    names: Vec<String>,
    dependencies: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    /// Builds the graph over `extensions`.
    ///
    /// Capabilities already present in `registry` satisfy requirements
    /// without an edge. A required capability with no provider anywhere is a
    /// `MissingProvider` error; a malformed id is `InvalidCapability`.
    pub fn build(
        extensions: &[InjectionContainer],
        registry: &ServiceRegistry,
    ) -> Result<Self, BootError> {
        let mut providers: BTreeMap<CapabilityId, Vec<usize>> = BTreeMap::new();
        for (index, container) in extensions.iter().enumerate() {
            for capability in container.target().provides() {
                validate_capability(container, &capability)?;
                providers.entry(capability).or_default().push(index);
            }
        }

        let mut dependencies = vec![BTreeSet::new(); extensions.len()];
        for (index, container) in extensions.iter().enumerate() {
            for requirement in requirements_of(container) {
                validate_capability(container, &requirement.capability)?;
                match providers.get(&requirement.capability) {
                    Some(found) => dependencies[index]
                        .extend(found.iter().copied().filter(|provider| *provider != index)),
                    None if requirement.required
                        && !registry.has(requirement.capability.as_str()) =>
                    {
                        return Err(BootError::MissingProvider {
                            extension: container.name().to_string(),
                            capability: requirement.capability,
                        });
                    }
                    None => {}
                }
            }
        }

        Ok(Self {
            names: extensions
                .iter()
                .map(|container| container.name().to_string())
                .collect(),
            dependencies,
        })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Names of the modules `index` depends on.
    pub fn dependencies_of(&self, index: usize) -> Vec<&str> {
        self.dependencies
            .get(index)
            .map(|deps| deps.iter().map(|dep| self.names[*dep].as_str()).collect())
            .unwrap_or_default()
    }

    /// Kahn's algorithm; returns positions into the input slice.
    pub fn topological_order(&self) -> Result<Vec<usize>, BootError> {
        let count = self.names.len();
        let mut pending: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, deps) in self.dependencies.iter().enumerate() {
            for dep in deps {
                dependents[*dep].push(index);
            }
        }

        let mut ready: BTreeSet<(&str, usize)> = (0..count)
            .filter(|index| pending[*index] == 0)
            .map(|index| (self.names[index].as_str(), index))
            .collect();
        let mut order = Vec::with_capacity(count);
        while let Some((_, index)) = ready.pop_first() {
            order.push(index);
            for dependent in &dependents[index] {
                pending[*dependent] -= 1;
                if pending[*dependent] == 0 {
                    ready.insert((self.names[*dependent].as_str(), *dependent));
                }
            }
        }

        if order.len() < count {
            return Err(BootError::CyclicDependency {
                cycle: self.find_cycle(&pending),
            });
        }
        Ok(order)
    }

    // Every unordered node still waits on another unordered node, so walking
    // dependencies from any of them must revisit a node.
    fn find_cycle(&self, pending: &[usize]) -> Vec<String> {
        let unordered = |index: &usize| pending[*index] > 0;
        let Some(start) = (0..self.names.len())
            .filter(unordered)
            .min_by(|left, right| self.names[*left].cmp(&self.names[*right]))
        else {
            return Vec::new();
        };

        let mut seen_at: BTreeMap<usize, usize> = BTreeMap::new();
        let mut path = Vec::new();
        let mut current = start;
        loop {
            if let Some(at) = seen_at.get(&current) {
                return path[*at..]
                    .iter()
                    .map(|index: &usize| self.names[*index].clone())
                    .collect();
            }
            seen_at.insert(current, path.len());
            path.push(current);
            match self.dependencies[current].iter().copied().find(unordered) {
                Some(next) => current = next,
                None => break,
            }
        }
        path.into_iter()
            .map(|index| self.names[index].clone())
            .collect()
    }
}

fn validate_capability(
    container: &InjectionContainer,
    capability: &CapabilityId,
) -> Result<(), BootError> {
    capability
        .validate()
        .map_err(|source| BootError::InvalidCapability {
            extension: container.name().to_string(),
            source,
        })
}

fn requirements_of(container: &InjectionContainer) -> Vec<Requirement> {
    container
        .injection_points()
        .iter()
        .map(|point| Requirement {
            capability: point.capability().clone(),
            required: point.is_required(),
        })
        .chain(container.target().requires())
        .collect()
}

/// Measures lifecycle calls against `LifecycleLimits`.
pub(crate) struct LifecycleTimer<'a> {
    monitor: &'a dyn Monitor,
    limits: LifecycleLimits,
}

impl<'a> LifecycleTimer<'a> {
    pub(crate) fn new(monitor: &'a dyn Monitor, limits: LifecycleLimits) -> Self {
        Self { monitor, limits }
    }

    /// Runs `call`, warning when it is slower than the threshold.
    pub(crate) fn time<R>(
        &self,
        extension: &str,
        phase: &str,
        call: impl FnOnce() -> R,
    ) -> (R, Duration) {
        let started = Instant::now();
        let result = call();
        let elapsed = started.elapsed();
        if elapsed > self.limits.warn_threshold {
            self.monitor.warning(&format!(
                "{phase} of {extension} took {}ms, threshold is {}ms",
                elapsed.as_millis(),
                self.limits.warn_threshold.as_millis()
            ));
        }
        (result, elapsed)
    }

    pub(crate) fn check_timeout(
        &self,
        extension: &str,
        phase: &'static str,
        elapsed: Duration,
    ) -> Result<(), BootError> {
        if elapsed > self.limits.timeout {
            return Err(BootError::Timeout {
                extension: extension.to_string(),
                phase,
                elapsed,
                timeout: self.limits.timeout,
            });
        }
        Ok(())
    }
}

/// Sorts, injects, initializes and starts a module set.
pub struct ExtensionLoader<J: Injector = DefaultInjector> {
    injector: J,
    limits: LifecycleLimits,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self::with_injector(DefaultInjector)
    }
}

impl Default for ExtensionLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Injector> ExtensionLoader<J> {
    pub fn with_injector(injector: J) -> Self {
        Self {
            injector,
            limits: LifecycleLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: LifecycleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> LifecycleLimits {
        self.limits
    }

    /// Boots `extensions` and returns them in initialization order, all in
    /// `Started` state.
    pub fn boot(
        &self,
        context: &mut ServiceExtensionContext,
        extensions: Vec<InjectionContainer>,
    ) -> Result<Vec<InjectionContainer>, BootError> {
        let graph = DependencyGraph::build(&extensions, context.registry())?;
        let order = graph.topological_order()?;
        let mut extensions = sort_by_order(extensions, &order);

        let monitor = context.monitor();
        let timer = LifecycleTimer::new(monitor.as_ref(), self.limits);

        for container in extensions.iter_mut() {
            self.injector.inject(container, context)?;
            let name = container.name().to_string();
            let (result, elapsed) = timer.time(&name, "initialize", || {
                container.target_mut().initialize(context)
            });
            result.map_err(|source| BootError::Initialize {
                extension: name.clone(),
                source,
            })?;
            timer.check_timeout(&name, "initialize", elapsed)?;
            container.advance(ExtensionState::Initialized);
            monitor.info(&format!("Initialized {name}"));
        }

        for container in extensions.iter_mut() {
            let name = container.name().to_string();
            let (result, elapsed) = timer.time(&name, "start", || container.target_mut().start());
            result.map_err(|source| BootError::Start {
                extension: name.clone(),
                source,
            })?;
            container.advance(ExtensionState::Started);
            timer.check_timeout(&name, "start", elapsed)?;
            monitor.info(&format!("Started {name}"));
        }

        Ok(extensions)
    }
}

fn sort_by_order(extensions: Vec<InjectionContainer>, order: &[usize]) -> Vec<InjectionContainer> {
    let mut slots: Vec<Option<InjectionContainer>> = extensions.into_iter().map(Some).collect();
    order
        .iter()
        .filter_map(|index| slots.get_mut(*index).and_then(Option::take))
        .collect()
}

/// One module whose `shutdown` failed.
#[derive(Debug)]
pub struct ShutdownFailure {
    pub extension: String,
    pub error: ExtensionError,
}

/// Stops started modules in reverse order.
///
/// Failures, including calls slower than the timeout, are logged and
/// collected; every started module receives its `shutdown` call regardless.
pub fn shutdown_extensions(
    extensions: &mut [InjectionContainer],
    monitor: &dyn Monitor,
    limits: LifecycleLimits,
) -> Vec<ShutdownFailure> {
    let timer = LifecycleTimer::new(monitor, limits);
    let mut failures = Vec::new();
    for container in extensions.iter_mut().rev() {
        if container.state() != ExtensionState::Started {
            continue;
        }
        let name = container.name().to_string();
        let (result, elapsed) = timer.time(&name, "shutdown", || container.target_mut().shutdown());
        let result = result.and_then(|()| {
            timer
                .check_timeout(&name, "shutdown", elapsed)
                .map_err(ExtensionError::from)
        });
        if let Err(error) = result {
            let cause: &(dyn Error + 'static) = &*error;
            monitor.severe(&format!("Error shutting down {name}"), Some(cause));
            failures.push(ShutdownFailure {
                extension: name.clone(),
                error,
            });
        }
        container.advance(ExtensionState::Stopped);
        monitor.info(&format!("Shutdown {name}"));
    }
    failures
}

/// Loads every monitor extension; none yields `LogMonitor`, several are
/// multiplexed.
pub fn load_monitor(locator: &dyn ServiceLocator) -> Result<Arc<dyn Monitor>, DiscoveryError> {
    let extensions = locator.load_implementors::<dyn MonitorExtension>(false)?;
    let mut monitors: Vec<Arc<dyn Monitor>> =
        extensions.iter().map(|extension| extension.monitor()).collect();
    if monitors.len() > 1 {
        return Ok(Arc::new(MultiplexingMonitor::new(monitors)));
    }
    Ok(monitors.pop().unwrap_or_else(|| Arc::new(LogMonitor)))
}

/// Loads the optional vault extension and registers the vault capability.
pub fn load_vault(context: &mut ServiceExtensionContext) -> Result<(), BootError> {
    let monitor = context.monitor();
    let extension = context
        .locator()
        .load_singleton_implementor::<dyn VaultExtension>(false)?;
    let vault: Arc<dyn Vault> = match extension {
        Some(mut extension) => {
            extension
                .initialize(monitor.as_ref())
                .map_err(BootError::Vault)?;
            monitor.info(&format!("Initialized {}", extension.name()));
            extension.vault()
        }
        None => {
            monitor.debug("No vault extension found, using the in-memory vault");
            Arc::new(InMemoryVault::new())
        }
    };
    context.register_service(VAULT, vault);
    Ok(())
}

/// Fatal boot failures.
#[derive(Debug)]
pub enum BootError {
    CyclicDependency {
        cycle: Vec<String>,
    },
    MissingProvider {
        extension: String,
        capability: CapabilityId,
    },
    InvalidCapability {
        extension: String,
        source: CapabilityIdError,
    },
    Injection(InjectionError),
    Discovery(DiscoveryError),
    Initialize {
        extension: String,
        source: ExtensionError,
    },
    Start {
        extension: String,
        source: ExtensionError,
    },
    Timeout {
        extension: String,
        phase: &'static str,
        elapsed: Duration,
        timeout: Duration,
    },
    Config(ConfigError),
    Vault(VaultError),
    HealthCheck(ServiceResolutionError),
}

impl Display for BootError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CyclicDependency { cycle } => {
                write!(f, "cyclic dependency between extensions: {}", cycle.join(" -> "))?;
                if let Some(first) = cycle.first() {
                    write!(f, " -> {first}")?;
                }
                Ok(())
            }
            Self::MissingProvider {
                extension,
                capability,
            } => write!(
                f,
                "extension {extension} requires capability {capability}, which no extension provides"
            ),
            Self::InvalidCapability { extension, source } => {
                write!(f, "extension {extension} declares an invalid capability: {source}")
            }
            Self::Injection(err) => write!(f, "{err}"),
            Self::Discovery(err) => write!(f, "discovery failed: {err}"),
            Self::Initialize { extension, source } => {
                write!(f, "failed to initialize {extension}: {source}")
            }
            Self::Start { extension, source } => write!(f, "failed to start {extension}: {source}"),
            Self::Timeout {
                extension,
                phase,
                elapsed,
                timeout,
            } => write!(
                f,
                "{phase} of {extension} took {}ms, timeout is {}ms",
                elapsed.as_millis(),
                timeout.as_millis()
            ),
            Self::Config(err) => write!(f, "configuration failed: {err}"),
            Self::Vault(err) => write!(f, "vault initialization failed: {err}"),
            Self::HealthCheck(err) => write!(f, "health check service unavailable: {err}"),
        }
    }
}

impl Error for BootError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidCapability { source, .. } => Some(source),
            Self::Injection(err) => Some(err),
            Self::Discovery(err) => Some(err),
            Self::Initialize { source, .. } | Self::Start { source, .. } => Some(&**source),
            Self::Config(err) => Some(err),
            Self::Vault(err) => Some(err),
            Self::HealthCheck(err) => Some(err),
            Self::CyclicDependency { .. }
            | Self::MissingProvider { .. }
            | Self::Timeout { .. } => None,
        }
    }
}

impl From<InjectionError> for BootError {
    fn from(err: InjectionError) -> Self {
        Self::Injection(err)
    }
}

impl From<DiscoveryError> for BootError {
    fn from(err: DiscoveryError) -> Self {
        Self::Discovery(err)
    }
}
