//! Injection points, containers and the injector.
//!
//! # Responsibility
//! - Describe every slot of a module that needs a capability.
//! - Fill those slots from the capability registry before `initialize`.
//!
//! # Invariants
//! - A required slot is either filled or the whole boot fails.
//! - An optional slot whose capability is absent stays unset.
//! - Injection never touches the registry.

use crate::system::capability::{CapabilityId, ServiceKey};
use crate::system::context::{ServiceExtensionContext, ServiceHandle};
use crate::system::extension::{ExtensionState, ServiceExtension};
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

type Setter = Box<dyn Fn(&mut dyn Any, &ServiceHandle) -> Result<(), SlotError> + Send + Sync>;

enum SlotError {
    TargetMismatch,
    ServiceMismatch { actual: &'static str },
}

/// One slot of a module that receives a capability.
pub struct InjectionPoint {
    field: &'static str,
    capability: CapabilityId,
    required: bool,
    target_type: &'static str,
    service_type: &'static str,
    setter: Setter,
}

impl InjectionPoint {
    /// Slot that must be filled for the module to boot.
    pub fn required<E, T>(field: &'static str, key: ServiceKey<T>, set: fn(&mut E, Arc<T>)) -> Self
    where
        E: Any,
        T: ?Sized + Send + Sync + 'static,
    {
        Self::new(field, key, set, true)
    }

    /// Slot left unset when no module provides the capability.
    pub fn optional<E, T>(field: &'static str, key: ServiceKey<T>, set: fn(&mut E, Arc<T>)) -> Self
    where
        E: Any,
        T: ?Sized + Send + Sync + 'static,
    {
        Self::new(field, key, set, false)
    }

    fn new<E, T>(
        field: &'static str,
        key: ServiceKey<T>,
        set: fn(&mut E, Arc<T>),
        required: bool,
    ) -> Self
    where
        E: Any,
        T: ?Sized + Send + Sync + 'static,
    {
        let setter: Setter = Box::new(move |target: &mut dyn Any, service: &ServiceHandle| {
            let target = target
                .downcast_mut::<E>()
                .ok_or(SlotError::TargetMismatch)?;
            let service = service.downcast::<T>().ok_or(SlotError::ServiceMismatch {
                actual: service.type_name(),
            })?;
            set(target, service);
            Ok(())
        });
        Self {
            field,
            capability: key.capability(),
            required,
            target_type: std::any::type_name::<E>(),
            service_type: std::any::type_name::<T>(),
            setter,
        }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn capability(&self) -> &CapabilityId {
        &self.capability
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

impl Display for InjectionPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field \"{}\" of type [{}] {} by {}",
            self.field,
            self.service_type,
            if self.required { "required" } else { "wanted" },
            self.target_type
        )
    }
}

impl std::fmt::Debug for InjectionPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionPoint")
            .field("field", &self.field)
            .field("capability", &self.capability)
            .field("required", &self.required)
            .finish()
    }
}

/// A discovered module paired with its injection points.
pub struct InjectionContainer {
    target: Box<dyn ServiceExtension>,
    injection_points: Vec<InjectionPoint>,
    state: ExtensionState,
}

impl InjectionContainer {
    pub fn new(target: Box<dyn ServiceExtension>) -> Self {
        let injection_points = target.injection_points();
        Self {
            target,
            injection_points,
            state: ExtensionState::Discovered,
        }
    }

    pub fn name(&self) -> &str {
        self.target.name()
    }

    pub fn target(&self) -> &dyn ServiceExtension {
        &*self.target
    }

    pub fn target_mut(&mut self) -> &mut dyn ServiceExtension {
        &mut *self.target
    }

    pub fn injection_points(&self) -> &[InjectionPoint] {
        &self.injection_points
    }

    pub fn state(&self) -> ExtensionState {
        self.state
    }

    /// Moves to `next`; out-of-order transitions are ignored and reported.
    pub(crate) fn advance(&mut self, next: ExtensionState) -> bool {
        if !self.state.can_advance_to(next) {
            log::warn!(
                "extension `{}` cannot move from {} to {next}",
                self.target.name(),
                self.state
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn into_target(self) -> Box<dyn ServiceExtension> {
        self.target
    }
}

impl std::fmt::Debug for InjectionContainer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionContainer")
            .field("name", &self.target.name())
            .field("injection_points", &self.injection_points)
            .field("state", &self.state)
            .finish()
    }
}

/// Resolves a container's injection points against the context.
pub trait Injector {
    fn inject(
        &self,
        container: &mut InjectionContainer,
        context: &ServiceExtensionContext,
    ) -> Result<(), InjectionError>;
}

/// Registry-backed injector.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInjector;

impl Injector for DefaultInjector {
    fn inject(
        &self,
        container: &mut InjectionContainer,
        context: &ServiceExtensionContext,
    ) -> Result<(), InjectionError> {
        let InjectionContainer {
            target,
            injection_points,
            ..
        } = container;
        let extension = target.name().to_string();
        let target: &mut dyn ServiceExtension = &mut **target;

        for point in injection_points.iter() {
            let resolved = context
                .resolve(point.capability(), point.is_required())
                .map_err(|_| InjectionError::MissingDependency {
                    extension: extension.clone(),
                    capability: point.capability().clone(),
                    field: point.field(),
                    required: point.is_required(),
                })?;
            let Some(service) = resolved else {
                context.monitor().debug(&format!(
                    "{extension}: optional capability {} absent, {} left unset",
                    point.capability(),
                    point.field()
                ));
                continue;
            };

            (point.setter)(target.as_any_mut(), &service).map_err(|err| match err {
                SlotError::TargetMismatch => InjectionError::TargetMismatch {
                    extension: extension.clone(),
                    field: point.field(),
                    expected: point.target_type,
                },
                SlotError::ServiceMismatch { actual } => InjectionError::ServiceTypeMismatch {
                    extension: extension.clone(),
                    capability: point.capability().clone(),
                    expected: point.service_type,
                    actual,
                },
            })?;
        }

        container.advance(ExtensionState::Injected);
        Ok(())
    }
}

/// Injection failures; all of them abort the boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionError {
    MissingDependency {
        extension: String,
        capability: CapabilityId,
        field: &'static str,
        required: bool,
    },
    ServiceTypeMismatch {
        extension: String,
        capability: CapabilityId,
        expected: &'static str,
        actual: &'static str,
    },
    TargetMismatch {
        extension: String,
        field: &'static str,
        expected: &'static str,
    },
}

impl Display for InjectionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDependency {
                extension,
                capability,
                field,
                required,
            } => write!(
                f,
                "extension `{extension}` is missing dependency {capability} for field \"{field}\" (required={required})"
            ),
            Self::ServiceTypeMismatch {
                extension,
                capability,
                expected,
                actual,
            } => write!(
                f,
                "extension `{extension}` expects {capability} as {expected}, registry holds {actual}"
            ),
            Self::TargetMismatch {
                extension,
                field,
                expected,
            } => write!(
                f,
                "injection point \"{field}\" of extension `{extension}` targets {expected}"
            ),
        }
    }
}

impl Error for InjectionError {}
