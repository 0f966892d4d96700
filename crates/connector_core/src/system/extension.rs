//! Service extension contract and lifecycle states.

use crate::system::capability::CapabilityId;
use crate::system::context::ServiceExtensionContext;
use crate::system::injection::InjectionPoint;
use std::any::Any;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error raised by a module's own lifecycle code.
pub type ExtensionError = Box<dyn Error + Send + Sync + 'static>;

pub type ExtensionResult<T = ()> = Result<T, ExtensionError>;

/// Gives injection setters typed access to the concrete module.
pub trait AsAnyMut {
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAnyMut for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One statically declared dependency on a capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub capability: CapabilityId,
    pub required: bool,
}

impl Requirement {
    pub fn required(capability: impl Into<CapabilityId>) -> Self {
        Self {
            capability: capability.into(),
            required: true,
        }
    }

    pub fn optional(capability: impl Into<CapabilityId>) -> Self {
        Self {
            capability: capability.into(),
            required: false,
        }
    }
}

/// Independently loadable unit of functionality.
///
/// Declarations (`provides`, `requires`, `injection_points`) are read before
/// `initialize` and must not depend on injected state.
pub trait ServiceExtension: AsAnyMut + Send {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Capabilities this module registers during `initialize`.
    fn provides(&self) -> Vec<CapabilityId> {
        Vec::new()
    }

    /// Capabilities looked up manually in `initialize`, in addition to the
    /// injection points.
    fn requires(&self) -> Vec<Requirement> {
        Vec::new()
    }

    /// Slots filled by the injector before `initialize`.
    fn injection_points(&self) -> Vec<InjectionPoint> {
        Vec::new()
    }

    /// Registers services; the only phase with mutable context access.
    fn initialize(&mut self, _context: &mut ServiceExtensionContext) -> ExtensionResult {
        Ok(())
    }

    /// Called after every module finished `initialize`.
    fn start(&mut self) -> ExtensionResult {
        Ok(())
    }

    /// Called in reverse initialization order on process termination.
    fn shutdown(&mut self) -> ExtensionResult {
        Ok(())
    }
}

/// Per-module lifecycle state. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtensionState {
    Discovered,
    Injected,
    Initialized,
    Started,
    Stopped,
}

impl ExtensionState {
    /// Returns whether `next` is the immediate successor of `self`.
    pub fn can_advance_to(self, next: ExtensionState) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::Injected)
                | (Self::Injected, Self::Initialized)
                | (Self::Initialized, Self::Started)
                | (Self::Started, Self::Stopped)
        )
    }
}

impl Display for ExtensionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Discovered => "discovered",
            Self::Injected => "injected",
            Self::Initialized => "initialized",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExtensionState, Requirement};

    #[test]
    fn states_only_advance_one_step() {
        assert!(ExtensionState::Discovered.can_advance_to(ExtensionState::Injected));
        assert!(ExtensionState::Started.can_advance_to(ExtensionState::Stopped));
        assert!(!ExtensionState::Discovered.can_advance_to(ExtensionState::Initialized));
        assert!(!ExtensionState::Started.can_advance_to(ExtensionState::Initialized));
        assert!(!ExtensionState::Stopped.can_advance_to(ExtensionState::Discovered));
    }

    #[test]
    fn requirement_constructors_set_flag() {
        assert!(Requirement::required("test:x").required);
        assert!(!Requirement::optional("test:x").required);
    }
}
