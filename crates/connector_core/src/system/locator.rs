//! Module discovery.
//!
//! # Responsibility
//! - Enumerate implementations of an extension point.
//! - Provide the static manifest strategy and the in-memory override used by
//!   embedding harnesses.
//!
//! # Invariants
//! - Manifest results are ordered by entry name, then link order.
//! - A singleton lookup never silently picks one of several candidates.

use crate::config::ConfigurationExtension;
use crate::monitor::MonitorExtension;
use crate::system::extension::ServiceExtension;
use crate::vault::VaultExtension;
use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};

/// Interface that discoverable implementations are looked up by.
pub trait ExtensionPoint: 'static {
    const NAME: &'static str;
}

impl ExtensionPoint for dyn ServiceExtension {
    const NAME: &'static str = "ServiceExtension";
}

impl ExtensionPoint for dyn VaultExtension {
    const NAME: &'static str = "VaultExtension";
}

impl ExtensionPoint for dyn MonitorExtension {
    const NAME: &'static str = "MonitorExtension";
}

impl ExtensionPoint for dyn ConfigurationExtension {
    const NAME: &'static str = "ConfigurationExtension";
}

/// One discovered, not yet typed implementation.
pub struct Implementor {
    point: &'static str,
    origin: String,
    instance: Box<dyn Any + Send>,
}

impl Implementor {
    pub fn new<I>(origin: impl Into<String>, instance: Box<I>) -> Self
    where
        I: ExtensionPoint + ?Sized,
        Box<I>: Send,
    {
        Self {
            point: I::NAME,
            origin: origin.into(),
            instance: Box::new(instance),
        }
    }

    pub fn point(&self) -> &'static str {
        self.point
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn into_instance<I: ExtensionPoint + ?Sized>(self) -> Result<Box<I>, DiscoveryError> {
        let Implementor {
            point,
            origin,
            instance,
        } = self;
        match instance.downcast::<Box<I>>() {
            Ok(typed) => Ok(*typed),
            Err(_) => Err(DiscoveryError::TypeMismatch {
                point: I::NAME,
                registered_as: point,
                origin,
            }),
        }
    }
}

impl std::fmt::Debug for Implementor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Implementor")
            .field("point", &self.point)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Pluggable discovery mechanism.
pub trait ServiceLocator: Send {
    /// All implementations of `point`; empty is an error only when
    /// `required`.
    fn implementors(&self, point: &'static str, required: bool)
        -> Result<Vec<Implementor>, DiscoveryError>;

    /// Exactly one implementation of `point`, if any.
    fn singleton_implementor(
        &self,
        point: &'static str,
        required: bool,
    ) -> Result<Option<Implementor>, DiscoveryError>;
}

/// Typed lookups on any locator.
pub trait ServiceLocatorExt: ServiceLocator {
    fn load_implementors<I>(&self, required: bool) -> Result<Vec<Box<I>>, DiscoveryError>
    where
        I: ExtensionPoint + ?Sized,
    {
        self.implementors(I::NAME, required)?
            .into_iter()
            .map(Implementor::into_instance::<I>)
            .collect()
    }

    fn load_singleton_implementor<I>(
        &self,
        required: bool,
    ) -> Result<Option<Box<I>>, DiscoveryError>
    where
        I: ExtensionPoint + ?Sized,
    {
        self.singleton_implementor(I::NAME, required)?
            .map(Implementor::into_instance::<I>)
            .transpose()
    }
}

impl<L: ServiceLocator + ?Sized> ServiceLocatorExt for L {}

/// Constructor registered in the static manifest.
#[derive(Clone, Copy)]
pub enum ManifestFactory {
    Service(fn() -> Box<dyn ServiceExtension>),
    Vault(fn() -> Box<dyn VaultExtension>),
    Monitor(fn() -> Box<dyn MonitorExtension>),
    Configuration(fn() -> Box<dyn ConfigurationExtension>),
}

impl ManifestFactory {
    pub fn point(&self) -> &'static str {
        match self {
            Self::Service(_) => <dyn ServiceExtension as ExtensionPoint>::NAME,
            Self::Vault(_) => <dyn VaultExtension as ExtensionPoint>::NAME,
            Self::Monitor(_) => <dyn MonitorExtension as ExtensionPoint>::NAME,
            Self::Configuration(_) => <dyn ConfigurationExtension as ExtensionPoint>::NAME,
        }
    }

    fn instantiate(&self, origin: String) -> Implementor {
        match self {
            Self::Service(create) => Implementor::new(origin, create()),
            Self::Vault(create) => Implementor::new(origin, create()),
            Self::Monitor(create) => Implementor::new(origin, create()),
            Self::Configuration(create) => Implementor::new(origin, create()),
        }
    }
}

/// One registration in the static manifest.
///
/// ```ignore
/// #[linkme::distributed_slice(EXTENSION_MANIFEST)]
/// static AUDIT: ManifestEntry = ManifestEntry {
///     name: "audit",
///     factory: ManifestFactory::Service(|| Box::new(AuditExtension::default())),
/// };
/// ```
pub struct ManifestEntry {
    pub name: &'static str,
    pub factory: ManifestFactory,
}

/// Registration list every linked crate contributes to.
#[linkme::distributed_slice]
pub static EXTENSION_MANIFEST: [ManifestEntry] = [..];

/// Manifest-based discovery over `EXTENSION_MANIFEST`.
pub struct ManifestServiceLocator {
    entries: &'static [ManifestEntry],
}

impl ManifestServiceLocator {
    pub fn new() -> Self {
        Self::with_entries(&EXTENSION_MANIFEST)
    }

    /// Discovery over an explicit entry list.
    pub fn with_entries(entries: &'static [ManifestEntry]) -> Self {
        Self { entries }
    }

    fn matching(&self, point: &'static str) -> Vec<&'static ManifestEntry> {
        let mut matching: Vec<(usize, &'static ManifestEntry)> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.factory.point() == point)
            .collect();
        matching.sort_by(|(left_index, left), (right_index, right)| {
            left.name
                .cmp(right.name)
                .then(left_index.cmp(right_index))
        });
        matching.into_iter().map(|(_, entry)| entry).collect()
    }
}

impl Default for ManifestServiceLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLocator for ManifestServiceLocator {
    fn implementors(
        &self,
        point: &'static str,
        required: bool,
    ) -> Result<Vec<Implementor>, DiscoveryError> {
        let matching = self.matching(point);
        if matching.is_empty() && required {
            return Err(DiscoveryError::NotFound { point });
        }
        Ok(matching
            .into_iter()
            .map(|entry| entry.factory.instantiate(format!("manifest:{}", entry.name)))
            .collect())
    }

    fn singleton_implementor(
        &self,
        point: &'static str,
        required: bool,
    ) -> Result<Option<Implementor>, DiscoveryError> {
        let matching = self.matching(point);
        match matching.as_slice() {
            [] if required => Err(DiscoveryError::NotFound { point }),
            [] => Ok(None),
            [entry] => Ok(Some(
                entry.factory.instantiate(format!("manifest:{}", entry.name)),
            )),
            several => Err(DiscoveryError::MultipleImplementations {
                point,
                candidates: several
                    .iter()
                    .map(|entry| format!("manifest:{}", entry.name))
                    .collect(),
            }),
        }
    }
}

/// In-memory discovery layered over a delegate.
///
/// Registered instances are handed out once; `implementors` returns them
/// ahead of the delegate's results. For singletons the registered instance
/// is used when the delegate has none, and two sources each offering a
/// candidate is an ambiguity.
pub struct OverrideServiceLocator {
    registered: Mutex<BTreeMap<&'static str, Vec<Implementor>>>,
    delegate: Box<dyn ServiceLocator>,
}

impl OverrideServiceLocator {
    pub fn new(delegate: Box<dyn ServiceLocator>) -> Self {
        Self {
            registered: Mutex::new(BTreeMap::new()),
            delegate,
        }
    }

    /// Registers one in-memory implementation of `I`.
    pub fn register<I>(&self, origin: impl Into<String>, instance: Box<I>)
    where
        I: ExtensionPoint + ?Sized,
        Box<I>: Send,
    {
        self.register_implementor(Implementor::new(origin, instance));
    }

    pub fn register_implementor(&self, implementor: Implementor) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(implementor.point())
            .or_default()
            .push(implementor);
    }

    fn take_registered(&self, point: &'static str) -> Vec<Implementor> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(point)
            .unwrap_or_default()
    }
}

impl ServiceLocator for OverrideServiceLocator {
    fn implementors(
        &self,
        point: &'static str,
        required: bool,
    ) -> Result<Vec<Implementor>, DiscoveryError> {
        let mut implementors = self.take_registered(point);
        let delegate_required = required && implementors.is_empty();
        implementors.extend(self.delegate.implementors(point, delegate_required)?);
        Ok(implementors)
    }

    fn singleton_implementor(
        &self,
        point: &'static str,
        required: bool,
    ) -> Result<Option<Implementor>, DiscoveryError> {
        let mut registered = self.take_registered(point);
        match registered.len() {
            0 => self.delegate.singleton_implementor(point, required),
            1 => match self.delegate.singleton_implementor(point, false)? {
                None => Ok(registered.pop()),
                Some(delegated) => Err(DiscoveryError::MultipleImplementations {
                    point,
                    candidates: registered
                        .iter()
                        .chain(std::iter::once(&delegated))
                        .map(|implementor| implementor.origin().to_string())
                        .collect(),
                }),
            },
            _ => Err(DiscoveryError::MultipleImplementations {
                point,
                candidates: registered
                    .iter()
                    .map(|implementor| implementor.origin().to_string())
                    .collect(),
            }),
        }
    }
}

/// Discovery failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    MultipleImplementations {
        point: &'static str,
        candidates: Vec<String>,
    },
    NotFound {
        point: &'static str,
    },
    TypeMismatch {
        point: &'static str,
        registered_as: &'static str,
        origin: String,
    },
}

impl Display for DiscoveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleImplementations { point, candidates } => write!(
                f,
                "multiple implementations found for {point}: {}",
                candidates.join(", ")
            ),
            Self::NotFound { point } => write!(f, "no implementation found for {point}"),
            Self::TypeMismatch {
                point,
                registered_as,
                origin,
            } => write!(
                f,
                "implementation {origin} was registered as {registered_as}, requested as {point}"
            ),
        }
    }
}

impl Error for DiscoveryError {}

#[cfg(test)]
mod tests {
    use super::{
        DiscoveryError, ManifestEntry, ManifestFactory, ManifestServiceLocator,
        OverrideServiceLocator, ServiceLocatorExt,
    };
    use crate::system::extension::ServiceExtension;
    use crate::vault::{InMemoryVault, Vault, VaultExtension};
    use std::sync::Arc;

    struct Named(&'static str);

    impl ServiceExtension for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    struct TestVaultExtension(&'static str);

    impl VaultExtension for TestVaultExtension {
        fn name(&self) -> &str {
            self.0
        }

        fn vault(&self) -> Arc<dyn Vault> {
            Arc::new(InMemoryVault::new())
        }
    }

    static ENTRIES: [ManifestEntry; 3] = [
        ManifestEntry {
            name: "zeta",
            factory: ManifestFactory::Service(|| Box::new(Named("zeta"))),
        },
        ManifestEntry {
            name: "alpha",
            factory: ManifestFactory::Service(|| Box::new(Named("alpha"))),
        },
        ManifestEntry {
            name: "file-vault",
            factory: ManifestFactory::Vault(|| Box::new(TestVaultExtension("file-vault"))),
        },
    ];

    static DUPLICATE_VAULTS: [ManifestEntry; 2] = [
        ManifestEntry {
            name: "vault-a",
            factory: ManifestFactory::Vault(|| Box::new(TestVaultExtension("vault-a"))),
        },
        ManifestEntry {
            name: "vault-b",
            factory: ManifestFactory::Vault(|| Box::new(TestVaultExtension("vault-b"))),
        },
    ];

    fn names(extensions: &[Box<dyn ServiceExtension>]) -> Vec<String> {
        extensions.iter().map(|ext| ext.name().to_string()).collect()
    }

    #[test]
    fn manifest_lists_implementors_sorted_by_name() {
        let locator = ManifestServiceLocator::with_entries(&ENTRIES);
        let extensions = locator
            .load_implementors::<dyn ServiceExtension>(true)
            .expect("two service extensions");
        assert_eq!(names(&extensions), vec!["alpha", "zeta"]);
    }

    #[test]
    fn manifest_required_lookup_fails_when_empty() {
        let locator = ManifestServiceLocator::with_entries(&[]);
        let err = locator
            .load_implementors::<dyn ServiceExtension>(true)
            .err()
            .expect("nothing registered");
        assert_eq!(
            err,
            DiscoveryError::NotFound {
                point: "ServiceExtension"
            }
        );
        assert!(locator
            .load_singleton_implementor::<dyn VaultExtension>(false)
            .expect("optional singleton")
            .is_none());
    }

    #[test]
    fn manifest_singleton_resolves_unique_candidate() {
        let locator = ManifestServiceLocator::with_entries(&ENTRIES);
        let vault = locator
            .load_singleton_implementor::<dyn VaultExtension>(true)
            .expect("one vault")
            .expect("vault present");
        assert_eq!(vault.name(), "file-vault");
    }

    #[test]
    fn manifest_singleton_rejects_ambiguity() {
        let locator = ManifestServiceLocator::with_entries(&DUPLICATE_VAULTS);
        let err = locator
            .load_singleton_implementor::<dyn VaultExtension>(false)
            .err()
            .expect("two vaults are ambiguous");
        assert!(matches!(err, DiscoveryError::MultipleImplementations { .. }));
    }

    #[test]
    fn override_unions_registered_and_delegate_results() {
        let locator = OverrideServiceLocator::new(Box::new(ManifestServiceLocator::with_entries(
            &ENTRIES,
        )));
        locator.register::<dyn ServiceExtension>("test", Box::new(Named("registered")));

        let extensions = locator
            .load_implementors::<dyn ServiceExtension>(true)
            .expect("union of sources");
        assert_eq!(names(&extensions), vec!["registered", "alpha", "zeta"]);
    }

    #[test]
    fn override_singleton_with_empty_registration_uses_delegate() {
        let locator = OverrideServiceLocator::new(Box::new(ManifestServiceLocator::with_entries(
            &ENTRIES,
        )));
        let vault = locator
            .load_singleton_implementor::<dyn VaultExtension>(true)
            .expect("delegate vault")
            .expect("vault present");
        assert_eq!(vault.name(), "file-vault");
    }

    #[test]
    fn override_singleton_alone_is_returned() {
        let locator =
            OverrideServiceLocator::new(Box::new(ManifestServiceLocator::with_entries(&[])));
        locator.register::<dyn VaultExtension>("test", Box::new(TestVaultExtension("mock")));

        let vault = locator
            .load_singleton_implementor::<dyn VaultExtension>(true)
            .expect("registered vault")
            .expect("vault present");
        assert_eq!(vault.name(), "mock");
    }

    #[test]
    fn override_and_delegate_singletons_are_ambiguous() {
        let locator = OverrideServiceLocator::new(Box::new(ManifestServiceLocator::with_entries(
            &ENTRIES,
        )));
        locator.register::<dyn VaultExtension>("test", Box::new(TestVaultExtension("mock")));

        let err = locator
            .load_singleton_implementor::<dyn VaultExtension>(false)
            .err()
            .expect("two sources are ambiguous");
        match err {
            DiscoveryError::MultipleImplementations { point, candidates } => {
                assert_eq!(point, "VaultExtension");
                assert_eq!(candidates, vec!["test", "manifest:file-vault"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_rejects_two_registered_singletons() {
        let locator =
            OverrideServiceLocator::new(Box::new(ManifestServiceLocator::with_entries(&[])));
        locator.register::<dyn VaultExtension>("first", Box::new(TestVaultExtension("a")));
        locator.register::<dyn VaultExtension>("second", Box::new(TestVaultExtension("b")));

        let err = locator
            .load_singleton_implementor::<dyn VaultExtension>(false)
            .err()
            .expect("two registrations are ambiguous");
        assert!(matches!(err, DiscoveryError::MultipleImplementations { .. }));
    }
}
