//! Capability identifiers and typed service keys.
//!
//! # Responsibility
//! - Name the service contracts modules provide and require.
//! - Bind a capability id to the Rust type stored under it.
//!
//! # Invariants
//! - Capability ids are the only coupling between modules.
//! - A `ServiceKey<T>` always resolves to an `Arc<T>` or fails.

use std::borrow::Cow;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;

/// Stable string naming a service contract, e.g. `dataspace:vault`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityId(Cow<'static, str>);

impl CapabilityId {
    /// Wraps a static id without validation.
    pub const fn from_static(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks the `namespace:name` shape.
    ///
    /// Both parts are lowercase ASCII with digits and single `.`, `_` or `-`
    /// separators. Surrounding whitespace is rejected, not trimmed.
    pub fn validate(&self) -> Result<(), CapabilityIdError> {
        let value = self.as_str();
        if value.trim().is_empty() {
            return Err(CapabilityIdError::Empty);
        }
        let Some((namespace, name)) = value.split_once(':') else {
            return Err(CapabilityIdError::MissingNamespace(value.to_string()));
        };
        if !is_valid_segment(namespace) || !is_valid_segment(name) {
            return Err(CapabilityIdError::Invalid(value.to_string()));
        }
        Ok(())
    }
}

impl Display for CapabilityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CapabilityId {
    fn from(value: &'static str) -> Self {
        Self::from_static(value)
    }
}

impl From<String> for CapabilityId {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

/// Typed handle for one capability.
///
/// The type parameter is usually a trait object, e.g.
/// `ServiceKey<dyn HealthCheckService>`.
pub struct ServiceKey<T: ?Sized> {
    id: &'static str,
    _marker: PhantomData<fn() -> Box<T>>,
}

impl<T: ?Sized> ServiceKey<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn capability(&self) -> CapabilityId {
        CapabilityId::from_static(self.id)
    }

    pub fn id(&self) -> &'static str {
        self.id
    }
}

impl<T: ?Sized> Clone for ServiceKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ServiceKey<T> {}

impl<T: ?Sized> std::fmt::Debug for ServiceKey<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.id).finish()
    }
}

/// Capability id of the process monitor.
pub const CAPABILITY_MONITOR: &str = "dataspace:monitor";
/// Capability id of the JSON type manager.
pub const CAPABILITY_TYPE_MANAGER: &str = "dataspace:type-manager";
/// Capability id of the secret store.
pub const CAPABILITY_VAULT: &str = "dataspace:vault";
/// Capability id of the health check service.
pub const CAPABILITY_HEALTH_CHECK_SERVICE: &str = "dataspace:health-check-service";

fn is_valid_segment(value: &str) -> bool {
    let mut chars = value.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }

    let mut prev_separator = false;
    for c in chars {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            prev_separator = false;
            continue;
        }
        if c == '.' || c == '_' || c == '-' {
            if prev_separator {
                return false;
            }
            prev_separator = true;
            continue;
        }
        return false;
    }
    !prev_separator
}

/// Capability id parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityIdError {
    Empty,
    MissingNamespace(String),
    Invalid(String),
}

impl Display for CapabilityIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "capability id must not be empty"),
            Self::MissingNamespace(value) => {
                write!(f, "capability id has no namespace: {value}")
            }
            Self::Invalid(value) => write!(f, "capability id is invalid: {value}"),
        }
    }
}

impl Error for CapabilityIdError {}

#[cfg(test)]
mod tests {
    use super::{
        CapabilityId, CapabilityIdError, ServiceKey, CAPABILITY_HEALTH_CHECK_SERVICE,
        CAPABILITY_MONITOR, CAPABILITY_TYPE_MANAGER, CAPABILITY_VAULT,
    };

    #[test]
    fn accepts_namespaced_capability_ids() {
        CapabilityId::from("dataspace:health-check-service")
            .validate()
            .expect("well-formed id should pass");
        CapabilityId::from("test:cap-12")
            .validate()
            .expect("digits are allowed");
    }

    #[test]
    fn rejects_empty_capability_id() {
        let err = CapabilityId::from("   ").validate().expect_err("empty id must fail");
        assert_eq!(err, CapabilityIdError::Empty);
    }

    #[test]
    fn rejects_capability_id_without_namespace() {
        let err = CapabilityId::from("vault").validate().expect_err("bare name must fail");
        assert_eq!(err, CapabilityIdError::MissingNamespace("vault".to_string()));
    }

    #[test]
    fn rejects_uppercase_whitespace_and_double_separators() {
        for id in ["Dataspace:vault", " dataspace:vault", "dataspace:key--store", "a:b:c"] {
            let err = CapabilityId::from(id).validate().expect_err(id);
            assert!(matches!(err, CapabilityIdError::Invalid(_)), "{id}");
        }
    }

    #[test]
    fn core_capabilities_are_well_formed() {
        for id in [
            CAPABILITY_MONITOR,
            CAPABILITY_TYPE_MANAGER,
            CAPABILITY_VAULT,
            CAPABILITY_HEALTH_CHECK_SERVICE,
        ] {
            CapabilityId::from(id)
                .validate()
                .expect("core capability must be valid");
        }
    }

    #[test]
    fn service_key_exposes_capability() {
        const KEY: ServiceKey<str> = ServiceKey::new("test:greeting");
        assert_eq!(KEY.capability().as_str(), "test:greeting");
        assert_eq!(KEY.id(), "test:greeting");
    }
}
