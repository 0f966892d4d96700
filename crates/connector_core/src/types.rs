//! JSON type manager shared by all modules.
//!
//! Published under `dataspace:type-manager`. Modules register logical type
//! names for polymorphic payloads and use one marshaling configuration.

use crate::system::capability::{ServiceKey, CAPABILITY_TYPE_MANAGER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{PoisonError, RwLock};

pub type TypeManagerResult<T> = Result<T, TypeManagerError>;

pub const TYPE_MANAGER: ServiceKey<TypeManager> = ServiceKey::new(CAPABILITY_TYPE_MANAGER);

/// Serialization façade over `serde_json`.
#[derive(Debug, Default)]
pub struct TypeManager {
    type_names: RwLock<BTreeMap<String, &'static str>>,
}

impl TypeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a logical type name to the Rust type `T`.
    ///
    /// Re-registering the same name for the same type is a no-op; a different
    /// type is rejected.
    pub fn register_type_name<T: 'static>(&self, name: &str) -> TypeManagerResult<()> {
        let rust_type = std::any::type_name::<T>();
        let mut names = self
            .type_names
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match names.get(name) {
            Some(existing) if *existing == rust_type => Ok(()),
            Some(existing) => Err(TypeManagerError::DuplicateTypeName {
                name: name.to_string(),
                existing: existing.to_string(),
            }),
            None => {
                names.insert(name.to_string(), rust_type);
                Ok(())
            }
        }
    }

    /// Returns the registered `(name, rust type)` pairs, sorted by name.
    pub fn type_names(&self) -> Vec<(String, &'static str)> {
        self.type_names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, rust_type)| (name.clone(), *rust_type))
            .collect()
    }

    pub fn write_string<T: Serialize + ?Sized>(&self, value: &T) -> TypeManagerResult<String> {
        serde_json::to_string(value).map_err(TypeManagerError::Serialize)
    }

    pub fn read_value<T: DeserializeOwned>(&self, raw: &str) -> TypeManagerResult<T> {
        serde_json::from_str(raw).map_err(TypeManagerError::Deserialize)
    }
}

#[derive(Debug)]
pub enum TypeManagerError {
    DuplicateTypeName { name: String, existing: String },
    Serialize(serde_json::Error),
    Deserialize(serde_json::Error),
}

impl Display for TypeManagerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateTypeName { name, existing } => {
                write!(f, "type name `{name}` already bound to {existing}")
            }
            Self::Serialize(err) => write!(f, "failed to serialize value: {err}"),
            Self::Deserialize(err) => write!(f, "failed to deserialize value: {err}"),
        }
    }
}

impl Error for TypeManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Serialize(err) | Self::Deserialize(err) => Some(err),
            Self::DuplicateTypeName { .. } => None,
        }
    }
}
