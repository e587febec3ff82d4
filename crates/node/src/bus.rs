//! Contract for the external component bus observed by state-driven sync.
//!
//! The transport itself is out of scope; tests wire an in-memory bus and the
//! production binding lives with the process bootstrap.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error as ThisError;

/// A property value as it arrives from the bus: tagged, not stringly.
///
/// Comparisons against configured value sets use the canonical string form
/// described by the interface's schema.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl PropertyValue {
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Str(value) => value.clone(),
            Self::Int(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
        }
    }
}

pub type PropertyMap = HashMap<String, PropertyValue>;

/// One object reported by the object directory for an interface query.
#[derive(Clone, Debug)]
pub struct SubtreeEntry {
    pub object_path: String,
    pub service: String,
    pub interfaces: Vec<String>,
}

/// Name-owner transition for a bus service.
///
/// `new_owner == None` means the service disappeared from the bus.
#[derive(Clone, Debug)]
pub struct OwnerChange {
    pub service: String,
    pub new_owner: Option<String>,
}

#[derive(Debug, ThisError)]
pub enum StateProviderError {
    #[error("object directory lookup failed: {0}")]
    Directory(String),

    #[error("property fetch failed: {0}")]
    Properties(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),
}

/// The component bus as seen by the state-driven controller.
#[async_trait]
pub trait PlatformBus: Send + Sync {
    /// Objects implementing `interface`, as reported by the object directory.
    async fn interface_subtree(
        &self,
        interface: &str,
    ) -> Result<Vec<SubtreeEntry>, StateProviderError>;

    async fn get_all_properties(
        &self,
        service: &str,
        object_path: &str,
        interface: &str,
    ) -> Result<PropertyMap, StateProviderError>;

    /// Stream of property updates filtered by `(service, object_path, interface)`.
    async fn properties_changed(
        &self,
        service: &str,
        object_path: &str,
        interface: &str,
    ) -> Result<BoxStream<'static, PropertyMap>, StateProviderError>;

    /// Stream of owner transitions for `service`.
    async fn name_owner_changed(
        &self,
        service: &str,
    ) -> Result<BoxStream<'static, OwnerChange>, StateProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_values_canonicalize_to_schema_strings() {
        assert_eq!(PropertyValue::Str("Running".into()).canonical(), "Running");
        assert_eq!(PropertyValue::Int(3).canonical(), "3");
        assert_eq!(PropertyValue::Bool(true).canonical(), "true");
    }
}
