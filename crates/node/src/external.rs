//! Role & credentials provider contract.
//!
//! Discovery of the local role and of the peer's coordinates happens outside
//! the engine; the values are fetched once at start and again on
//! redundancy-state change.

use async_trait::async_trait;
use eyre::Result as EyreResult;

use datasync_primitives::BmcRole;

/// Redundancy-manager properties of the local controller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RedundancyProps {
    pub role: BmcRole,
    pub redundancy_enabled: bool,
}

/// Credentials for the authenticated transport to the sibling controller.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SiblingCredentials {
    pub host: String,
    pub username: String,
    pub secret: String,
}

#[async_trait]
pub trait ExternalData: Send + Sync {
    async fn fetch_redundancy_props(&self) -> EyreResult<RedundancyProps>;

    /// Network position of the sibling controller, when known.
    async fn fetch_sibling_position(&self) -> EyreResult<Option<u8>>;

    async fn fetch_sibling_credentials(&self) -> EyreResult<Option<SiblingCredentials>>;
}

/// Fixed provider used by the bootstrap wiring and tests.
#[derive(Clone, Debug, Default)]
pub struct StaticExternalData {
    pub props: RedundancyProps,
    pub position: Option<u8>,
    pub credentials: Option<SiblingCredentials>,
}

impl StaticExternalData {
    #[must_use]
    pub fn new(props: RedundancyProps) -> Self {
        Self {
            props,
            position: None,
            credentials: None,
        }
    }
}

#[async_trait]
impl ExternalData for StaticExternalData {
    async fn fetch_redundancy_props(&self) -> EyreResult<RedundancyProps> {
        Ok(self.props)
    }

    async fn fetch_sibling_position(&self) -> EyreResult<Option<u8>> {
        Ok(self.position)
    }

    async fn fetch_sibling_credentials(&self) -> EyreResult<Option<SiblingCredentials>> {
        Ok(self.credentials.clone())
    }
}
