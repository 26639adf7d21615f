pub mod fixture;

use async_trait::async_trait;

use models::instance_type::InstanceType;
use models::nodeclaim::NodeClaim;
use models::nodepool::NodePool;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Retryable cloud failure; the claim is dropped this pass and the next
    /// pass tries again.
    #[error("transient cloud failure: {0}")]
    Transient(String),
    #[error("instance types unavailable for node pool {0}")]
    InstanceTypesUnavailable(String),
    #[error("node claim creation failed: {0}")]
    CreateFailed(String),
    #[error("node claim not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// The narrow capability set the core needs from a cloud.
///
/// `get_instance_types` may inject per-call offerings (live reserved
/// capacity for the given node pool); the core never caches its result
/// across passes.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn get_instance_types(&self, nodepool: &NodePool) -> Result<Vec<InstanceType>, ProviderError>;

    async fn create(&self, claim: &NodeClaim) -> Result<NodeClaim, ProviderError>;

    async fn delete(&self, claim_name: &str) -> Result<(), ProviderError>;

    /// Node-class kinds this provider serves; used only to wire watches.
    fn supported_node_classes(&self) -> Vec<String>;
}
