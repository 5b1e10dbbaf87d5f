//! Remote secret service clients

pub mod aws;

pub use aws::AwsSecretsManagerClient;

use crate::{Result, RoleCredentials, SecretDescriptor};
use async_trait::async_trait;

/// Stage label the remote service puts on the version it serves by default.
pub const CURRENT_STAGE: &str = "AWSCURRENT";

/// One version of a remote secret and the stages pointing at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretVersion {
    pub version_id: String,
    pub stages: Vec<String>,
}

impl SecretVersion {
    pub fn is_current(&self) -> bool {
        self.stages.iter().any(|stage| stage == CURRENT_STAGE)
    }
}

/// Operations the sync engine needs from the remote secret service.
///
/// The role used for `assume_role` only needs these four capabilities on the
/// secrets it maps.
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Client name, used in logs
    fn name(&self) -> &str;

    /// List every visible secret with its tags and current version
    async fn list_secrets(&self) -> Result<Vec<SecretDescriptor>>;

    /// List the versions of a single secret
    async fn list_secret_versions(&self, id: &str) -> Result<Vec<SecretVersion>>;

    /// Obtain temporary credentials for `role`
    async fn assume_role(&self, role: &str) -> Result<RoleCredentials>;

    /// Fetch the payload of `id` at `version_id`, with the given credentials or
    /// the client's own identity when `None`
    async fn get_secret_value(
        &self,
        id: &str,
        version_id: &str,
        credentials: Option<&RoleCredentials>,
    ) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_stage_detection() {
        let current = SecretVersion {
            version_id: "v2".to_string(),
            stages: vec!["AWSPREVIOUS".to_string(), "AWSCURRENT".to_string()],
        };
        let previous = SecretVersion {
            version_id: "v1".to_string(),
            stages: vec!["AWSPREVIOUS".to_string()],
        };
        assert!(current.is_current());
        assert!(!previous.is_current());
    }
}
