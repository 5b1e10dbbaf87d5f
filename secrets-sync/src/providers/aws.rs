//! AWS Secrets Manager client

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::config::{Credentials, Region};
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::Client;
use crate::config::AwsSecretsManagerConfig;
use crate::providers::{SecretClient, SecretVersion};
use crate::{Result, RoleCredentials, SecretDescriptor, SyncError};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LIST_PAGE_SIZE: i32 = 100;

pub struct AwsSecretsManagerClient {
    client: Client,
    sts: aws_sdk_sts::Client,
    sdk_config: aws_config::SdkConfig,
    session_name: String,
    assumed: CredentialCache,
}

/// Assumed-role credentials, reused until close to expiry.
#[derive(Default)]
struct CredentialCache {
    entries: Mutex<HashMap<String, RoleCredentials>>,
}

impl CredentialCache {
    /// Cached credentials for `role`, or the result of `assume` on a miss.
    ///
    /// The lock is not held while `assume` runs.
    async fn get_or_assume<F, Fut>(&self, role: &str, assume: F) -> Result<RoleCredentials>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RoleCredentials>>,
    {
        if let Some(credentials) = self.entries.lock().await.get(role) {
            if credentials.is_fresh(chrono::Duration::minutes(5)) {
                return Ok(credentials.clone());
            }
        }

        let credentials = assume().await?;
        self.entries
            .lock()
            .await
            .insert(role.to_string(), credentials.clone());
        Ok(credentials)
    }
}

impl AwsSecretsManagerClient {
    pub async fn new(config: &AwsSecretsManagerConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        if sdk_config.region().is_none() {
            return Err(SyncError::Config(
                "no AWS region configured (set AWS_REGION)".to_string(),
            ));
        }

        info!(
            region = ?sdk_config.region(),
            "AWS Secrets Manager client initialized"
        );

        Ok(Self {
            client: Client::new(&sdk_config),
            sts: aws_sdk_sts::Client::new(&sdk_config),
            sdk_config,
            session_name: config.role_session_name.clone(),
            assumed: CredentialCache::default(),
        })
    }

    async fn request_credentials(&self, role: &str) -> Result<RoleCredentials> {
        debug!(role, "Assuming role");

        let response = self
            .sts
            .assume_role()
            .role_arn(role)
            .role_session_name(&self.session_name)
            .send()
            .await
            .map_err(|e| SyncError::fetch(role, aws_sdk_sts::error::DisplayErrorContext(&e)))?;

        let issued = response
            .credentials()
            .ok_or_else(|| SyncError::fetch(role, "AssumeRole returned no credentials"))?;

        Ok(RoleCredentials {
            role: role.to_string(),
            access_key_id: issued.access_key_id().to_string(),
            secret_access_key: SecretString::new(issued.secret_access_key().to_string()),
            session_token: Some(SecretString::new(issued.session_token().to_string())),
            expiration: chrono::DateTime::from_timestamp(issued.expiration().secs(), 0),
        })
    }

    /// Client that signs requests with assumed-role credentials.
    fn scoped_client(&self, credentials: &RoleCredentials) -> Client {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.expose_secret().clone(),
            credentials
                .session_token
                .as_ref()
                .map(|token| token.expose_secret().clone()),
            credentials.expiration.map(SystemTime::from),
            "secrets-sync-assume-role",
        );

        let conf = aws_sdk_secretsmanager::config::Builder::from(&self.sdk_config)
            .credentials_provider(provider)
            .build();

        Client::from_conf(conf)
    }

    async fn current_version(&self, id: &str) -> Result<Option<String>> {
        let versions = self.list_secret_versions(id).await?;
        Ok(versions
            .into_iter()
            .find(SecretVersion::is_current)
            .map(|v| v.version_id))
    }
}

#[async_trait]
impl SecretClient for AwsSecretsManagerClient {
    fn name(&self) -> &str {
        "aws-secrets-manager"
    }

    async fn list_secrets(&self) -> Result<Vec<SecretDescriptor>> {
        debug!("Listing secrets from AWS Secrets Manager");

        let mut descriptors = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_secrets()
                .max_results(LIST_PAGE_SIZE)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| SyncError::fetch("*", DisplayErrorContext(&e)))?;

            for entry in response.secret_list() {
                let Some(name) = entry.name() else {
                    continue;
                };

                let tags = entry
                    .tags()
                    .iter()
                    .filter_map(|tag| {
                        Some((tag.key()?.to_string(), tag.value().unwrap_or("").to_string()))
                    })
                    .collect::<HashMap<_, _>>();

                let listed_version = entry.secret_versions_to_stages().and_then(|stages| {
                    stages
                        .iter()
                        .find(|(_, labels)| labels.iter().any(|l| l == super::CURRENT_STAGE))
                        .map(|(version, _)| version.clone())
                });

                let version_id = match listed_version {
                    Some(version) => version,
                    None => match self.current_version(name).await {
                        Ok(Some(version)) => version,
                        Ok(None) => {
                            warn!(secret = name, "Secret has no current version, skipping");
                            continue;
                        }
                        Err(e) => {
                            warn!(secret = name, error = %e, "Could not resolve current version, skipping");
                            continue;
                        }
                    },
                };

                descriptors.push(SecretDescriptor {
                    id: name.to_string(),
                    tags,
                    version_id,
                });
            }

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(descriptors)
    }

    async fn list_secret_versions(&self, id: &str) -> Result<Vec<SecretVersion>> {
        debug!("Listing versions for secret: {}", id);

        let response = self
            .client
            .list_secret_version_ids()
            .secret_id(id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    SyncError::NotFound(id.to_string())
                } else {
                    SyncError::fetch(id, DisplayErrorContext(&e))
                }
            })?;

        Ok(response
            .versions()
            .iter()
            .filter_map(|entry| {
                Some(SecretVersion {
                    version_id: entry.version_id()?.to_string(),
                    stages: entry.version_stages().to_vec(),
                })
            })
            .collect())
    }

    async fn assume_role(&self, role: &str) -> Result<RoleCredentials> {
        self.assumed
            .get_or_assume(role, || self.request_credentials(role))
            .await
    }


    async fn get_secret_value(
        &self,
        id: &str,
        version_id: &str,
        credentials: Option<&RoleCredentials>,
    ) -> Result<Vec<u8>> {
        debug!(secret = id, version = version_id, "Getting secret from AWS Secrets Manager");

        let client = match credentials {
            Some(credentials) => self.scoped_client(credentials),
            None => self.client.clone(),
        };

        let response = client
            .get_secret_value()
            .secret_id(id)
            .version_id(version_id)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|se| se.is_resource_not_found_exception())
                    .unwrap_or(false)
                {
                    SyncError::NotFound(id.to_string())
                } else {
                    SyncError::fetch(id, DisplayErrorContext(&e))
                }
            })?;

        if let Some(value) = response.secret_string() {
            return Ok(value.as_bytes().to_vec());
        }

        response
            .secret_binary()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| SyncError::fetch(id, "secret has neither a string nor a binary value"))
    }
}
