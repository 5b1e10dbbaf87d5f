//! Kubernetes implementations of the output store and the policy source

use crate::policy::NamespacePolicy;
use crate::store::{OutputStore, PolicySource};
use crate::{ResolvedDocument, Result, SyncError};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "secrets-sync";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Writes resolved documents as `Opaque` Secrets.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// The Secret applied for `document`; every key of the previous version not
/// in `document` is dropped by the apply.
pub fn output_secret(name: &str, namespace: &str, document: &ResolvedDocument) -> Secret {
    let data: BTreeMap<String, ByteString> = document
        .iter()
        .map(|(key, value)| (key.clone(), ByteString(value.clone())))
        .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl OutputStore for KubeSecretStore {
    async fn write(&self, name: &str, namespace: &str, document: &ResolvedDocument) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = output_secret(name, namespace, document);

        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;

        debug!(namespace, name, keys = document.len(), "Applied Secret");
        Ok(())
    }
}

/// Reads the role allow-list annotation from Namespace objects.
#[derive(Clone)]
pub struct KubeNamespacePolicies {
    client: Client,
    annotation: String,
}

impl KubeNamespacePolicies {
    pub fn new(client: Client, annotation: impl Into<String>) -> Self {
        Self {
            client,
            annotation: annotation.into(),
        }
    }
}

#[async_trait]
impl PolicySource for KubeNamespacePolicies {
    async fn namespace_policy(&self, namespace: &str) -> Result<NamespacePolicy> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let object = api
            .get_opt(namespace)
            .await?
            .ok_or_else(|| SyncError::Store(format!("namespace {} not found", namespace)))?;

        Ok(policy_from_namespace(&object, namespace, &self.annotation))
    }
}

fn policy_from_namespace(object: &Namespace, namespace: &str, annotation: &str) -> NamespacePolicy {
    let raw = object
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(annotation))
        .map(String::as_str);
    NamespacePolicy::from_annotation(namespace, raw)
}
