//! `SyncedSecret` custom resource
//!
//! ```yaml
//! apiVersion: secretsync.io/v1
//! kind: SyncedSecret
//! metadata:
//!   name: mysql-credentials
//!   namespace: team-a
//! spec:
//!   IAMRole: arn:aws:iam::123456789012:role/team-a-secrets
//!   data:
//!     - name: MYSQL_USER
//!       value: app
//!     - name: MYSQL_PASSWORD
//!       secretKeyRef:
//!         name: prod/mysql
//!         key: password
//!     - name: TLS_CERT
//!       valueFrom:
//!         secretRef:
//!           name: prod/tls-cert
//!     - name: DATABASE_URL
//!       valueFrom:
//!         template: |
//!           {{#with (getSecretValueMap "prod/mysql")}}mysql://{{user}}:{{password}}@db:3306/app{{/with}}
//! ```
//!
//! Whole-secret import uses `dataFrom` instead of `data`:
//!
//! ```yaml
//! spec:
//!   dataFrom:
//!     secretRef:
//!       name: prod/mysql
//! ```

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secretsync.io",
    version = "v1",
    kind = "SyncedSecret",
    namespaced,
    shortname = "syncsec"
)]
#[serde(rename_all = "camelCase")]
pub struct SyncedSecretSpec {
    /// Role assumed to read the referenced secrets
    #[serde(rename = "IAMRole", default, skip_serializing_if = "Option::is_none")]
    pub iam_role: Option<String>,

    /// Ordered output entries; mutually exclusive with `dataFrom`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<DataEntrySpec>>,

    /// Import every key of one JSON secret; mutually exclusive with `data`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_from: Option<DataFromSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataFromSpec {
    pub secret_ref: SecretRef,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// One output key. Exactly one of `value`, `secretKeyRef`,
/// `valueFrom.secretRef` and `valueFrom.template` must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataEntrySpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}
