//! Validated mapping specs
//!
//! The raw `SyncedSecret` spec allows any combination of optional fields.
//! Conversion into [`MappingSpec`] checks that each entry sets exactly one
//! source and that output names are unique, so the resolver only ever sees
//! well-formed input.

use crate::crd::{DataEntrySpec, SyncedSecret, SyncedSecretSpec, ValueFrom};
use crate::{Result, SyncError};
use kube::ResourceExt;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingSpec {
    /// Import every key of one JSON secret
    DataFrom { secret_name: String },
    /// Ordered list of output entries
    Data(Vec<DataEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub name: String,
    pub source: DataSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Literal(String),
    KeyRef { secret_name: String, secret_key: String },
    WholeValueRef { secret_name: String },
    Template(String),
}

/// A mapping resource as tracked by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResource {
    pub name: String,
    pub namespace: String,
    /// Empty when the resource declares no role
    pub iam_role: String,
    pub spec: MappingSpec,
}

/// `namespace/name` identity of a mapping resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl MappingResource {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    /// Validate a watched `SyncedSecret` object.
    pub fn from_object(object: &SyncedSecret) -> Result<Self> {
        let namespace = object
            .namespace()
            .ok_or_else(|| SyncError::InvalidSpec("SyncedSecret has no namespace".to_string()))?;

        Ok(Self {
            name: object.name_any(),
            namespace,
            iam_role: object.spec.iam_role.clone().unwrap_or_default().trim().to_string(),
            spec: MappingSpec::try_from(&object.spec)?,
        })
    }
}

impl TryFrom<&SyncedSecretSpec> for MappingSpec {
    type Error = SyncError;

    fn try_from(spec: &SyncedSecretSpec) -> Result<Self> {
        match (&spec.data, &spec.data_from) {
            (Some(_), Some(_)) => Err(SyncError::InvalidSpec(
                "data and dataFrom are mutually exclusive".to_string(),
            )),
            (None, None) => Err(SyncError::InvalidSpec(
                "one of data or dataFrom is required".to_string(),
            )),
            (None, Some(data_from)) => {
                let secret_name = data_from.secret_ref.name.trim();
                if secret_name.is_empty() {
                    return Err(SyncError::InvalidSpec(
                        "dataFrom.secretRef.name must not be empty".to_string(),
                    ));
                }
                Ok(MappingSpec::DataFrom {
                    secret_name: secret_name.to_string(),
                })
            }
            (Some(entries), None) => {
                let mut seen = HashSet::new();
                let mut parsed = Vec::with_capacity(entries.len());
                for entry in entries {
                    let entry = DataEntry::try_from(entry)?;
                    if !seen.insert(entry.name.clone()) {
                        return Err(SyncError::InvalidSpec(format!(
                            "duplicate data entry name '{}'",
                            entry.name
                        )));
                    }
                    parsed.push(entry);
                }
                Ok(MappingSpec::Data(parsed))
            }
        }
    }
}

impl TryFrom<&DataEntrySpec> for DataEntry {
    type Error = SyncError;

    fn try_from(entry: &DataEntrySpec) -> Result<Self> {
        validate_key_name(&entry.name)?;

        let (secret_ref, template) = match &entry.value_from {
            Some(ValueFrom {
                secret_ref,
                template,
            }) => {
                if secret_ref.is_none() && template.is_none() {
                    return Err(SyncError::InvalidSpec(format!(
                        "entry '{}': valueFrom needs secretRef or template",
                        entry.name
                    )));
                }
                (secret_ref.as_ref(), template.as_ref())
            }
            None => (None, None),
        };

        let mut sources = Vec::new();
        if let Some(value) = &entry.value {
            sources.push(DataSource::Literal(value.clone()));
        }
        if let Some(key_ref) = &entry.secret_key_ref {
            sources.push(DataSource::KeyRef {
                secret_name: key_ref.name.clone(),
                secret_key: key_ref.key.clone(),
            });
        }
        if let Some(secret_ref) = secret_ref {
            sources.push(DataSource::WholeValueRef {
                secret_name: secret_ref.name.clone(),
            });
        }
        if let Some(template) = template {
            sources.push(DataSource::Template(template.clone()));
        }

        if sources.len() != 1 {
            return Err(SyncError::InvalidSpec(format!(
                "entry '{}' must set exactly one of value, secretKeyRef, valueFrom.secretRef, valueFrom.template (found {})",
                entry.name,
                sources.len()
            )));
        }

        let source = sources.remove(0);
        match &source {
            DataSource::KeyRef {
                secret_name,
                secret_key,
            } if secret_name.is_empty() || secret_key.is_empty() => {
                return Err(SyncError::InvalidSpec(format!(
                    "entry '{}': secretKeyRef needs both name and key",
                    entry.name
                )));
            }
            DataSource::WholeValueRef { secret_name } if secret_name.is_empty() => {
                return Err(SyncError::InvalidSpec(format!(
                    "entry '{}': valueFrom.secretRef.name must not be empty",
                    entry.name
                )));
            }
            _ => {}
        }

        Ok(DataEntry {
            name: entry.name.clone(),
            source,
        })
    }
}

/// Kubernetes Secret data keys may only contain alphanumerics, `-`, `_` and `.`.
fn validate_key_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidSpec(format!(
            "'{}' is not a valid secret key name",
            name
        )))
    }
}
