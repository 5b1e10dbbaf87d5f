//! Turns a mapping spec into the document written to the output store

use crate::cache::SecretCache;
use crate::mapping::{DataEntry, DataSource, MappingSpec};
use crate::template::TemplateRenderer;
use crate::{ResolvedDocument, Result, SecretValue, SyncError};
use std::sync::Arc;
use tracing::debug;

/// Stateless apart from the shared cache; safe to use from many tasks at once.
pub struct Resolver {
    cache: Arc<SecretCache>,
    templates: TemplateRenderer,
}

impl Resolver {
    pub fn new(cache: Arc<SecretCache>) -> Self {
        Self {
            templates: TemplateRenderer::new(Arc::clone(&cache)),
            cache,
        }
    }

    /// Resolve every entry of `spec`, fetching secret values with `role`.
    ///
    /// The first failing entry aborts the whole document.
    pub async fn resolve(&self, spec: &MappingSpec, role: &str) -> Result<ResolvedDocument> {
        match spec {
            MappingSpec::DataFrom { secret_name } => self.import_all(secret_name, role).await,
            MappingSpec::Data(entries) => {
                let mut document = ResolvedDocument::new();
                for entry in entries {
                    let value = self.resolve_entry(entry, role).await?;
                    document.insert(entry.name.clone(), value);
                }
                Ok(document)
            }
        }
    }

    async fn resolve_entry(&self, entry: &DataEntry, role: &str) -> Result<Vec<u8>> {
        debug!(entry = %entry.name, "Resolving data entry");

        match &entry.source {
            DataSource::Literal(value) => Ok(value.as_bytes().to_vec()),
            DataSource::KeyRef {
                secret_name,
                secret_key,
            } => {
                let cached = self.cache.get_value(secret_name, role).await?;
                let map = cached
                    .value
                    .as_map()
                    .ok_or_else(|| SyncError::TypeMismatch(secret_name.clone()))?;
                map.get(secret_key)
                    .map(|value| value.as_bytes().to_vec())
                    .ok_or_else(|| SyncError::KeyNotFound {
                        secret: secret_name.clone(),
                        key: secret_key.clone(),
                    })
            }
            DataSource::WholeValueRef { secret_name } => {
                let cached = self.cache.get_value(secret_name, role).await?;
                Ok(cached.value.to_bytes())
            }
            DataSource::Template(body) => {
                let rendered = self.templates.render(body, role).await?;
                Ok(rendered.into_bytes())
            }
        }
    }

    async fn import_all(&self, secret_name: &str, role: &str) -> Result<ResolvedDocument> {
        let cached = self.cache.get_value(secret_name, role).await?;
        match cached.value {
            SecretValue::Map { map, .. } => Ok(map
                .into_iter()
                .map(|(key, value)| (key, value.into_bytes()))
                .collect()),
            SecretValue::Bytes(_) => Err(SyncError::NotAMap(secret_name.to_string())),
        }
    }
}
