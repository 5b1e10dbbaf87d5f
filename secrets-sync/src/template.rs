//! Handlebars rendering for `valueFrom.template` entries
//!
//! Templates see one variable, `Secrets`, mapping every known secret id to its
//! tags, plus three helpers:
//!
//! - `filterByTagKey Secrets "tag"`: the subset of `Secrets` carrying `tag`
//! - `getSecretValue "id"`: the raw value of a secret
//! - `getSecretValueMap "id"`: the value of a JSON secret as an object
//!
//! ```handlebars
//! {{#each (filterByTagKey Secrets "team-a")}}{{@key}}
//! {{/each}}
//! {{#with (getSecretValueMap "prod/mysql")}}{{user}}:{{password}}{{/with}}
//! ```
//!
//! The value helpers go through the secret cache with the mapping resource's
//! role. Handlebars renders synchronously, so rendering runs on the blocking
//! pool and the helpers wait on the cache from there.

use crate::cache::SecretCache;
use crate::{CachedValue, Result, SecretDescriptor, SecretValue, SyncError};
use handlebars::{
    Context, Handlebars, Helper, HelperDef, JsonValue, RenderContext, RenderError, ScopedJson,
};
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::debug;

/// Template variable holding the descriptor listing.
pub const SECRETS_VAR: &str = "Secrets";

pub struct TemplateRenderer {
    cache: Arc<SecretCache>,
}

impl TemplateRenderer {
    pub fn new(cache: Arc<SecretCache>) -> Self {
        Self { cache }
    }

    /// Render `body` with value lookups made under `role`.
    ///
    /// When a value helper fails, that failure is returned instead of the
    /// generic render error.
    pub async fn render(&self, body: &str, role: &str) -> Result<String> {
        let descriptors = self.cache.list_descriptors().await;
        let data = render_context(&descriptors);

        let lookup = Arc::new(SecretLookup {
            cache: Arc::clone(&self.cache),
            role: role.to_string(),
            handle: Handle::current(),
            failure: Mutex::new(None),
        });
        let registry = registry(Arc::clone(&lookup));
        let body = body.to_string();

        let rendered = tokio::task::spawn_blocking(move || registry.render_template(&body, &data))
            .await
            .map_err(|e| SyncError::Template(format!("render task failed: {}", e)))?;

        match rendered {
            Ok(output) => Ok(output),
            Err(e) => {
                debug!(error = %e, "Template rendering failed");
                Err(lookup.take_failure().unwrap_or_else(|| SyncError::from(e)))
            }
        }
    }
}

/// `{"Secrets": {id: {tag: value}}}`
pub fn render_context(descriptors: &[SecretDescriptor]) -> JsonValue {
    let secrets: Map<String, JsonValue> = descriptors
        .iter()
        .map(|descriptor| {
            let tags: BTreeMap<&String, &String> = descriptor.tags.iter().collect();
            (descriptor.id.clone(), json!(tags))
        })
        .collect();

    let mut root = Map::new();
    root.insert(SECRETS_VAR.to_string(), JsonValue::Object(secrets));
    JsonValue::Object(root)
}

fn registry(lookup: Arc<SecretLookup>) -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    registry.set_strict_mode(true);

    registry.register_helper("filterByTagKey", Box::new(FilterByTagKey));
    registry.register_helper(
        "getSecretValue",
        Box::new(SecretValueHelper {
            lookup: Arc::clone(&lookup),
            as_map: false,
        }),
    );
    registry.register_helper(
        "getSecretValueMap",
        Box::new(SecretValueHelper {
            lookup,
            as_map: true,
        }),
    );
    registry
}

struct SecretLookup {
    cache: Arc<SecretCache>,
    role: String,
    handle: Handle,
    failure: Mutex<Option<SyncError>>,
}

impl SecretLookup {
    fn fetch(&self, id: &str) -> std::result::Result<CachedValue, RenderError> {
        self.handle
            .block_on(self.cache.get_value(id, &self.role))
            .map_err(|e| self.fail(e))
    }

    /// Remember the first failure and turn it into a render error.
    fn fail(&self, error: SyncError) -> RenderError {
        let message = error.to_string();
        if let Ok(mut slot) = self.failure.lock() {
            slot.get_or_insert(error);
        }
        RenderError::new(message)
    }

    fn take_failure(&self) -> Option<SyncError> {
        self.failure.lock().ok().and_then(|mut slot| slot.take())
    }
}

fn string_param<'a>(
    h: &'a Helper<'_, '_>,
    index: usize,
    helper: &str,
) -> std::result::Result<&'a str, RenderError> {
    h.param(index)
        .and_then(|p| p.value().as_str())
        .ok_or_else(|| RenderError::new(format!("{}: parameter {} must be a string", helper, index)))
}

struct FilterByTagKey;

impl HelperDef for FilterByTagKey {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'reg, 'rc>, RenderError> {
        let secrets = h
            .param(0)
            .and_then(|p| p.value().as_object())
            .ok_or_else(|| RenderError::new("filterByTagKey: first parameter must be the secrets map"))?;
        let tag_key = string_param(h, 1, "filterByTagKey")?;

        let filtered: Map<String, JsonValue> = secrets
            .iter()
            .filter(|(_, tags)| tags.as_object().map(|t| t.contains_key(tag_key)).unwrap_or(false))
            .map(|(id, tags)| (id.clone(), tags.clone()))
            .collect();

        Ok(ScopedJson::Derived(JsonValue::Object(filtered)))
    }
}

struct SecretValueHelper {
    lookup: Arc<SecretLookup>,
    as_map: bool,
}

impl HelperDef for SecretValueHelper {
    fn call_inner<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'reg, 'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
    ) -> std::result::Result<ScopedJson<'reg, 'rc>, RenderError> {
        let helper = if self.as_map { "getSecretValueMap" } else { "getSecretValue" };
        let id = string_param(h, 0, helper)?;
        let cached = self.lookup.fetch(id)?;

        let value = if self.as_map {
            match cached.value {
                SecretValue::Map { map, .. } => json!(map),
                SecretValue::Bytes(_) => {
                    return Err(self.lookup.fail(SyncError::TypeMismatch(id.to_string())));
                }
            }
        } else {
            JsonValue::String(String::from_utf8_lossy(cached.value.as_bytes()).into_owned())
        };

        Ok(ScopedJson::Derived(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSecretClient;

    async fn renderer_with(client: &Arc<FakeSecretClient>) -> TemplateRenderer {
        let cache = Arc::new(SecretCache::new(client.clone(), 100));
        cache.refresh_list().await.unwrap();
        TemplateRenderer::new(cache)
    }

    #[test]
    fn test_render_context_lists_tags() {
        let descriptors = vec![SecretDescriptor {
            id: "a".to_string(),
            tags: [("tag1".to_string(), "x".to_string())].into_iter().collect(),
            version_id: "v1".to_string(),
        }];
        assert_eq!(
            render_context(&descriptors),
            json!({"Secrets": {"a": {"tag1": "x"}}})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_filter_by_tag_key() {
        let client = Arc::new(FakeSecretClient::new());
        client.put_secret("a", &[("tag1", "")], "1");
        client.put_secret("b", &[], "2");
        let renderer = renderer_with(&client).await;

        let output = renderer
            .render(r#"{{#each (filterByTagKey Secrets "tag1")}}{{@key}};{{/each}}"#, "")
            .await
            .unwrap();
        assert_eq!(output, "a;");
        assert_eq!(client.get_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_value_helpers() {
        let client = Arc::new(FakeSecretClient::new());
        client.put_secret("mysql", &[], r#"{"user":"app","password":"p&ss"}"#);
        client.put_secret("token", &[], "raw-token");
        let renderer = renderer_with(&client).await;

        let output = renderer
            .render(
                r#"{{#with (getSecretValueMap "mysql")}}{{user}}:{{password}}{{/with}}@{{getSecretValue "token"}}"#,
                "",
            )
            .await
            .unwrap();
        assert_eq!(output, "app:p&ss@raw-token");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_helper_failure_surfaces_underlying_error() {
        let client = Arc::new(FakeSecretClient::new());
        client.put_secret("token", &[], "raw-token");
        let renderer = renderer_with(&client).await;

        let err = renderer
            .render(r#"{{getSecretValue "missing"}}"#, "")
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::NotFound("missing".to_string()));

        let err = renderer
            .render(r#"{{#with (getSecretValueMap "token")}}{{x}}{{/with}}"#, "")
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::TypeMismatch("token".to_string()));

        client.fail_get("token", true);
        renderer.cache.invalidate_all();
        let err = renderer
            .render(r#"{{getSecretValue "token"}}"#, "")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_helpers_fetch_with_callers_role() {
        let client = Arc::new(FakeSecretClient::new());
        client.put_secret("token", &[], "raw-token");
        let renderer = renderer_with(&client).await;

        renderer
            .render(r#"{{getSecretValue "token"}}"#, "arn:aws:iam::1:role/app")
            .await
            .unwrap();
        assert_eq!(client.last_fetch_role(), Some("arn:aws:iam::1:role/app".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parse_error_is_template_error() {
        let client = Arc::new(FakeSecretClient::new());
        let renderer = renderer_with(&client).await;

        let err = renderer.render("{{#each Secrets}}", "").await.unwrap_err();
        assert!(matches!(err, SyncError::Template(_)));
    }
}
