//! Extension registry: the single authoritative table of loaded extensions.
//!
//! The registry owns [`Extension`] descriptors and the load-order sequence
//! that request-rule evaluation relies on. It is pure shared state; cascading
//! teardown of alarms, background pages, and storage on unregister is
//! orchestrated by [`ExtensionRuntime`](crate::runtime::ExtensionRuntime) so
//! that no component ever observes a removed-but-still-referenced id.
//!
//! Components must not cache entries across registry mutations; they either
//! re-query or consume a rebuilt snapshot (see
//! [`WebRequestInterceptor`](crate::webrequest::WebRequestInterceptor)).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::Extension;

#[derive(Default)]
struct RegistryInner {
    /// Descriptors indexed by extension id
    extensions: HashMap<String, Arc<Extension>>,
    /// Ids in load order; decides request-rule tie-breaks
    load_order: Vec<String>,
}

/// Process-wide map from extension id to its descriptor
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded extension.
    ///
    /// Ids are unique; registering an id twice fails without touching the
    /// existing entry.
    pub async fn register(&self, extension: Extension) -> Result<Arc<Extension>> {
        let mut inner = self.inner.write().await;
        if inner.extensions.contains_key(&extension.id) {
            return Err(Error::DuplicateExtension(extension.id));
        }

        let id = extension.id.clone();
        let entry = Arc::new(extension);
        inner.extensions.insert(id.clone(), entry.clone());
        inner.load_order.push(id.clone());
        debug!("registered extension {}", id);
        Ok(entry)
    }

    /// Remove an extension. Idempotent: removing an unknown id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<Arc<Extension>> {
        let mut inner = self.inner.write().await;
        let removed = inner.extensions.remove(id);
        if removed.is_some() {
            inner.load_order.retain(|entry| entry != id);
            debug!("unregistered extension {}", id);
        }
        removed
    }

    /// Look up an extension by id
    pub async fn get(&self, id: &str) -> Option<Arc<Extension>> {
        self.inner.read().await.extensions.get(id).cloned()
    }

    /// Whether the id is currently registered
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.extensions.contains_key(id)
    }

    /// Enabled extensions in load order
    pub async fn list_enabled(&self) -> Vec<Arc<Extension>> {
        let inner = self.inner.read().await;
        inner
            .load_order
            .iter()
            .filter_map(|id| inner.extensions.get(id))
            .filter(|ext| ext.enabled)
            .cloned()
            .collect()
    }

    /// All registered extensions in load order, enabled or not
    pub async fn list_all(&self) -> Vec<Arc<Extension>> {
        let inner = self.inner.read().await;
        inner
            .load_order
            .iter()
            .filter_map(|id| inner.extensions.get(id))
            .cloned()
            .collect()
    }

    /// Flip the enabled flag. Returns the updated descriptor.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Arc<Extension>> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .extensions
            .get_mut(id)
            .ok_or_else(|| Error::ExtensionGone(id.to_string()))?;

        if entry.enabled != enabled {
            let mut updated = (**entry).clone();
            updated.enabled = enabled;
            *entry = Arc::new(updated);
            debug!("extension {} enabled={}", id, enabled);
        }
        Ok(entry.clone())
    }

    /// Number of registered extensions
    pub async fn count(&self) -> usize {
        self.inner.read().await.extensions.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::locales::Locales;
    use crate::manifest::Manifest;
    use std::path::PathBuf;

    pub(crate) fn test_extension(id: &str) -> Extension {
        Extension {
            id: id.to_string(),
            manifest: Manifest {
                name: format!("Test {id}"),
                version: "1.0".to_string(),
                manifest_version: 2,
                description: None,
                default_locale: None,
                permissions: Vec::new(),
                background: None,
                content_scripts: Vec::new(),
            },
            path: PathBuf::from(format!("/tmp/{id}")),
            enabled: true,
            locales: Locales::default(),
        }
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = ExtensionRegistry::new();
        registry.register(test_extension("a")).await.unwrap();

        let found = registry.get("a").await.unwrap();
        assert_eq!(found.id, "a");
        assert!(registry.contains("a").await);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let registry = ExtensionRegistry::new();
        registry.register(test_extension("a")).await.unwrap();

        let err = registry.register(test_extension("a")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateExtension(id) if id == "a"));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ExtensionRegistry::new();
        registry.register(test_extension("a")).await.unwrap();

        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn list_enabled_preserves_load_order() {
        let registry = ExtensionRegistry::new();
        registry.register(test_extension("first")).await.unwrap();
        registry.register(test_extension("second")).await.unwrap();
        registry.register(test_extension("third")).await.unwrap();

        registry.set_enabled("second", false).await.unwrap();

        let ids: Vec<String> = registry
            .list_enabled()
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["first", "third"]);

        let all: Vec<String> = registry
            .list_all()
            .await
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(all, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn set_enabled_on_unknown_id_fails() {
        let registry = ExtensionRegistry::new();
        let err = registry.set_enabled("ghost", true).await.unwrap_err();
        assert!(matches!(err, Error::ExtensionGone(id) if id == "ghost"));
    }
}
