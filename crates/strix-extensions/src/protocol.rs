//! Custom `extension://` scheme resolution.
//!
//! Resources packaged inside an extension are addressable as
//! `extension://<id>/<path>`, resolved to files under that extension's
//! package root. Path traversal is rejected lexically before touching the
//! filesystem: any `..`, root, or prefix component fails with
//! [`Error::ProtocolPath`], so a crafted URL can never read outside the
//! package.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};
use crate::registry::ExtensionRegistry;

/// URL scheme serving extension-packaged resources
pub const EXTENSION_SCHEME: &str = "extension";

/// Registers and serves the `extension://` scheme
pub struct ProtocolRegistrar {
    registry: ExtensionRegistry,
    installed: AtomicBool,
}

impl ProtocolRegistrar {
    /// Create a registrar over the given registry
    pub fn new(registry: ExtensionRegistry) -> Self {
        Self {
            registry,
            installed: AtomicBool::new(false),
        }
    }

    /// Install the scheme handler. Idempotent; safe to call once at process
    /// start before any extension content is requested. Returns whether this
    /// call performed the installation.
    pub fn register_protocols(&self) -> bool {
        let newly = !self.installed.swap(true, Ordering::SeqCst);
        if newly {
            info!("registered {}:// scheme handler", EXTENSION_SCHEME);
        }
        newly
    }

    /// Whether the scheme handler is installed
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Resolve an `extension://<id>/<path>` URL to a file path inside the
    /// extension's package root.
    pub async fn resolve(&self, raw_url: &str) -> Result<PathBuf> {
        let url = Url::parse(raw_url)
            .map_err(|e| Error::ProtocolPath(format!("{raw_url}: {e}")))?;
        if url.scheme() != EXTENSION_SCHEME {
            return Err(Error::ProtocolPath(format!(
                "{raw_url}: expected {EXTENSION_SCHEME}:// scheme"
            )));
        }

        let extension_id = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::ProtocolPath(format!("{raw_url}: missing extension id")))?;

        let extension = self
            .registry
            .get(extension_id)
            .await
            .ok_or_else(|| Error::ExtensionGone(extension_id.to_string()))?;

        let resource = url.path().trim_start_matches('/');
        let relative = sanitize_resource_path(resource)
            .ok_or_else(|| Error::ProtocolPath(format!("{raw_url}: escapes package root")))?;

        let resolved = extension.path.join(relative);
        debug!("resolved {} -> {}", raw_url, resolved.display());
        Ok(resolved)
    }

    /// Resolve and read a packaged resource. Missing files surface as
    /// [`Error::ResourceNotFound`], the 404-equivalent for this scheme.
    pub async fn load(&self, raw_url: &str) -> Result<Vec<u8>> {
        let path = self.resolve(raw_url).await?;
        fs::read(&path)
            .await
            .map_err(|_| Error::ResourceNotFound(raw_url.to_string()))
    }
}

/// Validate a resource path component-wise. Returns the safe relative path,
/// or `None` when any component would escape the package root.
fn sanitize_resource_path(resource: &str) -> Option<PathBuf> {
    if resource.is_empty() {
        return None;
    }
    let mut clean = PathBuf::new();
    for component in Path::new(resource).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locales::Locales;
    use crate::manifest::{Extension, Manifest};
    use std::fs as std_fs;
    use tempfile::TempDir;

    async fn registrar_with_package() -> (ProtocolRegistrar, TempDir) {
        let dir = TempDir::new().unwrap();
        std_fs::create_dir_all(dir.path().join("assets")).unwrap();
        std_fs::write(dir.path().join("assets/icon.png"), b"png-bytes").unwrap();

        let registry = ExtensionRegistry::new();
        registry
            .register(Extension {
                id: "pkg".to_string(),
                manifest: Manifest {
                    name: "Pkg".to_string(),
                    version: "1.0".to_string(),
                    manifest_version: 2,
                    description: None,
                    default_locale: None,
                    permissions: Vec::new(),
                    background: None,
                    content_scripts: Vec::new(),
                },
                path: dir.path().to_path_buf(),
                enabled: true,
                locales: Locales::default(),
            })
            .await
            .unwrap();

        let registrar = ProtocolRegistrar::new(registry);
        registrar.register_protocols();
        (registrar, dir)
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (registrar, _dir) = registrar_with_package().await;
        assert!(registrar.is_registered());
        assert!(!registrar.register_protocols());
    }

    #[tokio::test]
    async fn resolves_packaged_resource() {
        let (registrar, dir) = registrar_with_package().await;

        let path = registrar
            .resolve("extension://pkg/assets/icon.png")
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("assets/icon.png"));

        let bytes = registrar
            .load("extension://pkg/assets/icon.png")
            .await
            .unwrap();
        assert_eq!(bytes, b"png-bytes");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (registrar, _dir) = registrar_with_package().await;

        for bad in [
            "extension://pkg/../../etc/passwd",
            "extension://pkg/assets/../../secret",
            "extension://pkg/..",
        ] {
            let err = registrar.resolve(bad).await.unwrap_err();
            assert!(
                matches!(err, Error::ProtocolPath(_)),
                "{bad} should be rejected, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_extension_fails() {
        let (registrar, _dir) = registrar_with_package().await;
        let err = registrar
            .resolve("extension://ghost/manifest.json")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExtensionGone(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (registrar, _dir) = registrar_with_package().await;
        let err = registrar
            .load("extension://pkg/assets/missing.png")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn wrong_scheme_is_rejected() {
        let (registrar, _dir) = registrar_with_package().await;
        let err = registrar
            .resolve("https://pkg/assets/icon.png")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolPath(_)));
    }
}
