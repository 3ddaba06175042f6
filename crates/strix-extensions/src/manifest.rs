//! Extension package loading and manifest validation.
//!
//! A package is a directory containing a `manifest.json` plus optional
//! `_locales/` subdirectories. Loading is atomic: either the manifest
//! validates completely and an [`Extension`] descriptor is produced, or the
//! package is rejected with a [`ManifestError`] and nothing is registered.
//!
//! Directory enumeration sorts packages by directory name so extension load
//! order — which later decides request-rule tie-breaks — is deterministic
//! across restarts.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ManifestError;
use crate::locales::Locales;

/// Manifest file name inside a package directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// The only manifest version this runtime accepts
pub const SUPPORTED_MANIFEST_VERSION: u32 = 2;

/// Permission required to register web-request rules
pub const PERMISSION_WEB_REQUEST: &str = "webRequest";

/// Background context declaration inside a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundDeclaration {
    /// HTML page to load as the hidden context
    #[serde(default)]
    pub page: Option<String>,
    /// Scripts to run in a generated background page
    #[serde(default)]
    pub scripts: Vec<String>,
    /// Whether the context stays alive for the extension's lifetime
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

/// Content script declaration inside a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentScriptDeclaration {
    /// URL match patterns the scripts inject into
    pub matches: Vec<String>,
    /// JavaScript files to inject
    #[serde(default)]
    pub js: Vec<String>,
    /// Stylesheets to inject
    #[serde(default)]
    pub css: Vec<String>,
    /// Injection point (`document_start`, `document_end`, `document_idle`)
    #[serde(default)]
    pub run_at: Option<String>,
}

/// Validated extension manifest.
///
/// Produced once at load; downstream code can rely on required fields being
/// present without re-checking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Extension display name (localized if the package ships locales)
    pub name: String,
    /// Extension version string
    pub version: String,
    /// Manifest schema version
    pub manifest_version: u32,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Locale used when the active locale has no message table
    #[serde(default)]
    pub default_locale: Option<String>,
    /// Declared permissions (`webRequest`, host patterns, ...)
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Hidden background context, if the extension declares one
    #[serde(default)]
    pub background: Option<BackgroundDeclaration>,
    /// Content script declarations
    #[serde(default)]
    pub content_scripts: Vec<ContentScriptDeclaration>,
}

impl Manifest {
    /// Whether the manifest declares a background context
    #[must_use]
    pub fn has_background_page(&self) -> bool {
        self.background
            .as_ref()
            .is_some_and(|b| b.page.is_some() || !b.scripts.is_empty())
    }

    /// Whether the manifest declares the given permission
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// Untyped manifest as read from disk, before validation
#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    manifest_version: Option<u32>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    default_locale: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    background: Option<BackgroundDeclaration>,
    #[serde(default)]
    content_scripts: Vec<ContentScriptDeclaration>,
}

/// In-memory descriptor of an installed extension
#[derive(Debug, Clone)]
pub struct Extension {
    /// Stable id: declared in the manifest or derived from the directory name
    pub id: String,
    /// Validated manifest
    pub manifest: Manifest,
    /// Package root on disk
    pub path: PathBuf,
    /// Whether the extension currently participates in the runtime
    pub enabled: bool,
    /// Loaded locale tables
    pub locales: Locales,
}

impl Extension {
    /// Resolve a message key against this extension's locale tables
    #[must_use]
    pub fn message(&self, locale: &str, key: &str) -> Option<&str> {
        self.locales.message(locale, key)
    }
}

/// A package that failed to load during enumeration
#[derive(Debug)]
pub struct InvalidPackage {
    /// Package directory
    pub path: PathBuf,
    /// Why it was rejected
    pub error: ManifestError,
}

/// Result of enumerating an extensions directory
#[derive(Debug, Default)]
pub struct ExtensionScan {
    /// Successfully loaded descriptors, in load order
    pub loaded: Vec<Extension>,
    /// Rejected packages with their errors
    pub invalid: Vec<InvalidPackage>,
}

/// Load a single extension package from `path`.
///
/// `locale` is the host's active locale, used to resolve `__MSG_*__`
/// placeholders in the manifest's name and description.
pub fn load_extension(path: &Path, locale: &str) -> Result<Extension, ManifestError> {
    let manifest_path = path.join(MANIFEST_FILE);
    if !manifest_path.is_file() {
        return Err(ManifestError::NotFound(path.to_path_buf()));
    }

    let raw_text = fs::read_to_string(&manifest_path)?;
    let raw: RawManifest = serde_json::from_str(&raw_text)?;

    let manifest_version = raw.manifest_version.unwrap_or(SUPPORTED_MANIFEST_VERSION);
    if manifest_version != SUPPORTED_MANIFEST_VERSION {
        return Err(ManifestError::UnsupportedVersion(manifest_version));
    }

    let name = match raw.name {
        Some(n) if !n.trim().is_empty() => n,
        _ => return Err(ManifestError::MissingField("name")),
    };
    let version = match raw.version {
        Some(v) if !v.trim().is_empty() => v,
        _ => return Err(ManifestError::MissingField("version")),
    };

    let id = match raw.id {
        Some(declared) if !declared.trim().is_empty() => declared,
        _ => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ManifestError::InvalidPath(path.to_path_buf()))?,
    };

    let locales = Locales::load(path, raw.default_locale.as_deref());

    let manifest = Manifest {
        name: locales.localize(locale, &name),
        version,
        manifest_version,
        description: raw.description.map(|d| locales.localize(locale, &d)),
        default_locale: raw.default_locale,
        permissions: raw.permissions,
        background: raw.background,
        content_scripts: raw.content_scripts,
    };

    debug!(
        "loaded extension {} v{} from {}",
        id,
        manifest.version,
        path.display()
    );

    Ok(Extension {
        id,
        manifest,
        path: path.to_path_buf(),
        enabled: true,
        locales,
    })
}

/// Enumerate every package under `dir`, sorted by directory name.
///
/// Invalid packages are collected rather than aborting the scan; one broken
/// manifest never prevents other extensions from loading.
pub fn enumerate_extensions(dir: &Path, locale: &str) -> ExtensionScan {
    let mut scan = ExtensionScan::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read extensions directory {}: {}", dir.display(), e);
            return scan;
        }
    };

    let mut package_dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    package_dirs.sort();

    for path in package_dirs {
        match load_extension(&path, locale) {
            Ok(extension) => scan.loaded.push(extension),
            Err(error) => {
                warn!("skipping package {}: {}", path.display(), error);
                scan.invalid.push(InvalidPackage { path, error });
            }
        }
    }

    scan
}
