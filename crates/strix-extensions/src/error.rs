//! Error types for the extension runtime.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while loading an extension package from disk.
///
/// A package that fails manifest validation is never registered; there is no
/// partially-loaded state to clean up.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The package directory has no manifest file
    #[error("manifest not found in {0}")]
    NotFound(PathBuf),

    /// Reading the package from disk failed
    #[error("failed to read package: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest is not valid JSON
    #[error("malformed manifest: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A required manifest field is missing or empty
    #[error("missing required manifest field: {0}")]
    MissingField(&'static str),

    /// The declared manifest version is not supported by this runtime
    #[error("unsupported manifest version: {0}")]
    UnsupportedVersion(u32),

    /// The package path does not yield a usable extension id
    #[error("cannot derive extension id from path: {0}")]
    InvalidPath(PathBuf),
}

/// Runtime error type
#[derive(Debug, Error)]
pub enum Error {
    /// Package failed to load or validate
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// An extension with this id is already registered
    #[error("extension already registered: {0}")]
    DuplicateExtension(String),

    /// Message sent to an extension without a running background page
    #[error("no background page for extension: {0}")]
    NoBackgroundPage(String),

    /// Operation references an id no longer in the registry
    #[error("extension no longer registered: {0}")]
    ExtensionGone(String),

    /// Operation requires a permission the manifest does not declare
    #[error("extension {extension_id} lacks the '{permission}' permission")]
    MissingPermission {
        /// Extension id
        extension_id: String,
        /// Required permission name
        permission: String,
    },

    /// A request rule failed to parse or apply.
    ///
    /// During request evaluation this is logged and the offending extension
    /// fails open; it never aborts evaluation for other extensions.
    #[error("rule evaluation failed for {extension_id}: {message}")]
    RuleEvaluation {
        /// Extension whose rule failed
        extension_id: String,
        /// What went wrong
        message: String,
    },

    /// A URL match pattern failed to parse
    #[error("invalid match pattern '{pattern}': {message}")]
    InvalidMatchPattern {
        /// The offending pattern
        pattern: String,
        /// What went wrong
        message: String,
    },

    /// A request URL failed to parse
    #[error("invalid request url '{url}': {message}")]
    InvalidRequestUrl {
        /// The offending URL
        url: String,
        /// What went wrong
        message: String,
    },

    /// Alarm parameters were rejected
    #[error("invalid alarm '{name}': {message}")]
    InvalidAlarm {
        /// Alarm name
        name: String,
        /// What went wrong
        message: String,
    },

    /// Resource path escapes the extension package root
    #[error("resource path rejected: {0}")]
    ProtocolPath(String),

    /// Resource URL does not resolve to an existing file
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Storage read/write failure
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem failure outside package loading
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Value (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The runtime has shut down and no longer accepts commands
    #[error("runtime is shutting down")]
    ShuttingDown,
}
