//! Strix Extensions - WebExtensions-style runtime
//!
//! This crate provides the extension runtime for the Strix browser shell,
//! including:
//! - Manifest: Package loading and manifest validation
//! - Locales: `__MSG_*__` message resolution with fallback chains
//! - Registry: The authoritative table of loaded extensions
//! - Background: Hidden execution context lifecycle per extension
//! - Alarms: Named timers with drift-free repeat scheduling
//! - Storage: Per-extension persistent key/value namespaces
//! - Web request: Rule-based interception of outbound requests
//! - Protocol: `extension://` resource resolution and serving

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alarms;
pub mod background;
pub mod error;
pub mod events;
pub mod locales;
pub mod manifest;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod webrequest;

pub use alarms::{AlarmInfo, AlarmScheduler};
pub use background::{
    BackgroundHandler, BackgroundMessage, BackgroundPageManager, LoggingHandler, PageState,
};
pub use error::{Error, ManifestError, Result};
pub use events::{EventBus, RuntimeEvent};
pub use locales::Locales;
pub use manifest::{
    enumerate_extensions, load_extension, Extension, ExtensionScan, InvalidPackage, Manifest,
};
pub use protocol::{ProtocolRegistrar, EXTENSION_SCHEME};
pub use registry::ExtensionRegistry;
pub use runtime::{ExtensionRuntime, LoadReport, RuntimeConfig, DEFAULT_LOCALE};
pub use storage::{StorageBinding, StorageHandle};
pub use webrequest::{
    Decision, HeaderInstruction, InterceptOutcome, MatchPattern, RequestDetails, RequestRule,
    RuleAction, WebRequestInterceptor, ALL_URLS,
};

use std::path::PathBuf;

/// Default application data directory (`~/.local/share/strix` or platform
/// equivalent), falling back to the current directory when the platform
/// reports no data dir.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("strix"))
        .unwrap_or_else(|| PathBuf::from(".strix"))
}
