//! Runtime orchestrator.
//!
//! [`ExtensionRuntime`] wires the registry, background pages, alarms,
//! storage, request interception, and the `extension://` registrar into one
//! facade the host shell talks to. It also owns the one ordering problem the
//! individual components deliberately avoid: teardown. Unloading an extension
//! cascades in a fixed order (alarms, background page, request rules,
//! storage, registry entry) so that no component ever fires into an id that
//! another component has already forgotten.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::alarms::{AlarmInfo, AlarmScheduler};
use crate::background::{BackgroundHandler, BackgroundMessage, BackgroundPageManager, LoggingHandler, PageState};
use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::manifest::{self, Extension, InvalidPackage};
use crate::protocol::ProtocolRegistrar;
use crate::registry::ExtensionRegistry;
use crate::storage::{StorageBinding, StorageHandle};
use crate::webrequest::{InterceptOutcome, RequestDetails, RequestRule, WebRequestInterceptor};

/// Locale used when the host does not specify one
pub const DEFAULT_LOCALE: &str = "en-US";

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory whose subdirectories are extension packages
    pub extensions_dir: PathBuf,
    /// Storage database location; `None` keeps storage in memory
    pub storage_path: Option<PathBuf>,
    /// Active locale for manifest localization
    pub locale: String,
    /// Event bus buffer capacity
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            extensions_dir: PathBuf::from("extensions"),
            storage_path: None,
            locale: DEFAULT_LOCALE.to_string(),
            event_capacity: 256,
        }
    }
}

impl RuntimeConfig {
    /// Set the extensions directory
    #[must_use]
    pub fn with_extensions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extensions_dir = dir.into();
        self
    }

    /// Persist extension storage at the given database path
    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Set the active locale
    #[must_use]
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Set the event bus buffer capacity
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Outcome of scanning the extensions directory
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Ids registered by this scan, in load order
    pub loaded: Vec<String>,
    /// Packages rejected during the scan
    pub invalid: Vec<InvalidPackage>,
}

/// The extension runtime facade
pub struct ExtensionRuntime {
    config: RuntimeConfig,
    registry: ExtensionRegistry,
    events: EventBus,
    background: Arc<BackgroundPageManager>,
    alarms: AlarmScheduler,
    interceptor: WebRequestInterceptor,
    storage: StorageBinding,
    protocol: ProtocolRegistrar,
    shutdown: CancellationToken,
}

impl ExtensionRuntime {
    /// Build a runtime with the default (logging) background handler
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_handler(config, Arc::new(LoggingHandler)).await
    }

    /// Build a runtime with a host-supplied background handler.
    ///
    /// Creates the extensions directory if missing, opens storage, installs
    /// the `extension://` scheme handler, and spawns the alarm scheduler.
    pub async fn with_handler(
        config: RuntimeConfig,
        handler: Arc<dyn BackgroundHandler>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.extensions_dir)?;

        let events = EventBus::new(config.event_capacity);
        let registry = ExtensionRegistry::new();

        let storage = match &config.storage_path {
            Some(path) => StorageBinding::from_path(path).await?,
            None => StorageBinding::in_memory().await?,
        };

        let background = Arc::new(BackgroundPageManager::new(
            registry.clone(),
            handler,
            events.clone(),
        ));

        let shutdown = CancellationToken::new();
        let alarms = AlarmScheduler::spawn(background.clone(), events.clone(), shutdown.clone());

        let interceptor = WebRequestInterceptor::new(registry.clone(), events.clone());

        let protocol = ProtocolRegistrar::new(registry.clone());
        protocol.register_protocols();

        info!(
            "extension runtime initialized (extensions dir {})",
            config.extensions_dir.display()
        );

        Ok(Self {
            config,
            registry,
            events,
            background,
            alarms,
            interceptor,
            storage,
            protocol,
            shutdown,
        })
    }

    /// Scan the extensions directory, register every valid package, and start
    /// background pages for extensions that declare one.
    ///
    /// Invalid packages are reported, never registered; one broken manifest
    /// does not prevent the rest from loading.
    #[instrument(skip(self))]
    pub async fn load_extensions(&self) -> Result<LoadReport> {
        let scan = manifest::enumerate_extensions(&self.config.extensions_dir, &self.config.locale);
        let mut report = LoadReport {
            loaded: Vec::new(),
            invalid: scan.invalid,
        };

        for extension in scan.loaded {
            let id = extension.id.clone();
            match self.registry.register(extension).await {
                Ok(registered) => {
                    if registered.manifest.has_background_page() {
                        if let Err(e) = self.background.start(&id).await {
                            warn!("failed to start background page for {}: {}", id, e);
                        }
                    }
                    report.loaded.push(id);
                }
                Err(e) => warn!("skipping {}: {}", id, e),
            }
        }

        self.interceptor.rebuild().await;
        self.events.publish(RuntimeEvent::ExtensionListChanged {
            count: self.registry.count().await,
        });
        info!(
            "loaded {} extensions ({} invalid packages skipped)",
            report.loaded.len(),
            report.invalid.len()
        );
        Ok(report)
    }

    /// Load and register a single package directory
    pub async fn load_extension(&self, path: &Path) -> Result<Arc<Extension>> {
        let extension = manifest::load_extension(path, &self.config.locale)?;
        let id = extension.id.clone();
        let registered = self.registry.register(extension).await?;

        if registered.manifest.has_background_page() {
            self.background.start(&id).await?;
        }
        self.interceptor.rebuild().await;
        self.events.publish(RuntimeEvent::ExtensionListChanged {
            count: self.registry.count().await,
        });
        Ok(registered)
    }

    /// Unload an extension, cascading teardown across every component.
    ///
    /// Order matters: alarms stop producing fires before the page they would
    /// deliver into is torn down (`cancel_all` acks only after the scheduler
    /// has processed the cancellation, so a pending fire cannot recreate the
    /// page behind `stop`), rules leave the request path before storage
    /// disappears, and the registry entry goes last so components looking up
    /// the id mid-teardown still resolve it.
    #[instrument(skip(self))]
    pub async fn unload_extension(&self, extension_id: &str) -> Result<()> {
        if !self.registry.contains(extension_id).await {
            return Err(Error::ExtensionGone(extension_id.to_string()));
        }

        self.alarms.cancel_all(extension_id).await?;
        self.background.stop(extension_id).await?;
        self.interceptor.clear_rules(extension_id).await;
        self.storage.purge(extension_id).await?;
        self.registry.remove(extension_id).await;

        self.interceptor.rebuild().await;
        self.events.publish(RuntimeEvent::ExtensionListChanged {
            count: self.registry.count().await,
        });
        info!("unloaded extension {}", extension_id);
        Ok(())
    }

    /// Enable or disable an extension without unloading it.
    ///
    /// Disabling cancels its alarms and stops its background page but keeps
    /// registry entry and storage intact; enabling restarts the page.
    pub async fn set_extension_enabled(&self, extension_id: &str, enabled: bool) -> Result<()> {
        let updated = self.registry.set_enabled(extension_id, enabled).await?;

        if enabled {
            if updated.manifest.has_background_page() {
                self.background.start(extension_id).await?;
            }
        } else {
            self.alarms.cancel_all(extension_id).await?;
            self.background.stop(extension_id).await?;
        }

        self.interceptor.rebuild().await;
        self.events.publish(RuntimeEvent::ExtensionListChanged {
            count: self.registry.count().await,
        });
        Ok(())
    }

    /// All registered extensions in load order
    pub async fn list_extensions(&self) -> Vec<Arc<Extension>> {
        self.registry.list_all().await
    }

    /// Look up one extension
    pub async fn get_extension(&self, extension_id: &str) -> Option<Arc<Extension>> {
        self.registry.get(extension_id).await
    }

    /// Post a host message into an extension's background page
    pub async fn post_message(
        &self,
        extension_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if !self.registry.contains(extension_id).await {
            return Err(Error::ExtensionGone(extension_id.to_string()));
        }
        self.background
            .post_message(extension_id, BackgroundMessage::Runtime { payload })
            .await
    }

    /// Lifecycle state of an extension's background page
    pub async fn background_state(&self, extension_id: &str) -> PageState {
        self.background.state(extension_id).await
    }

    /// Create or replace a named alarm for an extension
    pub async fn schedule_alarm(
        &self,
        extension_id: &str,
        name: &str,
        delay: std::time::Duration,
        period: Option<std::time::Duration>,
    ) -> Result<()> {
        if !self.registry.contains(extension_id).await {
            return Err(Error::ExtensionGone(extension_id.to_string()));
        }
        self.alarms.schedule(extension_id, name, delay, period)
    }

    /// Cancel one named alarm
    pub fn cancel_alarm(&self, extension_id: &str, name: &str) -> Result<()> {
        self.alarms.cancel(extension_id, name)
    }

    /// Pending alarms for one extension
    pub async fn list_alarms(&self, extension_id: &str) -> Result<Vec<AlarmInfo>> {
        self.alarms.list(extension_id).await
    }

    /// Register (replace) an extension's web-request rules
    pub async fn set_request_rules(
        &self,
        extension_id: &str,
        rules: Vec<RequestRule>,
    ) -> Result<()> {
        self.interceptor.set_rules(extension_id, rules).await
    }

    /// Evaluate one outbound request against every enabled extension's rules
    pub fn intercept(&self, request: &RequestDetails) -> InterceptOutcome {
        self.interceptor.evaluate(request)
    }

    /// Open the storage namespace for a registered extension
    pub async fn storage(&self, extension_id: &str) -> Result<StorageHandle> {
        if !self.registry.contains(extension_id).await {
            return Err(Error::ExtensionGone(extension_id.to_string()));
        }
        Ok(self.storage.open(extension_id).await)
    }

    /// Resolve an `extension://` URL to a file path
    pub async fn resolve_resource(&self, url: &str) -> Result<PathBuf> {
        self.protocol.resolve(url).await
    }

    /// Resolve and read an `extension://` resource
    pub async fn load_resource(&self, url: &str) -> Result<Vec<u8>> {
        self.protocol.load(url).await
    }

    /// Subscribe to runtime events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Shut the runtime down: stop the scheduler, tear down every background
    /// page, and close storage. Further scheduler commands fail with
    /// [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("extension runtime shutting down");
        self.shutdown.cancel();
        self.background.stop_all().await;
        self.storage.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    fn write_package(root: &Path, dir_name: &str, manifest: &str) {
        let path = root.join(dir_name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("manifest.json"), manifest).unwrap();
    }

    async fn runtime_with_packages(packages: &[(&str, &str)]) -> (ExtensionRuntime, TempDir) {
        let dir = TempDir::new().unwrap();
        for (name, manifest) in packages {
            write_package(dir.path(), name, manifest);
        }
        let config = RuntimeConfig::default().with_extensions_dir(dir.path());
        let runtime = ExtensionRuntime::new(config).await.unwrap();
        (runtime, dir)
    }

    const BLOCKER: &str = r#"{
        "name": "Blocker",
        "version": "1.0",
        "permissions": ["webRequest"],
        "background": {"page": "background.html"}
    }"#;

    const PLAIN: &str = r#"{"name": "Plain", "version": "1.0"}"#;

    #[tokio::test]
    async fn scan_registers_valid_and_skips_invalid() {
        let (runtime, _dir) =
            runtime_with_packages(&[("blocker", BLOCKER), ("plain", PLAIN), ("broken", "{nope")])
                .await;

        let report = runtime.load_extensions().await.unwrap();
        assert_eq!(report.loaded, vec!["blocker", "plain"]);
        assert_eq!(report.invalid.len(), 1);
        assert_eq!(runtime.list_extensions().await.len(), 2);
    }

    #[tokio::test]
    async fn background_page_starts_on_load() {
        let (runtime, _dir) = runtime_with_packages(&[("blocker", BLOCKER)]).await;
        runtime.load_extensions().await.unwrap();

        for _ in 0..100 {
            if runtime.background_state("blocker").await == PageState::Running {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("background page never reached running");
    }

    #[tokio::test]
    async fn unload_cascades_across_components() {
        let (runtime, _dir) = runtime_with_packages(&[("blocker", BLOCKER)]).await;
        runtime.load_extensions().await.unwrap();

        runtime
            .schedule_alarm("blocker", "tick", Duration::from_secs(60), None)
            .await
            .unwrap();
        let store = runtime.storage("blocker").await.unwrap();
        store.set("k", &json!(1)).await.unwrap();
        runtime
            .set_request_rules(
                "blocker",
                vec![RequestRule {
                    pattern: "<all_urls>".to_string(),
                    action: crate::webrequest::RuleAction::Block,
                    priority: 0,
                }],
            )
            .await
            .unwrap();

        runtime.unload_extension("blocker").await.unwrap();

        assert!(runtime.get_extension("blocker").await.is_none());
        assert_eq!(
            runtime.background_state("blocker").await,
            PageState::Stopped
        );
        assert!(runtime.list_alarms("blocker").await.unwrap().is_empty());
        assert!(matches!(
            store.get("k").await.unwrap_err(),
            Error::ExtensionGone(_)
        ));
        let request = RequestDetails::new("https://example.com/", "GET").unwrap();
        assert_eq!(
            runtime.intercept(&request).decision,
            crate::webrequest::Decision::Allow
        );

        // Unloading again reports the id as gone.
        assert!(matches!(
            runtime.unload_extension("blocker").await.unwrap_err(),
            Error::ExtensionGone(_)
        ));
    }

    #[tokio::test]
    async fn unload_with_pending_alarm_never_resurrects_page() {
        let (runtime, _dir) = runtime_with_packages(&[("blocker", BLOCKER)]).await;
        runtime.load_extensions().await.unwrap();

        // A rapidly repeating alarm keeps fires in flight while we tear down.
        runtime
            .schedule_alarm(
                "blocker",
                "tick",
                Duration::from_millis(10),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(25)).await;

        runtime.unload_extension("blocker").await.unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(runtime.get_extension("blocker").await.is_none());
        assert_eq!(
            runtime.background_state("blocker").await,
            PageState::Stopped
        );
    }

    #[tokio::test]
    async fn disabled_extension_drops_out_of_request_path() {
        let (runtime, _dir) = runtime_with_packages(&[("blocker", BLOCKER)]).await;
        runtime.load_extensions().await.unwrap();
        runtime
            .set_request_rules(
                "blocker",
                vec![RequestRule {
                    pattern: "<all_urls>".to_string(),
                    action: crate::webrequest::RuleAction::Block,
                    priority: 0,
                }],
            )
            .await
            .unwrap();

        let request = RequestDetails::new("https://example.com/", "GET").unwrap();
        assert!(matches!(
            runtime.intercept(&request).decision,
            crate::webrequest::Decision::Block { .. }
        ));

        runtime
            .set_extension_enabled("blocker", false)
            .await
            .unwrap();
        assert_eq!(
            runtime.intercept(&request).decision,
            crate::webrequest::Decision::Allow
        );

        // Re-enabling restores the rules without re-registering them.
        runtime.set_extension_enabled("blocker", true).await.unwrap();
        assert!(matches!(
            runtime.intercept(&request).decision,
            crate::webrequest::Decision::Block { .. }
        ));
    }

    #[tokio::test]
    async fn alarm_on_unknown_extension_fails() {
        let (runtime, _dir) = runtime_with_packages(&[]).await;
        let err = runtime
            .schedule_alarm("ghost", "tick", Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExtensionGone(_)));
    }

    #[tokio::test]
    async fn storage_requires_registration() {
        let (runtime, _dir) = runtime_with_packages(&[("plain", PLAIN)]).await;
        runtime.load_extensions().await.unwrap();

        assert!(runtime.storage("plain").await.is_ok());
        assert!(matches!(
            runtime.storage("ghost").await.unwrap_err(),
            Error::ExtensionGone(_)
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_later_scheduler_commands() {
        let (runtime, _dir) = runtime_with_packages(&[("plain", PLAIN)]).await;
        runtime.load_extensions().await.unwrap();
        runtime.shutdown().await;

        // Actor drains; commands eventually fail with ShuttingDown.
        for _ in 0..100 {
            if runtime.cancel_alarm("plain", "x").is_err() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler still accepting commands after shutdown");
    }
}
