//! Background page lifecycle management.
//!
//! Each extension that declares a background page gets one hidden execution
//! context: a spawned task draining a mailbox. The control flow communicates
//! with the context strictly by message passing; there is no shared mutable
//! state across that boundary.
//!
//! State machine per page:
//!
//! ```text
//! Uninitialized -> Starting -> Running -> Stopping -> Stopped
//! ```
//!
//! Messages posted while `Starting` are queued in order and flushed when the
//! page enters `Running`. Posts after `Stopping` fail with
//! [`Error::NoBackgroundPage`]. `stop` always runs to completion once
//! started.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};
use crate::registry::ExtensionRegistry;

/// Lifecycle state of one background page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// No context has ever been created
    Uninitialized,
    /// Context is being brought up; inbound messages queue
    Starting,
    /// Context is live and draining its mailbox
    Running,
    /// Teardown in progress; runs to completion
    Stopping,
    /// Context torn down; a new `start` creates a fresh one
    Stopped,
}

impl std::fmt::Display for PageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Message delivered into a background page's mailbox
#[derive(Debug, Clone)]
pub enum BackgroundMessage {
    /// A named alarm owned by this extension fired
    AlarmFired {
        /// Alarm name
        name: String,
    },
    /// Arbitrary message from a UI surface or the host
    Runtime {
        /// Message payload
        payload: serde_json::Value,
    },
}

/// Behavior executed inside a background context.
///
/// The runtime does not interpret extension code; hosts plug real behavior in
/// through this seam (and tests plug in recorders). Handler failures are
/// isolated per extension.
#[async_trait]
pub trait BackgroundHandler: Send + Sync {
    /// Called once when the context comes up, before any message delivery
    async fn on_start(&self, _extension_id: &str) {}

    /// Called for every message drained from the mailbox, in post order
    async fn on_message(&self, _extension_id: &str, _message: BackgroundMessage) {}

    /// Called once during teardown, after the mailbox stops draining
    async fn on_stop(&self, _extension_id: &str) {}
}

/// Default handler that just logs deliveries
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl BackgroundHandler for LoggingHandler {
    async fn on_message(&self, extension_id: &str, message: BackgroundMessage) {
        debug!("background page {} received {:?}", extension_id, message);
    }
}

struct PageEntry {
    state: PageState,
    tx: mpsc::UnboundedSender<BackgroundMessage>,
    pending: Vec<BackgroundMessage>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Creates and owns hidden execution contexts for extensions that declare a
/// background page
pub struct BackgroundPageManager {
    registry: ExtensionRegistry,
    handler: Arc<dyn BackgroundHandler>,
    events: EventBus,
    pages: Arc<RwLock<HashMap<String, PageEntry>>>,
}

impl BackgroundPageManager {
    /// Create a manager over the given registry, handler seam, and event bus
    pub fn new(
        registry: ExtensionRegistry,
        handler: Arc<dyn BackgroundHandler>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            handler,
            events,
            pages: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start the background context for `extension_id`.
    ///
    /// Returns `Ok(true)` if a context is starting or already running,
    /// `Ok(false)` if the extension is disabled or declares no background
    /// page. Idempotent while `Starting`/`Running`. A page in `Stopping`
    /// cannot be restarted until its teardown completes.
    pub async fn start(&self, extension_id: &str) -> Result<bool> {
        let extension = self
            .registry
            .get(extension_id)
            .await
            .ok_or_else(|| Error::ExtensionGone(extension_id.to_string()))?;

        if !extension.enabled || !extension.manifest.has_background_page() {
            return Ok(false);
        }

        let mut pages = self.pages.write().await;
        if let Some(entry) = pages.get(extension_id) {
            match entry.state {
                PageState::Starting | PageState::Running => return Ok(true),
                PageState::Stopping => {
                    return Err(Error::NoBackgroundPage(extension_id.to_string()))
                }
                PageState::Uninitialized | PageState::Stopped => {}
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(page_loop(
            extension_id.to_string(),
            self.handler.clone(),
            rx,
            ready_tx,
            cancel.clone(),
        ));

        pages.insert(
            extension_id.to_string(),
            PageEntry {
                state: PageState::Starting,
                tx,
                pending: Vec::new(),
                cancel,
                task: Some(task),
            },
        );
        drop(pages);

        // Promote Starting -> Running once the context signals readiness,
        // flushing any messages queued in the meantime.
        let pages = self.pages.clone();
        let events = self.events.clone();
        let id = extension_id.to_string();
        tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            let mut pages = pages.write().await;
            if let Some(entry) = pages.get_mut(&id) {
                if entry.state == PageState::Starting {
                    for message in entry.pending.drain(..) {
                        let _ = entry.tx.send(message);
                    }
                    entry.state = PageState::Running;
                    info!("background page running for {}", id);
                    events.publish(RuntimeEvent::BackgroundPageStarted { extension_id: id });
                }
            }
        });

        debug!("background page starting for {}", extension_id);
        Ok(true)
    }

    /// Deliver a message into the page's mailbox.
    ///
    /// Queues while `Starting`; fails with [`Error::NoBackgroundPage`] when
    /// no context exists or teardown has begun.
    pub async fn post_message(&self, extension_id: &str, message: BackgroundMessage) -> Result<()> {
        let mut pages = self.pages.write().await;
        let entry = pages
            .get_mut(extension_id)
            .ok_or_else(|| Error::NoBackgroundPage(extension_id.to_string()))?;

        match entry.state {
            PageState::Starting => {
                entry.pending.push(message);
                Ok(())
            }
            PageState::Running => entry
                .tx
                .send(message)
                .map_err(|_| Error::NoBackgroundPage(extension_id.to_string())),
            PageState::Uninitialized | PageState::Stopping | PageState::Stopped => {
                Err(Error::NoBackgroundPage(extension_id.to_string()))
            }
        }
    }

    /// Tear down the page's context. Idempotent; once teardown begins it
    /// always runs to completion.
    pub async fn stop(&self, extension_id: &str) -> Result<()> {
        let task = {
            let mut pages = self.pages.write().await;
            let Some(entry) = pages.get_mut(extension_id) else {
                return Ok(());
            };
            match entry.state {
                PageState::Stopping | PageState::Stopped | PageState::Uninitialized => {
                    return Ok(());
                }
                PageState::Starting | PageState::Running => {}
            }
            entry.state = PageState::Stopping;
            entry.pending.clear();
            entry.cancel.cancel();
            entry.task.take()
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("background page task for {} aborted: {}", extension_id, e);
            }
        }

        let mut pages = self.pages.write().await;
        if let Some(entry) = pages.get_mut(extension_id) {
            entry.state = PageState::Stopped;
        }
        drop(pages);

        info!("background page stopped for {}", extension_id);
        self.events.publish(RuntimeEvent::BackgroundPageStopped {
            extension_id: extension_id.to_string(),
        });
        Ok(())
    }

    /// Stop every page; used during runtime shutdown
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.pages.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("failed to stop background page {}: {}", id, e);
            }
        }
    }

    /// Current lifecycle state for an extension's page
    pub async fn state(&self, extension_id: &str) -> PageState {
        self.pages
            .read()
            .await
            .get(extension_id)
            .map_or(PageState::Uninitialized, |entry| entry.state)
    }

    /// Whether a context is live (starting or running)
    pub async fn is_active(&self, extension_id: &str) -> bool {
        matches!(
            self.state(extension_id).await,
            PageState::Starting | PageState::Running
        )
    }
}

async fn page_loop(
    extension_id: String,
    handler: Arc<dyn BackgroundHandler>,
    mut rx: mpsc::UnboundedReceiver<BackgroundMessage>,
    ready_tx: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    handler.on_start(&extension_id).await;
    let _ = ready_tx.send(());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => handler.on_message(&extension_id, message).await,
                None => break,
            },
        }
    }

    handler.on_stop(&extension_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locales::Locales;
    use crate::manifest::{BackgroundDeclaration, Extension, Manifest};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BackgroundHandler for Recorder {
        async fn on_start(&self, extension_id: &str) {
            self.log.lock().unwrap().push(format!("start:{extension_id}"));
        }

        async fn on_message(&self, extension_id: &str, message: BackgroundMessage) {
            let tag = match message {
                BackgroundMessage::AlarmFired { name } => format!("alarm:{name}"),
                BackgroundMessage::Runtime { payload } => format!("msg:{payload}"),
            };
            self.log
                .lock()
                .unwrap()
                .push(format!("{extension_id}:{tag}"));
        }

        async fn on_stop(&self, extension_id: &str) {
            self.log.lock().unwrap().push(format!("stop:{extension_id}"));
        }
    }

    fn extension_with_background(id: &str) -> Extension {
        Extension {
            id: id.to_string(),
            manifest: Manifest {
                name: id.to_string(),
                version: "1.0".to_string(),
                manifest_version: 2,
                description: None,
                default_locale: None,
                permissions: Vec::new(),
                background: Some(BackgroundDeclaration {
                    page: Some("background.html".to_string()),
                    scripts: Vec::new(),
                    persistent: true,
                }),
                content_scripts: Vec::new(),
            },
            path: PathBuf::from(format!("/tmp/{id}")),
            enabled: true,
            locales: Locales::default(),
        }
    }

    async fn setup(id: &str) -> (BackgroundPageManager, Arc<Recorder>) {
        let registry = ExtensionRegistry::new();
        registry
            .register(extension_with_background(id))
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let manager =
            BackgroundPageManager::new(registry, recorder.clone(), EventBus::default());
        (manager, recorder)
    }

    async fn wait_for_running(manager: &BackgroundPageManager, id: &str) {
        for _ in 0..100 {
            if manager.state(id).await == PageState::Running {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("page never reached running state");
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (manager, _) = setup("a").await;
        assert!(manager.start("a").await.unwrap());
        assert!(manager.start("a").await.unwrap());
        wait_for_running(&manager, "a").await;
        assert!(manager.start("a").await.unwrap());
        assert_eq!(manager.state("a").await, PageState::Running);
    }

    #[tokio::test]
    async fn no_background_declaration_starts_nothing() {
        let registry = ExtensionRegistry::new();
        registry
            .register(crate::registry::tests::test_extension("plain"))
            .await
            .unwrap();
        let manager = BackgroundPageManager::new(
            registry,
            Arc::new(LoggingHandler),
            EventBus::default(),
        );
        assert!(!manager.start("plain").await.unwrap());
        assert_eq!(manager.state("plain").await, PageState::Uninitialized);
    }

    #[tokio::test]
    async fn disabled_extension_does_not_start() {
        let registry = ExtensionRegistry::new();
        registry
            .register(extension_with_background("a"))
            .await
            .unwrap();
        registry.set_enabled("a", false).await.unwrap();

        let manager = BackgroundPageManager::new(
            registry,
            Arc::new(LoggingHandler),
            EventBus::default(),
        );
        assert!(!manager.start("a").await.unwrap());
        assert_eq!(manager.state("a").await, PageState::Uninitialized);
    }

    #[tokio::test]
    async fn messages_queued_while_starting_are_flushed_in_order() {
        let (manager, recorder) = setup("a").await;
        manager.start("a").await.unwrap();

        // Post immediately; the page may still be Starting.
        for n in 0..3 {
            manager
                .post_message(
                    "a",
                    BackgroundMessage::Runtime {
                        payload: serde_json::json!(n),
                    },
                )
                .await
                .unwrap();
        }

        wait_for_running(&manager, "a").await;
        sleep(Duration::from_millis(20)).await;

        let entries = recorder.entries();
        assert_eq!(entries[0], "start:a");
        assert_eq!(
            &entries[1..4],
            &["a:msg:0".to_string(), "a:msg:1".to_string(), "a:msg:2".to_string()]
        );
    }

    #[tokio::test]
    async fn post_without_page_fails() {
        let (manager, _) = setup("a").await;
        let err = manager
            .post_message(
                "a",
                BackgroundMessage::Runtime {
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackgroundPage(_)));
    }

    #[tokio::test]
    async fn stop_runs_to_completion_and_rejects_later_posts() {
        let (manager, recorder) = setup("a").await;
        manager.start("a").await.unwrap();
        wait_for_running(&manager, "a").await;

        manager.stop("a").await.unwrap();
        assert_eq!(manager.state("a").await, PageState::Stopped);
        assert!(recorder.entries().contains(&"stop:a".to_string()));

        let err = manager
            .post_message(
                "a",
                BackgroundMessage::Runtime {
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoBackgroundPage(_)));

        // Idempotent stop
        manager.stop("a").await.unwrap();
    }

    #[tokio::test]
    async fn page_can_restart_after_stop() {
        let (manager, recorder) = setup("a").await;
        manager.start("a").await.unwrap();
        wait_for_running(&manager, "a").await;
        manager.stop("a").await.unwrap();

        assert!(manager.start("a").await.unwrap());
        wait_for_running(&manager, "a").await;

        let starts = recorder
            .entries()
            .iter()
            .filter(|e| *e == "start:a")
            .count();
        assert_eq!(starts, 2);
    }
}
