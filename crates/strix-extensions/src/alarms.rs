//! Per-extension named timers.
//!
//! The scheduler is a single actor owning an ordered schedule (min-heap keyed
//! by next fire time) and a command channel. Being the only producer of fire
//! events gives two guarantees for free: fires for one `(extension, name)`
//! alarm are never delivered concurrently, and queued fires arrive strictly
//! in scheduled order.
//!
//! Repeating alarms reschedule from the *scheduled* time (`base + n * period`),
//! not the fire time, so delivery jitter never accumulates into drift. A due
//! alarm whose background page is not running starts the page first; the
//! fire message queues in the page's mailbox until the page is running, so a
//! fire is never silently dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::background::{BackgroundMessage, BackgroundPageManager};
use crate::error::{Error, Result};
use crate::events::{EventBus, RuntimeEvent};

type AlarmKey = (String, String);

/// Snapshot of one scheduled alarm, for UI surfaces
#[derive(Debug, Clone)]
pub struct AlarmInfo {
    /// Owning extension
    pub extension_id: String,
    /// Alarm name, unique per extension
    pub name: String,
    /// Repeat period, if any
    pub period: Option<Duration>,
    /// Time until the next fire
    pub remaining: Duration,
}

enum Command {
    Schedule {
        extension_id: String,
        name: String,
        delay: Duration,
        period: Option<Duration>,
    },
    Cancel {
        extension_id: String,
        name: String,
    },
    CancelAll {
        extension_id: String,
        ack: oneshot::Sender<()>,
    },
    List {
        extension_id: String,
        reply: oneshot::Sender<Vec<AlarmInfo>>,
    },
}

struct AlarmEntry {
    next_fire: Instant,
    period: Option<Duration>,
    generation: u64,
}

struct HeapSlot {
    due: Instant,
    generation: u64,
    key: AlarmKey,
}

// Min-heap on due time via BinaryHeap<Reverse<_>>; generation breaks ties
// deterministically.
impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.generation == other.generation
    }
}

impl Eq for HeapSlot {}

/// Handle to the scheduler actor
#[derive(Clone)]
pub struct AlarmScheduler {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl AlarmScheduler {
    /// Spawn the scheduler actor.
    ///
    /// Fire events deliver through `background` and publish on `events`;
    /// `shutdown` stops the actor (pending alarms are dropped — alarms are
    /// rebuilt from manifests at each startup, never persisted).
    pub fn spawn(
        background: Arc<BackgroundPageManager>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = SchedulerActor {
            background,
            events,
            alarms: HashMap::new(),
            heap: BinaryHeap::new(),
            next_generation: 0,
        };
        tokio::spawn(actor.run(cmd_rx, shutdown));
        Self { cmd_tx }
    }

    /// Create or replace the alarm `(extension_id, name)`.
    ///
    /// Replacement supersedes any pending fire of the previous schedule. A
    /// zero repeat period is rejected.
    pub fn schedule(
        &self,
        extension_id: &str,
        name: &str,
        delay: Duration,
        period: Option<Duration>,
    ) -> Result<()> {
        if period == Some(Duration::ZERO) {
            return Err(Error::InvalidAlarm {
                name: name.to_string(),
                message: "repeat period must be greater than zero".to_string(),
            });
        }
        self.send(Command::Schedule {
            extension_id: extension_id.to_string(),
            name: name.to_string(),
            delay,
            period,
        })
    }

    /// Cancel one alarm; unknown names are a no-op
    pub fn cancel(&self, extension_id: &str, name: &str) -> Result<()> {
        self.send(Command::Cancel {
            extension_id: extension_id.to_string(),
            name: name.to_string(),
        })
    }

    /// Cancel every alarm owned by `extension_id` (extension teardown path).
    ///
    /// Waits until the actor has processed the cancellation: once this
    /// returns, no further fire for that extension will be delivered, so
    /// callers can safely tear down the background page next.
    pub async fn cancel_all(&self, extension_id: &str) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::CancelAll {
            extension_id: extension_id.to_string(),
            ack,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// List pending alarms for one extension
    pub async fn list(&self, extension_id: &str) -> Result<Vec<AlarmInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List {
            extension_id: extension_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).map_err(|_| Error::ShuttingDown)
    }
}

struct SchedulerActor {
    background: Arc<BackgroundPageManager>,
    events: EventBus,
    alarms: HashMap<AlarmKey, AlarmEntry>,
    heap: BinaryHeap<std::cmp::Reverse<HeapSlot>>,
    next_generation: u64,
}

impl SchedulerActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        info!("alarm scheduler started");
        loop {
            let next_due = self.heap.peek().map(|slot| slot.0.due);

            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.fire_due().await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("alarm scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Schedule {
                extension_id,
                name,
                delay,
                period,
            } => {
                self.next_generation += 1;
                let generation = self.next_generation;
                let next_fire = Instant::now() + delay;
                let key = (extension_id.clone(), name.clone());

                let replaced = self
                    .alarms
                    .insert(
                        key.clone(),
                        AlarmEntry {
                            next_fire,
                            period,
                            generation,
                        },
                    )
                    .is_some();
                self.heap.push(std::cmp::Reverse(HeapSlot {
                    due: next_fire,
                    generation,
                    key,
                }));
                debug!(
                    "alarm {}/{} scheduled (delay {:?}, period {:?}, replaced {})",
                    extension_id, name, delay, period, replaced
                );
            }
            Command::Cancel { extension_id, name } => {
                if self.alarms.remove(&(extension_id.clone(), name.clone())).is_some() {
                    debug!("alarm {}/{} cancelled", extension_id, name);
                }
            }
            Command::CancelAll { extension_id, ack } => {
                let before = self.alarms.len();
                self.alarms.retain(|(owner, _), _| owner != &extension_id);
                let removed = before - self.alarms.len();
                if removed > 0 {
                    debug!("cancelled {} alarms for {}", removed, extension_id);
                }
                let _ = ack.send(());
            }
            Command::List {
                extension_id,
                reply,
            } => {
                let now = Instant::now();
                let mut infos: Vec<AlarmInfo> = self
                    .alarms
                    .iter()
                    .filter(|((owner, _), _)| owner == &extension_id)
                    .map(|((owner, name), entry)| AlarmInfo {
                        extension_id: owner.clone(),
                        name: name.clone(),
                        period: entry.period,
                        remaining: entry.next_fire.saturating_duration_since(now),
                    })
                    .collect();
                infos.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(infos);
            }
        }
    }

    /// Pop and deliver every due slot. Stale slots (cancelled or superseded
    /// by a replacement, detected via generation mismatch) are discarded.
    async fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(std::cmp::Reverse(slot)) = self.heap.peek() {
            if slot.due > now {
                break;
            }
            let std::cmp::Reverse(slot) = self.heap.pop().expect("peeked slot");

            let Some(entry) = self.alarms.get_mut(&slot.key) else {
                continue;
            };
            if entry.generation != slot.generation {
                continue;
            }

            match entry.period {
                Some(period) => {
                    // Reschedule from the scheduled time, not the fire time.
                    let next_fire = slot.due + period;
                    entry.next_fire = next_fire;
                    self.heap.push(std::cmp::Reverse(HeapSlot {
                        due: next_fire,
                        generation: slot.generation,
                        key: slot.key.clone(),
                    }));
                }
                None => {
                    self.alarms.remove(&slot.key);
                }
            }

            self.deliver(&slot.key.0, &slot.key.1).await;
        }
    }

    async fn deliver(&self, extension_id: &str, name: &str) {
        // Bring the page up if needed; the fire queues in the mailbox until
        // the page is running.
        match self.background.start(extension_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "alarm {}/{} fired but no background context is available",
                    extension_id, name
                );
                return;
            }
            Err(e) => {
                warn!("alarm {}/{} fire failed to start page: {}", extension_id, name, e);
                return;
            }
        }

        if let Err(e) = self
            .background
            .post_message(
                extension_id,
                BackgroundMessage::AlarmFired {
                    name: name.to_string(),
                },
            )
            .await
        {
            warn!("alarm {}/{} delivery failed: {}", extension_id, name, e);
            return;
        }

        debug!("alarm {}/{} fired", extension_id, name);
        self.events.publish(RuntimeEvent::AlarmFired {
            extension_id: extension_id.to_string(),
            name: name.to_string(),
        });
    }
}
