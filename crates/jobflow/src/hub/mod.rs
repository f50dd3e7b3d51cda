//! Progress hub: per-job fan-out of job store transitions.
//!
//! Each subscriber owns a bounded buffer. Publishing never blocks: when a
//! buffer is full the oldest intermediate event is dropped, terminal events
//! are always kept. A process-wide broadcast channel mirrors every event
//! for observers that want all jobs at once.

mod event;
mod sink;
mod subscription;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

pub use event::{EventKind, ProgressEvent};
pub use sink::{forward, ChannelSink, EventSink, SinkError};
pub use subscription::Subscription;

use crate::job::JobId;
use subscription::Slot;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;
pub const DEFAULT_FIREHOSE_CAPACITY: usize = 256;

struct HubInner {
    subscriber_buffer: usize,
    subscribers: Mutex<HashMap<JobId, Vec<Arc<Slot>>>>,
    firehose: broadcast::Sender<ProgressEvent>,
}

/// Fan-out notifier. Cloning is cheap and clones share subscribers.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new(subscriber_buffer: usize, firehose_capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(firehose_capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                subscriber_buffer: subscriber_buffer.max(1),
                subscribers: Mutex::new(HashMap::new()),
                firehose,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Vec<Arc<Slot>>>> {
        match self.inner.subscribers.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Progress hub lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Registers a subscriber seeded with `snapshot`.
    ///
    /// The caller must hold whatever lock orders `snapshot` before any later
    /// publish for the same job; the job store does this.
    pub fn subscribe(&self, snapshot: ProgressEvent) -> Subscription {
        let job_id = snapshot.job_id.clone();
        let slot = Arc::new(Slot::new(self.inner.subscriber_buffer));
        let terminal = snapshot.is_terminal();
        slot.push(snapshot);

        if !terminal {
            self.lock()
                .entry(job_id.clone())
                .or_default()
                .push(Arc::clone(&slot));
        }

        Subscription::new(job_id, slot)
    }

    /// Subscribes to every job's events. Slow receivers observe `Lagged`.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.firehose.subscribe()
    }

    /// Delivers `event` to the job's subscribers without waiting.
    pub fn publish(&self, event: ProgressEvent) {
        let terminal = event.is_terminal();
        {
            let mut subscribers = self.lock();
            if let Some(slots) = subscribers.get_mut(&event.job_id) {
                slots.retain(|slot| slot.push(event.clone()));
                if terminal || slots.is_empty() {
                    subscribers.remove(&event.job_id);
                }
            }
        }
        // Ignore send errors (no active receivers)
        let _ = self.inner.firehose.send(event);
    }

    /// Number of live subscribers for `job_id`.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.lock()
            .get(job_id)
            .map(|slots| slots.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_FIREHOSE_CAPACITY)
    }
}
