use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::sync::Notify;

use super::event::ProgressEvent;
use crate::job::JobId;

/// Per-subscriber delivery buffer shared between the hub and the
/// subscription handle.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
    notify: Notify,
}

struct SlotState {
    events: VecDeque<ProgressEvent>,
    capacity: usize,
    lagged: u64,
    closed: bool,
}

impl Slot {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                events: VecDeque::with_capacity(capacity.min(64)),
                capacity: capacity.max(1),
                lagged: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("Subscription buffer lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Buffers an event without waiting. Returns false if the subscriber
    /// is gone.
    pub(crate) fn push(&self, event: ProgressEvent) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            if !event.is_terminal() && state.events.len() >= state.capacity {
                // Only the oldest intermediate event is dropped; a terminal
                // event is always last, so the front is never terminal here.
                if let Some(pos) = state.events.iter().position(|e| !e.is_terminal()) {
                    state.events.remove(pos);
                    state.lagged += 1;
                }
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn pop(&self) -> Option<ProgressEvent> {
        self.lock().events.pop_front()
    }

    fn lagged(&self) -> u64 {
        self.lock().lagged
    }
}

/// Live observer of one job's events.
///
/// Yields buffered events in order and ends after the terminal event.
/// Dropping the handle unsubscribes.
pub struct Subscription {
    job_id: JobId,
    slot: Arc<Slot>,
    created_at: DateTime<Utc>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(job_id: JobId, slot: Arc<Slot>) -> Self {
        Self {
            job_id,
            slot,
            created_at: Utc::now(),
            finished: false,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Number of intermediate events dropped because this subscriber fell
    /// behind.
    pub fn lagged(&self) -> u64 {
        self.slot.lagged()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits for the next event. Returns `None` once the terminal event has
    /// been delivered.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.try_next() {
                return Some(event);
            }
            if self.finished {
                return None;
            }
            self.slot.notify.notified().await;
        }
    }

    /// Returns a buffered event without waiting.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        let event = self.slot.pop()?;
        if event.is_terminal() {
            self.finished = true;
            self.slot.close();
        }
        Some(event)
    }

    /// Adapts the subscription into a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("job_id", &self.job_id)
            .field("created_at", &self.created_at)
            .field("finished", &self.finished)
            .finish()
    }
}
