use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::event::ProgressEvent;
use super::subscription::Subscription;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Live-delivery transport for progress events (websocket, SSE, ...).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &ProgressEvent) -> Result<(), SinkError>;
}

/// Sink backed by a tokio channel.
pub struct ChannelSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: &ProgressEvent) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Pumps `subscription` into `sink` until the terminal event has been
/// delivered or the sink fails. Returns the number of delivered events.
pub async fn forward(mut subscription: Subscription, sink: &dyn EventSink) -> Result<usize, SinkError> {
    let mut delivered = 0;
    while let Some(event) = subscription.next().await {
        if let Err(e) = sink.deliver(&event).await {
            tracing::debug!(
                job_id = %subscription.job_id(),
                "Stopped forwarding progress events: {}",
                e
            );
            return Err(e);
        }
        delivered += 1;
    }
    if subscription.lagged() > 0 {
        tracing::debug!(
            job_id = %subscription.job_id(),
            lagged = subscription.lagged(),
            "Subscriber dropped intermediate events"
        );
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::hub::{EventKind, ProgressHub};
    use crate::job::{Job, ResultRef, Transition};

    #[tokio::test]
    async fn test_forward_delivers_until_terminal() {
        let hub = ProgressHub::default();
        let mut job = Job::new(Fingerprint::new("fp"), serde_json::Value::Null, "test");
        let sub = hub.subscribe(ProgressEvent::snapshot(&job));

        Transition::running().progress(50.0).apply(&mut job);
        hub.publish(ProgressEvent::from_job(&job, EventKind::Progress));
        Transition::completed(ResultRef::new("r")).apply(&mut job);
        hub.publish(ProgressEvent::from_job(&job, EventKind::Completed));

        let (tx, mut rx) = mpsc::channel(8);
        let sink = ChannelSink::new(tx);
        let delivered = forward(sub, &sink).await.unwrap();
        assert_eq!(delivered, 3);

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.last(), Some(&EventKind::Completed));
    }

    #[tokio::test]
    async fn test_forward_stops_on_closed_sink() {
        let hub = ProgressHub::default();
        let job = Job::new(Fingerprint::new("fp"), serde_json::Value::Null, "test");
        let sub = hub.subscribe(ProgressEvent::snapshot(&job));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = forward(sub, &ChannelSink::new(tx)).await;
        assert!(matches!(result, Err(SinkError::Closed)));
    }
}
