//! Subscriber Hub (C6): publish/subscribe broadcast of canonical events over
//! bounded per-subscriber queues. Registry shape and RAII unregister are
//! grounded on the donor's `WsConnectionManager`/`ConnectionGuard`; the
//! transport fed by the receiver half is SSE, not WebSocket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::canonical::{DispatchEvent, EventFilter};
use crate::metrics;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_MISS_LIMIT: u32 = 2;

struct Subscriber {
    sender: mpsc::Sender<HubMessage>,
    filter: EventFilter,
    dropped: Arc<AtomicU64>,
    missed_heartbeats: std::sync::atomic::AtomicU32,
}

/// What actually flows down a subscriber's channel: either a real event or
/// a heartbeat ping the transport layer turns into an SSE comment/keepalive.
#[derive(Debug, Clone)]
pub enum HubMessage {
    Event(Arc<DispatchEvent>),
    Heartbeat,
}

pub struct SubscriberHub {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl SubscriberHub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_size,
        }
    }

    /// Registers a subscriber. `initial_state` is enqueued before the
    /// subscriber becomes visible to `publish`, guaranteeing it is the first
    /// message the subscriber ever sees (§4.6 initial-state contract).
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter, initial_state: DispatchEvent) -> SubscriptionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        // Queue isn't shared with `publish` yet: this send cannot race a
        // live event and is guaranteed to land first.
        let _ = sender.try_send(HubMessage::Event(Arc::new(initial_state)));

        self.subscribers.insert(
            id,
            Subscriber {
                sender,
                filter,
                dropped: dropped.clone(),
                missed_heartbeats: std::sync::atomic::AtomicU32::new(0),
            },
        );
        metrics::SUBSCRIBERS_CONNECTED.set(self.subscribers.len() as i64);
        log::info!("subscriber {id} connected ({} total)", self.subscribers.len());

        SubscriptionGuard {
            id,
            hub: self.clone(),
            receiver,
            dropped,
        }
    }

    fn unregister(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            metrics::SUBSCRIBERS_CONNECTED.set(self.subscribers.len() as i64);
            log::info!("subscriber {id} disconnected ({} remaining)", self.subscribers.len());
        }
    }

    /// Delivers `event` to every subscriber whose filter matches. Never
    /// blocks: a full queue drops the message for that subscriber only.
    pub fn publish(&self, event: DispatchEvent) {
        metrics::EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[event.type_name()])
            .inc();
        let event = Arc::new(event);
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches(&event) {
                continue;
            }
            if subscriber
                .sender
                .try_send(HubMessage::Event(event.clone()))
                .is_err()
            {
                subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::SUBSCRIBER_EVENTS_DROPPED_TOTAL.inc();
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Spawns the 30-second heartbeat loop. A subscriber whose heartbeat
    /// send fails twice in a row is force-closed.
    pub fn start_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    _ = cancel.cancelled() => return,
                }
                let mut to_close = Vec::new();
                for entry in self.subscribers.iter() {
                    let id = *entry.key();
                    let subscriber = entry.value();
                    if subscriber.sender.try_send(HubMessage::Heartbeat).is_ok() {
                        subscriber.missed_heartbeats.store(0, Ordering::Relaxed);
                    } else {
                        let misses = subscriber.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
                        if misses >= HEARTBEAT_MISS_LIMIT {
                            to_close.push(id);
                        }
                    }
                }
                for id in to_close {
                    self.subscribers.remove(&id);
                    metrics::SUBSCRIBERS_DISCONNECTED_SLOW_TOTAL.inc();
                    log::warn!("subscriber {id} closed after missing {HEARTBEAT_MISS_LIMIT} heartbeats");
                }
                metrics::SUBSCRIBERS_CONNECTED.set(self.subscribers.len() as i64);
            }
        });
    }
}

/// RAII handle returned by `subscribe`. Dropping it unregisters the
/// subscriber and closes its receiver.
pub struct SubscriptionGuard {
    id: u64,
    hub: Arc<SubscriberHub>,
    receiver: mpsc::Receiver<HubMessage>,
    dropped: Arc<AtomicU64>,
}

impl SubscriptionGuard {
    pub async fn recv(&mut self) -> Option<HubMessage> {
        self.receiver.recv().await
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_initial_state_first() {
        let hub = Arc::new(SubscriberHub::new(8));
        let mut guard = hub.subscribe(EventFilter::default(), DispatchEvent::InitialState(json!({"calls": []})));
        hub.publish(DispatchEvent::CallStart(json!({"call_id": "c1"})));

        let first = guard.recv().await.unwrap();
        assert!(matches!(first, HubMessage::Event(e) if matches!(*e, DispatchEvent::InitialState(_))));
        let second = guard.recv().await.unwrap();
        assert!(matches!(second, HubMessage::Event(e) if matches!(*e, DispatchEvent::CallStart(_))));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts_without_blocking_publisher() {
        let hub = Arc::new(SubscriberHub::new(1));
        let mut guard = hub.subscribe(EventFilter::default(), DispatchEvent::InitialState(json!({})));
        // Queue size 1 is already occupied by initial.state.
        hub.publish(DispatchEvent::CallStart(json!({})));
        hub.publish(DispatchEvent::CallStart(json!({})));
        assert!(guard.dropped_count() >= 1);
        let _ = guard.recv().await;
    }

    #[tokio::test]
    async fn drop_guard_unregisters_subscriber() {
        let hub = Arc::new(SubscriberHub::new(8));
        let guard = hub.subscribe(EventFilter::default(), DispatchEvent::InitialState(json!({})));
        assert_eq!(hub.subscriber_count(), 1);
        drop(guard);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_live_events() {
        let hub = Arc::new(SubscriberHub::new(8));
        let filter = EventFilter {
            event_types: Some(vec!["call.end".into()]),
            ..Default::default()
        };
        let mut guard = hub.subscribe(filter, DispatchEvent::InitialState(json!({})));
        let _ = guard.recv().await; // drain initial.state
        hub.publish(DispatchEvent::CallStart(json!({})));
        hub.publish(DispatchEvent::CallEnd(json!({})));
        let next = guard.recv().await.unwrap();
        assert!(matches!(next, HubMessage::Event(e) if matches!(*e, DispatchEvent::CallEnd(_))));
    }
}
