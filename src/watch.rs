//! Event fan-out for [`Tree::watch`](crate::tree::Tree::watch) and the
//! server-side `Watch` verb (`spec.md` §4.2, §4.3.3, §9's "ordered event
//! broadcast" design note).
//!
//! Because every `Tree` mutation already goes through a single `&mut
//! self` method call, publication is naturally ordered without a
//! dedicated broadcast task — the "single owning task fans out to
//! subscriber queues" design note is satisfied by the Tree's own
//! exclusive-access discipline (`spec.md` §5). What each subscriber still
//! needs is a bounded, drop-on-stall queue, which is what this module
//! provides.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::entry::DirEntry;
use crate::path::Parsed;
use crate::wal::MarshalledError;

/// Outgoing channel depth per subscriber. A full channel is treated as a
/// stalled subscriber and dropped immediately, which stands in for
/// `spec.md` §4.3.3's one-minute send timeout: this core delivers
/// synchronously within the Tree's own call stack, so there's no
/// background task to honor a real wall-clock timeout against.
pub(crate) const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub entry: Option<DirEntry>,
    pub sequence: i64,
    pub error: Option<MarshalledError>,
}

struct Subscriber {
    id: u64,
    subtree: Parsed,
    since: i64,
    sender: SyncSender<Event>,
}

/// Owned by one [`Tree`](crate::tree::Tree); fans out every mutation to
/// whichever subscribers' subtrees it falls under.
pub struct WatchHub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber for `subtree`, first delivering `replay`
    /// (already-collected synthetic events for `sinceSequence = -1`,
    /// `spec.md` §4.2) before going live.
    pub fn subscribe(&self, subtree: Parsed, since: i64, replay: Vec<Event>) -> Subscription {
        let (sender, receiver) = sync_channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        for event in replay {
            if sender.try_send(event).is_err() {
                break;
            }
        }

        self.subscribers.lock().push(Subscriber {
            id,
            subtree,
            since,
            sender,
        });

        Subscription {
            receiver,
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Fan `event` out to every subscriber whose subtree covers it and
    /// whose `since` threshold it clears. Stalled subscribers (full
    /// channel) are dropped, never blocking the mutator that called this.
    pub fn publish(&self, event: Event) {
        let Ok(path) = Parsed::new(&event.name) else { return };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if !path.has_prefix(&sub.subtree) || event.sequence <= sub.since {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    crate::counters::bump(crate::counters::Op::WatchEventDropped);
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live watch subscription. Dropping it (the `done` channel of
/// `spec.md` §4.2/§5) unregisters it from the hub promptly.
#[derive(Debug)]
pub struct Subscription {
    pub receiver: Receiver<Event>,
    id: u64,
    subscribers: Weak<Mutex<Vec<Subscriber>>>,
}

impl Subscription {
    /// Wrap an already-filtered `Receiver` with no hub registration of its
    /// own (`DirServer::watch`'s per-event access-filtering stage: the
    /// caller-visible subscription is one hop removed from the `Tree`'s
    /// raw one). `subscribers` is an always-dangling `Weak`, so dropping
    /// this is a no-op; the real registration is released when the raw
    /// subscription feeding the forwarding thread is dropped instead.
    pub(crate) fn detached(receiver: Receiver<Event>) -> Self {
        Self {
            receiver,
            id: 0,
            subscribers: Weak::new(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn event(name: &str, sequence: i64) -> Event {
        Event {
            name: name.to_string(),
            entry: None,
            sequence,
            error: None,
        }
    }

    #[test]
    fn delivers_events_under_subtree_above_since() {
        let hub = WatchHub::new();
        let sub = hub.subscribe(Parsed::new("ann@example.com/").unwrap(), 0, Vec::new());

        hub.publish(event("ann@example.com/docs", 1));
        hub.publish(event("bob@example.com/docs", 1));

        let got = sub.receiver.recv().unwrap();
        assert_eq!(got.name, "ann@example.com/docs");
        assert!(sub.receiver.try_recv().is_err());
    }

    #[test]
    fn replay_events_arrive_before_live_ones() {
        let hub = WatchHub::new();
        let replay = vec![event("ann@example.com/", 0)];
        let sub = hub.subscribe(Parsed::new("ann@example.com/").unwrap(), -1, replay);
        hub.publish(event("ann@example.com/docs", 1));

        let first = sub.receiver.recv().unwrap();
        assert_eq!(first.sequence, 0);
        let second = sub.receiver.recv().unwrap();
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn dropping_subscription_unregisters_it() {
        let hub = WatchHub::new();
        let sub = hub.subscribe(Parsed::new("ann@example.com/").unwrap(), 0, Vec::new());
        drop(sub);
        hub.publish(event("ann@example.com/docs", 1));
        assert_eq!(hub.subscribers.lock().len(), 0);
    }

    #[test]
    fn since_threshold_suppresses_already_seen_sequence() {
        let hub = WatchHub::new();
        let sub = hub.subscribe(Parsed::new("ann@example.com/").unwrap(), 5, Vec::new());
        hub.publish(event("ann@example.com/foo", 5));
        hub.publish(event("ann@example.com/foo", 6));
        let got = sub.receiver.recv().unwrap();
        assert_eq!(got.sequence, 6);
    }
}
