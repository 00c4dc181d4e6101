//! Change-tick fanout to the autoupdate loops.
//!
//! The receive task publishes one notice per applied batch; every connection
//! loop holds a bounded subscription. A subscriber that cannot keep up is
//! flipped into resync mode instead of blocking the publisher: its next
//! receive drains the stale queue and reports `Resync`, which the loop
//! answers with a fresh full snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::core::{ChangeId, Key, Shutdown};

/// One published change tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeNotice {
    /// A batch was applied; `keys` is the union of upstream, gap-fill, and
    /// synthetic keys. `perm_change` marks batches that can alter what a
    /// viewer is allowed to see.
    Changed {
        change_id: ChangeId,
        keys: Arc<[Key]>,
        perm_change: bool,
    },
    /// The change-id axis jumped; the cache was rebuilt from a full snapshot.
    Reset { change_id: ChangeId },
}

impl ChangeNotice {
    pub fn change_id(&self) -> ChangeId {
        match self {
            ChangeNotice::Changed { change_id, .. } | ChangeNotice::Reset { change_id } => {
                *change_id
            }
        }
    }
}

/// What a subscriber sees on receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tick {
    Notice(ChangeNotice),
    /// The subscriber lagged; its view of the tick stream has holes.
    Resync,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcasterLimits {
    pub max_subscribers: usize,
    pub queue_len: usize,
}

impl Default for BroadcasterLimits {
    fn default() -> Self {
        Self {
            max_subscribers: 1024,
            queue_len: 64,
        }
    }
}

const RECV_POLL: Duration = Duration::from_millis(100);

pub struct ChangeSubscription {
    receiver: Receiver<ChangeNotice>,
    lagged: Arc<AtomicBool>,
}

impl ChangeSubscription {
    /// Block until the next tick, a lag marker, or shutdown.
    pub fn recv(&self, shutdown: &Shutdown) -> Tick {
        loop {
            if self.lagged.swap(false, Ordering::AcqRel) {
                // Stale queued notices are useless after a hole.
                while self.receiver.try_recv().is_ok() {}
                return Tick::Resync;
            }
            if shutdown.is_triggered() {
                return Tick::Shutdown;
            }
            match self.receiver.recv_timeout(RECV_POLL) {
                Ok(notice) => return Tick::Notice(notice),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Tick::Shutdown,
            }
        }
    }
}

#[derive(Clone)]
pub struct ChangeBroadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl ChangeBroadcaster {
    pub fn new(limits: BroadcasterLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcasterState {
                limits,
                next_id: 1,
                subscribers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Result<ChangeSubscription, BroadcastError> {
        let mut state = self.lock_state();
        if state.subscribers.len() >= state.limits.max_subscribers {
            return Err(BroadcastError::SubscriberLimitReached {
                max_subscribers: state.limits.max_subscribers,
            });
        }

        let (sender, receiver) = crossbeam::channel::bounded(state.limits.queue_len);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = state.next_id;
        state.next_id = state.next_id.saturating_add(1);
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                lagged: Arc::clone(&lagged),
            },
        );

        Ok(ChangeSubscription { receiver, lagged })
    }

    pub fn publish(&self, notice: ChangeNotice) {
        let mut state = self.lock_state();
        let mut gone = Vec::new();
        for (id, subscriber) in &state.subscribers {
            match subscriber.sender.try_send(notice.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.lagged.store(true, Ordering::Release);
                }
                Err(TrySendError::Disconnected(_)) => {
                    gone.push(*id);
                }
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_state().subscribers.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BroadcasterState> {
        self.inner.lock().expect("broadcaster lock")
    }
}

struct BroadcasterState {
    limits: BroadcasterLimits,
    next_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    sender: Sender<ChangeNotice>,
    lagged: Arc<AtomicBool>,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("subscriber limit reached ({max_subscribers})")]
    SubscriberLimitReached { max_subscribers: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(change_id: ChangeId, keys: &[&str]) -> ChangeNotice {
        let keys: Arc<[Key]> = keys
            .iter()
            .map(|raw| Key::parse(raw).unwrap())
            .collect::<Vec<_>>()
            .into();
        ChangeNotice::Changed {
            change_id,
            keys,
            perm_change: false,
        }
    }

    #[test]
    fn delivers_notices_in_order() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterLimits::default());
        let sub = broadcaster.subscribe().unwrap();
        let shutdown = Shutdown::new();

        broadcaster.publish(changed(6, &["motions/motion:1"]));
        broadcaster.publish(changed(7, &["agenda/item:2"]));

        assert_eq!(sub.recv(&shutdown), Tick::Notice(changed(6, &["motions/motion:1"])));
        assert_eq!(sub.recv(&shutdown), Tick::Notice(changed(7, &["agenda/item:2"])));
    }

    #[test]
    fn lagged_subscriber_resyncs_with_drained_queue() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterLimits {
            max_subscribers: 4,
            queue_len: 1,
        });
        let sub = broadcaster.subscribe().unwrap();
        let shutdown = Shutdown::new();

        broadcaster.publish(changed(1, &["users/user:1"]));
        broadcaster.publish(changed(2, &["users/user:1"]));
        broadcaster.publish(changed(3, &["users/user:1"]));

        assert_eq!(sub.recv(&shutdown), Tick::Resync);
        // Post-resync publishes flow again.
        broadcaster.publish(changed(4, &["users/user:2"]));
        assert_eq!(sub.recv(&shutdown), Tick::Notice(changed(4, &["users/user:2"])));
    }

    #[test]
    fn subscriber_limit_is_enforced() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterLimits {
            max_subscribers: 1,
            queue_len: 4,
        });
        let _keep = broadcaster.subscribe().unwrap();
        assert!(matches!(
            broadcaster.subscribe(),
            Err(BroadcastError::SubscriberLimitReached { .. })
        ));
    }

    #[test]
    fn dropped_subscribers_are_pruned_on_publish() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterLimits::default());
        let sub = broadcaster.subscribe().unwrap();
        drop(sub);

        broadcaster.publish(changed(1, &["users/user:1"]));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn shutdown_unblocks_recv() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterLimits::default());
        let sub = broadcaster.subscribe().unwrap();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert_eq!(sub.recv(&shutdown), Tick::Shutdown);
    }
}
