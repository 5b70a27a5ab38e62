//! Liveness tracking
//!
//! Each node stamps the current time into a keep-alive key for every local
//! writer that is still running and for its checker group. Anyone can then
//! tell a slow participant from one that is gone: a stamp older than the
//! dead timeout (or no stamp at all) means gone.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::control::Control;
use crate::core::checkpoint::{checker_keep_alive_key, now_millis, writer_keep_alive_key};
use crate::core::{CheckerId, WriterId};
use crate::storage::codec::{decode_opt, encode};
use crate::storage::{KeyValueStore, StoreError};

/// Something that stamps a keep-alive key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Participant {
    Writer(WriterId),
    Checker(CheckerId),
}

impl Participant {
    pub fn keep_alive_key(&self) -> String {
        match self {
            Participant::Writer(w) => writer_keep_alive_key(*w),
            Participant::Checker(c) => checker_keep_alive_key(*c),
        }
    }
}

/// Reads and writes keep-alive stamps
pub struct LivenessTracker {
    store: Arc<dyn KeyValueStore>,
    dead_timeout: Duration,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, dead_timeout: Duration) -> Self {
        LivenessTracker {
            store,
            dead_timeout,
        }
    }

    /// Stamp the current time for `participant`
    pub async fn touch(&self, participant: Participant) -> Result<(), StoreError> {
        self.store
            .put(&participant.keep_alive_key(), encode(&now_millis())?)
            .await
    }

    /// Whether `participant` stamped its key within the dead timeout
    ///
    /// A failed read counts as alive: an unreachable store must not excuse
    /// anybody from proving their operations.
    pub async fn is_alive(&self, participant: Participant) -> bool {
        let stamp: Option<u64> = match self.store.get(&participant.keep_alive_key()).await {
            Ok(raw) => match decode_opt(raw.as_deref()) {
                Ok(stamp) => stamp,
                Err(e) => {
                    warn!(?participant, error = %e, "malformed keep-alive stamp");
                    return true;
                }
            },
            Err(e) => {
                warn!(?participant, error = %e, "cannot read keep-alive stamp");
                return true;
            }
        };
        match stamp {
            None => false,
            Some(stamp) => {
                let deadline = now_millis().saturating_sub(self.dead_timeout.as_millis() as u64);
                stamp >= deadline
            }
        }
    }
}

/// Participants the local keep-alive task stamps
pub type KeepAliveSet = Arc<Mutex<BTreeSet<Participant>>>;

/// Stamp every registered participant now
pub async fn touch_all(tracker: &LivenessTracker, participants: &KeepAliveSet) {
    let current: Vec<Participant> = participants.lock().iter().copied().collect();
    for participant in current {
        if let Err(e) = tracker.touch(participant).await {
            warn!(?participant, error = %e, "keep-alive write failed");
        }
    }
}

/// Spawn the keep-alive side task of a node
pub fn spawn_keep_alive(
    tracker: Arc<LivenessTracker>,
    participants: KeepAliveSet,
    period: Duration,
    control: Arc<Control>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("keep-alive task started");
        while !control.should_stop() {
            touch_all(&tracker, &participants).await;
            if control.sleep(period).await.is_err() {
                break;
            }
        }
        debug!("keep-alive task finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn tracker(store: &MemoryStore, timeout: Duration) -> LivenessTracker {
        LivenessTracker::new(Arc::new(store.clone()), timeout)
    }

    #[tokio::test]
    async fn test_missing_stamp_is_dead() {
        let store = MemoryStore::new();
        let tracker = tracker(&store, Duration::from_secs(10));
        assert!(!tracker.is_alive(Participant::Writer(0)).await);

        tracker.touch(Participant::Writer(0)).await.unwrap();
        assert!(tracker.is_alive(Participant::Writer(0)).await);
        assert!(!tracker.is_alive(Participant::Checker(0)).await);
    }

    #[tokio::test]
    async fn test_old_stamp_is_dead() {
        let store = MemoryStore::new();
        let old = now_millis() - 60_000;
        store.force_put(&writer_keep_alive_key(1), encode(&old).unwrap());

        assert!(!tracker(&store, Duration::from_secs(10)).is_alive(Participant::Writer(1)).await);
        assert!(tracker(&store, Duration::from_secs(120)).is_alive(Participant::Writer(1)).await);
    }

    #[tokio::test]
    async fn test_malformed_stamp_counts_as_alive() {
        let store = MemoryStore::new();
        store.force_put(&checker_keep_alive_key(2), b"soon".to_vec());
        assert!(tracker(&store, Duration::from_secs(1)).is_alive(Participant::Checker(2)).await);
    }

    #[tokio::test]
    async fn test_keep_alive_task_stamps_registered_participants() {
        let store = MemoryStore::new();
        let tracker = Arc::new(tracker(&store, Duration::from_secs(10)));
        let participants: KeepAliveSet = Arc::default();
        participants.lock().insert(Participant::Writer(3));
        participants.lock().insert(Participant::Checker(0));

        let control = Arc::new(Control::new());
        let handle = spawn_keep_alive(
            tracker.clone(),
            participants,
            Duration::from_millis(10),
            control.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        control.interrupt();
        handle.await.unwrap();

        assert!(tracker.is_alive(Participant::Writer(3)).await);
        assert!(tracker.is_alive(Participant::Checker(0)).await);
        assert!(!tracker.is_alive(Participant::Writer(4)).await);
    }
}
