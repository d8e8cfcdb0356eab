//! Node Watcher: long-polls the cluster catalog, and separately attempts the
//! singleton reaper lock in the background without blocking its own polling
//! loop (spec §4.6; the "current intent" decision recorded in SPEC_FULL.md
//! §9).

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use autowired_consul::{ConsulError, KvStore, QueryOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::peer_watcher::{sleep_or_cancelled, watcher_backoff};

const LOCK_KEY: &str = "monitor-nodes-lock";
const LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct NodeWatcher {
    kv: Arc<dyn KvStore>,
    lock_key: String,
}

/// Tracks whether this host currently owns the reaper lock. Cheap to clone
/// and check from the multiplexer on every catalog tick (spec §4.8).
#[derive(Clone)]
pub struct ReaperLockStatus(Arc<AtomicBool>);

impl ReaperLockStatus {
    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl NodeWatcher {
    pub fn new(kv: Arc<dyn KvStore>, kv_root: &str) -> Self {
        Self { kv, lock_key: format!("{kv_root}/{LOCK_KEY}") }
    }

    /// Spawns the background lock-acquisition loop and returns a handle the
    /// multiplexer can poll to learn whether it is the current reaper.
    pub fn spawn_lock_acquisition(&self, cancel: CancellationToken) -> ReaperLockStatus {
        let held = Arc::new(AtomicBool::new(false));
        let status = ReaperLockStatus(Arc::clone(&held));
        let kv = Arc::clone(&self.kv);
        let lock_key = self.lock_key.clone();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                match kv.acquire_lock(&lock_key, LOCK_TTL).await {
                    Ok(lock) => {
                        held.store(true, Ordering::SeqCst);
                        tracing::info!(key = %lock_key, "acquired reaper lock");
                        cancel.cancelled().await;
                        held.store(false, Ordering::SeqCst);
                        let _ = lock.release().await;
                        return;
                    }
                    Err(ConsulError::LockContention { .. }) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {}
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "reaper lock acquisition error, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(LOCK_RETRY_INTERVAL) => {}
                        }
                    }
                }
            }
        });

        status
    }

    /// Runs the catalog long-poll loop, emitting `phys-ip -> node-id` on
    /// every change. Never blocks on lock acquisition (spec §4.6).
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(self, tx: mpsc::Sender<HashMap<IpAddr, String>>, cancel: CancellationToken) {
        let mut wait_index = 0u64;
        let mut backoff = watcher_backoff();

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.kv.catalog_nodes(QueryOptions::long_poll(wait_index)) => outcome,
            };

            match outcome {
                Ok((nodes, meta)) => {
                    backoff.reset();
                    wait_index = meta.last_index;
                    let live: HashMap<IpAddr, String> = nodes
                        .into_iter()
                        .filter_map(|n| Some((n.address.parse().ok()?, n.node)))
                        .collect();
                    if tx.send(live).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    if !sleep_or_cancelled(&mut backoff, &cancel, &error).await {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_consul::mock::MockKvStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_catalog_snapshot_on_registration() {
        let kv = Arc::new(MockKvStore::new());
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let watcher = NodeWatcher::new(kv.clone(), "autowire/wg0");
        let handle = tokio::spawn(watcher.run(tx, cancel.clone()));

        kv.register_node("node-a", "10.0.0.11");

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.get(&"10.0.0.11".parse::<IpAddr>().unwrap()), Some(&"node-a".to_string()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_one_of_two_watchers_holds_the_lock() {
        let kv = Arc::new(MockKvStore::new());
        let cancel = CancellationToken::new();

        let a = NodeWatcher::new(kv.clone(), "autowire/wg0").spawn_lock_acquisition(cancel.clone());
        let b = NodeWatcher::new(kv.clone(), "autowire/wg0").spawn_lock_acquisition(cancel.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ne!(a.is_held(), b.is_held());

        cancel.cancel();
    }
}
