//! In-memory [`KvStore`] for daemon-level integration tests (spec §8).
//! Models the pieces of real Consul the daemon actually depends on: a single
//! monotonic KV change index, a separate catalog index, strongly-consistent
//! reads, long-poll wake-ups via [`tokio::sync::Notify`], atomic
//! transactions, and mutually-exclusive session locks.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    lock::LockBackend, CatalogNode, ConsulError, KvPair, KvStore, QueryMeta, QueryOptions, SessionLock, TxnOp,
};

#[derive(Default)]
struct State {
    kv: BTreeMap<String, Vec<u8>>,
    kv_index: u64,
    locks: BTreeMap<String, String>,
    catalog: BTreeMap<String, String>,
    catalog_index: u64,
    next_id: u64,
}

/// In-memory stand-in for a Consul cluster. Exposes `register_node` /
/// `deregister_node` so tests can simulate catalog membership changes (spec
/// §8 S4) without going through the KV.
#[derive(Clone)]
pub struct MockKvStore {
    state: Arc<Mutex<State>>,
    kv_changed: Arc<Notify>,
    catalog_changed: Arc<Notify>,
}

impl Default for MockKvStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            kv_changed: Arc::new(Notify::new()),
            catalog_changed: Arc::new(Notify::new()),
        }
    }
}

impl MockKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node(&self, node: impl Into<String>, address: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.catalog.insert(node.into(), address.into());
        state.catalog_index += 1;
        drop(state);
        self.catalog_changed.notify_waiters();
    }

    pub fn deregister_node(&self, node: &str) {
        let mut state = self.state.lock().unwrap();
        if state.catalog.remove(node).is_some() {
            state.catalog_index += 1;
            drop(state);
            self.catalog_changed.notify_waiters();
        }
    }

    fn next_session_id(state: &mut State) -> String {
        state.next_id += 1;
        format!("mock-session-{}", state.next_id)
    }
}

#[async_trait]
impl KvStore for MockKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConsulError> {
        Ok(self.state.lock().unwrap().kv.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError> {
        let mut state = self.state.lock().unwrap();
        state.kv.insert(key.to_string(), value.to_vec());
        state.kv_index += 1;
        drop(state);
        self.kv_changed.notify_waiters();
        Ok(())
    }

    async fn list(&self, prefix: &str, opts: QueryOptions) -> Result<(Vec<KvPair>, QueryMeta), ConsulError> {
        loop {
            let (pairs, index) = {
                let state = self.state.lock().unwrap();
                let pairs: Vec<_> = state
                    .kv
                    .range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| KvPair { key: k.clone(), value: v.clone() })
                    .collect();
                (pairs, state.kv_index)
            };

            if opts.wait_index == 0 || index > opts.wait_index {
                return Ok((pairs, QueryMeta { last_index: index }));
            }

            self.kv_changed.notified().await;
        }
    }

    async fn delete_tree(&self, prefix: &str) -> Result<(), ConsulError> {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<_> = state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            state.kv.remove(&key);
        }
        state.kv_index += 1;
        drop(state);
        self.kv_changed.notify_waiters();
        Ok(())
    }

    async fn txn(&self, ops: Vec<TxnOp>) -> Result<bool, ConsulError> {
        let mut state = self.state.lock().unwrap();
        for op in &ops {
            let TxnOp::Put { key, value } = op;
            state.kv.insert(key.clone(), value.clone());
        }
        state.kv_index += 1;
        drop(state);
        self.kv_changed.notify_waiters();
        Ok(true)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<SessionLock, ConsulError> {
        let session_id = {
            let mut state = self.state.lock().unwrap();
            if state.locks.contains_key(key) {
                return Err(ConsulError::LockContention { key: key.to_string() });
            }
            let session_id = Self::next_session_id(&mut state);
            state.locks.insert(key.to_string(), session_id.clone());
            session_id
        };

        let backend: Arc<dyn LockBackend> = Arc::new(MockLockBackend { state: Arc::clone(&self.state) });
        Ok(SessionLock::new(key.to_string(), session_id, ttl, backend))
    }

    async fn catalog_nodes(&self, opts: QueryOptions) -> Result<(Vec<CatalogNode>, QueryMeta), ConsulError> {
        loop {
            let (nodes, index) = {
                let state = self.state.lock().unwrap();
                let nodes = state
                    .catalog
                    .iter()
                    .map(|(node, address)| CatalogNode { node: node.clone(), address: address.clone() })
                    .collect();
                (nodes, state.catalog_index)
            };

            if opts.wait_index == 0 || index > opts.wait_index {
                return Ok((nodes, QueryMeta { last_index: index }));
            }

            self.catalog_changed.notified().await;
        }
    }
}

struct MockLockBackend {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl LockBackend for MockLockBackend {
    async fn renew_session(&self, _session_id: &str) -> Result<(), ConsulError> {
        Ok(())
    }

    async fn release_lock(&self, key: &str, session_id: &str) -> Result<(), ConsulError> {
        let mut state = self.state.lock().unwrap();
        if state.locks.get(key).map(String::as_str) == Some(session_id) {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn destroy_session(&self, _session_id: &str) -> Result<(), ConsulError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test(flavor = "multi_thread")]
    async fn long_poll_wakes_on_put() {
        autowired_tracing::init_test_tracing();
        let store = MockKvStore::new();

        // Seed a key first so the baseline index is non-zero; otherwise
        // `QueryOptions::long_poll(0)` hits the `wait_index == 0` early
        // return and the blocking/notify path is never exercised.
        store.put("nodes/10.0.0.1/ip", b"192.168.200.1").await.unwrap();
        let (_, meta) = store.list("nodes/", QueryOptions::consistent()).await.unwrap();
        let waited = meta.last_index;
        assert!(waited > 0);

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
                store.put("nodes/10.0.0.2/ip", b"192.168.200.2").await.unwrap();
            })
        };

        let (pairs, meta) = store.list("nodes/", QueryOptions::long_poll(waited)).await.unwrap();
        writer.await.unwrap();

        assert_eq!(pairs.len(), 2);
        assert!(meta.last_index > waited);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_lock_acquisition_is_contended() {
        let store = MockKvStore::new();
        let first = store.acquire_lock("pick-ip-lock", StdDuration::from_secs(10)).await.unwrap();

        let second = store.acquire_lock("pick-ip-lock", StdDuration::from_secs(10)).await;
        assert!(matches!(second, Err(ConsulError::LockContention { .. })));

        first.release().await.unwrap();
        let third = store.acquire_lock("pick-ip-lock", StdDuration::from_secs(10)).await;
        assert!(third.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catalog_reflects_registration_and_deregistration() {
        let store = MockKvStore::new();
        store.register_node("node-a", "10.0.0.11");

        let (nodes, meta) = store.catalog_nodes(QueryOptions::consistent()).await.unwrap();
        assert_eq!(nodes, vec![CatalogNode { node: "node-a".into(), address: "10.0.0.11".into() }]);

        store.deregister_node("node-a");
        let (nodes, meta2) = store.catalog_nodes(QueryOptions::consistent()).await.unwrap();
        assert!(nodes.is_empty());
        assert!(meta2.last_index > meta.last_index);
    }
}
