//! `KvStore`: the coordination-state collaborator (spec §6). All rendezvous
//! between daemons — the node catalog, the node records, the two cluster-wide
//! locks — flows through this trait. [`HttpConsulClient`] is the only
//! production implementation, speaking Consul's HTTP API directly over
//! `reqwest`; [`mock::MockKvStore`] (behind `test-utils`) backs the
//! integration tests in `autowired-core`.

mod client;
mod lock;

#[cfg(feature = "test-utils")]
pub mod mock;

pub use client::HttpConsulClient;
pub use lock::SessionLock;

use std::time::Duration;

use async_trait::async_trait;

/// Options for a KV read. `wait_index` of 0 returns immediately; any other
/// value blocks (long-polls) until the keyspace's change index exceeds it or
/// a server-side timeout elapses (spec §4.5/§4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub consistent: bool,
    pub wait_index: u64,
}

impl QueryOptions {
    pub fn consistent() -> Self {
        Self { consistent: true, wait_index: 0 }
    }

    pub fn long_poll(wait_index: u64) -> Self {
        Self { consistent: false, wait_index }
    }
}

/// The response-side change index accompanying a list/catalog read.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryMeta {
    pub last_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// One live entry from the cluster catalog (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub node: String,
    pub address: String,
}

/// A single write in an atomic multi-key transaction (spec §4.3 step 3c).
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum ConsulError {
    #[error("KV transport error")]
    Transport(#[from] reqwest::Error),
    #[error("KV returned an unexpected response: {0}")]
    Protocol(String),
    #[error("transaction was rolled back")]
    TxnRolledBack,
    #[error("lock {key:?} is already held by another session")]
    LockContention { key: String },
    #[error("session {0} could not be renewed; likely expired")]
    SessionExpired(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConsulError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError>;

    /// Lists every key under `prefix`. `opts.wait_index` turns this into a
    /// long-poll blocking query (spec §4.5 step 1).
    async fn list(&self, prefix: &str, opts: QueryOptions) -> Result<(Vec<KvPair>, QueryMeta), ConsulError>;

    async fn delete_tree(&self, prefix: &str) -> Result<(), ConsulError>;

    /// Applies every op atomically: all commit, or none do. `Ok(false)` means
    /// the transaction was rejected (spec §4.3 step 3e, "allocation
    /// contention").
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<bool, ConsulError>;

    /// Acquires a session-leased lock at `key` with the given TTL and
    /// `release` session behavior (spec §5). Blocks until acquired; callers
    /// that need non-blocking semantics (the Node Watcher, spec §4.6) should
    /// drive this from a background task instead of awaiting it inline.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<SessionLock, ConsulError>;

    /// Long-polls the cluster catalog for the set of currently-live physical
    /// addresses (spec §4.6).
    async fn catalog_nodes(&self, opts: QueryOptions) -> Result<(Vec<CatalogNode>, QueryMeta), ConsulError>;
}
