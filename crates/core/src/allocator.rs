//! Allocator: claims exactly one overlay IP and publishes a complete Node
//! Record atomically (spec §4.3).

use std::{collections::HashSet, net::IpAddr, net::Ipv4Addr, sync::Arc, time::Duration};

use autowired_consul::{ConsulError, KvPair, KvStore, QueryOptions, TxnOp};
use autowired_primitives::{NodeRecord, FIELD_ALLOWEDIPS, FIELD_IP, FIELD_PORT, FIELD_PUBKEY};
use ipnet::Ipv4Net;

const LOCK_KEY: &str = "pick-ip-lock";
const LOCK_TTL: Duration = Duration::from_secs(10);
const MAX_CLAIM_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("KV error")]
    Kv(#[from] ConsulError),
    #[error("no free address remains in the declared range")]
    RangeExhausted,
    #[error("allocation contention: exhausted {0} retries without a committed claim")]
    Contention(u32),
}

pub struct Allocator {
    kv: Arc<dyn KvStore>,
    kv_root: String,
    range: Ipv4Net,
    listen_port: u16,
    public_key: String,
    self_phys_ip: IpAddr,
}

impl Allocator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        kv_root: String,
        range: Ipv4Net,
        listen_port: u16,
        public_key: String,
        self_phys_ip: IpAddr,
    ) -> Self {
        Self { kv, kv_root, range, listen_port, public_key, self_phys_ip }
    }

    fn node_prefix(&self, phys_ip: IpAddr) -> String {
        format!("{}/nodes/{}/", self.kv_root, phys_ip)
    }

    fn range_key(&self) -> String {
        format!("{}/range", self.kv_root)
    }

    fn lock_key(&self) -> String {
        format!("{}/{}", self.kv_root, LOCK_KEY)
    }

    fn in_allocatable_range(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(ip) && ip != self.range.network() && ip != self.range.broadcast()
    }

    /// Ensures the `range` key matches the locally configured CIDR (spec
    /// §4.3 step 1). Last-writer-wins: operators agree on the range
    /// out-of-band.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn ensure_range(&self) -> Result<(), AllocatorError> {
        let declared = self.kv.get(&self.range_key()).await?;
        let range_str = self.range.to_string();
        if declared.as_deref() != Some(range_str.as_bytes()) {
            self.kv.put(&self.range_key(), range_str.as_bytes()).await?;
            tracing::info!(range = %self.range, "published range declaration");
        }
        Ok(())
    }

    async fn read_self_record(&self) -> Result<Option<NodeRecord>, AllocatorError> {
        let prefix = self.node_prefix(self.self_phys_ip);
        let (pairs, _) = self.kv.list(&prefix, QueryOptions::consistent()).await?;
        Ok(fold_record(&prefix, &pairs))
    }

    /// Runs the full claim protocol (spec §4.3): ensures the range is
    /// published, reuses an existing valid record, reclaims and retries on a
    /// stale out-of-range one, or claims a fresh address under the lock.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn ensure_claimed(&self) -> Result<NodeRecord, AllocatorError> {
        loop {
            self.ensure_range().await?;

            if let Some(record) = self.read_self_record().await? {
                if self.in_allocatable_range(record.overlay_ip) {
                    return Ok(record);
                }
                tracing::warn!(
                    ip = %record.overlay_ip,
                    range = %self.range,
                    "existing record falls outside the declared range, reclaiming"
                );
                self.kv.delete_tree(&self.node_prefix(self.self_phys_ip)).await?;
                continue;
            }

            return self.claim().await;
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn claim(&self) -> Result<NodeRecord, AllocatorError> {
        for attempt in 0..MAX_CLAIM_RETRIES {
            let lock = self.kv.acquire_lock(&self.lock_key(), LOCK_TTL).await?;

            let (pairs, _) =
                self.kv.list(&format!("{}/nodes/", self.kv_root), QueryOptions::consistent()).await?;
            let used = used_ips(&pairs);

            let claimed = self.range.hosts().find(|ip| !used.contains(ip));
            let Some(ip) = claimed else {
                lock.release().await?;
                return Err(AllocatorError::RangeExhausted);
            };

            let record = NodeRecord::new(ip, self.public_key.clone(), self.listen_port);
            let committed =
                self.kv.txn(claim_ops(&self.node_prefix(self.self_phys_ip), &record)).await?;

            lock.release().await?;

            if committed {
                tracing::info!(ip = %ip, attempt, "claimed overlay address");
                return Ok(record);
            }

            tracing::warn!(attempt, "claim transaction rejected, retrying with a fresh listing");
        }

        Err(AllocatorError::Contention(MAX_CLAIM_RETRIES))
    }
}

fn used_ips(pairs: &[KvPair]) -> HashSet<Ipv4Addr> {
    pairs
        .iter()
        .filter(|p| p.key.ends_with(FIELD_IP))
        .filter_map(|p| std::str::from_utf8(&p.value).ok()?.parse().ok())
        .collect()
}

fn claim_ops(prefix: &str, record: &NodeRecord) -> Vec<TxnOp> {
    vec![
        TxnOp::Put { key: format!("{prefix}{FIELD_IP}"), value: record.overlay_ip.to_string().into_bytes() },
        TxnOp::Put {
            key: format!("{prefix}{FIELD_PUBKEY}"),
            value: record.public_key.clone().into_bytes(),
        },
        TxnOp::Put { key: format!("{prefix}{FIELD_PORT}"), value: record.port.to_string().into_bytes() },
        TxnOp::Put {
            key: format!("{prefix}{FIELD_ALLOWEDIPS}"),
            value: record.allowed_ips.to_string().into_bytes(),
        },
    ]
}

fn fold_record(prefix: &str, pairs: &[KvPair]) -> Option<NodeRecord> {
    let mut ip = None;
    let mut pubkey = None;
    let mut port = None;

    for pair in pairs {
        let Some(field) = pair.key.strip_prefix(prefix) else { continue };
        let Ok(value) = std::str::from_utf8(&pair.value) else { continue };
        match field {
            FIELD_IP => ip = value.parse().ok(),
            FIELD_PUBKEY => pubkey = Some(value.to_string()),
            FIELD_PORT => port = value.parse().ok(),
            _ => {}
        }
    }

    Some(NodeRecord::new(ip?, pubkey?, port?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_consul::mock::MockKvStore;

    fn allocator(kv: Arc<MockKvStore>, self_ip: &str) -> Allocator {
        Allocator::new(
            kv,
            "autowire/wg0".to_string(),
            "192.168.200.0/24".parse().unwrap(),
            51820,
            "pubkey".to_string(),
            self_ip.parse().unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_claim_picks_first_host_address() {
        let kv = Arc::new(MockKvStore::new());
        let alloc = allocator(Arc::clone(&kv), "10.0.0.11");

        let record = alloc.ensure_claimed().await.unwrap();
        assert_eq!(record.overlay_ip, Ipv4Addr::new(192, 168, 200, 1));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_host_skips_the_first_claimed_address() {
        let kv = Arc::new(MockKvStore::new());
        allocator(Arc::clone(&kv), "10.0.0.11").ensure_claimed().await.unwrap();

        let second = allocator(Arc::clone(&kv), "10.0.0.12").ensure_claimed().await.unwrap();
        assert_eq!(second.overlay_ip, Ipv4Addr::new(192, 168, 200, 2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_with_existing_record_is_idempotent() {
        let kv = Arc::new(MockKvStore::new());
        let alloc = allocator(Arc::clone(&kv), "10.0.0.11");
        let first = alloc.ensure_claimed().await.unwrap();
        let second = alloc.ensure_claimed().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_out_of_range_record_is_reclaimed() {
        let kv = Arc::new(MockKvStore::new());
        kv.put("autowire/wg0/nodes/10.0.0.11/ip", b"192.168.200.200").await.unwrap();
        kv.put("autowire/wg0/nodes/10.0.0.11/pubKey", b"stale-key").await.unwrap();
        kv.put("autowire/wg0/nodes/10.0.0.11/port", b"51820").await.unwrap();

        // narrower range than the stale record: .0/25 excludes .200
        let alloc = Allocator::new(
            Arc::clone(&kv),
            "autowire/wg0".to_string(),
            "192.168.200.0/25".parse().unwrap(),
            51820,
            "fresh-key".to_string(),
            "10.0.0.11".parse().unwrap(),
        );

        let record = alloc.ensure_claimed().await.unwrap();
        assert!(alloc.in_allocatable_range(record.overlay_ip));
        assert_eq!(record.public_key, "fresh-key");
    }
}
