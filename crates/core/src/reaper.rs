//! Reaper: deletes Node Records for hosts absent from the cluster catalog,
//! serialized across the fleet behind the singleton reaper lock (spec §4.8).

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use autowired_consul::{ConsulError, KvStore};
use autowired_primitives::AppliedPeer;

pub struct Reaper {
    kv: Arc<dyn KvStore>,
    kv_root: String,
}

impl Reaper {
    pub fn new(kv: Arc<dyn KvStore>, kv_root: String) -> Self {
        Self { kv, kv_root }
    }

    /// Deletes `nodes/P/` for every `P` present in `peers` but absent from
    /// `catalog`. Only called when the local host holds `monitor-nodes-lock`
    /// (spec §4.8); enforcing that is the multiplexer's job, not this one's.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn reap(
        &self,
        peers: &HashMap<IpAddr, AppliedPeer>,
        catalog: &HashMap<IpAddr, String>,
    ) -> Result<(), ConsulError> {
        for phys_ip in peers.keys() {
            if catalog.contains_key(phys_ip) {
                continue;
            }
            let prefix = format!("{}/nodes/{}/", self.kv_root, phys_ip);
            self.kv.delete_tree(&prefix).await?;
            tracing::info!(%phys_ip, "reaped departed host's node record");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_consul::{mock::MockKvStore, KvStore as _, QueryOptions};
    use autowired_primitives::NodeRecord;

    #[tokio::test(flavor = "multi_thread")]
    async fn deletes_node_record_absent_from_catalog() {
        let kv = Arc::new(MockKvStore::new());
        kv.put("autowire/wg0/nodes/10.0.0.12/ip", b"192.168.200.2").await.unwrap();
        kv.put("autowire/wg0/nodes/10.0.0.12/pubKey", b"pub-b").await.unwrap();

        let reaper = Reaper::new(kv.clone(), "autowire/wg0".to_string());

        let mut peers = HashMap::new();
        let record = NodeRecord::new("192.168.200.2".parse().unwrap(), "pub-b", 51820);
        let endpoint: IpAddr = "10.0.0.12".parse().unwrap();
        peers.insert(endpoint, autowired_primitives::DesiredPeer::from_node_record(endpoint, &record));

        reaper.reap(&peers, &HashMap::new()).await.unwrap();

        let (remaining, _) =
            kv.list("autowire/wg0/nodes/10.0.0.12/", QueryOptions::consistent()).await.unwrap();
        assert!(remaining.is_empty());
    }
}
