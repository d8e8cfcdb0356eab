//! Peer Watcher: long-polls the `nodes/` subtree and emits a full Desired
//! Peer Set snapshot on every change (spec §4.5).

use std::{collections::HashMap, net::IpAddr, sync::Arc, time::Duration};

use autowired_consul::{ConsulError, KvPair, KvStore, QueryOptions};
use autowired_primitives::{DesiredPeer, NodeRecord, FIELD_IP, FIELD_PORT, FIELD_PUBKEY};
use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct PeerWatcher {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl PeerWatcher {
    pub fn new(kv: Arc<dyn KvStore>, kv_root: &str) -> Self {
        Self { kv, prefix: format!("{kv_root}/nodes/") }
    }

    /// Runs until `cancel` fires or the receiving end is dropped. Each
    /// iteration is one long-poll call; a transport error is retried with
    /// capped exponential backoff rather than ending the task (spec §4.5
    /// step 5, §9).
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(self, tx: mpsc::Sender<HashMap<IpAddr, DesiredPeer>>, cancel: CancellationToken) {
        let mut wait_index = 0u64;
        let mut backoff = watcher_backoff();

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.kv.list(&self.prefix, QueryOptions::long_poll(wait_index)) => outcome,
            };

            match outcome {
                Ok((pairs, meta)) => {
                    backoff.reset();
                    wait_index = meta.last_index;
                    let desired = fold_desired(&self.prefix, &pairs);
                    if tx.send(desired).await.is_err() {
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

pub(crate) fn watcher_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Sleeps for the next backoff interval, honoring cancellation. Returns
/// `false` if cancellation fired first (caller should stop).
pub(crate) async fn sleep_or_cancelled(
    backoff: &mut ExponentialBackoff,
    cancel: &CancellationToken,
    error: &ConsulError,
) -> bool {
    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
    tracing::warn!(%error, ?delay, "KV transport error, retrying watcher");
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn fold_desired(prefix: &str, pairs: &[KvPair]) -> HashMap<IpAddr, DesiredPeer> {
    #[derive(Default)]
    struct Fields {
        ip: Option<std::net::Ipv4Addr>,
        pubkey: Option<String>,
        port: Option<u16>,
    }

    let mut raw: HashMap<IpAddr, Fields> = HashMap::new();

    for pair in pairs {
        let Some(rest) = pair.key.strip_prefix(prefix) else { continue };
        let Some((phys_ip_str, field)) = rest.split_once('/') else { continue };
        let Ok(endpoint) = phys_ip_str.parse::<IpAddr>() else { continue };
        let Ok(value) = std::str::from_utf8(&pair.value) else { continue };

        let entry = raw.entry(endpoint).or_default();
        match field {
            FIELD_IP => entry.ip = value.parse().ok(),
            FIELD_PUBKEY => entry.pubkey = Some(value.to_string()),
            FIELD_PORT => entry.port = value.parse().ok(),
            _ => {}
        }
    }

    raw.into_iter()
        .filter_map(|(endpoint, fields)| {
            let record = NodeRecord::new(fields.ip?, fields.pubkey?, fields.port?);
            Some((endpoint, DesiredPeer::from_node_record(endpoint, &record)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use autowired_consul::mock::MockKvStore;

    #[tokio::test(flavor = "multi_thread")]
    async fn emits_a_snapshot_on_every_write() {
        let kv = Arc::new(MockKvStore::new());
        // tokio's mpsc requires buffer >= 1; this is the closest stand-in for
        // the spec's capacity-0 rendezvous channel (spec §4.5, §5).
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let watcher = PeerWatcher::new(kv.clone(), "autowire/wg0");
        let handle = tokio::spawn(watcher.run(tx, cancel.clone()));

        kv.put("autowire/wg0/nodes/10.0.0.11/ip", b"192.168.200.1").await.unwrap();
        kv.put("autowire/wg0/nodes/10.0.0.11/pubKey", b"pub-a").await.unwrap();
        kv.put("autowire/wg0/nodes/10.0.0.11/port", b"51820").await.unwrap();

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        let peer = &snapshot[&"10.0.0.11".parse::<IpAddr>().unwrap()];
        assert_eq!(peer.public_key, "pub-a");

        cancel.cancel();
        handle.await.unwrap();
    }
}
