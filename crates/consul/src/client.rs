//! Consul HTTP API client (spec §6: "KV client ... Represented as the
//! `KvStore` trait, with a Consul HTTP API implementation over `reqwest`").
//!
//! Talks directly to `/v1/kv`, `/v1/txn`, `/v1/session`, and
//! `/v1/catalog/nodes`; no Consul client crate is pulled in (none in this
//! workspace's dependency stack has Rust bindings worth trusting), so this
//! is a deliberately thin, spec-scoped surface rather than a general client.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::{
    lock::LockBackend, CatalogNode, ConsulError, KvPair, KvStore, QueryMeta, QueryOptions, SessionLock, TxnOp,
};

const INDEX_HEADER: &str = "X-Consul-Index";
/// Consul's own blocking-query cap; we never ask for longer than this.
const MAX_WAIT: &str = "5m";

#[derive(Debug, Clone)]
pub struct HttpConsulClient {
    http: Client,
    base: Url,
}

impl HttpConsulClient {
    pub fn new(base: Url) -> Self {
        Self { http: Client::new(), base }
    }

    fn url(&self, path: &str) -> Result<Url, ConsulError> {
        self.base
            .join(path)
            .map_err(|error| ConsulError::Protocol(format!("invalid path {path:?}: {error}")))
    }

    fn list_query(opts: QueryOptions) -> Vec<(&'static str, String)> {
        let mut query = vec![("recurse", String::new())];
        if opts.consistent {
            query.push(("consistent", String::new()));
        }
        if opts.wait_index > 0 {
            query.push(("index", opts.wait_index.to_string()));
            query.push(("wait", MAX_WAIT.to_string()));
        }
        query
    }

    fn index_of(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCatalogNode {
    #[serde(rename = "Node")]
    node: String,
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[async_trait]
impl KvStore for HttpConsulClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ConsulError> {
        let url = self.url(&format!("v1/kv/{key}"))?;
        let response = self.http.get(url).query(&[("raw", "")]).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ConsulError> {
        let url = self.url(&format!("v1/kv/{key}"))?;
        self.http.put(url).body(value.to_vec()).send().await?.error_for_status()?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self, prefix: &str, opts: QueryOptions) -> Result<(Vec<KvPair>, QueryMeta), ConsulError> {
        let url = self.url(&format!("v1/kv/{prefix}"))?;
        let response = self.http.get(url).query(&Self::list_query(opts)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), QueryMeta::default()));
        }
        let response = response.error_for_status()?;
        let last_index = Self::index_of(&response);

        let entries: Vec<RawKvEntry> = response.json().await?;
        let pairs = entries
            .into_iter()
            .map(|entry| {
                let value = entry
                    .value
                    .map(|encoded| STANDARD.decode(encoded))
                    .transpose()
                    .map_err(|error| ConsulError::Protocol(format!("bad base64 value: {error}")))?
                    .unwrap_or_default();
                Ok(KvPair { key: entry.key, value })
            })
            .collect::<Result<Vec<_>, ConsulError>>()?;

        Ok((pairs, QueryMeta { last_index }))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_tree(&self, prefix: &str) -> Result<(), ConsulError> {
        let url = self.url(&format!("v1/kv/{prefix}"))?;
        self.http.delete(url).query(&[("recurse", "")]).send().await?.error_for_status()?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, ops))]
    async fn txn(&self, ops: Vec<TxnOp>) -> Result<bool, ConsulError> {
        let body: Vec<_> = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Put { key, value } => serde_json::json!({
                    "KV": {
                        "Verb": "set",
                        "Key": key,
                        "Value": STANDARD.encode(value),
                    }
                }),
            })
            .collect();

        let url = self.url("v1/txn")?;
        let response = self.http.put(url).json(&body).send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            status => Err(ConsulError::Protocol(format!("unexpected txn status {status}"))),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<SessionLock, ConsulError> {
        let session_id = self.create_session(ttl).await?;

        let url = self.url(&format!("v1/kv/{key}"))?;
        let acquired: bool = self
            .http
            .put(url)
            .query(&[("acquire", session_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !acquired {
            self.destroy_session(&session_id).await?;
            return Err(ConsulError::LockContention { key: key.to_string() });
        }

        let backend: Arc<dyn LockBackend> = Arc::new(self.clone());
        Ok(SessionLock::new(key.to_string(), session_id, ttl, backend))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn catalog_nodes(&self, opts: QueryOptions) -> Result<(Vec<CatalogNode>, QueryMeta), ConsulError> {
        let url = self.url("v1/catalog/nodes")?;
        let mut query = Vec::new();
        if opts.wait_index > 0 {
            query.push(("index", opts.wait_index.to_string()));
            query.push(("wait", MAX_WAIT.to_string()));
        }

        let response = self.http.get(url).query(&query).send().await?.error_for_status()?;
        let last_index = Self::index_of(&response);
        let nodes: Vec<RawCatalogNode> = response.json().await?;

        Ok((
            nodes.into_iter().map(|n| CatalogNode { node: n.node, address: n.address }).collect(),
            QueryMeta { last_index },
        ))
    }
}

impl HttpConsulClient {
    async fn create_session(&self, ttl: Duration) -> Result<String, ConsulError> {
        let url = self.url("v1/session/create")?;
        let body = serde_json::json!({
            "TTL": format!("{}s", ttl.as_secs().max(1)),
            "Behavior": "release",
        });
        let response: SessionCreateResponse =
            self.http.put(url).json(&body).send().await?.error_for_status()?.json().await?;
        Ok(response.id)
    }
}

#[async_trait]
impl LockBackend for HttpConsulClient {
    async fn renew_session(&self, session_id: &str) -> Result<(), ConsulError> {
        let url = self.url(&format!("v1/session/renew/{session_id}"))?;
        let response = self.http.put(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ConsulError::SessionExpired(session_id.to_string()));
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn release_lock(&self, key: &str, session_id: &str) -> Result<(), ConsulError> {
        let url = self.url(&format!("v1/kv/{key}"))?;
        self.http.put(url).query(&[("release", session_id)]).send().await?.error_for_status()?;
        Ok(())
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), ConsulError> {
        let url = self.url(&format!("v1/session/destroy/{session_id}"))?;
        self.http.put(url).send().await?.error_for_status()?;
        Ok(())
    }
}
