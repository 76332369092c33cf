//! Host Lightning node boundary
//!
//! The overlay never touches keys or channels itself; it consumes a narrow
//! set of host facts (custom-message transport, HSM sign/verify, channel and
//! graph enumeration, forward and presence notifications) through the
//! [`HostNode`] trait. Tests substitute fakes; `hived` wires up the unix
//! adapter speaking newline-delimited JSON to the host-side shim.
//!
//! The host RPC socket is one shared resource. Every call funnels through
//! [`RpcGateway`], which serialises access behind a global lock with a
//! bounded acquisition timeout; a caller that cannot acquire in time fails
//! loudly instead of queueing forever.

use crate::error::{HiveError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// One local channel as the host reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalChannel {
    pub peer: NodeId,
    pub capacity_sat: u64,
    pub our_funds_sat: u64,
    pub fee_ppm: u32,
    pub active: bool,
}

/// Asynchronous facts pushed by the host node.
#[derive(Debug, Clone)]
pub enum HostEvent {
    CustomMsg { sender: NodeId, payload: Vec<u8> },
    Forward {
        in_peer: Option<NodeId>,
        out_peer: Option<NodeId>,
        in_msat: u64,
        out_msat: u64,
        timestamp: u64,
    },
    PeerConnected { peer: NodeId, timestamp: u64 },
    PeerDisconnected { peer: NodeId, timestamp: u64 },
}

#[async_trait]
pub trait HostNode: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Deliver a framed control message to a peer over the host's
    /// custom-message channel.
    async fn send_custom_msg(&self, peer: &NodeId, payload: &[u8]) -> Result<()>;

    /// HSM signature over an arbitrary byte string with this node's key.
    async fn sign_message(&self, message: &str) -> Result<String>;

    /// Verify a signature against a given pubkey via the host.
    async fn verify_message(&self, pubkey: &NodeId, message: &str, signature: &str) -> Result<bool>;

    async fn list_channels(&self) -> Result<Vec<LocalChannel>>;

    /// Confirmed on-chain balance available for opens.
    async fn onchain_sat(&self) -> Result<u64>;

    /// Total public capacity of a node across the graph.
    async fn node_capacity(&self, node: &NodeId) -> Result<u64>;

    /// Public capacity on channels between two specific nodes. Caps what
    /// gossip may claim about that pair.
    async fn pair_capacity(&self, a: &NodeId, b: &NodeId) -> Result<u64>;

    /// Oldest public sighting of a node, if the graph knows it.
    async fn node_first_seen(&self, node: &NodeId) -> Result<Option<u64>>;
}

// =============================================================================
// GATEWAY
// =============================================================================

pub struct RpcGateway {
    inner: Arc<dyn HostNode>,
    local_id: NodeId,
    lock: Mutex<()>,
    lock_timeout: Duration,
    call_timeout: Duration,
}

impl RpcGateway {
    pub fn new(inner: Arc<dyn HostNode>, lock_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            local_id: inner.local_id(),
            inner,
            lock: Mutex::new(()),
            lock_timeout,
            call_timeout,
        }
    }

    async fn guard(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::time::timeout(self.lock_timeout, self.lock.lock())
            .await
            .map_err(|_| HiveError::Timeout("host rpc lock"))
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| HiveError::Timeout("host rpc call"))?
    }
}

#[async_trait]
impl HostNode for RpcGateway {
    fn local_id(&self) -> NodeId {
        self.local_id
    }

    async fn send_custom_msg(&self, peer: &NodeId, payload: &[u8]) -> Result<()> {
        let _g = self.guard().await?;
        self.bounded(self.inner.send_custom_msg(peer, payload)).await
    }

    async fn sign_message(&self, message: &str) -> Result<String> {
        let _g = self.guard().await?;
        self.bounded(self.inner.sign_message(message)).await
    }

    async fn verify_message(&self, pubkey: &NodeId, message: &str, signature: &str) -> Result<bool> {
        let _g = self.guard().await?;
        self.bounded(self.inner.verify_message(pubkey, message, signature)).await
    }

    async fn list_channels(&self) -> Result<Vec<LocalChannel>> {
        let _g = self.guard().await?;
        self.bounded(self.inner.list_channels()).await
    }

    async fn onchain_sat(&self) -> Result<u64> {
        let _g = self.guard().await?;
        self.bounded(self.inner.onchain_sat()).await
    }

    async fn node_capacity(&self, node: &NodeId) -> Result<u64> {
        let _g = self.guard().await?;
        self.bounded(self.inner.node_capacity(node)).await
    }

    async fn pair_capacity(&self, a: &NodeId, b: &NodeId) -> Result<u64> {
        let _g = self.guard().await?;
        self.bounded(self.inner.pair_capacity(a, b)).await
    }

    async fn node_first_seen(&self, node: &NodeId) -> Result<Option<u64>> {
        let _g = self.guard().await?;
        self.bounded(self.inner.node_first_seen(node)).await
    }
}

// =============================================================================
// UNIX ADAPTER
// =============================================================================

#[derive(Debug, Deserialize)]
struct AdapterResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterEvent {
    event: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// Host adapter over a unix socket: requests go out as JSON lines, responses
/// and event notifications come back the same way.
pub struct UnixHostNode {
    local_id: std::sync::OnceLock<NodeId>,
    writer: Mutex<tokio::net::unix::OwnedWriteHalf>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<AdapterResponse>>>>,
    next_id: AtomicU64,
}

impl UnixHostNode {
    /// Connect, learn the host's node id, and start pumping events into
    /// `events`.
    pub async fn connect(
        path: &std::path::Path,
        events: mpsc::Sender<HostEvent>,
    ) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| HiveError::Rpc(format!("host socket {}: {e}", path.display())))?;
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<AdapterResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let node = Arc::new(Self {
            local_id: std::sync::OnceLock::new(),
            writer: Mutex::new(write_half),
            pending: pending.clone(),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(Self::pump(read_half, pending, events));

        let getinfo = node.call("getinfo", json!({})).await?;
        let id_hex = getinfo
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HiveError::Rpc("getinfo: missing id".into()))?;
        let _ = node.local_id.set(NodeId::from_hex(id_hex)?);
        Ok(node)
    }

    async fn pump(
        read_half: tokio::net::unix::OwnedReadHalf,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<AdapterResponse>>>>,
        events: mpsc::Sender<HostEvent>,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Ok(resp) = serde_json::from_str::<AdapterResponse>(&line) {
                if let Some(tx) = pending.lock().await.remove(&resp.id) {
                    let _ = tx.send(resp);
                }
                continue;
            }
            match serde_json::from_str::<AdapterEvent>(&line) {
                Ok(ev) => {
                    if let Some(event) = parse_event(&ev) {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    } else {
                        debug!("ignoring host event {}", ev.event);
                    }
                }
                Err(e) => debug!("unparseable host line: {e}"),
            }
        }
        warn!("host adapter stream closed");
    }

    pub(crate) async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&json!({"id": id, "method": method, "params": params}))?;
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| HiveError::Rpc(format!("{method}: {e}")))?;
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| HiveError::Rpc(format!("{method}: {e}")))?;
        }

        let resp = rx
            .await
            .map_err(|_| HiveError::Rpc(format!("{method}: adapter dropped")))?;
        if let Some(err) = resp.error {
            return Err(HiveError::Rpc(format!("{method}: {err}")));
        }
        resp.result
            .ok_or_else(|| HiveError::Rpc(format!("{method}: empty result")))
    }
}

fn parse_node_id(v: &serde_json::Value) -> Option<NodeId> {
    v.as_str().and_then(|s| NodeId::from_hex(s).ok())
}

fn parse_event(ev: &AdapterEvent) -> Option<HostEvent> {
    let p = &ev.params;
    match ev.event.as_str() {
        "custommsg" => Some(HostEvent::CustomMsg {
            sender: parse_node_id(p.get("peer_id")?)?,
            payload: hex::decode(p.get("payload")?.as_str()?).ok()?,
        }),
        "forward_event" => Some(HostEvent::Forward {
            in_peer: p.get("in_peer").and_then(parse_node_id),
            out_peer: p.get("out_peer").and_then(parse_node_id),
            in_msat: p.get("in_msat").and_then(|v| v.as_u64()).unwrap_or(0),
            out_msat: p.get("out_msat").and_then(|v| v.as_u64()).unwrap_or(0),
            timestamp: p.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        "connect" => Some(HostEvent::PeerConnected {
            peer: parse_node_id(p.get("id")?)?,
            timestamp: p.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        "disconnect" => Some(HostEvent::PeerDisconnected {
            peer: parse_node_id(p.get("id")?)?,
            timestamp: p.get("timestamp").and_then(|v| v.as_u64()).unwrap_or(0),
        }),
        _ => None,
    }
}

#[async_trait]
impl HostNode for UnixHostNode {
    fn local_id(&self) -> NodeId {
        // Set once during connect, before the handle is handed out.
        self.local_id.get().copied().unwrap_or(NodeId([0; 33]))
    }

    async fn send_custom_msg(&self, peer: &NodeId, payload: &[u8]) -> Result<()> {
        self.call(
            "sendcustommsg",
            json!({"node_id": peer.to_string(), "msg": hex::encode(payload)}),
        )
        .await?;
        Ok(())
    }

    async fn sign_message(&self, message: &str) -> Result<String> {
        let result = self.call("signmessage", json!({"message": message})).await?;
        result
            .get("signature")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| HiveError::Rpc("signmessage: missing signature".into()))
    }

    async fn verify_message(&self, pubkey: &NodeId, message: &str, signature: &str) -> Result<bool> {
        let result = self
            .call(
                "checkmessage",
                json!({"pubkey": pubkey.to_string(), "message": message, "signature": signature}),
            )
            .await?;
        Ok(result.get("verified").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    async fn list_channels(&self) -> Result<Vec<LocalChannel>> {
        let result = self.call("listpeerchannels", json!({})).await?;
        let rows = result
            .get("channels")
            .and_then(|v| v.as_array())
            .ok_or_else(|| HiveError::Rpc("listpeerchannels: missing channels".into()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(peer) = row.get("peer_id").and_then(parse_node_id) else {
                continue;
            };
            out.push(LocalChannel {
                peer,
                capacity_sat: row.get("capacity_sat").and_then(|v| v.as_u64()).unwrap_or(0),
                our_funds_sat: row.get("our_funds_sat").and_then(|v| v.as_u64()).unwrap_or(0),
                fee_ppm: row.get("fee_ppm").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                active: row.get("active").and_then(|v| v.as_bool()).unwrap_or(false),
            });
        }
        Ok(out)
    }

    async fn onchain_sat(&self) -> Result<u64> {
        let result = self.call("listfunds", json!({})).await?;
        Ok(result.get("onchain_sat").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    async fn node_capacity(&self, node: &NodeId) -> Result<u64> {
        let result = self
            .call("nodecapacity", json!({"node_id": node.to_string()}))
            .await?;
        Ok(result.get("capacity_sat").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    async fn pair_capacity(&self, a: &NodeId, b: &NodeId) -> Result<u64> {
        let result = self
            .call(
                "paircapacity",
                json!({"a": a.to_string(), "b": b.to_string()}),
            )
            .await?;
        Ok(result.get("capacity_sat").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    async fn node_first_seen(&self, node: &NodeId) -> Result<Option<u64>> {
        let result = self
            .call("nodeinfo", json!({"node_id": node.to_string()}))
            .await?;
        Ok(result.get("first_seen").and_then(|v| v.as_u64()))
    }
}

// =============================================================================
// EXECUTOR CLIENT
// =============================================================================

/// The co-resident fee/rebalance subsystem and the external channel manager
/// are reached through the same host-side shim, under their own method
/// namespace. Response schemas are validated here; anything malformed
/// surfaces as an error and counts against the bridge's circuit breaker.
pub struct ExecutorRpc {
    adapter: Arc<UnixHostNode>,
}

impl ExecutorRpc {
    pub fn new(adapter: Arc<UnixHostNode>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl crate::bridge::ExecutorClient for ExecutorRpc {
    async fn status(&self) -> Result<crate::bridge::ExecutorStatus> {
        let result = self.adapter.call("executor-status", json!({})).await?;
        serde_json::from_value(result)
            .map_err(|e| HiveError::Malformed(format!("executor status: {e}")))
    }

    async fn set_policy(&self, peer: &NodeId, kind: crate::bridge::PolicyKind) -> Result<()> {
        self.adapter
            .call(
                "executor-setpolicy",
                json!({"peer": peer.to_string(), "policy": kind}),
            )
            .await?;
        Ok(())
    }

    async fn trigger_rebalance(&self, target: &NodeId, amount_sat: u64) -> Result<()> {
        self.adapter
            .call(
                "executor-rebalance",
                json!({"target": target.to_string(), "amount_sat": amount_sat}),
            )
            .await?;
        Ok(())
    }

    async fn inhibit_opens(&self, peer: &NodeId) -> Result<()> {
        self.adapter
            .call("chanmgr-inhibit", json!({"peer": peer.to_string()}))
            .await?;
        Ok(())
    }

    async fn release_inhibit(&self, peer: &NodeId) -> Result<()> {
        self.adapter
            .call("chanmgr-release", json!({"peer": peer.to_string()}))
            .await?;
        Ok(())
    }

    async fn open_channel(&self, peer: &NodeId, amount_sat: u64) -> Result<()> {
        self.adapter
            .call(
                "chanmgr-open",
                json!({"peer": peer.to_string(), "amount_sat": amount_sat}),
            )
            .await?;
        Ok(())
    }
}
