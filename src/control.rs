//! Management surface: JSON-line commands over a unix socket
//!
//! The permission matrix is tier-based. Admin-like operations (initiate,
//! invite, ban proposals, governance mode, approvals) require the local node
//! to be the hive initiator; voting operations require full membership;
//! introspection is open to any tier.

use crate::dispatcher::Dispatcher;
use crate::error::{HiveError, Result};
use crate::governance::Mode;
use crate::handshake::{initiate_hive, issue_invite};
use crate::loops::ShutdownRx;
use crate::store::Role;
use crate::types::{unix_now, IntentKind, NodeId, RequestId, Tier};
use crate::wire::{InviteTicket, IntentPayload, Message, PromotionRequestPayload};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Initiate,
    Invite { pubkey: String, valid_hours: u64 },
    Join { peer: String, #[serde(default)] ticket: Option<InviteTicket> },
    Status,
    Members,
    Pending,
    Approve { id: u64 },
    Reject { id: u64 },
    SetMode { mode: String },
    RequestPromotion,
    Vouch { subject: String, request_id: String },
    ProposeBan { pubkey: String, reason: String },
    Topology,
    PlannerLog { #[serde(default)] limit: Option<usize> },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    pub detail: serde_json::Value,
}

impl Reply {
    fn ok(detail: serde_json::Value) -> Self {
        Self { ok: true, detail }
    }

    fn err(e: impl std::fmt::Display) -> Self {
        Self { ok: false, detail: json!({ "error": e.to_string() }) }
    }
}

pub struct ControlServer {
    dispatcher: Arc<Dispatcher>,
}

impl ControlServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn serve(self: Arc<Self>, path: &std::path::Path, mut shutdown: ShutdownRx) -> Result<()> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| HiveError::Invariant(format!("control socket {}: {e}", path.display())))?;
        info!("control surface listening on {}", path.display());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_conn(stream).await {
                                    debug!("control connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("control accept failed: {e}"),
                    }
                }
            }
        }
        info!("control surface stopped");
        Ok(())
    }

    async fn handle_conn(&self, stream: UnixStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match serde_json::from_str::<Command>(&line) {
                Ok(cmd) => self.handle_command(cmd).await,
                Err(e) => Reply::err(format!("bad command: {e}")),
            };
            let mut raw = serde_json::to_vec(&reply)?;
            raw.push(b'\n');
            write_half
                .write_all(&raw)
                .await
                .map_err(|e| HiveError::Rpc(format!("control write: {e}")))?;
        }
        Ok(())
    }

    fn require_admin(&self) -> Result<()> {
        if self.dispatcher.store.role()? != Role::Admin {
            return Err(HiveError::Unauthorised("admin command on non-admin node".into()));
        }
        Ok(())
    }

    fn require_member(&self) -> Result<()> {
        let local = self.dispatcher.host.local_id();
        match self.dispatcher.store.member(&local)? {
            Some(m) if m.is_active() && m.tier == Tier::Member => Ok(()),
            _ => Err(HiveError::Unauthorised("voting command requires full membership".into())),
        }
    }

    pub async fn handle_command(&self, cmd: Command) -> Reply {
        match self.dispatch_command(cmd).await {
            Ok(reply) => reply,
            Err(e) => Reply::err(e),
        }
    }

    async fn dispatch_command(&self, cmd: Command) -> Result<Reply> {
        let d = &self.dispatcher;
        let now = unix_now();
        match cmd {
            Command::Initiate => {
                let hive_id = initiate_hive(&d.store, d.host.local_id())?;
                Ok(Reply::ok(json!({ "hive_id": hive_id })))
            }
            Command::Invite { pubkey, valid_hours } => {
                self.require_admin()?;
                let candidate = NodeId::from_hex(&pubkey)?;
                let ticket =
                    issue_invite(&d.store, d.host.as_ref(), candidate, valid_hours, now).await?;
                Ok(Reply::ok(serde_json::to_value(&ticket)?))
            }
            Command::Join { peer, ticket } => {
                let peer = NodeId::from_hex(&peer)?;
                let hello = d.handshake.hello(d.host.local_id(), ticket);
                d.send(&peer, &hello).await;
                Ok(Reply::ok(json!({ "sent_hello_to": peer.to_string() })))
            }
            Command::Status => {
                let members = d.store.active_members()?;
                let pending = d
                    .store
                    .actions()?
                    .iter()
                    .filter(|a| a.status == crate::types::ActionStatus::Pending)
                    .count();
                Ok(Reply::ok(json!({
                    "hive_id": d.store.hive_id()?,
                    "role": if d.store.role()? == Role::Admin { "admin" } else { "regular" },
                    "mode": d.governance.mode().name(),
                    "members": members.len(),
                    "bridge": d.bridge.state().name(),
                    "bridge_disabled": d.bridge.is_disabled(),
                    "pending_actions": pending,
                    "remote_intents": d.intents.remote_len(),
                })))
            }
            Command::Members => {
                let rows: Vec<_> = d
                    .store
                    .members()?
                    .iter()
                    .map(|m| {
                        json!({
                            "pubkey": m.pubkey.to_string(),
                            "tier": m.tier.to_string(),
                            "joined_at": m.joined_at,
                            "last_seen": m.last_seen,
                            "banned": m.banned,
                        })
                    })
                    .collect();
                Ok(Reply::ok(json!({ "members": rows })))
            }
            Command::Pending => {
                let rows: Vec<_> = d
                    .store
                    .actions()?
                    .iter()
                    .map(|a| serde_json::to_value(a).unwrap_or_default())
                    .collect();
                Ok(Reply::ok(json!({ "actions": rows })))
            }
            Command::Approve { id } => {
                self.require_admin()?;
                let action = d.governance.approve(id, now).await?;
                Ok(Reply::ok(serde_json::to_value(&action)?))
            }
            Command::Reject { id } => {
                self.require_admin()?;
                let action = d.governance.reject(id)?;
                Ok(Reply::ok(serde_json::to_value(&action)?))
            }
            Command::SetMode { mode } => {
                self.require_admin()?;
                let mode = Mode::parse(&mode)
                    .ok_or_else(|| HiveError::Malformed(format!("unknown mode {mode:?}")))?;
                d.governance.set_mode(mode)?;
                Ok(Reply::ok(json!({ "mode": mode.name() })))
            }
            Command::RequestPromotion => {
                let payload = d.membership.request_promotion(d.host.local_id(), now)?;
                d.broadcast(&Message::PromotionRequest(payload.clone())).await;
                Ok(Reply::ok(json!({ "request_id": payload.request_id.to_string() })))
            }
            Command::Vouch { subject, request_id } => {
                self.require_member()?;
                let subject = NodeId::from_hex(&subject)?;
                let request_id = RequestId::from_hex(&request_id)?;
                let payload = PromotionRequestPayload { subject, request_id, timestamp: now };
                match d
                    .membership
                    .on_promotion_request(d.host.as_ref(), &subject, &payload, now)
                    .await?
                {
                    Some(vouch) => {
                        d.broadcast(&vouch).await;
                        Ok(Reply::ok(json!({ "vouched": true })))
                    }
                    None => Ok(Reply::ok(json!({ "vouched": false, "reason": "criteria not met" }))),
                }
            }
            Command::ProposeBan { pubkey, reason } => {
                self.require_admin()?;
                let target = NodeId::from_hex(&pubkey)?;
                match d.intents.announce(IntentKind::BanPeer, target, 0, d.host.local_id(), now)? {
                    Some(intent) => {
                        d.broadcast(&Message::Intent(IntentPayload {
                            kind: intent.kind,
                            target: intent.target,
                            initiator: intent.initiator,
                            amount_sat: intent.amount_sat,
                            timestamp: intent.timestamp,
                            expires_at: intent.expires_at,
                        }))
                        .await;
                        Ok(Reply::ok(json!({ "announced": true, "reason": reason })))
                    }
                    None => Ok(Reply::ok(json!({ "announced": false, "reason": "already pending" }))),
                }
            }
            Command::Topology => {
                let mut rows = Vec::new();
                for member in d.store.voting_members()? {
                    let peers: Vec<String> = d
                        .store
                        .peer_state_of(&member.pubkey)?
                        .map(|s| s.channels.iter().map(|c| c.peer.to_string()).collect())
                        .unwrap_or_default();
                    rows.push(json!({ "member": member.pubkey.to_string(), "peers": peers }));
                }
                Ok(Reply::ok(json!({
                    "topology": rows,
                    "inhibited": d
                        .store
                        .inhibited_peers()?
                        .iter()
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>(),
                })))
            }
            Command::PlannerLog { limit } => {
                let rows: Vec<_> = d
                    .store
                    .planner_entries(limit.unwrap_or(50))?
                    .iter()
                    .map(|e| {
                        json!({
                            "timestamp": e.timestamp,
                            "decision": e.decision,
                            "target": e.target.to_string(),
                            "outcome": e.outcome,
                        })
                    })
                    .collect();
                Ok(Reply::ok(json!({ "entries": rows })))
            }
        }
    }
}
