//! Top-level receive loop: magic gate → decode → membership gate → handler
//!
//! The dispatcher owns no durable state of its own; it verifies provenance
//! and routes. A frame without the hive magic tag is handed back to the host
//! untouched (`Disposition::Continue`). Everything else is consumed here:
//! malformed, oversize or unauthorised traffic is dropped with the logging
//! policy of its error kind, and never fails the connection.

use crate::bridge::Bridge;
use crate::config::HiveConfig;
use crate::contribution::Ledger;
use crate::error::HiveError;
use crate::governance::Governance;
use crate::handshake::{Admission, Handshake};
use crate::intent::{IntentManager, TieBreak};
use crate::membership::Membership;
use crate::node::{HostEvent, HostNode};
use crate::planner::Planner;
use crate::state::{GossipOutcome, StateManager};
use crate::store::Store;
use crate::rate_limit::WarnLimiter;
use crate::types::{unix_now, NodeId};
use crate::wire::{
    has_magic, BanPayload, GossipPayload, Message, StateHashPayload,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What the host should do with the raw event after we saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not ours: give the frame back to the host unchanged.
    Continue,
    /// Consumed (possibly by dropping it).
    Handled,
}

pub struct Dispatcher {
    pub store: Arc<Store>,
    pub cfg: Arc<HiveConfig>,
    pub host: Arc<dyn HostNode>,
    pub state: Arc<StateManager>,
    pub intents: Arc<IntentManager>,
    pub membership: Arc<Membership>,
    pub ledger: Arc<Ledger>,
    pub governance: Arc<Governance>,
    pub handshake: Arc<Handshake>,
    pub planner: Arc<Planner>,
    pub bridge: Arc<Bridge>,
    oversize_warn: Mutex<WarnLimiter>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        cfg: Arc<HiveConfig>,
        host: Arc<dyn HostNode>,
        state: Arc<StateManager>,
        intents: Arc<IntentManager>,
        membership: Arc<Membership>,
        ledger: Arc<Ledger>,
        governance: Arc<Governance>,
        handshake: Arc<Handshake>,
        planner: Arc<Planner>,
        bridge: Arc<Bridge>,
    ) -> Self {
        Self {
            store,
            cfg,
            host,
            state,
            intents,
            membership,
            ledger,
            governance,
            handshake,
            planner,
            bridge,
            oversize_warn: Mutex::new(WarnLimiter::default()),
        }
    }

    pub async fn on_host_event(&self, event: HostEvent) -> Disposition {
        let now = unix_now();
        match event {
            HostEvent::CustomMsg { sender, payload } => {
                self.handle_custom_msg(&sender, &payload, now).await
            }
            HostEvent::Forward { in_peer, out_peer, in_msat, out_msat, timestamp } => {
                let ts = if timestamp == 0 { now } else { timestamp };
                if let Err(e) = self.ledger.on_forward(in_peer, out_peer, in_msat, out_msat, ts) {
                    warn!("forward accounting failed: {e}");
                }
                Disposition::Handled
            }
            HostEvent::PeerConnected { peer, timestamp } => {
                let ts = if timestamp == 0 { now } else { timestamp };
                if let Err(e) = self.membership.on_peer_connected(&peer, ts) {
                    warn!("presence accounting failed: {e}");
                }
                // Anti-entropy on each newly established member session.
                if self.is_active_member(&peer) {
                    self.send_state_hash(&peer).await;
                }
                Disposition::Handled
            }
            HostEvent::PeerDisconnected { peer, timestamp } => {
                let ts = if timestamp == 0 { now } else { timestamp };
                if let Err(e) = self.membership.on_peer_disconnected(&peer, ts) {
                    warn!("presence accounting failed: {e}");
                }
                Disposition::Handled
            }
        }
    }

    /// The receive path for raw custom-message bytes.
    pub async fn handle_custom_msg(&self, sender: &NodeId, payload: &[u8], now: u64) -> Disposition {
        // First test: the magic tag. Anything else belongs to the host.
        if !has_magic(payload) {
            return Disposition::Continue;
        }

        let msg = match Message::decode(payload) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("unknown hive message type from {}, dropped", sender.short());
                return Disposition::Handled;
            }
            Err(HiveError::RateLimited(what)) => {
                if self.oversize_warn.lock().expect("warn lock").allow() {
                    warn!("{what} from {}, dropped", sender.short());
                }
                return Disposition::Handled;
            }
            Err(e) => {
                debug!("undecodable frame from {}: {e}", sender.short());
                return Disposition::Handled;
            }
        };

        // Second test: membership. Only the admission handshake may come
        // from outside the member set.
        if !msg.allowed_pre_admission() && !self.is_active_member(sender) {
            debug!("{} from non-member {}, dropped", msg.command(), sender.short());
            return Disposition::Handled;
        }

        if let Err(e) = self.route(sender, msg, now).await {
            match e {
                HiveError::Malformed(m) => debug!("malformed from {}: {m}", sender.short()),
                HiveError::Unauthorised(m) => debug!("unauthorised from {}: {m}", sender.short()),
                HiveError::Stale(m) => debug!("stale from {}: {m}", sender.short()),
                HiveError::RateLimited(m) => {
                    if self.oversize_warn.lock().expect("warn lock").allow() {
                        warn!("rate limited {} from {}", m, sender.short());
                    }
                }
                HiveError::Conflict(m) => info!("{m}"),
                HiveError::Invariant(m) => {
                    tracing::error!("invariant while handling {}: {m}", sender.short())
                }
                other => warn!("handler error for {}: {other}", sender.short()),
            }
        }
        Disposition::Handled
    }

    fn is_active_member(&self, peer: &NodeId) -> bool {
        matches!(self.store.member(peer), Ok(Some(ref m)) if m.is_active())
    }

    async fn route(&self, sender: &NodeId, msg: Message, now: u64) -> crate::error::Result<()> {
        let _ = self.store.touch_member(sender, now);
        match msg {
            Message::Hello(hello) => {
                if let Some(challenge) = self.handshake.on_hello(sender, &hello, now)? {
                    self.send(sender, &challenge).await;
                }
                Ok(())
            }
            Message::Challenge(challenge) => {
                let attest = self.handshake.on_challenge(self.host.as_ref(), &challenge).await?;
                self.send(sender, &attest).await;
                Ok(())
            }
            Message::Attest(attest) => {
                match self.handshake.on_attest(self.host.as_ref(), sender, &attest, now).await? {
                    Admission::Admitted(tier) => {
                        let welcome = self.handshake.welcome(tier)?;
                        self.send(sender, &welcome).await;
                        // Fresh session: start anti-entropy right away.
                        self.send_state_hash(sender).await;
                    }
                    Admission::Rejected(_) => {}
                }
                Ok(())
            }
            Message::Welcome(welcome) => {
                self.handshake.on_welcome(sender, &welcome, now)?;
                self.send_state_hash(sender).await;
                Ok(())
            }
            Message::Gossip(gossip) => {
                match self.state.apply_gossip(sender, gossip.state, now)? {
                    GossipOutcome::SenderBehind => {
                        // Give the stale peer a chance to ask for a sync.
                        self.send_state_hash(sender).await;
                    }
                    GossipOutcome::Applied | GossipOutcome::Ignored => {}
                }
                Ok(())
            }
            Message::StateHash(remote) => {
                let ours = self.state.fleet_hash()?;
                if hex::encode(ours) != remote.fleet_hash {
                    debug!("fleet hash divergence with {}, sending full sync", sender.short());
                    let states = self.state.full_sync_states()?;
                    self.send(sender, &Message::FullSync(crate::wire::FullSyncPayload { states }))
                        .await;
                }
                Ok(())
            }
            Message::FullSync(sync) => {
                let (applied, ignored) = self.state.apply_full_sync(sender, sync.states, now)?;
                debug!("full sync from {}: {applied} applied, {ignored} ignored", sender.short());
                Ok(())
            }
            Message::Intent(intent) => {
                match self.intents.on_remote_intent(sender, &intent, self.host.local_id(), now)? {
                    TieBreak::LocalAborts => {
                        self.broadcast(&Message::IntentAbort(crate::wire::IntentAbortPayload {
                            kind: intent.kind,
                            target: intent.target,
                            initiator: self.host.local_id(),
                        }))
                        .await;
                        Err(HiveError::Conflict(format!(
                            "intent {} on {} lost tie-break",
                            intent.kind,
                            intent.target.short()
                        )))
                    }
                    _ => Ok(()),
                }
            }
            Message::IntentAbort(abort) => self.intents.on_remote_abort(sender, &abort),
            Message::Vouch(vouch) => {
                if let Some(promotion) =
                    self.membership.on_vouch(self.host.as_ref(), sender, &vouch, now).await?
                {
                    info!("broadcasting promotion proof");
                    self.broadcast(&promotion).await;
                }
                Ok(())
            }
            Message::PromotionRequest(request) => {
                if let Some(vouch) = self
                    .membership
                    .on_promotion_request(self.host.as_ref(), sender, &request, now)
                    .await?
                {
                    self.broadcast(&vouch).await;
                }
                Ok(())
            }
            Message::Promotion(promotion) => {
                self.membership
                    .on_promotion(self.host.as_ref(), sender, &promotion, now)
                    .await?;
                Ok(())
            }
            Message::Ban(ban) => self.handle_ban(sender, &ban, now).await,
        }
    }

    /// BAN announcements are honoured from the hive admin, or from a member
    /// whose matching ban_peer intent we have on record. Anything else is an
    /// attempt to evict a peer without due process.
    async fn handle_ban(&self, sender: &NodeId, ban: &BanPayload, now: u64) -> crate::error::Result<()> {
        let is_admin = self.store.admin_pubkey()? == Some(*sender);
        let has_intent = self.intents.knows_ban_intent(sender, &ban.subject)?;
        if !is_admin && !has_intent {
            return Err(HiveError::Unauthorised(format!(
                "ban of {} without authority",
                ban.subject.short()
            )));
        }
        if self.store.is_banned(&ban.subject)? {
            return Ok(());
        }
        self.store.ban_member(&ban.subject, &ban.reason, now)?;
        info!("banned {} ({})", ban.subject.short(), ban.reason);
        // Ban changes are a broadcast trigger for our own state.
        self.broadcast_own_state(now).await;
        Ok(())
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    pub async fn send(&self, peer: &NodeId, msg: &Message) {
        match msg.seal() {
            Ok(frame) => {
                if let Err(e) = self.host.send_custom_msg(peer, &frame).await {
                    debug!("send {} to {} failed: {e}", msg.command(), peer.short());
                }
            }
            Err(e) => warn!("refusing to send {}: {e}", msg.command()),
        }
    }

    /// Send to every active member except ourselves.
    pub async fn broadcast(&self, msg: &Message) {
        let local = self.host.local_id();
        let members = match self.store.active_members() {
            Ok(m) => m,
            Err(e) => {
                warn!("broadcast aborted, member read failed: {e}");
                return;
            }
        };
        for member in members {
            if member.pubkey != local {
                self.send(&member.pubkey, msg).await;
            }
        }
    }

    async fn send_state_hash(&self, peer: &NodeId) {
        let (hash, members) = match (self.state.fleet_hash(), self.store.active_members()) {
            (Ok(h), Ok(m)) => (h, m.len() as u32),
            _ => return,
        };
        self.send(
            peer,
            &Message::StateHash(StateHashPayload { fleet_hash: hex::encode(hash), members }),
        )
        .await;
    }

    /// Build, persist and broadcast our own gossip record unconditionally.
    pub async fn broadcast_own_state(&self, now: u64) {
        let state = match self.state.build_local_state(self.host.as_ref(), now).await {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot assemble own state: {e}");
                return;
            }
        };
        if let Err(e) = self.store.put_peer_state(&state) {
            warn!("cannot persist own state: {e}");
            return;
        }
        self.state.note_broadcast(state.clone(), now);
        self.broadcast(&Message::Gossip(GossipPayload { state })).await;
    }

    /// Gossip-loop tick: broadcast only when a threshold fires.
    pub async fn maybe_broadcast_own_state(&self, now: u64) {
        let state = match self.state.build_local_state(self.host.as_ref(), now).await {
            Ok(s) => s,
            Err(e) => {
                debug!("own state assembly deferred: {e}");
                return;
            }
        };
        if !self.state.should_broadcast(&state, now) {
            return;
        }
        if let Err(e) = self.store.put_peer_state(&state) {
            warn!("cannot persist own state: {e}");
            return;
        }
        self.state.note_broadcast(state.clone(), now);
        self.broadcast(&Message::Gossip(GossipPayload { state })).await;
    }
}
