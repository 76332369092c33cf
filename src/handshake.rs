//! Admission handshake: HELLO → CHALLENGE → ATTEST → WELCOME
//!
//! Anchored to the host HSM: the responder issues a random nonce, the
//! candidate returns a signature over the nonce and its manifest, and the
//! responder verifies it through the host's signature RPC. No key material
//! ever enters this process.
//!
//! The challenge store is capped with LRU eviction by issue time, plus a
//! per-candidate rate limit so a flood of fresh candidates cannot evict a
//! legitimate candidate's outstanding challenge. Challenges are consumed on
//! first use and expire eagerly.

use crate::config::HiveConfig;
use crate::error::{HiveError, Result};
use crate::node::HostNode;
use crate::rate_limit::{KeyedLimiter, WarnLimiter};
use crate::store::{Role, Store};
use crate::types::{unix_now, Member, NodeId, Tier};
use crate::wire::{
    attest_message, invite_message, AttestPayload, ChallengePayload, HelloPayload, InviteTicket,
    Manifest, Message, WelcomePayload,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub const NONCE_LEN: usize = 32;
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BadSignature,
    ExpiredTicket,
    Banned,
    RateLimited,
    Replay,
}

impl RejectReason {
    pub fn name(&self) -> &'static str {
        match self {
            RejectReason::BadSignature => "bad_signature",
            RejectReason::ExpiredTicket => "expired_ticket",
            RejectReason::Banned => "banned",
            RejectReason::RateLimited => "rate_limited",
            RejectReason::Replay => "replay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Tier),
    Rejected(RejectReason),
}

struct IssuedChallenge {
    nonce: [u8; NONCE_LEN],
    issued_at: u64,
    ticket: Option<InviteTicket>,
}

struct ChallengeStore {
    pending: HashMap<NodeId, IssuedChallenge>,
    rate: KeyedLimiter<NodeId>,
}

pub struct Handshake {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    challenges: Mutex<ChallengeStore>,
    reject_warn: Mutex<WarnLimiter>,
}

impl Handshake {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>) -> Self {
        let rate = KeyedLimiter::new(
            cfg.challenges_per_minute,
            cfg.challenges_per_minute / 60.0,
            cfg.max_pending_challenges,
        );
        Self {
            store,
            cfg,
            challenges: Mutex::new(ChallengeStore { pending: HashMap::new(), rate }),
            reject_warn: Mutex::new(WarnLimiter::default()),
        }
    }

    fn log_reject(&self, candidate: &NodeId, reason: RejectReason) {
        if self.reject_warn.lock().expect("warn lock").allow() {
            warn!("admission rejected for {}: {}", candidate.short(), reason.name());
        }
    }

    // =========================================================================
    // RESPONDER SIDE
    // =========================================================================

    /// Handle HELLO: issue a challenge unless the candidate is banned or
    /// hammering us.
    pub fn on_hello(&self, sender: &NodeId, hello: &HelloPayload, now: u64) -> Result<Option<Message>> {
        if hello.pubkey != *sender {
            return Err(HiveError::Unauthorised("hello pubkey mismatches transport sender".into()));
        }
        // Nothing to admit into yet.
        if self.store.hive_id()?.is_none() {
            debug!("hello from {} before any hive exists", sender.short());
            return Ok(None);
        }
        if self.store.is_banned(sender)? {
            self.log_reject(sender, RejectReason::Banned);
            return Ok(None);
        }

        let mut challenges = self.challenges.lock().expect("challenge lock");
        purge_expired(&mut challenges.pending, now, self.cfg.challenge_ttl_secs);

        if !challenges.rate.try_consume(sender) {
            self.log_reject(sender, RejectReason::RateLimited);
            return Ok(None);
        }

        if !challenges.pending.contains_key(sender)
            && challenges.pending.len() >= self.cfg.max_pending_challenges
        {
            // LRU by issue time.
            if let Some(victim) = challenges
                .pending
                .iter()
                .min_by_key(|(_, c)| c.issued_at)
                .map(|(k, _)| *k)
            {
                challenges.pending.remove(&victim);
            }
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        challenges.pending.insert(
            *sender,
            IssuedChallenge { nonce, issued_at: now, ticket: hello.ticket.clone() },
        );
        debug!("challenge issued to {}", sender.short());
        Ok(Some(Message::Challenge(ChallengePayload { nonce: hex::encode(nonce) })))
    }

    /// Handle ATTEST: verify the HSM signature over nonce and manifest,
    /// decide the admission tier, and admit.
    pub async fn on_attest(
        &self,
        host: &dyn HostNode,
        sender: &NodeId,
        attest: &AttestPayload,
        now: u64,
    ) -> Result<Admission> {
        if self.store.is_banned(sender)? {
            self.log_reject(sender, RejectReason::Banned);
            return Ok(Admission::Rejected(RejectReason::Banned));
        }
        if attest.manifest.pubkey != *sender {
            self.log_reject(sender, RejectReason::BadSignature);
            return Ok(Admission::Rejected(RejectReason::BadSignature));
        }

        // Consume the challenge first so a failed attempt cannot be retried
        // against the same nonce.
        let issued = {
            let mut challenges = self.challenges.lock().expect("challenge lock");
            challenges.pending.remove(sender)
        };
        let Some(issued) = issued else {
            self.log_reject(sender, RejectReason::Replay);
            return Ok(Admission::Rejected(RejectReason::Replay));
        };
        if now.saturating_sub(issued.issued_at) > self.cfg.challenge_ttl_secs {
            self.log_reject(sender, RejectReason::Replay);
            return Ok(Admission::Rejected(RejectReason::Replay));
        }

        // Binding: the signature covers both the nonce and the manifest.
        let message = attest_message(&hex::encode(issued.nonce), &attest.manifest.canonical()?);
        if !host.verify_message(sender, &message, &attest.signature).await? {
            self.log_reject(sender, RejectReason::BadSignature);
            return Ok(Admission::Rejected(RejectReason::BadSignature));
        }

        // Ticketed model: a valid admin-signed, unexpired invite admits a
        // full Member; everything else enters on probation.
        let tier = match &issued.ticket {
            None => Tier::Neophyte,
            Some(ticket) => match self.check_ticket(host, ticket, sender, now).await? {
                TicketCheck::Valid => Tier::Member,
                TicketCheck::Expired => {
                    self.log_reject(sender, RejectReason::ExpiredTicket);
                    return Ok(Admission::Rejected(RejectReason::ExpiredTicket));
                }
                TicketCheck::Invalid => {
                    self.log_reject(sender, RejectReason::BadSignature);
                    return Ok(Admission::Rejected(RejectReason::BadSignature));
                }
            },
        };

        let member = match self.store.member(sender)? {
            Some(mut existing) => {
                existing.last_seen = now;
                if tier == Tier::Member {
                    existing.tier = Tier::Member;
                }
                existing
            }
            None => Member { pubkey: *sender, tier, joined_at: now, last_seen: now, banned: false },
        };
        self.store.put_member(&member)?;
        info!("admitted {} as {}", sender.short(), member.tier);
        Ok(Admission::Admitted(member.tier))
    }

    async fn check_ticket(
        &self,
        host: &dyn HostNode,
        ticket: &InviteTicket,
        sender: &NodeId,
        now: u64,
    ) -> Result<TicketCheck> {
        if ticket.pubkey != *sender {
            return Ok(TicketCheck::Invalid);
        }
        if now >= ticket.expires_at {
            return Ok(TicketCheck::Expired);
        }
        let Some(admin) = self.store.admin_pubkey()? else {
            return Ok(TicketCheck::Invalid);
        };
        let Some(hive_id) = self.store.hive_id()? else {
            return Ok(TicketCheck::Invalid);
        };
        let message = invite_message(&ticket.pubkey, ticket.expires_at, &hive_id);
        if host.verify_message(&admin, &message, &ticket.signature).await? {
            Ok(TicketCheck::Valid)
        } else {
            Ok(TicketCheck::Invalid)
        }
    }

    pub fn welcome(&self, tier: Tier) -> Result<Message> {
        let hive_id = self
            .store
            .hive_id()?
            .ok_or_else(|| HiveError::Invariant("welcoming without a hive id".into()))?;
        let admin = self
            .store
            .admin_pubkey()?
            .ok_or_else(|| HiveError::Invariant("welcoming without an admin pubkey".into()))?;
        Ok(Message::Welcome(WelcomePayload {
            tier,
            hive_id,
            admin,
            fleet_size: self.store.active_members()?.len() as u32,
        }))
    }

    // =========================================================================
    // CANDIDATE SIDE
    // =========================================================================

    pub fn hello(&self, local: NodeId, ticket: Option<InviteTicket>) -> Message {
        Message::Hello(HelloPayload {
            pubkey: local,
            capabilities: crate::wire::BoundedVec::new(vec!["gossip".into(), "intent".into()])
                .unwrap_or_default(),
            ticket,
        })
    }

    /// Answer a CHALLENGE with a signed ATTEST.
    pub async fn on_challenge(
        &self,
        host: &dyn HostNode,
        challenge: &ChallengePayload,
    ) -> Result<Message> {
        let raw = hex::decode(&challenge.nonce)
            .map_err(|e| HiveError::Malformed(format!("challenge nonce: {e}")))?;
        if raw.len() != NONCE_LEN {
            return Err(HiveError::Malformed(format!("challenge nonce is {} bytes", raw.len())));
        }
        let manifest = Manifest {
            pubkey: host.local_id(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: crate::wire::BoundedVec::new(vec!["gossip".into(), "intent".into()])
                .unwrap_or_default(),
        };
        let message = attest_message(&challenge.nonce, &manifest.canonical()?);
        let signature = host.sign_message(&message).await?;
        Ok(Message::Attest(AttestPayload { manifest, signature }))
    }

    /// Record what WELCOME teaches us: the hive identity, its admin, and the
    /// welcomer as a live member.
    pub fn on_welcome(&self, sender: &NodeId, welcome: &WelcomePayload, now: u64) -> Result<()> {
        if self.store.hive_id()?.is_none() {
            self.store.set_hive_id(&welcome.hive_id)?;
            self.store.set_admin_pubkey(&welcome.admin)?;
            self.store.set_role(Role::Regular)?;
            info!("joined hive {} as {}", welcome.hive_id, welcome.tier);
        }
        if self.store.member(sender)?.is_none() {
            self.store.put_member(&Member {
                pubkey: *sender,
                tier: Tier::Member,
                joined_at: now,
                last_seen: now,
                banned: false,
            })?;
        }
        Ok(())
    }

    pub fn pending_challenges(&self) -> usize {
        self.challenges.lock().expect("challenge lock").pending.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketCheck {
    Valid,
    Expired,
    Invalid,
}

fn purge_expired(pending: &mut HashMap<NodeId, IssuedChallenge>, now: u64, ttl: u64) {
    pending.retain(|_, c| now.saturating_sub(c.issued_at) <= ttl);
}

// =============================================================================
// HIVE LIFECYCLE
// =============================================================================

/// Create a new hive with this node as initiator and sole member.
pub fn initiate_hive(store: &Store, local: NodeId) -> Result<String> {
    if store.hive_id()?.is_some() {
        return Err(HiveError::Invariant("hive already initiated".into()));
    }
    use sha2::Digest;
    let now = unix_now();
    let mut hasher = sha2::Sha256::new();
    hasher.update(local.0);
    hasher.update(now.to_be_bytes());
    let hive_id = hex::encode(&hasher.finalize()[..16]);

    store.set_hive_id(&hive_id)?;
    store.set_admin_pubkey(&local)?;
    store.set_role(Role::Admin)?;
    store.put_member(&Member {
        pubkey: local,
        tier: Tier::Member,
        joined_at: now,
        last_seen: now,
        banned: false,
    })?;
    info!("initiated hive {hive_id}");
    Ok(hive_id)
}

/// Issue an admin-signed invite for a candidate.
pub async fn issue_invite(
    store: &Store,
    host: &dyn HostNode,
    candidate: NodeId,
    valid_hours: u64,
    now: u64,
) -> Result<InviteTicket> {
    if store.role()? != Role::Admin {
        return Err(HiveError::Unauthorised("only the hive admin issues invites".into()));
    }
    let hive_id = store
        .hive_id()?
        .ok_or_else(|| HiveError::Invariant("no hive initiated".into()))?;
    let expires_at = now + valid_hours * 3600;
    let signature = host
        .sign_message(&invite_message(&candidate, expires_at, &hive_id))
        .await?;
    Ok(InviteTicket { pubkey: candidate, expires_at, signature })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::LocalChannel;
    use async_trait::async_trait;

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    /// Host fake: signatures are `sig:{signer}:{message}` and verify by
    /// string reconstruction.
    struct FakeHsm {
        id: NodeId,
    }

    #[async_trait]
    impl HostNode for FakeHsm {
        fn local_id(&self) -> NodeId {
            self.id
        }
        async fn send_custom_msg(&self, _: &NodeId, _: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn sign_message(&self, message: &str) -> Result<String> {
            Ok(format!("sig:{}:{message}", self.id))
        }
        async fn verify_message(&self, pubkey: &NodeId, message: &str, signature: &str) -> Result<bool> {
            Ok(signature == format!("sig:{pubkey}:{message}"))
        }
        async fn list_channels(&self) -> Result<Vec<LocalChannel>> {
            Ok(vec![])
        }
        async fn onchain_sat(&self) -> Result<u64> {
            Ok(0)
        }
        async fn node_capacity(&self, _: &NodeId) -> Result<u64> {
            Ok(0)
        }
        async fn pair_capacity(&self, _: &NodeId, _: &NodeId) -> Result<u64> {
            Ok(0)
        }
        async fn node_first_seen(&self, _: &NodeId) -> Result<Option<u64>> {
            Ok(None)
        }
    }

    fn setup(admin: u8) -> (Arc<Store>, Handshake) {
        let dir = std::env::temp_dir().join(format!("hive-hs-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        initiate_hive(&store, node(admin)).unwrap();
        let hs = Handshake::new(store.clone(), Arc::new(HiveConfig::default()));
        (store, hs)
    }

    async fn run_handshake(
        store: &Arc<Store>,
        responder: &Handshake,
        candidate: &FakeHsm,
        ticket: Option<InviteTicket>,
        now: u64,
    ) -> Admission {
        let candidate_id = candidate.local_id();
        let hello = match responder.hello(candidate_id, ticket) {
            Message::Hello(h) => h,
            _ => unreachable!(),
        };
        let challenge = match responder.on_hello(&candidate_id, &hello, now).unwrap() {
            Some(Message::Challenge(c)) => c,
            other => panic!("expected challenge, got {other:?}"),
        };
        let attest = match responder.on_challenge(candidate, &challenge).await.unwrap() {
            Message::Attest(a) => a,
            _ => unreachable!(),
        };
        let _ = store;
        responder
            .on_attest(&FakeHsm { id: node(1) }, &candidate_id, &attest, now)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn permissionless_admission_yields_neophyte() {
        let (store, hs) = setup(1);
        let candidate = FakeHsm { id: node(2) };
        let admission = run_handshake(&store, &hs, &candidate, None, 1000).await;
        assert_eq!(admission, Admission::Admitted(Tier::Neophyte));
        assert_eq!(store.member(&node(2)).unwrap().unwrap().tier, Tier::Neophyte);
    }

    #[tokio::test]
    async fn ticketed_admission_yields_member() {
        let (store, hs) = setup(1);
        let admin = FakeHsm { id: node(1) };
        let ticket = issue_invite(&store, &admin, node(2), 1, 1000).await.unwrap();
        let candidate = FakeHsm { id: node(2) };
        let admission = run_handshake(&store, &hs, &candidate, Some(ticket), 1000).await;
        assert_eq!(admission, Admission::Admitted(Tier::Member));
    }

    #[tokio::test]
    async fn expired_ticket_is_rejected() {
        let (store, hs) = setup(1);
        let admin = FakeHsm { id: node(1) };
        let ticket = issue_invite(&store, &admin, node(2), 1, 1000).await.unwrap();
        let candidate = FakeHsm { id: node(2) };
        // Presented one hour + later: expired.
        let admission = run_handshake(&store, &hs, &candidate, Some(ticket), 1000 + 3601).await;
        assert_eq!(admission, Admission::Rejected(RejectReason::ExpiredTicket));
        assert!(store.member(&node(2)).unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let (_store, hs) = setup(1);
        let candidate_id = node(2);
        let hello = HelloPayload { pubkey: candidate_id, capabilities: Default::default(), ticket: None };
        hs.on_hello(&candidate_id, &hello, 1000).unwrap();
        let attest = AttestPayload {
            manifest: Manifest {
                pubkey: candidate_id,
                protocol_version: PROTOCOL_VERSION,
                capabilities: Default::default(),
            },
            signature: "garbage".into(),
        };
        let admission = hs
            .on_attest(&FakeHsm { id: node(1) }, &candidate_id, &attest, 1000)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Rejected(RejectReason::BadSignature));
    }

    #[tokio::test]
    async fn attest_without_challenge_is_replay() {
        let (_store, hs) = setup(1);
        let attest = AttestPayload {
            manifest: Manifest {
                pubkey: node(2),
                protocol_version: PROTOCOL_VERSION,
                capabilities: Default::default(),
            },
            signature: "x".into(),
        };
        let admission = hs
            .on_attest(&FakeHsm { id: node(1) }, &node(2), &attest, 1000)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Rejected(RejectReason::Replay));
    }

    #[tokio::test]
    async fn banned_candidate_gets_no_challenge() {
        let (store, hs) = setup(1);
        store.ban_member(&node(2), "test", 100).unwrap();
        let hello = HelloPayload { pubkey: node(2), capabilities: Default::default(), ticket: None };
        assert!(hs.on_hello(&node(2), &hello, 1000).unwrap().is_none());
    }

    #[test]
    fn challenge_store_is_capped() {
        let (_store, hs) = setup(1);
        let cap = HiveConfig::default().max_pending_challenges;
        for i in 0..(cap + 10) {
            let mut id = [0u8; 33];
            id[0] = 2;
            id[1..9].copy_from_slice(&(i as u64).to_be_bytes());
            let candidate = NodeId(id);
            let hello = HelloPayload { pubkey: candidate, capabilities: Default::default(), ticket: None };
            let _ = hs.on_hello(&candidate, &hello, 1000 + i as u64);
        }
        assert!(hs.pending_challenges() <= cap);
    }

    #[test]
    fn per_candidate_rate_limit() {
        let (_store, hs) = setup(1);
        let hello = HelloPayload { pubkey: node(2), capabilities: Default::default(), ticket: None };
        let mut issued = 0;
        for _ in 0..10 {
            if hs.on_hello(&node(2), &hello, 1000).unwrap().is_some() {
                issued += 1;
            }
        }
        // Burst allowance only; the flood is refused.
        assert!(issued <= 4);
    }
}
