//! Durable, single-writer store for all hive state
//!
//! One `Store` owns the sled database and its named trees. Every other
//! component takes short, transactional access through this API; nothing
//! else holds mutable durable state. Values are bincode-encoded, local
//! storage only, never the network.
//!
//! Multi-row operations that must land together (intent commit + action
//! queueing, promotion + vouch archival, ban + member flag) run inside sled
//! transactions so a crash never leaves half of them applied.

use crate::error::{HiveError, Result};
use crate::types::{
    Ban, ContributionEntry, ContributionTotals, Intent, IntentKey, IntentStatus, Member,
    PeerState, PendingAction, PlannerEntry, PresenceEvent, PromotionRequest, PromotionVouch,
    NodeId, RequestId, Tier,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::ConflictableTransactionError;
use sled::Transactional;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

/// Local role in the hive. The initiator holds the admin key that signs
/// invites and may issue admin commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Regular,
}

pub struct Store {
    db: sled::Db,
    meta: sled::Tree,
    members: sled::Tree,
    peer_state: sled::Tree,
    intents: sled::Tree,
    vouches: sled::Tree,
    promotion_requests: sled::Tree,
    contrib: sled::Tree,
    pending_actions: sled::Tree,
    planner_log: sled::Tree,
    bans: sled::Tree,
    presence: sled::Tree,
    inhibits: sled::Tree,
    /// Disambiguates same-second append keys.
    seq: AtomicU32,
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn dec<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(raw)?)
}

fn ts_seq_key(ts: u64, seq: u32) -> [u8; 12] {
    let mut k = [0u8; 12];
    k[..8].copy_from_slice(&ts.to_be_bytes());
    k[8..].copy_from_slice(&seq.to_be_bytes());
    k
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            meta: db.open_tree("meta")?,
            members: db.open_tree("members")?,
            peer_state: db.open_tree("peer_state")?,
            intents: db.open_tree("intents")?,
            vouches: db.open_tree("promotion_vouches")?,
            promotion_requests: db.open_tree("promotion_requests")?,
            contrib: db.open_tree("contribution_ledger")?,
            pending_actions: db.open_tree("pending_actions")?,
            planner_log: db.open_tree("planner_log")?,
            bans: db.open_tree("bans")?,
            presence: db.open_tree("peer_presence")?,
            inhibits: db.open_tree("planner_inhibits")?,
            seq: AtomicU32::new(0),
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // META
    // =========================================================================

    pub fn hive_id(&self) -> Result<Option<String>> {
        Ok(self
            .meta
            .get(b"hive_id")?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_hive_id(&self, id: &str) -> Result<()> {
        self.meta.insert(b"hive_id", id.as_bytes())?;
        Ok(())
    }

    pub fn role(&self) -> Result<Role> {
        Ok(match self.meta.get(b"role")? {
            Some(v) if v.as_ref() == b"admin" => Role::Admin,
            _ => Role::Regular,
        })
    }

    pub fn set_role(&self, role: Role) -> Result<()> {
        let raw: &[u8] = match role {
            Role::Admin => b"admin",
            Role::Regular => b"regular",
        };
        self.meta.insert(b"role", raw)?;
        Ok(())
    }

    pub fn admin_pubkey(&self) -> Result<Option<NodeId>> {
        match self.meta.get(b"admin_pubkey")? {
            Some(v) => Ok(Some(NodeId::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn set_admin_pubkey(&self, id: &NodeId) -> Result<()> {
        self.meta.insert(b"admin_pubkey", &id.0[..])?;
        Ok(())
    }

    pub fn governance_mode_raw(&self) -> Result<Option<String>> {
        Ok(self
            .meta
            .get(b"governance_mode")?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    pub fn set_governance_mode_raw(&self, mode: &str) -> Result<()> {
        self.meta.insert(b"governance_mode", mode.as_bytes())?;
        Ok(())
    }

    /// Own gossip version: persisted so restarts never regress it.
    pub fn bump_own_version(&self) -> Result<u64> {
        let next = match self.meta.get(b"own_version")? {
            Some(v) => u64::from_be_bytes(v.as_ref().try_into().map_err(|_| {
                HiveError::Invariant("own_version width".into())
            })?) + 1,
            None => 1,
        };
        self.meta.insert(b"own_version", &next.to_be_bytes()[..])?;
        Ok(next)
    }

    fn next_action_id(&self) -> Result<u64> {
        let next = match self.meta.get(b"action_id")? {
            Some(v) => u64::from_be_bytes(v.as_ref().try_into().map_err(|_| {
                HiveError::Invariant("action_id width".into())
            })?) + 1,
            None => 1,
        };
        self.meta.insert(b"action_id", &next.to_be_bytes()[..])?;
        Ok(next)
    }

    // =========================================================================
    // MEMBERS
    // =========================================================================

    pub fn put_member(&self, member: &Member) -> Result<()> {
        self.members.insert(&member.pubkey.0[..], enc(member)?)?;
        Ok(())
    }

    pub fn member(&self, pubkey: &NodeId) -> Result<Option<Member>> {
        match self.members.get(&pubkey.0[..])? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    pub fn members(&self) -> Result<Vec<Member>> {
        let mut out = Vec::new();
        for row in self.members.iter() {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    /// Members that count for routing: admitted and not banned.
    pub fn active_members(&self) -> Result<Vec<Member>> {
        Ok(self.members()?.into_iter().filter(Member::is_active).collect())
    }

    /// Active full-tier members (the voting set).
    pub fn voting_members(&self) -> Result<Vec<Member>> {
        Ok(self
            .active_members()?
            .into_iter()
            .filter(|m| m.tier == Tier::Member)
            .collect())
    }

    pub fn touch_member(&self, pubkey: &NodeId, now: u64) -> Result<()> {
        if let Some(mut member) = self.member(pubkey)? {
            member.last_seen = now;
            self.put_member(&member)?;
        }
        Ok(())
    }

    // =========================================================================
    // PEER STATE
    // =========================================================================

    pub fn put_peer_state(&self, state: &PeerState) -> Result<()> {
        self.peer_state.insert(&state.pubkey.0[..], enc(state)?)?;
        Ok(())
    }

    pub fn peer_state_of(&self, pubkey: &NodeId) -> Result<Option<PeerState>> {
        match self.peer_state.get(&pubkey.0[..])? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    pub fn peer_states(&self) -> Result<Vec<PeerState>> {
        let mut out = Vec::new();
        for row in self.peer_state.iter() {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    // =========================================================================
    // INTENTS
    // =========================================================================

    pub fn put_intent(&self, intent: &Intent) -> Result<()> {
        self.intents.insert(&intent.key().encode()[..], enc(intent)?)?;
        Ok(())
    }

    pub fn intent(&self, key: &IntentKey) -> Result<Option<Intent>> {
        match self.intents.get(&key.encode()[..])? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    pub fn intents(&self) -> Result<Vec<Intent>> {
        let mut out = Vec::new();
        for row in self.intents.iter() {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    /// Flip an intent to committed and queue its governance action in one
    /// transaction.
    pub fn commit_intent_and_queue(&self, key: &IntentKey, mut action: PendingAction) -> Result<PendingAction> {
        action.id = self.next_action_id()?;
        let raw_key = key.encode();
        let action_enc = enc(&action)?;
        let action_key = action.id.to_be_bytes();
        (&self.intents, &self.pending_actions)
            .transaction(|(intents, actions)| {
                let Some(raw) = intents.get(&raw_key[..])? else {
                    return Err(ConflictableTransactionError::Abort(HiveError::Invariant(
                        "committing vanished intent".into(),
                    )));
                };
                let mut intent: Intent = bincode::deserialize(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                if intent.status != IntentStatus::Pending {
                    return Err(ConflictableTransactionError::Abort(HiveError::Conflict(
                        format!("intent no longer pending: {:?}", intent.status),
                    )));
                }
                intent.status = IntentStatus::Committed;
                let intent_enc = bincode::serialize(&intent)
                    .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                intents.insert(&raw_key[..], intent_enc)?;
                actions.insert(&action_key[..], action_enc.clone())?;
                Ok(())
            })
            .map_err(unwrap_txn_err)?;
        Ok(action)
    }

    pub fn prune_intents_before(&self, horizon_ts: u64) -> Result<usize> {
        let mut removed = 0;
        let mut doomed = Vec::new();
        for row in self.intents.iter() {
            let (k, v) = row?;
            let intent: Intent = dec(&v)?;
            if intent.timestamp < horizon_ts {
                doomed.push(k);
            }
        }
        for k in doomed {
            self.intents.remove(k)?;
            removed += 1;
        }
        Ok(removed)
    }

    // =========================================================================
    // PROMOTION
    // =========================================================================

    fn vouch_key(subject: &NodeId, voucher: &NodeId, request_id: &RequestId) -> [u8; 82] {
        let mut k = [0u8; 82];
        k[..33].copy_from_slice(&subject.0);
        k[33..66].copy_from_slice(&voucher.0);
        k[66..].copy_from_slice(&request_id.0);
        k
    }

    /// Returns false when the `(subject, voucher, request_id)` tuple already
    /// exists. This is the replay defence.
    pub fn insert_vouch(&self, vouch: &PromotionVouch) -> Result<bool> {
        let key = Self::vouch_key(&vouch.subject, &vouch.voucher, &vouch.request_id);
        let prev = self.vouches.insert(&key[..], enc(vouch)?)?;
        Ok(prev.is_none())
    }

    pub fn vouches_for(&self, subject: &NodeId, request_id: &RequestId) -> Result<Vec<PromotionVouch>> {
        let mut out = Vec::new();
        for row in self.vouches.scan_prefix(&subject.0[..]) {
            let (_, v) = row?;
            let vouch: PromotionVouch = dec(&v)?;
            if vouch.request_id == *request_id {
                out.push(vouch);
            }
        }
        Ok(out)
    }

    pub fn prune_vouches_before(&self, ts: u64) -> Result<usize> {
        let mut doomed = Vec::new();
        for row in self.vouches.iter() {
            let (k, v) = row?;
            let vouch: PromotionVouch = dec(&v)?;
            if vouch.timestamp < ts {
                doomed.push(k);
            }
        }
        let removed = doomed.len();
        for k in doomed {
            self.vouches.remove(k)?;
        }
        Ok(removed)
    }

    pub fn put_promotion_request(&self, req: &PromotionRequest) -> Result<()> {
        self.promotion_requests.insert(&req.request_id.0[..], enc(req)?)?;
        Ok(())
    }

    pub fn promotion_request(&self, id: &RequestId) -> Result<Option<PromotionRequest>> {
        match self.promotion_requests.get(&id.0[..])? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    pub fn prune_promotion_requests_before(&self, ts: u64) -> Result<()> {
        let mut doomed = Vec::new();
        for row in self.promotion_requests.iter() {
            let (k, v) = row?;
            let req: PromotionRequest = dec(&v)?;
            if req.requested_at < ts {
                doomed.push(k);
            }
        }
        for k in doomed {
            self.promotion_requests.remove(k)?;
        }
        Ok(())
    }

    /// Tier change and vouch archival land atomically. Transactional trees
    /// cannot iterate, so spent vouch keys are collected up front and removed
    /// by exact key inside the transaction.
    pub fn promote_member(&self, subject: &NodeId, now: u64) -> Result<()> {
        let subject_key = subject.0;
        let mut spent: Vec<Vec<u8>> = Vec::new();
        for row in self.vouches.scan_prefix(&subject.0[..]) {
            let (k, _) = row?;
            spent.push(k.to_vec());
        }
        (&self.members, &self.vouches)
            .transaction(move |(members, vouches)| {
                let Some(raw) = members.get(&subject_key[..])? else {
                    return Err(ConflictableTransactionError::Abort(HiveError::Invariant(
                        "promoting unknown member".into(),
                    )));
                };
                let mut member: Member = bincode::deserialize(&raw)
                    .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                member.tier = Tier::Member;
                member.last_seen = now;
                let member_enc = bincode::serialize(&member)
                    .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                members.insert(&subject_key[..], member_enc)?;
                for k in &spent {
                    vouches.remove(k.clone())?;
                }
                Ok(())
            })
            .map_err(unwrap_txn_err)?;
        Ok(())
    }

    // =========================================================================
    // CONTRIBUTION LEDGER
    // =========================================================================

    pub fn append_contribution(&self, entry: &ContributionEntry) -> Result<()> {
        let key = ts_seq_key(entry.timestamp, self.next_seq());
        self.contrib.insert(&key[..], enc(entry)?)?;
        Ok(())
    }

    pub fn contribution_rows(&self) -> Result<usize> {
        Ok(self.contrib.len())
    }

    /// 30-day style window scan. Callers cache the result.
    pub fn contribution_totals_since(&self, peer: &NodeId, since: u64) -> Result<ContributionTotals> {
        let start = ts_seq_key(since, 0);
        let mut totals = ContributionTotals { forwarded_msat: 0, received_msat: 0 };
        for row in self.contrib.range(&start[..]..) {
            let (_, v) = row?;
            let entry: ContributionEntry = dec(&v)?;
            if entry.peer != *peer {
                continue;
            }
            match entry.direction {
                crate::types::Direction::Forwarded => totals.forwarded_msat += entry.amount_msat,
                crate::types::Direction::Received => totals.received_msat += entry.amount_msat,
            }
        }
        Ok(totals)
    }

    pub fn count_contributions_since(&self, since: u64) -> Result<usize> {
        let start = ts_seq_key(since, 0);
        let mut n = 0;
        for row in self.contrib.range(&start[..]..) {
            row?;
            n += 1;
        }
        Ok(n)
    }

    pub fn prune_contributions_before(&self, ts: u64) -> Result<usize> {
        let end = ts_seq_key(ts, 0);
        let mut doomed = Vec::new();
        for row in self.contrib.range(..&end[..]) {
            let (k, _) = row?;
            doomed.push(k);
        }
        let removed = doomed.len();
        for k in doomed {
            self.contrib.remove(k)?;
        }
        Ok(removed)
    }

    /// Drop the oldest rows until at most `keep` remain.
    pub fn trim_contributions_to(&self, keep: usize) -> Result<usize> {
        let total = self.contrib.len();
        if total <= keep {
            return Ok(0);
        }
        let excess = total - keep;
        let mut doomed = Vec::with_capacity(excess);
        for row in self.contrib.iter().take(excess) {
            let (k, _) = row?;
            doomed.push(k);
        }
        let removed = doomed.len();
        for k in doomed {
            self.contrib.remove(k)?;
        }
        Ok(removed)
    }

    // =========================================================================
    // GOVERNANCE ACTIONS
    // =========================================================================

    pub fn queue_action(&self, mut action: PendingAction) -> Result<PendingAction> {
        action.id = self.next_action_id()?;
        self.pending_actions.insert(&action.id.to_be_bytes()[..], enc(&action)?)?;
        Ok(action)
    }

    pub fn put_action(&self, action: &PendingAction) -> Result<()> {
        self.pending_actions.insert(&action.id.to_be_bytes()[..], enc(action)?)?;
        Ok(())
    }

    pub fn action(&self, id: u64) -> Result<Option<PendingAction>> {
        match self.pending_actions.get(id.to_be_bytes())? {
            Some(v) => Ok(Some(dec(&v)?)),
            None => Ok(None),
        }
    }

    pub fn actions(&self) -> Result<Vec<PendingAction>> {
        let mut out = Vec::new();
        for row in self.pending_actions.iter() {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    /// Keep the table bounded: terminal rows beyond the cap go first, oldest
    /// first.
    pub fn trim_actions_to(&self, cap: usize) -> Result<()> {
        let total = self.pending_actions.len();
        if total <= cap {
            return Ok(());
        }
        let mut terminal = Vec::new();
        for row in self.pending_actions.iter() {
            let (k, v) = row?;
            let action: PendingAction = dec(&v)?;
            if !matches!(action.status, crate::types::ActionStatus::Pending) {
                terminal.push(k);
            }
        }
        for k in terminal.into_iter().take(total - cap) {
            self.pending_actions.remove(k)?;
        }
        Ok(())
    }

    // =========================================================================
    // PLANNER LOG
    // =========================================================================

    pub fn append_planner(&self, entry: &PlannerEntry, cap: usize) -> Result<()> {
        let key = ts_seq_key(entry.timestamp, self.next_seq());
        self.planner_log.insert(&key[..], enc(entry)?)?;
        while self.planner_log.len() > cap {
            let Some((k, _)) = self.planner_log.first()? else { break };
            self.planner_log.remove(k)?;
        }
        Ok(())
    }

    pub fn planner_entries(&self, limit: usize) -> Result<Vec<PlannerEntry>> {
        let mut out = Vec::new();
        for row in self.planner_log.iter().rev().take(limit) {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    // =========================================================================
    // BANS
    // =========================================================================

    /// Ban row and member flag land atomically. Unknown pubkeys still get a
    /// ban row so a later handshake is refused.
    pub fn ban_member(&self, pubkey: &NodeId, reason: &str, now: u64) -> Result<()> {
        let ban = Ban { pubkey: *pubkey, reason: reason.to_string(), since: now };
        let ban_enc = enc(&ban)?;
        let key = pubkey.0;
        (&self.members, &self.bans)
            .transaction(|(members, bans)| {
                bans.insert(&key[..], ban_enc.clone())?;
                if let Some(raw) = members.get(&key[..])? {
                    let mut member: Member = bincode::deserialize(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                    member.banned = true;
                    let member_enc = bincode::serialize(&member)
                        .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                    members.insert(&key[..], member_enc)?;
                }
                Ok(())
            })
            .map_err(unwrap_txn_err)?;
        Ok(())
    }

    pub fn unban_member(&self, pubkey: &NodeId) -> Result<()> {
        let key = pubkey.0;
        (&self.members, &self.bans)
            .transaction(|(members, bans)| {
                bans.remove(&key[..])?;
                if let Some(raw) = members.get(&key[..])? {
                    let mut member: Member = bincode::deserialize(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                    member.banned = false;
                    let member_enc = bincode::serialize(&member)
                        .map_err(|e| ConflictableTransactionError::Abort(HiveError::Encoding(e)))?;
                    members.insert(&key[..], member_enc)?;
                }
                Ok(())
            })
            .map_err(unwrap_txn_err)?;
        Ok(())
    }

    pub fn is_banned(&self, pubkey: &NodeId) -> Result<bool> {
        Ok(self.bans.contains_key(&pubkey.0[..])?)
    }

    pub fn bans(&self) -> Result<Vec<Ban>> {
        let mut out = Vec::new();
        for row in self.bans.iter() {
            let (_, v) = row?;
            out.push(dec(&v)?);
        }
        Ok(out)
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    pub fn append_presence(&self, event: &PresenceEvent) -> Result<()> {
        let mut key = [0u8; 41];
        key[..33].copy_from_slice(&event.peer.0);
        key[33..].copy_from_slice(&event.timestamp.to_be_bytes());
        self.presence.insert(&key[..], enc(event)?)?;
        Ok(())
    }

    pub fn presence_events(&self, peer: &NodeId, since: u64) -> Result<Vec<PresenceEvent>> {
        let mut out = Vec::new();
        for row in self.presence.scan_prefix(&peer.0[..]) {
            let (_, v) = row?;
            let event: PresenceEvent = dec(&v)?;
            if event.timestamp >= since {
                out.push(event);
            }
        }
        Ok(out)
    }

    pub fn prune_presence_before(&self, ts: u64) -> Result<()> {
        let mut doomed = Vec::new();
        for row in self.presence.iter() {
            let (k, v) = row?;
            let event: PresenceEvent = dec(&v)?;
            if event.timestamp < ts {
                doomed.push(k);
            }
        }
        for k in doomed {
            self.presence.remove(k)?;
        }
        Ok(())
    }

    // =========================================================================
    // PLANNER INHIBITS
    // =========================================================================

    pub fn set_inhibit(&self, peer: &NodeId, since: u64) -> Result<()> {
        self.inhibits.insert(&peer.0[..], &since.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn clear_inhibit(&self, peer: &NodeId) -> Result<()> {
        self.inhibits.remove(&peer.0[..])?;
        Ok(())
    }

    pub fn is_inhibited(&self, peer: &NodeId) -> Result<bool> {
        Ok(self.inhibits.contains_key(&peer.0[..])?)
    }

    pub fn inhibited_peers(&self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for row in self.inhibits.iter() {
            let (k, _) = row?;
            out.push(NodeId::from_slice(&k)?);
        }
        Ok(out)
    }

    // =========================================================================
    // LEECH TRACKING
    // =========================================================================

    /// Consecutive days a member's ratio stayed below the ban threshold.
    pub fn leech_streak(&self, peer: &NodeId) -> Result<(u64, u64)> {
        let mut key = b"leech:".to_vec();
        key.extend_from_slice(&peer.0);
        match self.meta.get(&key)? {
            Some(v) if v.len() == 16 => {
                let days = u64::from_be_bytes(v[..8].try_into().unwrap_or([0; 8]));
                let last_day = u64::from_be_bytes(v[8..].try_into().unwrap_or([0; 8]));
                Ok((days, last_day))
            }
            _ => Ok((0, 0)),
        }
    }

    pub fn set_leech_streak(&self, peer: &NodeId, days: u64, last_day: u64) -> Result<()> {
        let mut key = b"leech:".to_vec();
        key.extend_from_slice(&peer.0);
        let mut v = [0u8; 16];
        v[..8].copy_from_slice(&days.to_be_bytes());
        v[8..].copy_from_slice(&last_day.to_be_bytes());
        self.meta.insert(key.as_slice(), &v[..])?;
        Ok(())
    }
}

fn unwrap_txn_err(e: sled::transaction::TransactionError<HiveError>) -> HiveError {
    match e {
        sled::transaction::TransactionError::Abort(inner) => inner,
        sled::transaction::TransactionError::Storage(s) => HiveError::Store(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionStatus, Direction, IntentKind, PresenceKind};

    fn temp_store() -> Store {
        let dir = std::env::temp_dir().join(format!("hive-store-{}", rand::random::<u64>()));
        Store::open(&dir).unwrap()
    }

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn member(b: u8, tier: Tier) -> Member {
        Member { pubkey: node(b), tier, joined_at: 100, last_seen: 100, banned: false }
    }

    #[test]
    fn member_round_trip() {
        let store = temp_store();
        store.put_member(&member(1, Tier::Neophyte)).unwrap();
        let got = store.member(&node(1)).unwrap().unwrap();
        assert_eq!(got.tier, Tier::Neophyte);
        assert!(store.member(&node(2)).unwrap().is_none());
    }

    #[test]
    fn ban_flips_member_and_row_together() {
        let store = temp_store();
        store.put_member(&member(1, Tier::Member)).unwrap();
        store.ban_member(&node(1), "leech", 500).unwrap();
        assert!(store.is_banned(&node(1)).unwrap());
        assert!(store.member(&node(1)).unwrap().unwrap().banned);
        assert!(store.active_members().unwrap().is_empty());
        store.unban_member(&node(1)).unwrap();
        assert!(!store.is_banned(&node(1)).unwrap());
        assert_eq!(store.active_members().unwrap().len(), 1);
    }

    #[test]
    fn vouch_replay_defence() {
        let store = temp_store();
        let vouch = PromotionVouch {
            subject: node(1),
            voucher: node(2),
            request_id: RequestId([7; 16]),
            signature: "sig".into(),
            timestamp: 100,
        };
        assert!(store.insert_vouch(&vouch).unwrap());
        assert!(!store.insert_vouch(&vouch).unwrap());
        assert_eq!(store.vouches_for(&node(1), &RequestId([7; 16])).unwrap().len(), 1);
    }

    #[test]
    fn promotion_archives_vouches() {
        let store = temp_store();
        store.put_member(&member(1, Tier::Neophyte)).unwrap();
        for voucher in 2..5u8 {
            store
                .insert_vouch(&PromotionVouch {
                    subject: node(1),
                    voucher: node(voucher),
                    request_id: RequestId([7; 16]),
                    signature: "sig".into(),
                    timestamp: 100,
                })
                .unwrap();
        }
        store.promote_member(&node(1), 200).unwrap();
        assert_eq!(store.member(&node(1)).unwrap().unwrap().tier, Tier::Member);
        assert!(store.vouches_for(&node(1), &RequestId([7; 16])).unwrap().is_empty());
    }

    #[test]
    fn intent_commit_queues_action() {
        let store = temp_store();
        let intent = Intent {
            kind: IntentKind::ChannelOpen,
            target: node(9),
            initiator: node(1),
            amount_sat: 100_000,
            timestamp: 50,
            expires_at: 5000,
            status: IntentStatus::Pending,
        };
        store.put_intent(&intent).unwrap();
        let action = PendingAction {
            id: 0,
            kind: IntentKind::ChannelOpen,
            target: node(9),
            amount_sat: 100_000,
            proposed_by: node(1),
            proposed_at: 120,
            status: ActionStatus::Pending,
            expires_at: 120 + 86_400,
            context: "expansion".into(),
        };
        let queued = store.commit_intent_and_queue(&intent.key(), action).unwrap();
        assert!(queued.id > 0);
        assert_eq!(store.intent(&intent.key()).unwrap().unwrap().status, IntentStatus::Committed);
        assert_eq!(store.actions().unwrap().len(), 1);
    }

    #[test]
    fn double_commit_aborts() {
        let store = temp_store();
        let intent = Intent {
            kind: IntentKind::Rebalance,
            target: node(9),
            initiator: node(1),
            amount_sat: 1,
            timestamp: 50,
            expires_at: 5000,
            status: IntentStatus::Committed,
        };
        store.put_intent(&intent).unwrap();
        let action = PendingAction {
            id: 0,
            kind: IntentKind::Rebalance,
            target: node(9),
            amount_sat: 1,
            proposed_by: node(1),
            proposed_at: 120,
            status: ActionStatus::Pending,
            expires_at: 200,
            context: String::new(),
        };
        assert!(store.commit_intent_and_queue(&intent.key(), action).is_err());
    }

    #[test]
    fn contribution_window_scan() {
        let store = temp_store();
        for (ts, dir) in [(100, Direction::Forwarded), (200, Direction::Received), (300, Direction::Forwarded)] {
            store
                .append_contribution(&ContributionEntry {
                    peer: node(1),
                    direction: dir,
                    amount_msat: 10,
                    timestamp: ts,
                })
                .unwrap();
        }
        let totals = store.contribution_totals_since(&node(1), 150).unwrap();
        assert_eq!(totals.forwarded_msat, 10);
        assert_eq!(totals.received_msat, 10);
        assert_eq!(store.count_contributions_since(0).unwrap(), 3);
        assert_eq!(store.prune_contributions_before(250).unwrap(), 2);
        assert_eq!(store.contribution_rows().unwrap(), 1);
    }

    #[test]
    fn contribution_trim_keeps_newest() {
        let store = temp_store();
        for ts in 0..10u64 {
            store
                .append_contribution(&ContributionEntry {
                    peer: node(1),
                    direction: Direction::Forwarded,
                    amount_msat: ts,
                    timestamp: ts,
                })
                .unwrap();
        }
        assert_eq!(store.trim_contributions_to(4).unwrap(), 6);
        let totals = store.contribution_totals_since(&node(1), 0).unwrap();
        assert_eq!(totals.forwarded_msat, 6 + 7 + 8 + 9);
    }

    #[test]
    fn planner_log_is_capped() {
        let store = temp_store();
        for ts in 0..20u64 {
            store
                .append_planner(
                    &PlannerEntry {
                        timestamp: ts,
                        decision: "inhibit".into(),
                        target: node(1),
                        outcome: "ok".into(),
                    },
                    8,
                )
                .unwrap();
        }
        assert!(store.planner_entries(100).unwrap().len() <= 8);
    }

    #[test]
    fn own_version_is_monotonic() {
        let store = temp_store();
        let a = store.bump_own_version().unwrap();
        let b = store.bump_own_version().unwrap();
        assert!(b > a);
    }

    #[test]
    fn presence_scan_filters_window() {
        let store = temp_store();
        for ts in [100u64, 200, 300] {
            store
                .append_presence(&PresenceEvent { peer: node(1), kind: PresenceKind::Up, timestamp: ts })
                .unwrap();
        }
        assert_eq!(store.presence_events(&node(1), 150).unwrap().len(), 2);
        store.prune_presence_before(250).unwrap();
        assert_eq!(store.presence_events(&node(1), 0).unwrap().len(), 1);
    }
}
