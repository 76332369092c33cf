//! Intent lock protocol: at most one member acts on a `(kind, target)`
//! within a window, with no central coordinator
//!
//! An announcer persists a pending intent, broadcasts it, and holds for
//! `hold_seconds`. Concurrent announcements for the same `(kind, target)`
//! resolve deterministically: the lexicographically smallest initiator
//! pubkey wins; the loser flips to aborted and says so. A silent winner
//! commits after the hold window. Commit never executes anything itself;
//! the mapped action goes through governance.

use crate::config::HiveConfig;
use crate::error::{HiveError, Result};
use crate::store::Store;
use crate::types::{Intent, IntentKey, IntentKind, IntentStatus, NodeId};
use crate::wire::{IntentAbortPayload, IntentPayload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Outcome of hearing a remote intent that may conflict with a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// No local pending intent on that `(kind, target)`.
    NoConflict,
    /// Local initiator sorts first: hold silently.
    LocalWins,
    /// Remote initiator sorts first: local intent is now aborted and an
    /// INTENT_ABORT should be broadcast.
    LocalAborts,
}

#[derive(Debug, Clone, Copy)]
struct RemoteIntent {
    timestamp: u64,
}

pub struct IntentManager {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    /// Pending intents heard from other members. Process-local, bounded,
    /// time-pruned; rebuilt empty on restart without harming correctness
    /// (a lost entry only delays a commit by one announcement round).
    remote: Mutex<HashMap<IntentKey, RemoteIntent>>,
}

impl IntentManager {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>) -> Self {
        Self {
            store,
            cfg,
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// Persist and return a fresh local intent, or `None` when the same key
    /// is already pending (idempotent announce).
    pub fn announce(
        &self,
        kind: IntentKind,
        target: NodeId,
        amount_sat: u64,
        local: NodeId,
        now: u64,
    ) -> Result<Option<Intent>> {
        let key = IntentKey { kind, target, initiator: local };
        if let Some(existing) = self.store.intent(&key)? {
            if existing.status == IntentStatus::Pending && now < existing.expires_at {
                debug!("intent {kind}/{} already pending", target.short());
                return Ok(None);
            }
        }
        let intent = Intent {
            kind,
            target,
            initiator: local,
            amount_sat,
            timestamp: now,
            expires_at: now + self.cfg.intent_horizon_secs,
            status: IntentStatus::Pending,
        };
        self.store.put_intent(&intent)?;
        info!("announced intent {kind} on {}", target.short());
        Ok(Some(intent))
    }

    /// Record a remote announcement and resolve any conflict with a local
    /// pending intent. The sender must be the initiator it claims.
    pub fn on_remote_intent(
        &self,
        sender: &NodeId,
        payload: &IntentPayload,
        local: NodeId,
        now: u64,
    ) -> Result<TieBreak> {
        if payload.initiator != *sender {
            return Err(HiveError::Unauthorised(format!(
                "intent from {} claims initiator {}",
                sender.short(),
                payload.initiator.short()
            )));
        }
        if payload.initiator == local {
            return Ok(TieBreak::NoConflict);
        }

        let key = IntentKey {
            kind: payload.kind,
            target: payload.target,
            initiator: payload.initiator,
        };
        self.insert_remote(key, RemoteIntent { timestamp: payload.timestamp.min(now) });

        let local_key = IntentKey {
            kind: payload.kind,
            target: payload.target,
            initiator: local,
        };
        let Some(mut ours) = self.store.intent(&local_key)? else {
            return Ok(TieBreak::NoConflict);
        };
        if ours.status != IntentStatus::Pending {
            return Ok(TieBreak::NoConflict);
        }

        // Deterministic tie-break: smallest initiator pubkey proceeds.
        // Member pubkeys are unique, so equality cannot arise here.
        if payload.initiator < local {
            ours.status = IntentStatus::Aborted;
            self.store.put_intent(&ours)?;
            info!(
                "intent {}/{} lost tie-break to {}",
                payload.kind,
                payload.target.short(),
                payload.initiator.short()
            );
            Ok(TieBreak::LocalAborts)
        } else {
            Ok(TieBreak::LocalWins)
        }
    }

    /// Replayed keys overwrite in place; fresh keys respect both the global
    /// and the per-initiator bound, evicting the oldest timestamp first.
    fn insert_remote(&self, key: IntentKey, entry: RemoteIntent) {
        let mut remote = self.remote.lock().expect("remote lock");
        if remote.contains_key(&key) {
            remote.insert(key, entry);
            return;
        }
        let per_peer = remote
            .keys()
            .filter(|k| k.initiator == key.initiator)
            .count();
        if per_peer >= self.cfg.max_remote_intents_per_peer {
            Self::evict_oldest(&mut remote, Some(key.initiator));
        } else if remote.len() >= self.cfg.max_remote_intents {
            Self::evict_oldest(&mut remote, None);
        }
        remote.insert(key, entry);
    }

    fn evict_oldest(remote: &mut HashMap<IntentKey, RemoteIntent>, initiator: Option<NodeId>) {
        let victim = remote
            .iter()
            .filter(|(k, _)| initiator.is_none_or(|i| k.initiator == i))
            .min_by_key(|(_, v)| v.timestamp)
            .map(|(k, _)| *k);
        if let Some(k) = victim {
            remote.remove(&k);
        }
    }

    pub fn on_remote_abort(&self, sender: &NodeId, payload: &IntentAbortPayload) -> Result<()> {
        if payload.initiator != *sender {
            return Err(HiveError::Unauthorised("abort for someone else's intent".into()));
        }
        let key = IntentKey {
            kind: payload.kind,
            target: payload.target,
            initiator: payload.initiator,
        };
        self.remote.lock().expect("remote lock").remove(&key);
        Ok(())
    }

    /// Local pending intents that are past their hold window and free of any
    /// recorded conflicting remote intent with a smaller initiator.
    pub fn commit_candidates(&self, local: NodeId, now: u64) -> Result<Vec<Intent>> {
        let remote = self.remote.lock().expect("remote lock");
        let mut out = Vec::new();
        for intent in self.store.intents()? {
            if intent.initiator != local || intent.status != IntentStatus::Pending {
                continue;
            }
            if now < intent.timestamp + self.cfg.hold_seconds || now >= intent.expires_at {
                continue;
            }
            let blocked = remote.keys().any(|k| {
                k.kind == intent.kind && k.target == intent.target && k.initiator < local
            });
            if !blocked {
                out.push(intent);
            }
        }
        Ok(out)
    }

    /// Flip pending intents past their deadline to expired.
    pub fn expire_tick(&self, now: u64) -> Result<usize> {
        let mut expired = 0;
        for mut intent in self.store.intents()? {
            if intent.status == IntentStatus::Pending && now >= intent.expires_at {
                intent.status = IntentStatus::Expired;
                self.store.put_intent(&intent)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Drop rows and cache entries older than the horizon, any status.
    pub fn prune(&self, now: u64) -> Result<()> {
        let horizon = now.saturating_sub(self.cfg.intent_horizon_secs);
        self.store.prune_intents_before(horizon)?;
        self.remote
            .lock()
            .expect("remote lock")
            .retain(|_, v| v.timestamp >= horizon);
        Ok(())
    }

    /// Whether a member has anything pending, locally recorded or heard.
    /// The planner refuses to nominate busy openers.
    pub fn has_pending_from(&self, member: &NodeId) -> Result<bool> {
        if self
            .remote
            .lock()
            .expect("remote lock")
            .keys()
            .any(|k| k.initiator == *member)
        {
            return Ok(true);
        }
        Ok(self
            .store
            .intents()?
            .iter()
            .any(|i| i.initiator == *member && i.status == IntentStatus::Pending))
    }

    pub fn remote_len(&self) -> usize {
        self.remote.lock().expect("remote lock").len()
    }

    /// Whether we have seen (heard or stored) a ban_peer intent by
    /// `initiator` on `target`. BAN announcements from non-admin members are
    /// only honoured when backed by one.
    pub fn knows_ban_intent(&self, initiator: &NodeId, target: &NodeId) -> Result<bool> {
        let key = IntentKey {
            kind: IntentKind::BanPeer,
            target: *target,
            initiator: *initiator,
        };
        if self.remote.lock().expect("remote lock").contains_key(&key) {
            return Ok(true);
        }
        Ok(self.store.intent(&key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn setup() -> IntentManager {
        let dir = std::env::temp_dir().join(format!("hive-intent-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        IntentManager::new(store, Arc::new(HiveConfig::default()))
    }

    fn payload(kind: IntentKind, target: u8, initiator: u8, ts: u64) -> IntentPayload {
        IntentPayload {
            kind,
            target: node(target),
            initiator: node(initiator),
            amount_sat: 0,
            timestamp: ts,
            expires_at: ts + 3600,
        }
    }

    #[test]
    fn announce_is_idempotent() {
        let mgr = setup();
        assert!(mgr
            .announce(IntentKind::ChannelOpen, node(9), 0, node(1), 100)
            .unwrap()
            .is_some());
        assert!(mgr
            .announce(IntentKind::ChannelOpen, node(9), 0, node(1), 101)
            .unwrap()
            .is_none());
    }

    #[test]
    fn smaller_remote_initiator_aborts_local() {
        let mgr = setup();
        // Local is 0xbb... , remote is 0xaa...: remote wins.
        let local = node(0xbb);
        mgr.announce(IntentKind::ChannelOpen, node(9), 0, local, 100).unwrap();
        let result = mgr
            .on_remote_intent(&node(0xaa), &payload(IntentKind::ChannelOpen, 9, 0xaa, 100), local, 100)
            .unwrap();
        assert_eq!(result, TieBreak::LocalAborts);
        let key = IntentKey { kind: IntentKind::ChannelOpen, target: node(9), initiator: local };
        assert_eq!(mgr.store.intent(&key).unwrap().unwrap().status, IntentStatus::Aborted);
    }

    #[test]
    fn larger_remote_initiator_holds_silently() {
        let mgr = setup();
        let local = node(0xaa);
        mgr.announce(IntentKind::ChannelOpen, node(9), 0, local, 100).unwrap();
        let result = mgr
            .on_remote_intent(&node(0xbb), &payload(IntentKind::ChannelOpen, 9, 0xbb, 100), local, 100)
            .unwrap();
        assert_eq!(result, TieBreak::LocalWins);
        // And the recorded conflict does not block our commit.
        let ready = mgr.commit_candidates(local, 100 + 61).unwrap();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn spoofed_initiator_is_unauthorised() {
        let mgr = setup();
        let result = mgr.on_remote_intent(
            &node(0xcc),
            &payload(IntentKind::Rebalance, 9, 0xaa, 100),
            node(0xbb),
            100,
        );
        assert!(matches!(result, Err(HiveError::Unauthorised(_))));
    }

    #[test]
    fn commit_waits_for_hold_window() {
        let mgr = setup();
        let local = node(1);
        mgr.announce(IntentKind::Rebalance, node(9), 0, local, 100).unwrap();
        assert!(mgr.commit_candidates(local, 100 + 59).unwrap().is_empty());
        assert_eq!(mgr.commit_candidates(local, 100 + 60).unwrap().len(), 1);
    }

    #[test]
    fn recorded_smaller_conflict_blocks_commit() {
        let mgr = setup();
        let local = node(0xbb);
        mgr.announce(IntentKind::BanPeer, node(9), 0, local, 100).unwrap();
        // Conflict arrives but the local row was already aborted by it;
        // simulate a pending local row racing a cache entry instead.
        mgr.insert_remote(
            IntentKey { kind: IntentKind::BanPeer, target: node(9), initiator: node(0xaa) },
            RemoteIntent { timestamp: 100 },
        );
        assert!(mgr.commit_candidates(local, 100 + 61).unwrap().is_empty());
    }

    #[test]
    fn abort_clears_remote_entry() {
        let mgr = setup();
        let local = node(0xaa);
        mgr.on_remote_intent(&node(0xbb), &payload(IntentKind::ChannelOpen, 9, 0xbb, 100), local, 100)
            .unwrap();
        assert_eq!(mgr.remote_len(), 1);
        mgr.on_remote_abort(
            &node(0xbb),
            &IntentAbortPayload { kind: IntentKind::ChannelOpen, target: node(9), initiator: node(0xbb) },
        )
        .unwrap();
        assert_eq!(mgr.remote_len(), 0);
    }

    #[test]
    fn remote_cache_global_bound() {
        let mgr = setup();
        let cap = mgr.cfg.max_remote_intents;
        let per_peer = mgr.cfg.max_remote_intents_per_peer;
        // Many initiators, one entry each: global cap binds.
        for i in 0..(cap + 50) {
            let mut id = [0u8; 33];
            id[0] = 2;
            id[1..9].copy_from_slice(&(i as u64).to_be_bytes());
            let initiator = NodeId(id);
            mgr.insert_remote(
                IntentKey { kind: IntentKind::Rebalance, target: node(9), initiator },
                RemoteIntent { timestamp: i as u64 },
            );
        }
        assert!(mgr.remote_len() <= cap);
        let _ = per_peer;
    }

    #[test]
    fn remote_cache_per_peer_bound() {
        let mgr = setup();
        let per_peer = mgr.cfg.max_remote_intents_per_peer;
        for i in 0..(per_peer + 5) {
            let mut target = [0u8; 33];
            target[0] = 3;
            target[1] = i as u8;
            mgr.insert_remote(
                IntentKey {
                    kind: IntentKind::Rebalance,
                    target: NodeId(target),
                    initiator: node(7),
                },
                RemoteIntent { timestamp: i as u64 },
            );
        }
        assert!(mgr.remote_len() <= per_peer);
    }

    #[test]
    fn expiry_flips_status() {
        let mgr = setup();
        let local = node(1);
        mgr.announce(IntentKind::ChannelOpen, node(9), 0, local, 100).unwrap();
        assert_eq!(mgr.expire_tick(100 + 3600).unwrap(), 1);
        let key = IntentKey { kind: IntentKind::ChannelOpen, target: node(9), initiator: local };
        assert_eq!(mgr.store.intent(&key).unwrap().unwrap().status, IntentStatus::Expired);
        // An expired row frees the key for a fresh announcement.
        assert!(mgr
            .announce(IntentKind::ChannelOpen, node(9), 0, local, 100 + 3601)
            .unwrap()
            .is_some());
    }
}
