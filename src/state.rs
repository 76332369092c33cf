//! Replicated hive state: per-peer records, gossip thresholds, fleet hash,
//! anti-entropy
//!
//! Updates are monotonic per originator: an incoming record applies iff its
//! version is strictly greater than the stored one, so the final value is the
//! highest-version one observed regardless of arrival order. Equal versions
//! are ignored; a lower version means the sender is behind and earns an
//! anti-entropy hint.

use crate::config::HiveConfig;
use crate::error::{HiveError, Result};
use crate::node::{HostNode, LocalChannel};
use crate::store::Store;
use crate::types::{ChannelSummary, Health, NodeId, PeerState};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Result of applying one gossip record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Strictly newer version: stored body replaced.
    Applied,
    /// Same version (or unknown-member record): no-op. Idempotence.
    Ignored,
    /// The sender is behind us: worth offering a sync.
    SenderBehind,
}

pub struct StateManager {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    /// Our own most recently broadcast state and when it went out.
    last_broadcast: Mutex<Option<(PeerState, u64)>>,
    /// Per-peer last-gossip-seen times. Bounded; evicts the stalest entry.
    last_seen: Mutex<HashMap<NodeId, u64>>,
}

impl StateManager {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>) -> Self {
        Self {
            store,
            cfg,
            last_broadcast: Mutex::new(None),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Apply a gossip record from `origin`. Records about the sender itself
    /// must match the transport identity; records about third parties are
    /// only accepted through full sync.
    pub fn apply_gossip(&self, origin: &NodeId, state: PeerState, now: u64) -> Result<GossipOutcome> {
        if state.pubkey != *origin {
            return Err(HiveError::Unauthorised(format!(
                "gossip from {} claims to describe {}",
                origin.short(),
                state.pubkey.short()
            )));
        }
        self.note_seen(*origin, now);
        self.apply_record(state)
    }

    /// The monotonic rule, shared by gossip and full sync.
    fn apply_record(&self, state: PeerState) -> Result<GossipOutcome> {
        if self.store.member(&state.pubkey)?.map(|m| m.is_active()) != Some(true) {
            debug!("dropping state record for non-member {}", state.pubkey.short());
            return Ok(GossipOutcome::Ignored);
        }
        match self.store.peer_state_of(&state.pubkey)? {
            Some(stored) if stored.version > state.version => Ok(GossipOutcome::SenderBehind),
            Some(stored) if stored.version == state.version => Ok(GossipOutcome::Ignored),
            _ => {
                self.store.put_peer_state(&state)?;
                Ok(GossipOutcome::Applied)
            }
        }
    }

    fn note_seen(&self, peer: NodeId, now: u64) {
        let mut seen = self.last_seen.lock().expect("last_seen lock");
        let cap = self.cfg.max_members * 2;
        if !seen.contains_key(&peer) && seen.len() >= cap {
            if let Some(stalest) = seen.iter().min_by_key(|(_, ts)| **ts).map(|(k, _)| *k) {
                seen.remove(&stalest);
            }
        }
        seen.insert(peer, now);
    }

    pub fn last_seen_of(&self, peer: &NodeId) -> Option<u64> {
        self.last_seen.lock().expect("last_seen lock").get(peer).copied()
    }

    // =========================================================================
    // FLEET HASH
    // =========================================================================

    /// Deterministic digest over the `(pubkey, version, timestamp)` triples,
    /// sorted by pubkey. Canonical encoding per record: 33 raw pubkey bytes,
    /// version as u64 big-endian, timestamp as u64 big-endian.
    pub fn fleet_hash(&self) -> Result<[u8; 32]> {
        Ok(fleet_hash_of(&self.store.peer_states()?))
    }

    // =========================================================================
    // BROADCAST THRESHOLDS
    // =========================================================================

    /// Whether `next` differs enough from the last broadcast to go out now.
    /// Triggers: capacity drift strictly above 10%, any fee-policy change,
    /// any health change, or heartbeat silence.
    pub fn should_broadcast(&self, next: &PeerState, now: u64) -> bool {
        let last = self.last_broadcast.lock().expect("last_broadcast lock");
        let Some((prev, sent_at)) = last.as_ref() else {
            return true;
        };
        if capacity_drifted(prev.capacity_sat, next.capacity_sat) {
            return true;
        }
        if prev.fee_policy_hash != next.fee_policy_hash {
            return true;
        }
        if prev.health != next.health {
            return true;
        }
        now.saturating_sub(*sent_at) >= self.cfg.heartbeat_secs
    }

    pub fn note_broadcast(&self, state: PeerState, now: u64) {
        *self.last_broadcast.lock().expect("last_broadcast lock") = Some((state, now));
    }

    /// Assemble our own gossip record from host facts, bumping the persisted
    /// version counter.
    pub async fn build_local_state(&self, host: &dyn HostNode, now: u64) -> Result<PeerState> {
        let channels = host.list_channels().await?;
        let onchain = host.onchain_sat().await?;
        let version = self.store.bump_own_version()?;
        Ok(PeerState {
            pubkey: host.local_id(),
            version,
            timestamp: now,
            capacity_sat: channels.iter().map(|c| c.capacity_sat).sum(),
            available_funds_sat: onchain,
            channels: channels
                .iter()
                .map(|c| ChannelSummary { peer: c.peer, capacity_sat: c.capacity_sat })
                .collect(),
            fee_policy_hash: fee_policy_hash(&channels),
            health: Health::Good,
        })
    }

    // =========================================================================
    // ANTI-ENTROPY
    // =========================================================================

    /// Records to offer a diverging peer, capped strictly. The cap never
    /// truncates legitimate fleets below it; past the cap the newest records
    /// win so the most active state converges first.
    pub fn full_sync_states(&self) -> Result<Vec<PeerState>> {
        let mut states = self.store.peer_states()?;
        if states.len() > self.cfg.max_full_sync_states {
            states.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            states.truncate(self.cfg.max_full_sync_states);
        }
        Ok(states)
    }

    /// Apply a FULL_SYNC payload record-by-record under the monotonic rule.
    /// Returns `(applied, ignored)`. Overfull payloads apply only the first
    /// `max_full_sync_states` records and log the overflow.
    pub fn apply_full_sync(&self, origin: &NodeId, mut states: Vec<PeerState>, now: u64) -> Result<(usize, usize)> {
        self.note_seen(*origin, now);
        let cap = self.cfg.max_full_sync_states;
        if states.len() > cap {
            warn!(
                "full sync from {} carries {} records, applying first {cap}",
                origin.short(),
                states.len()
            );
            states.truncate(cap);
        }
        let mut applied = 0;
        let mut ignored = 0;
        for state in states {
            match self.apply_record(state)? {
                GossipOutcome::Applied => applied += 1,
                _ => ignored += 1,
            }
        }
        Ok((applied, ignored))
    }
}

/// Strictly-greater-than-10% test in integer math so the boundary is exact:
/// a drift of exactly 10% does not trigger.
pub fn capacity_drifted(old: u64, new: u64) -> bool {
    let diff = old.abs_diff(new);
    diff.saturating_mul(10) > old
}

pub fn fleet_hash_of(states: &[PeerState]) -> [u8; 32] {
    let mut triples: Vec<(&NodeId, u64, u64)> = states
        .iter()
        .map(|s| (&s.pubkey, s.version, s.timestamp))
        .collect();
    triples.sort_by_key(|(pk, _, _)| **pk);

    let mut hasher = Sha256::new();
    for (pubkey, version, timestamp) in triples {
        hasher.update(pubkey.0);
        hasher.update(version.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
    }
    hasher.finalize().into()
}

/// Fingerprint of our outbound fee configuration: any per-channel fee change
/// changes the hash and triggers a broadcast.
pub fn fee_policy_hash(channels: &[LocalChannel]) -> String {
    let mut rows: Vec<(&NodeId, u32)> = channels.iter().map(|c| (&c.peer, c.fee_ppm)).collect();
    rows.sort();
    let mut hasher = Sha256::new();
    for (peer, ppm) in rows {
        hasher.update(peer.0);
        hasher.update(ppm.to_be_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Member, Tier};

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn setup() -> (Arc<Store>, StateManager) {
        let dir = std::env::temp_dir().join(format!("hive-state-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        let manager = StateManager::new(store.clone(), Arc::new(HiveConfig::default()));
        (store, manager)
    }

    fn admit(store: &Store, b: u8) {
        store
            .put_member(&Member {
                pubkey: node(b),
                tier: Tier::Member,
                joined_at: 0,
                last_seen: 0,
                banned: false,
            })
            .unwrap();
    }

    fn state(b: u8, version: u64) -> PeerState {
        PeerState {
            pubkey: node(b),
            version,
            timestamp: 1000 + version,
            capacity_sat: 1_000_000,
            available_funds_sat: 0,
            channels: vec![],
            fee_policy_hash: "aa".into(),
            health: Health::Good,
        }
    }

    #[test]
    fn monotonic_apply() {
        let (store, manager) = setup();
        admit(&store, 1);
        assert_eq!(manager.apply_gossip(&node(1), state(1, 5), 0).unwrap(), GossipOutcome::Applied);
        assert_eq!(manager.apply_gossip(&node(1), state(1, 5), 0).unwrap(), GossipOutcome::Ignored);
        assert_eq!(
            manager.apply_gossip(&node(1), state(1, 3), 0).unwrap(),
            GossipOutcome::SenderBehind
        );
        assert_eq!(store.peer_state_of(&node(1)).unwrap().unwrap().version, 5);
        assert_eq!(manager.apply_gossip(&node(1), state(1, 9), 0).unwrap(), GossipOutcome::Applied);
        assert_eq!(store.peer_state_of(&node(1)).unwrap().unwrap().version, 9);
    }

    #[test]
    fn applying_same_gossip_twice_is_idempotent() {
        let (store, manager) = setup();
        admit(&store, 1);
        manager.apply_gossip(&node(1), state(1, 7), 0).unwrap();
        let first = store.peer_state_of(&node(1)).unwrap().unwrap();
        manager.apply_gossip(&node(1), state(1, 7), 0).unwrap();
        assert_eq!(store.peer_state_of(&node(1)).unwrap().unwrap(), first);
    }

    #[test]
    fn spoofed_origin_rejected() {
        let (store, manager) = setup();
        admit(&store, 1);
        admit(&store, 2);
        assert!(matches!(
            manager.apply_gossip(&node(2), state(1, 5), 0),
            Err(HiveError::Unauthorised(_))
        ));
    }

    #[test]
    fn non_member_record_ignored() {
        let (_store, manager) = setup();
        assert_eq!(manager.apply_gossip(&node(1), state(1, 5), 0).unwrap(), GossipOutcome::Ignored);
    }

    #[test]
    fn fleet_hash_is_order_independent() {
        let records = vec![state(3, 1), state(1, 2), state(2, 9)];
        let mut shuffled = records.clone();
        shuffled.reverse();
        assert_eq!(fleet_hash_of(&records), fleet_hash_of(&shuffled));
    }

    #[test]
    fn fleet_hash_depends_on_version_not_body() {
        let mut a = state(1, 2);
        let b = state(1, 2);
        a.capacity_sat = 42; // body-only change
        assert_eq!(fleet_hash_of(&[a.clone()]), fleet_hash_of(&[b.clone()]));
        a.version = 3;
        assert_ne!(fleet_hash_of(&[a]), fleet_hash_of(&[b]));
    }

    #[test]
    fn drift_boundary_is_strict() {
        // Exactly 10% does not trigger, a hair over does.
        assert!(!capacity_drifted(1_000_000, 1_100_000));
        assert!(capacity_drifted(1_000_000, 1_100_001));
        assert!(!capacity_drifted(1_000_000, 900_000));
        assert!(capacity_drifted(1_000_000, 899_999));
        assert!(capacity_drifted(0, 1));
        assert!(!capacity_drifted(0, 0));
    }

    #[test]
    fn full_sync_at_cap_is_fully_applied() {
        let (store, manager) = setup();
        // Small cap so the member space stays within one byte.
        let mut cfg = HiveConfig::default();
        cfg.max_full_sync_states = 10;
        let manager = StateManager::new(manager.store.clone(), Arc::new(cfg));
        for i in 0..11u8 {
            admit(&store, i);
        }

        // Exactly cap records: every one lands.
        let records: Vec<PeerState> = (0..10u8).map(|i| state(i, 5)).collect();
        let (applied, ignored) = manager.apply_full_sync(&node(1), records, 0).unwrap();
        assert_eq!((applied, ignored), (10, 0));

        // cap + 1 records with higher versions: only the first cap apply.
        let records: Vec<PeerState> = (0..11u8).map(|i| state(i, 9)).collect();
        let (applied, _) = manager.apply_full_sync(&node(1), records, 0).unwrap();
        assert_eq!(applied, 10);
        // The truncated eleventh record kept its old (absent) state.
        assert!(store.peer_state_of(&node(10)).unwrap().is_none());
    }

    #[test]
    fn heartbeat_triggers_broadcast() {
        let (_store, manager) = setup();
        let own = state(1, 1);
        assert!(manager.should_broadcast(&own, 1000)); // nothing sent yet
        manager.note_broadcast(own.clone(), 1000);
        assert!(!manager.should_broadcast(&own, 1100));
        assert!(manager.should_broadcast(&own, 1000 + 300));
    }

    #[test]
    fn fee_policy_change_triggers_broadcast() {
        let (_store, manager) = setup();
        let own = state(1, 1);
        manager.note_broadcast(own.clone(), 1000);
        let mut changed = own.clone();
        changed.fee_policy_hash = "bb".into();
        assert!(manager.should_broadcast(&changed, 1001));
    }
}
