//! Background topology planner: saturation control and coordinated expansion
//!
//! Each cycle scores every external target by the share of its public
//! capacity the hive already covers. Reported member capacity is capped by
//! the public graph's view of that pair, so inflated gossip cannot push a
//! target into (or out of) saturation.
//!
//! Decisions per cycle: inhibit new opens toward saturated targets, release
//! inhibitors once the share decays, and propose at most one expansion
//! toward a genuinely underserved target with a deterministically chosen
//! opener; every member computes the same choice, so only one announces.

use crate::config::HiveConfig;
use crate::error::Result;
use crate::intent::IntentManager;
use crate::membership::Membership;
use crate::node::HostNode;
use crate::store::Store;
use crate::types::{Intent, IntentKind, NodeId, PeerState, PlannerEntry};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const SNAPSHOT_TTL_SECS: u64 = 6 * 3600;
const SNAPSHOT_CAP: usize = 4096;
const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy)]
struct TargetSnapshot {
    capacity_sat: u64,
    first_seen: Option<u64>,
    fetched_at: u64,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub scored: usize,
    pub inhibited: Vec<NodeId>,
    pub released: Vec<NodeId>,
    pub announced: Option<Intent>,
    pub aborted: bool,
}

pub struct Planner {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    bridge: Arc<crate::bridge::Bridge>,
    intents: Arc<IntentManager>,
    membership: Arc<Membership>,
    /// Cached public-graph snapshot per target. Bounded, TTL-refreshed.
    snapshot: Mutex<HashMap<NodeId, TargetSnapshot>>,
}

impl Planner {
    pub fn new(
        store: Arc<Store>,
        cfg: Arc<HiveConfig>,
        bridge: Arc<crate::bridge::Bridge>,
        intents: Arc<IntentManager>,
        membership: Arc<Membership>,
    ) -> Self {
        Self {
            store,
            cfg,
            bridge,
            intents,
            membership,
            snapshot: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_cycle(&self, host: &dyn HostNode, now: u64) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let local = host.local_id();

        let members = self.store.voting_members()?;
        let member_set: HashSet<NodeId> = members.iter().map(|m| m.pubkey).collect();
        let states: Vec<PeerState> = members
            .iter()
            .filter_map(|m| self.store.peer_state_of(&m.pubkey).transpose())
            .collect::<Result<_>>()?;

        // External targets: every channel peer of any member that is not
        // itself part of the hive.
        let mut targets: HashSet<NodeId> = HashSet::new();
        for state in &states {
            for channel in &state.channels {
                if !member_set.contains(&channel.peer) && channel.peer != local {
                    targets.insert(channel.peer);
                }
            }
        }

        let mut shares: Vec<(NodeId, f64, u64)> = Vec::new();
        for target in targets {
            let snap = self.lookup_target(host, &target, now).await?;
            if snap.capacity_sat == 0 {
                continue;
            }
            let mut hive_capacity = 0u64;
            for state in &states {
                let reported: u64 = state
                    .channels
                    .iter()
                    .filter(|c| c.peer == target)
                    .map(|c| c.capacity_sat)
                    .sum();
                if reported == 0 {
                    continue;
                }
                // Trust the public graph over gossip for the pair.
                let public = host.pair_capacity(&state.pubkey, &target).await.unwrap_or(reported);
                hive_capacity += reported.min(public);
            }
            let share = hive_capacity as f64 / snap.capacity_sat as f64;
            shares.push((target, share, snap.capacity_sat));
        }
        report.scored = shares.len();

        // Saturation pass. Decide everything before touching the bridge so a
        // mass-saturation cycle aborts without half-applying.
        let fresh_inhibits: Vec<NodeId> = {
            let mut out = Vec::new();
            for (target, share, _) in &shares {
                if *share > self.cfg.saturation_share && !self.store.is_inhibited(target)? {
                    out.push(*target);
                }
            }
            out
        };
        if fresh_inhibits.len() > self.cfg.max_ignore_per_cycle {
            warn!(
                "mass saturation: {} targets over {:.0}% share, aborting cycle",
                fresh_inhibits.len(),
                self.cfg.saturation_share * 100.0
            );
            self.log(now, "mass_saturation", &local, &format!("{} targets", fresh_inhibits.len()))?;
            report.aborted = true;
            return Ok(report);
        }

        for target in fresh_inhibits {
            match self.bridge.inhibit_opens(&target).await {
                Ok(()) => {
                    self.store.set_inhibit(&target, now)?;
                    self.log(now, "inhibit", &target, "share over saturation threshold")?;
                    report.inhibited.push(target);
                }
                Err(e) => debug!("inhibit for {} deferred: {e}", target.short()),
            }
        }

        // Release pass: hysteresis below the release threshold.
        let share_of: HashMap<NodeId, f64> = shares.iter().map(|(t, s, _)| (*t, *s)).collect();
        for target in self.store.inhibited_peers()? {
            let share = share_of.get(&target).copied().unwrap_or(0.0);
            if share < self.cfg.release_share {
                match self.bridge.release_inhibit(&target).await {
                    Ok(()) => {
                        self.store.clear_inhibit(&target)?;
                        self.log(now, "release", &target, "share decayed")?;
                        report.released.push(target);
                    }
                    Err(e) => debug!("release for {} deferred: {e}", target.short()),
                }
            }
        }

        // Expansion pass: at most one proposal per cycle.
        if !report.aborted {
            report.announced = self.propose_expansion(&states, &shares, local, now).await?;
        }
        Ok(report)
    }

    /// Pick one underserved target and, if we are the deterministically
    /// selected opener, announce the channel_open intent.
    async fn propose_expansion(
        &self,
        states: &[PeerState],
        shares: &[(NodeId, f64, u64)],
        local: NodeId,
        now: u64,
    ) -> Result<Option<Intent>> {
        let mut candidates: Vec<(NodeId, f64, u64)> = Vec::new();
        for (target, share, capacity) in shares {
            if *share >= self.cfg.expansion_share {
                continue;
            }
            if *capacity < self.cfg.expansion_min_capacity_sat {
                continue;
            }
            let first_seen = {
                let snapshot = self.snapshot.lock().expect("snapshot lock");
                snapshot.get(target).and_then(|s| s.first_seen)
            };
            let Some(first_seen) = first_seen else { continue };
            if now.saturating_sub(first_seen) < self.cfg.expansion_min_age_days * SECS_PER_DAY {
                continue;
            }
            candidates.push((*target, *share, *capacity));
        }
        if candidates.is_empty() {
            return Ok(None);
        }
        // Lowest share first, largest capacity breaking ties.
        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
        });
        let (target, share, _) = candidates[0];

        // Opener: idle funds, nothing pending, reliable. Sorted by pubkey
        // and indexed by the target digest so every node picks the same one.
        let mut eligible: Vec<NodeId> = Vec::new();
        for state in states {
            if state.available_funds_sat < self.cfg.expansion_open_sat {
                continue;
            }
            if self.intents.has_pending_from(&state.pubkey)? {
                continue;
            }
            let window = self.cfg.probation_days * SECS_PER_DAY;
            let uptime = self.membership.uptime_pct(&state.pubkey, window, now)?;
            if state.pubkey != local && uptime <= self.cfg.opener_min_uptime_pct {
                continue;
            }
            eligible.push(state.pubkey);
        }
        if eligible.is_empty() {
            debug!("no eligible opener for expansion toward {}", target.short());
            return Ok(None);
        }
        eligible.sort();
        let digest = Sha256::digest(target.0);
        let index = u64::from_be_bytes(digest[..8].try_into().unwrap_or([0; 8])) as usize % eligible.len();
        let opener = eligible[index];

        self.log(
            now,
            "expansion",
            &target,
            &format!("share {:.3}, opener {}", share, opener.short()),
        )?;
        if opener != local {
            debug!("expansion toward {} belongs to {}", target.short(), opener.short());
            return Ok(None);
        }

        info!("proposing expansion: open {} sat toward {}", self.cfg.expansion_open_sat, target.short());
        self.intents
            .announce(IntentKind::ChannelOpen, target, self.cfg.expansion_open_sat, local, now)
    }

    async fn lookup_target(&self, host: &dyn HostNode, target: &NodeId, now: u64) -> Result<TargetSnapshot> {
        {
            let snapshot = self.snapshot.lock().expect("snapshot lock");
            if let Some(snap) = snapshot.get(target) {
                if now.saturating_sub(snap.fetched_at) < SNAPSHOT_TTL_SECS {
                    return Ok(*snap);
                }
            }
        }
        let capacity_sat = host.node_capacity(target).await.unwrap_or(0);
        let first_seen = host.node_first_seen(target).await.unwrap_or(None);
        let mut snapshot = self.snapshot.lock().expect("snapshot lock");
        let snap = TargetSnapshot {
            capacity_sat,
            // Never let a refresh forget how long we have known the target.
            first_seen: first_seen.or_else(|| snapshot.get(target).and_then(|s| s.first_seen)),
            fetched_at: now,
        };
        if !snapshot.contains_key(target) && snapshot.len() >= SNAPSHOT_CAP {
            if let Some(stalest) = snapshot
                .iter()
                .min_by_key(|(_, s)| s.fetched_at)
                .map(|(k, _)| *k)
            {
                snapshot.remove(&stalest);
            }
        }
        snapshot.insert(*target, snap);
        Ok(snap)
    }

    fn log(&self, now: u64, decision: &str, target: &NodeId, outcome: &str) -> Result<()> {
        self.store.append_planner(
            &PlannerEntry {
                timestamp: now,
                decision: decision.to_string(),
                target: *target,
                outcome: outcome.to_string(),
            },
            self.cfg.planner_log_cap,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, BridgeConfig, ExecutorClient, ExecutorStatus, PolicyKind};
    use crate::contribution::Ledger;
    use crate::error::Result;
    use crate::node::LocalChannel;
    use crate::types::{ChannelSummary, Health, Member, Tier};
    use async_trait::async_trait;

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    struct GraphHost {
        id: NodeId,
        capacities: HashMap<NodeId, u64>,
        first_seen: u64,
    }

    #[async_trait]
    impl HostNode for GraphHost {
        fn local_id(&self) -> NodeId {
            self.id
        }
        async fn send_custom_msg(&self, _: &NodeId, _: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn sign_message(&self, m: &str) -> Result<String> {
            Ok(format!("sig:{m}"))
        }
        async fn verify_message(&self, _: &NodeId, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn list_channels(&self) -> Result<Vec<LocalChannel>> {
            Ok(vec![])
        }
        async fn onchain_sat(&self) -> Result<u64> {
            Ok(0)
        }
        async fn node_capacity(&self, n: &NodeId) -> Result<u64> {
            Ok(self.capacities.get(n).copied().unwrap_or(0))
        }
        async fn pair_capacity(&self, _: &NodeId, _: &NodeId) -> Result<u64> {
            // Public graph confirms whatever is reported.
            Ok(u64::MAX)
        }
        async fn node_first_seen(&self, _: &NodeId) -> Result<Option<u64>> {
            Ok(Some(self.first_seen))
        }
    }

    struct OkExecutor;

    #[async_trait]
    impl ExecutorClient for OkExecutor {
        async fn status(&self) -> Result<ExecutorStatus> {
            Ok(ExecutorStatus { version: 2, ready: true })
        }
        async fn set_policy(&self, _: &NodeId, _: PolicyKind) -> Result<()> {
            Ok(())
        }
        async fn trigger_rebalance(&self, _: &NodeId, _: u64) -> Result<()> {
            Ok(())
        }
        async fn inhibit_opens(&self, _: &NodeId) -> Result<()> {
            Ok(())
        }
        async fn release_inhibit(&self, _: &NodeId) -> Result<()> {
            Ok(())
        }
        async fn open_channel(&self, _: &NodeId, _: u64) -> Result<()> {
            Ok(())
        }
    }

    fn setup() -> (Arc<Store>, Planner) {
        let dir = std::env::temp_dir().join(format!("hive-planner-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        let cfg = Arc::new(HiveConfig::default());
        let bridge = Arc::new(Bridge::new(Arc::new(OkExecutor), BridgeConfig::from_hive(&cfg)));
        let intents = Arc::new(IntentManager::new(store.clone(), cfg.clone()));
        let ledger = Arc::new(Ledger::new(store.clone(), cfg.clone()).unwrap());
        let membership = Arc::new(Membership::new(store.clone(), cfg.clone(), ledger));
        let planner = Planner::new(store.clone(), cfg, bridge, intents, membership);
        (store, planner)
    }

    fn admit_with_state(store: &Store, b: u8, channels: Vec<ChannelSummary>, funds: u64) {
        store
            .put_member(&Member {
                pubkey: node(b),
                tier: Tier::Member,
                joined_at: 0,
                last_seen: 0,
                banned: false,
            })
            .unwrap();
        store
            .put_peer_state(&PeerState {
                pubkey: node(b),
                version: 1,
                timestamp: 0,
                capacity_sat: channels.iter().map(|c| c.capacity_sat).sum(),
                available_funds_sat: funds,
                channels,
                fee_policy_hash: String::new(),
                health: Health::Good,
            })
            .unwrap();
    }

    const DAY: u64 = 86_400;

    #[tokio::test]
    async fn saturated_target_gets_inhibited() {
        let (store, planner) = setup();
        let target = node(200);
        // One member holding 30% of the target's public capacity.
        admit_with_state(&store, 1, vec![ChannelSummary { peer: target, capacity_sat: 3_000_000 }], 0);
        let host = GraphHost {
            id: node(1),
            capacities: HashMap::from([(target, 10_000_000)]),
            first_seen: 0,
        };
        let report = planner.run_cycle(&host, 100 * DAY).await.unwrap();
        assert_eq!(report.inhibited, vec![target]);
        assert!(store.is_inhibited(&target).unwrap());
    }

    #[tokio::test]
    async fn share_exactly_at_threshold_not_inhibited() {
        let (store, planner) = setup();
        let target = node(200);
        admit_with_state(&store, 1, vec![ChannelSummary { peer: target, capacity_sat: 2_000_000 }], 0);
        let host = GraphHost {
            id: node(1),
            capacities: HashMap::from([(target, 10_000_000)]),
            first_seen: 0,
        };
        let report = planner.run_cycle(&host, 100 * DAY).await.unwrap();
        // Share is exactly 0.20: strictly-greater rule says leave it alone.
        assert!(report.inhibited.is_empty());
    }

    #[tokio::test]
    async fn release_after_decay() {
        let (store, planner) = setup();
        let target = node(200);
        admit_with_state(&store, 1, vec![ChannelSummary { peer: target, capacity_sat: 1_000_000 }], 0);
        store.set_inhibit(&target, 0).unwrap();
        let host = GraphHost {
            id: node(1),
            capacities: HashMap::from([(target, 10_000_000)]),
            first_seen: 0,
        };
        // Share 0.10 < 0.15: released.
        let report = planner.run_cycle(&host, 100 * DAY).await.unwrap();
        assert_eq!(report.released, vec![target]);
        assert!(!store.is_inhibited(&target).unwrap());
    }

    #[tokio::test]
    async fn mass_saturation_aborts_cycle() {
        let (store, planner) = setup();
        let mut channels = Vec::new();
        let mut capacities = HashMap::new();
        for i in 0..10u8 {
            let target = node(200 + i);
            channels.push(ChannelSummary { peer: target, capacity_sat: 5_000_000 });
            capacities.insert(target, 10_000_000);
        }
        admit_with_state(&store, 1, channels, 0);
        let host = GraphHost { id: node(1), capacities, first_seen: 0 };
        let report = planner.run_cycle(&host, 100 * DAY).await.unwrap();
        assert!(report.aborted);
        assert!(report.inhibited.is_empty());
        for i in 0..10u8 {
            assert!(!store.is_inhibited(&node(200 + i)).unwrap());
        }
    }

    #[tokio::test]
    async fn expansion_announced_by_chosen_opener() {
        let (store, planner) = setup();
        let target = node(200);
        // Someone else holds a sliver of the target; we are flush and idle.
        admit_with_state(&store, 2, vec![ChannelSummary { peer: target, capacity_sat: 100_000 }], 0);
        admit_with_state(&store, 1, vec![], 50_000_000);
        let host = GraphHost {
            id: node(1),
            capacities: HashMap::from([(target, 100_000_000)]),
            first_seen: 0,
        };
        let report = planner.run_cycle(&host, 100 * DAY).await.unwrap();
        // Only member 1 is fund-eligible, so the digest picks it.
        let intent = report.announced.expect("expansion intent");
        assert_eq!(intent.kind, IntentKind::ChannelOpen);
        assert_eq!(intent.target, target);
    }

    #[tokio::test]
    async fn young_target_not_expanded() {
        let (store, planner) = setup();
        let target = node(200);
        admit_with_state(&store, 2, vec![ChannelSummary { peer: target, capacity_sat: 100_000 }], 0);
        admit_with_state(&store, 1, vec![], 50_000_000);
        let now = 100 * DAY;
        let host = GraphHost {
            id: node(1),
            capacities: HashMap::from([(target, 100_000_000)]),
            first_seen: now - 5 * DAY, // five days old, minimum is 30
        };
        let report = planner.run_cycle(&host, now).await.unwrap();
        assert!(report.announced.is_none());
    }
}
