//! Contribution ledger: per-forward accounting with hard caps
//!
//! Each host forward event involving a member appends one row. Every cap is
//! enforced before insertion: a per-peer hourly rate, a global daily count
//! and an absolute table size. Derived totals are cached briefly because the
//! 30-day window scan is not free.

use crate::config::HiveConfig;
use crate::error::Result;
use crate::store::Store;
use crate::types::{ContributionEntry, ContributionTotals, Direction, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

const SECS_PER_HOUR: u64 = 3600;
const SECS_PER_DAY: u64 = 86_400;

struct Counters {
    /// (hour bucket, count) per peer. Stale buckets are dropped on touch.
    per_peer_hour: HashMap<NodeId, (u64, usize)>,
    /// (day bucket, count) globally.
    day: (u64, usize),
    rows: usize,
}

pub struct Ledger {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    counters: Mutex<Counters>,
    cache: Mutex<HashMap<NodeId, (ContributionTotals, Instant)>>,
}

impl Ledger {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>) -> Result<Self> {
        let rows = store.contribution_rows()?;
        Ok(Self {
            store,
            cfg,
            counters: Mutex::new(Counters {
                per_peer_hour: HashMap::new(),
                day: (0, 0),
                rows,
            }),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Account one host forward event. Only sides that are active members
    /// produce rows; caps silently drop the rest.
    pub fn on_forward(
        &self,
        in_peer: Option<NodeId>,
        out_peer: Option<NodeId>,
        in_msat: u64,
        out_msat: u64,
        now: u64,
    ) -> Result<()> {
        if let Some(peer) = out_peer {
            if self.is_active_member(&peer)? {
                self.record(peer, Direction::Forwarded, out_msat, now)?;
            }
        }
        if let Some(peer) = in_peer {
            if self.is_active_member(&peer)? {
                self.record(peer, Direction::Received, in_msat, now)?;
            }
        }
        Ok(())
    }

    fn is_active_member(&self, peer: &NodeId) -> Result<bool> {
        Ok(self.store.member(peer)?.map(|m| m.is_active()) == Some(true))
    }

    fn record(&self, peer: NodeId, direction: Direction, amount_msat: u64, now: u64) -> Result<bool> {
        {
            let mut counters = self.counters.lock().expect("counters lock");
            let hour = now / SECS_PER_HOUR;
            let day = now / SECS_PER_DAY;

            // Keep the per-peer map bounded: stale hour buckets vanish.
            counters.per_peer_hour.retain(|_, (h, _)| *h == hour);

            let peer_count = match counters.per_peer_hour.get(&peer) {
                Some((h, n)) if *h == hour => *n,
                _ => 0,
            };
            if peer_count >= self.cfg.max_contrib_per_peer_hour {
                debug!("contribution rate cap hit for {}", peer.short());
                return Ok(false);
            }

            if counters.day.0 != day {
                counters.day = (day, 0);
            }
            if counters.day.1 >= self.cfg.max_contrib_per_day {
                debug!("global daily contribution cap hit");
                return Ok(false);
            }

            if counters.rows >= self.cfg.max_contrib_rows {
                let trimmed = self.store.trim_contributions_to(self.cfg.max_contrib_rows - 1)?;
                counters.rows = counters.rows.saturating_sub(trimmed);
                warn!("contribution table at cap, pruned {trimmed} oldest rows");
            }

            counters.per_peer_hour.insert(peer, (hour, peer_count + 1));
            counters.day.1 += 1;
            counters.rows += 1;
        }

        self.store.append_contribution(&ContributionEntry {
            peer,
            direction,
            amount_msat,
            timestamp: now,
        })?;
        self.cache.lock().expect("cache lock").remove(&peer);
        Ok(true)
    }

    /// Rolling 30-day totals, cached with a short TTL.
    pub fn totals(&self, peer: &NodeId, now: u64) -> Result<ContributionTotals> {
        {
            let cache = self.cache.lock().expect("cache lock");
            if let Some((totals, at)) = cache.get(peer) {
                if at.elapsed().as_secs() < self.cfg.contrib_cache_ttl_secs {
                    return Ok(*totals);
                }
            }
        }
        let since = now.saturating_sub(30 * SECS_PER_DAY);
        let totals = self.store.contribution_totals_since(peer, since)?;
        let mut cache = self.cache.lock().expect("cache lock");
        if cache.len() >= self.cfg.max_members * 2 {
            cache.clear();
        }
        cache.insert(*peer, (totals, Instant::now()));
        Ok(totals)
    }

    pub fn ratio(&self, peer: &NodeId, now: u64) -> Result<f64> {
        Ok(self.totals(peer, now)?.ratio())
    }

    /// Maintenance-loop pruning: retention window plus counter resync.
    pub fn maintenance(&self, now: u64) -> Result<()> {
        let horizon = now.saturating_sub(self.cfg.contrib_retention_days * SECS_PER_DAY);
        let removed = self.store.prune_contributions_before(horizon)?;
        if removed > 0 {
            debug!("pruned {removed} contribution rows past retention");
        }
        let mut counters = self.counters.lock().expect("counters lock");
        counters.rows = self.store.contribution_rows()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Member, Tier};

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn setup() -> Ledger {
        let dir = std::env::temp_dir().join(format!("hive-ledger-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        store
            .put_member(&Member {
                pubkey: node(1),
                tier: Tier::Member,
                joined_at: 0,
                last_seen: 0,
                banned: false,
            })
            .unwrap();
        Ledger::new(store, Arc::new(HiveConfig::default())).unwrap()
    }

    #[test]
    fn non_member_forwards_are_not_recorded() {
        let ledger = setup();
        ledger.on_forward(Some(node(9)), Some(node(8)), 5, 5, 1000).unwrap();
        assert_eq!(ledger.store.contribution_rows().unwrap(), 0);
    }

    #[test]
    fn member_sides_are_recorded() {
        let ledger = setup();
        // node(1) is the out peer: we forwarded to the hive.
        ledger.on_forward(Some(node(9)), Some(node(1)), 5, 1000, 1000).unwrap();
        let totals = ledger.totals(&node(1), 1000).unwrap();
        assert_eq!(totals.forwarded_msat, 1000);
        assert_eq!(totals.received_msat, 0);
    }

    #[test]
    fn per_peer_hourly_cap_binds() {
        let ledger = setup();
        let cap = ledger.cfg.max_contrib_per_peer_hour;
        for i in 0..(cap + 10) {
            ledger
                .record(node(1), Direction::Forwarded, 1, 1000 + i as u64)
                .unwrap();
        }
        assert_eq!(ledger.store.contribution_rows().unwrap(), cap);
    }

    #[test]
    fn hourly_cap_resets_next_hour() {
        let ledger = setup();
        let cap = ledger.cfg.max_contrib_per_peer_hour;
        for i in 0..cap {
            ledger.record(node(1), Direction::Forwarded, 1, 1000 + i as u64).unwrap();
        }
        assert!(!ledger.record(node(1), Direction::Forwarded, 1, 1100).unwrap());
        assert!(ledger.record(node(1), Direction::Forwarded, 1, 1000 + 3600).unwrap());
    }

    #[test]
    fn ratio_boundary() {
        let ledger = setup();
        ledger.record(node(1), Direction::Forwarded, 1000, 100).unwrap();
        ledger.record(node(1), Direction::Received, 1000, 101).unwrap();
        assert_eq!(ledger.ratio(&node(1), 200).unwrap(), 1.0);
    }

    #[test]
    fn cache_serves_stale_until_invalidated() {
        let ledger = setup();
        ledger.record(node(1), Direction::Forwarded, 100, 100).unwrap();
        let first = ledger.totals(&node(1), 200).unwrap();
        // A new row invalidates the cache entry for that peer.
        ledger.record(node(1), Direction::Forwarded, 50, 150).unwrap();
        let second = ledger.totals(&node(1), 200).unwrap();
        assert!(second.forwarded_msat > first.forwarded_msat);
    }

    #[test]
    fn retention_prune() {
        let ledger = setup();
        let day = 86_400;
        let now = 100 * day;
        ledger.record(node(1), Direction::Forwarded, 1, now - 50 * day).unwrap();
        ledger.record(node(1), Direction::Forwarded, 1, now - 10 * day).unwrap();
        ledger.maintenance(now).unwrap();
        assert_eq!(ledger.store.contribution_rows().unwrap(), 1);
    }
}
