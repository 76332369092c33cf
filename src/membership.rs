//! Membership: tier machine, uptime accounting, vouch-quorum promotion,
//! leech detection
//!
//! Promotion is decided independently at every node: each member re-runs the
//! three criteria against data it owns, vouches if satisfied, and accepts a
//! promotion proof only after re-verifying every vouch in it. There is no
//! trusted aggregator.

use crate::config::HiveConfig;
use crate::contribution::Ledger;
use crate::error::{HiveError, Result};
use crate::node::HostNode;
use crate::store::Store;
use crate::types::{
    vouch_message, Intent, IntentKind, NodeId, PresenceEvent, PresenceKind, PromotionRequest,
    PromotionVouch, RequestId, Tier,
};
use crate::wire::{Message, PromotionPayload, PromotionRequestPayload};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SECS_PER_DAY: u64 = 86_400;

/// Criteria evaluation for one candidate, from this node's own data.
#[derive(Debug, Clone)]
pub struct CriteriaReport {
    pub uptime_pct: f64,
    pub ratio: f64,
    pub brings_unique_peer: bool,
}

impl CriteriaReport {
    pub fn satisfied(&self, cfg: &HiveConfig) -> bool {
        self.uptime_pct >= cfg.uptime_threshold_pct && self.ratio >= 1.0 && self.brings_unique_peer
    }
}

pub struct Membership {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    ledger: Arc<Ledger>,
}

impl Membership {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>, ledger: Arc<Ledger>) -> Self {
        Self { store, cfg, ledger }
    }

    // =========================================================================
    // PRESENCE / UPTIME
    // =========================================================================

    pub fn on_peer_connected(&self, peer: &NodeId, now: u64) -> Result<()> {
        if self.store.member(peer)?.is_none() {
            return Ok(());
        }
        self.store.touch_member(peer, now)?;
        self.store
            .append_presence(&PresenceEvent { peer: *peer, kind: PresenceKind::Up, timestamp: now })
    }

    pub fn on_peer_disconnected(&self, peer: &NodeId, now: u64) -> Result<()> {
        if self.store.member(peer)?.is_none() {
            return Ok(());
        }
        self.store
            .append_presence(&PresenceEvent { peer: *peer, kind: PresenceKind::Down, timestamp: now })
    }

    /// Uptime percentage over `[now - window, now]`, from connect/disconnect
    /// events. Clamped to [0, 100]; events stamped in the future (clock
    /// skew) force 0 rather than ever going negative.
    pub fn uptime_pct(&self, peer: &NodeId, window_secs: u64, now: u64) -> Result<f64> {
        let events = self.store.presence_events(peer, 0)?;
        Ok(uptime_from_events(&events, window_secs, now))
    }

    // =========================================================================
    // CRITERIA
    // =========================================================================

    pub fn evaluate(&self, subject: &NodeId, now: u64) -> Result<CriteriaReport> {
        let window = self.cfg.probation_days * SECS_PER_DAY;
        let uptime_pct = self.uptime_pct(subject, window, now)?;
        let ratio = self.ledger.ratio(subject, now)?;
        let brings_unique_peer = self.brings_unique_peer(subject)?;
        Ok(CriteriaReport { uptime_pct, ratio, brings_unique_peer })
    }

    /// Topological uniqueness: the candidate's channel set contains at least
    /// one peer no existing full member is connected to.
    fn brings_unique_peer(&self, subject: &NodeId) -> Result<bool> {
        let Some(subject_state) = self.store.peer_state_of(subject)? else {
            return Ok(false);
        };
        let mut fleet_peers: HashSet<NodeId> = HashSet::new();
        for member in self.store.voting_members()? {
            if member.pubkey == *subject {
                continue;
            }
            if let Some(state) = self.store.peer_state_of(&member.pubkey)? {
                fleet_peers.extend(state.channels.iter().map(|c| c.peer));
            }
        }
        Ok(subject_state
            .channels
            .iter()
            .any(|c| !fleet_peers.contains(&c.peer)))
    }

    /// Promotion quorum over the current voting set.
    pub fn quorum(&self) -> Result<usize> {
        let voters = self.store.voting_members()?.len();
        Ok(3.max((51 * voters).div_ceil(100)))
    }

    // =========================================================================
    // PROMOTION FLOW
    // =========================================================================

    /// Start our own promotion round.
    pub fn request_promotion(&self, local: NodeId, now: u64) -> Result<PromotionRequestPayload> {
        let request_id = RequestId::random();
        self.store.put_promotion_request(&PromotionRequest {
            subject: local,
            request_id,
            requested_at: now,
        })?;
        Ok(PromotionRequestPayload { subject: local, request_id, timestamp: now })
    }

    /// A candidate asks for vouches: re-evaluate independently and vouch iff
    /// every criterion holds and we are a full member ourselves.
    pub async fn on_promotion_request(
        &self,
        host: &dyn HostNode,
        sender: &NodeId,
        payload: &PromotionRequestPayload,
        now: u64,
    ) -> Result<Option<Message>> {
        if payload.subject != *sender {
            return Err(HiveError::Unauthorised("promotion request for someone else".into()));
        }
        let local = host.local_id();
        let me = self.store.member(&local)?;
        if me.map(|m| m.tier) != Some(Tier::Member) {
            return Ok(None);
        }
        match self.store.member(sender)? {
            Some(m) if m.is_active() && m.tier == Tier::Neophyte => {}
            _ => return Ok(None),
        }

        let report = self.evaluate(sender, now)?;
        if !report.satisfied(&self.cfg) {
            debug!(
                "not vouching for {}: uptime {:.2}% ratio {:.3} unique {}",
                sender.short(),
                report.uptime_pct,
                report.ratio,
                report.brings_unique_peer
            );
            return Ok(None);
        }

        self.store.put_promotion_request(&PromotionRequest {
            subject: payload.subject,
            request_id: payload.request_id,
            requested_at: payload.timestamp.min(now),
        })?;

        let hive_id = self
            .store
            .hive_id()?
            .ok_or_else(|| HiveError::Invariant("vouching without a hive id".into()))?;
        let message = vouch_message(&payload.subject, &local, &payload.request_id, &hive_id);
        let signature = host.sign_message(&message).await?;
        let vouch = PromotionVouch {
            subject: payload.subject,
            voucher: local,
            request_id: payload.request_id,
            signature,
            timestamp: now,
        };
        self.store.insert_vouch(&vouch)?;
        info!("vouching for {}", sender.short());
        Ok(Some(Message::Vouch(vouch)))
    }

    /// Verify and record a vouch. When we are the subject and quorum is met,
    /// commit our own tier change and return the PROMOTION proof to
    /// broadcast.
    pub async fn on_vouch(
        &self,
        host: &dyn HostNode,
        sender: &NodeId,
        vouch: &PromotionVouch,
        now: u64,
    ) -> Result<Option<Message>> {
        if vouch.voucher != *sender {
            return Err(HiveError::Unauthorised("vouch relayed by non-voucher".into()));
        }
        self.verify_vouch(host, vouch, now).await?;

        if !self.store.insert_vouch(vouch)? {
            debug!("duplicate vouch from {} ignored", vouch.voucher.short());
            return Ok(None);
        }

        let local = host.local_id();
        if vouch.subject != local {
            return Ok(None);
        }
        if self.store.member(&local)?.map(|m| m.tier) == Some(Tier::Member) {
            return Ok(None);
        }

        let collected = self.store.vouches_for(&local, &vouch.request_id)?;
        let quorum = self.quorum()?;
        if collected.len() < quorum {
            debug!("promotion progress: {}/{quorum} vouches", collected.len());
            return Ok(None);
        }

        self.store.promote_member(&local, now)?;
        info!("promotion quorum reached ({quorum}), committing tier change");
        Ok(Some(Message::Promotion(PromotionPayload {
            subject: local,
            request_id: vouch.request_id,
            vouches: collected,
        })))
    }

    /// Verify a full promotion proof from a freshly promoted subject. Every
    /// vouch is re-checked: signature, voucher standing, uniqueness and
    /// freshness. Returns true when the tier change was committed.
    pub async fn on_promotion(
        &self,
        host: &dyn HostNode,
        sender: &NodeId,
        payload: &PromotionPayload,
        now: u64,
    ) -> Result<bool> {
        if payload.subject != *sender {
            return Err(HiveError::Unauthorised("promotion proof for someone else".into()));
        }
        if payload.vouches.len() > crate::wire::MAX_PROMOTION_VOUCHES {
            return Err(HiveError::Malformed("promotion proof too large".into()));
        }
        match self.store.member(sender)? {
            Some(m) if m.is_active() => {
                if m.tier == Tier::Member {
                    return Ok(true);
                }
            }
            _ => return Err(HiveError::Unauthorised("promotion from unknown subject".into())),
        }

        let mut distinct: HashSet<NodeId> = HashSet::new();
        let mut valid = 0usize;
        for vouch in &payload.vouches {
            if vouch.subject != payload.subject || vouch.request_id != payload.request_id {
                continue;
            }
            if !distinct.insert(vouch.voucher) {
                continue;
            }
            match self.verify_vouch(host, vouch, now).await {
                Ok(()) => valid += 1,
                Err(e) => debug!("vouch from {} rejected: {e}", vouch.voucher.short()),
            }
        }

        let quorum = self.quorum()?;
        if valid < quorum {
            warn!(
                "promotion proof for {} has {valid}/{quorum} valid vouches, refusing",
                payload.subject.short()
            );
            return Ok(false);
        }

        self.store.promote_member(&payload.subject, now)?;
        info!("accepted promotion of {}", payload.subject.short());
        Ok(true)
    }

    async fn verify_vouch(&self, host: &dyn HostNode, vouch: &PromotionVouch, now: u64) -> Result<()> {
        match self.store.member(&vouch.voucher)? {
            Some(m) if m.is_active() && m.tier == Tier::Member => {}
            _ => return Err(HiveError::Unauthorised("voucher is not a full member".into())),
        }
        if now.saturating_sub(vouch.timestamp) > self.cfg.vouch_ttl_secs {
            return Err(HiveError::Stale("vouch past ttl"));
        }
        let hive_id = self
            .store
            .hive_id()?
            .ok_or_else(|| HiveError::Invariant("verifying vouch without hive id".into()))?;
        let message = vouch_message(&vouch.subject, &vouch.voucher, &vouch.request_id, &hive_id);
        if !host
            .verify_message(&vouch.voucher, &message, &vouch.signature)
            .await?
        {
            return Err(HiveError::Unauthorised("vouch signature invalid".into()));
        }
        Ok(())
    }

    // =========================================================================
    // LEECH DETECTION
    // =========================================================================

    /// Daily evaluation of member contribution ratios. A ratio below the
    /// policy threshold demotes the peer's rebalance priority; a ratio below
    /// the ban threshold for `leech_ban_days` consecutive days announces a
    /// ban intent. Returns the intents to broadcast.
    pub async fn leech_tick(
        &self,
        bridge: &crate::bridge::Bridge,
        intents: &crate::intent::IntentManager,
        local: NodeId,
        now: u64,
    ) -> Result<Vec<Intent>> {
        let today = now / SECS_PER_DAY;
        let mut announced = Vec::new();

        for member in self.store.voting_members()? {
            if member.pubkey == local {
                continue;
            }
            let ratio = self.ledger.ratio(&member.pubkey, now)?;

            let kind = if ratio < self.cfg.leech_policy_ratio {
                crate::bridge::PolicyKind::Default
            } else {
                crate::bridge::PolicyKind::Hive
            };
            if let Err(e) = bridge.set_policy(&member.pubkey, kind).await {
                debug!("policy update for {} deferred: {e}", member.pubkey.short());
            }

            let (streak, last_day) = self.store.leech_streak(&member.pubkey)?;
            if last_day == today {
                continue;
            }
            let streak = if ratio < self.cfg.leech_ban_ratio { streak + 1 } else { 0 };
            self.store.set_leech_streak(&member.pubkey, streak, today)?;

            if streak >= self.cfg.leech_ban_days {
                warn!(
                    "{} below ratio {} for {streak} days, proposing ban",
                    member.pubkey.short(),
                    self.cfg.leech_ban_ratio
                );
                if let Some(intent) =
                    intents.announce(IntentKind::BanPeer, member.pubkey, 0, local, now)?
                {
                    announced.push(intent);
                }
                self.store.set_leech_streak(&member.pubkey, 0, today)?;
            }
        }
        Ok(announced)
    }

    /// Presence maintenance: the uptime criterion only ever looks twice the
    /// probation window back.
    pub fn prune_presence(&self, now: u64) -> Result<()> {
        let horizon = now.saturating_sub(2 * self.cfg.probation_days * SECS_PER_DAY);
        self.store.prune_presence_before(horizon)?;
        self.store
            .prune_vouches_before(now.saturating_sub(self.cfg.vouch_ttl_secs))?;
        self.store
            .prune_promotion_requests_before(now.saturating_sub(2 * self.cfg.vouch_ttl_secs))?;
        Ok(())
    }
}

/// Integrate connected time over the window from up/down transitions.
/// The state before the first event is inferred from that event (a Down
/// implies previously up and vice versa); no events at all counts as up.
pub fn uptime_from_events(events: &[PresenceEvent], window_secs: u64, now: u64) -> f64 {
    if window_secs == 0 {
        return 0.0;
    }
    // Clock skew: an event from the future poisons the whole window.
    if events.iter().any(|e| e.timestamp > now) {
        return 0.0;
    }
    let window_start = now.saturating_sub(window_secs);

    let mut sorted: Vec<&PresenceEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    // State at window start: the last event before the window decides; with
    // none, the first event inside it implies the prior state.
    let mut up = match sorted.iter().rev().find(|e| e.timestamp <= window_start) {
        Some(e) => e.kind == PresenceKind::Up,
        None => match sorted.iter().find(|e| e.timestamp > window_start) {
            Some(first) => first.kind == PresenceKind::Down,
            None => true,
        },
    };

    let mut up_secs = 0u64;
    let mut cursor = window_start;
    for event in sorted.iter().filter(|e| e.timestamp > window_start) {
        if up {
            up_secs += event.timestamp - cursor;
        }
        cursor = event.timestamp;
        up = event.kind == PresenceKind::Up;
    }
    if up {
        up_secs += now - cursor;
    }

    let pct = up_secs as f64 * 100.0 / window_secs as f64;
    pct.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn ev(kind: PresenceKind, ts: u64) -> PresenceEvent {
        PresenceEvent { peer: node(1), kind, timestamp: ts }
    }

    #[test]
    fn no_events_means_full_uptime() {
        assert_eq!(uptime_from_events(&[], 1000, 5000), 100.0);
    }

    #[test]
    fn future_event_forces_zero() {
        let events = vec![ev(PresenceKind::Up, 9000)];
        assert_eq!(uptime_from_events(&events, 1000, 5000), 0.0);
    }

    #[test]
    fn single_outage_integrates() {
        // Window [4000, 5000]; down from 4400 to 4600: 800/1000 up.
        let events = vec![ev(PresenceKind::Down, 4400), ev(PresenceKind::Up, 4600)];
        let pct = uptime_from_events(&events, 1000, 5000);
        assert!((pct - 80.0).abs() < 1e-9);
    }

    #[test]
    fn threshold_boundary_exact() {
        // 99.5% of a 200 000 s window = 1000 s of downtime exactly.
        let window = 200_000;
        let now = 1_000_000;
        let events = vec![
            ev(PresenceKind::Down, now - 1000),
            ev(PresenceKind::Up, now),
        ];
        let pct = uptime_from_events(&events, window, now);
        assert!((pct - 99.5).abs() < 1e-9);
        assert!(pct >= 99.5);

        // One extra second of downtime drops below the bar.
        let events = vec![
            ev(PresenceKind::Down, now - 1001),
            ev(PresenceKind::Up, now),
        ];
        assert!(uptime_from_events(&events, window, now) < 99.5);
    }

    #[test]
    fn down_before_window_counts_from_start() {
        // Went down long before the window and never came back.
        let events = vec![ev(PresenceKind::Down, 100)];
        assert_eq!(uptime_from_events(&events, 1000, 5000), 0.0);
    }

    #[test]
    fn quorum_formula() {
        // max(3, ceil(0.51 n))
        assert_eq!(3.max((51usize * 2).div_ceil(100)), 3);
        assert_eq!(3.max((51usize * 5).div_ceil(100)), 3);
        assert_eq!(3.max((51usize * 7).div_ceil(100)), 4);
        assert_eq!(3.max((51usize * 10).div_ceil(100)), 6);
    }
}
