//! Governance: the single funnel for executable actions
//!
//! Every fund-affecting action (committed intents from the lock protocol,
//! leech bans, approved expansions) lands here as a `PendingAction` and is
//! decided by the configured mode:
//!
//! - advisor: queue and notify; an operator approves or rejects out of band
//! - autonomous: execute immediately iff every safety rail passes
//! - oracle: ask an external endpoint; any failure falls back to advisor
//!
//! No component calls the bridge directly for an executable action, and a
//! committed intent never executes by itself. Fund-affecting paths fail
//! closed: on any uncertainty, nothing runs.

use crate::bridge::{Bridge, PolicyKind};
use crate::config::HiveConfig;
use crate::error::{HiveError, Result};
use crate::store::Store;
use crate::types::{ActionStatus, Intent, IntentKind, PendingAction};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Advisor,
    Autonomous,
    Oracle,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Advisor => "advisor",
            Mode::Autonomous => "autonomous",
            Mode::Oracle => "oracle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "advisor" => Some(Mode::Advisor),
            "autonomous" => Some(Mode::Autonomous),
            "oracle" => Some(Mode::Oracle),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct DecisionPacket<'a> {
    action_type: &'a str,
    target: String,
    context: &'a str,
    timestamp: u64,
}

#[derive(Debug, Deserialize)]
struct OracleVerdict {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Bounded record of executed actions for budget and rate accounting.
struct ExecutedLog {
    entries: VecDeque<(u64, u64)>, // (timestamp, spend_sat)
}

impl ExecutedLog {
    const CAP: usize = 4096;

    fn push(&mut self, now: u64, spend: u64) {
        self.entries.push_back((now, spend));
        while self.entries.len() > Self::CAP {
            self.entries.pop_front();
        }
    }

    fn prune(&mut self, now: u64) {
        while let Some((ts, _)) = self.entries.front() {
            if now.saturating_sub(*ts) > 86_400 {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn spent_today(&self, now: u64) -> u64 {
        self.entries
            .iter()
            .filter(|(ts, _)| now.saturating_sub(*ts) <= 86_400)
            .map(|(_, s)| s)
            .sum()
    }

    fn actions_last_hour(&self, now: u64) -> usize {
        self.entries
            .iter()
            .filter(|(ts, _)| now.saturating_sub(*ts) <= 3600)
            .count()
    }
}

pub struct Governance {
    store: Arc<Store>,
    cfg: Arc<HiveConfig>,
    bridge: Arc<Bridge>,
    http: reqwest::Client,
    executed: Mutex<ExecutedLog>,
}

impl Governance {
    pub fn new(store: Arc<Store>, cfg: Arc<HiveConfig>, bridge: Arc<Bridge>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.oracle_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            store,
            cfg,
            bridge,
            http,
            executed: Mutex::new(ExecutedLog { entries: VecDeque::new() }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.store
            .governance_mode_raw()
            .ok()
            .flatten()
            .and_then(|raw| Mode::parse(&raw))
            .unwrap_or(Mode::Advisor)
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.store.set_governance_mode_raw(mode.name())?;
        info!("governance mode set to {}", mode.name());
        Ok(())
    }

    /// Commit an intent (atomically with its action row) and route the
    /// action through the current mode.
    pub async fn on_intent_commit(
        &self,
        intent: &Intent,
        confidence: f64,
        context: String,
        now: u64,
    ) -> Result<PendingAction> {
        let action = PendingAction {
            id: 0,
            kind: intent.kind,
            target: intent.target,
            amount_sat: intent.amount_sat,
            proposed_by: intent.initiator,
            proposed_at: now,
            status: ActionStatus::Pending,
            expires_at: now + self.cfg.action_ttl_secs,
            context,
        };
        let action = self.store.commit_intent_and_queue(&intent.key(), action)?;
        self.route(action, confidence, now).await
    }

    async fn route(&self, action: PendingAction, confidence: f64, now: u64) -> Result<PendingAction> {
        match self.mode() {
            Mode::Advisor => {
                info!(
                    "action #{} awaiting approval: {} {} ({} sat): {}",
                    action.id, action.kind, action.target.short(), action.amount_sat, action.context
                );
                Ok(action)
            }
            Mode::Autonomous => match self.safety_check(&action, confidence, now) {
                Ok(()) => self.execute(action, now).await,
                Err(reason) => {
                    warn!("action #{} rejected by safety rails: {reason}", action.id);
                    self.finish(action, ActionStatus::Rejected, &reason)
                }
            },
            Mode::Oracle => match self.consult_oracle(&action, now).await {
                Ok(true) => self.execute(action, now).await,
                Ok(false) => self.finish(action, ActionStatus::Rejected, "oracle denied"),
                Err(e) => {
                    // Never auto-execute on uncertainty.
                    warn!("oracle unreachable ({e}), action #{} falls back to advisor", action.id);
                    Ok(action)
                }
            },
        }
    }

    fn safety_check(&self, action: &PendingAction, confidence: f64, now: u64) -> std::result::Result<(), String> {
        if confidence < self.cfg.confidence_threshold {
            return Err(format!(
                "confidence {confidence:.2} below threshold {:.2}",
                self.cfg.confidence_threshold
            ));
        }
        let mut log = self.executed.lock().expect("executed lock");
        log.prune(now);
        if log.actions_last_hour(now) >= self.cfg.actions_per_hour {
            return Err("hourly action rate limit reached".into());
        }
        if log.spent_today(now) + action.amount_sat > self.cfg.daily_budget_sat {
            return Err(format!(
                "daily budget exceeded: {} + {} > {}",
                log.spent_today(now),
                action.amount_sat,
                self.cfg.daily_budget_sat
            ));
        }
        Ok(())
    }

    async fn consult_oracle(&self, action: &PendingAction, now: u64) -> Result<bool> {
        let url = self
            .cfg
            .oracle_url
            .as_ref()
            .ok_or_else(|| HiveError::Unavailable("oracle mode without oracle_url".into()))?;
        let packet = DecisionPacket {
            action_type: match action.kind {
                IntentKind::ChannelOpen => "channel_open",
                IntentKind::Rebalance => "rebalance",
                IntentKind::BanPeer => "ban_peer",
            },
            target: action.target.to_string(),
            context: &action.context,
            timestamp: now,
        };

        // One retry on top of the initial attempt, both under the strict
        // client timeout.
        let mut last_err = None;
        for attempt in 0..2 {
            match self.http.post(url).json(&packet).send().await {
                Ok(resp) => match resp.json::<OracleVerdict>().await {
                    Ok(verdict) => {
                        debug!(
                            "oracle verdict for #{}: {} ({})",
                            action.id,
                            verdict.decision,
                            verdict.reason.as_deref().unwrap_or("no reason")
                        );
                        return match verdict.decision.as_str() {
                            "APPROVE" => Ok(true),
                            "DENY" => Ok(false),
                            other => Err(HiveError::Malformed(format!("oracle decision {other:?}"))),
                        };
                    }
                    Err(e) => last_err = Some(HiveError::Malformed(format!("oracle body: {e}"))),
                },
                Err(e) => last_err = Some(HiveError::Unavailable(format!("oracle post: {e}"))),
            }
            if attempt == 0 {
                debug!("oracle attempt failed, retrying once");
            }
        }
        Err(last_err.unwrap_or(HiveError::Unavailable("oracle unreachable".into())))
    }

    async fn execute(&self, action: PendingAction, now: u64) -> Result<PendingAction> {
        let outcome = match action.kind {
            IntentKind::ChannelOpen => {
                self.bridge.open_channel(&action.target, action.amount_sat).await
            }
            IntentKind::Rebalance => {
                self.bridge.trigger_rebalance(&action.target, action.amount_sat).await
            }
            IntentKind::BanPeer => {
                // The ban itself is local state; the policy downgrade rides
                // the bridge best-effort.
                self.store.ban_member(&action.target, &action.context, now)?;
                if let Err(e) = self.bridge.set_policy(&action.target, PolicyKind::Default).await {
                    debug!("policy downgrade for banned {} deferred: {e}", action.target.short());
                }
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                self.executed.lock().expect("executed lock").push(now, action.amount_sat);
                info!("action #{} executed: {} {}", action.id, action.kind, action.target.short());
                self.finish(action, ActionStatus::Executed, "")
            }
            Err(e) => {
                warn!("action #{} failed to execute: {e}", action.id);
                self.finish(action, ActionStatus::Rejected, &format!("execution failed: {e}"))
            }
        }
    }

    fn finish(&self, mut action: PendingAction, status: ActionStatus, note: &str) -> Result<PendingAction> {
        action.status = status;
        if !note.is_empty() {
            action.context = format!("{} [{note}]", action.context);
        }
        self.store.put_action(&action)?;
        Ok(action)
    }

    // =========================================================================
    // MANAGEMENT SURFACE
    // =========================================================================

    /// Out-of-band operator approval of a queued action.
    pub async fn approve(&self, id: u64, now: u64) -> Result<PendingAction> {
        let action = self
            .store
            .action(id)?
            .ok_or_else(|| HiveError::Invariant(format!("no action #{id}")))?;
        if action.status != ActionStatus::Pending {
            return Err(HiveError::Conflict(format!("action #{id} is {:?}", action.status)));
        }
        if now >= action.expires_at {
            return self.finish(action, ActionStatus::Expired, "approved too late");
        }
        self.execute(action, now).await
    }

    pub fn reject(&self, id: u64) -> Result<PendingAction> {
        let action = self
            .store
            .action(id)?
            .ok_or_else(|| HiveError::Invariant(format!("no action #{id}")))?;
        if action.status != ActionStatus::Pending {
            return Err(HiveError::Conflict(format!("action #{id} is {:?}", action.status)));
        }
        self.finish(action, ActionStatus::Rejected, "operator rejected")
    }

    /// Expire stale pending actions and keep the table bounded.
    pub fn expire_tick(&self, now: u64) -> Result<usize> {
        let mut expired = 0;
        for action in self.store.actions()? {
            if action.status == ActionStatus::Pending && now >= action.expires_at {
                self.finish(action, ActionStatus::Expired, "")?;
                expired += 1;
            }
        }
        self.store.trim_actions_to(self.cfg.pending_action_cap)?;
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeConfig, ExecutorClient, ExecutorStatus};
    use crate::types::{IntentStatus, NodeId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExecutorClient for CountingExecutor {
        async fn status(&self) -> Result<ExecutorStatus> {
            Ok(ExecutorStatus { version: 2, ready: true })
        }
        async fn set_policy(&self, _: &NodeId, _: PolicyKind) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn trigger_rebalance(&self, _: &NodeId, _: u64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn inhibit_opens(&self, _: &NodeId) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release_inhibit(&self, _: &NodeId) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn open_channel(&self, _: &NodeId, _: u64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<Store>, Governance, Arc<CountingExecutor>) {
        let dir = std::env::temp_dir().join(format!("hive-gov-{}", rand::random::<u64>()));
        let store = Arc::new(Store::open(&dir).unwrap());
        let cfg = Arc::new(HiveConfig::default());
        let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
        let bridge = Arc::new(Bridge::new(executor.clone(), BridgeConfig::from_hive(&cfg)));
        (store.clone(), Governance::new(store, cfg, bridge), executor)
    }

    fn pending_intent(store: &Store, kind: IntentKind, amount: u64) -> Intent {
        let intent = Intent {
            kind,
            target: node(9),
            initiator: node(1),
            amount_sat: amount,
            timestamp: 100,
            expires_at: 100 + 3600,
            status: IntentStatus::Pending,
        };
        store.put_intent(&intent).unwrap();
        intent
    }

    #[tokio::test]
    async fn advisor_queues_without_executing() {
        let (store, gov, executor) = setup();
        let intent = pending_intent(&store, IntentKind::Rebalance, 1000);
        let action = gov.on_intent_commit(&intent, 1.0, "test".into(), 200).await.unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.intent(&intent.key()).unwrap().unwrap().status, IntentStatus::Committed);
    }

    #[tokio::test]
    async fn autonomous_executes_when_rails_pass() {
        let (store, gov, executor) = setup();
        gov.set_mode(Mode::Autonomous).unwrap();
        let intent = pending_intent(&store, IntentKind::Rebalance, 1000);
        let action = gov.on_intent_commit(&intent, 0.9, "test".into(), 200).await.unwrap();
        assert_eq!(action.status, ActionStatus::Executed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn autonomous_rejects_low_confidence() {
        let (store, gov, executor) = setup();
        gov.set_mode(Mode::Autonomous).unwrap();
        let intent = pending_intent(&store, IntentKind::Rebalance, 1000);
        let action = gov.on_intent_commit(&intent, 0.3, "test".into(), 200).await.unwrap();
        assert_eq!(action.status, ActionStatus::Rejected);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn autonomous_respects_daily_budget() {
        let (store, gov, executor) = setup();
        gov.set_mode(Mode::Autonomous).unwrap();
        let budget = gov.cfg.daily_budget_sat;
        let intent = pending_intent(&store, IntentKind::ChannelOpen, budget + 1);
        let action = gov.on_intent_commit(&intent, 0.9, "big".into(), 200).await.unwrap();
        assert_eq!(action.status, ActionStatus::Rejected);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oracle_without_url_falls_back_to_advisor() {
        let (store, gov, executor) = setup();
        gov.set_mode(Mode::Oracle).unwrap();
        let intent = pending_intent(&store, IntentKind::Rebalance, 10);
        let action = gov.on_intent_commit(&intent, 0.9, "test".into(), 200).await.unwrap();
        // Unreachable oracle never auto-executes.
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approve_executes_and_reject_finalises() {
        let (store, gov, executor) = setup();
        let intent = pending_intent(&store, IntentKind::Rebalance, 10);
        let action = gov.on_intent_commit(&intent, 1.0, "t".into(), 200).await.unwrap();
        let done = gov.approve(action.id, 300).await.unwrap();
        assert_eq!(done.status, ActionStatus::Executed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(gov.approve(action.id, 400).await.is_err());
    }

    #[tokio::test]
    async fn ban_execution_is_local_and_closes_action() {
        let (store, gov, _executor) = setup();
        gov.set_mode(Mode::Autonomous).unwrap();
        store
            .put_member(&crate::types::Member {
                pubkey: node(9),
                tier: crate::types::Tier::Member,
                joined_at: 0,
                last_seen: 0,
                banned: false,
            })
            .unwrap();
        let intent = pending_intent(&store, IntentKind::BanPeer, 0);
        let action = gov.on_intent_commit(&intent, 0.9, "leech".into(), 200).await.unwrap();
        assert_eq!(action.status, ActionStatus::Executed);
        assert!(store.is_banned(&node(9)).unwrap());
    }

    #[tokio::test]
    async fn expiry_flips_stale_pending() {
        let (store, gov, _executor) = setup();
        let intent = pending_intent(&store, IntentKind::Rebalance, 10);
        let action = gov.on_intent_commit(&intent, 1.0, "t".into(), 200).await.unwrap();
        assert_eq!(gov.expire_tick(200 + 86_400).unwrap(), 1);
        assert_eq!(store.action(action.id).unwrap().unwrap().status, ActionStatus::Expired);
    }
}
