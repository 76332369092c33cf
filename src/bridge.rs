//! Hardened outbound boundary to the co-resident execution subsystem
//!
//! Every call to the fee/rebalance subsystem or the external channel manager
//! crosses this bridge. A circuit breaker turns a flapping executor into
//! fast, typed `Unavailable` errors instead of pile-ups:
//!
//! - closed: calls proceed under a strict per-call timeout
//! - open: entered after `max_failures` consecutive failures; calls fail
//!   instantly without IO
//! - half-open: entered after `reset_timeout` in open; `probe_successes`
//!   consecutive successes close the circuit again, a single failure
//!   reopens it. One lucky success after the timeout is not enough to
//!   reset the breaker.
//!
//! Feature detection runs once at startup: executor missing or too old
//! disables the bridge outright and every later call short-circuits.

use crate::error::{HiveError, Result};
use crate::types::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Hive,
    Default,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorStatus {
    pub version: u32,
    pub ready: bool,
}

/// The executor surface the hive drives. One implementation speaks to the
/// fee/rebalance subsystem and the external channel manager; tests script it.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn status(&self) -> Result<ExecutorStatus>;
    async fn set_policy(&self, peer: &NodeId, kind: PolicyKind) -> Result<()>;
    async fn trigger_rebalance(&self, target: &NodeId, amount_sat: u64) -> Result<()>;
    async fn inhibit_opens(&self, peer: &NodeId) -> Result<()>;
    async fn release_inhibit(&self, peer: &NodeId) -> Result<()>;
    async fn open_channel(&self, peer: &NodeId, amount_sat: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub call_timeout: Duration,
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub probe_successes: u32,
    pub min_version: u32,
}

impl BridgeConfig {
    pub fn from_hive(cfg: &crate::config::HiveConfig) -> Self {
        Self {
            call_timeout: Duration::from_secs(cfg.bridge_timeout_secs),
            max_failures: cfg.bridge_max_failures,
            reset_timeout: Duration::from_secs(cfg.bridge_reset_timeout_secs),
            probe_successes: cfg.bridge_probe_successes,
            min_version: cfg.executor_min_version,
        }
    }
}

pub struct Bridge {
    client: std::sync::Arc<dyn ExecutorClient>,
    cfg: BridgeConfig,
    state: Mutex<Inner>,
    disabled: AtomicBool,
}

impl Bridge {
    pub fn new(client: std::sync::Arc<dyn ExecutorClient>, cfg: BridgeConfig) -> Self {
        Self {
            client,
            cfg,
            state: Mutex::new(Inner::Closed { failures: 0 }),
            disabled: AtomicBool::new(false),
        }
    }

    /// Startup feature detection. Executor missing, not ready, or below the
    /// minimum version disables the bridge permanently.
    pub async fn detect_features(&self) -> Result<()> {
        let probe = tokio::time::timeout(self.cfg.call_timeout, self.client.status()).await;
        match probe {
            Ok(Ok(status)) if status.ready && status.version >= self.cfg.min_version => {
                info!("executor detected: version {}", status.version);
                Ok(())
            }
            Ok(Ok(status)) => {
                self.disabled.store(true, Ordering::SeqCst);
                warn!(
                    "executor version {} below minimum {} (ready={}), bridge disabled",
                    status.version, self.cfg.min_version, status.ready
                );
                Err(HiveError::Unavailable("executor below minimum version".into()))
            }
            Ok(Err(e)) => {
                self.disabled.store(true, Ordering::SeqCst);
                warn!("executor status probe failed, bridge disabled: {e}");
                Err(HiveError::Unavailable(format!("executor probe failed: {e}")))
            }
            Err(_) => {
                self.disabled.store(true, Ordering::SeqCst);
                warn!("executor status probe timed out, bridge disabled");
                Err(HiveError::Unavailable("executor probe timeout".into()))
            }
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BreakerState {
        match *self.state.lock().expect("breaker lock") {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Admission check before IO. Transitions open→half-open when the reset
    /// timeout has elapsed. The lock is never held across an await.
    fn begin(&self) -> Result<()> {
        if self.is_disabled() {
            return Err(HiveError::Unavailable("bridge disabled".into()));
        }
        let mut state = self.state.lock().expect("breaker lock");
        match *state {
            Inner::Closed { .. } | Inner::HalfOpen { .. } => Ok(()),
            Inner::Open { since } => {
                if since.elapsed() >= self.cfg.reset_timeout {
                    debug!("breaker probe window open");
                    *state = Inner::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(HiveError::Unavailable("circuit open".into()))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock");
        match *state {
            Inner::Closed { .. } => *state = Inner::Closed { failures: 0 },
            Inner::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.cfg.probe_successes {
                    info!("breaker closed after {successes} probe successes");
                    *state = Inner::Closed { failures: 0 };
                } else {
                    *state = Inner::HalfOpen { successes };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    fn record_failure(&self, op: &'static str) {
        let mut state = self.state.lock().expect("breaker lock");
        match *state {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.cfg.max_failures {
                    warn!("breaker tripped open after {failures} consecutive {op} failures");
                    *state = Inner::Open { since: Instant::now() };
                } else {
                    *state = Inner::Closed { failures };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!("breaker reopened: {op} failed during probe");
                *state = Inner::Open { since: Instant::now() };
            }
            Inner::Open { .. } => {}
        }
    }

    fn finish<T>(
        &self,
        op: &'static str,
        outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    ) -> Result<T> {
        match outcome {
            Ok(Ok(v)) => {
                self.record_success();
                Ok(v)
            }
            Ok(Err(e)) => {
                self.record_failure(op);
                Err(HiveError::Unavailable(format!("{op}: {e}")))
            }
            Err(_) => {
                self.record_failure(op);
                Err(HiveError::Unavailable(format!("{op}: timeout")))
            }
        }
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    pub async fn set_policy(&self, peer: &NodeId, kind: PolicyKind) -> Result<()> {
        self.begin()?;
        let outcome =
            tokio::time::timeout(self.cfg.call_timeout, self.client.set_policy(peer, kind)).await;
        self.finish("set_policy", outcome)
    }

    pub async fn trigger_rebalance(&self, target: &NodeId, amount_sat: u64) -> Result<()> {
        self.begin()?;
        let outcome = tokio::time::timeout(
            self.cfg.call_timeout,
            self.client.trigger_rebalance(target, amount_sat),
        )
        .await;
        self.finish("trigger_rebalance", outcome)
    }

    pub async fn inhibit_opens(&self, peer: &NodeId) -> Result<()> {
        self.begin()?;
        let outcome =
            tokio::time::timeout(self.cfg.call_timeout, self.client.inhibit_opens(peer)).await;
        self.finish("inhibit_opens", outcome)
    }

    pub async fn release_inhibit(&self, peer: &NodeId) -> Result<()> {
        self.begin()?;
        let outcome =
            tokio::time::timeout(self.cfg.call_timeout, self.client.release_inhibit(peer)).await;
        self.finish("release_inhibit", outcome)
    }

    pub async fn open_channel(&self, peer: &NodeId, amount_sat: u64) -> Result<()> {
        self.begin()?;
        let outcome = tokio::time::timeout(
            self.cfg.call_timeout,
            self.client.open_channel(peer, amount_sat),
        )
        .await;
        self.finish("open_channel", outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Scripted executor: pops one outcome per call, true = success.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<bool>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(outcomes.iter().copied().collect()),
            })
        }

        fn pop(&self) -> Result<()> {
            let ok = self.script.lock().unwrap().pop_front().unwrap_or(false);
            if ok {
                Ok(())
            } else {
                Err(HiveError::Rpc("scripted failure".into()))
            }
        }
    }

    #[async_trait]
    impl ExecutorClient for ScriptedExecutor {
        async fn status(&self) -> Result<ExecutorStatus> {
            self.pop().map(|_| ExecutorStatus { version: 2, ready: true })
        }
        async fn set_policy(&self, _: &NodeId, _: PolicyKind) -> Result<()> {
            self.pop()
        }
        async fn trigger_rebalance(&self, _: &NodeId, _: u64) -> Result<()> {
            self.pop()
        }
        async fn inhibit_opens(&self, _: &NodeId) -> Result<()> {
            self.pop()
        }
        async fn release_inhibit(&self, _: &NodeId) -> Result<()> {
            self.pop()
        }
        async fn open_channel(&self, _: &NodeId, _: u64) -> Result<()> {
            self.pop()
        }
    }

    fn fast_cfg() -> BridgeConfig {
        BridgeConfig {
            call_timeout: Duration::from_millis(200),
            max_failures: 3,
            reset_timeout: Duration::from_millis(50),
            probe_successes: 3,
            min_version: 2,
        }
    }

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    #[tokio::test]
    async fn trips_open_after_three_failures() {
        let bridge = Bridge::new(ScriptedExecutor::new(&[false, false, false]), fast_cfg());
        for _ in 0..3 {
            assert!(bridge.inhibit_opens(&node(1)).await.is_err());
        }
        assert_eq!(bridge.state(), BreakerState::Open);

        // Next call is rejected without consuming any scripted outcome.
        let err = bridge.inhibit_opens(&node(1)).await.unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn probe_path_closes_after_three_successes() {
        let bridge = Bridge::new(
            ScriptedExecutor::new(&[false, false, false, true, true, true]),
            fast_cfg(),
        );
        for _ in 0..3 {
            let _ = bridge.set_policy(&node(1), PolicyKind::Hive).await;
        }
        assert_eq!(bridge.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(bridge.set_policy(&node(1), PolicyKind::Hive).await.is_ok());
        assert_eq!(bridge.state(), BreakerState::HalfOpen);
        assert!(bridge.set_policy(&node(1), PolicyKind::Hive).await.is_ok());
        assert!(bridge.set_policy(&node(1), PolicyKind::Hive).await.is_ok());
        assert_eq!(bridge.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn single_failure_in_half_open_reopens() {
        let bridge = Bridge::new(
            ScriptedExecutor::new(&[false, false, false, true, false]),
            fast_cfg(),
        );
        for _ in 0..3 {
            let _ = bridge.trigger_rebalance(&node(1), 1000).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(bridge.trigger_rebalance(&node(1), 1000).await.is_ok());
        assert_eq!(bridge.state(), BreakerState::HalfOpen);
        assert!(bridge.trigger_rebalance(&node(1), 1000).await.is_err());
        assert_eq!(bridge.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let bridge = Bridge::new(
            ScriptedExecutor::new(&[false, false, true, false, false]),
            fast_cfg(),
        );
        for _ in 0..5 {
            let _ = bridge.release_inhibit(&node(1)).await;
        }
        // Two failures, a success, two failures: never three consecutive.
        assert_eq!(bridge.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn feature_detection_disables_on_old_version() {
        struct OldExecutor;
        #[async_trait]
        impl ExecutorClient for OldExecutor {
            async fn status(&self) -> Result<ExecutorStatus> {
                Ok(ExecutorStatus { version: 1, ready: true })
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

        let bridge = Bridge::new(std::sync::Arc::new(OldExecutor), fast_cfg());
        assert!(bridge.detect_features().await.is_err());
        assert!(bridge.is_disabled());
        // Disabled bridge answers without touching the executor.
        assert!(bridge.set_policy(&node(1), PolicyKind::Hive).await.is_err());
    }
}
