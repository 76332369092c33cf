//! Supervised background workers
//!
//! Every loop is a named tokio task that waits on the process-wide shutdown
//! signal with a timeout equal to its cadence, so nothing blocks indefinitely
//! and shutdown is prompt. Workers own their cadence and log heartbeats at
//! debug level.

use crate::dispatcher::Dispatcher;
use crate::node::HostEvent;
use crate::types::{unix_now, ActionStatus, Intent, IntentKind};
use crate::wire::{BanPayload, IntentPayload, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type ShutdownRx = watch::Receiver<bool>;
pub type ShutdownTx = watch::Sender<bool>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Confidence attached to actions that come out of the hive's own periodic
/// evaluation (as opposed to an operator command).
const LOOP_CONFIDENCE: f64 = 0.9;

pub fn spawn_workers(dispatcher: Arc<Dispatcher>, shutdown: ShutdownRx) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop(
            "intent-commit",
            dispatcher.cfg.commit_cadence_secs,
            shutdown.clone(),
            dispatcher.clone(),
            |d| Box::pin(intent_commit_tick(d)),
        ),
        spawn_loop(
            "gossip",
            dispatcher.cfg.gossip_cadence_secs,
            shutdown.clone(),
            dispatcher.clone(),
            |d| Box::pin(gossip_tick(d)),
        ),
        spawn_loop(
            "planner",
            dispatcher.cfg.planner_cadence(),
            shutdown.clone(),
            dispatcher.clone(),
            |d| Box::pin(planner_tick(d)),
        ),
        spawn_loop(
            "maintenance",
            dispatcher.cfg.maintenance_cadence_secs,
            shutdown,
            dispatcher,
            |d| Box::pin(maintenance_tick(d)),
        ),
    ]
}

type TickFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn spawn_loop(
    name: &'static str,
    cadence_secs: u64,
    mut shutdown: ShutdownRx,
    dispatcher: Arc<Dispatcher>,
    tick: fn(Arc<Dispatcher>) -> TickFuture,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("worker {name} started (cadence {cadence_secs}s)");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(cadence_secs)) => {
                    debug!("worker {name} tick");
                    tick(dispatcher.clone()).await;
                }
            }
        }
        info!("worker {name} stopped");
    })
}

/// Pump host events into the dispatcher until the stream or shutdown ends.
pub fn spawn_event_pump(
    dispatcher: Arc<Dispatcher>,
    mut events: mpsc::Receiver<HostEvent>,
    mut shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("event pump started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            dispatcher.on_host_event(event).await;
                        }
                        None => {
                            warn!("host event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        info!("event pump stopped");
    })
}

// =============================================================================
// TICK BODIES
// =============================================================================

async fn intent_commit_tick(d: Arc<Dispatcher>) {
    let now = unix_now();
    if let Err(e) = d.intents.expire_tick(now) {
        warn!("intent expiry failed: {e}");
    }
    let local = d.host.local_id();
    let ready = match d.intents.commit_candidates(local, now) {
        Ok(r) => r,
        Err(e) => {
            warn!("commit scan failed: {e}");
            return;
        }
    };
    for intent in ready {
        commit_one(&d, intent, now).await;
    }
}

async fn commit_one(d: &Arc<Dispatcher>, intent: Intent, now: u64) {
    let context = match intent.kind {
        IntentKind::ChannelOpen => "coordinated expansion".to_string(),
        IntentKind::Rebalance => "liquidity rebalance".to_string(),
        IntentKind::BanPeer => "sustained leeching".to_string(),
    };
    match d
        .governance
        .on_intent_commit(&intent, LOOP_CONFIDENCE, context, now)
        .await
    {
        Ok(action) => {
            if intent.kind == IntentKind::BanPeer && action.status == ActionStatus::Executed {
                d.broadcast(&Message::Ban(BanPayload {
                    subject: intent.target,
                    reason: action.context.clone(),
                    timestamp: now,
                }))
                .await;
                d.broadcast_own_state(now).await;
            }
        }
        Err(e) => warn!("intent commit failed: {e}"),
    }
}

async fn gossip_tick(d: Arc<Dispatcher>) {
    d.maybe_broadcast_own_state(unix_now()).await;
}

async fn planner_tick(d: Arc<Dispatcher>) {
    let now = unix_now();
    match d.planner.run_cycle(d.host.as_ref(), now).await {
        Ok(report) => {
            if let Some(intent) = report.announced {
                d.broadcast(&Message::Intent(IntentPayload {
                    kind: intent.kind,
                    target: intent.target,
                    initiator: intent.initiator,
                    amount_sat: intent.amount_sat,
                    timestamp: intent.timestamp,
                    expires_at: intent.expires_at,
                }))
                .await;
            }
            debug!(
                "planner cycle: {} scored, {} inhibited, {} released{}",
                report.scored,
                report.inhibited.len(),
                report.released.len(),
                if report.aborted { ", ABORTED" } else { "" }
            );
        }
        Err(e) => warn!("planner cycle failed: {e}"),
    }
}

async fn maintenance_tick(d: Arc<Dispatcher>) {
    let now = unix_now();
    if let Err(e) = d.ledger.maintenance(now) {
        warn!("ledger maintenance failed: {e}");
    }
    if let Err(e) = d.membership.prune_presence(now) {
        warn!("presence pruning failed: {e}");
    }
    if let Err(e) = d.intents.prune(now) {
        warn!("intent pruning failed: {e}");
    }
    match d.governance.expire_tick(now) {
        Ok(n) if n > 0 => debug!("expired {n} stale pending actions"),
        Ok(_) => {}
        Err(e) => warn!("action expiry failed: {e}"),
    }

    // Leech evaluation rides the maintenance cadence; internally it acts at
    // most once per member per day.
    let local = d.host.local_id();
    match d
        .membership
        .leech_tick(d.bridge.as_ref(), d.intents.as_ref(), local, now)
        .await
    {
        Ok(announced) => {
            for intent in announced {
                d.broadcast(&Message::Intent(IntentPayload {
                    kind: intent.kind,
                    target: intent.target,
                    initiator: intent.initiator,
                    amount_sat: intent.amount_sat,
                    timestamp: intent.timestamp,
                    expires_at: intent.expires_at,
                }))
                .await;
            }
        }
        Err(e) => warn!("leech evaluation failed: {e}"),
    }

    if let Err(e) = d.store.flush() {
        warn!("store flush failed: {e}");
    }
}
