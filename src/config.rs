//! Runtime configuration.
//!
//! Every cap, threshold and cadence the protocol depends on is a field here
//! with a conservative default. `hived` loads an optional JSON file and lets
//! CLI flags override the plumbing paths; the numeric knobs come from the
//! file only.

use serde::Deserialize;
use std::path::PathBuf;

fn d_hold_seconds() -> u64 { 60 }
fn d_intent_horizon_secs() -> u64 { 3600 }
fn d_commit_cadence_secs() -> u64 { 5 }
fn d_heartbeat_secs() -> u64 { 300 }
fn d_gossip_cadence_secs() -> u64 { 30 }
fn d_planner_cadence_secs() -> u64 { 3600 }
fn d_maintenance_cadence_secs() -> u64 { 600 }
fn d_max_members() -> usize { 64 }
fn d_max_remote_intents() -> usize { 256 }
fn d_max_remote_intents_per_peer() -> usize { 8 }
fn d_max_pending_challenges() -> usize { 512 }
fn d_challenge_ttl_secs() -> u64 { 120 }
fn d_challenges_per_minute() -> f64 { 4.0 }
fn d_max_full_sync_states() -> usize { 200 }
fn d_max_contrib_per_peer_hour() -> usize { 120 }
fn d_max_contrib_per_day() -> usize { 10_000 }
fn d_max_contrib_rows() -> usize { 500_000 }
fn d_contrib_retention_days() -> u64 { 45 }
fn d_contrib_cache_ttl_secs() -> u64 { 60 }
fn d_probation_days() -> u64 { 14 }
fn d_uptime_threshold_pct() -> f64 { 99.5 }
fn d_vouch_ttl_secs() -> u64 { 24 * 3600 }
fn d_leech_policy_ratio() -> f64 { 0.5 }
fn d_leech_ban_ratio() -> f64 { 0.4 }
fn d_leech_ban_days() -> u64 { 7 }
fn d_action_ttl_secs() -> u64 { 24 * 3600 }
fn d_daily_budget_sat() -> u64 { 500_000 }
fn d_actions_per_hour() -> usize { 6 }
fn d_confidence_threshold() -> f64 { 0.7 }
fn d_oracle_timeout_secs() -> u64 { 5 }
fn d_saturation_share() -> f64 { 0.20 }
fn d_release_share() -> f64 { 0.15 }
fn d_expansion_share() -> f64 { 0.05 }
fn d_expansion_min_capacity_sat() -> u64 { 10_000_000 }
fn d_expansion_min_age_days() -> u64 { 30 }
fn d_expansion_open_sat() -> u64 { 1_000_000 }
fn d_opener_min_uptime_pct() -> f64 { 99.0 }
fn d_max_ignore_per_cycle() -> usize { 5 }
fn d_bridge_timeout_secs() -> u64 { 5 }
fn d_bridge_max_failures() -> u32 { 3 }
fn d_bridge_reset_timeout_secs() -> u64 { 60 }
fn d_bridge_probe_successes() -> u32 { 3 }
fn d_executor_min_version() -> u32 { 2 }
fn d_rpc_timeout_secs() -> u64 { 10 }
fn d_rpc_lock_timeout_secs() -> u64 { 2 }
fn d_planner_log_cap() -> usize { 4096 }
fn d_pending_action_cap() -> usize { 1024 }
fn d_data_dir() -> PathBuf { PathBuf::from("./hive-data") }
fn d_control_socket() -> PathBuf { PathBuf::from("./hive-data/control.sock") }
fn d_host_socket() -> PathBuf { PathBuf::from("./hive-data/host.sock") }
fn d_oracle_url() -> Option<String> { None }

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    // Plumbing
    pub data_dir: PathBuf,
    pub control_socket: PathBuf,
    pub host_socket: PathBuf,

    // Intent protocol
    pub hold_seconds: u64,
    pub intent_horizon_secs: u64,
    pub commit_cadence_secs: u64,
    pub max_remote_intents: usize,
    pub max_remote_intents_per_peer: usize,

    // Gossip / state
    pub heartbeat_secs: u64,
    pub gossip_cadence_secs: u64,
    pub max_full_sync_states: usize,
    pub max_members: usize,

    // Handshake
    pub max_pending_challenges: usize,
    pub challenge_ttl_secs: u64,
    pub challenges_per_minute: f64,

    // Contribution ledger
    pub max_contrib_per_peer_hour: usize,
    pub max_contrib_per_day: usize,
    pub max_contrib_rows: usize,
    pub contrib_retention_days: u64,
    pub contrib_cache_ttl_secs: u64,

    // Membership
    pub probation_days: u64,
    pub uptime_threshold_pct: f64,
    pub vouch_ttl_secs: u64,
    pub leech_policy_ratio: f64,
    pub leech_ban_ratio: f64,
    pub leech_ban_days: u64,

    // Governance
    pub action_ttl_secs: u64,
    pub daily_budget_sat: u64,
    pub actions_per_hour: usize,
    pub confidence_threshold: f64,
    pub oracle_url: Option<String>,
    pub oracle_timeout_secs: u64,
    pub pending_action_cap: usize,

    // Planner
    pub planner_cadence_secs: u64,
    pub saturation_share: f64,
    pub release_share: f64,
    pub expansion_share: f64,
    pub expansion_min_capacity_sat: u64,
    pub expansion_min_age_days: u64,
    pub expansion_open_sat: u64,
    pub opener_min_uptime_pct: f64,
    pub max_ignore_per_cycle: usize,
    pub planner_log_cap: usize,

    // Bridge
    pub bridge_timeout_secs: u64,
    pub bridge_max_failures: u32,
    pub bridge_reset_timeout_secs: u64,
    pub bridge_probe_successes: u32,
    pub executor_min_version: u32,

    // Host RPC gateway
    pub rpc_timeout_secs: u64,
    pub rpc_lock_timeout_secs: u64,

    // Maintenance
    pub maintenance_cadence_secs: u64,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            control_socket: d_control_socket(),
            host_socket: d_host_socket(),
            hold_seconds: d_hold_seconds(),
            intent_horizon_secs: d_intent_horizon_secs(),
            commit_cadence_secs: d_commit_cadence_secs(),
            max_remote_intents: d_max_remote_intents(),
            max_remote_intents_per_peer: d_max_remote_intents_per_peer(),
            heartbeat_secs: d_heartbeat_secs(),
            gossip_cadence_secs: d_gossip_cadence_secs(),
            max_full_sync_states: d_max_full_sync_states(),
            max_members: d_max_members(),
            max_pending_challenges: d_max_pending_challenges(),
            challenge_ttl_secs: d_challenge_ttl_secs(),
            challenges_per_minute: d_challenges_per_minute(),
            max_contrib_per_peer_hour: d_max_contrib_per_peer_hour(),
            max_contrib_per_day: d_max_contrib_per_day(),
            max_contrib_rows: d_max_contrib_rows(),
            contrib_retention_days: d_contrib_retention_days(),
            contrib_cache_ttl_secs: d_contrib_cache_ttl_secs(),
            probation_days: d_probation_days(),
            uptime_threshold_pct: d_uptime_threshold_pct(),
            vouch_ttl_secs: d_vouch_ttl_secs(),
            leech_policy_ratio: d_leech_policy_ratio(),
            leech_ban_ratio: d_leech_ban_ratio(),
            leech_ban_days: d_leech_ban_days(),
            action_ttl_secs: d_action_ttl_secs(),
            daily_budget_sat: d_daily_budget_sat(),
            actions_per_hour: d_actions_per_hour(),
            confidence_threshold: d_confidence_threshold(),
            oracle_url: d_oracle_url(),
            oracle_timeout_secs: d_oracle_timeout_secs(),
            pending_action_cap: d_pending_action_cap(),
            planner_cadence_secs: d_planner_cadence_secs(),
            saturation_share: d_saturation_share(),
            release_share: d_release_share(),
            expansion_share: d_expansion_share(),
            expansion_min_capacity_sat: d_expansion_min_capacity_sat(),
            expansion_min_age_days: d_expansion_min_age_days(),
            expansion_open_sat: d_expansion_open_sat(),
            opener_min_uptime_pct: d_opener_min_uptime_pct(),
            max_ignore_per_cycle: d_max_ignore_per_cycle(),
            planner_log_cap: d_planner_log_cap(),
            bridge_timeout_secs: d_bridge_timeout_secs(),
            bridge_max_failures: d_bridge_max_failures(),
            bridge_reset_timeout_secs: d_bridge_reset_timeout_secs(),
            bridge_probe_successes: d_bridge_probe_successes(),
            executor_min_version: d_executor_min_version(),
            rpc_timeout_secs: d_rpc_timeout_secs(),
            rpc_lock_timeout_secs: d_rpc_lock_timeout_secs(),
            maintenance_cadence_secs: d_maintenance_cadence_secs(),
        }
    }
}

impl HiveConfig {
    pub fn load(path: Option<&std::path::Path>) -> crate::error::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| crate::error::HiveError::Invariant(format!("config {}: {e}", p.display())))?;
                Ok(serde_json::from_str(&raw)?)
            }
        }
    }

    /// The planner never runs more often than every five minutes.
    pub fn planner_cadence(&self) -> u64 {
        self.planner_cadence_secs.max(300)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let cfg = HiveConfig::default();
        assert_eq!(cfg.bridge_max_failures, 3);
        assert_eq!(cfg.bridge_reset_timeout_secs, 60);
        assert!(cfg.saturation_share > cfg.release_share);
        assert!(cfg.release_share > cfg.expansion_share);
        assert!(cfg.commit_cadence_secs <= 5);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: HiveConfig = serde_json::from_str(r#"{"hold_seconds": 30}"#).unwrap();
        assert_eq!(cfg.hold_seconds, 30);
        assert_eq!(cfg.max_full_sync_states, 200);
    }

    #[test]
    fn planner_cadence_floor() {
        let cfg: HiveConfig = serde_json::from_str(r#"{"planner_cadence_secs": 10}"#).unwrap();
        assert_eq!(cfg.planner_cadence(), 300);
    }
}
