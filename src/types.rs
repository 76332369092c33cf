//! Core data model: identities, members, replicated state, intents,
//! contribution rows and governance records.
//!
//! Everything here is plain data. Mutation rules (monotonic versions, tier
//! transitions, tie-breaks) live with the owning component; persistence
//! ownership lives in [`crate::store`].

use crate::error::{HiveError, Result};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Compressed secp256k1 public key identifying a node, as the host
/// Lightning implementation reports it.
///
/// Ordering is byte-lexicographic, which equals the ordering of the lowercase
/// hex rendering. The intent tie-break depends on this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 33]);

impl NodeId {
    pub const LEN: usize = 33;

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| HiveError::Malformed(format!("node id: {e}")))?;
        let arr: [u8; 33] = raw
            .try_into()
            .map_err(|_| HiveError::Malformed(format!("node id: want 33 bytes, got {}", s.len() / 2)))?;
        Ok(Self(arr))
    }

    pub fn from_slice(b: &[u8]) -> Result<Self> {
        let arr: [u8; 33] = b
            .try_into()
            .map_err(|_| HiveError::Malformed(format!("node id: want 33 bytes, got {}", b.len())))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct NodeIdVisitor;
        impl Visitor<'_> for NodeIdVisitor {
            type Value = NodeId;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 66-char hex node id")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<NodeId, E> {
                NodeId::from_hex(v).map_err(|e| E::custom(e.to_string()))
            }
        }
        d.deserialize_str(NodeIdVisitor)
    }
}

/// Random identifier binding a promotion round's vouches together.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub [u8; 16]);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|e| HiveError::Malformed(format!("request id: {e}")))?;
        let arr: [u8; 16] = raw
            .try_into()
            .map_err(|_| HiveError::Malformed("request id: want 16 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(self.0))
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct ReqIdVisitor;
        impl Visitor<'_> for ReqIdVisitor {
            type Value = RequestId;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 32-char hex request id")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<RequestId, E> {
                RequestId::from_hex(v).map_err(|e| E::custom(e.to_string()))
            }
        }
        d.deserialize_str(ReqIdVisitor)
    }
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Participation tier. Neophytes gossip and are counted, but cannot vouch
/// or act on fleet funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Neophyte,
    Member,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Neophyte => f.write_str("neophyte"),
            Tier::Member => f.write_str("member"),
        }
    }
}

/// One admitted node. A banned member is treated as absent for every routing
/// decision but the row is retained for replay defence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub pubkey: NodeId,
    pub tier: Tier,
    pub joined_at: u64,
    pub last_seen: u64,
    pub banned: bool,
}

impl Member {
    pub fn is_active(&self) -> bool {
        !self.banned
    }
}

// =============================================================================
// REPLICATED STATE
// =============================================================================

/// Health summary a node publishes about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Good,
    Degraded,
    Draining,
}

/// One public channel edge as reported by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub peer: NodeId,
    pub capacity_sat: u64,
}

/// Per-member replicated record. `version` is strictly increasing per
/// originator; the fleet hash covers only `(pubkey, version, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub pubkey: NodeId,
    pub version: u64,
    pub timestamp: u64,
    pub capacity_sat: u64,
    pub available_funds_sat: u64,
    pub channels: Vec<ChannelSummary>,
    pub fee_policy_hash: String,
    pub health: Health,
}

// =============================================================================
// INTENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    ChannelOpen,
    Rebalance,
    BanPeer,
}

impl IntentKind {
    /// Stable single-byte discriminant used in store keys.
    pub fn key_byte(&self) -> u8 {
        match self {
            IntentKind::ChannelOpen => 1,
            IntentKind::Rebalance => 2,
            IntentKind::BanPeer => 3,
        }
    }

    pub fn from_key_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(IntentKind::ChannelOpen),
            2 => Some(IntentKind::Rebalance),
            3 => Some(IntentKind::BanPeer),
            _ => None,
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntentKind::ChannelOpen => f.write_str("channel_open"),
            IntentKind::Rebalance => f.write_str("rebalance"),
            IntentKind::BanPeer => f.write_str("ban_peer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Committed,
    Aborted,
    Expired,
}

/// Primary key of an intent row. Replayed announcements with the same key
/// overwrite in place and never create new rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentKey {
    pub kind: IntentKind,
    pub target: NodeId,
    pub initiator: NodeId,
}

impl IntentKey {
    pub fn encode(&self) -> [u8; 67] {
        let mut k = [0u8; 67];
        k[0] = self.kind.key_byte();
        k[1..34].copy_from_slice(&self.target.0);
        k[34..67].copy_from_slice(&self.initiator.0);
        k
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() != 67 {
            return Err(HiveError::Invariant(format!("intent key len {}", b.len())));
        }
        let kind = IntentKind::from_key_byte(b[0])
            .ok_or_else(|| HiveError::Invariant(format!("intent kind byte {}", b[0])))?;
        Ok(Self {
            kind,
            target: NodeId::from_slice(&b[1..34])?,
            initiator: NodeId::from_slice(&b[34..67])?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub target: NodeId,
    pub initiator: NodeId,
    /// Optional amount the action moves, in sat. Zero for bans.
    pub amount_sat: u64,
    pub timestamp: u64,
    pub expires_at: u64,
    pub status: IntentStatus,
}

impl Intent {
    pub fn key(&self) -> IntentKey {
        IntentKey {
            kind: self.kind,
            target: self.target,
            initiator: self.initiator,
        }
    }
}

// =============================================================================
// PROMOTION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionVouch {
    pub subject: NodeId,
    pub voucher: NodeId,
    pub request_id: RequestId,
    /// Host-HSM signature over [`vouch_message`].
    pub signature: String,
    pub timestamp: u64,
}

/// Canonical byte string a vouch signature covers. Includes the hive id so a
/// vouch from one hive cannot be replayed into another.
pub fn vouch_message(subject: &NodeId, voucher: &NodeId, request_id: &RequestId, hive_id: &str) -> String {
    format!("vouch:{subject}:{voucher}:{request_id}:{hive_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub subject: NodeId,
    pub request_id: RequestId,
    pub requested_at: u64,
}

// =============================================================================
// CONTRIBUTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We forwarded a payment out to this hive peer.
    Forwarded,
    /// This hive peer forwarded a payment in to us.
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionEntry {
    pub peer: NodeId,
    pub direction: Direction,
    pub amount_msat: u64,
    pub timestamp: u64,
}

/// Derived 30-day totals for one peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContributionTotals {
    pub forwarded_msat: u64,
    pub received_msat: u64,
}

impl ContributionTotals {
    /// forwarded/received. A peer that only forwards scores infinite; a peer
    /// with no traffic at all scores zero.
    pub fn ratio(&self) -> f64 {
        if self.received_msat == 0 {
            if self.forwarded_msat == 0 { 0.0 } else { f64::INFINITY }
        } else {
            self.forwarded_msat as f64 / self.received_msat as f64
        }
    }
}

// =============================================================================
// GOVERNANCE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Expired,
}

/// Executable action awaiting (or past) a governance decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: u64,
    pub kind: IntentKind,
    pub target: NodeId,
    pub amount_sat: u64,
    pub proposed_by: NodeId,
    pub proposed_at: u64,
    pub status: ActionStatus,
    pub expires_at: u64,
    /// Free-form evidence line shown to the operator.
    pub context: String,
}

// =============================================================================
// PLANNER / BANS / PRESENCE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerEntry {
    pub timestamp: u64,
    pub decision: String,
    pub target: NodeId,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ban {
    pub pubkey: NodeId,
    pub reason: String,
    pub since: u64,
}

/// Peer connectivity transition observed from the host node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub peer: NodeId,
    pub kind: PresenceKind,
    pub timestamp: u64,
}

/// Wall-clock unix seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_hex_round_trip() {
        let hexid = format!("02{}", "ab".repeat(32));
        let id = NodeId::from_hex(&hexid).unwrap();
        assert_eq!(id.to_string(), hexid);
    }

    #[test]
    fn node_id_rejects_bad_length() {
        assert!(NodeId::from_hex("02abcd").is_err());
    }

    #[test]
    fn node_id_ordering_matches_hex() {
        let a = NodeId::from_hex(&format!("02{}", "aa".repeat(32))).unwrap();
        let b = NodeId::from_hex(&format!("02{}", "bb".repeat(32))).unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn intent_key_round_trip() {
        let key = IntentKey {
            kind: IntentKind::Rebalance,
            target: NodeId([2u8; 33]),
            initiator: NodeId([3u8; 33]),
        };
        assert_eq!(IntentKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn ratio_edge_cases() {
        let zero = ContributionTotals { forwarded_msat: 0, received_msat: 0 };
        assert_eq!(zero.ratio(), 0.0);
        let giver = ContributionTotals { forwarded_msat: 5, received_msat: 0 };
        assert!(giver.ratio().is_infinite());
        let even = ContributionTotals { forwarded_msat: 10, received_msat: 10 };
        assert_eq!(even.ratio(), 1.0);
    }
}
