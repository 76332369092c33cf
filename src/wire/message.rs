//! Control message types
//!
//! A closed sum over every frame the overlay understands. Type numbers are
//! odd, drawn from a private range, and stable: new types append, existing
//! ones are never renumbered. Bodies are JSON; unknown fields are ignored,
//! unknown types in range are dropped by the dispatcher.

use super::frame::{seal_frame, split_frame};
use super::limits::{BoundedVec, MAX_CAPABILITIES, MAX_GOSSIP_CHANNELS};
use crate::error::{HiveError, Result};
use crate::types::{IntentKind, NodeId, PeerState, PromotionVouch, RequestId, Tier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Hello = 0xA001,
    Challenge = 0xA003,
    Attest = 0xA005,
    Welcome = 0xA007,
    Gossip = 0xA009,
    StateHash = 0xA00B,
    FullSync = 0xA00D,
    Intent = 0xA00F,
    IntentAbort = 0xA011,
    Vouch = 0xA013,
    PromotionRequest = 0xA015,
    Promotion = 0xA017,
    Ban = 0xA019,
}

impl MsgType {
    pub const FIRST: u16 = 0xA001;
    pub const LAST: u16 = 0xA019;
    /// Top of the window reserved for future hive types. Frames in
    /// `(LAST, RANGE_END]` decode to "unknown, drop" instead of an error.
    pub const RANGE_END: u16 = 0xA03F;

    pub fn from_u16(t: u16) -> Option<Self> {
        match t {
            0xA001 => Some(MsgType::Hello),
            0xA003 => Some(MsgType::Challenge),
            0xA005 => Some(MsgType::Attest),
            0xA007 => Some(MsgType::Welcome),
            0xA009 => Some(MsgType::Gossip),
            0xA00B => Some(MsgType::StateHash),
            0xA00D => Some(MsgType::FullSync),
            0xA00F => Some(MsgType::Intent),
            0xA011 => Some(MsgType::IntentAbort),
            0xA013 => Some(MsgType::Vouch),
            0xA015 => Some(MsgType::PromotionRequest),
            0xA017 => Some(MsgType::Promotion),
            0xA019 => Some(MsgType::Ban),
            _ => None,
        }
    }

    /// Whether a type number falls inside the hive's private range, known
    /// variant or not.
    pub fn in_range(t: u16) -> bool {
        (Self::FIRST..=Self::RANGE_END).contains(&t) && t % 2 == 1
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Admin-signed admission ticket. The signature covers
/// `invite:{pubkey}:{expires_at}:{hive_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteTicket {
    pub pubkey: NodeId,
    pub expires_at: u64,
    pub signature: String,
}

pub fn invite_message(pubkey: &NodeId, expires_at: u64, hive_id: &str) -> String {
    format!("invite:{pubkey}:{expires_at}:{hive_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub pubkey: NodeId,
    pub capabilities: BoundedVec<String, MAX_CAPABILITIES>,
    #[serde(default)]
    pub ticket: Option<InviteTicket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    /// 32 random bytes, hex.
    pub nonce: String,
}

/// What the candidate attests to. Serialized field order is the canonical
/// form the signature covers; do not reorder fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub pubkey: NodeId,
    pub protocol_version: u32,
    pub capabilities: BoundedVec<String, MAX_CAPABILITIES>,
}

impl Manifest {
    pub fn canonical(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestPayload {
    pub manifest: Manifest,
    /// HSM signature over `{nonce_hex}|{manifest_canonical}`.
    pub signature: String,
}

pub fn attest_message(nonce_hex: &str, manifest_canonical: &str) -> String {
    format!("{nonce_hex}|{manifest_canonical}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub tier: Tier,
    pub hive_id: String,
    /// Pubkey of the hive initiator; invite signatures verify against it.
    pub admin: NodeId,
    pub fleet_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPayload {
    pub state: PeerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHashPayload {
    /// Fleet hash, hex of 32 bytes.
    pub fleet_hash: String,
    pub members: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncPayload {
    /// Intentionally unbounded at decode: the receiver applies the first
    /// `max_full_sync_states` records and logs the overflow, so a miscounted
    /// sender degrades instead of desyncing. Frame size still caps the total.
    pub states: Vec<PeerState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPayload {
    pub kind: IntentKind,
    pub target: NodeId,
    pub initiator: NodeId,
    pub amount_sat: u64,
    pub timestamp: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentAbortPayload {
    pub kind: IntentKind,
    pub target: NodeId,
    pub initiator: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRequestPayload {
    pub subject: NodeId,
    pub request_id: RequestId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPayload {
    pub subject: NodeId,
    pub request_id: RequestId,
    pub vouches: Vec<PromotionVouch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanPayload {
    pub subject: NodeId,
    pub reason: String,
    pub timestamp: u64,
}

// =============================================================================
// MESSAGE SUM TYPE
// =============================================================================

#[derive(Debug, Clone)]
pub enum Message {
    Hello(HelloPayload),
    Challenge(ChallengePayload),
    Attest(AttestPayload),
    Welcome(WelcomePayload),
    Gossip(GossipPayload),
    StateHash(StateHashPayload),
    FullSync(FullSyncPayload),
    Intent(IntentPayload),
    IntentAbort(IntentAbortPayload),
    Vouch(PromotionVouch),
    PromotionRequest(PromotionRequestPayload),
    Promotion(PromotionPayload),
    Ban(BanPayload),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Hello(_) => MsgType::Hello,
            Message::Challenge(_) => MsgType::Challenge,
            Message::Attest(_) => MsgType::Attest,
            Message::Welcome(_) => MsgType::Welcome,
            Message::Gossip(_) => MsgType::Gossip,
            Message::StateHash(_) => MsgType::StateHash,
            Message::FullSync(_) => MsgType::FullSync,
            Message::Intent(_) => MsgType::Intent,
            Message::IntentAbort(_) => MsgType::IntentAbort,
            Message::Vouch(_) => MsgType::Vouch,
            Message::PromotionRequest(_) => MsgType::PromotionRequest,
            Message::Promotion(_) => MsgType::Promotion,
            Message::Ban(_) => MsgType::Ban,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Challenge(_) => "challenge",
            Message::Attest(_) => "attest",
            Message::Welcome(_) => "welcome",
            Message::Gossip(_) => "gossip",
            Message::StateHash(_) => "state_hash",
            Message::FullSync(_) => "full_sync",
            Message::Intent(_) => "intent",
            Message::IntentAbort(_) => "intent_abort",
            Message::Vouch(_) => "vouch",
            Message::PromotionRequest(_) => "promotion_request",
            Message::Promotion(_) => "promotion",
            Message::Ban(_) => "ban",
        }
    }

    /// Admission handlers accept these from non-members; everything else is
    /// gated on current membership.
    pub fn allowed_pre_admission(&self) -> bool {
        matches!(
            self,
            Message::Hello(_) | Message::Challenge(_) | Message::Attest(_) | Message::Welcome(_)
        )
    }

    /// Serialize into a complete frame (magic + type + body).
    pub fn seal(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::Hello(p) => serde_json::to_vec(p),
            Message::Challenge(p) => serde_json::to_vec(p),
            Message::Attest(p) => serde_json::to_vec(p),
            Message::Welcome(p) => serde_json::to_vec(p),
            Message::Gossip(p) => serde_json::to_vec(p),
            Message::StateHash(p) => serde_json::to_vec(p),
            Message::FullSync(p) => serde_json::to_vec(p),
            Message::Intent(p) => serde_json::to_vec(p),
            Message::IntentAbort(p) => serde_json::to_vec(p),
            Message::Vouch(p) => serde_json::to_vec(p),
            Message::PromotionRequest(p) => serde_json::to_vec(p),
            Message::Promotion(p) => serde_json::to_vec(p),
            Message::Ban(p) => serde_json::to_vec(p),
        }?;
        seal_frame(self.msg_type() as u16, &body)
    }

    /// Decode a magic-verified frame. `Ok(None)` means the type number is in
    /// the hive range but unknown to this build: drop silently, stay
    /// forward-compatible.
    pub fn decode(buf: &[u8]) -> Result<Option<Message>> {
        let (raw_type, body) = split_frame(buf)?;
        let Some(msg_type) = MsgType::from_u16(raw_type) else {
            if MsgType::in_range(raw_type) {
                return Ok(None);
            }
            return Err(HiveError::Malformed(format!("type {raw_type:#06x} outside hive range")));
        };
        let msg = match msg_type {
            MsgType::Hello => Message::Hello(serde_json::from_slice(body)?),
            MsgType::Challenge => Message::Challenge(serde_json::from_slice(body)?),
            MsgType::Attest => Message::Attest(serde_json::from_slice(body)?),
            MsgType::Welcome => Message::Welcome(serde_json::from_slice(body)?),
            MsgType::Gossip => {
                let p: GossipPayload = serde_json::from_slice(body)?;
                validate_peer_state(&p.state)?;
                Message::Gossip(p)
            }
            MsgType::StateHash => Message::StateHash(serde_json::from_slice(body)?),
            MsgType::FullSync => {
                let p: FullSyncPayload = serde_json::from_slice(body)?;
                for state in &p.states {
                    validate_peer_state(state)?;
                }
                Message::FullSync(p)
            }
            MsgType::Intent => Message::Intent(serde_json::from_slice(body)?),
            MsgType::IntentAbort => Message::IntentAbort(serde_json::from_slice(body)?),
            MsgType::Vouch => Message::Vouch(serde_json::from_slice(body)?),
            MsgType::PromotionRequest => Message::PromotionRequest(serde_json::from_slice(body)?),
            MsgType::Promotion => Message::Promotion(serde_json::from_slice(body)?),
            MsgType::Ban => Message::Ban(serde_json::from_slice(body)?),
        };
        Ok(Some(msg))
    }
}

/// Field-level range checks a gossip record must pass before any component
/// sees it.
pub fn validate_peer_state(state: &PeerState) -> Result<()> {
    if state.channels.len() > MAX_GOSSIP_CHANNELS {
        return Err(HiveError::Malformed(format!(
            "gossip carries {} channels (cap {MAX_GOSSIP_CHANNELS})",
            state.channels.len()
        )));
    }
    if state.fee_policy_hash.len() > 64 {
        return Err(HiveError::Malformed("fee policy hash too long".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Health;

    fn node(b: u8) -> NodeId {
        NodeId([b; 33])
    }

    fn sample_state(version: u64) -> PeerState {
        PeerState {
            pubkey: node(2),
            version,
            timestamp: 1_700_000_000,
            capacity_sat: 5_000_000,
            available_funds_sat: 1_000_000,
            channels: vec![],
            fee_policy_hash: "00aa".into(),
            health: Health::Good,
        }
    }

    #[test]
    fn encode_decode_identity() {
        let msg = Message::Gossip(GossipPayload { state: sample_state(7) });
        let frame = msg.seal().unwrap();
        match Message::decode(&frame).unwrap().unwrap() {
            Message::Gossip(p) => assert_eq!(p.state.version, 7),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_in_range_is_dropped_not_error() {
        // 0xA01B is odd and inside the reserved window.
        let frame = seal_frame(0xA01B, br#"{}"#).unwrap();
        assert!(Message::decode(&frame).unwrap().is_none());
    }

    #[test]
    fn type_outside_range_is_malformed() {
        let frame = seal_frame(0x9FFF, br#"{}"#).unwrap();
        assert!(matches!(Message::decode(&frame), Err(HiveError::Malformed(_))));
    }

    #[test]
    fn type_range_check() {
        assert!(MsgType::in_range(0xA001));
        assert!(MsgType::in_range(0xA019));
        assert!(MsgType::in_range(0xA01B)); // reserved, unknown
        assert!(!MsgType::in_range(0xA002)); // even
        assert!(!MsgType::in_range(0x9FFF));
        assert!(!MsgType::in_range(0xA041));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = br#"{"nonce": "aa", "surprise": 42}"#;
        let frame = seal_frame(MsgType::Challenge as u16, raw).unwrap();
        assert!(Message::decode(&frame).unwrap().is_some());
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let frame = seal_frame(MsgType::Challenge as u16, br#"{}"#).unwrap();
        assert!(matches!(Message::decode(&frame), Err(HiveError::Malformed(_))));
    }

    #[test]
    fn overfull_gossip_channels_rejected() {
        let mut state = sample_state(1);
        state.channels = (0..=MAX_GOSSIP_CHANNELS)
            .map(|_| crate::types::ChannelSummary { peer: node(9), capacity_sat: 1 })
            .collect();
        assert!(validate_peer_state(&state).is_err());
    }

    #[test]
    fn pre_admission_set_is_exactly_the_handshake() {
        let hello = Message::Hello(HelloPayload {
            pubkey: node(1),
            capabilities: Default::default(),
            ticket: None,
        });
        assert!(hello.allowed_pre_admission());
        let gossip = Message::Gossip(GossipPayload { state: sample_state(1) });
        assert!(!gossip.allowed_pre_admission());
    }
}
