//! Wire codec: frame layout, bounded decoding, message sum type

pub mod frame;
pub mod limits;
pub mod message;

pub use frame::{has_magic, seal_frame, split_frame, MAX_FRAME_SIZE, MAX_JSON_DEPTH, WIRE_MAGIC};
pub use limits::{json_depth_ok, BoundedVec, MAX_CAPABILITIES, MAX_GOSSIP_CHANNELS, MAX_PROMOTION_VOUCHES};
pub use message::{
    attest_message, invite_message, validate_peer_state, AttestPayload, BanPayload,
    ChallengePayload, FullSyncPayload, GossipPayload, HelloPayload, IntentAbortPayload,
    IntentPayload, InviteTicket, Manifest, Message, MsgType, PromotionPayload,
    PromotionRequestPayload, StateHashPayload, WelcomePayload,
};
