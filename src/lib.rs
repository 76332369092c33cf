pub mod bridge;
pub mod config;
pub mod contribution;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod governance;
pub mod handshake;
pub mod intent;
pub mod loops;
pub mod membership;
pub mod node;
pub mod planner;
pub mod rate_limit;
pub mod state;
pub mod store;
pub mod types;
pub mod wire;

pub use bridge::{BreakerState, Bridge, ExecutorClient, PolicyKind};
pub use config::HiveConfig;
pub use dispatcher::{Dispatcher, Disposition};
pub use error::{HiveError, Result};
pub use node::{HostEvent, HostNode, LocalChannel, RpcGateway};
pub use state::{fleet_hash_of, GossipOutcome, StateManager};
pub use store::{Role, Store};
pub use types::*;
pub use wire::{Message, MsgType, WIRE_MAGIC};
