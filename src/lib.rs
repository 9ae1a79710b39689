//! Core of a WAMP v2 router: session state machine, pub/sub broker with
//! cross-node fanout over Redis, and a small static dealer.
#![allow(clippy::large_enum_variant)]

mod error;
mod identifier;
mod utils;

pub mod config;
pub mod messages;
pub mod router;
pub mod session;
pub mod topic;

pub use error::{Error, ErrorKind};
pub use identifier::IdAllocator;
pub use messages::{BroadcastMessage, Code, Message};
pub use router::Router;
pub use session::{ClientConnection, ConnectionRegistry};
pub use topic::{Topic, TopicManager};

/// A WAMP global-scope identifier: an integer in `[0, 2^53]`.
pub type ID = u64;

pub type Dict = serde_json::Map<String, serde_json::Value>;
pub type List = Vec<serde_json::Value>;

pub type WampResult<T> = Result<T, Error>;
