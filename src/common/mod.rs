//! Miscellaneous common structs used throughout the library.

mod id;
mod identity;
pub mod messages;
mod node;
mod routing_table;

pub use id::*;
pub use identity::*;
pub use messages::{
    DhtMessage, ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    FindValueRequestArguments, FindValueResponseArguments, MessageError, MessageType, NodeInfo,
    RejectReason, RequestId, StoreRequestArguments,
};
pub use node::*;
pub use routing_table::*;
