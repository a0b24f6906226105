//! Request/response plumbing between nodes.

pub mod config;
pub mod lookup;
pub mod request_tracker;
pub mod transport;

pub use config::Config;
pub use lookup::{ClosestNodes, IterativeLookup, LookupResponse, LookupResult, ALPHA};
pub use request_tracker::{DuplicateRequestId, PendingHandle, RequestOutcome, RequestTracker};
pub use transport::{InboundHandler, TcpTransport, TransportError};
