//! Core DHT logic - pure computation with no direct I/O.
//!
//! All I/O orchestration lives in `dht`, which calls into this module.

pub(crate) mod routing_maintenance;
