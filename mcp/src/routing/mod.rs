//! Message routing with weighted failover between primary and backup servers.

pub mod router;

pub use router::{MessageRouter, RoutingTable};
