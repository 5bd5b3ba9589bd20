//! canal-routing
//!
//! Fee- and capacity-aware path finding over the gossiped topology. A
//! modified Dijkstra walks backwards from the destination so the sender's
//! total outlay (amount plus accumulated fees) is known exactly, pruning
//! edges whose residual capacity cannot carry the downstream requirement.

pub mod graph;

pub use graph::{find_routes, PaymentRoute, RouteGraph, RouteHop};
