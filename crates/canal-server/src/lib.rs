//! canal-server
//!
//! The tick-driven coordinator: routes inputs to replicas by
//! `"entityId:signerId"`, drains replica outputs to quiescence within the
//! tick, and hands remote-destined outputs back to the host. The host owns
//! the clock; the coordinator never blocks.

pub mod server;

pub use server::{RoutedInput, Server};
