//! Protocol constants.

/// Timelock decrement per hop on a multi-hop HTLC route. Hop `i` of `n`
/// expires `(n - i - 1) * HTLC_MIN_DELTA_MS` before the base timelock so
/// upstream locks always outlive downstream ones.
pub const HTLC_MIN_DELTA_MS: i64 = 30_000;

/// Committed frames retained per machine before the oldest is dropped.
pub const MAX_FRAME_HISTORY: usize = 64;

/// Chat messages retained in an entity's bounded message ring.
pub const MAX_ENTITY_MESSAGES: usize = 100;

/// Edge-utilization weight in the route success-probability estimate
/// `exp(-alpha * utilization)`.
pub const ROUTE_PROBABILITY_ALPHA: f64 = 0.5;
