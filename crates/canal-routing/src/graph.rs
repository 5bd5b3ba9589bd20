use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use canal_core::constants::ROUTE_PROBABILITY_ALPHA;
use canal_core::types::{Amount, EntityId, TokenId};
use canal_gossip::Registry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One hop of a payment route: `amount` is delivered into `to`, `fee` is
/// what the edge charges for carrying it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    pub from: EntityId,
    pub to: EntityId,
    pub amount: Amount,
    pub fee: Amount,
}

/// A ranked candidate route. `amount_to_send` is the sender's total outlay
/// including every downstream fee; `probability` is the success estimate
/// `exp(-alpha * utilization)` multiplied over the edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentRoute {
    pub hops: Vec<RouteHop>,
    pub amount_to_send: Amount,
    pub total_fee: Amount,
    pub probability: f64,
    pub score: f64,
}

#[derive(Clone, Debug)]
struct Edge {
    from: EntityId,
    capacity: Amount,
    fee_base: Amount,
    fee_ppm: u32,
    utilization_ppm: u32,
}

/// Directed graph for one token, built from the current profile set. Edges
/// point in the sending direction and are indexed by their target so the
/// backward search can walk them in reverse.
#[derive(Clone, Debug, Default)]
pub struct RouteGraph {
    in_edges: BTreeMap<EntityId, Vec<Edge>>,
}

impl RouteGraph {
    pub fn from_registry(registry: &Registry, token: TokenId) -> Self {
        let mut in_edges: BTreeMap<EntityId, Vec<Edge>> = BTreeMap::new();
        for profile in registry.all() {
            for cap in &profile.account_capacities {
                if cap.token_id != token || cap.capacity == 0 {
                    continue;
                }
                in_edges.entry(cap.peer).or_default().push(Edge {
                    from: profile.entity_id,
                    capacity: cap.capacity,
                    fee_base: cap.fee_base,
                    fee_ppm: cap.fee_ppm,
                    utilization_ppm: cap.utilization_ppm,
                });
            }
        }
        Self { in_edges }
    }

    /// Cheapest feasible route by sender outlay, ignoring `excluded` edges.
    fn best_route(
        &self,
        from: EntityId,
        to: EntityId,
        amount: Amount,
        excluded: &BTreeSet<(EntityId, EntityId)>,
    ) -> Option<PaymentRoute> {
        if from == to || amount == 0 {
            return None;
        }

        // required[n] = what must arrive at n for `amount` to reach `to`.
        let mut required: BTreeMap<EntityId, Amount> = BTreeMap::new();
        let mut next_hop: BTreeMap<EntityId, (EntityId, Amount, u32)> = BTreeMap::new();
        let mut visited: BTreeSet<EntityId> = BTreeSet::new();
        let mut heap = BinaryHeap::new();

        required.insert(to, amount);
        heap.push(Reverse((amount, to)));

        while let Some(Reverse((req, node))) = heap.pop() {
            if !visited.insert(node) {
                continue;
            }
            if node == from {
                break;
            }
            let Some(edges) = self.in_edges.get(&node) else {
                continue;
            };
            for edge in edges {
                if visited.contains(&edge.from) || excluded.contains(&(edge.from, node)) {
                    continue;
                }
                // Prune edges that cannot carry the downstream requirement.
                if edge.capacity < req {
                    continue;
                }
                let Some(fee) = edge_fee(edge, req) else {
                    continue;
                };
                let Some(candidate) = req.checked_add(fee) else {
                    continue;
                };
                let better = required
                    .get(&edge.from)
                    .map(|current| candidate < *current)
                    .unwrap_or(true);
                if better {
                    required.insert(edge.from, candidate);
                    next_hop.insert(edge.from, (node, fee, edge.utilization_ppm));
                    heap.push(Reverse((candidate, edge.from)));
                }
            }
        }

        let amount_to_send = *required.get(&from)?;
        if !visited.contains(&from) {
            return None;
        }

        let mut hops = Vec::new();
        let mut probability = 1.0f64;
        let mut cursor = from;
        while cursor != to {
            let (next, fee, utilization_ppm) = *next_hop.get(&cursor)?;
            hops.push(RouteHop {
                from: cursor,
                to: next,
                amount: *required.get(&next)?,
                fee,
            });
            probability *=
                (-ROUTE_PROBABILITY_ALPHA * f64::from(utilization_ppm) / 1_000_000.0).exp();
            cursor = next;
        }

        let total_fee = amount_to_send - amount;
        let score = (total_fee as f64 + 1.0) / probability.max(f64::MIN_POSITIVE);
        Some(PaymentRoute {
            hops,
            amount_to_send,
            total_fee,
            probability,
            score,
        })
    }

    /// Up to `max_routes` candidate routes ranked by composite score
    /// (total fee weighted by estimated success probability, lower first).
    pub fn find_routes(
        &self,
        from: EntityId,
        to: EntityId,
        amount: Amount,
        max_routes: usize,
    ) -> Vec<PaymentRoute> {
        let Some(best) = self.best_route(from, to, amount, &BTreeSet::new()) else {
            return Vec::new();
        };

        // Derive alternatives by excluding one best-path edge at a time.
        let mut candidates = vec![best.clone()];
        for hop in &best.hops {
            let excluded = BTreeSet::from([(hop.from, hop.to)]);
            if let Some(alt) = self.best_route(from, to, amount, &excluded) {
                let duplicate = candidates.iter().any(|c| c.hops == alt.hops);
                if !duplicate {
                    candidates.push(alt);
                }
            }
        }

        candidates.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(max_routes);
        debug!(routes = candidates.len(), "route search finished");
        candidates
    }
}

fn edge_fee(edge: &Edge, amount: Amount) -> Option<Amount> {
    let proportional = amount
        .checked_mul(u128::from(edge.fee_ppm))?
        / 1_000_000;
    edge.fee_base.checked_add(proportional)
}

/// Convenience entry point straight from the registry.
pub fn find_routes(
    registry: &Registry,
    from: EntityId,
    to: EntityId,
    token: TokenId,
    amount: Amount,
    max_routes: usize,
) -> Vec<PaymentRoute> {
    RouteGraph::from_registry(registry, token).find_routes(from, to, amount, max_routes)
}
