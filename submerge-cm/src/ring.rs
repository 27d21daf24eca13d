// The token ring: who owns which token, who is bootstrapping or leaving,
// and which ranges are "pending" (in flight between owners). A single
// read-write lock guards every mutation and any read of the sorted-token
// cache, matching the distilled spec's concurrency model (§4.2, §5).

use crate::key::{Range, Token};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};
use submerge_net::NodeID;

pub type KeyspaceId = String;

// Notified synchronously, from inside the writer holding the lock, on
// every ring mutation. A ring-change event invalidates a replication
// strategy's natural-endpoint cache (see strategy.rs); that's the only
// listener in this crate, but the trait stays generic so other
// subsystems (not in scope here) can subscribe too.
pub trait RingChangeListener: Send + Sync {
    fn on_ring_change(&self);
}

struct Inner {
    token_to_endpoint: BTreeMap<Token, NodeID>,
    endpoint_to_token: HashMap<NodeID, Token>,
    bootstrap_tokens: BTreeMap<Token, NodeID>,
    bootstrap_endpoint_to_token: HashMap<NodeID, Token>,
    leaving_endpoints: HashSet<NodeID>,
    pending_ranges: HashMap<KeyspaceId, Vec<(Range, HashSet<NodeID>)>>,
    sorted_tokens: Vec<Token>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            token_to_endpoint: BTreeMap::new(),
            endpoint_to_token: HashMap::new(),
            bootstrap_tokens: BTreeMap::new(),
            bootstrap_endpoint_to_token: HashMap::new(),
            leaving_endpoints: HashSet::new(),
            pending_ranges: HashMap::new(),
            sorted_tokens: Vec::new(),
        }
    }

    fn rebuild_sorted_tokens(&mut self) {
        self.sorted_tokens = self.token_to_endpoint.keys().copied().collect();
    }
}

pub struct TokenMetadata {
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Arc<dyn RingChangeListener>>>,
    ring_version: AtomicU64,
}

impl Default for TokenMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenMetadata {
    pub fn new() -> Self {
        TokenMetadata {
            inner: RwLock::new(Inner::new()),
            listeners: RwLock::new(Vec::new()),
            ring_version: AtomicU64::new(0),
        }
    }

    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(AtomicOrdering::Acquire)
    }

    pub fn register(&self, listener: Arc<dyn RingChangeListener>) {
        // Copy-on-write: clone the current vec, push, swap it in. Readers
        // (the notify loop) always see one coherent snapshot.
        let mut guard = self.listeners.write().unwrap();
        let mut next = (*guard).clone();
        next.push(listener);
        *guard = next;
    }

    fn notify_ring_changed(&self) {
        self.ring_version.fetch_add(1, AtomicOrdering::AcqRel);
        let snapshot = self.listeners.read().unwrap().clone();
        for l in snapshot.iter() {
            l.on_ring_change();
        }
    }

    // Assigns `token` to `endpoint` as a normal (already-owning) member,
    // clearing any bootstrap-token bookkeeping for that endpoint. Asserts
    // the token isn't already claimed by a *different* endpoint -- caller
    // misuse here is a programming error, not a recoverable condition.
    pub fn update_normal_token(&self, token: Token, endpoint: NodeID) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(existing) = inner.token_to_endpoint.get(&token) {
                assert_eq!(
                    *existing, endpoint,
                    "token {:?} already owned by a different endpoint",
                    token
                );
            }
            if let Some(old_token) = inner.endpoint_to_token.get(&endpoint).copied() {
                if old_token != token {
                    inner.token_to_endpoint.remove(&old_token);
                }
            }
            inner.token_to_endpoint.insert(token, endpoint);
            inner.endpoint_to_token.insert(endpoint, token);
            if let Some(bt) = inner.bootstrap_endpoint_to_token.remove(&endpoint) {
                inner.bootstrap_tokens.remove(&bt);
            }
            inner.rebuild_sorted_tokens();
        }
        self.notify_ring_changed();
    }

    // Fails if `token` is already claimed, in either map, by a different
    // endpoint. Same-endpoint rewrites are idempotent.
    pub fn add_bootstrap_token(&self, token: Token, endpoint: NodeID) -> Result<(), String> {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(existing) = inner.bootstrap_tokens.get(&token) {
                if *existing != endpoint {
                    return Err(format!(
                        "token {:?} already claimed by {:?} in bootstrapTokens",
                        token, existing
                    ));
                }
            }
            if let Some(existing) = inner.token_to_endpoint.get(&token) {
                if *existing != endpoint {
                    return Err(format!(
                        "token {:?} already claimed by {:?} in tokenToEndpoint",
                        token, existing
                    ));
                }
            }
            if let Some(old) = inner.bootstrap_endpoint_to_token.get(&endpoint).copied() {
                if old != token {
                    inner.bootstrap_tokens.remove(&old);
                }
            }
            inner.bootstrap_tokens.insert(token, endpoint);
            inner.bootstrap_endpoint_to_token.insert(endpoint, token);
        }
        self.notify_ring_changed();
        Ok(())
    }

    pub fn remove_bootstrap_token(&self, token: Token) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(endpoint) = inner.bootstrap_tokens.remove(&token) {
                inner.bootstrap_endpoint_to_token.remove(&endpoint);
            }
        }
        self.notify_ring_changed();
    }

    pub fn add_leaving_endpoint(&self, endpoint: NodeID) {
        self.inner.write().unwrap().leaving_endpoints.insert(endpoint);
        self.notify_ring_changed();
    }

    pub fn remove_leaving_endpoint(&self, endpoint: NodeID) {
        self.inner.write().unwrap().leaving_endpoints.remove(&endpoint);
        self.notify_ring_changed();
    }

    // Removes an endpoint from every map it could appear in: a normal
    // member, a bootstrapping member, or a leaving member.
    pub fn remove_endpoint(&self, endpoint: NodeID) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(token) = inner.endpoint_to_token.remove(&endpoint) {
                inner.token_to_endpoint.remove(&token);
            }
            if let Some(token) = inner.bootstrap_endpoint_to_token.remove(&endpoint) {
                inner.bootstrap_tokens.remove(&token);
            }
            inner.leaving_endpoints.remove(&endpoint);
            inner.rebuild_sorted_tokens();
        }
        self.notify_ring_changed();
    }

    pub fn get_token(&self, endpoint: NodeID) -> Option<Token> {
        self.inner.read().unwrap().endpoint_to_token.get(&endpoint).copied()
    }

    pub fn get_endpoint(&self, token: Token) -> Option<NodeID> {
        self.inner.read().unwrap().token_to_endpoint.get(&token).copied()
    }

    pub fn is_member(&self, endpoint: NodeID) -> bool {
        self.inner.read().unwrap().endpoint_to_token.contains_key(&endpoint)
    }

    pub fn is_leaving(&self, endpoint: NodeID) -> bool {
        self.inner.read().unwrap().leaving_endpoints.contains(&endpoint)
    }

    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.inner.read().unwrap().sorted_tokens.clone()
    }

    // Predecessor wraps from the first token to the last; both endpoints
    // belong to the same ring, so this is only None when the ring is
    // empty.
    pub fn get_predecessor(&self, token: Token) -> Option<Token> {
        let inner = self.inner.read().unwrap();
        predecessor_of(&inner.sorted_tokens, token)
    }

    pub fn get_successor(&self, token: Token) -> Option<Token> {
        let inner = self.inner.read().unwrap();
        successor_of(&inner.sorted_tokens, token)
    }

    // Primary range of T = (predecessor(T), T].
    pub fn get_primary_range_for(&self, token: Token) -> Option<Range> {
        let pred = self.get_predecessor(token)?;
        Some(Range::new(pred, token))
    }

    // A finite cyclic sequence visiting every token exactly once, starting
    // just after `start`'s ring position and stopping before revisiting
    // it. `start` need not itself be a member token.
    pub fn ring_iterator(&self, start: Token) -> RingIterator {
        let tokens = self.sorted_tokens();
        let idx = ring_insertion_index(&tokens, start);
        RingIterator {
            tokens,
            start_idx: idx,
            offset: 0,
        }
    }

    pub fn get_pending_ranges(
        &self,
        keyspace: &str,
        endpoint: Option<NodeID>,
    ) -> Vec<(Range, HashSet<NodeID>)> {
        let inner = self.inner.read().unwrap();
        let all = inner.pending_ranges.get(keyspace);
        match (all, endpoint) {
            (None, _) => Vec::new(),
            (Some(ranges), None) => ranges.clone(),
            (Some(ranges), Some(ep)) => ranges
                .iter()
                .filter(|(_, eps)| eps.contains(&ep))
                .cloned()
                .collect(),
        }
    }

    pub fn set_pending_ranges(&self, keyspace: &str, ranges: Vec<(Range, HashSet<NodeID>)>) {
        {
            let mut inner = self.inner.write().unwrap();
            if ranges.is_empty() {
                inner.pending_ranges.remove(keyspace);
            } else {
                inner.pending_ranges.insert(keyspace.to_string(), ranges);
            }
        }
        self.notify_ring_changed();
    }

    // Write endpoints = natural endpoints unioned with any endpoint owning
    // a pending range containing `token` in `keyspace`. If there are no
    // pending ranges for the keyspace, the natural set is returned
    // unchanged (same contents, no extra allocation beyond the clone the
    // caller already owns).
    pub fn get_write_endpoints(
        &self,
        token: Token,
        keyspace: &str,
        natural_endpoints: &[NodeID],
    ) -> Vec<NodeID> {
        let inner = self.inner.read().unwrap();
        let Some(ranges) = inner.pending_ranges.get(keyspace) else {
            return natural_endpoints.to_vec();
        };
        if ranges.is_empty() {
            return natural_endpoints.to_vec();
        }
        let mut out: Vec<NodeID> = natural_endpoints.to_vec();
        for (range, endpoints) in ranges {
            if range.contains(token) {
                for ep in endpoints {
                    if !out.contains(ep) {
                        out.push(*ep);
                    }
                }
            }
        }
        out
    }

    // A snapshot containing only the normal token->endpoint assignments:
    // no bootstrap tokens, no leaving set, no pending ranges. Used by
    // replication strategies that need a stable view to compute natural
    // endpoints against.
    pub fn clone_only_token_map(&self) -> TokenMetadata {
        let inner = self.inner.read().unwrap();
        let mut fresh = Inner::new();
        fresh.token_to_endpoint = inner.token_to_endpoint.clone();
        fresh.endpoint_to_token = inner.endpoint_to_token.clone();
        fresh.rebuild_sorted_tokens();
        TokenMetadata {
            inner: RwLock::new(fresh),
            listeners: RwLock::new(Vec::new()),
            ring_version: AtomicU64::new(0),
        }
    }

    // A snapshot as it would look after every currently-leaving endpoint
    // had actually left: used to validate that the ring remains coherent
    // once pending departures complete.
    pub fn clone_after_all_left(&self) -> TokenMetadata {
        let inner = self.inner.read().unwrap();
        let mut fresh = Inner::new();
        for (token, endpoint) in inner.token_to_endpoint.iter() {
            if !inner.leaving_endpoints.contains(endpoint) {
                fresh.token_to_endpoint.insert(*token, *endpoint);
                fresh.endpoint_to_token.insert(*endpoint, *token);
            }
        }
        fresh.rebuild_sorted_tokens();
        TokenMetadata {
            inner: RwLock::new(fresh),
            listeners: RwLock::new(Vec::new()),
            ring_version: AtomicU64::new(0),
        }
    }
}

fn predecessor_of(sorted: &[Token], token: Token) -> Option<Token> {
    if sorted.is_empty() {
        return None;
    }
    match sorted.binary_search(&token) {
        Ok(idx) => {
            if idx == 0 {
                Some(sorted[sorted.len() - 1])
            } else {
                Some(sorted[idx - 1])
            }
        }
        Err(idx) => {
            // token not itself a member: predecessor is the nearest
            // smaller token, wrapping to the last if token is smaller
            // than everything.
            if idx == 0 {
                Some(sorted[sorted.len() - 1])
            } else {
                Some(sorted[idx - 1])
            }
        }
    }
}

fn successor_of(sorted: &[Token], token: Token) -> Option<Token> {
    if sorted.is_empty() {
        return None;
    }
    match sorted.binary_search(&token) {
        Ok(idx) => Some(sorted[(idx + 1) % sorted.len()]),
        Err(idx) => Some(sorted[idx % sorted.len()]),
    }
}

fn ring_insertion_index(sorted: &[Token], start: Token) -> usize {
    if sorted.is_empty() {
        return 0;
    }
    match sorted.binary_search(&start) {
        Ok(idx) => idx,
        Err(idx) => idx % sorted.len(),
    }
}

pub struct RingIterator {
    tokens: Vec<Token>,
    start_idx: usize,
    offset: usize,
}

impl Iterator for RingIterator {
    type Item = Token;
    fn next(&mut self) -> Option<Token> {
        if self.tokens.is_empty() || self.offset >= self.tokens.len() {
            return None;
        }
        let idx = (self.start_idx + self.offset) % self.tokens.len();
        self.offset += 1;
        Some(self.tokens[idx])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn ring_abc() -> TokenMetadata {
        let tm = TokenMetadata::new();
        tm.update_normal_token(Token(10), NodeID(1)); // A
        tm.update_normal_token(Token(20), NodeID(2)); // B
        tm.update_normal_token(Token(30), NodeID(3)); // C
        tm
    }

    #[test]
    fn primary_range_matches_spec_scenario_1() {
        let tm = ring_abc();
        assert_eq!(
            tm.get_primary_range_for(Token(20)),
            Some(Range::new(Token(10), Token(20)))
        );
        // wraps: predecessor(10) = 30
        assert_eq!(
            tm.get_primary_range_for(Token(10)),
            Some(Range::new(Token(30), Token(10)))
        );
    }

    #[test]
    fn successor_of_predecessor_is_identity() {
        let tm = ring_abc();
        for t in [Token(10), Token(20), Token(30)] {
            let pred = tm.get_predecessor(t).unwrap();
            assert_eq!(tm.get_successor(pred), Some(t));
        }
    }

    #[test]
    fn ring_iterator_matches_spec_scenario_2() {
        let tm = ring_abc();
        let seq: Vec<Token> = tm.ring_iterator(Token(15)).collect();
        assert_eq!(seq, vec![Token(20), Token(30), Token(10)]);
    }

    #[test]
    fn ring_iterator_visits_every_token_once() {
        let tm = ring_abc();
        let seq: Vec<Token> = tm.ring_iterator(Token(20)).collect();
        assert_eq!(seq.len(), 3);
        let mut sorted = seq.clone();
        sorted.sort();
        assert_eq!(sorted, vec![Token(10), Token(20), Token(30)]);
    }

    #[test]
    fn bootstrap_write_endpoints_matches_spec_scenario_3() {
        let tm = TokenMetadata::new();
        tm.update_normal_token(Token(10), NodeID(1)); // A
        tm.update_normal_token(Token(20), NodeID(2)); // B
        tm.add_bootstrap_token(Token(15), NodeID(4)).unwrap(); // D

        let mut endpoints = HashSet::new();
        endpoints.insert(NodeID(4));
        tm.set_pending_ranges(
            "ks",
            vec![(Range::new(Token(10), Token(15)), endpoints)],
        );

        let we = tm.get_write_endpoints(Token(12), "ks", &[NodeID(2)]);
        let mut we_sorted = we.clone();
        we_sorted.sort_by_key(|n| n.0);
        assert_eq!(we_sorted, vec![NodeID(2), NodeID(4)]);

        let we2 = tm.get_write_endpoints(Token(18), "ks", &[NodeID(2)]);
        assert_eq!(we2, vec![NodeID(2)]);
    }

    #[test]
    fn write_endpoints_always_superset_of_natural() {
        let tm = ring_abc();
        let natural = vec![NodeID(1), NodeID(2)];
        let we = tm.get_write_endpoints(Token(5), "nonexistent-ks", &natural);
        assert_eq!(we, natural);
    }

    #[test]
    fn bootstrap_collision_rejected_for_different_endpoint() {
        let tm = TokenMetadata::new();
        tm.add_bootstrap_token(Token(5), NodeID(1)).unwrap();
        assert!(tm.add_bootstrap_token(Token(5), NodeID(2)).is_err());
        // Same endpoint rewrite is idempotent.
        assert!(tm.add_bootstrap_token(Token(5), NodeID(1)).is_ok());
    }

    #[test]
    fn ring_change_listener_notified_on_mutation() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        struct Counter(AtomicUsize);
        impl RingChangeListener for Counter {
            fn on_ring_change(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let tm = TokenMetadata::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        tm.register(counter.clone());
        tm.update_normal_token(Token(1), NodeID(1));
        tm.update_normal_token(Token(2), NodeID(2));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
