// Merkle-tree anti-entropy: tree build during a read-only scan, tree
// exchange between replicas, and lock-step differencing to find the
// minimal set of disagreeing ranges. Leaf/interior hashing rides on
// rapidhash, the same non-cryptographic hash submerge-coldb already uses
// for its dictionary -- a 64-bit digest is plenty for "do these two
// subtrees match", and it keeps the dependency stack unchanged.

use crate::key::{DecoratedKey, Range, Token};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::Duration as StdDuration;
use submerge_net::NodeID;
use tracing::warn;

fn mix(a: u64, b: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&a.to_le_bytes());
    buf[8..16].copy_from_slice(&b.to_le_bytes());
    rapidhash::rapidhash(&buf)
}

fn hash_row_content(token: Token, content_hash: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&token.0.to_le_bytes());
    buf[8..16].copy_from_slice(&content_hash.to_le_bytes());
    rapidhash::rapidhash(&buf)
}

enum Node {
    Leaf {
        range: Range,
        hash: Option<u64>,
    },
    Inner {
        range: Range,
        left: Box<Node>,
        right: Box<Node>,
        hash: Option<u64>,
    },
}

impl Node {
    fn range(&self) -> Range {
        match self {
            Node::Leaf { range, .. } => *range,
            Node::Inner { range, .. } => *range,
        }
    }

    fn hash(&self) -> Option<u64> {
        match self {
            Node::Leaf { hash, .. } => *hash,
            Node::Inner { hash, .. } => *hash,
        }
    }

    fn build(range: Range, depth: u32) -> Node {
        if depth == 0 {
            return Node::Leaf { range, hash: None };
        }
        let mid = midpoint(range.left, range.right);
        if mid == range.left || mid == range.right {
            // Range too narrow to bisect further; stop early.
            return Node::Leaf { range, hash: None };
        }
        let left = Node::build(Range::new(range.left, mid), depth - 1);
        let right = Node::build(Range::new(mid, range.right), depth - 1);
        Node::Inner {
            range,
            left: Box::new(left),
            right: Box::new(right),
            hash: None,
        }
    }

    fn hash_row(&mut self, token: Token, content_hash: u64) -> bool {
        if !self.range().contains(token) {
            return false;
        }
        match self {
            Node::Leaf { hash, .. } => {
                let row_hash = hash_row_content(token, content_hash);
                *hash = Some(match *hash {
                    Some(existing) => existing ^ row_hash,
                    None => row_hash,
                });
                true
            }
            Node::Inner { left, right, .. } => {
                left.hash_row(token, content_hash) || right.hash_row(token, content_hash)
            }
        }
    }

    fn seal(&mut self) {
        if let Node::Inner { left, right, hash, .. } = self {
            left.seal();
            right.seal();
            *hash = match (left.hash(), right.hash()) {
                (None, None) => None,
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (Some(l), Some(r)) => Some(mix(l, r)),
            };
        }
    }

    fn find_exact(&self, range: Range) -> Option<u64> {
        if self.range() == range {
            return self.hash();
        }
        match self {
            Node::Leaf { .. } => None,
            Node::Inner { left, right, .. } => {
                left.find_exact(range).or_else(|| right.find_exact(range))
            }
        }
    }

    fn collect_differences(a: &Node, b: &Node, out: &mut Vec<Range>) {
        if a.hash() == b.hash() {
            return;
        }
        match (a, b) {
            (Node::Inner { left: al, right: ar, .. }, Node::Inner { left: bl, right: br, .. }) => {
                Node::collect_differences(al, bl, out);
                Node::collect_differences(ar, br, out);
            }
            _ => out.push(a.range()),
        }
    }
}

// On an i64 ring, splits [left, right) at the arithmetic midpoint,
// computed in i128 so the (right - left) addition can't overflow.
fn midpoint(left: Token, right: Token) -> Token {
    let mid = (left.0 as i128 + right.0 as i128) / 2;
    Token(mid as i64)
}

pub struct MerkleTree {
    root: Node,
    sealed: bool,
}

impl MerkleTree {
    // `depth` is chosen by the caller so the tree has at least
    // cluster_size * branching leaves (§4.6 point 1); this module just
    // bisects the given range that many times.
    pub fn build(range: Range, depth: u32) -> Self {
        MerkleTree {
            root: Node::build(range, depth),
            sealed: false,
        }
    }

    pub fn hash_row(&mut self, key: &DecoratedKey, content_hash: u64) {
        debug_assert!(!self.sealed, "hash_row called on a sealed MerkleTree");
        self.root.hash_row(key.token, content_hash);
    }

    pub fn seal(&mut self) {
        self.root.seal();
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn hash(&self, range: Range) -> Option<u64> {
        self.root.find_exact(range)
    }

    pub fn range(&self) -> Range {
        self.root.range()
    }
}

// Walks both trees in lock-step; wherever hashes disagree at an interior
// node it recurses, and at a disagreeing leaf (or a leaf facing an
// inner node -- the trees were built to different depths) it records the
// whole leaf range. Two identical trees yield no differences.
pub fn differences(a: &MerkleTree, b: &MerkleTree) -> Vec<Range> {
    let mut out = Vec::new();
    Node::collect_differences(&a.root, &b.root, &mut out);
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RepairSessionState {
    NotStarted,
    Running,
    WaitingForResponses,
    Completed,
    Failed,
}

impl RepairSessionState {
    fn is_terminal(self) -> bool {
        matches!(self, RepairSessionState::Completed | RepairSessionState::Failed)
    }
}

pub struct RepairSession {
    pub keyspace: String,
    pub column_family: String,
    participants: HashSet<NodeID>,
    state: Mutex<RepairSessionState>,
    completed: Mutex<HashSet<NodeID>>,
    cvar: Condvar,
}

impl RepairSession {
    pub fn new(keyspace: impl Into<String>, column_family: impl Into<String>, participants: HashSet<NodeID>) -> Self {
        RepairSession {
            keyspace: keyspace.into(),
            column_family: column_family.into(),
            participants,
            state: Mutex::new(RepairSessionState::NotStarted),
            completed: Mutex::new(HashSet::new()),
            cvar: Condvar::new(),
        }
    }

    pub fn state(&self) -> RepairSessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == RepairSessionState::NotStarted {
            *state = RepairSessionState::Running;
        }
    }

    pub fn block_until_running(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == RepairSessionState::Running {
            *state = RepairSessionState::WaitingForResponses;
        }
        self.cvar.notify_all();
    }

    // Called once per invited endpoint as its validator completes.
    // Transitions to Completed once every participant has reported in.
    pub fn completed_request(&self, endpoint: NodeID) {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            return;
        }
        let mut completed = self.completed.lock().unwrap();
        completed.insert(endpoint);
        if completed.is_superset(&self.participants) {
            *state = RepairSessionState::Completed;
            self.cvar.notify_all();
        }
    }

    pub fn convict(&self, endpoint: NodeID) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            warn!(
                keyspace = %self.keyspace,
                column_family = %self.column_family,
                ?endpoint,
                "repair session failed: participant convicted"
            );
            *state = RepairSessionState::Failed;
            self.cvar.notify_all();
        }
    }

    // Blocks until the session reaches a terminal state or `timeout`
    // elapses, whichever comes first; returns the state observed on
    // return. The caller checks `is_alive` rather than treating a
    // timeout as an error (§4.6's "join" semantics).
    pub fn join(&self, timeout: StdDuration) -> RepairSessionState {
        let state = self.state.lock().unwrap();
        let (state, _timeout_result) = self
            .cvar
            .wait_timeout_while(state, timeout, |s| !s.is_terminal())
            .unwrap();
        *state
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidatorKind {
    NoOp,
    Real,
}

// Throttles validator creation across a natural-repair window: a major
// compaction always gets a real validator, but a natural (non-major)
// compaction only gets one the first time a given (keyspace, cf) asks
// with no explicit initiator in the current window (§4.6, "Natural-repair
// guard").
#[derive(Default)]
pub struct NaturalRepairThrottle {
    created_this_window: Mutex<HashSet<(String, String)>>,
}

impl NaturalRepairThrottle {
    pub fn new() -> Self {
        NaturalRepairThrottle::default()
    }

    pub fn get_validator(
        &self,
        keyspace: &str,
        column_family: &str,
        initiator: Option<NodeID>,
        major: bool,
    ) -> ValidatorKind {
        if !major {
            return ValidatorKind::NoOp;
        }
        if initiator.is_none() {
            let mut created = self.created_this_window.lock().unwrap();
            let key = (keyspace.to_string(), column_family.to_string());
            if created.contains(&key) {
                return ValidatorKind::NoOp;
            }
            created.insert(key);
        }
        ValidatorKind::Real
    }

    pub fn reset_window(&self) {
        self.created_this_window.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    fn dk(token: i64) -> DecoratedKey {
        DecoratedKey::new(Token(token), vec![0u8].into_boxed_slice())
    }

    #[test]
    fn identical_trees_have_no_differences() {
        let range = Range::new(Token(0), Token(100));
        let mut a = MerkleTree::build(range, 3);
        let mut b = MerkleTree::build(range, 3);
        for t in [5, 17, 42, 63, 88] {
            a.hash_row(&dk(t), 0xdead_beef);
            b.hash_row(&dk(t), 0xdead_beef);
        }
        a.seal();
        b.seal();
        assert_eq!(a.hash(range), b.hash(range));
        assert!(differences(&a, &b).is_empty());
    }

    // §8 scenario 6: two identical trees, then flip one leaf's content
    // hash -- the differencer must report exactly that leaf's range.
    #[test]
    fn one_flipped_leaf_is_isolated() {
        let range = Range::new(Token(0), Token(100));
        let mut a = MerkleTree::build(range, 3);
        let mut b = MerkleTree::build(range, 3);
        for t in [5, 17, 42, 63, 88] {
            a.hash_row(&dk(t), 0xdead_beef);
            b.hash_row(&dk(t), 0xdead_beef);
        }
        // Disagree only about the row at token 42.
        b.hash_row(&dk(42), 0xffff_ffff);
        a.seal();
        b.seal();

        let diffs = differences(&a, &b);
        assert_eq!(diffs.len(), 1);
        assert!(diffs[0].contains(Token(42)));
        assert!(!diffs[0].contains(Token(5)));
        assert!(!diffs[0].contains(Token(88)));
    }

    #[test]
    fn repair_session_completes_when_all_participants_report() {
        use std::collections::HashSet as Set;
        let mut participants = Set::new();
        participants.insert(NodeID(1));
        participants.insert(NodeID(2));
        let session = RepairSession::new("ks", "cf", participants);
        session.start();
        session.block_until_running();
        assert_eq!(session.state(), RepairSessionState::WaitingForResponses);

        session.completed_request(NodeID(1));
        assert!(session.is_alive());
        session.completed_request(NodeID(2));
        assert_eq!(session.state(), RepairSessionState::Completed);
    }

    #[test]
    fn repair_session_fails_on_conviction() {
        let mut participants = HashSet::new();
        participants.insert(NodeID(1));
        let session = RepairSession::new("ks", "cf", participants);
        session.start();
        session.convict(NodeID(1));
        assert_eq!(session.state(), RepairSessionState::Failed);
        assert!(!session.is_alive());
    }

    #[test]
    fn natural_repair_throttle_allows_one_per_window() {
        let throttle = NaturalRepairThrottle::new();
        assert_eq!(
            throttle.get_validator("ks", "cf", None, false),
            ValidatorKind::NoOp
        );
        assert_eq!(
            throttle.get_validator("ks", "cf", None, true),
            ValidatorKind::Real
        );
        assert_eq!(
            throttle.get_validator("ks", "cf", None, true),
            ValidatorKind::NoOp
        );
        // An explicit initiator always gets a real validator.
        assert_eq!(
            throttle.get_validator("ks", "cf", Some(NodeID(1)), true),
            ValidatorKind::Real
        );
        throttle.reset_window();
        assert_eq!(
            throttle.get_validator("ks", "cf", None, true),
            ValidatorKind::Real
        );
    }
}
