use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Bound;

// A Token is an opaque point in the circular key space produced by the
// partitioner. We don't implement a partitioner here (hashing raw keys into
// tokens is a collaborator concern); Token is just the totally-ordered value
// everything downstream operates over.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

// A DecoratedKey orders first by token, then by the raw key bytes, so that
// two different keys hashing to the same token still have a well-defined
// order (and compaction merges never have to special-case a token
// collision).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Box<[u8]>,
}

impl DecoratedKey {
    pub fn new(token: Token, key: impl Into<Box<[u8]>>) -> Self {
        DecoratedKey {
            token,
            key: key.into(),
        }
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// A Range is a half-open interval (left, right] on the ring, consistent
// with the "primary range" definition in the token-ring algorithms: the
// left endpoint is excluded, the right is included. `wraps` is true when
// right <= left, meaning the range passes through the origin of the ring.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Range {
    pub left: Token,
    pub right: Token,
}

impl Range {
    pub fn new(left: Token, right: Token) -> Self {
        Range { left, right }
    }

    pub fn wraps(&self) -> bool {
        self.right <= self.left
    }

    pub fn contains(&self, t: Token) -> bool {
        if self.wraps() {
            t > self.left || t <= self.right
        } else {
            t > self.left && t <= self.right
        }
    }

    // The Bound pair a BTreeMap range-query would need to enumerate every
    // owned token in a non-wrapping range. Callers handling a wrapping
    // range must query twice (left, MAX] and (MIN, right].
    pub fn as_bounds(&self) -> (Bound<Token>, Bound<Token>) {
        (Bound::Excluded(self.left), Bound::Included(self.right))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn decorated_key_orders_by_token_then_bytes() {
        let a = DecoratedKey::new(Token(1), b"a".to_vec());
        let b = DecoratedKey::new(Token(1), b"b".to_vec());
        let c = DecoratedKey::new(Token(2), b"a".to_vec());
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn range_contains_non_wrapping() {
        let r = Range::new(Token(10), Token(20));
        assert!(!r.contains(Token(10)));
        assert!(r.contains(Token(11)));
        assert!(r.contains(Token(20)));
        assert!(!r.contains(Token(21)));
    }

    #[test]
    fn range_contains_wrapping() {
        let r = Range::new(Token(30), Token(10));
        assert!(r.wraps());
        assert!(r.contains(Token(31)));
        assert!(r.contains(Token(5)));
        assert!(!r.contains(Token(20)));
    }
}
