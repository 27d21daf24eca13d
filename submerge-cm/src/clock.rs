// Clocks are a tagged union, in the same spirit as submerge_lang::Vals:
// each variant carries its own comparator and its own merge. Dispatch is
// always a match on the tag, never a trait object -- the set of clock
// kinds is closed and small.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Relationship {
    Less,
    Equal,
    Greater,
    Disjoint,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ClockKind {
    Timestamp,
    VersionVector,
}

// VersionVector context: (node-id, count) pairs, sorted by node-id, every
// count strictly positive. Node ids are 4 bytes and counts 8 bytes on the
// wire (see submerge-cm::wire), but in memory we just keep u32/u64 pairs.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Clock {
    Timestamp(i64),
    VersionVector(Vec<(u32, u64)>),
}

impl Clock {
    pub fn kind(&self) -> ClockKind {
        match self {
            Clock::Timestamp(_) => ClockKind::Timestamp,
            Clock::VersionVector(_) => ClockKind::VersionVector,
        }
    }

    pub fn timestamp(ts: i64) -> Self {
        Clock::Timestamp(ts)
    }

    // Builds a version-vector clock, sorting by node id and dropping
    // zero-count entries (the invariant is that every stored count is
    // strictly positive).
    pub fn version_vector(mut context: Vec<(u32, u64)>) -> Self {
        context.retain(|&(_, c)| c > 0);
        context.sort_by_key(|&(node, _)| node);
        Clock::VersionVector(context)
    }

    pub fn compare(&self, other: &Clock) -> Relationship {
        match (self, other) {
            (Clock::Timestamp(a), Clock::Timestamp(b)) => {
                if a < b {
                    Relationship::Less
                } else if a > b {
                    Relationship::Greater
                } else {
                    Relationship::Equal
                }
            }
            (Clock::VersionVector(a), Clock::VersionVector(b)) => compare_vv(a, b),
            // Mixed-kind comparisons cannot arise in practice: a
            // ColumnFamilySchema selects exactly one clock kind and every
            // column in that CF carries clocks of that kind. We still need
            // a total answer for defensive code paths; treat cross-kind
            // values as disjoint, matching the "undefined, don't guess"
            // stance the distilled spec takes for similarly degenerate
            // inputs (see DESIGN.md).
            _ => Relationship::Disjoint,
        }
    }

    // Least-upper-bound across a non-empty list of clocks of the same
    // kind. For timestamps this is the max; for version vectors it is the
    // per-node-id maximum count.
    pub fn get_superset(clocks: &[Clock]) -> Option<Clock> {
        let first = clocks.first()?;
        match first.kind() {
            ClockKind::Timestamp => {
                let max = clocks
                    .iter()
                    .map(|c| match c {
                        Clock::Timestamp(ts) => *ts,
                        _ => panic!("mixed clock kinds passed to get_superset"),
                    })
                    .max()
                    .unwrap();
                Some(Clock::Timestamp(max))
            }
            ClockKind::VersionVector => {
                let mut merged: Vec<(u32, u64)> = Vec::new();
                for c in clocks {
                    match c {
                        Clock::VersionVector(ctx) => merged = merge_vv(&merged, ctx),
                        _ => panic!("mixed clock kinds passed to get_superset"),
                    }
                }
                Some(Clock::VersionVector(merged))
            }
        }
    }

    pub fn merge(&self, other: &Clock) -> Clock {
        match (self, other) {
            (Clock::Timestamp(a), Clock::Timestamp(b)) => Clock::Timestamp((*a).max(*b)),
            (Clock::VersionVector(a), Clock::VersionVector(b)) => {
                Clock::VersionVector(merge_vv(a, b))
            }
            _ => panic!("mixed clock kinds passed to merge"),
        }
    }
}

fn merge_vv(a: &[(u32, u64)], b: &[(u32, u64)]) -> Vec<(u32, u64)> {
    let mut out: Vec<(u32, u64)> = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push((a[i].0, a[i].1.max(b[j].1)));
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn compare_vv(a: &[(u32, u64)], b: &[(u32, u64)]) -> Relationship {
    let mut a_has_more = false;
    let mut b_has_more = false;
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let (node_a, node_b) = (a.get(i).map(|p| p.0), b.get(j).map(|p| p.0));
        match (node_a, node_b) {
            (Some(na), Some(nb)) if na == nb => {
                let (ca, cb) = (a[i].1, b[j].1);
                if ca > cb {
                    a_has_more = true;
                } else if cb > ca {
                    b_has_more = true;
                }
                i += 1;
                j += 1;
            }
            (Some(na), Some(nb)) if na < nb => {
                // a has a component b lacks (implicit zero)
                a_has_more = true;
                i += 1;
            }
            (Some(_), Some(_)) => {
                b_has_more = true;
                j += 1;
            }
            (Some(_), None) => {
                a_has_more = true;
                i += 1;
            }
            (None, Some(_)) => {
                b_has_more = true;
                j += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    match (a_has_more, b_has_more) {
        (false, false) => Relationship::Equal,
        (true, false) => Relationship::Greater,
        (false, true) => Relationship::Less,
        (true, true) => Relationship::Disjoint,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn timestamp_compare_is_natural_order() {
        let a = Clock::timestamp(5);
        let b = Clock::timestamp(9);
        assert_eq!(a.compare(&b), Relationship::Less);
        assert_eq!(b.compare(&a), Relationship::Greater);
        assert_eq!(a.compare(&a), Relationship::Equal);
    }

    #[test]
    fn compare_is_antisymmetric_and_reflexive() {
        let cases = [
            (Clock::version_vector(vec![(1, 2)]), Clock::version_vector(vec![(1, 3)])),
            (
                Clock::version_vector(vec![(1, 2), (2, 1)]),
                Clock::version_vector(vec![(1, 1), (2, 2)]),
            ),
        ];
        for (a, b) in cases {
            let ab = a.compare(&b);
            let ba = b.compare(&a);
            match ab {
                Relationship::Less => assert_eq!(ba, Relationship::Greater),
                Relationship::Greater => assert_eq!(ba, Relationship::Less),
                Relationship::Equal => assert_eq!(ba, Relationship::Equal),
                Relationship::Disjoint => assert_eq!(ba, Relationship::Disjoint),
            }
        }
    }

    #[test]
    fn version_vector_disjoint_example_from_spec() {
        // left: node3:5, node6:2, node9:2
        // right: node3:4, node6:3, node9:2, node12:2
        let left = Clock::version_vector(vec![(3, 5), (6, 2), (9, 2)]);
        let right = Clock::version_vector(vec![(3, 4), (6, 3), (9, 2), (12, 2)]);
        assert_eq!(left.compare(&right), Relationship::Disjoint);
        let merged = left.merge(&right);
        match merged {
            Clock::VersionVector(v) => {
                assert_eq!(v, vec![(3, 5), (6, 3), (9, 2), (12, 2)]);
            }
            _ => panic!("expected version vector"),
        }
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let a = Clock::version_vector(vec![(1, 3), (2, 1)]);
        let b = Clock::version_vector(vec![(1, 1), (3, 4)]);
        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab, ba);
        let ab_ab = ab.merge(&ab);
        assert_eq!(ab_ab, ab);
        let merge_a_ab = a.merge(&ab);
        assert_eq!(merge_a_ab, ab);
    }

    #[test]
    fn superset_of_timestamps_is_max() {
        let clocks = vec![Clock::timestamp(3), Clock::timestamp(9), Clock::timestamp(1)];
        let sup = Clock::get_superset(&clocks).unwrap();
        assert_eq!(sup, Clock::timestamp(9));
    }
}
