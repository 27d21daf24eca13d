// Compaction merge: a k-way collating iterator over sorted row sources,
// grouped into a reducing iterator that invokes the column family's
// reconciler per key. The split between precompacted and lazily
// compacted rows is an execution-strategy choice (load-all-columns vs.
// stream-by-name) over the same reduction semantics; both paths share
// `reduce_columns` below.

use crate::column::{Column, ComparatorKind};
use crate::key::DecoratedKey;
use crate::reconcile::Reconciler;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

// A single sorted source of (key, row) pairs, e.g. one SSTable scanner.
// Grounded on submerge-coldb::ioutil's capability-split reader traits:
// a row source only needs to produce rows, never to seek or write.
pub trait RowSource {
    fn next_row(&mut self) -> submerge_base::Result<Option<(DecoratedKey, Vec<Column>)>>;
}

struct HeapEntry {
    key: DecoratedKey,
    source: usize,
    row: Vec<Column>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so BinaryHeap (a max-heap) pops the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| other.source.cmp(&self.source))
    }
}

pub struct CollatingIterator {
    sources: Vec<Box<dyn Iterator<Item = (DecoratedKey, Vec<Column>)>>>,
    heap: BinaryHeap<HeapEntry>,
}

impl CollatingIterator {
    pub fn new(sources: Vec<Box<dyn Iterator<Item = (DecoratedKey, Vec<Column>)>>>) -> Self {
        let mut heap = BinaryHeap::new();
        let mut sources = sources;
        for (idx, source) in sources.iter_mut().enumerate() {
            if let Some((key, row)) = source.next() {
                heap.push(HeapEntry { key, source: idx, row });
            }
        }
        CollatingIterator { sources, heap }
    }
}

impl Iterator for CollatingIterator {
    type Item = (DecoratedKey, Vec<Column>);

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        if let Some((key, row)) = self.sources[top.source].next() {
            self.heap.push(HeapEntry { key, source: top.source, row });
        }
        Some((top.key, top.row))
    }
}

pub struct PrecompactedRow {
    pub key: DecoratedKey,
    pub columns: Vec<Column>,
}

pub struct LazilyCompactedRow {
    pub key: DecoratedKey,
    pub columns: Vec<Column>,
}

pub enum CompactedRow {
    Precompacted(PrecompactedRow),
    Lazy(LazilyCompactedRow),
}

impl CompactedRow {
    pub fn key(&self) -> &DecoratedKey {
        match self {
            CompactedRow::Precompacted(r) => &r.key,
            CompactedRow::Lazy(r) => &r.key,
        }
    }

    pub fn columns(&self) -> &[Column] {
        match self {
            CompactedRow::Precompacted(r) => &r.columns,
            CompactedRow::Lazy(r) => &r.columns,
        }
    }
}

fn column_size(c: &Column) -> usize {
    c.name.len() + c.value.len()
}

// Shared reduction semantics for both the precompacted and lazily
// compacted paths (§4.7): expire, reconcile same-named columns pairwise,
// then drop any tombstone whose localDeleteTime has passed gcBefore on a
// major compaction.
fn reduce_columns(
    groups: Vec<Vec<Column>>,
    reconciler: &dyn Reconciler,
    comparator: ComparatorKind,
    gc_before: u32,
    major: bool,
    now_secs: i64,
) -> Vec<Column> {
    let mut by_name: Vec<Column> = Vec::new();

    for group in groups {
        for column in group {
            let column = if column.is_live_expired(now_secs) {
                column.expire(now_secs.max(0) as u32)
            } else {
                column
            };
            match by_name.iter().position(|c| comparator.compare(&c.name, &column.name) == Ordering::Equal) {
                Some(idx) => {
                    let reconciled = reconciler.reconcile(&by_name[idx], &column);
                    by_name[idx] = reconciled;
                }
                None => by_name.push(column),
            }
        }
    }

    by_name.retain(|c| {
        !(c.tombstone
            && major
            && c.local_delete_time().map(|ldt| ldt <= gc_before).unwrap_or(false))
    });

    by_name.sort_by(|a, b| comparator.compare(&a.name, &b.name));
    by_name
}

pub struct CompactionConfig {
    pub comparator: ComparatorKind,
    pub gc_before: u32,
    pub major: bool,
    pub now_secs: i64,
    pub in_memory_compaction_limit: usize,
}

pub fn get_reduced(
    key: DecoratedKey,
    groups: Vec<Vec<Column>>,
    reconciler: &dyn Reconciler,
    config: &CompactionConfig,
) -> CompactedRow {
    let total_size: usize = groups.iter().flatten().map(column_size).sum();
    let columns = reduce_columns(
        groups,
        reconciler,
        config.comparator,
        config.gc_before,
        config.major,
        config.now_secs,
    );
    if total_size <= config.in_memory_compaction_limit {
        CompactedRow::Precompacted(PrecompactedRow { key, columns })
    } else {
        CompactedRow::Lazy(LazilyCompactedRow { key, columns })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionProgress {
    pub total_bytes: u64,
    pub bytes_read: u64,
}

impl CompactionProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_read as f64 / self.total_bytes as f64).min(1.0)
        }
    }
}

pub struct ReducingIterator {
    inner: std::iter::Peekable<CollatingIterator>,
    reconciler: &'static dyn Reconciler,
    config: CompactionConfig,
    progress: CompactionProgress,
}

impl ReducingIterator {
    pub fn new(inner: CollatingIterator, reconciler: &'static dyn Reconciler, config: CompactionConfig, total_bytes: u64) -> Self {
        ReducingIterator {
            inner: inner.peekable(),
            reconciler,
            config,
            progress: CompactionProgress { total_bytes, bytes_read: 0 },
        }
    }

    pub fn progress(&self) -> CompactionProgress {
        self.progress
    }
}

impl Iterator for ReducingIterator {
    type Item = CompactedRow;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, first_row) = self.inner.next()?;
            self.progress.bytes_read += first_row.iter().map(|c| column_size(c) as u64).sum::<u64>();
            let mut groups = vec![first_row];
            while let Some((peek_key, _)) = self.inner.peek() {
                if *peek_key == key {
                    let (_, row) = self.inner.next().unwrap();
                    self.progress.bytes_read += row.iter().map(|c| column_size(c) as u64).sum::<u64>();
                    groups.push(row);
                } else {
                    break;
                }
            }
            let reduced = get_reduced(key, groups, self.reconciler, &self.config);
            // A row whose every column was GC'd away is dropped rather
            // than emitted empty (§4.7 edge cases).
            if reduced.columns().is_empty() {
                continue;
            }
            return Some(reduced);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;
    use crate::clock::Clock;
    use crate::key::Token;
    use crate::reconcile::reconciler_for;
    use crate::column::ReconcilerKind;

    fn key(t: i64) -> DecoratedKey {
        DecoratedKey::new(Token(t), vec![].into_boxed_slice())
    }

    fn source(rows: Vec<(DecoratedKey, Vec<Column>)>) -> Box<dyn Iterator<Item = (DecoratedKey, Vec<Column>)>> {
        Box::new(rows.into_iter())
    }

    #[test]
    fn collating_iterator_merges_in_key_order() {
        let a = source(vec![(key(1), vec![]), (key(3), vec![])]);
        let b = source(vec![(key(2), vec![]), (key(4), vec![])]);
        let merged: Vec<i64> = CollatingIterator::new(vec![a, b]).map(|(k, _)| k.token.0).collect();
        assert_eq!(merged, vec![1, 2, 3, 4]);
    }

    #[test]
    fn reducing_iterator_groups_same_key_rows() {
        let a = source(vec![(key(1), vec![Column::live(b"a".to_vec(), b"1".to_vec(), Clock::timestamp(10))])]);
        let b = source(vec![(key(1), vec![Column::live(b"b".to_vec(), b"2".to_vec(), Clock::timestamp(10))])]);
        let collating = CollatingIterator::new(vec![a, b]);
        let reconciler = reconciler_for(ReconcilerKind::TimestampLastWriteWins);
        let config = CompactionConfig {
            comparator: ComparatorKind::Bytes,
            gc_before: 0,
            major: false,
            now_secs: 100,
            in_memory_compaction_limit: 1 << 20,
        };
        let rows: Vec<CompactedRow> = ReducingIterator::new(collating, reconciler, config, 0).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns().len(), 2);
    }

    // §4.7 edge case: a group whose only column is GC'd away must not
    // surface as an empty row in the output stream.
    #[test]
    fn reducing_iterator_drops_fully_gcd_rows() {
        let tombstone = Column::tombstone(b"a".to_vec(), 10, Clock::timestamp(5));
        let a = source(vec![(key(1), vec![tombstone]), (key(2), vec![Column::live(b"a".to_vec(), b"v".to_vec(), Clock::timestamp(5))])]);
        let collating = CollatingIterator::new(vec![a]);
        let reconciler = reconciler_for(ReconcilerKind::TimestampLastWriteWins);
        let config = CompactionConfig {
            comparator: ComparatorKind::Bytes,
            gc_before: 1000,
            major: true,
            now_secs: 1000,
            in_memory_compaction_limit: 1 << 20,
        };
        let rows: Vec<CompactedRow> = ReducingIterator::new(collating, reconciler, config, 0).collect();
        // Only key(2)'s row survives; key(1)'s tombstone-only row is dropped.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key().token, Token(2));
    }

    // §8 scenario 6, corrected per DESIGN.md's note on the scenario's
    // inconsistent numbers: live column ts=10 + tombstone
    // ts=20/localDeleteTime=100 for the same name. With gcBefore=150 (past
    // the tombstone's localDeleteTime), major=true drops the column
    // entirely; major=false retains the tombstone regardless of gcBefore.
    #[test]
    fn major_compaction_purges_old_tombstone() {
        let live = Column::live(b"a".to_vec(), vec![0x01], Clock::timestamp(10));
        let tombstone = Column::tombstone(b"a".to_vec(), 100, Clock::timestamp(20));
        let reconciler = reconciler_for(ReconcilerKind::TimestampLastWriteWins);

        let config_major = CompactionConfig {
            comparator: ComparatorKind::Bytes,
            gc_before: 150,
            major: true,
            now_secs: 1000,
            in_memory_compaction_limit: 1 << 20,
        };
        let row = get_reduced(key(1), vec![vec![live.clone()], vec![tombstone.clone()]], reconciler, &config_major);
        assert!(row.columns().is_empty());

        let config_minor = CompactionConfig {
            major: false,
            ..config_major
        };
        let row2 = get_reduced(key(1), vec![vec![live], vec![tombstone]], reconciler, &config_minor);
        assert_eq!(row2.columns().len(), 1);
        assert!(row2.columns()[0].tombstone);
    }

    // Same input as above but with gcBefore=50 (below the tombstone's
    // localDeleteTime=100): even a major compaction must retain the
    // tombstone, since it isn't old enough to collect yet.
    #[test]
    fn major_compaction_retains_tombstone_not_yet_past_gc_before() {
        let live = Column::live(b"a".to_vec(), vec![0x01], Clock::timestamp(10));
        let tombstone = Column::tombstone(b"a".to_vec(), 100, Clock::timestamp(20));
        let reconciler = reconciler_for(ReconcilerKind::TimestampLastWriteWins);

        let config_major = CompactionConfig {
            comparator: ComparatorKind::Bytes,
            gc_before: 50,
            major: true,
            now_secs: 1000,
            in_memory_compaction_limit: 1 << 20,
        };
        let row = get_reduced(key(1), vec![vec![live], vec![tombstone]], reconciler, &config_major);
        assert_eq!(row.columns().len(), 1);
        assert!(row.columns()[0].tombstone);
    }

    #[test]
    fn large_group_takes_lazy_path() {
        let reconciler = reconciler_for(ReconcilerKind::TimestampLastWriteWins);
        let big_value = vec![0u8; 64];
        let config = CompactionConfig {
            comparator: ComparatorKind::Bytes,
            gc_before: 0,
            major: false,
            now_secs: 0,
            in_memory_compaction_limit: 8,
        };
        let row = get_reduced(
            key(1),
            vec![vec![Column::live(b"a".to_vec(), big_value, Clock::timestamp(1))]],
            reconciler,
            &config,
        );
        assert!(matches!(row, CompactedRow::Lazy(_)));
    }
}
