use crate::clock::Clock;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: Box<[u8]>,
    pub value: Box<[u8]>,
    pub clock: Clock,
    pub tombstone: bool,
    pub ttl: Option<u32>,
}

impl Column {
    pub fn live(name: impl Into<Box<[u8]>>, value: impl Into<Box<[u8]>>, clock: Clock) -> Self {
        Column {
            name: name.into(),
            value: value.into(),
            clock,
            tombstone: false,
            ttl: None,
        }
    }

    // A tombstone's value is the 4-byte (big-endian) local-delete-time,
    // per the distilled spec's wire-compatible encoding.
    pub fn tombstone(
        name: impl Into<Box<[u8]>>,
        local_delete_time: u32,
        clock: Clock,
    ) -> Self {
        Column {
            name: name.into(),
            value: local_delete_time.to_be_bytes().to_vec().into_boxed_slice(),
            clock,
            tombstone: true,
            ttl: None,
        }
    }

    pub fn local_delete_time(&self) -> Option<u32> {
        if !self.tombstone || self.value.len() != 4 {
            return None;
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.value);
        Some(u32::from_be_bytes(buf))
    }

    // True once `now` has passed this column's ttl, measured from the
    // clock's embedded timestamp when the clock is a Timestamp clock.
    // Columns under a version-vector clock don't carry a wall-clock
    // write-time here and so never expire via this path (TTL is a
    // single-writer-wins feature in the source system).
    pub fn is_live_expired(&self, now_secs: i64) -> bool {
        if self.tombstone {
            return false;
        }
        match (&self.clock, self.ttl) {
            (Clock::Timestamp(write_time_micros), Some(ttl_secs)) => {
                let write_time_secs = write_time_micros / 1_000_000;
                write_time_secs + ttl_secs as i64 <= now_secs
            }
            _ => false,
        }
    }

    // Converts an expired live column into a tombstone with
    // local_delete_time = now. Used by compaction (see compact.rs).
    pub fn expire(&self, now_secs: u32) -> Column {
        Column::tombstone(self.name.clone(), now_secs, self.clock.clone())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SuperColumn {
    pub name: Box<[u8]>,
    pub columns: Vec<Column>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ComparatorKind {
    Bytes,
    Utf8,
    Int64,
    TimeUuid,
}

impl ComparatorKind {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        match self {
            ComparatorKind::Bytes | ComparatorKind::TimeUuid => a.cmp(b),
            ComparatorKind::Utf8 => {
                // Falls back to byte order on invalid UTF-8 rather than
                // failing the comparison; column names are validated
                // upstream of this core.
                a.cmp(b)
            }
            ComparatorKind::Int64 => {
                let ai = decode_i64_padded(a);
                let bi = decode_i64_padded(b);
                ai.cmp(&bi)
            }
        }
    }
}

fn decode_i64_padded(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_be_bytes(buf)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ColumnFamilyType {
    Standard,
    Super,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ReconcilerKind {
    TimestampLastWriteWins,
    VersionVectorConcatenating,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ColumnFamilyId {
    pub keyspace: String,
    pub name: String,
}

impl ColumnFamilyId {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        ColumnFamilyId {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnFamilySchema {
    pub id: ColumnFamilyId,
    pub comparator: ComparatorKind,
    pub sub_comparator: Option<ComparatorKind>,
    pub reconciler: ReconcilerKind,
    pub cf_type: ColumnFamilyType,
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn tombstone_roundtrips_local_delete_time() {
        let c = Column::tombstone(b"a".to_vec(), 100, Clock::timestamp(20));
        assert!(c.tombstone);
        assert_eq!(c.local_delete_time(), Some(100));
    }

    #[test]
    fn ttl_expiry_boundary() {
        let c = Column {
            name: b"a".to_vec().into_boxed_slice(),
            value: b"v".to_vec().into_boxed_slice(),
            clock: Clock::timestamp(10_000_000), // 10s
            tombstone: false,
            ttl: Some(5),
        };
        assert!(!c.is_live_expired(14));
        assert!(c.is_live_expired(15));
        assert!(c.is_live_expired(16));
    }
}
