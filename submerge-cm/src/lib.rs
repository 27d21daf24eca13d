#![allow(dead_code)]

// Cluster membership: gossip, failure detection, ring, repair, compaction
// merge.
//
// The modules here are the parts of a replica that have to agree with its
// peers about two different things:
//
//  - who is in the cluster, and alive, right now (gossip + phi accrual
//    failure detector, disseminated peer-to-peer rather than through a
//    coordinator);
//  - what each replica's copy of a column family should converge to, both
//    at compaction time (merging sorted runs on one node) and at repair
//    time (finding where two replicas disagree via Merkle tree).
//
// Everything downstream of a `Clock` comparison is deterministic and
// replica-agnostic: two nodes reconciling the same pair of columns always
// reach the same answer, which is what lets compaction and repair run
// independently on each replica without coordination.

pub mod clock;
pub mod column;
pub mod compact;
pub mod config;
pub mod fd;
pub mod gossip;
pub mod key;
pub mod merkle;
pub mod reconcile;
pub mod ring;
pub mod strategy;
pub mod wire;

pub use clock::{Clock, ClockKind, Relationship};
pub use column::{Column, ColumnFamilyId, ColumnFamilySchema, ColumnFamilyType, ComparatorKind, ReconcilerKind, SuperColumn};
pub use key::{DecoratedKey, Range, Token};
pub use reconcile::{reconcile_super_column, reconciler_for, Reconciler};
pub use ring::TokenMetadata;
