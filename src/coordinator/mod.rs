//! Distributed coordination: single-writer leader election among
//! coordinator replicas and the fenced lease table binding tasks to
//! workers.

pub mod election;
pub mod lease;

pub use election::{ElectionLock, ElectionMember, ReplicaRole};
pub use lease::{LeaseGrant, LeaseId, LeaseTable, ReleasedLease};
