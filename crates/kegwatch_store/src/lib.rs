//! Station-local persistence.
//!
//! One SQLite file per station holds the pallet records and the outbound
//! sync queue. Pallet rows are written only through [`Store::save_record`]
//! (monotonic per-pallet version, atomic read-modify-write); queue rows
//! move through claim/ack/retry/fail with the same `UPDATE ... WHERE`
//! claim discipline a multi-worker queue would need, so a crashed process
//! can never lose or double-ack a task.

pub mod recovery;
mod store;

pub use recovery::{recover, RecoveryReport};
pub use store::{now_millis, QueueStats, Store, StoreError, SyncTask};
