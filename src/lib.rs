//! basalt: an embedded log-structured merge-tree storage engine.
//!
//! The engine provides ordered key iteration, snapshot-isolated reads,
//! atomic batch commits, and crash recovery on a single node. Its core
//! is the read/write concurrency plane:
//!
//! - a **commit pipeline** that linearizes batches, groups WAL writes
//!   behind an elected leader, applies to memtables in parallel, and
//!   publishes visibility contiguously;
//! - an atomically swappable **read state** {memtable queue, version}
//!   that readers capture without locks;
//! - a **merged iterator** presenting one ordered view over batches,
//!   memtables, and tables across levels, honoring sequence-number
//!   visibility and tombstones;
//! - a shared **file cache** of open table readers and a sharded
//!   **block cache** with Clock-PRO eviction over refcounted,
//!   manually-managed block buffers.
//!
//! ```no_run
//! use basalt::{Engine, Options};
//!
//! fn main() -> basalt::Result<()> {
//!     let db = Engine::open(Options::new("./data"))?;
//!     db.set(b"user:100", b"alice")?;
//!     assert_eq!(db.get(b"user:100")?.as_deref(), Some(&b"alice"[..]));
//!
//!     let snapshot = db.new_snapshot()?;
//!     db.delete(b"user:100")?;
//!     assert_eq!(snapshot.get(b"user:100")?.as_deref(), Some(&b"alice"[..]));
//!     assert_eq!(db.get(b"user:100")?, None);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod cache;
pub mod commit;
pub mod comparator;
pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod flush;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod metrics;
pub mod rangedel;
pub mod rangekey;
pub mod readstate;
pub mod recovery;
pub mod snapshot;
pub mod sstable;
pub mod tmpfs;
pub mod version;
pub mod wal;

pub use batch::Batch;
pub use cache::Cache;
pub use comparator::{BytewiseComparator, Comparator, ConcatMergeOperator, MergeOperator};
pub use config::{Options, SyncMode};
pub use db::Engine;
pub use error::{Error, Result};
pub use iterator::user::{Iter, IterOptions, IterValidity};
pub use metrics::MetricsSnapshot;
pub use snapshot::Snapshot;
