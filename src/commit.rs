//! The commit pipeline.
//!
//! Concurrent batch submissions are linearized into a strict sequence
//! order while the two expensive stages are pipelined:
//!
//! 1. **Enqueue**: under the pipeline mutex, reserve one sequence number
//!    per operation. Reservation order is commit order. Writes stall
//!    here while the immutable memtable backlog is over budget.
//! 2. **WAL leadership**: the first waiter to find no leader drains the
//!    queued batches as one group, binds the group to the current WAL
//!    and mutable memtable (rotating first if the group would overflow
//!    it), appends, and syncs once per the durability policy.
//! 3. **Apply**: each batch's committer inserts its operations into the
//!    bound memtable at the reserved sequence numbers. Applies run in
//!    parallel across batches; skip-list insertion is concurrency-safe
//!    and the reserved ranges are disjoint.
//! 4. **Publish**: the visible sequence number advances contiguously; a
//!    batch becomes visible only once every earlier batch has applied.
//!    Commit returns when its own batch is visible, so a read started
//!    after `commit` returns observes the write.
//!
//! A WAL append failure is fatal: the reserved sequence numbers are
//! surrendered (the counter never rewinds), every in-flight batch
//! returns the error, and the pipeline rejects writes until restart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::batch::Batch;
use crate::config::SyncMode;
use crate::error::{Error, Result};
use crate::key::{SeqNum, ValueKind, SEQ_BATCH_BIT};
use crate::memtable::{Memtable, WriterRef};
use crate::wal::Wal;

/// The engine-side half of the pipeline: memtable rotation and stall
/// policy live with the engine, sequencing lives here.
pub trait CommitEnv: Send + Sync {
    /// Called under WAL leadership before a group is appended. Ensures
    /// the mutable memtable can absorb `bytes` more (rotating if not)
    /// and returns the WAL and memtable the group binds to.
    fn prepare(&self, bytes: usize) -> Result<CommitTarget>;

    /// True while new writes must stall at enqueue.
    fn should_stall(&self) -> bool;
}

/// The WAL segment and memtable one commit group is bound to.
#[derive(Clone)]
pub struct CommitTarget {
    pub wal: Arc<Wal>,
    pub mem: Arc<Memtable>,
    pub writer_ref: WriterRef,
}

struct CommitEntry {
    last_seq: SeqNum,
    logged: AtomicBool,
    applied: AtomicBool,
    failed: AtomicBool,
    binding: Mutex<Option<CommitTarget>>,
}

struct PendingLog {
    payload: Arc<Vec<u8>>,
    entry: Arc<CommitEntry>,
}

struct PipelineState {
    next_seq: SeqNum,
    /// Publish queue in reservation order.
    pending: VecDeque<Arc<CommitEntry>>,
    /// Batches awaiting a WAL group leader.
    wal_queue: VecDeque<PendingLog>,
    leader_active: bool,
    fatal: Option<Error>,
    closed: bool,
}

pub struct CommitPipeline {
    sync_mode: SyncMode,
    state: Mutex<PipelineState>,
    /// Signaled when a group leader finishes logging.
    logged_cv: Condvar,
    /// Signaled when the visible sequence number advances or on failure.
    visible_cv: Condvar,
    /// Signaled when the flush backlog drains.
    stall_cv: Condvar,
    visible: Arc<AtomicU64>,
}

impl CommitPipeline {
    pub fn new(sync_mode: SyncMode, last_seq: SeqNum) -> Self {
        Self {
            sync_mode,
            state: Mutex::new(PipelineState {
                next_seq: last_seq + 1,
                pending: VecDeque::new(),
                wal_queue: VecDeque::new(),
                leader_active: false,
                fatal: None,
                closed: false,
            }),
            logged_cv: Condvar::new(),
            visible_cv: Condvar::new(),
            stall_cv: Condvar::new(),
            visible: Arc::new(AtomicU64::new(last_seq)),
        }
    }

    /// The highest published sequence number.
    pub fn visible_seq(&self) -> SeqNum {
        self.visible.load(Ordering::Acquire)
    }

    pub fn visible_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.visible)
    }

    /// Wakes writes stalled on the flush backlog. Taking the pipeline
    /// lock first serializes with a waiter that has checked the backlog
    /// but not yet parked, closing the lost-wakeup window.
    pub fn release_stall(&self) {
        let _guard = self.state.lock();
        self.stall_cv.notify_all();
    }

    /// Latches a fatal error; all waiters wake and fail.
    pub fn set_fatal(&self, err: Error) {
        if let Ok(mut st) = self.state.lock() {
            if st.fatal.is_none() {
                tracing::error!(error = %err, "commit pipeline entering fatal state");
                st.fatal = Some(err);
            }
            for log in st.wal_queue.drain(..) {
                log.entry.failed.store(true, Ordering::Release);
                log.entry.logged.store(true, Ordering::Release);
            }
        }
        self.logged_cv.notify_all();
        self.visible_cv.notify_all();
        self.stall_cv.notify_all();
    }

    /// Stops accepting new commits; in-flight commits drain normally.
    pub fn close(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.closed = true;
        }
        self.stall_cv.notify_all();
    }

    /// Commits one batch through the four stages, returning its base
    /// sequence number once the batch is visible.
    pub fn commit(&self, env: &dyn CommitEnv, mut batch: Batch) -> Result<SeqNum> {
        let count = batch.count() as u64;
        if count == 0 {
            return Ok(self.visible_seq());
        }

        // Stage 1: enqueue and reserve.
        let (base, payload, entry) = {
            let mut st = self.state.lock()?;
            loop {
                if let Some(err) = &st.fatal {
                    return Err(err.clone());
                }
                if st.closed {
                    return Err(Error::Closed);
                }
                if env.should_stall() {
                    st = self.stall_cv.wait(st)?;
                    continue;
                }
                break;
            }
            if st.next_seq + count >= SEQ_BATCH_BIT {
                let err = Error::Invariant("sequence number space exhausted".to_string());
                st.fatal = Some(err.clone());
                return Err(err);
            }
            let base = st.next_seq;
            st.next_seq += count;
            batch.finalize(base);
            let payload = Arc::new(batch.into_payload());
            let entry = Arc::new(CommitEntry {
                last_seq: base + count - 1,
                logged: AtomicBool::new(false),
                applied: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                binding: Mutex::new(None),
            });
            st.pending.push_back(Arc::clone(&entry));
            st.wal_queue.push_back(PendingLog {
                payload: Arc::clone(&payload),
                entry: Arc::clone(&entry),
            });
            (base, payload, entry)
        };

        // Stage 2: group leadership or waiting on a leader.
        self.wait_logged(env, &entry)?;
        if entry.failed.load(Ordering::Acquire) {
            return Err(self.fatal_error());
        }

        // Stage 3: apply into the bound memtable. Parallel across batches.
        let target = entry
            .binding
            .lock()?
            .take()
            .ok_or_else(|| Error::Invariant("logged batch missing its binding".to_string()))?;
        let apply_result = apply_payload(&target.mem, base, &payload);
        drop(target);
        if let Err(err) = apply_result {
            self.set_fatal(err.clone());
            return Err(err);
        }

        // Stage 4: publish contiguously and wait for visibility.
        {
            let mut st = self.state.lock()?;
            entry.applied.store(true, Ordering::Release);
            while let Some(front) = st.pending.front() {
                if front.failed.load(Ordering::Acquire) || !front.applied.load(Ordering::Acquire)
                {
                    break;
                }
                let seq = front.last_seq;
                st.pending.pop_front();
                self.visible.store(seq, Ordering::Release);
            }
        }
        self.visible_cv.notify_all();

        let mut st = self.state.lock()?;
        while self.visible.load(Ordering::Acquire) < entry.last_seq {
            if let Some(err) = &st.fatal {
                return Err(err.clone());
            }
            st = self.visible_cv.wait(st)?;
        }
        Ok(base)
    }

    /// Waits until `entry` is logged; takes over WAL leadership whenever
    /// none is active and work is queued.
    fn wait_logged(&self, env: &dyn CommitEnv, entry: &Arc<CommitEntry>) -> Result<()> {
        let mut st = self.state.lock()?;
        loop {
            if entry.logged.load(Ordering::Acquire) {
                return Ok(());
            }
            if st.fatal.is_some() {
                return Err(self.fatal_error_locked(&st));
            }
            if !st.leader_active && !st.wal_queue.is_empty() {
                st.leader_active = true;
                let group: Vec<PendingLog> = st.wal_queue.drain(..).collect();
                drop(st);

                let result = self.log_group(env, &group);
                st = self.state.lock()?;
                st.leader_active = false;
                match result {
                    Ok(target) => {
                        for log in &group {
                            *log.entry.binding.lock()? = Some(target.clone());
                            log.entry.logged.store(true, Ordering::Release);
                        }
                    }
                    Err(err) => {
                        for log in &group {
                            log.entry.failed.store(true, Ordering::Release);
                            log.entry.logged.store(true, Ordering::Release);
                        }
                        if st.fatal.is_none() {
                            tracing::error!(error = %err, "wal group write failed, pipeline fatal");
                            st.fatal = Some(err);
                        }
                    }
                }
                self.logged_cv.notify_all();
                self.visible_cv.notify_all();
                continue;
            }
            st = self.logged_cv.wait(st)?;
        }
    }

    /// Binds and appends one group. Runs without the pipeline lock, but
    /// leadership is exclusive so group writes are serialized.
    fn log_group(&self, env: &dyn CommitEnv, group: &[PendingLog]) -> Result<CommitTarget> {
        let bytes: usize = group.iter().map(|log| log.payload.len()).sum();
        let target = env.prepare(bytes)?;
        for log in group {
            target.wal.append(&log.payload, false)?;
        }
        match self.sync_mode {
            SyncMode::Off => {}
            SyncMode::PerBatch | SyncMode::Group => target.wal.sync()?,
        }
        Ok(target)
    }

    fn fatal_error(&self) -> Error {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.fatal.clone())
            .unwrap_or_else(|| Error::Invariant("commit failed without recorded error".into()))
    }

    fn fatal_error_locked(&self, st: &PipelineState) -> Error {
        st.fatal
            .clone()
            .unwrap_or_else(|| Error::Invariant("commit failed without recorded error".into()))
    }
}

/// Replays a batch payload into a memtable at its reserved sequence
/// numbers. Shared by the commit pipeline and WAL recovery.
pub(crate) fn apply_payload(mem: &Memtable, base: SeqNum, payload: &[u8]) -> Result<()> {
    let (_, reader) = Batch::decode(payload)?;
    for (i, op) in reader.enumerate() {
        let op = op?;
        if op.kind == ValueKind::LogData {
            continue;
        }
        mem.insert(base + i as u64, op.kind, op.key, op.value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::key::InternalKeyCmp;
    use crate::tmpfs::TempDir;
    use std::sync::atomic::AtomicUsize;

    struct TestEnv {
        wal: Arc<Wal>,
        mem: Arc<Memtable>,
        stalled: AtomicBool,
        prepares: AtomicUsize,
    }

    impl TestEnv {
        fn new(dir: &TempDir) -> Self {
            std::fs::create_dir_all(dir.path().join("wal")).expect("Failed to create wal dir");
            let cmp = InternalKeyCmp(Arc::new(BytewiseComparator));
            Self {
                wal: Arc::new(Wal::create(dir.path(), 1).expect("Failed to create wal")),
                mem: Arc::new(Memtable::new(cmp, 1)),
                stalled: AtomicBool::new(false),
                prepares: AtomicUsize::new(0),
            }
        }
    }

    impl CommitEnv for TestEnv {
        fn prepare(&self, _bytes: usize) -> Result<CommitTarget> {
            self.prepares.fetch_add(1, Ordering::Relaxed);
            Ok(CommitTarget {
                wal: Arc::clone(&self.wal),
                mem: Arc::clone(&self.mem),
                writer_ref: Arc::clone(&self.mem).writer_ref(),
            })
        }

        fn should_stall(&self) -> bool {
            self.stalled.load(Ordering::Relaxed)
        }
    }

    fn batch_of(key: &[u8], value: &[u8]) -> Batch {
        let mut batch = Batch::new();
        batch.set(key, value);
        batch
    }

    #[test]
    fn test_single_commit_advances_visible() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = TestEnv::new(&dir);
        let pipeline = CommitPipeline::new(SyncMode::Off, 0);

        let base = pipeline
            .commit(&env, batch_of(b"k", b"v"))
            .expect("commit failed");
        assert_eq!(base, 1);
        assert_eq!(pipeline.visible_seq(), 1);
        assert_eq!(env.mem.writer_count(), 0);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = TestEnv::new(&dir);
        let pipeline = CommitPipeline::new(SyncMode::Off, 7);
        pipeline.commit(&env, Batch::new()).expect("commit failed");
        assert_eq!(pipeline.visible_seq(), 7);
    }

    #[test]
    fn test_concurrent_commits_publish_contiguously() {
        use std::thread;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = Arc::new(TestEnv::new(&dir));
        let pipeline = Arc::new(CommitPipeline::new(SyncMode::Off, 0));

        let threads = 8;
        let per_thread = 50u64;
        let mut handles = vec![];
        for t in 0..threads {
            let env = Arc::clone(&env);
            let pipeline = Arc::clone(&pipeline);
            handles.push(thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t}_k{i}");
                    pipeline
                        .commit(&*env, batch_of(key.as_bytes(), b"v"))
                        .expect("commit failed");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }

        let total = threads as u64 * per_thread;
        assert_eq!(pipeline.visible_seq(), total);
        assert_eq!(env.mem.writer_count(), 0);
    }

    #[test]
    fn test_commit_after_close_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = TestEnv::new(&dir);
        let pipeline = CommitPipeline::new(SyncMode::Off, 0);
        pipeline.close();
        assert!(matches!(
            pipeline.commit(&env, batch_of(b"k", b"v")),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_fatal_rejects_further_commits() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = TestEnv::new(&dir);
        let pipeline = CommitPipeline::new(SyncMode::Off, 0);
        pipeline.set_fatal(Error::Corruption("forced".into()));
        assert!(pipeline.commit(&env, batch_of(b"k", b"v")).is_err());
    }

    #[test]
    fn test_stall_blocks_until_released() {
        use std::thread;
        use std::time::Duration;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let env = Arc::new(TestEnv::new(&dir));
        env.stalled.store(true, Ordering::Relaxed);
        let pipeline = Arc::new(CommitPipeline::new(SyncMode::Off, 0));

        let committer = {
            let env = Arc::clone(&env);
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.commit(&*env, batch_of(b"k", b"v")))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(pipeline.visible_seq(), 0, "commit should be stalled");

        env.stalled.store(false, Ordering::Relaxed);
        pipeline.release_stall();
        committer
            .join()
            .expect("thread panicked")
            .expect("commit failed");
        assert_eq!(pipeline.visible_seq(), 1);
    }
}
