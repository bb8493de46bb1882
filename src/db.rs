//! The engine: open/recover, the write surface, and read construction.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::batch::Batch;
use crate::cache::{Cache, CacheHandle};
use crate::commit::{CommitEnv, CommitPipeline, CommitTarget};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::flush::{self, FlushMsg};
use crate::iterator::level::LevelIter;
use crate::iterator::merge::MergingIter;
use crate::iterator::user::{Iter, IterOptions};
use crate::iterator::InternalIterator;
use crate::key::{decode_key, is_visible, InternalKeyCmp, SeqNum};
use crate::memtable::{Memtable, MemtableIter};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::rangedel::TombstoneSet;
use crate::rangekey::RangeKeySet;
use crate::readstate::{ReadState, ReadStateHolder};
use crate::recovery::recover_memtables;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::reader::TableReader;
use crate::sstable::sst_path;
use crate::version::{VersionSet, NUM_LEVELS};
use crate::wal::Wal;

const LOCK_FILE: &str = "basalt.lock";

pub(crate) struct EngineState {
    pub memtables: Vec<Arc<Memtable>>,
    pub wal: Option<Arc<Wal>>,
    pub versions: VersionSet,
}

pub(crate) struct EngineCore {
    pub opts: Options,
    pub cmp: InternalKeyCmp,
    pub dir: PathBuf,
    pub cache: CacheHandle,
    /// Keeps a privately built cache alive for the engine's lifetime.
    _shared_cache: Arc<Cache>,
    pub pipeline: CommitPipeline,
    pub state: Mutex<EngineState>,
    pub read_state: ReadStateHolder,
    snapshots: SnapshotList,
    pub metrics: Metrics,
    pub flush_tx: Mutex<Option<mpsc::Sender<FlushMsg>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    pub closed: AtomicBool,
    _lock: FileLock,
}

impl EngineCore {
    pub(crate) fn snapshots(&self) -> &SnapshotList {
        &self.snapshots
    }

    /// Publishes {memtable queue, current version} for readers. Callers
    /// hold the engine mutex; readers never do.
    pub(crate) fn publish_read_state(&self, st: &EngineState) {
        self.read_state.publish(ReadState {
            memtables: st.memtables.clone(),
            version: st.versions.current(),
        });
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.opts.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Seals the mutable memtable and installs a fresh one with a fresh
    /// WAL segment. Engine mutex held by the caller.
    pub(crate) fn rotate_locked(&self, st: &mut EngineState) -> Result<()> {
        let old = Arc::clone(st.memtables.last().expect("queue never empty"));
        if old.is_empty() {
            return Ok(());
        }
        old.mark_immutable();

        let wal_num = st.versions.next_file_num();
        let new_wal = Arc::new(Wal::create(&self.dir, wal_num)?);
        let new_mem = Arc::new(Memtable::new(self.cmp.clone(), wal_num));
        st.memtables.push(new_mem);
        st.wal = Some(new_wal);
        self.publish_read_state(st);
        self.metrics.memtable_rotations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            wal_num,
            sealed_size = old.approximate_size(),
            queue_len = st.memtables.len(),
            "rotated memtable"
        );
        self.kick_flush(Vec::new());
        Ok(())
    }

    pub(crate) fn kick_flush(&self, acks: Vec<oneshot::Sender<Result<()>>>) {
        let sender = self.flush_tx.lock().ok().and_then(|guard| guard.clone());
        let msg = FlushMsg { acks };
        let undeliverable = match sender {
            Some(tx) => tx.send(msg).err().map(|err| err.0),
            None => Some(msg),
        };
        // Worker gone: fail the acks rather than hanging callers.
        if let Some(msg) = undeliverable {
            for ack in msg.acks {
                let _ = ack.send(Err(Error::Closed));
            }
        }
    }

    /// Opens (or finds cached) the reader for a table in the current
    /// version. A missing file here is corruption, not absence: the
    /// version said it exists.
    pub(crate) fn open_table(&self, file_num: u64) -> Result<Arc<TableReader>> {
        let result = self.cache.files().find_or_create(self.cache.id(), file_num, || {
            TableReader::open(
                &sst_path(&self.dir, file_num),
                file_num,
                self.cache.clone(),
                self.cmp.clone(),
            )
        });
        match result {
            Err(Error::NotFound) => Err(Error::Corruption(format!(
                "table {file_num} referenced by a live version is missing"
            ))),
            other => other,
        }
    }

    /// Builds a user iterator over a captured read state at `visible`.
    pub(crate) fn build_iter<'a>(
        &self,
        read_state: Arc<ReadState>,
        visible: SeqNum,
        opts: IterOptions<'a>,
    ) -> Result<Iter<'a>> {
        let mut children: Vec<Box<dyn InternalIterator + 'a>> = Vec::new();
        let mut tombstones = TombstoneSet::new(Arc::clone(self.cmp.user_cmp()));
        let mut range_keys = RangeKeySet::new(Arc::clone(self.cmp.user_cmp()));

        // Newest source first: indexed batch, memtables newest to
        // oldest, L0 newest to oldest, then one iterator per level.
        if let Some(batch) = opts.batch {
            if let Some(iter) = batch.internal_iter() {
                children.push(Box::new(iter));
            }
            for (key, value) in batch.range_del_entries()? {
                tombstones.add_encoded(&key, &value)?;
            }
            for (key, value) in batch.range_key_entries()? {
                range_keys.add_encoded(&key, &value)?;
            }
        }

        for mem in read_state.memtables.iter().rev() {
            children.push(Box::new(MemtableIter::new(Arc::clone(mem))));
            for (key, value) in mem.range_del_entries() {
                let (_, seq, _) = decode_key(&key)?;
                if is_visible(seq, visible) {
                    tombstones.add_encoded(&key, &value)?;
                }
            }
            for (key, value) in mem.range_key_entries() {
                let (_, seq, _) = decode_key(&key)?;
                if is_visible(seq, visible) {
                    range_keys.add_encoded(&key, &value)?;
                }
            }
        }

        for meta in read_state.version.files(0) {
            let reader = self.open_table(meta.file_num)?;
            children.push(Box::new(Arc::clone(&reader).new_iter()?));
            self.collect_side(&reader, visible, &mut tombstones, &mut range_keys)?;
        }
        for level in 1..NUM_LEVELS {
            let files = read_state.version.files(level);
            if files.is_empty() {
                continue;
            }
            children.push(Box::new(LevelIter::new(
                files.to_vec(),
                self.dir.clone(),
                self.cache.clone(),
                self.cmp.clone(),
            )));
            for meta in files {
                let reader = self.open_table(meta.file_num)?;
                self.collect_side(&reader, visible, &mut tombstones, &mut range_keys)?;
            }
        }

        let merge = MergingIter::new(children, self.cmp.clone(), visible);
        Ok(Iter::new(
            merge,
            self.cmp.clone(),
            self.opts.merger.clone(),
            tombstones,
            range_keys,
            &opts,
            Some(read_state),
        ))
    }

    /// Pulls a table's range-deletion and range-key side blocks into the
    /// iterator's overlay sets.
    fn collect_side(
        &self,
        reader: &Arc<TableReader>,
        visible: SeqNum,
        tombstones: &mut TombstoneSet,
        range_keys: &mut RangeKeySet,
    ) -> Result<()> {
        if let Some(mut iter) = reader.new_range_del_iter()? {
            iter.first()?;
            while iter.valid() {
                let (_, seq, _) = decode_key(iter.key())?;
                if is_visible(seq, visible) {
                    tombstones.add_encoded(iter.key(), iter.value())?;
                }
                iter.next()?;
            }
        }
        if let Some(mut iter) = reader.new_range_key_iter()? {
            iter.first()?;
            while iter.valid() {
                let (_, seq, _) = decode_key(iter.key())?;
                if is_visible(seq, visible) {
                    range_keys.add_encoded(iter.key(), iter.value())?;
                }
                iter.next()?;
            }
        }
        Ok(())
    }

    /// Point lookup through a bounded iterator at `visible`.
    pub(crate) fn get_at(
        &self,
        read_state: &Arc<ReadState>,
        visible: SeqNum,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut iter =
            self.build_iter(Arc::clone(read_state), visible, IterOptions::default())?;
        if iter.seek_ge(key)
            && self.cmp.user_cmp().compare(iter.key(), key) == std::cmp::Ordering::Equal
        {
            let value = iter.value().to_vec();
            iter.close()?;
            return Ok(Some(value));
        }
        if let Some(err) = iter.error() {
            return Err(err);
        }
        Ok(None)
    }
}

impl CommitEnv for EngineCore {
    fn prepare(&self, bytes: usize) -> Result<CommitTarget> {
        let mut st = self.state.lock()?;
        let needs_rotate = {
            let mem = st.memtables.last().expect("queue never empty");
            !mem.is_empty() && mem.approximate_size() + bytes > self.opts.memtable_size
        };
        if needs_rotate {
            self.rotate_locked(&mut st)?;
        }
        let mem = Arc::clone(st.memtables.last().expect("queue never empty"));
        let wal = st.wal.clone().ok_or(Error::ReadOnly)?;
        Ok(CommitTarget {
            wal,
            writer_ref: Arc::clone(&mem).writer_ref(),
            mem,
        })
    }

    fn should_stall(&self) -> bool {
        let Ok(st) = self.state.lock() else {
            return false;
        };
        let stalled = st.memtables.len() - 1 >= self.opts.max_immutable_memtables;
        if stalled {
            self.metrics.stalls.fetch_add(1, Ordering::Relaxed);
        }
        stalled
    }
}

/// An embedded LSM storage engine.
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    /// Opens (creating or recovering) a database at `opts.dir`.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        let dir = opts.dir.clone();
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join("sst"))?;
        std::fs::create_dir_all(dir.join("wal"))?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let shared_cache = opts
            .cache
            .clone()
            .unwrap_or_else(|| Cache::new(opts.cache_size, opts.max_open_files));
        let cache = shared_cache.handle();
        let cmp = InternalKeyCmp(Arc::clone(&opts.comparator));

        let versions = VersionSet::recover(
            &dir,
            cmp.clone(),
            opts.comparator.name(),
            cache.clone(),
            opts.read_only,
        )?;

        let (mut memtables, replayed_seq) =
            recover_memtables(&dir, versions.log_num(), cmp.clone(), opts.read_only)?;
        let last_seq = versions.last_seq().max(replayed_seq);
        if let Some(max_wal) = memtables.iter().map(|m| m.wal_num()).max() {
            versions.ensure_file_num_at_least(max_wal + 1);
        }

        let wal = if opts.read_only {
            None
        } else {
            let num = versions.next_file_num();
            Some(Arc::new(Wal::create(&dir, num)?))
        };
        let mutable = Arc::new(Memtable::new(
            cmp.clone(),
            wal.as_ref().map(|w| w.num()).unwrap_or(0),
        ));
        memtables.push(mutable);

        let pipeline = CommitPipeline::new(opts.wal_sync, last_seq);
        let state = EngineState {
            memtables,
            wal,
            versions,
        };
        let read_state = ReadStateHolder::new(ReadState {
            memtables: state.memtables.clone(),
            version: state.versions.current(),
        });

        let read_only = opts.read_only;
        let core = Arc::new(EngineCore {
            opts,
            cmp,
            dir,
            cache,
            _shared_cache: shared_cache,
            pipeline,
            state: Mutex::new(state),
            read_state,
            snapshots: SnapshotList::default(),
            metrics: Metrics::default(),
            flush_tx: Mutex::new(None),
            flush_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
            _lock: lock,
        });

        if !read_only {
            let (tx, rx) = mpsc::channel();
            *core.flush_tx.lock()? = Some(tx);
            let worker_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name("basalt-flush".to_string())
                .spawn(move || flush::run_worker(worker_core, rx))
                .map_err(|err| Error::Io(err.to_string()))?;
            *core.flush_handle.lock()? = Some(handle);
            // Memtables recovered from the WAL are already sealed; get
            // them onto disk.
            core.kick_flush(Vec::new());
        }

        tracing::info!(
            dir = %core.dir.display(),
            last_seq,
            read_only,
            "opened engine"
        );
        Ok(Self { core })
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        self.core.check_writable()?;
        let records = batch.count() as u64;
        let bytes = batch.byte_size() as u64;
        self.core.pipeline.commit(self.core.as_ref(), batch)?;
        self.core.metrics.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.core
            .metrics
            .batches_committed
            .fetch_add(1, Ordering::Relaxed);
        self.core
            .metrics
            .records_written
            .fetch_add(records, Ordering::Relaxed);
        Ok(())
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value);
        self.commit(batch)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.commit(batch)
    }

    pub fn single_delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.single_delete(key);
        self.commit(batch)
    }

    pub fn delete_range(&self, lo: &[u8], hi: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete_range(lo, hi);
        self.commit(batch)
    }

    pub fn merge(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.core.opts.merger.is_none() {
            return Err(Error::InvalidArgument(
                "merge requires a merge operator".to_string(),
            ));
        }
        let mut batch = Batch::new();
        batch.merge(key, value);
        self.commit(batch)
    }

    pub fn range_key_set(
        &self,
        start: &[u8],
        end: &[u8],
        suffix: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut batch = Batch::new();
        batch.range_key_set(start, end, suffix, value);
        self.commit(batch)
    }

    pub fn range_key_unset(&self, start: &[u8], end: &[u8], suffix: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.range_key_unset(start, end, suffix);
        self.commit(batch)
    }

    pub fn range_key_delete(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.range_key_delete(start, end);
        self.commit(batch)
    }

    /// Records opaque bytes in the WAL without touching the key space.
    pub fn log_data(&self, data: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.log_data(data);
        self.commit(batch)
    }

    /// Commits a caller-built batch atomically.
    pub fn apply(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.commit(batch)
    }

    pub fn new_batch(&self) -> Batch {
        Batch::new()
    }

    pub fn new_indexed_batch(&self) -> Batch {
        Batch::new_indexed(self.core.cmp.clone())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.core.check_open()?;
        let read_state = self.core.read_state.load();
        let visible = self.core.pipeline.visible_seq();
        self.core.get_at(&read_state, visible, key)
    }

    pub fn new_iter<'a>(&self, opts: IterOptions<'a>) -> Result<Iter<'a>> {
        self.core.check_open()?;
        let read_state = self.core.read_state.load();
        let visible = self.core.pipeline.visible_seq();
        self.core.build_iter(read_state, visible, opts)
    }

    /// Captures a consistent read view at the current visible sequence.
    pub fn new_snapshot(&self) -> Result<Snapshot> {
        self.core.check_open()?;
        let read_state = self.core.read_state.load();
        let visible = self.core.pipeline.visible_seq();
        Ok(Snapshot::new(
            Arc::clone(&self.core),
            read_state,
            visible,
        ))
    }

    /// Rotates the mutable memtable (if non-empty) and blocks until all
    /// sealed memtables are on disk. Not for use inside an async
    /// runtime; see [`Engine::async_flush`].
    pub fn flush(&self) -> Result<()> {
        let rx = self.async_flush()?;
        rx.blocking_recv().map_err(Error::from)?
    }

    /// Like [`Engine::flush`], returning a receiver that resolves when
    /// the flush completes.
    pub fn async_flush(&self) -> Result<oneshot::Receiver<Result<()>>> {
        self.core.check_writable()?;
        {
            let mut st = self.core.state.lock()?;
            self.core.rotate_locked(&mut st)?;
        }
        let (tx, rx) = oneshot::channel();
        self.core.kick_flush(vec![tx]);
        Ok(rx)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Drains in-flight writes, stops background work, and releases this
    /// engine's cache entries. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.core.pipeline.close();
        let tx = self.core.flush_tx.lock()?.take();
        drop(tx);
        let handle = self.core.flush_handle.lock()?.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.core.cache.evict_all();
        tracing::info!(dir = %self.core.dir.display(), "closed engine");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
