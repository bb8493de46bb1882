//! The flush worker: immutable memtables to level-0 tables.
//!
//! A dedicated thread drains the immutable prefix of the memtable queue.
//! For each memtable it waits for in-flight commit appliers to finish,
//! builds an L0 table, commits a version edit (durable in the manifest
//! before the install), publishes the shrunken read state, and deletes
//! WAL segments the flush has made redundant. Each completed flush
//! releases writers stalled on the backlog.

use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};

use tokio::sync::oneshot;

use crate::db::EngineCore;
use crate::error::Result;
use crate::memtable::MemtableState;
use crate::sstable::builder::TableBuilder;
use crate::sstable::sst_path;
use crate::version::edit::{FileDesc, VersionEdit};
use crate::wal;

pub(crate) struct FlushMsg {
    pub acks: Vec<oneshot::Sender<Result<()>>>,
}

/// Body of the flush thread.
pub(crate) fn run_worker(core: Arc<EngineCore>, rx: mpsc::Receiver<FlushMsg>) {
    while let Ok(msg) = rx.recv() {
        let result = flush_ready(&core);
        if let Err(err) = &result {
            tracing::error!(error = %err, "flush failed");
            core.pipeline.set_fatal(err.clone());
        }
        for ack in msg.acks {
            let _ = ack.send(result.clone());
        }
    }
    tracing::debug!("flush worker exiting");
}

/// Flushes every immutable memtable currently queued, oldest first.
pub(crate) fn flush_ready(core: &EngineCore) -> Result<()> {
    loop {
        // Pick the oldest sealed memtable; the mutable tail never
        // qualifies.
        let mem = {
            let st = core.state.lock()?;
            let candidate = st
                .memtables
                .iter()
                .take(st.memtables.len().saturating_sub(1))
                .find(|m| m.state() == MemtableState::ImmutablePendingFlush)
                .cloned();
            match candidate {
                Some(mem) => mem,
                None => return Ok(()),
            }
        };

        // Late appliers bound to this memtable before the seal must
        // finish before its contents are final.
        while mem.writer_count() > 0 {
            std::thread::yield_now();
        }
        mem.mark_flushing();

        let file_num = {
            let st = core.state.lock()?;
            st.versions.next_file_num()
        };
        let path = sst_path(&core.dir, file_num);
        let mut builder = TableBuilder::new(&path, file_num, &core.opts)?;
        for (key, value) in mem.flush_entries() {
            builder.add(&key, &value)?;
        }
        let props = builder.finish()?;

        // Install: manifest edit, drop the memtable from the queue,
        // publish the new read state.
        let (wal_floor, entry_count) = {
            let mut st = core.state.lock()?;
            let pos = st
                .memtables
                .iter()
                .position(|m| Arc::ptr_eq(m, &mem))
                .ok_or_else(|| {
                    crate::error::Error::Invariant("flushed memtable left the queue".to_string())
                })?;
            // Everything below the next surviving memtable's segment is
            // now covered by tables.
            let wal_floor = st
                .memtables
                .get(pos + 1)
                .map(|m| m.wal_num())
                .unwrap_or_else(|| mem.wal_num() + 1);
            let edit = VersionEdit {
                log_num: Some(wal_floor),
                last_seq: Some(core.pipeline.visible_seq()),
                new_files: vec![(
                    0,
                    FileDesc {
                        file_num: props.file_num,
                        size: props.size,
                        entry_count: props.entry_count,
                        smallest: props.smallest.clone(),
                        largest: props.largest.clone(),
                        smallest_seq: props.smallest_seq,
                        largest_seq: props.largest_seq,
                    },
                )],
                ..Default::default()
            };
            st.versions.log_and_apply(edit)?;
            st.memtables.remove(pos);
            core.publish_read_state(&st);
            (wal_floor, props.entry_count)
        };
        mem.mark_flushed();
        core.metrics.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            file_num,
            entries = entry_count,
            wal_num = mem.wal_num(),
            "flushed memtable to level 0"
        );

        // The flushed memtable's WAL (and anything older) is redundant.
        for num in wal::list_segments(&core.dir)? {
            if num < wal_floor {
                let path = wal::wal_path(&core.dir, num);
                if let Err(err) = std::fs::remove_file(&path) {
                    tracing::warn!(num, error = %err, "failed to delete flushed wal segment");
                }
            }
        }

        // A flush slot freed up; stalled writers may proceed.
        core.pipeline.release_stall();
    }
}
