//! Write-ahead log segments.
//!
//! Every committed batch is appended to the current segment before its
//! entries reach the memtable. A memtable rotation opens a fresh segment;
//! the old one is deleted once the memtable's flush edit is durable in
//! the manifest, so replay never resurrects flushed data.

pub mod reader;
pub mod record;
pub mod writer;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc::{Crc, CRC_32_ISCSI};

pub use reader::LogReader;
pub use writer::LogWriter;

use crate::error::Result;

/// Checksum algorithm shared by the WAL, manifest, and table blocks.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Path of a WAL segment inside the database directory.
pub fn wal_path(dir: &Path, num: u64) -> PathBuf {
    dir.join("wal").join(format!("{num:08}.log"))
}

/// Segment numbers of every WAL file under `dir/wal`, ascending.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut nums = Vec::new();
    let wal_dir = dir.join("wal");
    for entry in std::fs::read_dir(&wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".log") {
            if let Ok(num) = stem.parse::<u64>() {
                nums.push(num);
            }
        }
    }
    nums.sort_unstable();
    Ok(nums)
}

/// One open WAL segment.
pub struct Wal {
    writer: Mutex<LogWriter>,
    num: u64,
    path: PathBuf,
}

impl Wal {
    /// Creates segment `num` under `dir/wal`.
    pub fn create(dir: &Path, num: u64) -> Result<Self> {
        let path = wal_path(dir, num);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        tracing::debug!(num, path = %path.display(), "opened wal segment");
        Ok(Self {
            writer: Mutex::new(LogWriter::new(file)),
            num,
            path,
        })
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, optionally making it durable before returning.
    pub fn append(&self, payload: &[u8], sync: bool) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.add_record(payload)?;
        if sync {
            writer.sync()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.writer.lock()?.sync()
    }

    pub fn size(&self) -> u64 {
        self.writer.lock().map(|w| w.size()).unwrap_or(0)
    }

    /// Opens a segment for replay.
    pub fn replay(dir: &Path, num: u64) -> Result<LogReader> {
        let file = File::open(wal_path(dir, num))?;
        Ok(LogReader::new(file))
    }
}
