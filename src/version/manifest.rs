//! The manifest: an append-only log of version edits.
//!
//! The manifest is a WAL for metadata rather than user data, and it
//! reuses the WAL's block framing and checksums. Opening a database
//! replays the old manifest, then writes a fresh one seeded with a
//! snapshot edit describing the recovered state, and atomically renames
//! it into place. Appends are synced before the edit takes effect.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::edit::VersionEdit;
use crate::error::Result;
use crate::wal::{LogReader, LogWriter};

pub const MANIFEST_NAME: &str = "MANIFEST";

pub struct Manifest {
    writer: Mutex<LogWriter>,
    path: PathBuf,
}

impl Manifest {
    /// Creates a fresh manifest at `dir/MANIFEST.tmp` seeded with a
    /// snapshot edit, then renames it over the live one.
    pub fn create(dir: &Path, snapshot: &VersionEdit) -> Result<Self> {
        let tmp = dir.join(format!("{MANIFEST_NAME}.tmp"));
        let path = dir.join(MANIFEST_NAME);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = LogWriter::new(file);
        writer.add_record(&snapshot.encode())?;
        writer.sync()?;

        std::fs::rename(&tmp, &path)?;
        sync_dir(dir)?;
        tracing::info!(path = %path.display(), "installed manifest");
        Ok(Self {
            writer: Mutex::new(writer),
            path,
        })
    }

    /// Appends an edit and makes it durable.
    pub fn append(&self, edit: &VersionEdit) -> Result<()> {
        let mut writer = self.writer.lock()?;
        writer.add_record(&edit.encode())?;
        writer.sync()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays every edit in the manifest at `dir`, if one exists.
    pub fn replay(dir: &Path) -> Result<Vec<VersionEdit>> {
        let path = dir.join(MANIFEST_NAME);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut edits = Vec::new();
        for record in LogReader::new(file) {
            edits.push(VersionEdit::decode(&record?)?);
        }
        Ok(edits)
    }
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use crate::version::edit::FileDesc;

    #[test]
    fn test_create_append_replay() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let snapshot = VersionEdit {
            comparator_name: Some("basalt.bytewise".to_string()),
            next_file_num: Some(1),
            last_seq: Some(0),
            ..Default::default()
        };
        let manifest = Manifest::create(dir.path(), &snapshot).expect("Failed to create");

        let edit = VersionEdit {
            new_files: vec![(
                0,
                FileDesc {
                    file_num: 2,
                    size: 100,
                    entry_count: 5,
                    smallest: b"a".to_vec(),
                    largest: b"z".to_vec(),
                    smallest_seq: 1,
                    largest_seq: 5,
                },
            )],
            log_num: Some(3),
            ..Default::default()
        };
        manifest.append(&edit).expect("append failed");

        let edits = Manifest::replay(dir.path()).expect("replay failed");
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0], snapshot);
        assert_eq!(edits[1], edit);
    }

    #[test]
    fn test_replay_missing_manifest() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        assert!(Manifest::replay(dir.path()).expect("replay failed").is_empty());
    }

    #[test]
    fn test_recreate_replaces_previous() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let first = VersionEdit {
            next_file_num: Some(1),
            ..Default::default()
        };
        Manifest::create(dir.path(), &first).expect("Failed to create");

        let second = VersionEdit {
            next_file_num: Some(42),
            ..Default::default()
        };
        Manifest::create(dir.path(), &second).expect("Failed to create");

        let edits = Manifest::replay(dir.path()).expect("replay failed");
        assert_eq!(edits, vec![second]);
    }
}
