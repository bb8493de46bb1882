//! Version edits: atomic changes to the LSM structure.
//!
//! Each edit is a tagged sequence of fields:
//!
//! ```text
//! +--------+----------------+--------+----------------+----
//! | tag u8 | field payload  | tag u8 | field payload  | ...
//! +--------+----------------+--------+----------------+----
//! ```
//!
//! Variable-length fields are u32 length-prefixed. Edits are framed and
//! checksummed by the manifest log, not here.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::SeqNum;

const TAG_COMPARATOR: u8 = 0x01;
const TAG_LOG_NUM: u8 = 0x02;
const TAG_NEXT_FILE_NUM: u8 = 0x03;
const TAG_LAST_SEQ: u8 = 0x04;
const TAG_NEW_FILE: u8 = 0x05;
const TAG_DELETED_FILE: u8 = 0x06;

/// Plain file description carried inside an edit; versions wrap these in
/// refcounted metadata with lifecycle state attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDesc {
    pub file_num: u64,
    pub size: u64,
    pub entry_count: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub smallest_seq: SeqNum,
    pub largest_seq: SeqNum,
}

impl FileDesc {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(self.file_num).unwrap();
        buf.write_u64::<BigEndian>(self.size).unwrap();
        buf.write_u64::<BigEndian>(self.entry_count).unwrap();
        buf.write_u64::<BigEndian>(self.smallest_seq).unwrap();
        buf.write_u64::<BigEndian>(self.largest_seq).unwrap();
        write_bytes(buf, &self.smallest);
        write_bytes(buf, &self.largest);
    }

    fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            file_num: cursor.read_u64()?,
            size: cursor.read_u64()?,
            entry_count: cursor.read_u64()?,
            smallest_seq: cursor.read_u64()?,
            largest_seq: cursor.read_u64()?,
            smallest: cursor.read_bytes()?.to_vec(),
            largest: cursor.read_bytes()?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    /// Comparator name, written once when the database is created.
    pub comparator_name: Option<String>,
    /// WAL segments below this number are no longer needed for recovery.
    pub log_num: Option<u64>,
    pub next_file_num: Option<u64>,
    pub last_seq: Option<SeqNum>,
    pub new_files: Vec<(u32, FileDesc)>,
    pub deleted_files: Vec<(u32, u64)>,
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            buf.push(TAG_COMPARATOR);
            write_bytes(&mut buf, name.as_bytes());
        }
        if let Some(log_num) = self.log_num {
            buf.push(TAG_LOG_NUM);
            buf.write_u64::<BigEndian>(log_num).unwrap();
        }
        if let Some(next) = self.next_file_num {
            buf.push(TAG_NEXT_FILE_NUM);
            buf.write_u64::<BigEndian>(next).unwrap();
        }
        if let Some(seq) = self.last_seq {
            buf.push(TAG_LAST_SEQ);
            buf.write_u64::<BigEndian>(seq).unwrap();
        }
        for (level, file) in &self.new_files {
            buf.push(TAG_NEW_FILE);
            buf.write_u32::<BigEndian>(*level).unwrap();
            file.encode_into(&mut buf);
        }
        for (level, file_num) in &self.deleted_files {
            buf.push(TAG_DELETED_FILE);
            buf.write_u32::<BigEndian>(*level).unwrap();
            buf.write_u64::<BigEndian>(*file_num).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();
        let mut cursor = Cursor { data, pos: 0 };
        while cursor.pos < data.len() {
            match cursor.read_u8()? {
                TAG_COMPARATOR => {
                    let name = cursor.read_bytes()?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::Corruption("comparator name not utf8".into()))?,
                    );
                }
                TAG_LOG_NUM => edit.log_num = Some(cursor.read_u64()?),
                TAG_NEXT_FILE_NUM => edit.next_file_num = Some(cursor.read_u64()?),
                TAG_LAST_SEQ => edit.last_seq = Some(cursor.read_u64()?),
                TAG_NEW_FILE => {
                    let level = cursor.read_u32()?;
                    edit.new_files.push((level, FileDesc::decode_from(&mut cursor)?));
                }
                TAG_DELETED_FILE => {
                    let level = cursor.read_u32()?;
                    edit.deleted_files.push((level, cursor.read_u64()?));
                }
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag: {other}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.write_u32::<BigEndian>(data.len() as u32).unwrap();
    buf.extend_from_slice(data);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(Error::Corruption("version edit truncated".to_string()));
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.data.len() {
            return Err(Error::Corruption("version edit truncated".to_string()));
        }
        let value = BigEndian::read_u32(&self.data[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    fn read_u64(&mut self) -> Result<u64> {
        if self.pos + 8 > self.data.len() {
            return Err(Error::Corruption("version edit truncated".to_string()));
        }
        let value = BigEndian::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        Ok(value)
    }

    fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if self.pos + len > self.data.len() {
            return Err(Error::Corruption("version edit truncated".to_string()));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
