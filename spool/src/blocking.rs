//! The blocking file engine backing a [`Spool`](crate::Spool).
//!
//! All file I/O happens here, on whatever thread owns the engine - the async
//! facade in `lib.rs` keeps exactly one such owner per spool directory, which
//! is what serializes writer appends against reader cursor operations.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use snafu::prelude::*;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

/// The record log.
const DATA_FILE_NAME: &str = "data";
/// The committed read cursor, a big-endian `u64` byte offset into `data`.
const META_FILE_NAME: &str = "meta";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub enum Error {
    UnableToCreateSpoolDir {
        source: io::Error,
        path: PathBuf,
    },

    UnableToOpenFile {
        source: io::Error,
        path: PathBuf,
    },

    UnableToReadMeta {
        source: io::Error,
    },

    UnableToWriteMeta {
        source: io::Error,
    },

    UnableToWriteLength {
        source: io::Error,
    },

    UnableToWriteData {
        source: io::Error,
    },

    UnableToSync {
        source: io::Error,
    },

    UnableToReadLength {
        source: io::Error,
    },

    UnableToReadData {
        source: io::Error,
    },

    /// The log ends mid-record; the tail past the last complete record is
    /// unreadable.
    TruncatedRecord {
        offset: u64,
        expected: u64,
        remaining: u64,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single-writer, single-reader durable FIFO over two files in `dir`.
///
/// Records are framed as a big-endian `u32` payload length followed by the
/// payload bytes. The reader's committed position is persisted in the `meta`
/// file so a restart resumes the drain where it left off.
#[derive(Debug)]
pub struct SpoolFile {
    data: File,
    meta: File,

    /// Byte offset one past the last complete record.
    write_offset: u64,

    /// The persisted read position.
    committed: u64,

    /// The in-memory read position; ahead of `committed` after an
    /// uncommitted [`SpoolFile::read()`].
    cursor: u64,
}

impl SpoolFile {
    /// Open (creating if absent) the spool files in `dir`.
    ///
    /// A committed cursor pointing past the end of the log (e.g. after a data
    /// file lost to an unclean shutdown) is clamped to the end, treating the
    /// log as drained.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).context(UnableToCreateSpoolDirSnafu { path: &dir })?;

        let data_path = dir.join(DATA_FILE_NAME);
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_path)
            .context(UnableToOpenFileSnafu { path: &data_path })?;

        let meta_path = dir.join(META_FILE_NAME);
        let meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&meta_path)
            .context(UnableToOpenFileSnafu { path: &meta_path })?;

        let write_offset = data
            .metadata()
            .context(UnableToReadMetaSnafu)?
            .len();

        let committed = read_cursor(&meta)?.min(write_offset);

        Ok(Self {
            data,
            meta,
            write_offset,
            committed,
            cursor: committed,
        })
    }

    /// Append one framed record and flush it to durable storage.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        self.data
            .seek(SeekFrom::Start(self.write_offset))
            .context(UnableToWriteLengthSnafu)?;
        self.data
            .write_u32::<BigEndian>(payload.len() as u32)
            .context(UnableToWriteLengthSnafu)?;
        self.data
            .write_all(payload)
            .context(UnableToWriteDataSnafu)?;
        self.data.sync_data().context(UnableToSyncSnafu)?;

        self.write_offset += 4 + payload.len() as u64;
        Ok(())
    }

    /// Read the record at the read cursor, advancing the (uncommitted)
    /// cursor past it. Returns [`None`] once the cursor reaches the end of
    /// the log.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.cursor >= self.write_offset {
            return Ok(None);
        }

        self.data
            .seek(SeekFrom::Start(self.cursor))
            .context(UnableToReadLengthSnafu)?;
        let len = self
            .data
            .read_u32::<BigEndian>()
            .context(UnableToReadLengthSnafu)? as u64;

        let remaining = self.write_offset - self.cursor - 4;
        ensure!(
            len <= remaining,
            TruncatedRecordSnafu {
                offset: self.cursor,
                expected: len,
                remaining,
            }
        );

        let mut payload = vec![0; len as usize];
        self.data
            .read_exact(&mut payload)
            .context(UnableToReadDataSnafu)?;

        self.cursor += 4 + len;
        Ok(Some(payload))
    }

    /// Commit the drain: persist the cursor advanced past the last returned
    /// record.
    ///
    /// Once the reader has caught up with the writer the log is truncated to
    /// zero and both cursors reset, bounding disk usage across
    /// outage/recovery cycles.
    pub fn commit(&mut self) -> Result<()> {
        self.committed = self.cursor;

        if self.committed == self.write_offset && self.write_offset != 0 {
            self.data.set_len(0).context(UnableToWriteDataSnafu)?;
            self.data.sync_data().context(UnableToSyncSnafu)?;
            self.write_offset = 0;
            self.committed = 0;
            self.cursor = 0;
        }

        self.persist_cursor()
    }

    /// Un-consume: restore the cursor to the last committed position so the
    /// next [`SpoolFile::read()`] re-yields the same record.
    pub fn rollback(&mut self) -> Result<()> {
        self.cursor = self.committed;
        self.persist_cursor()
    }

    /// Returns true while the read cursor is strictly before the end of the
    /// log.
    pub fn has_data(&self) -> bool {
        self.cursor < self.write_offset
    }

    /// Flush any pending state before shutdown.
    pub fn sync(&mut self) -> Result<()> {
        self.data.sync_data().context(UnableToSyncSnafu)?;
        self.meta.sync_data().context(UnableToSyncSnafu)
    }

    fn persist_cursor(&mut self) -> Result<()> {
        self.meta
            .seek(SeekFrom::Start(0))
            .context(UnableToWriteMetaSnafu)?;
        self.meta
            .write_u64::<BigEndian>(self.committed)
            .context(UnableToWriteMetaSnafu)?;
        self.meta.set_len(8).context(UnableToWriteMetaSnafu)?;
        self.meta.sync_data().context(UnableToSyncSnafu)
    }
}

/// Read the persisted cursor, treating a missing or short `meta` file as
/// offset 0 (a fresh spool).
fn read_cursor(meta: &File) -> Result<u64> {
    let mut f = meta;
    if f.metadata().context(UnableToReadMetaSnafu)?.len() < 8 {
        return Ok(0);
    }
    f.seek(SeekFrom::Start(0)).context(UnableToReadMetaSnafu)?;
    f.read_u64::<BigEndian>().context(UnableToReadMetaSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_roundtrip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolFile::open(dir.path()).unwrap();

        let records: Vec<&[u8]> = vec![b"first", b"second record", b"", b"third \x00 binary"];
        for r in &records {
            spool.append(r).unwrap();
        }

        for r in &records {
            let got = spool.read().unwrap().expect("record expected");
            assert_eq!(&got, r);
            spool.commit().unwrap();
        }
        assert!(spool.read().unwrap().is_none());
        assert!(!spool.has_data());
    }

    #[test]
    fn rollback_re_yields_same_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolFile::open(dir.path()).unwrap();

        spool.append(b"one").unwrap();
        spool.append(b"two").unwrap();

        let got = spool.read().unwrap().unwrap();
        assert_eq!(got, b"one");
        spool.rollback().unwrap();

        // Same record again after rollback.
        let got = spool.read().unwrap().unwrap();
        assert_eq!(got, b"one");
        spool.commit().unwrap();

        let got = spool.read().unwrap().unwrap();
        assert_eq!(got, b"two");
    }

    #[test]
    fn commit_advances_exactly_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolFile::open(dir.path()).unwrap();

        spool.append(b"a").unwrap();
        spool.append(b"b").unwrap();

        assert_eq!(spool.read().unwrap().unwrap(), b"a");
        spool.commit().unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"b");
    }

    #[test]
    fn cursor_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut spool = SpoolFile::open(dir.path()).unwrap();
            spool.append(b"kept").unwrap();
            spool.append(b"pending").unwrap();
            assert_eq!(spool.read().unwrap().unwrap(), b"kept");
            spool.commit().unwrap();
        }

        let mut spool = SpoolFile::open(dir.path()).unwrap();
        assert!(spool.has_data());
        assert_eq!(spool.read().unwrap().unwrap(), b"pending");
    }

    #[test]
    fn uncommitted_read_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut spool = SpoolFile::open(dir.path()).unwrap();
            spool.append(b"replayed").unwrap();
            // Read without commit, then "crash".
            assert_eq!(spool.read().unwrap().unwrap(), b"replayed");
        }

        let mut spool = SpoolFile::open(dir.path()).unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"replayed");
    }

    #[test]
    fn drained_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolFile::open(dir.path()).unwrap();

        spool.append(b"transient").unwrap();
        spool.read().unwrap().unwrap();
        spool.commit().unwrap();

        assert!(!spool.has_data());
        let len = std::fs::metadata(dir.path().join(DATA_FILE_NAME))
            .unwrap()
            .len();
        assert_eq!(len, 0, "drained log should be truncated");

        // The spool remains usable after truncation.
        spool.append(b"again").unwrap();
        assert_eq!(spool.read().unwrap().unwrap(), b"again");
    }

    #[test]
    fn stale_cursor_is_clamped() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut spool = SpoolFile::open(dir.path()).unwrap();
            for _ in 0..4 {
                spool.append(b"record").unwrap();
                spool.read().unwrap().unwrap();
                spool.commit().unwrap();
            }
        }
        // Simulate a data file lost while meta survived.
        std::fs::write(dir.path().join(DATA_FILE_NAME), b"").unwrap();
        std::fs::write(dir.path().join(META_FILE_NAME), 64u64.to_be_bytes()).unwrap();

        let mut spool = SpoolFile::open(dir.path()).unwrap();
        assert!(!spool.has_data());
        assert!(spool.read().unwrap().is_none());
    }

    #[test]
    fn truncated_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut spool = SpoolFile::open(dir.path()).unwrap();
            spool.append(b"whole record").unwrap();
        }
        // Chop the record in half.
        let path = dir.path().join(DATA_FILE_NAME);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 4]).unwrap();

        let mut spool = SpoolFile::open(dir.path()).unwrap();
        assert!(matches!(
            spool.read(),
            Err(Error::TruncatedRecord { .. })
        ));
    }
}
