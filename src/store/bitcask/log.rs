use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::flock::FileLock;

use super::keydir::KeyDir;

/// The location of a value in the log file. Tombstones have no location and
/// are never stored in the key directory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ValueLocation {
    /// File offset of the first value byte.
    pub offset: u64,
    /// Value length in bytes.
    pub len: u32,
}

impl ValueLocation {
    /// The file offset just past the value.
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// An append-only log file of key-value records, with a sibling `.lock`
/// file held for the lifetime of the log.
///
/// Each record is unframed and unchecksummed, with big-endian fields:
///
/// ```text
/// | key_len: u32 | value_len: i32 | key | value (if value_len >= 0) |
/// ```
///
/// A value length of -1 marks a tombstone, with no value bytes following.
/// The file position is not relied on between operations: every read seeks
/// to its location, every write seeks to the end.
pub struct Log {
    pub(super) file: File,
    pub(super) path: PathBuf,
    pub(super) lock: FileLock,
}

impl Log {
    /// Opens the log file, creating it and its parent directories if
    /// necessary, and acquires its advisory lock. Fails with Error::Locked
    /// if another process holds the lock.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let lock = FileLock::lock(sibling(path, ".lock")).map_err(|err| {
            if err.kind() == ErrorKind::WouldBlock {
                Error::Locked(format!("{} is in use by another process", path.display()))
            } else {
                Error::from(err)
            }
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            lock,
        })
    }

    /// Replays the log from the start, building the key directory: live
    /// records insert their key, tombstones delete it. A record whose header
    /// or body runs past the end of the file is assumed to be a torn write
    /// from a crash; the file is truncated at the start of the torn record
    /// and the replay ends. Recovery is idempotent.
    pub fn build_keydir(&mut self) -> Result<KeyDir> {
        let file_len = self.file.metadata()?.len();
        let mut keydir = KeyDir::new();
        let mut truncate_at = None;

        let mut reader = BufReader::new(&mut self.file);
        let mut offset = reader.seek(SeekFrom::Start(0))?;

        while offset < file_len {
            // Reads the record at offset, returning the key and the value
            // location (None for tombstones). Signals a torn record with
            // ErrorKind::UnexpectedEof.
            let result = (|| -> std::io::Result<(Vec<u8>, Option<ValueLocation>)> {
                let key_len = reader.read_u32::<BigEndian>()?;
                let value_len = reader.read_i32::<BigEndian>()?;
                let location = (value_len >= 0).then_some(ValueLocation {
                    offset: offset + 8 + key_len as u64,
                    len: value_len as u32,
                });

                let mut key = vec![0; key_len as usize];
                reader.read_exact(&mut key)?;

                if let Some(location) = location {
                    if location.end() > file_len {
                        return Err(std::io::Error::from(ErrorKind::UnexpectedEof));
                    }
                    reader.seek_relative(location.len as i64)?;
                }
                Ok((key, location))
            })();

            match result {
                Ok((key, Some(location))) => {
                    keydir.set(&key, location);
                    offset = location.end();
                }
                Ok((key, None)) => {
                    keydir.delete(&key);
                    offset += 8 + key.len() as u64;
                }
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    truncate_at = Some(offset);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(offset) = truncate_at {
            tracing::warn!(offset, "found incomplete log entry, truncating file");
            self.file.set_len(offset)?;
        }

        Ok(keydir)
    }

    /// Reads a value from the log at the given location.
    pub fn read_value(&self, location: ValueLocation) -> Result<Vec<u8>> {
        let mut value = vec![0; location.len as usize];
        let mut file = &self.file;
        file.seek(SeekFrom::Start(location.offset))?;
        file.read_exact(&mut value).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::InvalidData(format!(
                    "short read of {} bytes at offset {}",
                    location.len, location.offset
                ))
            } else {
                Error::from(err)
            }
        })?;
        Ok(value)
    }

    /// Appends a record to the log, flushing the write buffer. A None value
    /// writes a tombstone. Returns the location of the value region, with
    /// length 0 for tombstones.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<ValueLocation> {
        let record_len = 8 + key.len() + value.map_or(0, <[u8]>::len);
        let offset = self.file.seek(SeekFrom::End(0))?;

        let mut writer = BufWriter::with_capacity(record_len, &mut self.file);
        writer.write_u32::<BigEndian>(key.len() as u32)?;
        writer.write_i32::<BigEndian>(value.map_or(-1, |v| v.len() as i32))?;
        writer.write_all(key)?;
        if let Some(value) = value {
            writer.write_all(value)?;
        }
        writer.flush()?;

        Ok(ValueLocation {
            offset: offset + 8 + key.len() as u64,
            len: value.map_or(0, |v| v.len() as u32),
        })
    }

    /// Flushes OS buffers to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all()?)
    }

    /// The current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Appends a suffix to a path, e.g. `db` -> `db.lock`.
pub(super) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut path = path.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log(dir: &tempfile::TempDir) -> Result<Log> {
        Log::open(&dir.path().join("db"))
    }

    #[test]
    fn write_and_read_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir)?;

        let a = log.write_entry(b"a", Some(b"first"))?;
        let b = log.write_entry(b"bb", Some(b"second"))?;
        assert_eq!(a, ValueLocation { offset: 9, len: 5 });
        assert_eq!(b, ValueLocation { offset: 24, len: 6 });

        assert_eq!(log.read_value(a)?, b"first");
        assert_eq!(log.read_value(b)?, b"second");
        Ok(())
    }

    #[test]
    fn record_bytes_on_disk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir)?;

        log.write_entry(b"k", Some(b"v"))?;
        log.write_entry(b"k", None)?;
        log.sync()?;

        // A live record followed by a tombstone with value_len 0xffffffff.
        let bytes = fs::read(&log.path)?;
        assert_eq!(
            bytes,
            [
                0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, b'k', b'v', // k=v
                0x00, 0x00, 0x00, 0x01, 0xff, 0xff, 0xff, 0xff, b'k', // tombstone
            ]
        );
        Ok(())
    }

    #[test]
    fn replay_builds_keydir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");

        {
            let mut log = Log::open(&path)?;
            log.write_entry(b"a", Some(b"1"))?;
            log.write_entry(b"b", Some(b"2"))?;
            log.write_entry(b"a", Some(b"override"))?;
            log.write_entry(b"b", None)?;
            log.sync()?;
        }

        let mut log = Log::open(&path)?;
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 1);
        let location = keydir.get(b"a").expect("a should be live");
        assert_eq!(log.read_value(location)?, b"override");
        assert_eq!(keydir.get(b"b"), None);
        Ok(())
    }

    #[test]
    fn replay_truncates_torn_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");

        {
            let mut log = Log::open(&path)?;
            log.write_entry(b"a", Some(b"1"))?;
            log.write_entry(b"b", Some(b"2"))?;
            // A torn record: a header claiming a 2-byte key and a 2-byte
            // value, followed by a single key byte.
            log.file.seek(SeekFrom::End(0))?;
            log.file
                .write_all(&[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02, b'j'])?;
            log.sync()?;
            assert_eq!(log.size()?, 29);
        }

        let mut log = Log::open(&path)?;
        let keydir = log.build_keydir()?;
        assert_eq!(keydir.len(), 2);
        assert_eq!(log.read_value(keydir.get(b"a").unwrap())?, b"1");
        assert_eq!(log.read_value(keydir.get(b"b").unwrap())?, b"2");

        // The file ends exactly where the torn record began, and recovery
        // is idempotent across another reopen.
        assert_eq!(log.size()?, 20);
        drop(log);
        let mut log = Log::open(&path)?;
        assert_eq!(log.build_keydir()?.len(), 2);
        assert_eq!(log.size()?, 20);
        Ok(())
    }

    #[test]
    fn replay_truncates_torn_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");

        {
            let mut log = Log::open(&path)?;
            log.write_entry(b"a", Some(b"1"))?;
            // Half a header.
            log.file.seek(SeekFrom::End(0))?;
            log.file.write_all(&[0x00, 0x00, 0x00])?;
            log.sync()?;
        }

        let mut log = Log::open(&path)?;
        assert_eq!(log.build_keydir()?.len(), 1);
        assert_eq!(log.size()?, 10);
        Ok(())
    }

    #[test]
    fn short_value_read_is_invalid_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = open_log(&dir)?;
        log.write_entry(b"a", Some(b"1"))?;

        let result = log.read_value(ValueLocation { offset: 9, len: 100 });
        assert!(matches!(result, Err(Error::InvalidData(_))));
        Ok(())
    }

    #[test]
    fn open_locks_out_other_instances() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");

        let log = Log::open(&path)?;
        assert!(matches!(Log::open(&path), Err(Error::Locked(_))));

        drop(log);
        Log::open(&path)?;
        Ok(())
    }

    #[test]
    fn open_creates_parent_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("dirs").join("db");
        Log::open(&path)?;
        assert!(path.exists());
        Ok(())
    }
}
