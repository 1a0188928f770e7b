mod keydir;
mod log;

use std::collections::btree_map;
use std::fs;
use std::ops::RangeBounds;
use std::path::PathBuf;

use crate::config::BitcaskConfig;
use crate::errinput;
use crate::error::Result;

use keydir::KeyDir;
use log::{sibling, Log};

use super::{Engine, Status};

/// A Bitcask-style storage engine: a single append-only log file paired
/// with an in-memory key directory mapping each live key to the location of
/// its latest value in the log. Deletes append a tombstone record. The log
/// is rewritten by explicit compaction, which drops superseded records and
/// tombstones.
///
/// The key directory is rebuilt by replaying the log on open, truncating
/// any incomplete record left by a torn write at the tail.
pub struct Bitcask {
    log: Log,
    keydir: KeyDir,
    sync_every_write: bool,
}

impl Bitcask {
    /// Opens or creates a Bitcask database with the default configuration.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(BitcaskConfig::new(path))
    }

    /// Opens or creates a Bitcask database with the given configuration,
    /// compacting on open if the configured garbage threshold is exceeded.
    pub fn open_with_config(config: BitcaskConfig) -> Result<Self> {
        let mut log = Log::open(&config.path)?;
        let keydir = log.build_keydir()?;
        tracing::info!(
            path = %config.path.display(),
            keys = keydir.len(),
            "opened database"
        );

        let mut engine = Self {
            log,
            keydir,
            sync_every_write: config.sync_every_write,
        };

        if let Some(fraction) = config.compact_min_garbage_fraction {
            let status = engine.status()?;
            let garbage = status.garbage_disk_size();
            if garbage > 0 && status.garbage_disk_percent() >= fraction * 100.0 {
                tracing::info!(garbage, "compacting database on open");
                engine.compact()?;
            }
        }

        Ok(engine)
    }

    /// Compacts the log by writing all live entries, in key order, to a
    /// sibling `<path>.new` file, then atomically renaming it over the
    /// original. The rename is the commit point: a failure before it leaves
    /// the original log untouched. The open descriptor of the new log stays
    /// valid across the rename, and it inherits the original advisory lock.
    pub fn compact(&mut self) -> Result<()> {
        let (mut new_log, new_keydir) = self.write_log(sibling(&self.log.path, ".new"))?;

        fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();
        std::mem::swap(&mut new_log.lock, &mut self.log.lock);

        // Dropping the old log releases the `.new` lock it now holds.
        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes all live entries to a new log file at the given path,
    /// returning it together with its key directory.
    fn write_log(&mut self, path: PathBuf) -> Result<(Log, KeyDir)> {
        let mut new_log = Log::open(&path)?;
        // A previous crashed compaction may have left data behind.
        new_log.file.set_len(0)?;

        let mut new_keydir = KeyDir::new();
        for (key, &location) in self.keydir.iter() {
            let value = self.log.read_value(location)?;
            let new_location = new_log.write_entry(key, Some(&value))?;
            new_keydir.set(key, new_location);
        }
        new_log.sync()?;

        Ok((new_log, new_keydir))
    }

    fn maybe_sync(&mut self) -> Result<()> {
        if self.sync_every_write {
            self.log.sync()?;
        }
        Ok(())
    }
}

impl Drop for Bitcask {
    /// Attempt to flush the file on drop; the advisory lock and file handle
    /// are released with the log.
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            tracing::error!(%error, "failed to flush database file");
        }
    }
}

impl Engine for Bitcask {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        // The tombstone is appended even if the key does not exist, so the
        // delete survives replay regardless of what earlier records say.
        self.log.write_entry(key, None)?;
        self.keydir.delete(key);
        self.maybe_sync()
    }

    fn flush(&mut self) -> Result<()> {
        self.log.sync()
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        self.keydir
            .get(key)
            .map(|location| self.log.read_value(location))
            .transpose()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        let location = self.log.write_entry(key, Some(&value))?;
        self.keydir.set(key, location);
        self.maybe_sync()
    }

    fn scan(&mut self, range: impl RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator {
            inner: self
                .keydir
                .range((range.start_bound().cloned(), range.end_bound().cloned())),
            log: &self.log,
        }
    }

    fn status(&mut self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .map(|(key, location)| key.len() as u64 + location.len as u64)
            .sum::<u64>();
        Ok(Status {
            name: "bitcask".to_string(),
            keys,
            size,
            disk_size: self.log.size()?,
            // Each live record carries an 8-byte header.
            live_disk_size: size + 8 * keys,
        })
    }
}

/// A cursor over a range of the key directory, reading each value lazily
/// from the log. The iterator borrows the engine, so the directory cannot
/// change underneath it during iteration.
pub struct ScanIterator<'a> {
    inner: btree_map::Range<'a, Vec<u8>, log::ValueLocation>,
    log: &'a Log,
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(key, &location)| Ok((key.clone(), self.log.read_value(location)?)))
    }
}
