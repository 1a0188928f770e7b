use std::collections::{btree_map, BTreeMap};
use std::ops::RangeBounds;

use crate::errinput;
use crate::error::Result;

use super::{Engine, Status};

/// An in-memory storage engine using a B-tree map. Data is not persisted.
/// Used as the substrate for MVCC tests, and wherever durability is not
/// needed.
#[derive(Default)]
pub struct Memory {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl Engine for Memory {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        Ok(self.data.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn scan(&mut self, range: impl RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator {
            inner: self
                .data
                .range((range.start_bound().cloned(), range.end_bound().cloned())),
        }
    }

    fn status(&mut self) -> Result<Status> {
        let size = self
            .data
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size,
            disk_size: 0,
            live_disk_size: 0,
        })
    }
}

pub struct ScanIterator<'a> {
    inner: btree_map::Range<'a, Vec<u8>, Vec<u8>>,
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, v)| Ok((k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() -> Result<()> {
        let mut engine = Memory::new();

        engine.set(b"a", vec![1])?;
        engine.set(b"b", vec![2])?;
        assert_eq!(engine.get(b"a")?, Some(vec![1]));
        assert_eq!(engine.get(b"b")?, Some(vec![2]));
        assert_eq!(engine.get(b"c")?, None);

        // Last write wins.
        engine.set(b"a", vec![9])?;
        assert_eq!(engine.get(b"a")?, Some(vec![9]));

        // Deletes remove the key, and are idempotent.
        engine.delete(b"a")?;
        assert_eq!(engine.get(b"a")?, None);
        engine.delete(b"a")?;
        engine.delete(b"missing")?;

        Ok(())
    }

    #[test]
    fn empty_keys_are_rejected() {
        let mut engine = Memory::new();
        assert!(engine.set(b"", vec![1]).is_err());
        assert!(engine.get(b"").is_err());
        assert!(engine.delete(b"").is_err());
    }

    #[test]
    fn scan_is_ordered_and_half_open() -> Result<()> {
        let mut engine = Memory::new();
        for key in [b"b", b"a", b"d", b"c"] {
            engine.set(key, key.to_vec())?;
        }

        let all: Vec<_> = engine.scan(..).collect::<Result<_>>()?;
        assert_eq!(
            all.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            vec![b"a", b"b", b"c", b"d"]
        );

        // [start, end) excludes the end key.
        let range: Vec<_> = engine
            .scan(b"b".to_vec()..b"d".to_vec())
            .collect::<Result<_>>()?;
        assert_eq!(
            range.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            vec![b"b", b"c"]
        );

        Ok(())
    }

    #[test]
    fn scan_prefix() -> Result<()> {
        let mut engine = Memory::new();
        for key in [&b"a/1"[..], b"a/2", b"b/1", b"a"] {
            engine.set(key, key.to_vec())?;
        }

        let result: Vec<_> = engine.scan_prefix(b"a/").collect::<Result<_>>()?;
        assert_eq!(
            result.iter().map(|(k, _)| k.as_slice()).collect::<Vec<_>>(),
            vec![b"a/1", b"a/2"]
        );

        Ok(())
    }

    #[test]
    fn status_counts_keys_and_size() -> Result<()> {
        let mut engine = Memory::new();
        engine.set(b"foo", vec![1, 2, 3])?;
        engine.set(b"b", vec![])?;

        let status = engine.status()?;
        assert_eq!(status.name, "memory");
        assert_eq!(status.keys, 2);
        assert_eq!(status.size, 7);
        assert_eq!(status.disk_size, 0);
        assert_eq!(status.live_disk_size, 0);

        Ok(())
    }
}
