use std::collections::{btree_map, BTreeMap};
use std::ops::RangeBounds;

use super::log::ValueLocation;

/// The in-memory key directory: an ordered map from each live key to the
/// location of its value in the log. Rebuilt by replaying the log on open,
/// purely in-memory afterwards.
#[derive(Debug, Default)]
pub struct KeyDir(BTreeMap<Vec<u8>, ValueLocation>);

impl KeyDir {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Inserts or replaces the location for a key. The key is copied, so the
    /// caller's buffer can be reused.
    pub fn set(&mut self, key: &[u8], location: ValueLocation) {
        self.0.insert(key.to_vec(), location);
    }

    /// Removes a key, if present.
    pub fn delete(&mut self, key: &[u8]) {
        self.0.remove(key);
    }

    /// Looks up the value location for a key.
    pub fn get(&self, key: &[u8]) -> Option<ValueLocation> {
        self.0.get(key).copied()
    }

    /// The number of live keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all entries in ascending key order.
    pub fn iter(&self) -> btree_map::Iter<'_, Vec<u8>, ValueLocation> {
        self.0.iter()
    }

    /// Iterates over the entries within a key range, in ascending key order.
    pub fn range(
        &self,
        range: impl RangeBounds<Vec<u8>>,
    ) -> btree_map::Range<'_, Vec<u8>, ValueLocation> {
        self.0.range(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(offset: u64, len: u32) -> ValueLocation {
        ValueLocation { offset, len }
    }

    #[test]
    fn set_get_delete() {
        let mut keydir = KeyDir::new();
        assert_eq!(keydir.get(b"a"), None);

        keydir.set(b"a", location(8, 3));
        assert_eq!(keydir.get(b"a"), Some(location(8, 3)));
        assert_eq!(keydir.len(), 1);

        // Replacement keeps a single entry.
        keydir.set(b"a", location(20, 5));
        assert_eq!(keydir.get(b"a"), Some(location(20, 5)));
        assert_eq!(keydir.len(), 1);

        keydir.delete(b"a");
        assert_eq!(keydir.get(b"a"), None);
        assert!(keydir.is_empty());

        // Deleting an absent key is a no-op.
        keydir.delete(b"a");
    }

    #[test]
    fn keys_are_copied() {
        let mut keydir = KeyDir::new();
        let mut buffer = b"key".to_vec();
        keydir.set(&buffer, location(8, 1));
        buffer.copy_from_slice(b"xyz");
        assert_eq!(keydir.get(b"key"), Some(location(8, 1)));
        assert_eq!(keydir.get(b"xyz"), None);
    }

    #[test]
    fn iteration_is_ordered() {
        let mut keydir = KeyDir::new();
        for (i, key) in [&b"b"[..], b"aa", b"a", b"c"].iter().enumerate() {
            keydir.set(key, location(i as u64, 1));
        }
        let keys: Vec<_> = keydir.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"aa", b"b", b"c"]);
    }

    #[test]
    fn range_is_half_open() {
        let mut keydir = KeyDir::new();
        for key in [&b"a"[..], b"b", b"c", b"d"] {
            keydir.set(key, location(0, 0));
        }
        let keys: Vec<_> = keydir
            .range(b"b".to_vec()..b"d".to_vec())
            .map(|(k, _)| k.as_slice())
            .collect();
        assert_eq!(keys, vec![b"b".as_slice(), b"c"]);
    }
}
