//! Multi-version concurrency control on top of a storage engine.
//!
//! Every read-write transaction is assigned a monotonically increasing
//! version number, taken from a persisted counter. Writes store a new
//! version of the key rather than replacing it, with deletes writing a
//! version tombstone, so the full history of every key remains available.
//!
//! Transactions see a consistent snapshot: versions assigned after the
//! transaction began are invisible, as are versions belonging to
//! transactions that were still in flight at begin time (the active set,
//! captured when the transaction starts). A read-write transaction sees its
//! own writes; a read-only transaction observes the state strictly before
//! its version. Two concurrent writers of the same key conflict, and the
//! loser must retry.
//!
//! Each read-write transaction leaves a marker in the engine while it is in
//! flight, and persists a snapshot of the active set it observed at begin.
//! The marker is removed at commit or rollback; the snapshot is kept
//! forever, so a historical read at any version can reconstruct exactly the
//! view that version's transaction had. Old versions are never garbage
//! collected.
//!
//! The MVCC layer partitions the engine keyspace with a one-byte tag
//! prefix; see [`Key`]. It assumes nothing about the engine other than the
//! ordered byte-map contract, so it runs unchanged over the log-backed and
//! in-memory engines.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Bound, RangeBounds};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::errdata;
use crate::errinput;
use crate::error::{Error, Result};

use super::Engine;

/// A logical version number, assigned to each read-write transaction in
/// begin order. Version 0 means "before any transaction".
pub type Version = u64;

/// Keyspace tags. The engine orders keys lexicographically, so the tag
/// groups each kind of key into its own contiguous region.
const NEXT_VERSION: u8 = 0x00;
const TXN_ACTIVE: u8 = 0x01;
const TXN_ACTIVE_SNAPSHOT: u8 = 0x02;
const TXN_WRITE: u8 = 0x03;
const VERSION: u8 = 0x04;
const UNVERSIONED: u8 = 0x05;

/// Keys written to the engine by the MVCC layer. Each encodes to its tag
/// byte followed by fixed-layout big-endian fields.
#[derive(Debug, PartialEq)]
enum Key {
    /// The next version to assign, as a big-endian u64 value. Missing means
    /// the store has never seen a read-write transaction.
    NextVersion,
    /// Marker for an in-flight read-write transaction, deleted at commit or
    /// rollback. The value is empty.
    TxnActive(Version),
    /// The set of transactions that were active when this version began.
    /// Only written when that set is non-empty, and never deleted, since
    /// historical reads at this version need it.
    TxnActiveSnapshot(Version),
    /// A key written by an in-flight transaction, recorded so a rollback
    /// can find and undo its versioned writes.
    TxnWrite(Version, Vec<u8>),
    /// A versioned user key. The value is a bincode-encoded Option, with
    /// None marking a deletion.
    Version(Vec<u8>, Version),
    /// An unversioned user key, outside transactional control. Used for
    /// system metadata.
    Unversioned(Vec<u8>),
}

impl Key {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::NextVersion => vec![NEXT_VERSION],
            Self::TxnActive(version) => tag_version(TXN_ACTIVE, *version),
            Self::TxnActiveSnapshot(version) => tag_version(TXN_ACTIVE_SNAPSHOT, *version),
            Self::TxnWrite(version, key) => {
                let mut bytes = tag_version(TXN_WRITE, *version);
                bytes.extend_from_slice(key);
                bytes
            }
            Self::Version(key, version) => {
                let mut bytes = Vec::with_capacity(9 + key.len());
                bytes.push(VERSION);
                bytes.extend_from_slice(key);
                bytes.extend_from_slice(&version.to_be_bytes());
                bytes
            }
            Self::Unversioned(key) => {
                let mut bytes = Vec::with_capacity(1 + key.len());
                bytes.push(UNVERSIONED);
                bytes.extend_from_slice(key);
                bytes
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((&tag, rest)) = bytes.split_first() else {
            return errdata!("empty mvcc key");
        };
        match tag {
            NEXT_VERSION if rest.is_empty() => Ok(Self::NextVersion),
            TXN_ACTIVE => Ok(Self::TxnActive(decode_version(rest)?)),
            TXN_ACTIVE_SNAPSHOT => Ok(Self::TxnActiveSnapshot(decode_version(rest)?)),
            TXN_WRITE if rest.len() > 8 => Ok(Self::TxnWrite(
                decode_version(&rest[..8])?,
                rest[8..].to_vec(),
            )),
            VERSION if rest.len() > 8 => {
                let (key, version) = rest.split_at(rest.len() - 8);
                Ok(Self::Version(key.to_vec(), decode_version(version)?))
            }
            UNVERSIONED if !rest.is_empty() => Ok(Self::Unversioned(rest.to_vec())),
            _ => errdata!("invalid mvcc key {bytes:x?}"),
        }
    }
}

fn tag_version(tag: u8, version: Version) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(9);
    bytes.push(tag);
    bytes.extend_from_slice(&version.to_be_bytes());
    bytes
}

fn decode_version(bytes: &[u8]) -> Result<Version> {
    match <[u8; 8]>::try_from(bytes) {
        Ok(bytes) => Ok(Version::from_be_bytes(bytes)),
        Err(_) => errdata!("invalid version length {}", bytes.len()),
    }
}

/// Encodes an active-version set as a big-endian count followed by the
/// versions in ascending order. The empty set encodes to no bytes.
fn encode_active(active: &BTreeSet<Version>) -> Vec<u8> {
    if active.is_empty() {
        return Vec::new();
    }
    let mut bytes = Vec::with_capacity(4 + 8 * active.len());
    bytes.extend_from_slice(&(active.len() as u32).to_be_bytes());
    for version in active {
        bytes.extend_from_slice(&version.to_be_bytes());
    }
    bytes
}

/// Decodes an active-version set. Tolerates a truncated tail: decoding
/// stops at the last complete version, without error.
fn decode_active(bytes: &[u8]) -> BTreeSet<Version> {
    let mut active = BTreeSet::new();
    if bytes.len() < 4 {
        return active;
    }
    let mut count = [0; 4];
    count.copy_from_slice(&bytes[..4]);
    for chunk in bytes[4..]
        .chunks_exact(8)
        .take(u32::from_be_bytes(count) as usize)
    {
        let mut version = [0; 8];
        version.copy_from_slice(chunk);
        active.insert(Version::from_be_bytes(version));
    }
    active
}

/// An MVCC coordinator, layering transactions over a storage engine. The
/// engine is behind a mutex shared with all transaction handles: engine
/// operations require exclusive access, and taking the lock at begin is the
/// serialization point for version assignment.
pub struct Mvcc<E: Engine> {
    engine: Arc<Mutex<E>>,
}

impl<E: Engine> Clone for Mvcc<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: Engine> Mvcc<E> {
    /// Creates a new MVCC coordinator over the given engine.
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Begins a new read-write transaction at a fresh version.
    pub fn begin(&self) -> Result<Transaction<E>> {
        Transaction::begin(self.engine.clone())
    }

    /// Begins a read-only transaction at the latest committed state.
    pub fn begin_read_only(&self) -> Result<Transaction<E>> {
        Transaction::begin_read_only(self.engine.clone())
    }

    /// Begins a read-only transaction as of a historical version,
    /// reproducing the view the read-write transaction at that version had
    /// when it began.
    pub fn begin_as_of(&self, version: Version) -> Result<Transaction<E>> {
        Transaction::begin_as_of(self.engine.clone(), version)
    }

    /// Reconstructs a transaction from state persisted elsewhere, e.g.
    /// handed off across a process restart. Does not access the engine.
    pub fn resume(&self, state: TransactionState) -> Transaction<E> {
        Transaction::resume(self.engine.clone(), state)
    }

    /// Fetches an unversioned key, outside transactional control.
    pub fn get_unversioned(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine
            .lock()?
            .get(&Key::Unversioned(key.to_vec()).encode())
    }

    /// Sets an unversioned key, outside transactional control.
    pub fn set_unversioned(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.engine
            .lock()?
            .set(&Key::Unversioned(key.to_vec()).encode(), value)
    }

    /// Flushes the underlying engine. Transaction commits are not durable
    /// until the engine has been flushed.
    pub fn flush(&self) -> Result<()> {
        self.engine.lock()?.flush()
    }

    /// Returns MVCC and engine status.
    pub fn status(&self) -> Result<Status> {
        let mut engine = self.engine.lock()?;
        let versions = match engine.get(&Key::NextVersion.encode())? {
            Some(ref bytes) => decode_version(bytes)? - 1,
            None => 0,
        };
        let active_txns = Transaction::scan_active(&mut engine)?.len() as u64;
        Ok(Status {
            versions,
            active_txns,
            storage: engine.status()?,
        })
    }
}

/// MVCC status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The number of versions assigned, i.e. read-write transactions begun.
    pub versions: u64,
    /// The number of read-write transactions currently in flight.
    pub active_txns: u64,
    /// The status of the underlying storage engine.
    pub storage: super::Status,
}

/// A transaction's state: its version, mode, and the set of transactions
/// that were in flight when it began. Immutable once constructed. Separate
/// from the handle so it can be exported, persisted externally, and later
/// passed to resume().
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    /// The version this transaction runs at. Only one read-write
    /// transaction ever runs at a given version.
    pub version: Version,
    /// Whether the transaction is read-only.
    pub read_only: bool,
    /// The versions of read-write transactions that were in flight when
    /// this one began. Their writes are invisible even though their
    /// versions are older.
    pub active: BTreeSet<Version>,
}

impl TransactionState {
    /// Whether the given version is visible to this transaction.
    ///
    /// A version belonging to the active set is never visible. Beyond that,
    /// a read-write transaction sees versions up to and including its own
    /// (it must see its own writes), while a read-only transaction sees
    /// only versions strictly before its version, so that its view stays
    /// stable when the writer owning that version commits.
    pub fn is_visible(&self, version: Version) -> bool {
        if self.active.contains(&version) {
            false
        } else if self.read_only {
            version < self.version
        } else {
            version <= self.version
        }
    }
}

/// An MVCC transaction handle.
pub struct Transaction<E: Engine> {
    /// The engine, shared with the coordinator and all other transactions.
    engine: Arc<Mutex<E>>,
    /// The transaction state.
    st: TransactionState,
}

impl<E: Engine> Transaction<E> {
    /// Begins a read-write transaction: allocates a version from the
    /// persisted counter, captures the active set, persists the set as this
    /// version's snapshot if non-empty, and registers the active marker.
    fn begin(engine: Arc<Mutex<E>>) -> Result<Self> {
        let mut session = engine.lock()?;

        let version = match session.get(&Key::NextVersion.encode())? {
            Some(ref bytes) => decode_version(bytes)?,
            None => 1,
        };
        session.set(
            &Key::NextVersion.encode(),
            (version + 1).to_be_bytes().to_vec(),
        )?;

        let active = Self::scan_active(&mut session)?;
        if !active.is_empty() {
            session.set(
                &Key::TxnActiveSnapshot(version).encode(),
                encode_active(&active),
            )?;
        }
        session.set(&Key::TxnActive(version).encode(), Vec::new())?;
        drop(session);

        Ok(Self {
            engine,
            st: TransactionState {
                version,
                read_only: false,
                active,
            },
        })
    }

    /// Begins a read-only transaction at the version before the next
    /// assigned one, with the current active set. Persists nothing.
    fn begin_read_only(engine: Arc<Mutex<E>>) -> Result<Self> {
        let mut session = engine.lock()?;

        let version = match session.get(&Key::NextVersion.encode())? {
            Some(ref bytes) => decode_version(bytes)? - 1,
            None => 0,
        };
        let active = Self::scan_active(&mut session)?;
        drop(session);

        Ok(Self {
            engine,
            st: TransactionState {
                version,
                read_only: true,
                active,
            },
        })
    }

    /// Begins a read-only transaction pinned to a past version, restoring
    /// the active-set snapshot persisted when that version began. A version
    /// with no snapshot record had no concurrent transactions.
    fn begin_as_of(engine: Arc<Mutex<E>>, version: Version) -> Result<Self> {
        let mut session = engine.lock()?;
        let active = match session.get(&Key::TxnActiveSnapshot(version).encode())? {
            Some(ref bytes) => decode_active(bytes),
            None => BTreeSet::new(),
        };
        drop(session);

        Ok(Self {
            engine,
            st: TransactionState {
                version,
                read_only: true,
                active,
            },
        })
    }

    /// Reconstructs a transaction from exported state.
    fn resume(engine: Arc<Mutex<E>>, st: TransactionState) -> Self {
        Self { engine, st }
    }

    /// Scans the engine for active-transaction markers. Keys under the tag
    /// that don't decode as markers are ignored.
    fn scan_active(session: &mut MutexGuard<'_, E>) -> Result<BTreeSet<Version>> {
        let mut active = BTreeSet::new();
        let mut scan = session.scan_prefix(&[TXN_ACTIVE]);
        while let Some((key, _)) = scan.next().transpose()? {
            if let Ok(Key::TxnActive(version)) = Key::decode(&key) {
                active.insert(version);
            }
        }
        Ok(active)
    }

    /// The version the transaction runs at.
    pub fn version(&self) -> Version {
        self.st.version
    }

    /// Whether the transaction is read-only.
    pub fn read_only(&self) -> bool {
        self.st.read_only
    }

    /// The transaction's state, from which resume() can reconstruct a
    /// functionally identical transaction.
    pub fn state(&self) -> &TransactionState {
        &self.st
    }

    /// Commits the transaction by removing its active marker, making its
    /// writes visible to transactions that begin afterwards. Its write
    /// records are no longer needed and are removed too. Durability is
    /// contingent on the engine being flushed. Read-only transactions are
    /// no-ops.
    pub fn commit(self) -> Result<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut session = self.engine.lock()?;
        let remove: Vec<Vec<u8>> = session
            .scan_prefix(&Key::TxnWrite(self.st.version, Vec::new()).encode())
            .map(|r| r.map(|(key, _)| key))
            .collect::<Result<_>>()?;
        for key in remove {
            session.delete(&key)?;
        }
        session.delete(&Key::TxnActive(self.st.version).encode())
    }

    /// Rolls back the transaction: undoes every versioned write recorded in
    /// its write set, then removes the active marker. The active-set
    /// snapshot is left behind, since historical reads at this version need
    /// it. Read-only transactions are no-ops.
    pub fn rollback(self) -> Result<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut session = self.engine.lock()?;
        let mut remove = Vec::new();
        let mut scan = session.scan_prefix(&Key::TxnWrite(self.st.version, Vec::new()).encode());
        while let Some((key, _)) = scan.next().transpose()? {
            match Key::decode(&key)? {
                Key::TxnWrite(_, user_key) => {
                    remove.push(Key::Version(user_key, self.st.version).encode());
                }
                key => return errdata!("expected TxnWrite key, got {key:?}"),
            }
            remove.push(key);
        }
        drop(scan);
        for key in remove {
            session.delete(&key)?;
        }
        session.delete(&Key::TxnActive(self.st.version).encode())
    }

    /// Deletes a key, by writing a version tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_version(key, None)
    }

    /// Sets a value for a key.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.write_version(key, Some(value))
    }

    /// Writes a new version of a key at the transaction's version, with
    /// None as a deletion tombstone. Fails with Error::Serialization if the
    /// key's latest version is invisible to this transaction (a concurrent
    /// or newer writer): only the latest version can conflict, since every
    /// writer maintains this check. Replacing the transaction's own
    /// uncommitted write is fine.
    fn write_version(&self, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        if self.st.read_only {
            return Err(Error::ReadOnly);
        }
        if key.is_empty() {
            return errinput!("key is empty");
        }
        let mut session = self.engine.lock()?;

        // Conflicts can only come from versions at or above the oldest
        // active transaction (everything older is committed and visible).
        let conflict_from = self
            .st
            .active
            .first()
            .copied()
            .unwrap_or(self.st.version + 1);
        if let Some(version) =
            Self::latest_version(&mut session, key, conflict_from, Version::MAX)?
        {
            if !self.st.is_visible(version) {
                return Err(Error::Serialization);
            }
        }

        session.set(
            &Key::TxnWrite(self.st.version, key.to_vec()).encode(),
            Vec::new(),
        )?;
        session.set(
            &Key::Version(key.to_vec(), self.st.version).encode(),
            encoding::serialize(&value),
        )
    }

    /// Fetches the value of a key at the newest version visible to the
    /// transaction, or None if the key is absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return errinput!("key is empty");
        }
        let mut session = self.engine.lock()?;
        let from = Key::Version(key.to_vec(), 0).encode();
        let to = Key::Version(key.to_vec(), self.st.version).encode();

        let mut value = None;
        let mut scan = session.scan(from..=to);
        while let Some((k, v)) = scan.next().transpose()? {
            match Key::decode(&k)? {
                // The version range can contain other keys that sort inside
                // it; skip them, and keep the latest visible version.
                Key::Version(user_key, version) => {
                    if user_key == key && self.st.is_visible(version) {
                        value = Some(v);
                    }
                }
                k => return errdata!("expected versioned key, got {k:?}"),
            }
        }

        match value {
            Some(value) => encoding::deserialize(&value),
            None => Ok(None),
        }
    }

    /// Returns the latest stored version of a key within [from, to], or
    /// None if the key has no version there, regardless of visibility.
    fn latest_version(
        session: &mut MutexGuard<'_, E>,
        key: &[u8],
        from: Version,
        to: Version,
    ) -> Result<Option<Version>> {
        let from = Key::Version(key.to_vec(), from).encode();
        let to = Key::Version(key.to_vec(), to).encode();

        let mut latest = None;
        let mut scan = session.scan(from..=to);
        while let Some((k, _)) = scan.next().transpose()? {
            match Key::decode(&k)? {
                Key::Version(user_key, version) if user_key == key => latest = Some(version),
                Key::Version(..) => {}
                k => return errdata!("expected versioned key, got {k:?}"),
            }
        }
        Ok(latest)
    }

    /// Scans the latest visible live value of every key in the given range,
    /// materialized as a snapshot at call time.
    pub fn scan(&self, range: impl RangeBounds<Vec<u8>>) -> Result<Scan> {
        let start = range.start_bound().cloned();
        let end = range.end_bound().cloned();

        let from = match &start {
            Bound::Included(key) => Bound::Included(Key::Version(key.clone(), 0).encode()),
            Bound::Excluded(key) => {
                Bound::Excluded(Key::Version(key.clone(), Version::MAX).encode())
            }
            Bound::Unbounded => Bound::Included(vec![VERSION]),
        };
        let to = match &end {
            Bound::Included(key) => {
                Bound::Included(Key::Version(key.clone(), Version::MAX).encode())
            }
            Bound::Excluded(key) => Bound::Excluded(Key::Version(key.clone(), 0).encode()),
            Bound::Unbounded => Bound::Excluded(vec![UNVERSIONED]),
        };

        let mut session = self.engine.lock()?;

        // For each user key, ascending versions arrive in order, so a plain
        // insert leaves the latest visible one. Raw key order can interleave
        // keys of different lengths inside the encoded range, so decoded
        // keys are checked against the user range.
        let mut visible = BTreeMap::<Vec<u8>, Option<Vec<u8>>>::new();
        let mut scan = session.scan((from, to));
        while let Some((k, v)) = scan.next().transpose()? {
            match Key::decode(&k)? {
                Key::Version(user_key, version) => {
                    if range_contains(&start, &end, &user_key) && self.st.is_visible(version) {
                        visible.insert(user_key, encoding::deserialize(&v)?);
                    }
                }
                k => return errdata!("expected versioned key, got {k:?}"),
            }
        }

        Ok(Scan {
            inner: visible
                .into_iter()
                .filter_map(|(key, value)| value.map(|value| (key, value)))
                .collect::<Vec<_>>()
                .into_iter(),
        })
    }
}

fn range_contains(start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    (match start {
        Bound::Included(s) => key >= s.as_slice(),
        Bound::Excluded(s) => key > s.as_slice(),
        Bound::Unbounded => true,
    }) && (match end {
        Bound::Included(e) => key <= e.as_slice(),
        Bound::Excluded(e) => key < e.as_slice(),
        Bound::Unbounded => true,
    })
}

/// The result of a transaction scan: the visible key-value pairs in the
/// range, in ascending key order, snapshotted when the scan was made.
/// Mutations made after the scan are not reflected.
pub struct Scan {
    inner: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Scan {
    /// Collects the remaining results to a vector.
    pub fn to_vec(self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner.collect()
    }
}

impl Iterator for Scan {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
