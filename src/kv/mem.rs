use super::{Backend, Cursor, DatabaseError, KvPair};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    ops::Bound::{Excluded, Included, Unbounded},
};

type BucketMap = BTreeMap<Vec<u8>, Vec<u8>>;
type Buckets = BTreeMap<String, BucketMap>;

static EMPTY_BUCKET: BucketMap = BTreeMap::new();

/// An embedded, bolt-like key-value store: named buckets of sorted byte
/// keys with snapshot reads and all-or-nothing updates.
#[derive(Debug, Default)]
pub struct MemDb {
    buckets: RwLock<Buckets>,
}

impl MemDb {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against a read snapshot.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T, E>) -> Result<T, E> {
        let guard = self.buckets.read();
        f(&ReadTx { buckets: &guard })
    }

    /// Runs `f` against a write transaction. Changes commit when `f`
    /// returns `Ok` and are rolled back otherwise.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T, E>) -> Result<T, E> {
        let mut guard = self.buckets.write();
        let snapshot = guard.clone();
        let result = f(&mut WriteTx { buckets: &mut guard });
        if result.is_err() {
            *guard = snapshot;
        }
        result
    }

    /// Seeds buckets and entries in one committed transaction. Convenience
    /// for tests and fixtures.
    pub fn put_all(&self, bucket: &str, entries: &[(Vec<u8>, Vec<u8>)]) {
        self.update(|tx| -> Result<(), DatabaseError> {
            tx.create_bucket_if_missing(bucket);
            for (key, value) in entries {
                tx.put(bucket, key, value)?;
            }
            Ok(())
        })
        .expect("the bucket was just created");
    }
}

impl Backend for MemDb {
    fn embedded(&self) -> Option<&MemDb> {
        Some(self)
    }
}

/// A read snapshot over the store.
#[derive(Debug)]
pub struct ReadTx<'tx> {
    buckets: &'tx Buckets,
}

impl<'tx> ReadTx<'tx> {
    /// Looks up a bucket by name.
    pub fn bucket(&self, name: &str) -> Option<BucketRef<'tx>> {
        self.buckets.get(name).map(|map| BucketRef { map })
    }

    /// A cursor over the named bucket; a missing bucket reads as empty.
    pub fn cursor(&self, name: &str) -> MemCursor<'tx> {
        let map = self.buckets.get(name).unwrap_or(&EMPTY_BUCKET);
        MemCursor { map, position: Position::Start }
    }
}

/// A handle on one bucket inside a read snapshot.
#[derive(Debug)]
pub struct BucketRef<'tx> {
    map: &'tx BucketMap,
}

impl<'tx> BucketRef<'tx> {
    /// Reads the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<&'tx [u8]> {
        self.map.get(key).map(Vec::as_slice)
    }

    /// The number of entries in the bucket.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// An ordered cursor over the bucket.
    pub fn cursor(&self) -> MemCursor<'tx> {
        MemCursor { map: self.map, position: Position::Start }
    }
}

/// A write transaction over the store.
#[derive(Debug)]
pub struct WriteTx<'tx> {
    buckets: &'tx mut Buckets,
}

impl WriteTx<'_> {
    /// Creates the named bucket unless it already exists. Returns `true`
    /// when the bucket was created.
    pub fn create_bucket_if_missing(&mut self, name: &str) -> bool {
        if self.buckets.contains_key(name) {
            return false
        }
        self.buckets.insert(name.to_owned(), BucketMap::new());
        true
    }

    /// Stores `value` under `key` in the named bucket.
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let map = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| DatabaseError::BucketMissing(bucket.to_owned()))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Removes the entry under `key` in the named bucket.
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<(), DatabaseError> {
        let map = self
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| DatabaseError::BucketMissing(bucket.to_owned()))?;
        map.remove(key);
        Ok(())
    }
}

#[derive(Debug)]
enum Position {
    Start,
    At(Vec<u8>),
    End,
}

/// An ordered cursor over one in-memory bucket.
///
/// Keys and values are copied out on every read; callers own the returned
/// pairs for as long as they need them.
#[derive(Debug)]
pub struct MemCursor<'tx> {
    map: &'tx BucketMap,
    position: Position,
}

impl MemCursor<'_> {
    fn position_at(&mut self, entry: Option<(&Vec<u8>, &Vec<u8>)>) -> Option<KvPair> {
        match entry {
            Some((key, value)) => {
                self.position = Position::At(key.clone());
                Some((key.clone(), value.clone()))
            }
            None => {
                self.position = Position::End;
                None
            }
        }
    }
}

impl Cursor for MemCursor<'_> {
    fn first(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        let entry = self.map.iter().next();
        Ok(self.position_at(entry))
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        let entry = self.map.range::<[u8], _>((Included(key), Unbounded)).next();
        Ok(self.position_at(entry))
    }

    fn next(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        match &self.position {
            Position::Start => self.first(),
            Position::At(current) => {
                let entry =
                    self.map.range::<[u8], _>((Excluded(current.as_slice()), Unbounded)).next();
                Ok(self.position_at(entry))
            }
            Position::End => Ok(None),
        }
    }
}
