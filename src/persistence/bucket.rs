//! Per-shard ordered key-value store with transactional cursors.
//!
//! One `Bucket` backs one shard. Keys are raw byte sequences in
//! lexicographic order. Read-only transactions run concurrently; exclusive
//! transactions serialize with each other on the same bucket and roll the
//! tree back if the transaction body fails, so callers never observe a
//! partially applied mutation.

use crate::persistence::PersistenceError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

/// Shard-local ordered store. Cloning shares the underlying tree, so a
/// restarted engine can be pointed at the same buckets.
#[derive(Clone, Default)]
pub struct Bucket {
    tree: Arc<RwLock<Tree>>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execute_in_readonly_transaction<R>(
        &self,
        f: impl FnOnce(&ReadTransaction<'_>) -> Result<R, PersistenceError>,
    ) -> Result<R, PersistenceError> {
        let guard = self.tree.read();
        let txn = ReadTransaction { tree: &*guard };
        f(&txn)
    }

    pub fn execute_in_exclusive_transaction<R>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> Result<R, PersistenceError>,
    ) -> Result<R, PersistenceError> {
        let mut guard = self.tree.write();
        let mut txn = WriteTransaction {
            tree: &mut *guard,
            undo: Vec::new(),
        };
        match f(&mut txn) {
            Ok(value) => Ok(value),
            Err(err) => {
                txn.rollback();
                Err(err)
            }
        }
    }

    /// Number of entries in this bucket.
    pub fn entry_count(&self) -> usize {
        self.tree.read().len()
    }
}

/// Forward cursor interface shared by read-only and exclusive transactions.
pub trait QueueCursor {
    /// Position at the first key greater than or equal to `start`.
    fn seek_range(&mut self, start: &[u8]) -> bool;

    /// Advance to the next key; from a fresh cursor, position at the first.
    fn next(&mut self) -> bool;

    /// Key at the current position. Panics if the cursor is not positioned.
    fn key(&self) -> &[u8];

    /// Value at the current position. Panics if the cursor is not positioned
    /// or the current entry was deleted.
    fn value(&self) -> &[u8];
}

enum Position {
    Start,
    At(Vec<u8>),
    End,
}

fn seek(tree: &Tree, start: &[u8]) -> Position {
    match tree
        .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
        .next()
    {
        Some((key, _)) => Position::At(key.clone()),
        None => Position::End,
    }
}

fn advance(tree: &Tree, position: &Position) -> Position {
    let mut range = match position {
        Position::Start => tree.range::<[u8], _>(..),
        Position::At(current) => {
            tree.range::<[u8], _>((Bound::Excluded(current.as_slice()), Bound::Unbounded))
        }
        Position::End => return Position::End,
    };
    match range.next() {
        Some((key, _)) => Position::At(key.clone()),
        None => Position::End,
    }
}

fn current_key(position: &Position) -> &[u8] {
    match position {
        Position::At(key) => key,
        _ => panic!("cursor is not positioned"),
    }
}

fn current_value<'a>(tree: &'a Tree, position: &Position) -> &'a [u8] {
    match tree.get(current_key(position)) {
        Some(value) => value,
        None => panic!("cursor entry was deleted"),
    }
}

/// Read-only view of one bucket.
pub struct ReadTransaction<'env> {
    tree: &'env Tree,
}

impl ReadTransaction<'_> {
    pub fn open_cursor(&self) -> Cursor<'_> {
        Cursor {
            tree: self.tree,
            position: Position::Start,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.tree.get(key).map(Vec::as_slice)
    }
}

pub struct Cursor<'env> {
    tree: &'env Tree,
    position: Position,
}

impl QueueCursor for Cursor<'_> {
    fn seek_range(&mut self, start: &[u8]) -> bool {
        self.position = seek(self.tree, start);
        matches!(self.position, Position::At(_))
    }

    fn next(&mut self) -> bool {
        self.position = advance(self.tree, &self.position);
        matches!(self.position, Position::At(_))
    }

    fn key(&self) -> &[u8] {
        current_key(&self.position)
    }

    fn value(&self) -> &[u8] {
        current_value(self.tree, &self.position)
    }
}

/// Exclusive view of one bucket with an undo log for rollback.
pub struct WriteTransaction<'env> {
    tree: &'env mut Tree,
    undo: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl<'env> WriteTransaction<'env> {
    pub fn open_cursor(&mut self) -> CursorMut<'_, 'env> {
        CursorMut {
            txn: self,
            position: Position::Start,
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let prior = self.tree.insert(key.clone(), value);
        self.undo.push((key, prior));
    }

    fn delete(&mut self, key: &[u8]) {
        if let Some(prior) = self.tree.remove(key) {
            self.undo.push((key.to_vec(), Some(prior)));
        }
    }

    fn rollback(&mut self) {
        while let Some((key, prior)) = self.undo.pop() {
            match prior {
                Some(value) => self.tree.insert(key, value),
                None => self.tree.remove(&key),
            };
        }
    }
}

pub struct CursorMut<'txn, 'env> {
    txn: &'txn mut WriteTransaction<'env>,
    position: Position,
}

impl CursorMut<'_, '_> {
    /// Insert or overwrite an entry. The cursor position is unaffected.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.txn.put(key, value);
    }

    /// Delete the entry at the current position. The cursor stays positioned
    /// on the deleted key, so `next` continues from it.
    pub fn delete_current(&mut self) {
        let key = current_key(&self.position).to_vec();
        self.txn.delete(&key);
    }
}

impl QueueCursor for CursorMut<'_, '_> {
    fn seek_range(&mut self, start: &[u8]) -> bool {
        self.position = seek(self.txn.tree, start);
        matches!(self.position, Position::At(_))
    }

    fn next(&mut self) -> bool {
        self.position = advance(self.txn.tree, &self.position);
        matches!(self.position, Position::At(_))
    }

    fn key(&self) -> &[u8] {
        current_key(&self.position)
    }

    fn value(&self) -> &[u8] {
        current_value(self.txn.tree, &self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Bucket {
        let bucket = Bucket::new();
        bucket
            .execute_in_exclusive_transaction(|txn| {
                txn.put(b"a1".to_vec(), b"v1".to_vec());
                txn.put(b"a2".to_vec(), b"v2".to_vec());
                txn.put(b"b1".to_vec(), b"v3".to_vec());
                Ok(())
            })
            .unwrap();
        bucket
    }

    #[test]
    fn fresh_cursor_iterates_from_the_start() {
        let bucket = seeded();
        bucket
            .execute_in_readonly_transaction(|txn| {
                let mut cursor = txn.open_cursor();
                let mut keys = Vec::new();
                while cursor.next() {
                    keys.push(cursor.key().to_vec());
                }
                assert_eq!(keys, vec![b"a1".to_vec(), b"a2".to_vec(), b"b1".to_vec()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn seek_range_lands_on_first_key_at_or_after() {
        let bucket = seeded();
        bucket
            .execute_in_readonly_transaction(|txn| {
                let mut cursor = txn.open_cursor();
                assert!(cursor.seek_range(b"a2"));
                assert_eq!(cursor.key(), b"a2");
                assert!(cursor.seek_range(b"a3"));
                assert_eq!(cursor.key(), b"b1");
                assert!(!cursor.seek_range(b"c"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn delete_current_keeps_iteration_going() {
        let bucket = seeded();
        bucket
            .execute_in_exclusive_transaction(|txn| {
                let mut cursor = txn.open_cursor();
                assert!(cursor.seek_range(b"a1"));
                cursor.delete_current();
                assert!(cursor.next());
                assert_eq!(cursor.key(), b"a2");
                Ok(())
            })
            .unwrap();
        assert_eq!(bucket.entry_count(), 2);
    }

    #[test]
    fn put_during_iteration_is_visible_at_current_key() {
        let bucket = seeded();
        bucket
            .execute_in_exclusive_transaction(|txn| {
                let mut cursor = txn.open_cursor();
                assert!(cursor.seek_range(b"a1"));
                let key = cursor.key().to_vec();
                cursor.put(key, b"patched".to_vec());
                assert_eq!(cursor.value(), b"patched");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let bucket = seeded();
        let result = bucket.execute_in_exclusive_transaction(|txn| {
            txn.put(b"z".to_vec(), b"new".to_vec());
            txn.put(b"a1".to_vec(), b"overwritten".to_vec());
            {
                let mut cursor = txn.open_cursor();
                assert!(cursor.seek_range(b"a2"));
                cursor.delete_current();
            }
            Err::<(), _>(PersistenceError::CorruptEntry("boom"))
        });
        assert!(result.is_err());
        bucket
            .execute_in_readonly_transaction(|txn| {
                assert_eq!(txn.get(b"a1"), Some(b"v1".as_slice()));
                assert_eq!(txn.get(b"a2"), Some(b"v2".as_slice()));
                assert_eq!(txn.get(b"z"), None);
                Ok(())
            })
            .unwrap();
        assert_eq!(bucket.entry_count(), 3);
    }

    #[test]
    fn clones_share_storage() {
        let bucket = seeded();
        let other = bucket.clone();
        assert_eq!(other.entry_count(), 3);
        other
            .execute_in_exclusive_transaction(|txn| {
                txn.put(b"c".to_vec(), b"v".to_vec());
                Ok(())
            })
            .unwrap();
        assert_eq!(bucket.entry_count(), 4);
    }
}
