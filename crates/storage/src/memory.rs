//! In-memory store used by tests and `--backend memory`.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns
            .read()
            .map(|columns| columns.get(&column).map(|map| map.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        Ok(columns
            .get(&column)
            .and_then(|map| map.get(key))
            .cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        if let Some(map) = columns.get_mut(&column) {
            map.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        let Some(map) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        // One lock acquisition for the whole batch keeps it atomic.
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    columns
                        .entry(*column)
                        .or_default()
                        .insert(key.as_slice().to_vec(), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    if let Some(map) = columns.get_mut(column) {
                        map.remove(key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_put_get_delete() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"alpha".as_slice(), b"1".as_slice());
        batch.put(Column::Meta, b"beta".as_slice(), b"2".as_slice());
        batch.delete(Column::Meta, b"alpha".as_slice());
        store.write_batch(&batch).expect("commit");

        assert_eq!(store.get(Column::Meta, b"alpha").expect("get"), None);
        assert_eq!(
            store.get(Column::Meta, b"beta").expect("get"),
            Some(b"2".to_vec())
        );
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        store.put(Column::Coins, b"aa1", b"x").expect("put");
        store.put(Column::Coins, b"aa2", b"y").expect("put");
        store.put(Column::Coins, b"ab1", b"z").expect("put");

        let hits = store.scan_prefix(Column::Coins, b"aa").expect("scan");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"aa1".to_vec());
        assert_eq!(hits[1].0, b"aa2".to_vec());

        // Columns do not bleed into each other.
        assert!(store.scan_prefix(Column::Meta, b"aa").expect("scan").is_empty());
    }
}
