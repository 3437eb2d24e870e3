//! In-process store with optional JSON snapshots
//!
//! Every table keeps its rows in a `BTreeMap` keyed by ID. When the store is
//! opened on a directory, each mutation rewrites `<dir>/<table>.json`
//! (temp file + rename) while the table lock is still held. Mutations are
//! staged on a copy and only swapped in once the snapshot is on disk.

use super::records::{AddressRecord, PortMapping, ProxyRoute, Quota, Record};
use super::{Filter, Store, Table};
use crate::error::{NetplaneError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Record")]
struct Snapshot<T: Record> {
    next_id: u64,
    rows: BTreeMap<u64, T>,
}

impl<T: Record> Default for Snapshot<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }
}

/// One table of the memory store
pub struct MemoryTable<T: Record> {
    inner: RwLock<Snapshot<T>>,
    path: Option<PathBuf>,
}

impl<T: Record> MemoryTable<T> {
    fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Snapshot::default()),
            path: None,
        }
    }

    fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(format!("{}.json", T::TABLE));
        let snapshot = if path.exists() {
            let data = std::fs::read(&path)?;
            let snapshot: Snapshot<T> = serde_json::from_slice(&data)?;
            debug!("Loaded {} rows from {}", snapshot.rows.len(), path.display());
            snapshot
        } else {
            Snapshot::default()
        };

        Ok(Self {
            inner: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    fn persist(&self, snapshot: &Snapshot<T>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Snapshot<T>>> {
        self.inner
            .read()
            .map_err(|_| NetplaneError::Lock(format!("Failed to acquire read lock on {}", T::TABLE)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Snapshot<T>>> {
        self.inner
            .write()
            .map_err(|_| NetplaneError::Lock(format!("Failed to acquire write lock on {}", T::TABLE)))
    }
}

impl<T: Record> Table<T> for MemoryTable<T> {
    fn insert(&self, row: T) -> Result<T> {
        let mut rows = self.insert_many(vec![row])?;
        rows.pop()
            .ok_or_else(|| NetplaneError::Store(format!("insert into {} returned no row", T::TABLE)))
    }

    fn insert_many(&self, rows: Vec<T>) -> Result<Vec<T>> {
        let mut snapshot = self.write()?;
        let mut next = snapshot.clone();
        let mut inserted = Vec::with_capacity(rows.len());

        for mut row in rows {
            let id = next.next_id;
            next.next_id += 1;
            row.set_id(id);
            next.rows.insert(id, row.clone());
            inserted.push(row);
        }

        self.persist(&next)?;
        *snapshot = next;
        Ok(inserted)
    }

    fn get(&self, id: u64) -> Result<Option<T>> {
        Ok(self.read()?.rows.get(&id).cloned())
    }

    fn update(&self, row: &T) -> Result<()> {
        let mut snapshot = self.write()?;
        if !snapshot.rows.contains_key(&row.id()) {
            return Err(NetplaneError::not_found(T::TABLE, row.id()));
        }

        let mut next = snapshot.clone();
        next.rows.insert(row.id(), row.clone());
        self.persist(&next)?;
        *snapshot = next;
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<bool> {
        let mut snapshot = self.write()?;
        if !snapshot.rows.contains_key(&id) {
            return Ok(false);
        }

        let mut next = snapshot.clone();
        next.rows.remove(&id);
        self.persist(&next)?;
        *snapshot = next;
        Ok(true)
    }

    fn delete_where(&self, filter: Filter<'_, T>) -> Result<usize> {
        let mut snapshot = self.write()?;
        let mut next = snapshot.clone();
        next.rows.retain(|_, row| !filter(&*row));
        let removed = snapshot.rows.len() - next.rows.len();
        if removed > 0 {
            self.persist(&next)?;
            *snapshot = next;
        }
        Ok(removed)
    }

    fn find(&self, filter: Filter<'_, T>) -> Result<Vec<T>> {
        Ok(self
            .read()?
            .rows
            .values()
            .filter(|row| filter(*row))
            .cloned()
            .collect())
    }

    fn first(&self, filter: Filter<'_, T>) -> Result<Option<T>> {
        Ok(self.read()?.rows.values().find(|row| filter(*row)).cloned())
    }

    fn count(&self, filter: Filter<'_, T>) -> Result<usize> {
        Ok(self.read()?.rows.values().filter(|row| filter(*row)).count())
    }
}

/// Store kept in memory, optionally snapshotted to disk
pub struct MemoryStore {
    addresses: MemoryTable<AddressRecord>,
    port_mappings: MemoryTable<PortMapping>,
    proxy_routes: MemoryTable<ProxyRoute>,
    quotas: MemoryTable<Quota>,
}

impl MemoryStore {
    /// Create an empty, non-persistent store
    pub fn new() -> Self {
        Self {
            addresses: MemoryTable::in_memory(),
            port_mappings: MemoryTable::in_memory(),
            proxy_routes: MemoryTable::in_memory(),
            quotas: MemoryTable::in_memory(),
        }
    }

    /// Open a store persisted under `dir`, loading existing snapshots
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        Ok(Self {
            addresses: MemoryTable::open(dir)?,
            port_mappings: MemoryTable::open(dir)?,
            proxy_routes: MemoryTable::open(dir)?,
            quotas: MemoryTable::open(dir)?,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn addresses(&self) -> &dyn Table<AddressRecord> {
        &self.addresses
    }

    fn port_mappings(&self) -> &dyn Table<PortMapping> {
        &self.port_mappings
    }

    fn proxy_routes(&self) -> &dyn Table<ProxyRoute> {
        &self.proxy_routes
    }

    fn quotas(&self) -> &dyn Table<Quota> {
        &self.quotas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::AddressStatus;
    use tempfile::tempdir;

    fn addr(s: &str) -> AddressRecord {
        AddressRecord::available(s.parse().unwrap(), "10.0.0.1", "255.255.255.0")
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let a = store.addresses().insert(addr("10.0.0.2")).unwrap();
        let b = store.addresses().insert(addr("10.0.0.3")).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let found = store.addresses().find(&|_| true).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].address.to_string(), "10.0.0.2");
    }

    #[test]
    fn test_update_and_delete() {
        let store = MemoryStore::new();
        let mut row = store.addresses().insert(addr("10.0.0.2")).unwrap();

        row.status = AddressStatus::Used;
        row.owner = Some(7);
        store.addresses().update(&row).unwrap();
        assert_eq!(
            store.addresses().count(&|r| r.status == AddressStatus::Used).unwrap(),
            1
        );

        assert!(store.addresses().delete(row.id).unwrap());
        assert!(!store.addresses().delete(row.id).unwrap());
        assert!(store.addresses().update(&row).is_err());
    }

    #[test]
    fn test_first_respects_insertion_order() {
        let store = MemoryStore::new();
        store
            .addresses()
            .insert_many(vec![addr("10.0.0.9"), addr("10.0.0.3")])
            .unwrap();

        let first = store.addresses().first(&|_| true).unwrap().unwrap();
        assert_eq!(first.address.to_string(), "10.0.0.9");
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let temp = tempdir().unwrap();

        {
            let store = MemoryStore::open(temp.path()).unwrap();
            store.addresses().insert(addr("10.0.0.2")).unwrap();
            store.addresses().insert(addr("10.0.0.3")).unwrap();
            store
                .addresses()
                .delete_where(&|r| r.address.to_string() == "10.0.0.2")
                .unwrap();
        }

        let store = MemoryStore::open(temp.path()).unwrap();
        let rows = store.addresses().find(&|_| true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);

        let next = store.addresses().insert(addr("10.0.0.4")).unwrap();
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_failed_persist_leaves_table_unchanged() {
        let temp = tempdir().unwrap();
        let store = MemoryStore::open(temp.path()).unwrap();
        let mut row = store.addresses().insert(addr("10.0.0.2")).unwrap();

        // a directory in the temp file's place makes every write fail
        let blocker = temp.path().join(format!("{}.json.tmp", AddressRecord::TABLE));
        std::fs::create_dir(&blocker).unwrap();

        assert!(store.addresses().insert(addr("10.0.0.3")).is_err());
        row.owner = Some(7);
        assert!(store.addresses().update(&row).is_err());
        assert!(store.addresses().delete(row.id).is_err());
        assert!(store.addresses().delete_where(&|_| true).is_err());

        let rows = store.addresses().find(&|_| true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].owner, None);

        std::fs::remove_dir(&blocker).unwrap();
        let next = store.addresses().insert(addr("10.0.0.3")).unwrap();
        assert_eq!(next.id, 2);
    }
}
