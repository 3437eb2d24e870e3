//! Desired-state store
//!
//! The store is the single source of truth for addresses, port mappings,
//! proxy routes and quotas. Managers never cache rows; every decision reads
//! back through a [`Table`].

pub mod memory;
pub mod records;

pub use memory::MemoryStore;
pub use records::{
    AddressFamily, AddressRecord, AddressStatus, BindingStatus, Limit, OveragePolicy, OwnerId,
    PortMapping, Protocol, ProxyRoute, Quota, Record,
};

use crate::error::Result;

/// Row filter used by queries and counts
pub type Filter<'a, T> = &'a dyn Fn(&T) -> bool;

/// Row-level access to one record type
///
/// Each call is atomic on its own. Rows are returned in insertion (ID)
/// order.
pub trait Table<T: Record>: Send + Sync {
    /// Insert a row, assigning its ID
    fn insert(&self, row: T) -> Result<T>;

    /// Insert several rows in one step
    fn insert_many(&self, rows: Vec<T>) -> Result<Vec<T>>;

    /// Get a row by ID
    fn get(&self, id: u64) -> Result<Option<T>>;

    /// Replace an existing row
    fn update(&self, row: &T) -> Result<()>;

    /// Delete a row, returning whether it existed
    fn delete(&self, id: u64) -> Result<bool>;

    /// Delete every matching row
    fn delete_where(&self, filter: Filter<'_, T>) -> Result<usize>;

    /// All matching rows
    fn find(&self, filter: Filter<'_, T>) -> Result<Vec<T>>;

    /// First matching row in insertion order
    fn first(&self, filter: Filter<'_, T>) -> Result<Option<T>>;

    /// Number of matching rows
    fn count(&self, filter: Filter<'_, T>) -> Result<usize>;
}

/// Persistent store holding every table
pub trait Store: Send + Sync {
    fn addresses(&self) -> &dyn Table<AddressRecord>;
    fn port_mappings(&self) -> &dyn Table<PortMapping>;
    fn proxy_routes(&self) -> &dyn Table<ProxyRoute>;
    fn quotas(&self) -> &dyn Table<Quota>;
}
