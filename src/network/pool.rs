//! Address pool allocator
//!
//! The pool inventory lives in the store. Allocation is a single critical
//! section over the pool mutex: find the first available record of the
//! family, mark it used, write it back.

use crate::error::{NetplaneError, Resource, Result};
use crate::quota::QuotaManager;
use crate::store::{AddressFamily, AddressRecord, AddressStatus, OwnerId, Store};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Next address in big-endian byte order, `None` past the end of the family
pub fn next_address(addr: IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment(&mut octets).then(|| IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment(&mut octets).then(|| IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

/// Add one with carry; false on wrap-around
fn increment(octets: &mut [u8]) -> bool {
    for byte in octets.iter_mut().rev() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            return true;
        }
    }
    false
}

fn as_u128(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Number of addresses in the inclusive range
pub fn range_size(start: IpAddr, end: IpAddr) -> u128 {
    (as_u128(end) - as_u128(start)).saturating_add(1)
}

/// IP address pool
pub struct AddressPool {
    store: Arc<dyn Store>,
    quotas: Arc<QuotaManager>,
    max_range_size: u64,
    lock: Mutex<()>,
}

impl AddressPool {
    pub fn new(store: Arc<dyn Store>, quotas: Arc<QuotaManager>, max_range_size: u64) -> Self {
        Self {
            store,
            quotas,
            max_range_size,
            lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| NetplaneError::Lock("Failed to acquire address pool lock".to_string()))
    }

    /// Insert every address from `start` to `end` inclusive as available
    pub fn add_range(
        &self,
        start: &str,
        end: &str,
        gateway: &str,
        netmask: &str,
        family: AddressFamily,
    ) -> Result<Vec<AddressRecord>> {
        let first = family.parse(start)?;
        let last = family.parse(end)?;
        if !gateway.trim().is_empty() {
            family.parse(gateway)?;
        }

        if first > last {
            return Err(NetplaneError::InvalidInput(format!(
                "range start {} is after range end {}",
                first, last
            )));
        }

        let size = range_size(first, last);
        if size > self.max_range_size as u128 {
            return Err(NetplaneError::RangeTooLarge {
                requested: size,
                max: self.max_range_size,
            });
        }

        let _guard = self.lock()?;

        let existing = self
            .store
            .addresses()
            .count(&|r| r.address >= first && r.address <= last)?;
        if existing > 0 {
            return Err(NetplaneError::AddressInUse(format!(
                "{} address(es) between {} and {} already in the pool",
                existing, first, last
            )));
        }

        let mut rows = Vec::with_capacity(size as usize);
        let mut current = Some(first);
        while let Some(addr) = current {
            rows.push(AddressRecord::available(addr, gateway.trim(), netmask.trim()));
            if addr == last {
                break;
            }
            current = next_address(addr);
        }

        let inserted = self.store.addresses().insert_many(rows)?;
        info!(
            "Added {} {} addresses {} - {} to the pool",
            inserted.len(),
            family,
            first,
            last
        );

        Ok(inserted)
    }

    /// Delete available addresses in the inclusive range; used ones stay
    pub fn remove_range(&self, start: &str, end: &str) -> Result<usize> {
        let first: IpAddr = start
            .trim()
            .parse()
            .map_err(|_| NetplaneError::InvalidAddress(start.to_string()))?;
        let last: IpAddr = end
            .trim()
            .parse()
            .map_err(|_| NetplaneError::InvalidAddress(end.to_string()))?;

        if AddressFamily::of(&first) != AddressFamily::of(&last) {
            return Err(NetplaneError::InvalidInput(format!(
                "range {} - {} mixes address families",
                first, last
            )));
        }
        if first > last {
            return Err(NetplaneError::InvalidInput(format!(
                "range start {} is after range end {}",
                first, last
            )));
        }

        let _guard = self.lock()?;
        let removed = self.store.addresses().delete_where(&|r| {
            r.status == AddressStatus::Available && r.address >= first && r.address <= last
        })?;

        info!("Removed {} available addresses {} - {}", removed, first, last);
        Ok(removed)
    }

    /// Hand the first available address of `family` to `owner`
    pub fn allocate(&self, family: AddressFamily, owner: OwnerId) -> Result<AddressRecord> {
        self.quotas.check_address_quota(owner, 1)?;

        let _guard = self.lock()?;

        let mut record = self
            .store
            .addresses()
            .first(&|r| r.family == family && r.status == AddressStatus::Available)?
            .ok_or(NetplaneError::PoolExhausted(family))?;

        record.status = AddressStatus::Used;
        record.owner = Some(owner);
        self.store.addresses().update(&record)?;

        info!("Allocated {} to owner {}", record.address, owner);
        Ok(record)
    }

    /// Return one address to the pool
    pub fn release(&self, address_id: u64) -> Result<AddressRecord> {
        let (record, previous_owner) = {
            let _guard = self.lock()?;

            let mut record = self
                .store
                .addresses()
                .get(address_id)?
                .ok_or_else(|| NetplaneError::not_found("address", address_id))?;

            let previous_owner = record.owner.take();
            if record.status != AddressStatus::Available || previous_owner.is_some() {
                record.status = AddressStatus::Available;
                self.store.addresses().update(&record)?;
            }
            (record, previous_owner)
        };

        if let Some(owner) = previous_owner {
            info!("Released {} from owner {}", record.address, owner);
            self.quotas.released(owner, Resource::Address, 1);
        } else {
            debug!("Address {} was not allocated", record.address);
        }

        Ok(record)
    }

    /// Return every address held by `owner`
    pub fn release_all(&self, owner: OwnerId) -> Result<usize> {
        let released = {
            let _guard = self.lock()?;

            let held = self.store.addresses().find(&|r| r.owner == Some(owner))?;
            for mut record in held.iter().cloned() {
                record.status = AddressStatus::Available;
                record.owner = None;
                self.store.addresses().update(&record)?;
            }
            held.len()
        };

        if released > 0 {
            info!("Released {} addresses of owner {}", released, owner);
        }
        self.quotas.released(owner, Resource::Address, released);
        Ok(released)
    }

    /// Available addresses of a family
    pub fn count_available(&self, family: AddressFamily) -> Result<usize> {
        self.store
            .addresses()
            .count(&|r| r.family == family && r.status == AddressStatus::Available)
    }

    /// Addresses held by `owner`
    pub fn addresses_for(&self, owner: OwnerId) -> Result<Vec<AddressRecord>> {
        self.store.addresses().find(&|r| r.owner == Some(owner))
    }

    pub fn get(&self, address_id: u64) -> Result<AddressRecord> {
        self.store
            .addresses()
            .get(address_id)?
            .ok_or_else(|| NetplaneError::not_found("address", address_id))
    }

    /// The whole inventory
    pub fn list(&self) -> Result<Vec<AddressRecord>> {
        self.store.addresses().find(&|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{QuotaUpdate, RecordingLifecycle};
    use crate::store::{Limit, MemoryStore};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::thread;

    fn setup(max_range_size: u64) -> (Arc<MemoryStore>, Arc<QuotaManager>, AddressPool) {
        let store = Arc::new(MemoryStore::new());
        let quotas = Arc::new(QuotaManager::new(
            store.clone(),
            Arc::new(RecordingLifecycle::new()),
        ));
        let pool = AddressPool::new(store.clone(), quotas.clone(), max_range_size);
        (store, quotas, pool)
    }

    #[test]
    fn test_next_address_carries() {
        let next = next_address("10.0.0.255".parse().unwrap()).unwrap();
        assert_eq!(next.to_string(), "10.0.1.0");

        let next = next_address("2001:db8::ffff".parse().unwrap()).unwrap();
        assert_eq!(next.to_string(), "2001:db8::1:0");

        assert!(next_address("255.255.255.255".parse().unwrap()).is_none());
    }

    #[test]
    fn test_add_range_inserts_each_address() {
        let (_, _, pool) = setup(1024);
        let rows = pool
            .add_range("10.0.0.10", "10.0.0.12", "10.0.0.1", "255.255.255.0", AddressFamily::Ipv4)
            .unwrap();

        let addrs: Vec<String> = rows.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
        assert!(rows.iter().all(|r| r.status == AddressStatus::Available && r.owner.is_none()));
        assert_eq!(rows[0].gateway, "10.0.0.1");
        assert_eq!(rows[0].netmask, "255.255.255.0");
    }

    #[test]
    fn test_add_range_ipv6_across_byte_boundary() {
        let (_, _, pool) = setup(1024);
        let rows = pool
            .add_range("2001:db8::fe", "2001:db8::101", "2001:db8::1", "64", AddressFamily::Ipv6)
            .unwrap();

        let addrs: Vec<String> = rows.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(
            addrs,
            vec!["2001:db8::fe", "2001:db8::ff", "2001:db8::100", "2001:db8::101"]
        );
        assert_eq!(pool.count_available(AddressFamily::Ipv6).unwrap(), 4);
    }

    #[test]
    fn test_add_range_rejects_bad_input() {
        let (store, _, pool) = setup(16);

        assert!(matches!(
            pool.add_range("10.0.0", "10.0.0.5", "", "", AddressFamily::Ipv4),
            Err(NetplaneError::InvalidAddress(_))
        ));
        assert!(matches!(
            pool.add_range("10.0.0.1", "2001:db8::1", "", "", AddressFamily::Ipv4),
            Err(NetplaneError::InvalidAddress(_))
        ));
        assert!(matches!(
            pool.add_range("10.0.0.9", "10.0.0.1", "", "", AddressFamily::Ipv4),
            Err(NetplaneError::InvalidInput(_))
        ));
        assert!(matches!(
            pool.add_range("10.0.0.0", "10.0.0.16", "", "", AddressFamily::Ipv4),
            Err(NetplaneError::RangeTooLarge { requested: 17, max: 16 })
        ));
        assert!(matches!(
            pool.add_range("2001:db8::", "2001:db9::", "", "", AddressFamily::Ipv6),
            Err(NetplaneError::RangeTooLarge { .. })
        ));

        assert_eq!(store.addresses().count(&|_| true).unwrap(), 0);
    }

    #[test]
    fn test_add_range_rejects_overlap() {
        let (store, _, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.12", "", "", AddressFamily::Ipv4)
            .unwrap();

        let err = pool
            .add_range("10.0.0.12", "10.0.0.20", "", "", AddressFamily::Ipv4)
            .unwrap_err();
        assert!(matches!(err, NetplaneError::AddressInUse(_)));
        assert_eq!(store.addresses().count(&|_| true).unwrap(), 3);
    }

    #[test]
    fn test_allocate_first_available_in_insertion_order() {
        let (_, _, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.12", "10.0.0.1", "255.255.255.0", AddressFamily::Ipv4)
            .unwrap();

        let record = pool.allocate(AddressFamily::Ipv4, 42).unwrap();
        assert_eq!(record.address.to_string(), "10.0.0.10");
        assert_eq!(record.status, AddressStatus::Used);
        assert_eq!(record.owner, Some(42));
        assert_eq!(pool.count_available(AddressFamily::Ipv4).unwrap(), 2);
    }

    #[test]
    fn test_allocate_exhausted() {
        let (_, _, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.10", "", "", AddressFamily::Ipv4)
            .unwrap();

        pool.allocate(AddressFamily::Ipv4, 1).unwrap();
        assert!(matches!(
            pool.allocate(AddressFamily::Ipv4, 2),
            Err(NetplaneError::PoolExhausted(AddressFamily::Ipv4))
        ));
        assert!(matches!(
            pool.allocate(AddressFamily::Ipv6, 2),
            Err(NetplaneError::PoolExhausted(AddressFamily::Ipv6))
        ));
    }

    #[test]
    fn test_allocate_respects_address_quota() {
        let (store, quotas, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.12", "", "", AddressFamily::Ipv4)
            .unwrap();
        quotas
            .update(
                5,
                QuotaUpdate {
                    address_quota: Some(Limit::Limited(1)),
                    ..Default::default()
                },
            )
            .unwrap();

        pool.allocate(AddressFamily::Ipv4, 5).unwrap();
        assert!(matches!(
            pool.allocate(AddressFamily::Ipv4, 5),
            Err(NetplaneError::QuotaExceeded { .. })
        ));
        assert_eq!(
            store
                .addresses()
                .count(&|r| r.status == AddressStatus::Used)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_release_and_release_all() {
        let (_, _, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.13", "", "", AddressFamily::Ipv4)
            .unwrap();

        let a = pool.allocate(AddressFamily::Ipv4, 1).unwrap();
        pool.allocate(AddressFamily::Ipv4, 2).unwrap();
        pool.allocate(AddressFamily::Ipv4, 2).unwrap();

        let released = pool.release(a.id).unwrap();
        assert_eq!(released.status, AddressStatus::Available);
        assert_eq!(released.owner, None);

        assert_eq!(pool.release_all(2).unwrap(), 2);
        assert!(pool.addresses_for(2).unwrap().is_empty());
        assert_eq!(pool.count_available(AddressFamily::Ipv4).unwrap(), 4);

        assert!(matches!(pool.release(999), Err(NetplaneError::NotFound { .. })));
    }

    #[test]
    fn test_remove_range_keeps_used() {
        let (store, _, pool) = setup(1024);
        pool.add_range("10.0.0.10", "10.0.0.12", "", "", AddressFamily::Ipv4)
            .unwrap();
        let used = pool.allocate(AddressFamily::Ipv4, 42).unwrap();

        let removed = pool.remove_range("10.0.0.10", "10.0.0.12").unwrap();
        assert_eq!(removed, 2);

        let left = store.addresses().find(&|_| true).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, used.id);
        assert_eq!(left[0].owner, Some(42));
    }

    #[test]
    fn test_remove_range_compares_numerically() {
        let (store, _, pool) = setup(1024);
        pool.add_range("10.0.0.8", "10.0.0.12", "", "", AddressFamily::Ipv4)
            .unwrap();

        // "10.0.0.9" > "10.0.0.10" as strings; numerically it is inside the range
        assert_eq!(pool.remove_range("10.0.0.9", "10.0.0.10").unwrap(), 2);
        let left: Vec<String> = store
            .addresses()
            .find(&|_| true)
            .unwrap()
            .iter()
            .map(|r| r.address.to_string())
            .collect();
        assert_eq!(left, vec!["10.0.0.8", "10.0.0.11", "10.0.0.12"]);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let (_, _, pool) = setup(1024);
        pool.add_range("10.1.0.0", "10.1.0.63", "", "", AddressFamily::Ipv4)
            .unwrap();
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..8u64)
            .map(|owner| {
                let pool = pool.clone();
                thread::spawn(move || {
                    (0..10)
                        .filter_map(|_| pool.allocate(AddressFamily::Ipv4, owner).ok())
                        .map(|r| r.address)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for addr in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(addr), "{} handed out twice", addr);
            }
        }

        assert_eq!(total, 64);
        assert_eq!(pool.count_available(AddressFamily::Ipv4).unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_add_range_creates_distance_plus_one(start in 0u32..u32::MAX - 300, len in 0u32..300) {
            let (_, _, pool) = setup(1024);
            let first = Ipv4Addr::from(start);
            let last = Ipv4Addr::from(start + len);

            let rows = pool
                .add_range(&first.to_string(), &last.to_string(), "", "", AddressFamily::Ipv4)
                .unwrap();

            prop_assert_eq!(rows.len() as u32, len + 1);
            prop_assert!(rows.iter().all(|r| r.status == AddressStatus::Available));
            prop_assert_eq!(pool.count_available(AddressFamily::Ipv4).unwrap() as u32, len + 1);
        }
    }
}
