use std::{collections::HashMap, net::Ipv4Addr};

use ipnet::Ipv4Net;
use log::info;

use crate::ip::{address_count, bitmap::SlotBitmap, nth_address, offset_of};

use super::AllocationsError;

/// Offset of the first address endpoints may receive; `[0]` belongs to the
/// router port and `[1]` to the management port.
pub const FIRST_ENDPOINT_OFFSET: u32 = 2;

pub type EndpointKey = String;

/// Endpoint addresses handed out within a single host subnet.
#[derive(Debug)]
pub struct AddressAllocations {
    subnet: Ipv4Net,
    /// bit `i` stands for offset `FIRST_ENDPOINT_OFFSET + i`
    slots: SlotBitmap,
    allocations: HashMap<EndpointKey, Ipv4Addr>,
}

impl AddressAllocations {
    pub fn new(subnet: Ipv4Net) -> Self {
        // offsets [2 ..= N - 2], the broadcast address stays unused
        let usable = address_count(&subnet).saturating_sub(u64::from(FIRST_ENDPOINT_OFFSET) + 1);

        Self {
            subnet,
            slots: SlotBitmap::new(usable as u32),
            allocations: HashMap::new(),
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    pub fn get(&self, endpoint: &str) -> Option<Ipv4Addr> {
        self.allocations.get(endpoint).copied()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn try_allocate(&mut self, endpoint: &str) -> Result<Ipv4Addr, AllocationsError> {
        if let Some(address) = self.get(endpoint) {
            return Ok(address);
        }

        let slot = self
            .slots
            .first_free()
            .ok_or(AllocationsError::AddressesExhausted(self.subnet))?;
        let address = nth_address(&self.subnet, slot + FIRST_ENDPOINT_OFFSET)
            .ok_or(AllocationsError::AddressesExhausted(self.subnet))?;

        self.slots.set(slot);
        self.allocations.insert(endpoint.to_owned(), address);

        info!("Allocated {address} address for '{endpoint}'!");

        Ok(address)
    }

    pub fn try_insert(&mut self, endpoint: &str, address: Ipv4Addr) -> Result<Ipv4Addr, AllocationsError> {
        match self.get(endpoint) {
            Some(held) if held == address => return Ok(address),
            Some(held) => {
                return Err(AllocationsError::EndpointConflict {
                    endpoint: endpoint.to_owned(),
                    held,
                })
            }
            None => (),
        }

        let offset = offset_of(&self.subnet, &address)
            .ok_or(AllocationsError::AddressOutOfRange(address, self.subnet))?;
        let slot = offset
            .checked_sub(FIRST_ENDPOINT_OFFSET)
            .filter(|slot| *slot < self.slots.len())
            .ok_or(AllocationsError::AddressReserved(address))?;

        if !self.slots.set(slot) {
            return Err(AllocationsError::AddressConflict(address));
        }

        self.allocations.insert(endpoint.to_owned(), address);

        info!("Reserved {address} address for '{endpoint}'!");

        Ok(address)
    }

    pub fn remove(&mut self, endpoint: &str) -> Option<Ipv4Addr> {
        let address = self.allocations.remove(endpoint)?;

        if let Some(offset) = offset_of(&self.subnet, &address) {
            self.slots.clear(offset - FIRST_ENDPOINT_OFFSET);
        }

        info!("Released {address} address of '{endpoint}'!");

        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::allocations::AllocationsError;

    use super::AddressAllocations;

    fn allocations(subnet: &str) -> AddressAllocations {
        AddressAllocations::new(subnet.parse().unwrap())
    }

    #[test]
    fn first_two_addresses_are_never_handed_out() {
        let mut addresses = allocations("10.0.0.0/24");

        assert_eq!(addresses.try_allocate("p1").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(addresses.try_allocate("p2").unwrap(), Ipv4Addr::new(10, 0, 0, 3));

        addresses.remove("p1");

        assert_eq!(addresses.try_allocate("p3").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn broadcast_address_is_excluded() {
        let mut addresses = allocations("10.0.0.0/30");

        assert_eq!(addresses.try_allocate("p1").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            addresses.try_allocate("p2"),
            Err(AllocationsError::AddressesExhausted(_))
        ));
        assert!(matches!(
            addresses.try_insert("p2", Ipv4Addr::new(10, 0, 0, 3)),
            Err(AllocationsError::AddressReserved(_))
        ));
    }

    #[test]
    fn reserve_rejects_foreign_and_reserved_addresses() {
        let mut addresses = allocations("10.0.0.0/24");

        addresses.try_insert("p1", Ipv4Addr::new(10, 0, 0, 40)).unwrap();

        assert!(addresses.try_insert("p1", Ipv4Addr::new(10, 0, 0, 40)).is_ok());
        assert!(matches!(
            addresses.try_insert("p2", Ipv4Addr::new(10, 0, 0, 40)),
            Err(AllocationsError::AddressConflict(_))
        ));
        assert!(matches!(
            addresses.try_insert("p1", Ipv4Addr::new(10, 0, 0, 41)),
            Err(AllocationsError::EndpointConflict { .. })
        ));
        assert!(matches!(
            addresses.try_insert("p3", Ipv4Addr::new(10, 0, 0, 1)),
            Err(AllocationsError::AddressReserved(_))
        ));
        assert!(matches!(
            addresses.try_insert("p3", Ipv4Addr::new(10, 0, 1, 7)),
            Err(AllocationsError::AddressOutOfRange(..))
        ));
    }

    #[test]
    fn allocation_skips_reserved_addresses() {
        let mut addresses = allocations("10.0.0.0/24");

        addresses.try_insert("p1", Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        assert_eq!(addresses.try_allocate("p2").unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(addresses.try_allocate("p2").unwrap(), Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(addresses.len(), 2);
    }
}
