use std::collections::HashMap;

use ipnet::Ipv4Net;
use log::{info, warn};

use crate::ip::{bitmap::SlotBitmap, cidr::ClusterCidr, nets_overlap};

use super::AllocationsError;

/// Carves the cluster network into per-node host subnets.
#[derive(Debug)]
pub struct HostSubnetAllocations {
    cluster_cidr: ClusterCidr,
    /// one bitmap per cluster CIDR entry, same order
    slots: Vec<SlotBitmap>,
    allocations: HashMap<String, Ipv4Net>,
}

impl HostSubnetAllocations {
    pub fn new(cluster_cidr: ClusterCidr) -> Self {
        let slots = cluster_cidr
            .entries()
            .iter()
            .map(|entry| SlotBitmap::new(entry.slot_count()))
            .collect();

        Self {
            cluster_cidr,
            slots,
            allocations: HashMap::new(),
        }
    }

    pub fn cluster_cidr(&self) -> &ClusterCidr {
        &self.cluster_cidr
    }

    pub fn get(&self, node: &str) -> Option<Ipv4Net> {
        self.allocations.get(node).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Ipv4Net)> {
        self.allocations.iter()
    }

    /// Hands out the numerically smallest free slot of the first entry that
    /// still has one. A node that already holds a subnet gets it back.
    pub fn try_allocate(&mut self, node: &str) -> Result<Ipv4Net, AllocationsError> {
        if let Some(subnet) = self.get(node) {
            return Ok(subnet);
        }

        for (entry, slots) in self.cluster_cidr.entries().iter().zip(self.slots.iter_mut()) {
            let Some(slot) = slots.first_free() else {
                continue;
            };
            let Some(subnet) = entry.subnet_at(slot) else {
                continue;
            };

            slots.set(slot);
            self.allocations.insert(node.to_owned(), subnet);

            info!("Allocated {subnet} host subnet for '{node}' node!");

            return Ok(subnet);
        }

        Err(AllocationsError::HostSubnetsExhausted)
    }

    /// Marks `subnet` as held by `node`. Fails only when a different node
    /// already holds an overlapping subnet.
    pub fn try_insert(&mut self, node: &str, subnet: Ipv4Net) -> Result<Ipv4Net, AllocationsError> {
        if self.get(node) == Some(subnet) {
            return Ok(subnet);
        }

        let (entry_index, slot) = self
            .locate(&subnet)
            .ok_or(AllocationsError::SubnetOutOfRange(subnet))?;

        if let Some((holder, _)) = self
            .allocations
            .iter()
            .find(|(holder, held)| holder.as_str() != node && nets_overlap(held, &subnet))
        {
            return Err(AllocationsError::SubnetConflict {
                subnet,
                holder: holder.to_owned(),
            });
        }

        if let Some(previous) = self.remove(node) {
            warn!("Node '{node}' moved from {previous} to {subnet} host subnet!");
        }

        self.slots[entry_index].set(slot);
        self.allocations.insert(node.to_owned(), subnet);

        info!("Reserved {subnet} host subnet for '{node}' node!");

        Ok(subnet)
    }

    pub fn remove(&mut self, node: &str) -> Option<Ipv4Net> {
        let subnet = self.allocations.remove(node)?;

        if let Some((entry_index, slot)) = self.locate(&subnet) {
            self.slots[entry_index].clear(slot);
        }

        info!("Released {subnet} host subnet of '{node}' node!");

        Some(subnet)
    }

    /// Position of `subnet` when every entry's slots are laid out back to back.
    pub fn slot_ordinal(&self, subnet: &Ipv4Net) -> Option<u64> {
        let mut preceding = 0u64;

        for entry in self.cluster_cidr.entries() {
            if let Some(slot) = entry.slot_of(subnet) {
                return Some(preceding + u64::from(slot));
            }

            preceding += u64::from(entry.slot_count());
        }

        None
    }

    fn locate(&self, subnet: &Ipv4Net) -> Option<(usize, u32)> {
        self.cluster_cidr
            .entries()
            .iter()
            .enumerate()
            .find_map(|(index, entry)| entry.slot_of(subnet).map(|slot| (index, slot)))
    }
}

#[cfg(test)]
mod tests {
    use ipnet::Ipv4Net;

    use crate::allocations::AllocationsError;

    use super::HostSubnetAllocations;

    fn allocations(cidr: &str) -> HostSubnetAllocations {
        HostSubnetAllocations::new(cidr.parse().unwrap())
    }

    fn net(raw: &str) -> Ipv4Net {
        raw.parse().unwrap()
    }

    #[test]
    fn allocates_in_order_and_reuses_released_slots() {
        let mut subnets = allocations("10.0.0.0/16/24");

        assert_eq!(subnets.try_allocate("n1").unwrap(), net("10.0.0.0/24"));
        assert_eq!(subnets.try_allocate("n2").unwrap(), net("10.0.1.0/24"));
        assert_eq!(subnets.try_allocate("n3").unwrap(), net("10.0.2.0/24"));

        assert_eq!(subnets.remove("n2"), Some(net("10.0.1.0/24")));
        assert_eq!(subnets.try_allocate("n4").unwrap(), net("10.0.1.0/24"));
    }

    #[test]
    fn allocation_is_idempotent_per_node() {
        let mut subnets = allocations("10.0.0.0/16/24");

        let first = subnets.try_allocate("n1").unwrap();

        assert_eq!(subnets.try_allocate("n1").unwrap(), first);
        assert_eq!(subnets.try_allocate("n2").unwrap(), net("10.0.1.0/24"));
    }

    #[test]
    fn moves_to_the_next_entry_when_the_first_is_full() {
        let mut subnets = allocations("10.0.0.0/23/24,192.168.0.0/24/26");

        subnets.try_allocate("a").unwrap();
        subnets.try_allocate("b").unwrap();

        assert_eq!(subnets.try_allocate("c").unwrap(), net("192.168.0.0/26"));
        assert_eq!(subnets.slot_ordinal(&net("192.168.0.0/26")), Some(2));
        assert_eq!(subnets.slot_ordinal(&net("192.168.0.192/26")), Some(5));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut subnets = allocations("10.0.0.0/30/30");

        assert_eq!(subnets.try_allocate("n1").unwrap(), net("10.0.0.0/30"));
        assert!(matches!(
            subnets.try_allocate("n2"),
            Err(AllocationsError::HostSubnetsExhausted)
        ));

        subnets.remove("n1");

        assert_eq!(subnets.try_allocate("n2").unwrap(), net("10.0.0.0/30"));
    }

    #[test]
    fn reserved_subnets_are_skipped_by_allocation() {
        let mut subnets = allocations("10.0.0.0/16/24");

        subnets.try_insert("n1", net("10.0.5.0/24")).unwrap();
        subnets.try_insert("n2", net("10.0.9.0/24")).unwrap();

        assert_eq!(subnets.try_allocate("n3").unwrap(), net("10.0.0.0/24"));

        for node in ["n4", "n5", "n6", "n7", "n8"] {
            subnets.try_allocate(node).unwrap();
        }

        assert_eq!(subnets.try_allocate("n9").unwrap(), net("10.0.7.0/24"));
    }

    #[test]
    fn reserving_a_held_subnet_conflicts() {
        let mut subnets = allocations("10.0.0.0/16/24");

        subnets.try_insert("n1", net("10.0.5.0/24")).unwrap();

        assert!(subnets.try_insert("n1", net("10.0.5.0/24")).is_ok());
        assert!(matches!(
            subnets.try_insert("n2", net("10.0.5.0/24")),
            Err(AllocationsError::SubnetConflict { .. })
        ));
        assert!(matches!(
            subnets.try_insert("n2", net("10.1.5.0/24")),
            Err(AllocationsError::SubnetOutOfRange(_))
        ));
    }
}
