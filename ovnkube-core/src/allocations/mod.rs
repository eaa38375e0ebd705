use std::{
    collections::HashMap,
    net::Ipv4Addr,
    ops::{Deref, DerefMut},
};

use ipnet::Ipv4Net;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ip::cidr::ClusterCidr;

use self::{addresses::AddressAllocations, host_subnets::HostSubnetAllocations};

pub mod addresses;
pub mod host_subnets;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocationsError {
    #[error("The cluster network has no free host subnet left!")]
    HostSubnetsExhausted,
    #[error("Host subnet {} has no free address left!", .0)]
    AddressesExhausted(Ipv4Net),
    #[error("Host subnet {} is already held by '{}' node!", .subnet, .holder)]
    SubnetConflict { subnet: Ipv4Net, holder: String },
    #[error("Host subnet {} is not a slot of the cluster network!", .0)]
    SubnetOutOfRange(Ipv4Net),
    #[error("Address {} is already allocated!", .0)]
    AddressConflict(Ipv4Addr),
    #[error("Endpoint '{}' already holds {} address!", .endpoint, .held)]
    EndpointConflict { endpoint: String, held: Ipv4Addr },
    #[error("Address {} is reserved for the node's own ports!", .0)]
    AddressReserved(Ipv4Addr),
    #[error("Address {} is out of {} range!", .0, .1)]
    AddressOutOfRange(Ipv4Addr, Ipv4Net),
    #[error("Node '{}' has no host subnet yet!", .0)]
    NodeSubnetMissing(String),
}

impl AllocationsError {
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            AllocationsError::HostSubnetsExhausted | AllocationsError::AddressesExhausted(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            AllocationsError::SubnetConflict { .. }
                | AllocationsError::AddressConflict(_)
                | AllocationsError::EndpointConflict { .. }
                | AllocationsError::AddressReserved(_)
        )
    }
}

/// Host subnets of every node plus the endpoint addresses inside each of them.
#[derive(Debug)]
pub struct AddressSpace {
    host_subnets: HostSubnetAllocations,
    endpoints: HashMap<String, AddressAllocations>,
}

impl AddressSpace {
    pub fn new(cluster_cidr: ClusterCidr) -> Self {
        Self {
            host_subnets: HostSubnetAllocations::new(cluster_cidr),
            endpoints: HashMap::new(),
        }
    }

    pub fn cluster_cidr(&self) -> &ClusterCidr {
        self.host_subnets.cluster_cidr()
    }

    pub fn host_subnet(&self, node: &str) -> Option<Ipv4Net> {
        self.host_subnets.get(node)
    }

    pub fn host_subnets(&self) -> impl Iterator<Item = (&String, &Ipv4Net)> {
        self.host_subnets.iter()
    }

    pub fn allocate_host_subnet(&mut self, node: &str) -> Result<Ipv4Net, AllocationsError> {
        let subnet = self.host_subnets.try_allocate(node)?;
        self.track_node(node, subnet);

        Ok(subnet)
    }

    pub fn reserve_host_subnet(&mut self, node: &str, subnet: Ipv4Net) -> Result<Ipv4Net, AllocationsError> {
        let subnet = self.host_subnets.try_insert(node, subnet)?;
        self.track_node(node, subnet);

        Ok(subnet)
    }

    pub fn release_host_subnet(&mut self, node: &str) -> Option<Ipv4Net> {
        self.endpoints.remove(node);
        self.host_subnets.remove(node)
    }

    pub fn slot_ordinal(&self, subnet: &Ipv4Net) -> Option<u64> {
        self.host_subnets.slot_ordinal(subnet)
    }

    pub fn address(&self, node: &str, endpoint: &str) -> Option<Ipv4Addr> {
        self.endpoints.get(node)?.get(endpoint)
    }

    pub fn allocate_address(&mut self, node: &str, endpoint: &str) -> Result<Ipv4Addr, AllocationsError> {
        self.node_addresses(node)?.try_allocate(endpoint)
    }

    pub fn reserve_address(
        &mut self,
        node: &str,
        endpoint: &str,
        address: Ipv4Addr,
    ) -> Result<Ipv4Addr, AllocationsError> {
        self.node_addresses(node)?.try_insert(endpoint, address)
    }

    pub fn release_address(&mut self, node: &str, endpoint: &str) -> Option<Ipv4Addr> {
        self.endpoints.get_mut(node)?.remove(endpoint)
    }

    fn node_addresses(&mut self, node: &str) -> Result<&mut AddressAllocations, AllocationsError> {
        self.endpoints
            .get_mut(node)
            .ok_or_else(|| AllocationsError::NodeSubnetMissing(node.to_owned()))
    }

    fn track_node(&mut self, node: &str, subnet: Ipv4Net) {
        let stale = self
            .endpoints
            .get(node)
            .map(|addresses| addresses.subnet() != subnet)
            .unwrap_or(true);

        if stale {
            self.endpoints
                .insert(node.to_owned(), AddressAllocations::new(subnet));
        }
    }
}

/// [`AddressSpace`] shared between reconciler tasks.
pub struct AddressSpaceSync(Mutex<AddressSpace>);

impl AddressSpaceSync {
    pub async fn get_or_allocate_host_subnet(&self, node: &str) -> Result<Ipv4Net, AllocationsError> {
        self.lock().await.allocate_host_subnet(node)
    }

    pub async fn get_or_allocate_address(&self, node: &str, endpoint: &str) -> Result<Ipv4Addr, AllocationsError> {
        self.lock().await.allocate_address(node, endpoint)
    }

    pub async fn host_subnet(&self, node: &str) -> Option<Ipv4Net> {
        self.lock().await.host_subnet(node)
    }
}

impl Deref for AddressSpaceSync {
    type Target = Mutex<AddressSpace>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for AddressSpaceSync {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<AddressSpace> for AddressSpaceSync {
    fn from(value: AddressSpace) -> Self {
        Self(Mutex::new(value))
    }
}
