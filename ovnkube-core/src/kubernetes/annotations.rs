use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::{
    config::gateway::{GatewayMode, GatewaySettings},
    ip::is_valid_mac,
};

/// Node annotation holding the node's host subnet. Authoritative across
/// restarts.
pub const HOST_SUBNET_ANNOTATION: &str = "k8s.ovn.org/host-subnet";
/// Pod annotation consumed by the attach agent.
pub const POD_NETWORK_ANNOTATION: &str = "k8s.ovn.org/pod-network";
/// Node annotation advertising the node's gateway role.
pub const L3_GATEWAY_ANNOTATION: &str = "k8s.ovn.org/l3-gateway-config";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("Annotation value '{}' is not a list of key=value pairs!", .0)]
    Malformed(String),
    #[error("Annotation is missing the '{}' field!", .0)]
    MissingField(&'static str),
    #[error("Annotation field '{}' has an invalid value '{}'!", .0, .1)]
    InvalidField(&'static str, String),
}

fn fields(value: &str) -> Result<BTreeMap<&str, &str>, AnnotationError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .ok_or_else(|| AnnotationError::Malformed(value.to_owned()))
        })
        .collect()
}

fn required<'a>(fields: &BTreeMap<&str, &'a str>, name: &'static str) -> Result<&'a str, AnnotationError> {
    fields
        .get(name)
        .copied()
        .ok_or(AnnotationError::MissingField(name))
}

fn parse_field<T: FromStr>(name: &'static str, value: &str) -> Result<T, AnnotationError> {
    value
        .parse()
        .map_err(|_| AnnotationError::InvalidField(name, value.to_owned()))
}

pub fn parse_host_subnet(value: &str) -> Result<Ipv4Net, AnnotationError> {
    let subnet = parse_field::<Ipv4Net>("host-subnet", value.trim())?;

    if subnet.trunc() != subnet {
        return Err(AnnotationError::InvalidField("host-subnet", value.to_owned()));
    }

    Ok(subnet)
}

/// What the attach agent needs to plumb an endpoint:
/// `address=10.0.0.2/24,gateway=10.0.0.0,mac=0a:58:0a:00:00:02`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNetwork {
    /// endpoint address with the host subnet's prefix length
    pub address: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub mac: String,
}

impl PodNetwork {
    pub fn ip(&self) -> Ipv4Addr {
        self.address.addr()
    }
}

impl Display for PodNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address={},gateway={},mac={}",
            self.address, self.gateway, self.mac
        )
    }
}

impl FromStr for PodNetwork {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = fields(s)?;
        let mac = required(&fields, "mac")?.to_lowercase();

        if !is_valid_mac(&mac) {
            return Err(AnnotationError::InvalidField("mac", mac));
        }

        Ok(Self {
            address: parse_field("address", required(&fields, "address")?)?,
            gateway: parse_field("gateway", required(&fields, "gateway")?)?,
            mac,
        })
    }
}

/// Gateway role advertised by a node:
/// `mode=shared,interface=eth1,ip-address=192.168.1.10/24,next-hop=192.168.1.1[,vlan-id=10][,chassis=<id>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAnnotation {
    pub mode: GatewayMode,
    pub interface: String,
    pub address: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub vlan_id: Option<u16>,
    /// OVS system id of the chassis the gateway router gets pinned to
    pub chassis: Option<String>,
}

impl GatewayAnnotation {
    pub fn from_settings(settings: &GatewaySettings, chassis: Option<String>) -> Self {
        Self {
            mode: settings.mode,
            interface: settings.interface.clone(),
            address: settings.address,
            next_hop: settings.next_hop,
            vlan_id: settings.vlan_id,
            chassis,
        }
    }
}

impl Display for GatewayAnnotation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mode={},interface={},ip-address={},next-hop={}",
            self.mode, self.interface, self.address, self.next_hop
        )?;

        if let Some(vlan_id) = self.vlan_id {
            write!(f, ",vlan-id={vlan_id}")?;
        }

        if let Some(chassis) = &self.chassis {
            write!(f, ",chassis={chassis}")?;
        }

        Ok(())
    }
}

impl FromStr for GatewayAnnotation {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = fields(s)?;

        Ok(Self {
            mode: parse_field("mode", required(&fields, "mode")?)?,
            interface: required(&fields, "interface")?.to_owned(),
            address: parse_field("ip-address", required(&fields, "ip-address")?)?,
            next_hop: parse_field("next-hop", required(&fields, "next-hop")?)?,
            vlan_id: fields
                .get("vlan-id")
                .map(|vlan| parse_field("vlan-id", vlan))
                .transpose()?,
            chassis: fields
                .get("chassis")
                .filter(|chassis| !chassis.is_empty())
                .map(|chassis| (*chassis).to_owned()),
        })
    }
}
