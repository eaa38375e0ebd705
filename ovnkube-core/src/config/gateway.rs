use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

use ipnet::Ipv4Net;
use thiserror::Error;

/// Uplink used by local gateways, the host side answers on `.1`.
pub const LOCAL_GATEWAY_ADDRESS: &str = "169.254.33.2/24";
pub const LOCAL_GATEWAY_NEXT_HOP: Ipv4Addr = Ipv4Addr::new(169, 254, 33, 1);
pub const LOCAL_GATEWAY_INTERFACE: &str = "br-local";
/// Physical network name local gateways bind their localnet port to.
pub const LOCAL_GATEWAY_NETWORK: &str = "locnet";
pub const PHYSICAL_NETWORK: &str = "physnet";

pub const DEFAULT_TRANSIT_RANGE: &str = "100.64.0.0/16";

pub const MAX_VLAN_ID: u16 = 4094;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GatewayConfigError {
    #[error("--{} is only valid together with --init-gateways!", .0)]
    RequiresInitGateways(&'static str),
    #[error("--init-gateways is only valid together with --init-node!")]
    RequiresInitNode,
    #[error("--gateway-local can't be combined with --{}!", .0)]
    LocalConflict(&'static str),
    #[error("--gateway-interface is required for shared and spare gateways!")]
    InterfaceMissing,
    #[error("--gateway-nexthop is required for shared and spare gateways!")]
    NextHopMissing,
    #[error("--gateway-ip is required for shared and spare gateways!")]
    AddressMissing,
    #[error("VLAN id {} is out of the 1-{} range!", .0, MAX_VLAN_ID)]
    InvalidVlan(u16),
    #[error("Gateway next hop {} is outside of {}!", .0, .1)]
    NextHopOutsideUplink(Ipv4Addr, Ipv4Net),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// the uplink interface keeps carrying host traffic
    Shared,
    /// the uplink interface is dedicated to OVN
    Spare,
    /// NAT through the host network stack
    Local,
}

impl Display for GatewayMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GatewayMode::Shared => "shared",
            GatewayMode::Spare => "spare",
            GatewayMode::Local => "local",
        })
    }
}

impl FromStr for GatewayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(GatewayMode::Shared),
            "spare" => Ok(GatewayMode::Spare),
            "local" => Ok(GatewayMode::Local),
            other => Err(format!("unknown gateway mode '{other}'")),
        }
    }
}

/// Gateway related command line switches, unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayOptions {
    pub init_gateways: bool,
    pub interface: Option<String>,
    pub next_hop: Option<Ipv4Addr>,
    pub address: Option<Ipv4Net>,
    pub spare_interface: bool,
    pub local: bool,
    pub vlan_id: Option<u16>,
}

/// What this node advertises as its gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub mode: GatewayMode,
    pub interface: String,
    pub address: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub vlan_id: Option<u16>,
}

impl GatewayOptions {
    /// Rejects every combination without a documented meaning instead of
    /// picking one of the flags.
    pub fn validate(&self, node_mode: bool) -> Result<Option<GatewaySettings>, GatewayConfigError> {
        if !self.init_gateways {
            let stray = [
                ("gateway-interface", self.interface.is_some()),
                ("gateway-nexthop", self.next_hop.is_some()),
                ("gateway-ip", self.address.is_some()),
                ("gateway-spare-interface", self.spare_interface),
                ("gateway-local", self.local),
                ("gateway-vlanid", self.vlan_id.is_some()),
            ]
            .into_iter()
            .find(|(_, present)| *present);

            return match stray {
                Some((flag, _)) => Err(GatewayConfigError::RequiresInitGateways(flag)),
                None => Ok(None),
            };
        }

        if !node_mode {
            return Err(GatewayConfigError::RequiresInitNode);
        }

        if let Some(vlan_id) = self.vlan_id {
            if vlan_id == 0 || vlan_id > MAX_VLAN_ID {
                return Err(GatewayConfigError::InvalidVlan(vlan_id));
            }
        }

        if self.local {
            let conflict = [
                ("gateway-spare-interface", self.spare_interface),
                ("gateway-vlanid", self.vlan_id.is_some()),
                ("gateway-interface", self.interface.is_some()),
                ("gateway-nexthop", self.next_hop.is_some()),
                ("gateway-ip", self.address.is_some()),
            ]
            .into_iter()
            .find(|(_, present)| *present);

            if let Some((flag, _)) = conflict {
                return Err(GatewayConfigError::LocalConflict(flag));
            }

            let address = LOCAL_GATEWAY_ADDRESS
                .parse()
                .map_err(|_| GatewayConfigError::AddressMissing)?;

            return Ok(Some(GatewaySettings {
                mode: GatewayMode::Local,
                interface: LOCAL_GATEWAY_INTERFACE.to_owned(),
                address,
                next_hop: LOCAL_GATEWAY_NEXT_HOP,
                vlan_id: None,
            }));
        }

        let interface = self
            .interface
            .clone()
            .ok_or(GatewayConfigError::InterfaceMissing)?;
        let next_hop = self.next_hop.ok_or(GatewayConfigError::NextHopMissing)?;
        let address = self.address.ok_or(GatewayConfigError::AddressMissing)?;

        if !address.contains(&next_hop) {
            return Err(GatewayConfigError::NextHopOutsideUplink(next_hop, address));
        }

        Ok(Some(GatewaySettings {
            mode: match self.spare_interface {
                true => GatewayMode::Spare,
                false => GatewayMode::Shared,
            },
            interface,
            address,
            next_hop,
            vlan_id: self.vlan_id,
        }))
    }
}
