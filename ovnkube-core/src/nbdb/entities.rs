use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    net::{Ipv4Addr, SocketAddrV4},
};

use ipnet::Ipv4Net;

pub type ExternalIds = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    LogicalSwitch,
    LogicalSwitchPort,
    LogicalRouter,
    LogicalRouterPort,
    StaticRoute,
    Nat,
    LoadBalancer,
    LoadBalancerVip,
    LoadBalancerBinding,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::LogicalSwitch,
        EntityKind::LogicalSwitchPort,
        EntityKind::LogicalRouter,
        EntityKind::LogicalRouterPort,
        EntityKind::StaticRoute,
        EntityKind::Nat,
        EntityKind::LoadBalancer,
        EntityKind::LoadBalancerVip,
        EntityKind::LoadBalancerBinding,
    ];
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntityKind::LogicalSwitch => "logical switch",
            EntityKind::LogicalSwitchPort => "logical switch port",
            EntityKind::LogicalRouter => "logical router",
            EntityKind::LogicalRouterPort => "logical router port",
            EntityKind::StaticRoute => "static route",
            EntityKind::Nat => "NAT rule",
            EntityKind::LoadBalancer => "load balancer",
            EntityKind::LoadBalancerVip => "load balancer VIP",
            EntityKind::LoadBalancerBinding => "load balancer binding",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoutePolicy {
    DstIp,
    SrcIp,
}

impl RoutePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePolicy::DstIp => "dst-ip",
            RoutePolicy::SrcIp => "src-ip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NatKind {
    Snat,
}

impl NatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatKind::Snat => "snat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BindingTarget {
    Switch(String),
    Router(String),
}

/// Identity of a single northbound database object. Entities refer to each
/// other through these instead of holding references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    LogicalSwitch(String),
    LogicalSwitchPort(String),
    LogicalRouter(String),
    LogicalRouterPort(String),
    StaticRoute {
        router: String,
        policy: RoutePolicy,
        prefix: Ipv4Net,
    },
    Nat {
        router: String,
        kind: NatKind,
        logical_ip: Ipv4Net,
    },
    LoadBalancer(String),
    LoadBalancerVip {
        load_balancer: String,
        vip: SocketAddrV4,
    },
    LoadBalancerBinding {
        load_balancer: String,
        target: BindingTarget,
    },
}

impl EntityKey {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::LogicalSwitch(_) => EntityKind::LogicalSwitch,
            EntityKey::LogicalSwitchPort(_) => EntityKind::LogicalSwitchPort,
            EntityKey::LogicalRouter(_) => EntityKind::LogicalRouter,
            EntityKey::LogicalRouterPort(_) => EntityKind::LogicalRouterPort,
            EntityKey::StaticRoute { .. } => EntityKind::StaticRoute,
            EntityKey::Nat { .. } => EntityKind::Nat,
            EntityKey::LoadBalancer(_) => EntityKind::LoadBalancer,
            EntityKey::LoadBalancerVip { .. } => EntityKind::LoadBalancerVip,
            EntityKey::LoadBalancerBinding { .. } => EntityKind::LoadBalancerBinding,
        }
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::LogicalSwitch(name)
            | EntityKey::LogicalSwitchPort(name)
            | EntityKey::LogicalRouter(name)
            | EntityKey::LogicalRouterPort(name)
            | EntityKey::LoadBalancer(name) => write!(f, "{} '{name}'", self.kind()),
            EntityKey::StaticRoute {
                router,
                policy,
                prefix,
            } => write!(f, "{} {prefix} ({}) on '{router}'", self.kind(), policy.as_str()),
            EntityKey::Nat {
                router,
                kind,
                logical_ip,
            } => write!(f, "{} {} {logical_ip} on '{router}'", self.kind(), kind.as_str()),
            EntityKey::LoadBalancerVip { load_balancer, vip } => {
                write!(f, "{} {vip} on '{load_balancer}'", self.kind())
            }
            EntityKey::LoadBalancerBinding {
                load_balancer,
                target,
            } => match target {
                BindingTarget::Switch(name) => {
                    write!(f, "{} of '{load_balancer}' to switch '{name}'", self.kind())
                }
                BindingTarget::Router(name) => {
                    write!(f, "{} of '{load_balancer}' to router '{name}'", self.kind())
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalSwitch {
    pub name: String,
    pub other_config: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalSwitchPort {
    pub name: String,
    pub switch: String,
    /// empty for regular VIF ports
    pub port_type: String,
    pub addresses: Vec<String>,
    pub port_security: Vec<String>,
    pub options: BTreeMap<String, String>,
    /// VLAN of localnet ports
    pub tag: Option<u16>,
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRouter {
    pub name: String,
    pub options: BTreeMap<String, String>,
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalRouterPort {
    pub name: String,
    pub router: String,
    pub mac: String,
    pub networks: Vec<Ipv4Net>,
    pub peer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub router: String,
    pub policy: RoutePolicy,
    pub prefix: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub output_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nat {
    pub router: String,
    pub kind: NatKind,
    pub external_ip: Ipv4Addr,
    pub logical_ip: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancer {
    pub name: String,
    pub protocol: Protocol,
    pub external_ids: ExternalIds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerVip {
    pub load_balancer: String,
    pub vip: SocketAddrV4,
    /// kept sorted so equal sets compare equal
    pub backends: Vec<SocketAddrV4>,
}

impl LoadBalancerVip {
    pub fn new(load_balancer: impl Into<String>, vip: SocketAddrV4, backends: impl IntoIterator<Item = SocketAddrV4>) -> Self {
        let mut backends = backends.into_iter().collect::<Vec<_>>();
        backends.sort_by_key(|backend| backend.to_string());
        backends.dedup();

        Self {
            load_balancer: load_balancer.into(),
            vip,
            backends,
        }
    }

    pub fn backends_string(&self) -> String {
        self.backends
            .iter()
            .map(|backend| backend.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerBinding {
    pub load_balancer: String,
    pub target: BindingTarget,
}

/// A fully specified desired state of one database object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    LogicalSwitch(LogicalSwitch),
    LogicalSwitchPort(LogicalSwitchPort),
    LogicalRouter(LogicalRouter),
    LogicalRouterPort(LogicalRouterPort),
    StaticRoute(StaticRoute),
    Nat(Nat),
    LoadBalancer(LoadBalancer),
    LoadBalancerVip(LoadBalancerVip),
    LoadBalancerBinding(LoadBalancerBinding),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::LogicalSwitch(switch) => EntityKey::LogicalSwitch(switch.name.clone()),
            Entity::LogicalSwitchPort(port) => EntityKey::LogicalSwitchPort(port.name.clone()),
            Entity::LogicalRouter(router) => EntityKey::LogicalRouter(router.name.clone()),
            Entity::LogicalRouterPort(port) => EntityKey::LogicalRouterPort(port.name.clone()),
            Entity::StaticRoute(route) => EntityKey::StaticRoute {
                router: route.router.clone(),
                policy: route.policy,
                prefix: route.prefix,
            },
            Entity::Nat(nat) => EntityKey::Nat {
                router: nat.router.clone(),
                kind: nat.kind,
                logical_ip: nat.logical_ip,
            },
            Entity::LoadBalancer(load_balancer) => EntityKey::LoadBalancer(load_balancer.name.clone()),
            Entity::LoadBalancerVip(vip) => EntityKey::LoadBalancerVip {
                load_balancer: vip.load_balancer.clone(),
                vip: vip.vip,
            },
            Entity::LoadBalancerBinding(binding) => EntityKey::LoadBalancerBinding {
                load_balancer: binding.load_balancer.clone(),
                target: binding.target.clone(),
            },
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.key().kind()
    }

    /// Key of the object this one lives in, if any.
    pub fn parent(&self) -> Option<EntityKey> {
        match self {
            Entity::LogicalSwitch(_) | Entity::LogicalRouter(_) | Entity::LoadBalancer(_) => None,
            Entity::LogicalSwitchPort(port) => Some(EntityKey::LogicalSwitch(port.switch.clone())),
            Entity::LogicalRouterPort(port) => Some(EntityKey::LogicalRouter(port.router.clone())),
            Entity::StaticRoute(route) => Some(EntityKey::LogicalRouter(route.router.clone())),
            Entity::Nat(nat) => Some(EntityKey::LogicalRouter(nat.router.clone())),
            Entity::LoadBalancerVip(vip) => Some(EntityKey::LoadBalancer(vip.load_balancer.clone())),
            Entity::LoadBalancerBinding(binding) => {
                Some(EntityKey::LoadBalancer(binding.load_balancer.clone()))
            }
        }
    }
}

impl From<LogicalSwitch> for Entity {
    fn from(value: LogicalSwitch) -> Self {
        Entity::LogicalSwitch(value)
    }
}

impl From<LogicalSwitchPort> for Entity {
    fn from(value: LogicalSwitchPort) -> Self {
        Entity::LogicalSwitchPort(value)
    }
}

impl From<LogicalRouter> for Entity {
    fn from(value: LogicalRouter) -> Self {
        Entity::LogicalRouter(value)
    }
}

impl From<LogicalRouterPort> for Entity {
    fn from(value: LogicalRouterPort) -> Self {
        Entity::LogicalRouterPort(value)
    }
}

impl From<StaticRoute> for Entity {
    fn from(value: StaticRoute) -> Self {
        Entity::StaticRoute(value)
    }
}

impl From<Nat> for Entity {
    fn from(value: Nat) -> Self {
        Entity::Nat(value)
    }
}

impl From<LoadBalancer> for Entity {
    fn from(value: LoadBalancer) -> Self {
        Entity::LoadBalancer(value)
    }
}

impl From<LoadBalancerVip> for Entity {
    fn from(value: LoadBalancerVip) -> Self {
        Entity::LoadBalancerVip(value)
    }
}

impl From<LoadBalancerBinding> for Entity {
    fn from(value: LoadBalancerBinding) -> Self {
        Entity::LoadBalancerBinding(value)
    }
}
