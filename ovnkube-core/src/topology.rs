//! Names and desired shapes of every logical network object the control
//! plane owns. Everything here is a pure function of orchestrator state, so
//! reconcilers only have to diff the result against the database.

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddrV4},
};

use ipnet::Ipv4Net;
use maplit::btreemap;

use crate::{
    config::gateway::{GatewayMode, LOCAL_GATEWAY_NETWORK, PHYSICAL_NETWORK},
    ip::{cidr::ClusterCidr, mac_from_ipv4, nth_address},
    kubernetes::annotations::{GatewayAnnotation, PodNetwork},
    nbdb::entities::{
        BindingTarget, Entity, EntityKey, LoadBalancer, LoadBalancerBinding, LogicalRouter,
        LogicalRouterPort, LogicalSwitch, LogicalSwitchPort, Nat, NatKind, Protocol, RoutePolicy,
        StaticRoute,
    },
};

pub const CLUSTER_ROUTER: &str = "ovn_cluster_router";

pub const NODE_EXTERNAL_ID: &str = "k8s-node";
pub const NAMESPACE_EXTERNAL_ID: &str = "namespace";
pub const POD_EXTERNAL_ID: &str = "pod";

pub const SWITCH_SUBNET_OPTION: &str = "subnet";

/// Offset of the switch-to-router port (and endpoint gateway) in a host subnet.
pub const ROUTER_PORT_OFFSET: u32 = 0;
pub const MANAGEMENT_PORT_OFFSET: u32 = 1;

pub const PROTOCOLS: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

pub fn switch_to_router_port(node: &str) -> String {
    format!("stor-{node}")
}

pub fn router_to_switch_port(node: &str) -> String {
    format!("rtos-{node}")
}

pub fn management_port(node: &str) -> String {
    format!("k8s-{node}")
}

pub fn endpoint_port(namespace: &str, pod: &str) -> String {
    format!("{namespace}_{pod}")
}

pub fn cluster_load_balancer(protocol: Protocol) -> String {
    format!("cluster-lb-{protocol}")
}

pub fn gateway_router(node: &str) -> String {
    format!("GR_{node}")
}

pub fn cluster_to_gateway_port(node: &str) -> String {
    format!("rtog-{node}")
}

pub fn gateway_to_cluster_port(node: &str) -> String {
    format!("gtor-{node}")
}

pub fn gateway_uplink_port(node: &str) -> String {
    format!("rtoe-{}", gateway_router(node))
}

pub fn external_switch(node: &str) -> String {
    format!("ext_{node}")
}

pub fn external_to_gateway_port(node: &str) -> String {
    format!("etor-{}", gateway_router(node))
}

pub fn localnet_port(node: &str) -> String {
    format!("lnet-{node}")
}

pub fn gateway_load_balancer(node: &str, protocol: Protocol) -> String {
    format!("{}-lb-{protocol}", gateway_router(node))
}

/// The /30 linking the gateway router of the node at `ordinal` to the
/// cluster router.
pub fn transit_subnet(range: &Ipv4Net, ordinal: u64) -> Option<Ipv4Net> {
    let offset = u32::try_from(ordinal.checked_mul(4)?).ok()?;
    let network = nth_address(&range.trunc(), offset)?;

    Ipv4Net::new(network, 30).ok()
}

pub fn cluster_router() -> LogicalRouter {
    LogicalRouter {
        name: CLUSTER_ROUTER.to_owned(),
        options: BTreeMap::new(),
        external_ids: btreemap! { "k8s-cluster-router".to_owned() => "yes".to_owned() },
    }
}

pub fn cluster_load_balancers() -> Vec<LoadBalancer> {
    PROTOCOLS
        .into_iter()
        .map(|protocol| LoadBalancer {
            name: cluster_load_balancer(protocol),
            protocol,
            external_ids: btreemap! { format!("k8s-cluster-lb-{protocol}") => "yes".to_owned() },
        })
        .collect()
}

/// Cluster-wide objects every node topology hangs off.
pub fn cluster_entities() -> Vec<Entity> {
    let load_balancers = cluster_load_balancers();
    let bindings = load_balancers
        .iter()
        .map(|load_balancer| LoadBalancerBinding {
            load_balancer: load_balancer.name.clone(),
            target: BindingTarget::Router(CLUSTER_ROUTER.to_owned()),
        })
        .collect::<Vec<_>>();

    std::iter::once(Entity::from(cluster_router()))
        .chain(load_balancers.into_iter().map(Entity::from))
        .chain(bindings.into_iter().map(Entity::from))
        .collect()
}

/// Switch, router link and management port of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    pub node: String,
    pub host_subnet: Ipv4Net,
}

impl NodeTopology {
    pub fn new(node: &str, host_subnet: Ipv4Net) -> Self {
        Self {
            node: node.to_owned(),
            host_subnet,
        }
    }

    pub fn router_address(&self) -> Ipv4Addr {
        nth_address(&self.host_subnet, ROUTER_PORT_OFFSET).unwrap_or(self.host_subnet.network())
    }

    pub fn management_address(&self) -> Ipv4Addr {
        nth_address(&self.host_subnet, MANAGEMENT_PORT_OFFSET).unwrap_or(self.host_subnet.network())
    }

    pub fn switch(&self) -> LogicalSwitch {
        LogicalSwitch {
            name: self.node.clone(),
            other_config: btreemap! { SWITCH_SUBNET_OPTION.to_owned() => self.host_subnet.to_string() },
            external_ids: btreemap! { NODE_EXTERNAL_ID.to_owned() => self.node.clone() },
        }
    }

    pub fn router_port(&self) -> LogicalRouterPort {
        let address = self.router_address();

        LogicalRouterPort {
            name: router_to_switch_port(&self.node),
            router: CLUSTER_ROUTER.to_owned(),
            mac: mac_from_ipv4(&address),
            networks: vec![with_prefix(address, &self.host_subnet)],
            peer: None,
        }
    }

    pub fn switch_router_port(&self) -> LogicalSwitchPort {
        router_type_port(
            &self.node,
            &switch_to_router_port(&self.node),
            &router_to_switch_port(&self.node),
        )
    }

    pub fn management_port(&self) -> LogicalSwitchPort {
        let address = self.management_address();
        let mac_address = format!("{} {address}", mac_from_ipv4(&address));

        LogicalSwitchPort {
            name: management_port(&self.node),
            switch: self.node.clone(),
            port_type: String::new(),
            addresses: vec![mac_address],
            port_security: vec![],
            options: BTreeMap::new(),
            tag: None,
            external_ids: BTreeMap::new(),
        }
    }

    pub fn load_balancer_bindings(&self) -> Vec<LoadBalancerBinding> {
        PROTOCOLS
            .into_iter()
            .map(|protocol| LoadBalancerBinding {
                load_balancer: cluster_load_balancer(protocol),
                target: BindingTarget::Switch(self.node.clone()),
            })
            .collect()
    }

    /// Creation order: containers before the things living in them.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = vec![
            self.switch().into(),
            self.router_port().into(),
            self.switch_router_port().into(),
            self.management_port().into(),
        ];
        entities.extend(self.load_balancer_bindings().into_iter().map(Entity::from));

        entities
    }

    /// Removal order. The switch takes its ports and bindings with it.
    pub fn teardown_keys(node: &str) -> Vec<EntityKey> {
        vec![
            EntityKey::LogicalSwitch(node.to_owned()),
            EntityKey::LogicalRouterPort(router_to_switch_port(node)),
        ]
    }
}

/// Endpoint port carrying exactly the attach information of `network`.
pub fn endpoint_switch_port(node: &str, namespace: &str, pod: &str, network: &PodNetwork) -> LogicalSwitchPort {
    let mac_address = format!("{} {}", network.mac, network.ip());

    LogicalSwitchPort {
        name: endpoint_port(namespace, pod),
        switch: node.to_owned(),
        port_type: String::new(),
        addresses: vec![mac_address.clone()],
        port_security: vec![mac_address],
        options: BTreeMap::new(),
        tag: None,
        external_ids: btreemap! {
            NAMESPACE_EXTERNAL_ID.to_owned() => namespace.to_owned(),
            POD_EXTERNAL_ID.to_owned() => pod.to_owned(),
        },
    }
}

/// Attach information of a freshly addressed endpoint.
pub fn pod_network(host_subnet: &Ipv4Net, address: Ipv4Addr, mac: Option<String>) -> PodNetwork {
    PodNetwork {
        address: with_prefix(address, host_subnet),
        gateway: nth_address(host_subnet, ROUTER_PORT_OFFSET).unwrap_or(host_subnet.network()),
        mac: mac.unwrap_or_else(|| mac_from_ipv4(&address)),
    }
}

/// Gateway router of one node, its transit link, uplink, routes and NAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTopology {
    pub node: String,
    pub host_subnet: Ipv4Net,
    pub transit: Ipv4Net,
    pub gateway: GatewayAnnotation,
    pub cluster_cidr: ClusterCidr,
    pub nodeport: bool,
}

impl GatewayTopology {
    fn router_name(&self) -> String {
        gateway_router(&self.node)
    }

    /// Transit address on the cluster router side.
    pub fn cluster_transit_address(&self) -> Ipv4Addr {
        nth_address(&self.transit, 1).unwrap_or(self.transit.network())
    }

    /// Transit address on the gateway router side.
    pub fn gateway_transit_address(&self) -> Ipv4Addr {
        nth_address(&self.transit, 2).unwrap_or(self.transit.network())
    }

    pub fn router(&self) -> LogicalRouter {
        let mut options = BTreeMap::new();
        if let Some(chassis) = &self.gateway.chassis {
            options.insert("chassis".to_owned(), chassis.clone());
        }

        LogicalRouter {
            name: self.router_name(),
            options,
            external_ids: btreemap! {
                NODE_EXTERNAL_ID.to_owned() => self.node.clone(),
                "gateway-mode".to_owned() => self.gateway.mode.to_string(),
            },
        }
    }

    pub fn transit_ports(&self) -> [LogicalRouterPort; 2] {
        let cluster_side = self.cluster_transit_address();
        let gateway_side = self.gateway_transit_address();

        [
            LogicalRouterPort {
                name: cluster_to_gateway_port(&self.node),
                router: CLUSTER_ROUTER.to_owned(),
                mac: mac_from_ipv4(&cluster_side),
                networks: vec![with_prefix(cluster_side, &self.transit)],
                peer: Some(gateway_to_cluster_port(&self.node)),
            },
            LogicalRouterPort {
                name: gateway_to_cluster_port(&self.node),
                router: self.router_name(),
                mac: mac_from_ipv4(&gateway_side),
                networks: vec![with_prefix(gateway_side, &self.transit)],
                peer: Some(cluster_to_gateway_port(&self.node)),
            },
        ]
    }

    pub fn external_switch(&self) -> LogicalSwitch {
        LogicalSwitch {
            name: external_switch(&self.node),
            other_config: BTreeMap::new(),
            external_ids: btreemap! { NODE_EXTERNAL_ID.to_owned() => self.node.clone() },
        }
    }

    pub fn uplink_ports(&self) -> (LogicalRouterPort, LogicalSwitchPort, LogicalSwitchPort) {
        let uplink = LogicalRouterPort {
            name: gateway_uplink_port(&self.node),
            router: self.router_name(),
            mac: mac_from_ipv4(&self.gateway.address.addr()),
            networks: vec![self.gateway.address],
            peer: None,
        };

        let network_name = match self.gateway.mode {
            GatewayMode::Local => LOCAL_GATEWAY_NETWORK,
            GatewayMode::Shared | GatewayMode::Spare => PHYSICAL_NETWORK,
        };

        let localnet = LogicalSwitchPort {
            name: localnet_port(&self.node),
            switch: external_switch(&self.node),
            port_type: "localnet".to_owned(),
            addresses: vec!["unknown".to_owned()],
            port_security: vec![],
            options: btreemap! { "network_name".to_owned() => network_name.to_owned() },
            tag: self.gateway.vlan_id,
            external_ids: BTreeMap::new(),
        };

        let external = router_type_port(
            &external_switch(&self.node),
            &external_to_gateway_port(&self.node),
            &gateway_uplink_port(&self.node),
        );

        (uplink, external, localnet)
    }

    pub fn routes(&self) -> Vec<StaticRoute> {
        let mut routes = vec![StaticRoute {
            router: self.router_name(),
            policy: RoutePolicy::DstIp,
            prefix: Ipv4Net::default(),
            next_hop: self.gateway.next_hop,
            output_port: Some(gateway_uplink_port(&self.node)),
        }];

        routes.extend(self.cluster_cidr.nets().map(|net| StaticRoute {
            router: self.router_name(),
            policy: RoutePolicy::DstIp,
            prefix: net,
            next_hop: self.cluster_transit_address(),
            output_port: None,
        }));

        routes.push(StaticRoute {
            router: CLUSTER_ROUTER.to_owned(),
            policy: RoutePolicy::SrcIp,
            prefix: self.host_subnet,
            next_hop: self.gateway_transit_address(),
            output_port: None,
        });

        routes
    }

    pub fn snat_rules(&self) -> Vec<Nat> {
        self.cluster_cidr
            .nets()
            .map(|net| Nat {
                router: self.router_name(),
                kind: NatKind::Snat,
                external_ip: self.gateway.address.addr(),
                logical_ip: net,
            })
            .collect()
    }

    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        if !self.nodeport {
            return vec![];
        }

        PROTOCOLS
            .into_iter()
            .map(|protocol| LoadBalancer {
                name: gateway_load_balancer(&self.node, protocol),
                protocol,
                external_ids: btreemap! {
                    format!("{}_lb_gateway_router", protocol.as_str().to_uppercase()) => self.router_name(),
                },
            })
            .collect()
    }

    /// Addresses NodePort services are exposed on.
    pub fn nodeport_address(&self) -> Ipv4Addr {
        self.gateway.address.addr()
    }

    pub fn nodeport_vip(&self, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(self.nodeport_address(), port)
    }

    /// Creation order: router, transit link, uplink, routes, NAT, NodePort
    /// load balancers.
    pub fn entities(&self) -> Vec<Entity> {
        let [cluster_side, gateway_side] = self.transit_ports();
        let (uplink, external, localnet) = self.uplink_ports();

        let mut entities = vec![
            self.router().into(),
            gateway_side.into(),
            cluster_side.into(),
            uplink.into(),
            self.external_switch().into(),
            external.into(),
            localnet.into(),
        ];

        entities.extend(self.routes().into_iter().map(Entity::from));
        entities.extend(self.snat_rules().into_iter().map(Entity::from));

        for load_balancer in self.load_balancers() {
            let binding = LoadBalancerBinding {
                load_balancer: load_balancer.name.clone(),
                target: BindingTarget::Router(self.router_name()),
            };

            entities.push(load_balancer.into());
            entities.push(binding.into());
        }

        entities
    }

    /// Removal order, the reverse of [`GatewayTopology::entities`]. Objects
    /// living in the gateway router go away with it.
    pub fn teardown_keys(node: &str, host_subnet: Option<Ipv4Net>) -> Vec<EntityKey> {
        let mut keys = PROTOCOLS
            .into_iter()
            .map(|protocol| EntityKey::LoadBalancer(gateway_load_balancer(node, protocol)))
            .collect::<Vec<_>>();

        if let Some(host_subnet) = host_subnet {
            keys.push(EntityKey::StaticRoute {
                router: CLUSTER_ROUTER.to_owned(),
                policy: RoutePolicy::SrcIp,
                prefix: host_subnet,
            });
        }

        keys.extend([
            EntityKey::LogicalSwitch(external_switch(node)),
            EntityKey::LogicalRouterPort(cluster_to_gateway_port(node)),
            EntityKey::LogicalRouter(gateway_router(node)),
        ]);

        keys
    }
}

fn router_type_port(switch: &str, name: &str, router_port: &str) -> LogicalSwitchPort {
    LogicalSwitchPort {
        name: name.to_owned(),
        switch: switch.to_owned(),
        port_type: "router".to_owned(),
        addresses: vec!["router".to_owned()],
        port_security: vec![],
        options: btreemap! { "router-port".to_owned() => router_port.to_owned() },
        tag: None,
        external_ids: BTreeMap::new(),
    }
}

fn with_prefix(address: Ipv4Addr, subnet: &Ipv4Net) -> Ipv4Net {
    Ipv4Net::new(address, subnet.prefix_len()).unwrap_or(*subnet)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::{
        config::gateway::GatewayMode,
        kubernetes::annotations::GatewayAnnotation,
        nbdb::entities::{Entity, EntityKey, RoutePolicy},
    };

    use super::{
        cluster_entities, endpoint_switch_port, pod_network, transit_subnet, GatewayTopology,
        NodeTopology,
    };

    #[test]
    fn node_topology_uses_the_first_two_addresses() {
        let topology = NodeTopology::new("n1", "10.0.1.0/24".parse().unwrap());

        assert_eq!(topology.router_address(), Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(topology.management_address(), Ipv4Addr::new(10, 0, 1, 1));

        let router_port = topology.router_port();

        assert_eq!(router_port.name, "rtos-n1");
        assert_eq!(router_port.mac, "0a:58:0a:00:01:00");
        assert_eq!(router_port.networks, vec!["10.0.1.0/24".parse().unwrap()]);

        let switch_port = topology.switch_router_port();

        assert_eq!(switch_port.name, "stor-n1");
        assert_eq!(switch_port.options["router-port"], "rtos-n1");
        assert_eq!(
            topology.management_port().addresses,
            vec!["0a:58:0a:00:01:01 10.0.1.1".to_owned()]
        );

        // parents come first
        assert!(matches!(topology.entities()[0], Entity::LogicalSwitch(_)));
    }

    #[test]
    fn endpoint_port_is_locked_to_its_address() {
        let subnet = "10.0.0.0/24".parse().unwrap();
        let network = pod_network(&subnet, Ipv4Addr::new(10, 0, 0, 2), None);

        assert_eq!(
            network.to_string(),
            "address=10.0.0.2/24,gateway=10.0.0.0,mac=0a:58:0a:00:00:02"
        );

        let port = endpoint_switch_port("n1", "default", "web", &network);

        assert_eq!(port.name, "default_web");
        assert_eq!(port.addresses, vec!["0a:58:0a:00:00:02 10.0.0.2".to_owned()]);
        assert_eq!(port.port_security, port.addresses);

        let preset = pod_network(&subnet, Ipv4Addr::new(10, 0, 0, 7), Some("0a:00:00:00:00:01".to_owned()));

        assert_eq!(preset.mac, "0a:00:00:00:00:01");
    }

    #[test]
    fn transit_subnets_follow_the_ordinal() {
        let range = "100.64.0.0/16".parse().unwrap();

        assert_eq!(transit_subnet(&range, 0), Some("100.64.0.0/30".parse().unwrap()));
        assert_eq!(transit_subnet(&range, 5), Some("100.64.0.20/30".parse().unwrap()));
        assert_eq!(transit_subnet(&range, 16384), None);
    }

    #[test]
    fn cluster_objects_are_ordered_for_creation() {
        let entities = cluster_entities();

        assert!(matches!(entities[0], Entity::LogicalRouter(_)));
        assert!(matches!(entities[1], Entity::LoadBalancer(_)));
        assert!(matches!(entities[2], Entity::LoadBalancer(_)));
        assert!(matches!(entities[3], Entity::LoadBalancerBinding(_)));
        assert_eq!(entities.len(), 5);
    }

    #[test]
    fn gateway_topology_links_both_routers() {
        let topology = GatewayTopology {
            node: "n1".to_owned(),
            host_subnet: "10.0.1.0/24".parse().unwrap(),
            transit: "100.64.0.4/30".parse().unwrap(),
            gateway: GatewayAnnotation {
                mode: GatewayMode::Shared,
                interface: "eth1".to_owned(),
                address: "192.168.1.10/24".parse().unwrap(),
                next_hop: Ipv4Addr::new(192, 168, 1, 1),
                vlan_id: Some(20),
                chassis: Some("4a1c".to_owned()),
            },
            cluster_cidr: "10.0.0.0/16/24".parse().unwrap(),
            nodeport: true,
        };

        let [cluster_side, gateway_side] = topology.transit_ports();

        assert_eq!(cluster_side.networks, vec!["100.64.0.5/30".parse().unwrap()]);
        assert_eq!(gateway_side.networks, vec!["100.64.0.6/30".parse().unwrap()]);
        assert_eq!(cluster_side.peer.as_deref(), Some("gtor-n1"));
        assert_eq!(topology.router().options["chassis"], "4a1c");

        let routes = topology.routes();

        assert_eq!(routes[0].prefix, "0.0.0.0/0".parse().unwrap());
        assert_eq!(routes[0].output_port.as_deref(), Some("rtoe-GR_n1"));
        assert_eq!(routes[1].next_hop, Ipv4Addr::new(100, 64, 0, 5));
        assert_eq!(routes[2].policy, RoutePolicy::SrcIp);
        assert_eq!(routes[2].next_hop, Ipv4Addr::new(100, 64, 0, 6));

        let snat = topology.snat_rules();

        assert_eq!(snat.len(), 1);
        assert_eq!(snat[0].external_ip, Ipv4Addr::new(192, 168, 1, 10));

        let (_, _, localnet) = topology.uplink_ports();

        assert_eq!(localnet.tag, Some(20));
        assert_eq!(localnet.options["network_name"], "physnet");
        assert_eq!(topology.load_balancers().len(), 2);

        let teardown = GatewayTopology::teardown_keys("n1", Some(topology.host_subnet));

        assert_eq!(teardown.last(), Some(&EntityKey::LogicalRouter("GR_n1".to_owned())));
    }
}
