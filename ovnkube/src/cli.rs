use std::{net::Ipv4Addr, path::PathBuf};

use clap::Parser;
use ipnet::Ipv4Net;
use ovnkube_core::config::{
    gateway::GatewayOptions, ovn_auth::RawOvnAuth, ConfigLayer, Discovery,
};

#[derive(Debug, Parser)]
#[command(version, about = "run ovnkube to start master, node, and gateway services")]
pub struct Cli {
    /// configuration file path (defaults to /etc/openvswitch/ovn_k8s.conf)
    #[arg(long)]
    pub config_file: Option<PathBuf>,
    /// write the process ID to this file and refuse to start if it's held by a live process
    #[arg(long)]
    pub pidfile: Option<PathBuf>,
    /// look up missing Kubernetes and northbound settings in the local OVS external_ids
    #[arg(long)]
    pub discover_external_ids: bool,

    /// cluster wide IP subnets in the CIDR/host-prefix-length[,...] format
    #[arg(long)]
    pub cluster_subnet: Option<String>,
    /// service CIDR, used to keep host subnets clear of service addresses
    #[arg(long)]
    pub service_cluster_ip_range: Option<String>,
    /// run the cluster master on the given node
    #[arg(long, value_name = "NODE")]
    pub init_master: Option<String>,
    /// run the node agent for the given node
    #[arg(long, value_name = "NODE")]
    pub init_node: Option<String>,
    /// run the network controller programming endpoints and services
    #[arg(long)]
    pub net_controller: bool,
    /// expose NodePort services on the gateway routers
    #[arg(long)]
    pub nodeport: bool,
    /// northbound database runs replicated; only affects how clients connect
    #[arg(long)]
    pub ha: bool,

    /// advertise this node as a gateway
    #[arg(long)]
    pub init_gateways: bool,
    /// uplink interface of the gateway
    #[arg(long)]
    pub gateway_interface: Option<String>,
    /// external next hop of the gateway
    #[arg(long)]
    pub gateway_nexthop: Option<Ipv4Addr>,
    /// uplink address of the gateway in CIDR notation
    #[arg(long)]
    pub gateway_ip: Option<Ipv4Net>,
    /// the uplink interface is dedicated to OVN
    #[arg(long)]
    pub gateway_spare_interface: bool,
    /// NAT through the host network stack instead of a physical uplink
    #[arg(long)]
    pub gateway_local: bool,
    /// VLAN tag of the uplink network
    #[arg(long)]
    pub gateway_vlanid: Option<u16>,

    /// northbound database address, <scheme>:<ip>:<port>[,...]
    #[arg(long)]
    pub nb_address: Option<String>,
    #[arg(long)]
    pub nb_client_privkey: Option<String>,
    #[arg(long)]
    pub nb_client_cert: Option<String>,
    #[arg(long)]
    pub nb_client_cacert: Option<String>,
    /// southbound database address, <scheme>:<ip>:<port>[,...]
    #[arg(long)]
    pub sb_address: Option<String>,
    #[arg(long)]
    pub sb_client_privkey: Option<String>,
    #[arg(long)]
    pub sb_client_cert: Option<String>,
    #[arg(long)]
    pub sb_client_cacert: Option<String>,

    #[arg(long)]
    pub k8s_apiserver: Option<String>,
    #[arg(long)]
    pub k8s_cacert: Option<String>,
    #[arg(long)]
    pub k8s_token: Option<String>,
    #[arg(long)]
    pub k8s_kubeconfig: Option<String>,

    #[arg(long)]
    pub mtu: Option<u32>,
    #[arg(long)]
    pub conntrack_zone: Option<u32>,
    #[arg(long)]
    pub encap_type: Option<String>,
    #[arg(long)]
    pub encap_ip: Option<String>,
    /// milliseconds
    #[arg(long = "inactivity-probe-ms")]
    pub inactivity_interval: Option<u32>,
    #[arg(long)]
    pub cni_conf_dir: Option<String>,
    #[arg(long)]
    pub cni_plugin: Option<String>,

    /// 5=debug, 4=info, 3=warn, 2=error, 1=fatal
    #[arg(long)]
    pub loglevel: Option<u8>,
    /// log to this file instead of stderr
    #[arg(long)]
    pub logfile: Option<String>,
}

impl Cli {
    /// Highest precedence configuration layer.
    pub fn config_layer(&self) -> ConfigLayer {
        ConfigLayer {
            mtu: self.mtu,
            conntrack_zone: self.conntrack_zone,
            encap_type: self.encap_type.clone(),
            encap_ip: self.encap_ip.clone(),
            inactivity_interval: self.inactivity_interval,
            loglevel: self.loglevel,
            logfile: self.logfile.clone(),
            cni_conf_dir: self.cni_conf_dir.clone(),
            cni_plugin: self.cni_plugin.clone(),
            k8s_kubeconfig: self.k8s_kubeconfig.clone(),
            k8s_cacert: self.k8s_cacert.clone(),
            k8s_apiserver: self.k8s_apiserver.clone(),
            k8s_token: self.k8s_token.clone(),
            ovn_north: RawOvnAuth {
                address: self.nb_address.clone(),
                client_privkey: self.nb_client_privkey.clone(),
                client_cert: self.nb_client_cert.clone(),
                client_cacert: self.nb_client_cacert.clone(),
            },
            ovn_south: RawOvnAuth {
                address: self.sb_address.clone(),
                client_privkey: self.sb_client_privkey.clone(),
                client_cert: self.sb_client_cert.clone(),
                client_cacert: self.sb_client_cacert.clone(),
            },
            cluster_subnet: self.cluster_subnet.clone(),
            service_cluster_ip_range: self.service_cluster_ip_range.clone(),
            transit_range: None,
        }
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            init_gateways: self.init_gateways,
            interface: self.gateway_interface.clone(),
            next_hop: self.gateway_nexthop,
            address: self.gateway_ip,
            spare_interface: self.gateway_spare_interface,
            local: self.gateway_local,
            vlan_id: self.gateway_vlanid,
        }
    }

    pub fn discovery(&self) -> Discovery {
        if self.discover_external_ids {
            Discovery::all()
        } else {
            Discovery::default()
        }
    }

    /// Whether the cluster side reconcilers run in this process.
    pub fn runs_control_plane(&self) -> bool {
        self.init_master.is_some() || self.net_controller
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn flags_map_onto_the_config_layer() {
        let cli = Cli::parse_from([
            "ovnkube",
            "--init-master",
            "master-0",
            "--cluster-subnet",
            "10.0.0.0/16/24",
            "--nb-address",
            "ssl://1.2.3.4:6641",
            "--nb-client-cert",
            "/etc/ovn/cert.pem",
            "--loglevel",
            "5",
            "--gateway-vlanid",
            "20",
        ]);

        let layer = cli.config_layer();

        assert!(cli.runs_control_plane());
        assert_eq!(layer.cluster_subnet.as_deref(), Some("10.0.0.0/16/24"));
        assert_eq!(layer.ovn_north.address.as_deref(), Some("ssl://1.2.3.4:6641"));
        assert_eq!(layer.ovn_north.client_cert.as_deref(), Some("/etc/ovn/cert.pem"));
        assert_eq!(layer.ovn_north.client_privkey, None);
        assert_eq!(layer.loglevel, Some(5));
        assert_eq!(cli.gateway_options().vlan_id, Some(20));
        assert_eq!(cli.discovery(), Default::default());
    }

    #[test]
    fn node_only_does_not_run_the_control_plane() {
        let cli = Cli::parse_from(["ovnkube", "--init-node", "worker-1", "--k8s-token", "abc"]);

        assert!(!cli.runs_control_plane());
        assert_eq!(cli.init_node.as_deref(), Some("worker-1"));
    }
}
