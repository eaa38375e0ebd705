use std::{
    net::IpAddr,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use log::debug;
use thiserror::Error;
use url::Url;

use crate::ip::cidr::{CidrError, ClusterCidr};

use self::{
    external_ids::{
        ExternalIds, EXTERNAL_ID_K8S_API_SERVER, EXTERNAL_ID_K8S_API_TOKEN,
        EXTERNAL_ID_K8S_CA_CERTIFICATE, EXTERNAL_ID_OVN_NB,
    },
    file::load_config_file,
    gateway::{GatewayConfigError, DEFAULT_TRANSIT_RANGE},
    ovn_auth::{OvnAuthError, OvnDbAuth, OvnDirection, RawOvnAuth},
};

pub mod external_ids;
pub mod file;
pub mod gateway;
pub mod ovn_auth;

pub const DEFAULT_MTU: u32 = 1400;
pub const DEFAULT_CONNTRACK_ZONE: u32 = 64000;
pub const DEFAULT_ENCAP_TYPE: &str = "geneve";
pub const DEFAULT_INACTIVITY_INTERVAL_MS: u32 = 100000;
pub const DEFAULT_LOG_LEVEL: u8 = 4;
pub const DEFAULT_CNI_CONF_DIR: &str = "/etc/cni/net.d";
pub const DEFAULT_CNI_PLUGIN: &str = "ovn-k8s-cni-overlay";
pub const DEFAULT_K8S_APISERVER: &str = "http://localhost:8080";
pub const DEFAULT_CLUSTER_SUBNET: &str = "11.11.0.0/16";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}! {}", .0.display(), .1)]
    FileRead(PathBuf, String),
    #[error("Invalid value '{}' for {}!", .value, .field)]
    InvalidValue { field: String, value: String },
    #[error("Invalid cluster-subnet! {}", .0)]
    ClusterCidr(#[from] CidrError),
    #[error("service-cluster-ip-range {} overlaps with the cluster network!", .0)]
    ServiceCidrOverlap(Ipv4Net),
    #[error("Gateway transit range {} overlaps with {}!", .0, .1)]
    TransitRangeOverlap(Ipv4Net, Ipv4Net),
    #[error("Invalid {} OVN database configuration! {}", .0, .1)]
    OvnAuth(&'static str, OvnAuthError),
    #[error("Kubernetes kubeconfig file {} not found!", .0.display())]
    KubeconfigNotFound(PathBuf),
    #[error("Kubernetes CA certificate file {} not found!", .0.display())]
    CaCertNotFound(PathBuf),
    #[error("Kubernetes API server address '{}' is invalid! {}", .0, .1)]
    ApiServerInvalid(String, url::ParseError),
    #[error("Kubernetes API server URL scheme '{}' is invalid!", .0)]
    ApiServerScheme(String),
    #[error("Cannot initialize node without service account token! Please provide one with --k8s-token")]
    TokenMissing,
    #[error("Invalid gateway configuration! {}", .0)]
    Gateway(#[from] GatewayConfigError),
}

/// One source of configuration values. Unset fields fall through to the
/// layer underneath.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    pub mtu: Option<u32>,
    pub conntrack_zone: Option<u32>,
    pub encap_type: Option<String>,
    pub encap_ip: Option<String>,
    pub inactivity_interval: Option<u32>,
    pub loglevel: Option<u8>,
    pub logfile: Option<String>,
    pub cni_conf_dir: Option<String>,
    pub cni_plugin: Option<String>,
    pub k8s_kubeconfig: Option<String>,
    pub k8s_cacert: Option<String>,
    pub k8s_apiserver: Option<String>,
    pub k8s_token: Option<String>,
    pub ovn_north: RawOvnAuth,
    pub ovn_south: RawOvnAuth,
    pub cluster_subnet: Option<String>,
    pub service_cluster_ip_range: Option<String>,
    pub transit_range: Option<String>,
}

impl ConfigLayer {
    pub fn defaults() -> Self {
        Self {
            mtu: Some(DEFAULT_MTU),
            conntrack_zone: Some(DEFAULT_CONNTRACK_ZONE),
            encap_type: Some(DEFAULT_ENCAP_TYPE.to_owned()),
            inactivity_interval: Some(DEFAULT_INACTIVITY_INTERVAL_MS),
            loglevel: Some(DEFAULT_LOG_LEVEL),
            cni_conf_dir: Some(DEFAULT_CNI_CONF_DIR.to_owned()),
            cni_plugin: Some(DEFAULT_CNI_PLUGIN.to_owned()),
            k8s_apiserver: Some(DEFAULT_K8S_APISERVER.to_owned()),
            cluster_subnet: Some(DEFAULT_CLUSTER_SUBNET.to_owned()),
            transit_range: Some(DEFAULT_TRANSIT_RANGE.to_owned()),
            ..Default::default()
        }
    }

    /// Fields set in `other` win.
    pub fn overlay(self, other: ConfigLayer) -> Self {
        Self {
            mtu: other.mtu.or(self.mtu),
            conntrack_zone: other.conntrack_zone.or(self.conntrack_zone),
            encap_type: other.encap_type.or(self.encap_type),
            encap_ip: other.encap_ip.or(self.encap_ip),
            inactivity_interval: other.inactivity_interval.or(self.inactivity_interval),
            loglevel: other.loglevel.or(self.loglevel),
            logfile: other.logfile.or(self.logfile),
            cni_conf_dir: other.cni_conf_dir.or(self.cni_conf_dir),
            cni_plugin: other.cni_plugin.or(self.cni_plugin),
            k8s_kubeconfig: other.k8s_kubeconfig.or(self.k8s_kubeconfig),
            k8s_cacert: other.k8s_cacert.or(self.k8s_cacert),
            k8s_apiserver: other.k8s_apiserver.or(self.k8s_apiserver),
            k8s_token: other.k8s_token.or(self.k8s_token),
            ovn_north: self.ovn_north.overlay(other.ovn_north),
            ovn_south: self.ovn_south.overlay(other.ovn_south),
            cluster_subnet: other.cluster_subnet.or(self.cluster_subnet),
            service_cluster_ip_range: other.service_cluster_ip_range.or(self.service_cluster_ip_range),
            transit_range: other.transit_range.or(self.transit_range),
        }
    }
}

/// Which values may be looked up in the local OVS `external_ids`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discovery {
    pub ovn_north_address: bool,
    pub k8s_api_server: bool,
    pub k8s_token: bool,
    pub k8s_cacert: bool,
}

impl Discovery {
    pub fn all() -> Self {
        Self {
            ovn_north_address: true,
            k8s_api_server: true,
            k8s_token: true,
            k8s_cacert: true,
        }
    }
}

pub async fn discover_layer(external_ids: &dyn ExternalIds, discovery: Discovery) -> ConfigLayer {
    let mut layer = ConfigLayer::default();

    if discovery.k8s_api_server {
        layer.k8s_apiserver = external_ids.get(EXTERNAL_ID_K8S_API_SERVER).await;
    }
    if discovery.k8s_token {
        layer.k8s_token = external_ids.get(EXTERNAL_ID_K8S_API_TOKEN).await;
    }
    if discovery.k8s_cacert {
        layer.k8s_cacert = external_ids.get(EXTERNAL_ID_K8S_CA_CERTIFICATE).await;
    }
    if discovery.ovn_north_address {
        layer.ovn_north.address = external_ids.get(EXTERNAL_ID_OVN_NB).await;
    }

    layer
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultConfig {
    pub mtu: u32,
    pub conntrack_zone: u32,
    pub encap_type: String,
    pub encap_ip: Option<IpAddr>,
    /// milliseconds
    pub inactivity_interval: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// 5=debug, 4=info, 3=warn, 2=error, 1=fatal
    pub level: u8,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniConfig {
    pub conf_dir: PathBuf,
    pub plugin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesConfig {
    pub kubeconfig: Option<PathBuf>,
    pub cacert: Option<PathBuf>,
    pub apiserver: Url,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub cluster_cidr: ClusterCidr,
    pub service_cidr: Option<Ipv4Net>,
    pub transit_range: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub default: DefaultConfig,
    pub logging: LoggingConfig,
    pub cni: CniConfig,
    pub kubernetes: KubernetesConfig,
    pub ovn_north: OvnDbAuth,
    pub ovn_south: OvnDbAuth,
    pub network: NetworkConfig,
}

impl Config {
    /// Merges defaults < discovered external ids < config file < `cli` and
    /// validates the result. Returns the config file path if one was read.
    pub async fn load(
        cli: ConfigLayer,
        config_file: Option<&Path>,
        external_ids: &dyn ExternalIds,
        discovery: Discovery,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let discovered = discover_layer(external_ids, discovery).await;
        let file = load_config_file(config_file)?;
        let (path, file_layer) = match file {
            Some((path, layer)) => (Some(path), layer),
            None => (None, ConfigLayer::default()),
        };

        let merged = ConfigLayer::defaults()
            .overlay(discovered)
            .overlay(file_layer)
            .overlay(cli);

        Ok((Self::build(merged)?, path))
    }

    pub fn build(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let default = DefaultConfig {
            mtu: layer.mtu.unwrap_or(DEFAULT_MTU),
            conntrack_zone: layer.conntrack_zone.unwrap_or(DEFAULT_CONNTRACK_ZONE),
            encap_type: validate_encap_type(layer.encap_type)?,
            encap_ip: layer
                .encap_ip
                .map(|raw| {
                    raw.parse().map_err(|_| ConfigError::InvalidValue {
                        field: "encap-ip".to_owned(),
                        value: raw,
                    })
                })
                .transpose()?,
            inactivity_interval: layer.inactivity_interval.unwrap_or(DEFAULT_INACTIVITY_INTERVAL_MS),
        };

        let level = layer.loglevel.unwrap_or(DEFAULT_LOG_LEVEL);
        if !(1..=5).contains(&level) {
            return Err(ConfigError::InvalidValue {
                field: "loglevel".to_owned(),
                value: level.to_string(),
            });
        }

        let logging = LoggingConfig {
            level,
            file: layer.logfile.map(PathBuf::from),
        };

        let cni = CniConfig {
            conf_dir: PathBuf::from(layer.cni_conf_dir.unwrap_or_else(|| DEFAULT_CNI_CONF_DIR.to_owned())),
            plugin: layer.cni_plugin.unwrap_or_else(|| DEFAULT_CNI_PLUGIN.to_owned()),
        };

        let kubernetes = build_kubernetes_config(
            layer.k8s_kubeconfig,
            layer.k8s_cacert,
            layer.k8s_apiserver,
            layer.k8s_token,
        )?;

        let ovn_north = OvnDbAuth::parse(OvnDirection::North, &layer.ovn_north)
            .map_err(|error| ConfigError::OvnAuth(OvnDirection::North.config_section(), error))?;
        let ovn_south = OvnDbAuth::parse(OvnDirection::South, &layer.ovn_south)
            .map_err(|error| ConfigError::OvnAuth(OvnDirection::South.config_section(), error))?;

        let network = build_network_config(
            layer.cluster_subnet,
            layer.service_cluster_ip_range,
            layer.transit_range,
        )?;

        let config = Self {
            default,
            logging,
            cni,
            kubernetes,
            ovn_north,
            ovn_south,
            network,
        };

        debug!("Effective config: {config:?}");

        Ok(config)
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.kubernetes
            .token
            .as_deref()
            .ok_or(ConfigError::TokenMissing)
    }
}

fn validate_encap_type(encap_type: Option<String>) -> Result<String, ConfigError> {
    let encap_type = encap_type.unwrap_or_else(|| DEFAULT_ENCAP_TYPE.to_owned());

    if encap_type != DEFAULT_ENCAP_TYPE {
        return Err(ConfigError::InvalidValue {
            field: "encap-type".to_owned(),
            value: encap_type,
        });
    }

    Ok(encap_type)
}

fn build_kubernetes_config(
    kubeconfig: Option<String>,
    cacert: Option<String>,
    apiserver: Option<String>,
    token: Option<String>,
) -> Result<KubernetesConfig, ConfigError> {
    let kubeconfig = kubeconfig.map(PathBuf::from);
    if let Some(path) = &kubeconfig {
        if !path.exists() {
            return Err(ConfigError::KubeconfigNotFound(path.to_owned()));
        }
    }

    let cacert = cacert.map(PathBuf::from);
    if let Some(path) = &cacert {
        if !path.exists() {
            return Err(ConfigError::CaCertNotFound(path.to_owned()));
        }
    }

    let raw_apiserver = apiserver.unwrap_or_else(|| DEFAULT_K8S_APISERVER.to_owned());
    let apiserver = Url::parse(&raw_apiserver)
        .map_err(|error| ConfigError::ApiServerInvalid(raw_apiserver.clone(), error))?;

    if apiserver.scheme() != "http" && apiserver.scheme() != "https" {
        return Err(ConfigError::ApiServerScheme(apiserver.scheme().to_owned()));
    }

    Ok(KubernetesConfig {
        kubeconfig,
        cacert,
        apiserver,
        token: token.filter(|token| !token.is_empty()),
    })
}

fn build_network_config(
    cluster_subnet: Option<String>,
    service_range: Option<String>,
    transit_range: Option<String>,
) -> Result<NetworkConfig, ConfigError> {
    let cluster_cidr: ClusterCidr = cluster_subnet
        .as_deref()
        .unwrap_or(DEFAULT_CLUSTER_SUBNET)
        .parse()?;

    let service_cidr = service_range
        .map(|raw| parse_net("service-cluster-ip-range", raw))
        .transpose()?;

    if let Some(service_cidr) = &service_cidr {
        if cluster_cidr.overlaps(service_cidr) {
            return Err(ConfigError::ServiceCidrOverlap(*service_cidr));
        }
    }

    let transit_range = parse_net(
        "transit-range",
        transit_range.unwrap_or_else(|| DEFAULT_TRANSIT_RANGE.to_owned()),
    )?;

    if let Some(overlapping) = cluster_cidr
        .nets()
        .chain(service_cidr)
        .find(|net| crate::ip::nets_overlap(net, &transit_range))
    {
        return Err(ConfigError::TransitRangeOverlap(transit_range, overlapping));
    }

    Ok(NetworkConfig {
        cluster_cidr,
        service_cidr,
        transit_range,
    })
}

fn parse_net(field: &str, raw: String) -> Result<Ipv4Net, ConfigError> {
    raw.trim()
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|_| ConfigError::InvalidValue {
            field: field.to_owned(),
            value: raw,
        })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use maplit::btreemap;

    use super::{
        external_ids::InMemoryExternalIds,
        ovn_auth::{OvnAuthError, OvnDbScheme, RawOvnAuth},
        Config, ConfigError, ConfigLayer, Discovery,
    };

    fn cli() -> ConfigLayer {
        ConfigLayer::default()
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let config = Config::build(ConfigLayer::defaults()).unwrap();

        assert_eq!(config.default.mtu, 1400);
        assert_eq!(config.default.conntrack_zone, 64000);
        assert_eq!(config.default.encap_type, "geneve");
        assert_eq!(config.default.inactivity_interval, 100000);
        assert_eq!(config.logging.level, 4);
        assert_eq!(config.cni.plugin, "ovn-k8s-cni-overlay");
        assert_eq!(config.kubernetes.apiserver.as_str(), "http://localhost:8080/");
        assert_eq!(config.network.cluster_cidr.to_string(), "11.11.0.0/16/24");
        assert_eq!(config.ovn_north.scheme, OvnDbScheme::Unix);
    }

    #[test]
    fn ssl_address_without_key_is_a_config_error() {
        let layer = ConfigLayer {
            ovn_north: RawOvnAuth {
                address: Some("ssl://1.2.3.4:6641".to_owned()),
                ..Default::default()
            },
            ..ConfigLayer::defaults()
        };

        assert!(matches!(
            Config::build(layer),
            Err(ConfigError::OvnAuth("ovnnorth", OvnAuthError::SslMaterialMissing(_)))
        ));
    }

    #[test]
    fn service_range_must_not_overlap_the_cluster_network() {
        let layer = ConfigLayer {
            cluster_subnet: Some("10.0.0.0/16/24".to_owned()),
            service_cluster_ip_range: Some("10.0.128.0/20".to_owned()),
            ..ConfigLayer::defaults()
        };

        assert!(matches!(
            Config::build(layer),
            Err(ConfigError::ServiceCidrOverlap(_))
        ));
    }

    #[test]
    fn api_server_scheme_is_validated() {
        let layer = ConfigLayer {
            k8s_apiserver: Some("ftp://1.2.3.4".to_owned()),
            ..ConfigLayer::defaults()
        };

        assert!(matches!(
            Config::build(layer),
            Err(ConfigError::ApiServerScheme(scheme)) if scheme == "ftp"
        ));
    }

    #[test]
    fn referenced_files_must_exist() {
        let layer = ConfigLayer {
            k8s_kubeconfig: Some("/nonexistent/kubeconfig".to_owned()),
            ..ConfigLayer::defaults()
        };

        assert!(matches!(
            Config::build(layer),
            Err(ConfigError::KubeconfigNotFound(_))
        ));
    }

    #[test]
    fn invalid_log_level_and_encapsulation_are_rejected() {
        assert!(matches!(
            Config::build(ConfigLayer {
                loglevel: Some(9),
                ..ConfigLayer::defaults()
            }),
            Err(ConfigError::InvalidValue { field, .. }) if field == "loglevel"
        ));
        assert!(matches!(
            Config::build(ConfigLayer {
                encap_type: Some("vxlan".to_owned()),
                ..ConfigLayer::defaults()
            }),
            Err(ConfigError::InvalidValue { field, .. }) if field == "encap-type"
        ));
    }

    #[tokio::test]
    async fn precedence_is_defaults_discovery_file_cli() {
        let external_ids = InMemoryExternalIds::with_values(btreemap! {
            "k8s-api-server".to_owned() => "https://10.1.1.1:6443".to_owned(),
            "k8s-api-token".to_owned() => "discovered-token".to_owned(),
            "ovn-nb".to_owned() => "tcp:10.1.1.1:6641".to_owned(),
        });

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[default]\nmtu=1500\n[kubernetes]\napiserver=https://10.2.2.2:6443\n"
        )
        .unwrap();

        let cli = ConfigLayer {
            mtu: Some(9000),
            ..cli()
        };

        let (config, path) = Config::load(cli, Some(file.path()), &external_ids, Discovery::all())
            .await
            .unwrap();

        assert_eq!(path.as_deref(), Some(file.path()));
        assert_eq!(config.default.mtu, 9000);
        assert_eq!(config.kubernetes.apiserver.as_str(), "https://10.2.2.2:6443/");
        assert_eq!(config.kubernetes.token.as_deref(), Some("discovered-token"));
        assert_eq!(config.ovn_north.url(), "tcp:10.1.1.1:6641");
        assert_eq!(config.require_token().unwrap(), "discovered-token");
    }

    #[tokio::test]
    async fn discovery_is_opt_in() {
        let external_ids = InMemoryExternalIds::with_values(btreemap! {
            "ovn-nb".to_owned() => "tcp:10.1.1.1:6641".to_owned(),
        });
        let file = tempfile::NamedTempFile::new().unwrap();

        let (config, _) = Config::load(cli(), Some(file.path()), &external_ids, Discovery::default())
            .await
            .unwrap();

        assert_eq!(config.ovn_north.url(), "");
        assert!(matches!(config.require_token(), Err(ConfigError::TokenMissing)));
    }
}
