use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

use ini::{Ini, Properties};
use log::{debug, info};

use super::{ovn_auth::RawOvnAuth, ConfigError, ConfigLayer};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/openvswitch/ovn_k8s.conf";

/// Reads the config file given on the command line, or the default one.
/// Only a missing *default* file is tolerated.
pub fn load_config_file(explicit: Option<&Path>) -> Result<Option<(PathBuf, ConfigLayer)>, ConfigError> {
    let (path, is_default) = match explicit {
        Some(path) => (path.to_owned(), false),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), true),
    };

    debug!("Used config path: {path:?}");

    let ini = match Ini::load_from_file(&path) {
        Ok(ini) => ini,
        Err(ini::Error::Io(error)) if is_default && error.kind() == ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(error) => return Err(ConfigError::FileRead(path, error.to_string())),
    };

    let layer = parse_config(&ini)?;

    info!("Parsed config file {}", path.display());

    Ok(Some((path, layer)))
}

pub fn parse_config_str(contents: &str) -> Result<ConfigLayer, ConfigError> {
    let ini = Ini::load_from_str(contents)
        .map_err(|error| ConfigError::FileRead(PathBuf::from("<inline>"), error.to_string()))?;

    parse_config(&ini)
}

fn parse_config(ini: &Ini) -> Result<ConfigLayer, ConfigError> {
    let default = Section::new(ini, "default");
    let logging = Section::new(ini, "logging");
    let cni = Section::new(ini, "cni");
    let kubernetes = Section::new(ini, "kubernetes");
    let gateway = Section::new(ini, "gateway");

    Ok(ConfigLayer {
        mtu: default.parse("mtu")?,
        conntrack_zone: default.parse("conntrack-zone")?,
        encap_type: default.string("encap-type"),
        encap_ip: default.string("encap-ip"),
        inactivity_interval: default.parse("inactivity-probe")?,
        loglevel: logging.parse("loglevel")?,
        logfile: logging.string("logfile"),
        cni_conf_dir: cni.string("conf-dir"),
        cni_plugin: cni.string("plugin"),
        k8s_kubeconfig: kubernetes.string("kubeconfig"),
        k8s_cacert: kubernetes.string("cacert"),
        k8s_apiserver: kubernetes.string("apiserver"),
        k8s_token: kubernetes.string("token"),
        ovn_north: Section::new(ini, "ovnnorth").ovn_auth(),
        ovn_south: Section::new(ini, "ovnsouth").ovn_auth(),
        transit_range: gateway.string("transit-range"),
        ..Default::default()
    })
}

struct Section<'a> {
    name: &'static str,
    properties: Option<&'a Properties>,
}

impl<'a> Section<'a> {
    fn new(ini: &'a Ini, name: &'static str) -> Self {
        Self {
            name,
            properties: ini.section(Some(name)),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.properties
            .and_then(|properties| properties.get(key))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| value.trim_matches('"').to_owned())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                    field: format!("{}.{key}", self.name),
                    value: raw.clone(),
                })
            })
            .transpose()
    }

    fn ovn_auth(&self) -> RawOvnAuth {
        RawOvnAuth {
            address: self.string("address"),
            client_privkey: self.string("client-privkey"),
            client_cert: self.string("client-cert"),
            client_cacert: self.string("client-cacert"),
        }
    }
}
