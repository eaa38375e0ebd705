use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    path::Path,
    time::Duration,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::exec::CommandRunner;

use super::external_ids::{ExternalIds, ExternalIdsError, EXTERNAL_ID_OVN_NB, EXTERNAL_ID_OVN_REMOTE};

pub const OVN_NBCTL_COMMAND: &str = "ovn-nbctl";
pub const CA_BOOTSTRAP_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OvnAuthError {
    #[error("Failed to parse OVN address '{}'!", .0)]
    Malformed(String),
    #[error("Invalid protocols in OVN address '{}'!", .0)]
    MixedSchemes(String),
    #[error("OVN DB host '{}' must be an IP address, not a DNS name!", .0)]
    HostNotIp(String),
    #[error("OVN DB port in '{}' is invalid!", .0)]
    InvalidPort(String),
    #[error("Unknown OVN DB scheme '{}'!", .0)]
    UnknownScheme(String),
    #[error("Must specify {} for the 'ssl' scheme!", .0)]
    SslMaterialMissing(&'static str),
    #[error("Certificate or key given; perhaps you mean to use the 'ssl' scheme?")]
    UnexpectedSslMaterial,
    #[error("{} file '{}' not found!", .0, .1)]
    FileNotFound(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvnDirection {
    North,
    South,
}

impl OvnDirection {
    /// Prefix of the command line flags, `nb` or `sb`.
    pub fn flag_prefix(&self) -> &'static str {
        match self {
            OvnDirection::North => "nb",
            OvnDirection::South => "sb",
        }
    }

    pub fn config_section(&self) -> &'static str {
        match self {
            OvnDirection::North => "ovnnorth",
            OvnDirection::South => "ovnsouth",
        }
    }

    pub fn external_id(&self) -> &'static str {
        match self {
            OvnDirection::North => EXTERNAL_ID_OVN_NB,
            OvnDirection::South => EXTERNAL_ID_OVN_REMOTE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvnDbScheme {
    Ssl,
    Tcp,
    Unix,
}

impl Display for OvnDbScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OvnDbScheme::Ssl => "ssl",
            OvnDbScheme::Tcp => "tcp",
            OvnDbScheme::Unix => "unix",
        })
    }
}

/// Connection settings of one OVN database direction as they were given,
/// before any validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOvnAuth {
    pub address: Option<String>,
    pub client_privkey: Option<String>,
    pub client_cert: Option<String>,
    pub client_cacert: Option<String>,
}

impl RawOvnAuth {
    /// Fields set in `other` win.
    pub fn overlay(self, other: RawOvnAuth) -> Self {
        Self {
            address: other.address.or(self.address),
            client_privkey: other.client_privkey.or(self.client_privkey),
            client_cert: other.client_cert.or(self.client_cert),
            client_cacert: other.client_cacert.or(self.client_cacert),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslMaterial {
    pub privkey: String,
    pub cert: String,
    pub cacert: String,
}

/// Validated location of an OVN database and the way to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvnDbAuth {
    pub direction: OvnDirection,
    pub scheme: OvnDbScheme,
    /// Normalised `scheme:ip:port[,...]`, empty for the local socket.
    pub address: String,
    pub ssl: Option<SslMaterial>,
}

impl OvnDbAuth {
    pub fn parse(direction: OvnDirection, raw: &RawOvnAuth) -> Result<Self, OvnAuthError> {
        let address = raw.address.as_deref().map(str::trim).unwrap_or_default();
        let has_material =
            raw.client_privkey.is_some() || raw.client_cert.is_some() || raw.client_cacert.is_some();

        if address.is_empty() {
            if has_material {
                return Err(OvnAuthError::UnexpectedSslMaterial);
            }

            return Ok(Self {
                direction,
                scheme: OvnDbScheme::Unix,
                address: String::new(),
                ssl: None,
            });
        }

        let (scheme, address) = normalize_address(address)?;

        let ssl = match scheme {
            OvnDbScheme::Ssl => Some(SslMaterial {
                privkey: raw
                    .client_privkey
                    .clone()
                    .ok_or(OvnAuthError::SslMaterialMissing("client private key"))?,
                cert: raw
                    .client_cert
                    .clone()
                    .ok_or(OvnAuthError::SslMaterialMissing("client certificate"))?,
                cacert: raw
                    .client_cacert
                    .clone()
                    .ok_or(OvnAuthError::SslMaterialMissing("CA certificate"))?,
            }),
            _ if has_material => return Err(OvnAuthError::UnexpectedSslMaterial),
            _ => None,
        };

        Ok(Self {
            direction,
            scheme,
            address,
            ssl,
        })
    }

    pub fn url(&self) -> &str {
        &self.address
    }

    /// Connection flags understood by `ovn-nbctl`/`ovn-sbctl`.
    pub fn ctl_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.address.is_empty() {
            args.push(format!("--db={}", self.address));
        }

        if let Some(ssl) = &self.ssl {
            args.push(format!("--private-key={}", ssl.privkey));
            args.push(format!("--certificate={}", ssl.cert));
            args.push(format!("--ca-cert={}", ssl.cacert));
        }

        args
    }

    /// Mirrors this configuration into the local OVS so that `ovn-controller`
    /// finds the database. A missing CA certificate is fetched from the
    /// database first.
    pub async fn publish(&self, external_ids: &dyn ExternalIds, commands: &dyn CommandRunner) -> Result<(), PublishError> {
        if self.scheme == OvnDbScheme::Unix {
            return Ok(());
        }

        if let Some(ssl) = &self.ssl {
            if !Path::new(&ssl.privkey).exists() {
                return Err(OvnAuthError::FileNotFound("Private key", ssl.privkey.clone()).into());
            }
            if !Path::new(&ssl.cert).exists() {
                return Err(OvnAuthError::FileNotFound("Certificate", ssl.cert.clone()).into());
            }

            self.bootstrap_ca_cert(ssl, commands).await;

            // must precede ovn-remote, ovn-controller reconnects as soon as it changes
            if self.direction == OvnDirection::South {
                external_ids
                    .set_ssl(&ssl.privkey, &ssl.cert, &ssl.cacert)
                    .await?;
            }
        }

        external_ids
            .set(self.direction.external_id(), &self.address)
            .await?;

        info!(
            "Published {}={} external id!",
            self.direction.external_id(),
            self.address
        );

        Ok(())
    }

    async fn bootstrap_ca_cert(&self, ssl: &SslMaterial, commands: &dyn CommandRunner) {
        if Path::new(&ssl.cacert).exists() {
            return;
        }

        // ovn-sbctl can't bootstrap, nbctl reaches both databases
        let args = vec![
            format!("--db={}", self.address),
            format!("--timeout={CA_BOOTSTRAP_TIMEOUT_SECS}"),
            format!("--private-key={}", ssl.privkey),
            format!("--certificate={}", ssl.cert),
            format!("--bootstrap-ca-cert={}", ssl.cacert),
            "list".to_owned(),
            "nb_global".to_owned(),
        ];
        let timeout = Duration::from_secs(CA_BOOTSTRAP_TIMEOUT_SECS + 1);

        if let Err(error) = commands.run(OVN_NBCTL_COMMAND, &args, timeout).await {
            debug!("CA bootstrap of {} failed: {error}", self.direction.config_section());
        }

        if Path::new(&ssl.cacert).exists() {
            info!("Bootstrapped {} CA certificate from {}", ssl.cacert, self.address);
        } else {
            warn!("Bootstrapping {} CA certificate failed!", ssl.cacert);
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{}", .0)]
    Auth(#[from] OvnAuthError),
    #[error("{}", .0)]
    ExternalIds(#[from] ExternalIdsError),
}

/// Accepts `scheme:ip:port` and `scheme://ip:port`, comma separated.
fn normalize_address(raw: &str) -> Result<(OvnDbScheme, String), OvnAuthError> {
    let mut scheme: Option<&str> = None;
    let mut normalized = Vec::new();

    for address in raw.split(',').map(str::trim) {
        let (current, rest) = address
            .split_once(':')
            .ok_or_else(|| OvnAuthError::Malformed(raw.to_owned()))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);

        match scheme {
            None => scheme = Some(current),
            Some(previous) if previous != current => {
                return Err(OvnAuthError::MixedSchemes(raw.to_owned()))
            }
            Some(_) => (),
        }

        if current == "unix" {
            if rest.is_empty() {
                return Err(OvnAuthError::Malformed(raw.to_owned()));
            }

            normalized.push(format!("unix:{rest}"));
            continue;
        }

        let (host, port) = rest
            .split_once(':')
            .filter(|(_, port)| !port.contains(':'))
            .ok_or_else(|| OvnAuthError::Malformed(raw.to_owned()))?;

        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| OvnAuthError::HostNotIp(rest.to_owned()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| OvnAuthError::InvalidPort(rest.to_owned()))?;

        normalized.push(format!("{current}:{ip}:{port}"));
    }

    let scheme = match scheme.unwrap_or_default() {
        "ssl" => OvnDbScheme::Ssl,
        "tcp" => OvnDbScheme::Tcp,
        "unix" => OvnDbScheme::Unix,
        other => return Err(OvnAuthError::UnknownScheme(other.to_owned())),
    };

    Ok((scheme, normalized.join(",")))
}
