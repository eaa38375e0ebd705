use std::{collections::BTreeMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::exec::{run_command, CommandError};

pub const OVS_VSCTL_COMMAND: &str = "ovs-vsctl";
pub const OVS_VSCTL_TIMEOUT_SECS: u64 = 15;

pub const EXTERNAL_ID_K8S_API_SERVER: &str = "k8s-api-server";
pub const EXTERNAL_ID_K8S_API_TOKEN: &str = "k8s-api-token";
pub const EXTERNAL_ID_K8S_CA_CERTIFICATE: &str = "k8s-ca-certificate";
pub const EXTERNAL_ID_OVN_NB: &str = "ovn-nb";
pub const EXTERNAL_ID_OVN_REMOTE: &str = "ovn-remote";

#[derive(Debug, Error)]
pub enum ExternalIdsError {
    #[error("Error setting OVS external ID '{}={}'! {}", .key, .value, .source)]
    Set {
        key: String,
        value: String,
        source: CommandError,
    },
    #[error("Error configuring OVS SSL options! {}", .0)]
    Ssl(CommandError),
    #[error("In-memory external IDs are poisoned!")]
    Poisoned,
}

/// `external_ids` column of the local `Open_vSwitch` table.
#[async_trait]
pub trait ExternalIds: Send + Sync {
    /// Missing keys and lookup failures both read as `None`.
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), ExternalIdsError>;
    /// Replaces the SSL material OVS daemons use to reach the southbound database.
    async fn set_ssl(&self, privkey: &str, cert: &str, cacert: &str) -> Result<(), ExternalIdsError>;
}

#[derive(Debug, Clone)]
pub struct OvsVsctl {
    timeout: Duration,
}

impl Default for OvsVsctl {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(OVS_VSCTL_TIMEOUT_SECS),
        }
    }
}

impl OvsVsctl {
    async fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        let mut full_args = vec![format!("--timeout={}", self.timeout.as_secs())];
        full_args.extend(args.iter().map(|arg| arg.to_string()));

        // the tool itself gives up after --timeout, leave it some slack
        let output = run_command(OVS_VSCTL_COMMAND, &full_args, self.timeout + Duration::from_secs(1)).await?;

        Ok(output.trim_matches('"').to_owned())
    }
}

#[async_trait]
impl ExternalIds for OvsVsctl {
    async fn get(&self, key: &str) -> Option<String> {
        let column = format!("external_ids:{key}");

        match self
            .run(&["--if-exists", "get", "Open_vSwitch", ".", &column])
            .await
        {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(error) => {
                debug!("Failed to get OVS external_id {key}: {error}");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ExternalIdsError> {
        let column = format!("external_ids:{key}=\"{value}\"");

        self.run(&["set", "Open_vSwitch", ".", &column])
            .await
            .map_err(|source| ExternalIdsError::Set {
                key: key.to_owned(),
                value: value.to_owned(),
                source,
            })?;

        Ok(())
    }

    async fn set_ssl(&self, privkey: &str, cert: &str, cacert: &str) -> Result<(), ExternalIdsError> {
        self.run(&["del-ssl"]).await.map_err(ExternalIdsError::Ssl)?;
        self.run(&["set-ssl", privkey, cert, cacert])
            .await
            .map_err(ExternalIdsError::Ssl)?;

        Ok(())
    }
}

/// Table kept in memory, for running without a local OVS.
#[derive(Debug, Default)]
pub struct InMemoryExternalIds {
    values: Mutex<BTreeMap<String, String>>,
    ssl: Mutex<Option<(String, String, String)>>,
}

impl InMemoryExternalIds {
    pub fn with_values(values: BTreeMap<String, String>) -> Self {
        Self {
            values: Mutex::new(values),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().map(|values| values.clone()).unwrap_or_default()
    }

    pub fn ssl(&self) -> Option<(String, String, String)> {
        self.ssl.lock().ok().and_then(|ssl| ssl.clone())
    }
}

#[async_trait]
impl ExternalIds for InMemoryExternalIds {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ExternalIdsError> {
        self.values
            .lock()
            .map_err(|_| ExternalIdsError::Poisoned)?
            .insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    async fn set_ssl(&self, privkey: &str, cert: &str, cacert: &str) -> Result<(), ExternalIdsError> {
        *self.ssl.lock().map_err(|_| ExternalIdsError::Poisoned)? =
            Some((privkey.to_owned(), cert.to_owned(), cacert.to_owned()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{panic, sync::Mutex};

    use super::{ExternalIds, ExternalIdsError, InMemoryExternalIds};

    fn poison<T>(lock: &Mutex<T>) {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            let _guard = lock.lock().unwrap();
            panic!("writer died holding the lock");
        }));

        assert!(result.is_err());
        assert!(lock.is_poisoned());
    }

    #[tokio::test]
    async fn values_round_trip() {
        let table = InMemoryExternalIds::default();

        table.set("ovn-nb", "tcp:10.0.0.5:6641").await.unwrap();

        assert_eq!(table.get("ovn-nb").await.as_deref(), Some("tcp:10.0.0.5:6641"));
        assert_eq!(table.get("ovn-remote").await, None);
    }

    #[tokio::test]
    async fn poisoned_table_rejects_writes() {
        let table = InMemoryExternalIds::default();
        poison(&table.values);
        poison(&table.ssl);

        assert!(matches!(
            table.set("ovn-nb", "tcp:10.0.0.5:6641").await,
            Err(ExternalIdsError::Poisoned)
        ));
        assert!(matches!(
            table.set_ssl("/key.pem", "/cert.pem", "/ca.pem").await,
            Err(ExternalIdsError::Poisoned)
        ));
    }
}
