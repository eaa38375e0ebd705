use std::fmt::Debug;

use anyhow::Context;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::{
    api::{Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config, Resource,
};
use log::debug;
use serde_json::json;

use crate::{config::KubernetesConfig, helpers::pretty_type_name};

pub const FIELD_MANAGER: &str = "ovnkube";

const GENERATED_CONTEXT: &str = "ovnkube";

/// Uses the kubeconfig file when there is one, otherwise talks to the
/// configured API server with the configured token and CA.
pub async fn create_client(config: &KubernetesConfig) -> anyhow::Result<Client> {
    let kubeconfig = match &config.kubeconfig {
        Some(path) => Kubeconfig::read_from(path)
            .with_context(|| format!("Couldn't read kubeconfig {}!", path.display()))?,
        None => kubeconfig_from_settings(config)?,
    };

    let client_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("Couldn't prepare the Kubernetes client configuration!")?;

    debug!("Using Kubernetes API server {}", client_config.cluster_url);

    Ok(Client::try_from(client_config)?)
}

/// Single-context kubeconfig equivalent of the `kubernetes` config section.
pub fn kubeconfig_from_settings(config: &KubernetesConfig) -> anyhow::Result<Kubeconfig> {
    let mut cluster = json!({ "server": config.apiserver.as_str() });
    if let Some(cacert) = &config.cacert {
        cluster["certificate-authority"] = json!(cacert);
    }

    let mut user = json!({});
    if let Some(token) = &config.token {
        user["token"] = json!(token);
    }

    let kubeconfig = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": GENERATED_CONTEXT, "cluster": cluster }],
        "users": [{ "name": GENERATED_CONTEXT, "user": user }],
        "contexts": [{
            "name": GENERATED_CONTEXT,
            "context": { "cluster": GENERATED_CONTEXT, "user": GENERATED_CONTEXT },
        }],
        "current-context": GENERATED_CONTEXT,
    });

    serde_json::from_value(kubeconfig).context("Couldn't build a kubeconfig from the Kubernetes settings!")
}

/// Sets (or with `None` removes) a single annotation. Passing the object's
/// resource version turns a concurrent modification into a 409 conflict.
pub async fn patch_annotation<T>(
    api: &Api<T>,
    name: &str,
    resource_version: Option<&str>,
    key: &str,
    value: Option<&str>,
) -> Result<T, kube::Error>
where
    T: Resource + Clone + DeserializeOwned + Debug,
{
    debug!(
        "Patching '{key}' annotation of {} '{name}'",
        pretty_type_name::<T>().to_lowercase()
    );

    let patch = json!({
        "metadata": {
            "resourceVersion": resource_version,
            "annotations": { key: value },
        }
    });

    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}
