use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::{api::ListParams, Api, Client};
use ovnkube_core::kubernetes::{
    operations::{is_conflict, is_not_found, patch_annotation},
    GetApi,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("'{}' was modified concurrently!", .0)]
    Conflict(String),
    #[error("'{}' doesn't exist!", .0)]
    NotFound(String),
    #[error("Kubernetes API call failed! {}", .0)]
    Api(kube::Error),
}

impl OrchestratorError {
    fn from_kube(object: &str, error: kube::Error) -> Self {
        if is_conflict(&error) {
            OrchestratorError::Conflict(object.to_owned())
        } else if is_not_found(&error) {
            OrchestratorError::NotFound(object.to_owned())
        } else {
            OrchestratorError::Api(error)
        }
    }
}

/// The parts of the Kubernetes API the reconcilers read from and write to.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, OrchestratorError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, OrchestratorError>;
    async fn list_services(&self) -> Result<Vec<Service>, OrchestratorError>;
    async fn get_node(&self, name: &str) -> Result<Option<Node>, OrchestratorError>;
    /// With `resource_version` set, fails with a conflict if the node changed
    /// in the meantime. `None` as the value removes the annotation.
    async fn annotate_node(
        &self,
        name: &str,
        resource_version: Option<&str>,
        key: &str,
        value: Option<&str>,
    ) -> Result<Node, OrchestratorError>;
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        key: &str,
        value: Option<&str>,
    ) -> Result<Pod, OrchestratorError>;
}

pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_nodes(&self) -> Result<Vec<Node>, OrchestratorError> {
        let nodes = self
            .client
            .global_api::<Node>()
            .list(&ListParams::default())
            .await
            .map_err(|error| OrchestratorError::from_kube("nodes", error))?;

        Ok(nodes.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, OrchestratorError> {
        let pods = self
            .client
            .global_api::<Pod>()
            .list(&ListParams::default())
            .await
            .map_err(|error| OrchestratorError::from_kube("pods", error))?;

        Ok(pods.items)
    }

    async fn list_services(&self) -> Result<Vec<Service>, OrchestratorError> {
        let services = self
            .client
            .global_api::<Service>()
            .list(&ListParams::default())
            .await
            .map_err(|error| OrchestratorError::from_kube("services", error))?;

        Ok(services.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, OrchestratorError> {
        self.client
            .global_api::<Node>()
            .get_opt(name)
            .await
            .map_err(|error| OrchestratorError::from_kube(name, error))
    }

    async fn annotate_node(
        &self,
        name: &str,
        resource_version: Option<&str>,
        key: &str,
        value: Option<&str>,
    ) -> Result<Node, OrchestratorError> {
        let api: Api<Node> = self.client.global_api();

        patch_annotation(&api, name, resource_version, key, value)
            .await
            .map_err(|error| OrchestratorError::from_kube(name, error))
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        key: &str,
        value: Option<&str>,
    ) -> Result<Pod, OrchestratorError> {
        let api: Api<Pod> = self.client.namespaced_api(namespace);

        patch_annotation(&api, name, resource_version, key, value)
            .await
            .map_err(|error| OrchestratorError::from_kube(&format!("{namespace}/{name}"), error))
    }
}
