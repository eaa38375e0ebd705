use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Pod;
use kube::{runtime::controller::Action, ResourceExt};
use log::{debug, info, warn};
use ovnkube_core::{
    helpers::{ovn_node_name, RequireMetadata},
    kubernetes::annotations::{PodNetwork, POD_NETWORK_ANNOTATION},
    nbdb::entities::EntityKey,
    topology::{endpoint_port, endpoint_switch_port, pod_network},
};

use crate::{orchestrator::OrchestratorError, watcher::key_of};

use super::{
    context::{EndpointRecord, ReconcilerContext},
    error::ReconcilerError,
    guarded,
};

pub async fn reconcile_endpoint(pod: Arc<Pod>, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    let key = key_of(pod.as_ref());

    // finished endpoints give their address back
    let reconcile = async {
        if is_finished(&pod) {
            teardown_endpoint(&key, &context).await
        } else {
            ensure_endpoint(&key, &pod, &context).await
        }
    };

    guarded::<Pod, _>(&key, &context, reconcile).await
}

/// Detaches an endpoint that was deleted, `key` being `namespace/name`.
pub async fn cleanup_endpoint(key: String, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    guarded::<Pod, _>(&key, &context, teardown_endpoint(&key, &context)).await
}

async fn ensure_endpoint(key: &str, pod: &Pod, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    if uses_host_network(pod) {
        return Ok(Action::await_change());
    }

    let Some(node) = pod.spec.as_ref().and_then(|spec| spec.node_name.clone()) else {
        debug!("Endpoint '{key}' isn't scheduled yet");
        return Ok(Action::await_change());
    };

    let namespace = pod.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let name = pod.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let host_subnet = context
        .address_space
        .host_subnet(&node)
        .await
        .ok_or_else(|| ReconcilerError::HostSubnetMissing(node.clone()))?;

    let published = published_network(pod);
    let network = assign_network(&node, &endpoint_port(namespace, name), host_subnet, published.as_ref(), context).await?;

    let previous = context.endpoints.get(key).await;
    let attached = previous
        .as_ref()
        .map(|previous| previous.attached && previous.node == node && previous.address == network.ip())
        .unwrap_or(false);
    let mut record = EndpointRecord::from_pod(pod, &node, network.ip(), attached);

    context.endpoints.insert(key, record.clone()).await;

    context
        .db
        .ensure(endpoint_switch_port(&ovn_node_name(&node), namespace, name, &network))
        .await?;

    // the attach agent may act on it right away, so only after the port exists
    if published.as_ref() != Some(&network) {
        let value = network.to_string();
        let result = context
            .orchestrator
            .annotate_pod(namespace, name, None, POD_NETWORK_ANNOTATION, Some(&value))
            .await;

        match result {
            Ok(_) => info!("Published '{value}' network for '{key}' endpoint!"),
            Err(OrchestratorError::NotFound(_)) => debug!("Endpoint '{key}' is gone, skipping its annotation"),
            Err(error) => return Err(error.into()),
        }
    }

    record.attached = true;
    context.endpoints.insert(key, record.clone()).await;

    if previous.as_ref() != Some(&record) {
        let labels = previous
            .iter()
            .map(|previous| &previous.labels)
            .chain([&record.labels]);

        context.notify_services(namespace, labels);
    }

    Ok(Action::await_change())
}

async fn teardown_endpoint(key: &str, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let (namespace, name) = key
        .split_once('/')
        .ok_or_else(|| ReconcilerError::MalformedKey(key.to_owned()))?;
    let port = endpoint_port(namespace, name);

    context.db.delete(&EntityKey::LogicalSwitchPort(port.clone())).await?;

    if let Some(record) = context.endpoints.remove(key).await {
        context
            .address_space
            .lock()
            .await
            .release_address(&record.node, &port);
        context.notify_services(namespace, [&record.labels]);

        info!("Endpoint '{key}' detached from '{}' node", record.node);
    }

    Ok(Action::await_change())
}

/// Keeps the address the endpoint already holds or was published with,
/// allocates one otherwise.
async fn assign_network(
    node: &str,
    port: &str,
    host_subnet: Ipv4Net,
    published: Option<&PodNetwork>,
    context: &ReconcilerContext,
) -> Result<PodNetwork, ReconcilerError> {
    let mut space = context.address_space.lock().await;

    let address = match space.address(node, port) {
        Some(address) => address,
        None => match published.filter(|network| host_subnet.contains(&network.ip())) {
            Some(network) => space.reserve_address(node, port, network.ip())?,
            None => space.allocate_address(node, port)?,
        },
    };

    let mac = published
        .filter(|network| network.ip() == address)
        .map(|network| network.mac.clone());

    Ok(pod_network(&host_subnet, address, mac))
}

pub fn published_network(pod: &Pod) -> Option<PodNetwork> {
    let raw = pod.annotations().get(POD_NETWORK_ANNOTATION)?;

    match raw.parse() {
        Ok(network) => Some(network),
        Err(error) => {
            warn!("Ignoring invalid network annotation of '{}' endpoint! {error}", pod.name_any());
            None
        }
    }
}

pub fn uses_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

pub fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}
