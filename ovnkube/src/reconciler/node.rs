use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::{
    runtime::{controller::Action, reflector::ObjectRef},
    ResourceExt,
};
use log::{debug, info, warn};
use ovnkube_core::{
    helpers::ovn_node_name,
    kubernetes::annotations::{parse_host_subnet, HOST_SUBNET_ANNOTATION},
    topology::NodeTopology,
};

use crate::orchestrator::OrchestratorError;

use super::{
    context::{request, ReconcilerContext},
    error::ReconcilerError,
    gateway, guarded,
};

/// Attempts at writing the host subnet annotation before giving up.
pub const ANNOTATION_CONFLICT_RETRIES: u32 = 3;

pub async fn reconcile_node(node: Arc<Node>, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    let name = node.name_any();

    guarded::<Node, _>(&name, &context, ensure_node(&node, &context)).await
}

/// Removes everything programmed for a node that left the cluster.
pub async fn cleanup_node(name: String, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    guarded::<Node, _>(&name, &context, teardown_node(&name, &context)).await
}

async fn ensure_node(node: &Node, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let name = node.name_any();
    let (host_subnet, fresh) = acquire_host_subnet(node, context).await?;
    let topology = NodeTopology::new(&ovn_node_name(&name), host_subnet);

    for entity in topology.entities() {
        context.db.ensure(entity).await?;
    }

    if gateway::reconcile_gateway(node, host_subnet, context).await? {
        context.notify_all_services();
    }

    // endpoints scheduled before the subnet existed
    if fresh {
        for pod in context.pods.state() {
            if pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(name.as_str()) {
                request(&context.queues.endpoints, ObjectRef::from_obj(pod.as_ref()));
            }
        }
    }

    debug!("Node '{name}' is wired to {host_subnet}");

    Ok(Action::await_change())
}

async fn teardown_node(name: &str, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    if gateway::teardown_gateway(name, context).await? {
        context.notify_all_services();
    }

    for key in NodeTopology::teardown_keys(&ovn_node_name(name)) {
        context.db.delete(&key).await?;
    }

    context.address_space.lock().await.release_host_subnet(name);

    let records = context.endpoints.remove_node(name).await;
    for record in &records {
        context.notify_services(&record.namespace, [&record.labels]);
    }

    info!("Node '{name}' removed ({} endpoints dropped)", records.len());

    Ok(Action::await_change())
}

/// The annotated subnet if there is one, otherwise a new allocation written
/// back to the node. The flag tells whether the node was unknown so far.
async fn acquire_host_subnet(node: &Node, context: &ReconcilerContext) -> Result<(Ipv4Net, bool), ReconcilerError> {
    let name = node.name_any();
    let known = context.address_space.host_subnet(&name).await;

    if let Some(annotated) = annotated_host_subnet(node) {
        if known == Some(annotated) {
            return Ok((annotated, false));
        }

        context
            .address_space
            .lock()
            .await
            .reserve_host_subnet(&name, annotated)?;

        return Ok((annotated, true));
    }

    let allocated = context.address_space.get_or_allocate_host_subnet(&name).await?;
    let subnet = write_host_subnet(node, allocated, context).await?;

    Ok((subnet, known.is_none() || subnet != allocated))
}

fn annotated_host_subnet(node: &Node) -> Option<Ipv4Net> {
    let raw = node.annotations().get(HOST_SUBNET_ANNOTATION)?;

    match parse_host_subnet(raw) {
        Ok(subnet) => Some(subnet),
        Err(error) => {
            warn!("Replacing invalid host subnet of '{}' node! {error}", node.name_any());
            None
        }
    }
}

/// Publishes `subnet` guarded by the node's resource version. When somebody
/// else annotated the node in the meantime their subnet wins.
async fn write_host_subnet(node: &Node, subnet: Ipv4Net, context: &ReconcilerContext) -> Result<Ipv4Net, ReconcilerError> {
    let name = node.name_any();
    let value = subnet.to_string();
    let mut resource_version = node.resource_version();

    for attempt in 1..=ANNOTATION_CONFLICT_RETRIES {
        let result = context
            .orchestrator
            .annotate_node(&name, resource_version.as_deref(), HOST_SUBNET_ANNOTATION, Some(&value))
            .await;

        match result {
            Ok(_) => {
                info!("Annotated '{name}' node with {subnet} host subnet!");
                return Ok(subnet);
            }
            Err(OrchestratorError::Conflict(_)) => {
                debug!("Host subnet annotation of '{name}' conflicted (attempt {attempt}), re-reading...");
            }
            Err(error) => return Err(error.into()),
        }

        let Some(current) = context.orchestrator.get_node(&name).await? else {
            context.address_space.lock().await.release_host_subnet(&name);
            return Err(OrchestratorError::NotFound(name).into());
        };

        if let Some(theirs) = annotated_host_subnet(&current) {
            if theirs != subnet {
                info!("Node '{name}' was annotated with {theirs} concurrently, adopting it...");
                context.address_space.lock().await.reserve_host_subnet(&name, theirs)?;
            }

            return Ok(theirs);
        }

        resource_version = current.resource_version();
    }

    Err(ReconcilerError::AnnotationConflict(
        HOST_SUBNET_ANNOTATION,
        name,
        ANNOTATION_CONFLICT_RETRIES,
    ))
}
