use std::collections::BTreeSet;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use log::info;
use ovnkube_core::{
    helpers::ovn_node_name,
    kubernetes::annotations::{GatewayAnnotation, L3_GATEWAY_ANNOTATION},
    topology::{transit_subnet, GatewayTopology},
};

use super::{context::ReconcilerContext, error::ReconcilerError};

/// Brings the gateway router of `node` in line with its gateway annotation.
/// Returns `true` if the set of gateways (or one of them) changed.
pub async fn reconcile_gateway(
    node: &Node,
    host_subnet: Ipv4Net,
    context: &ReconcilerContext,
) -> Result<bool, ReconcilerError> {
    let name = node.name_any();

    match gateway_annotation(node)? {
        Some(annotation) => {
            let topology = desired_topology(&name, host_subnet, annotation, context).await?;
            ensure_gateway(&name, topology, context).await
        }
        None => teardown_gateway(&name, context).await,
    }
}

pub fn gateway_annotation(node: &Node) -> Result<Option<GatewayAnnotation>, ReconcilerError> {
    node.annotations()
        .get(L3_GATEWAY_ANNOTATION)
        .map(|raw| {
            raw.parse().map_err(|error| {
                ReconcilerError::InvalidAnnotation(L3_GATEWAY_ANNOTATION, node.name_any(), error)
            })
        })
        .transpose()
}

/// The transit link of a gateway is the /30 at the position of the node's
/// host subnet, so it follows the subnet across restarts.
pub async fn desired_topology(
    name: &str,
    host_subnet: Ipv4Net,
    gateway: GatewayAnnotation,
    context: &ReconcilerContext,
) -> Result<GatewayTopology, ReconcilerError> {
    let ordinal = context.address_space.lock().await.slot_ordinal(&host_subnet);
    let transit = ordinal
        .and_then(|ordinal| transit_subnet(&context.settings.transit_range, ordinal))
        .ok_or(ReconcilerError::TransitRangeExhausted(host_subnet))?;

    Ok(GatewayTopology {
        node: ovn_node_name(name),
        host_subnet,
        transit,
        gateway,
        cluster_cidr: context.settings.cluster_cidr.clone(),
        nodeport: context.settings.nodeport,
    })
}

async fn ensure_gateway(
    name: &str,
    topology: GatewayTopology,
    context: &ReconcilerContext,
) -> Result<bool, ReconcilerError> {
    let previous = context.gateways.lock().await.get(name).cloned();

    for entity in topology.entities() {
        context.db.ensure(entity).await?;
    }

    if previous.as_ref() == Some(&topology) {
        return Ok(false);
    }

    if let Some(previous) = &previous {
        let desired = topology
            .entities()
            .iter()
            .map(|entity| entity.key())
            .collect::<BTreeSet<_>>();

        for entity in previous.entities().iter().rev() {
            let key = entity.key();
            if !desired.contains(&key) {
                context.db.delete(&key).await?;
            }
        }
    }

    info!(
        "Gateway router of '{name}' node is up ({} mode, transit {})",
        topology.gateway.mode, topology.transit
    );

    context.gateways.lock().await.insert(name.to_owned(), topology);

    Ok(true)
}

/// Deletes the gateway router of `name` together with its links, if one was
/// programmed.
pub async fn teardown_gateway(name: &str, context: &ReconcilerContext) -> Result<bool, ReconcilerError> {
    let Some(previous) = context.gateways.lock().await.get(name).cloned() else {
        return Ok(false);
    };

    for key in GatewayTopology::teardown_keys(&previous.node, Some(previous.host_subnet)) {
        context.db.delete(&key).await?;
    }

    context.gateways.lock().await.remove(name);

    info!("Gateway router of '{name}' node removed");

    Ok(true)
}
