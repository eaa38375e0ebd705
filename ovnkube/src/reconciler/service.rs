use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Service;
use kube::{runtime::controller::Action, ResourceExt};
use log::{debug, warn};
use ovnkube_core::{
    nbdb::entities::{EntityKey, LoadBalancerVip, Protocol},
    topology::{cluster_load_balancer, gateway_load_balancer, GatewayTopology},
};

use crate::watcher::key_of;

use super::{
    context::{service_selector, ReconcilerContext},
    error::ReconcilerError,
    guarded,
};

pub async fn reconcile_service(service: Arc<Service>, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    let key = key_of(service.as_ref());
    let reconcile = async {
        let desired = desired_vips(&service, &context).await;
        program_vips(&key, desired, &context).await
    };

    guarded::<Service, _>(&key, &context, reconcile).await
}

/// Drops every VIP of a deleted service.
pub async fn cleanup_service(key: String, context: Arc<ReconcilerContext>) -> Result<Action, ReconcilerError> {
    guarded::<Service, _>(&key, &context, program_vips(&key, BTreeMap::new(), &context)).await
}

async fn program_vips(
    key: &str,
    desired: BTreeMap<EntityKey, LoadBalancerVip>,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let desired_keys = desired.keys().cloned().collect::<BTreeSet<_>>();

    // track the union while writing so an interrupted pass leaks nothing
    let previous = {
        let mut service_vips = context.service_vips.lock().await;
        let tracked = service_vips.entry(key.to_owned()).or_default();
        let previous = tracked.clone();
        tracked.extend(desired_keys.iter().cloned());
        previous
    };

    for vip in desired.into_values() {
        context.db.ensure(vip).await?;
    }

    for stale in previous.difference(&desired_keys) {
        context.db.delete(stale).await?;
    }

    let mut service_vips = context.service_vips.lock().await;
    if desired_keys.is_empty() {
        service_vips.remove(key);
    } else {
        service_vips.insert(key.to_owned(), desired_keys);
    }

    Ok(Action::await_change())
}

/// Every VIP `service` should have right now, with its backends. Ports
/// without a ready backend get no VIP at all.
pub async fn desired_vips(service: &Service, context: &ReconcilerContext) -> BTreeMap<EntityKey, LoadBalancerVip> {
    let mut vips = BTreeMap::new();
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();

    let Some(spec) = service.spec.as_ref() else {
        return vips;
    };
    let Some(cluster_ip) = cluster_ip(service) else {
        debug!("Service '{namespace}/{name}' has no cluster IP, skipping");
        return vips;
    };
    let Some(selector) = service_selector(service) else {
        debug!("Service '{namespace}/{name}' has no selector, skipping");
        return vips;
    };

    let endpoints = context.endpoints.serving(&namespace, selector).await;
    let gateways: Vec<GatewayTopology> = if context.settings.nodeport && exposes_node_ports(service) {
        context.gateways.lock().await.values().cloned().collect()
    } else {
        vec![]
    };

    for port in spec.ports.iter().flatten() {
        let protocol = match port.protocol.as_deref() {
            None | Some("TCP") => Protocol::Tcp,
            Some("UDP") => Protocol::Udp,
            Some(other) => {
                warn!("Service '{namespace}/{name}' port {} uses unsupported {other} protocol, skipping", port.port);
                continue;
            }
        };

        let Ok(service_port) = u16::try_from(port.port) else {
            continue;
        };

        let backends = endpoints
            .iter()
            .filter_map(|endpoint| endpoint.backend(port.target_port.as_ref(), port.port, protocol))
            .collect::<Vec<_>>();

        if backends.is_empty() {
            continue;
        }

        let vip = LoadBalancerVip::new(
            cluster_load_balancer(protocol),
            SocketAddrV4::new(cluster_ip, service_port),
            backends.iter().copied(),
        );
        vips.insert(vip_key(&vip), vip);

        let Some(node_port) = port.node_port.and_then(|node_port| u16::try_from(node_port).ok()) else {
            continue;
        };

        for gateway in &gateways {
            let vip = LoadBalancerVip::new(
                gateway_load_balancer(&gateway.node, protocol),
                gateway.nodeport_vip(node_port),
                backends.iter().copied(),
            );
            vips.insert(vip_key(&vip), vip);
        }
    }

    vips
}

fn vip_key(vip: &LoadBalancerVip) -> EntityKey {
    EntityKey::LoadBalancerVip {
        load_balancer: vip.load_balancer.clone(),
        vip: vip.vip,
    }
}

fn cluster_ip(service: &Service) -> Option<Ipv4Addr> {
    let raw = service.spec.as_ref()?.cluster_ip.as_deref()?;

    if raw.is_empty() || raw == "None" {
        return None;
    }

    match raw.parse() {
        Ok(address) => Some(address),
        Err(_) => {
            warn!("Service '{}' has non-IPv4 cluster IP {raw}, skipping", service.name_any());
            None
        }
    }
}

fn exposes_node_ports(service: &Service) -> bool {
    matches!(
        service.spec.as_ref().and_then(|spec| spec.type_.as_deref()),
        Some("NodePort") | Some("LoadBalancer")
    )
}
