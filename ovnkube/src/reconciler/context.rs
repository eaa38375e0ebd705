use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Arc, PoisonError},
};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};

use ipnet::Ipv4Net;
use k8s_openapi::{
    api::core::v1::{Node, Pod, Service},
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{
    runtime::{
        reflector::{ObjectRef, Store},
        watcher,
    },
    Resource, ResourceExt,
};
use log::debug;
use ovnkube_core::{
    allocations::AddressSpaceSync,
    helpers::pretty_type_name,
    ip::cidr::ClusterCidr,
    nbdb::{
        backoff::Backoff,
        client::DbClient,
        entities::{EntityKey, Protocol},
    },
    topology::GatewayTopology,
};
use tokio::sync::Mutex;

use crate::orchestrator::Orchestrator;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub cluster_cidr: ClusterCidr,
    pub transit_range: Ipv4Net,
    pub nodeport: bool,
    /// requeue delays of reconciles waiting for a prerequisite
    pub retry_backoff: Backoff,
}

/// Reconcile requests for one kind, fed to its controller.
pub type Requests<K> = UnboundedSender<Result<ObjectRef<K>, watcher::Error>>;
pub type RequestStream<K> = UnboundedReceiver<Result<ObjectRef<K>, watcher::Error>>;

/// Request queues of every reconciled kind, so that one reconciler can poke
/// another.
#[derive(Debug, Clone)]
pub struct Queues {
    pub nodes: Requests<Node>,
    pub endpoints: Requests<Pod>,
    pub services: Requests<Service>,
    /// asks for every service at once
    pub all_services: UnboundedSender<()>,
}

pub struct QueueReceivers {
    pub nodes: RequestStream<Node>,
    pub endpoints: RequestStream<Pod>,
    pub services: RequestStream<Service>,
    pub all_services: UnboundedReceiver<()>,
}

impl Queues {
    pub fn new() -> (Self, QueueReceivers) {
        let (nodes, node_requests) = mpsc::unbounded();
        let (endpoints, endpoint_requests) = mpsc::unbounded();
        let (services, service_requests) = mpsc::unbounded();
        let (all_services, service_resyncs) = mpsc::unbounded();

        (
            Self {
                nodes,
                endpoints,
                services,
                all_services,
            },
            QueueReceivers {
                nodes: node_requests,
                endpoints: endpoint_requests,
                services: service_requests,
                all_services: service_resyncs,
            },
        )
    }
}

/// Asks the controller behind `queue` to reconcile `object`.
pub fn request<K: Resource>(queue: &Requests<K>, object: ObjectRef<K>) {
    if let Err(error) = queue.unbounded_send(Ok(object)) {
        debug!("{} controller is gone, dropping request! {error}", pretty_type_name::<K>());
    }
}

/// Consecutive reconcile failures per object.
#[derive(Debug, Default)]
pub struct Failures(std::sync::Mutex<HashMap<(&'static str, String), u32>>);

impl Failures {
    /// Counts one more failure and returns the streak.
    pub fn record(&self, kind: &'static str, key: &str) -> u32 {
        let mut failures = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry((kind, key.to_owned())).or_default();
        *attempt = attempt.saturating_add(1);

        *attempt
    }

    pub fn clear(&self, kind: &'static str, key: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, key.to_owned()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// What the service reconciler needs to know about an addressed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub node: String,
    pub namespace: String,
    pub address: Ipv4Addr,
    pub labels: Labels,
    pub ready: bool,
    /// its switch port exists
    pub attached: bool,
    pub ports: Vec<NamedPort>,
}

impl EndpointRecord {
    pub fn from_pod(pod: &Pod, node: &str, address: Ipv4Addr, attached: bool) -> Self {
        Self {
            node: node.to_owned(),
            namespace: pod.namespace().unwrap_or_default(),
            address,
            labels: pod.labels().clone(),
            ready: is_ready(pod),
            attached,
            ports: named_ports(pod),
        }
    }

    pub fn serves(&self) -> bool {
        self.attached && self.ready
    }

    pub fn is_selected_by(&self, namespace: &str, selector: &Labels) -> bool {
        self.namespace == namespace && selects(selector, &self.labels)
    }

    /// Backend address for a service port, `None` if a named target port
    /// isn't exposed by this endpoint.
    pub fn backend(&self, target_port: Option<&IntOrString>, port: i32, protocol: Protocol) -> Option<SocketAddrV4> {
        let port = match target_port {
            Some(IntOrString::Int(port)) => u16::try_from(*port).ok()?,
            Some(IntOrString::String(name)) => match name.parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    self.ports
                        .iter()
                        .find(|named| &named.name == name && named.protocol == protocol)?
                        .port
                }
            },
            None => u16::try_from(port).ok()?,
        };

        Some(SocketAddrV4::new(self.address, port))
    }
}

/// Endpoints keyed by `namespace/name`.
#[derive(Debug, Default)]
pub struct EndpointRegistry(Mutex<BTreeMap<String, EndpointRecord>>);

impl EndpointRegistry {
    pub async fn get(&self, key: &str) -> Option<EndpointRecord> {
        self.0.lock().await.get(key).cloned()
    }

    pub async fn insert(&self, key: &str, record: EndpointRecord) -> Option<EndpointRecord> {
        self.0.lock().await.insert(key.to_owned(), record)
    }

    pub async fn remove(&self, key: &str) -> Option<EndpointRecord> {
        self.0.lock().await.remove(key)
    }

    pub async fn remove_node(&self, node: &str) -> Vec<EndpointRecord> {
        let mut records = self.0.lock().await;
        let keys = records
            .iter()
            .filter(|(_, record)| record.node == node)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        keys.iter().filter_map(|key| records.remove(key)).collect()
    }

    /// Endpoints a service with `selector` balances to right now.
    pub async fn serving(&self, namespace: &str, selector: &Labels) -> Vec<EndpointRecord> {
        self.0
            .lock()
            .await
            .values()
            .filter(|record| record.serves() && record.is_selected_by(namespace, selector))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.0.lock().await.len()
    }
}

pub struct ReconcilerContext {
    pub db: Arc<DbClient>,
    pub address_space: Arc<AddressSpaceSync>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub nodes: Store<Node>,
    pub pods: Store<Pod>,
    pub services: Store<Service>,
    pub settings: NetworkSettings,
    pub queues: Queues,
    pub failures: Failures,
    pub endpoints: EndpointRegistry,
    /// gateway topologies currently programmed, by node
    pub gateways: Mutex<BTreeMap<String, GatewayTopology>>,
    /// VIPs currently programmed, by service
    pub service_vips: Mutex<HashMap<String, BTreeSet<EntityKey>>>,
}

impl ReconcilerContext {
    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.get(&ObjectRef::new(name))
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Arc<Pod>> {
        self.pods.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(&ObjectRef::new(name).within(namespace))
    }

    /// Requeues the services of `namespace` that select any of `labels`.
    pub fn notify_services<'a>(&self, namespace: &str, labels: impl IntoIterator<Item = &'a Labels>) {
        let labels = labels.into_iter().collect::<Vec<_>>();

        for service in self.services.state() {
            if service.namespace().as_deref() != Some(namespace) {
                continue;
            }

            let Some(selector) = service_selector(&service) else {
                continue;
            };

            if labels.iter().any(|labels| selects(selector, labels)) {
                request(&self.queues.services, ObjectRef::from_obj(service.as_ref()));
            }
        }
    }

    pub fn notify_all_services(&self) {
        if let Err(error) = self.queues.all_services.unbounded_send(()) {
            debug!("Service controller is gone, dropping resync! {error}");
        }
    }
}

pub fn service_selector(service: &Service) -> Option<&Labels> {
    service
        .spec
        .as_ref()?
        .selector
        .as_ref()
        .filter(|selector| !selector.is_empty())
}

/// Equality based label selection; an empty selector selects nothing.
pub fn selects(selector: &Labels, labels: &Labels) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
}

pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

fn named_ports(pod: &Pod) -> Vec<NamedPort> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .filter_map(|port| {
            Some(NamedPort {
                name: port.name.clone()?,
                port: u16::try_from(port.container_port).ok()?,
                protocol: match port.protocol.as_deref() {
                    None | Some("TCP") => Protocol::Tcp,
                    Some("UDP") => Protocol::Udp,
                    Some(_) => return None,
                },
            })
        })
        .collect()
}
