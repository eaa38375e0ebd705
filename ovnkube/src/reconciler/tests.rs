use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, Node, Pod, PodCondition, PodSpec, PodStatus, Service, ServicePort, ServiceSpec,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use futures::StreamExt;
use kube::{
    core::ObjectMeta,
    runtime::{
        controller::Action,
        reflector::{self, store::Writer},
        watcher::Event,
    },
};
use maplit::btreemap;
use ovnkube_core::{
    allocations::AddressSpace,
    ip::cidr::ClusterCidr,
    kubernetes::annotations::{HOST_SUBNET_ANNOTATION, L3_GATEWAY_ANNOTATION, POD_NETWORK_ANNOTATION},
    nbdb::{
        backoff::Backoff,
        client::{DbClient, DbClientOptions},
        entities::{Entity, EntityKey, EntityKind, LoadBalancerVip},
        memory::MemoryTransport,
    },
    topology::{cluster_entities, endpoint_port, gateway_router, router_to_switch_port},
};
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{fake::FakeOrchestrator, Orchestrator};

use super::{
    context::{NetworkSettings, QueueReceivers, Queues, ReconcilerContext},
    endpoint::{cleanup_endpoint, reconcile_endpoint},
    error::ReconcilerError,
    guarded,
    node::{cleanup_node, reconcile_node},
    reconcile_error, requeue_action,
    service::{cleanup_service, reconcile_service},
};

struct Harness {
    context: Arc<ReconcilerContext>,
    transport: Arc<MemoryTransport>,
    orchestrator: Arc<FakeOrchestrator>,
    nodes: Writer<Node>,
    pods: Writer<Pod>,
    services: Writer<Service>,
    requests: QueueReceivers,
}

impl Harness {
    async fn new(cluster: &str) -> Self {
        Self::with_nodeport(cluster, false).await
    }

    async fn with_nodeport(cluster: &str, nodeport: bool) -> Self {
        let transport = Arc::new(MemoryTransport::default());
        let db = Arc::new(DbClient::new(
            transport.clone(),
            DbClientOptions::default(),
            CancellationToken::new(),
        ));

        for entity in cluster_entities() {
            db.ensure(entity).await.unwrap();
        }

        let cluster_cidr: ClusterCidr = cluster.parse().unwrap();
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let (node_store, nodes) = reflector::store();
        let (pod_store, pods) = reflector::store();
        let (service_store, services) = reflector::store();
        let (queues, requests) = Queues::new();

        let context = ReconcilerContext {
            db,
            address_space: Arc::new(AddressSpace::new(cluster_cidr.clone()).into()),
            orchestrator: orchestrator.clone(),
            nodes: node_store,
            pods: pod_store,
            services: service_store,
            settings: NetworkSettings {
                cluster_cidr,
                transit_range: "100.64.0.0/16".parse().unwrap(),
                nodeport,
                retry_backoff: Backoff::default(),
            },
            queues,
            failures: Default::default(),
            endpoints: Default::default(),
            gateways: Default::default(),
            service_vips: Default::default(),
        };

        Self {
            context: Arc::new(context),
            transport,
            orchestrator,
            nodes,
            pods,
            services,
            requests,
        }
    }

    fn add_node(&mut self, node: Node) {
        let node = self.orchestrator.add_node(node);
        self.nodes.apply_watcher_event(&Event::Applied(node));
    }

    fn delete_node(&mut self, name: &str) {
        let node = self.orchestrator.node(name).unwrap();
        self.orchestrator.remove_node(name);
        self.nodes.apply_watcher_event(&Event::Deleted(node));
    }

    /// Reconciles, or cleans up once gone, and feeds the resulting annotations
    /// back like the watch would.
    async fn reconcile_node(&mut self, name: &str) -> Result<Action, ReconcilerError> {
        let result = match self.context.node(name) {
            Some(node) => reconcile_node(node, self.context.clone()).await,
            None => cleanup_node(name.to_owned(), self.context.clone()).await,
        };

        if let Some(node) = self.orchestrator.node(name) {
            self.nodes.apply_watcher_event(&Event::Applied(node));
        }

        result
    }

    fn add_pod(&mut self, pod: Pod) {
        let pod = self.orchestrator.add_pod(pod);
        self.pods.apply_watcher_event(&Event::Applied(pod));
    }

    fn delete_pod(&mut self, name: &str) {
        let pod = self.orchestrator.pod("default", name).unwrap();
        self.orchestrator.remove_pod("default", name);
        self.pods.apply_watcher_event(&Event::Deleted(pod));
    }

    async fn reconcile_pod(&mut self, name: &str) -> Result<Action, ReconcilerError> {
        let result = match self.context.pod("default", name) {
            Some(pod) => reconcile_endpoint(pod, self.context.clone()).await,
            None => cleanup_endpoint(format!("default/{name}"), self.context.clone()).await,
        };

        if let Some(pod) = self.orchestrator.pod("default", name) {
            self.pods.apply_watcher_event(&Event::Applied(pod));
        }

        result
    }

    fn add_service(&mut self, service: Service) {
        let service = self.orchestrator.add_service(service);
        self.services.apply_watcher_event(&Event::Applied(service));
    }

    async fn reconcile_service(&self, name: &str) -> Result<Action, ReconcilerError> {
        match self.context.service("default", name) {
            Some(service) => reconcile_service(service, self.context.clone()).await,
            None => cleanup_service(format!("default/{name}"), self.context.clone()).await,
        }
    }

    fn delete_service(&mut self, name: &str) {
        let service = self.orchestrator.service("default", name).unwrap();
        self.orchestrator.remove_service("default", name);
        self.services.apply_watcher_event(&Event::Deleted(service));
    }

    fn host_subnet(&self, node: &str) -> Option<String> {
        self.orchestrator
            .node(node)?
            .metadata
            .annotations?
            .get(HOST_SUBNET_ANNOTATION)
            .cloned()
    }

    fn pod_network(&self, pod: &str) -> Option<String> {
        self.orchestrator
            .pod("default", pod)?
            .metadata
            .annotations?
            .get(POD_NETWORK_ANNOTATION)
            .cloned()
    }

    fn vip(&self, load_balancer: &str, vip: SocketAddrV4) -> Option<LoadBalancerVip> {
        let key = EntityKey::LoadBalancerVip {
            load_balancer: load_balancer.to_owned(),
            vip,
        };

        match self.transport.get(&key)? {
            Entity::LoadBalancerVip(vip) => Some(vip),
            _ => None,
        }
    }
}

fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn gateway_node(name: &str, annotation: &str) -> Node {
    let mut node = node(name);
    node.metadata.annotations = Some(btreemap! { L3_GATEWAY_ANNOTATION.to_owned() => annotation.to_owned() });
    node
}

fn pod(name: &str, node: &str, app: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            labels: Some(btreemap! { "app".to_owned() => app.to_owned() }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_owned()),
            containers: vec![Container {
                name: "main".to_owned(),
                ports: Some(vec![ContainerPort {
                    name: Some("http".to_owned()),
                    container_port: 8080,
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_owned(),
                status: "True".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn service(name: &str, cluster_ip: &str, app: &str, node_port: Option<i32>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some("default".to_owned()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_owned()),
            selector: Some(btreemap! { "app".to_owned() => app.to_owned() }),
            type_: Some(if node_port.is_some() { "NodePort" } else { "ClusterIP" }.to_owned()),
            ports: Some(vec![ServicePort {
                port: 80,
                target_port: Some(IntOrString::Int(8080)),
                protocol: Some("TCP".to_owned()),
                node_port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn socket(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port)
}

#[tokio::test]
async fn nodes_get_host_subnets_in_order() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;

    for name in ["n1", "n2", "n3"] {
        harness.add_node(node(name));
        harness.reconcile_node(name).await.unwrap();
    }

    assert_eq!(harness.host_subnet("n1").as_deref(), Some("10.0.0.0/24"));
    assert_eq!(harness.host_subnet("n2").as_deref(), Some("10.0.1.0/24"));
    assert_eq!(harness.host_subnet("n3").as_deref(), Some("10.0.2.0/24"));
    assert_eq!(harness.transport.count(EntityKind::LogicalSwitch), 3);

    harness.delete_node("n2");
    harness.reconcile_node("n2").await.unwrap();

    assert_eq!(harness.transport.get(&EntityKey::LogicalSwitch("n2".to_owned())), None);
    assert_eq!(
        harness
            .transport
            .get(&EntityKey::LogicalRouterPort(router_to_switch_port("n2"))),
        None
    );

    harness.add_node(node("n4"));
    harness.reconcile_node("n4").await.unwrap();

    assert_eq!(harness.host_subnet("n4").as_deref(), Some("10.0.1.0/24"));
}

#[tokio::test]
async fn endpoints_get_addresses_past_the_node_ports() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();

    for name in ["p1", "p2"] {
        harness.add_pod(pod(name, "n1", "web"));
        harness.reconcile_pod(name).await.unwrap();
    }

    assert_eq!(
        harness.pod_network("p1").as_deref(),
        Some("address=10.0.0.2/24,gateway=10.0.0.0,mac=0a:58:0a:00:00:02")
    );
    assert_eq!(
        harness.pod_network("p2").as_deref(),
        Some("address=10.0.0.3/24,gateway=10.0.0.0,mac=0a:58:0a:00:00:03")
    );

    match harness
        .transport
        .get(&EntityKey::LogicalSwitchPort(endpoint_port("default", "p1")))
    {
        Some(Entity::LogicalSwitchPort(port)) => {
            assert_eq!(port.switch, "n1");
            assert_eq!(port.addresses, ["0a:58:0a:00:00:02 10.0.0.2"]);
            assert_eq!(port.port_security, ["0a:58:0a:00:00:02 10.0.0.2"]);
        }
        other => panic!("unexpected endpoint port {other:?}"),
    }

    harness.delete_pod("p1");
    harness.reconcile_pod("p1").await.unwrap();

    assert_eq!(
        harness
            .transport
            .get(&EntityKey::LogicalSwitchPort(endpoint_port("default", "p1"))),
        None
    );

    harness.add_pod(pod("p3", "n1", "web"));
    harness.reconcile_pod("p3").await.unwrap();

    assert!(harness
        .pod_network("p3")
        .unwrap()
        .starts_with("address=10.0.0.2/24,"));
}

#[tokio::test]
async fn service_backends_follow_endpoints() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;

    for name in ["n1", "n2"] {
        harness.add_node(node(name));
        harness.reconcile_node(name).await.unwrap();
    }

    harness.add_pod(pod("a-1", "n1", "a"));
    harness.add_pod(pod("a-2", "n2", "a"));
    harness.add_pod(pod("b-1", "n1", "b"));
    for name in ["a-1", "a-2", "b-1"] {
        harness.reconcile_pod(name).await.unwrap();
    }

    harness.add_service(service("svc-a", "172.16.1.10", "a", None));
    harness.reconcile_service("svc-a").await.unwrap();

    let vip = socket(172, 16, 1, 10, 80);
    assert_eq!(
        harness.vip("cluster-lb-tcp", vip).unwrap().backends,
        [socket(10, 0, 0, 2, 8080), socket(10, 0, 1, 2, 8080)]
    );

    harness.delete_pod("a-2");
    harness.reconcile_pod("a-2").await.unwrap();

    let before = harness.context.db.stats().kind(EntityKind::LoadBalancerVip);
    harness.reconcile_service("svc-a").await.unwrap();
    let after = harness.context.db.stats().kind(EntityKind::LoadBalancerVip);

    assert_eq!(after.ensure_calls - before.ensure_calls, 1);
    assert_eq!(after.writes - before.writes, 1);
    assert_eq!(
        harness.vip("cluster-lb-tcp", vip).unwrap().backends,
        [socket(10, 0, 0, 2, 8080)]
    );

    harness.delete_pod("a-1");
    harness.reconcile_pod("a-1").await.unwrap();
    harness.reconcile_service("svc-a").await.unwrap();

    assert_eq!(harness.vip("cluster-lb-tcp", vip), None);
}

#[tokio::test]
async fn exhausted_cluster_network_recovers_after_a_release() {
    let mut harness = Harness::new("10.0.0.0/30/30").await;

    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();

    harness.add_node(node("n2"));
    let error = harness.reconcile_node("n2").await.unwrap_err();

    assert!(matches!(&error, ReconcilerError::Allocation(allocation) if allocation.is_exhausted()));
    assert_ne!(requeue_action("n2", &error, 5, &harness.context), Action::await_change());

    harness.delete_node("n1");
    harness.reconcile_node("n1").await.unwrap();
    harness.reconcile_node("n2").await.unwrap();

    assert_eq!(harness.host_subnet("n2").as_deref(), Some("10.0.0.0/30"));
}

#[tokio::test]
async fn repeated_reconciles_write_nothing() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();
    harness.add_pod(pod("p1", "n1", "web"));
    harness.reconcile_pod("p1").await.unwrap();
    harness.add_service(service("web", "172.16.1.20", "web", None));
    harness.reconcile_service("web").await.unwrap();

    let snapshot = harness.transport.snapshot();
    let writes = harness.context.db.stats().total().writes;
    let annotations = harness.orchestrator.annotation_writes.load(Ordering::SeqCst);

    harness.reconcile_node("n1").await.unwrap();
    harness.reconcile_pod("p1").await.unwrap();
    harness.reconcile_service("web").await.unwrap();

    assert_eq!(harness.transport.snapshot(), snapshot);
    assert_eq!(harness.context.db.stats().total().writes, writes);
    assert_eq!(harness.orchestrator.annotation_writes.load(Ordering::SeqCst), annotations);
}

#[tokio::test]
async fn annotation_conflicts_are_retried() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.orchestrator.conflict_next(2);

    harness.reconcile_node("n1").await.unwrap();

    assert_eq!(harness.host_subnet("n1").as_deref(), Some("10.0.0.0/24"));
}

#[tokio::test]
async fn persistent_annotation_conflicts_are_dropped_after_one_retry() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.orchestrator.conflict_next(3);

    let error = harness.reconcile_node("n1").await.unwrap_err();

    assert!(matches!(error, ReconcilerError::AnnotationConflict(..)));
    let n1 = harness.context.node("n1").unwrap();
    assert_eq!(
        reconcile_error(n1.clone(), &error, harness.context.clone()),
        Action::requeue(Duration::from_secs(10))
    );
    assert_eq!(
        reconcile_error(n1.clone(), &error, harness.context.clone()),
        Action::await_change()
    );
    // the streak starts over after a drop
    assert_eq!(
        reconcile_error(n1, &error, harness.context.clone()),
        Action::requeue(Duration::from_secs(10))
    );
}

#[tokio::test]
async fn concurrently_written_subnet_is_adopted() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));

    // another writer gets there first, the local view is stale
    harness
        .orchestrator
        .annotate_node("n1", None, HOST_SUBNET_ANNOTATION, Some("10.0.7.0/24"))
        .await
        .unwrap();

    harness.reconcile_node("n1").await.unwrap();

    assert_eq!(
        harness.context.address_space.host_subnet("n1").await,
        Some("10.0.7.0/24".parse().unwrap())
    );
    match harness.transport.get(&EntityKey::LogicalSwitch("n1".to_owned())) {
        Some(Entity::LogicalSwitch(switch)) => assert_eq!(switch.other_config["subnet"], "10.0.7.0/24"),
        other => panic!("unexpected switch {other:?}"),
    }
}

#[tokio::test]
async fn endpoints_wait_for_their_node() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.add_pod(pod("p1", "n1", "web"));

    let error = harness.reconcile_pod("p1").await.unwrap_err();

    assert!(matches!(error, ReconcilerError::HostSubnetMissing(_)));
    assert_ne!(requeue_action("default/p1", &error, 1, &harness.context), Action::await_change());
    assert_eq!(harness.pod_network("p1"), None);
}

#[tokio::test]
async fn host_network_and_finished_endpoints_hold_no_address() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();

    let mut host = pod("host", "n1", "web");
    host.spec.as_mut().unwrap().host_network = Some(true);
    harness.add_pod(host);
    harness.reconcile_pod("host").await.unwrap();

    assert_eq!(harness.pod_network("host"), None);
    assert_eq!(harness.transport.count(EntityKind::LogicalSwitchPort), 2);

    harness.add_pod(pod("job", "n1", "batch"));
    harness.reconcile_pod("job").await.unwrap();
    assert_eq!(
        harness.context.address_space.lock().await.address("n1", "default_job"),
        Some(Ipv4Addr::new(10, 0, 0, 2))
    );

    let mut finished = harness.orchestrator.pod("default", "job").unwrap();
    finished.status.as_mut().unwrap().phase = Some("Succeeded".to_owned());
    harness.add_pod(finished);
    harness.reconcile_pod("job").await.unwrap();

    assert_eq!(harness.context.address_space.lock().await.address("n1", "default_job"), None);
    assert_eq!(harness.transport.count(EntityKind::LogicalSwitchPort), 2);
}

#[tokio::test]
async fn gateway_role_programs_and_revokes_the_gateway_router() {
    let mut harness = Harness::with_nodeport("10.0.0.0/16/24", true).await;
    harness.add_node(gateway_node(
        "n1",
        "mode=shared,interface=eth1,ip-address=192.168.1.10/24,next-hop=192.168.1.1",
    ));
    harness.reconcile_node("n1").await.unwrap();

    assert!(harness
        .transport
        .get(&EntityKey::LogicalRouter(gateway_router("n1")))
        .is_some());
    assert_eq!(harness.transport.count(EntityKind::Nat), 1);

    harness.add_pod(pod("web-1", "n1", "web"));
    harness.reconcile_pod("web-1").await.unwrap();
    harness.add_service(service("web", "172.16.1.30", "web", Some(30080)));
    harness.reconcile_service("web").await.unwrap();

    assert_eq!(
        harness
            .vip("GR_n1-lb-tcp", socket(192, 168, 1, 10, 30080))
            .unwrap()
            .backends,
        [socket(10, 0, 0, 2, 8080)]
    );

    let mut revoked = harness.orchestrator.node("n1").unwrap();
    revoked
        .metadata
        .annotations
        .as_mut()
        .unwrap()
        .remove(L3_GATEWAY_ANNOTATION);
    harness.add_node(revoked);
    harness.reconcile_node("n1").await.unwrap();
    harness.reconcile_service("web").await.unwrap();

    assert!(harness
        .transport
        .get(&EntityKey::LogicalRouter(gateway_router("n1")))
        .is_none());
    assert_eq!(harness.transport.count(EntityKind::Nat), 0);
    assert_eq!(harness.transport.count(EntityKind::StaticRoute), 0);
    assert_eq!(harness.vip("GR_n1-lb-tcp", socket(192, 168, 1, 10, 30080)), None);
    assert!(harness
        .vip("cluster-lb-tcp", socket(172, 16, 1, 30, 80))
        .is_some());
}

#[tokio::test]
async fn fresh_subnet_requeues_the_nodes_endpoints() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.add_pod(pod("p1", "n1", "web"));
    harness.add_pod(pod("p2", "n2", "web"));

    harness.reconcile_node("n1").await.unwrap();

    let requested = harness.requests.endpoints.next().await.unwrap().unwrap();
    assert_eq!(requested.name, "p1");
    assert_eq!(requested.namespace.as_deref(), Some("default"));
    assert!(harness.requests.endpoints.try_next().is_err());

    harness.reconcile_node("n1").await.unwrap();
    assert!(harness.requests.endpoints.try_next().is_err());
}

#[tokio::test]
async fn endpoint_changes_requeue_selecting_services() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();
    harness.add_service(service("web", "172.16.1.40", "web", None));
    harness.add_service(service("db", "172.16.1.41", "db", None));

    harness.add_pod(pod("web-1", "n1", "web"));
    harness.reconcile_pod("web-1").await.unwrap();

    let requested = harness.requests.services.next().await.unwrap().unwrap();
    assert_eq!(requested.name, "web");
    assert!(harness.requests.services.try_next().is_err());
}

#[tokio::test]
async fn gateway_changes_resync_every_service() {
    let mut harness = Harness::with_nodeport("10.0.0.0/16/24", true).await;
    harness.add_node(gateway_node(
        "n1",
        "mode=shared,interface=eth1,ip-address=192.168.1.10/24,next-hop=192.168.1.1",
    ));

    harness.reconcile_node("n1").await.unwrap();

    assert_eq!(harness.requests.all_services.next().await, Some(()));
}

#[tokio::test]
async fn deleted_services_lose_their_vips() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    harness.reconcile_node("n1").await.unwrap();
    harness.add_pod(pod("web-1", "n1", "web"));
    harness.reconcile_pod("web-1").await.unwrap();
    harness.add_service(service("web", "172.16.1.50", "web", None));
    harness.reconcile_service("web").await.unwrap();

    assert!(harness.vip("cluster-lb-tcp", socket(172, 16, 1, 50, 80)).is_some());

    harness.delete_service("web");
    harness.reconcile_service("web").await.unwrap();

    assert_eq!(harness.vip("cluster-lb-tcp", socket(172, 16, 1, 50, 80)), None);
    assert!(harness.context.service_vips.lock().await.is_empty());
}

async fn broken_reconcile() -> Result<Action, ReconcilerError> {
    panic!("broken invariant")
}

#[tokio::test]
async fn panicking_reconciles_become_retried_errors() {
    let harness = Harness::new("10.0.0.0/16/24").await;

    let result = guarded::<Node, _>("n1", &harness.context, broken_reconcile()).await;

    assert!(matches!(result, Err(ReconcilerError::Panicked)));
    assert_eq!(
        requeue_action("n1", &ReconcilerError::Panicked, 1, &harness.context),
        Action::requeue(Duration::from_secs(10))
    );
}

#[tokio::test]
async fn success_ends_the_failure_streak() {
    let mut harness = Harness::new("10.0.0.0/16/24").await;
    harness.add_node(node("n1"));
    let n1 = harness.context.node("n1").unwrap();
    let conflict = ReconcilerError::AnnotationConflict(HOST_SUBNET_ANNOTATION, "n1".to_owned(), 3);

    assert_eq!(
        reconcile_error(n1.clone(), &conflict, harness.context.clone()),
        Action::requeue(Duration::from_secs(10))
    );

    harness.reconcile_node("n1").await.unwrap();

    assert_eq!(
        reconcile_error(n1, &conflict, harness.context.clone()),
        Action::requeue(Duration::from_secs(10))
    );
}
