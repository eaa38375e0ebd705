use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    future::Future,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use futures::{
    channel::mpsc::{self, UnboundedSender},
    Stream, StreamExt,
};
use ipnet::Ipv4Net;
use k8s_openapi::api::{
    core::v1::{Node, Pod, Service},
    networking::v1::NetworkPolicy,
};
use kube::{
    runtime::{
        controller::{self, Action},
        reflector::{self, store::Writer, ObjectRef},
        watcher::{self, Event},
        Controller,
    },
    Client, Resource, ResourceExt,
};
use log::{debug, error, info, warn};
use ovnkube_core::{
    allocations::{AddressSpace, AllocationsError},
    config::Config,
    helpers::{ovn_node_name, pretty_type_name},
    kubernetes::{
        annotations::{parse_host_subnet, HOST_SUBNET_ANNOTATION, L3_GATEWAY_ANNOTATION},
        object_key, GetApi,
    },
    nbdb::{
        backoff::Backoff,
        client::{DbClient, DbClientOptions, DbError},
        entities::{Entity, EntityKey, EntityKind, RoutePolicy},
        nbctl::{NbctlTransport, DEFAULT_NBCTL_TIMEOUT},
    },
    topology::{
        cluster_entities, endpoint_port, external_switch, GatewayTopology, NodeTopology, CLUSTER_ROUTER,
        NAMESPACE_EXTERNAL_ID, NODE_EXTERNAL_ID, POD_EXTERNAL_ID,
    },
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    orchestrator::{KubeOrchestrator, Orchestrator, OrchestratorError},
    reconciler::{
        context::{request, EndpointRecord, NetworkSettings, Queues, ReconcilerContext, Requests},
        endpoint::{cleanup_endpoint, is_finished, published_network, reconcile_endpoint, uses_host_network},
        error::ReconcilerError,
        gateway::{desired_topology, gateway_annotation},
        node::{cleanup_node, reconcile_node},
        policy::observe_policy,
        reconcile_error,
        service::{cleanup_service, desired_vips, reconcile_service},
    },
    watcher::{key_of, watch_kind, ObjectEvent},
};

/// How long in-flight reconciles get to finish on shutdown.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(10);
/// Delay before a failed teardown of a deleted object runs again.
const CLEANUP_RETRY: Duration = Duration::from_secs(10);

type ControllerResult<K> = Result<(ObjectRef<K>, Action), controller::Error<ReconcilerError, watcher::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Init,
    Hydrate,
    Running,
    Draining,
    Stopped,
}

impl Display for SupervisorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            SupervisorState::Init => "init",
            SupervisorState::Hydrate => "hydrate",
            SupervisorState::Running => "running",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        };

        f.write_str(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failed,
    DatabaseLost,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Failed => 1,
            ExitStatus::DatabaseLost => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum HydrateError {
    #[error("Couldn't read the cluster state! {}", .0)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Couldn't read the northbound database! {}", .0)]
    Db(#[from] DbError),
    #[error("Cluster state holds conflicting allocations! {}", .0)]
    Allocation(#[from] AllocationsError),
    #[error("Shutdown requested during hydration!")]
    Interrupted,
}

impl HydrateError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            HydrateError::Db(DbError::RetriesExhausted { .. }) => ExitStatus::DatabaseLost,
            HydrateError::Interrupted => ExitStatus::Clean,
            _ => ExitStatus::Failed,
        }
    }
}

/// Write halves of the object stores the reconcilers read from.
pub struct Writers {
    pub nodes: Writer<Node>,
    pub pods: Writer<Pod>,
    pub services: Writer<Service>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HydrateSummary {
    pub nodes: usize,
    pub endpoints: usize,
    pub gateways: usize,
    pub stale: usize,
}

struct Lifecycle {
    state: SupervisorState,
}

impl Lifecycle {
    fn transition(&mut self, next: SupervisorState) {
        info!("Control plane {} -> {}", self.state, next);
        self.state = next;
    }
}

pub fn new_context(
    db: Arc<DbClient>,
    orchestrator: Arc<dyn Orchestrator>,
    settings: NetworkSettings,
    queues: Queues,
) -> (ReconcilerContext, Writers) {
    let (node_store, nodes) = reflector::store();
    let (pod_store, pods) = reflector::store();
    let (service_store, services) = reflector::store();

    let context = ReconcilerContext {
        db,
        address_space: Arc::new(AddressSpace::new(settings.cluster_cidr.clone()).into()),
        orchestrator,
        nodes: node_store,
        pods: pod_store,
        services: service_store,
        settings,
        queues,
        failures: Default::default(),
        endpoints: Default::default(),
        gateways: Default::default(),
        service_vips: Default::default(),
    };

    (context, Writers { nodes, pods, services })
}

/// Runs the control plane until `shutdown` fires or the database is lost.
pub async fn run_control_plane(
    config: &Config,
    client: Client,
    nodeport: bool,
    shutdown: CancellationToken,
) -> ExitStatus {
    let mut lifecycle = Lifecycle {
        state: SupervisorState::Init,
    };

    let db_cancel = CancellationToken::new();
    let transport = Arc::new(NbctlTransport::new(&config.ovn_north, DEFAULT_NBCTL_TIMEOUT));
    let db = Arc::new(DbClient::new(transport, DbClientOptions::default(), db_cancel.clone()));
    let settings = NetworkSettings {
        cluster_cidr: config.network.cluster_cidr.clone(),
        transit_range: config.network.transit_range,
        nodeport,
        retry_backoff: Backoff::default(),
    };

    let (queues, requests) = Queues::new();

    let orchestrator = Arc::new(KubeOrchestrator::new(client.clone()));
    let (context, mut writers) = new_context(db.clone(), orchestrator, settings, queues.clone());
    let context = Arc::new(context);

    lifecycle.transition(SupervisorState::Hydrate);

    let hydrated = tokio::select! {
        _ = shutdown.cancelled() => Err(HydrateError::Interrupted),
        hydrated = hydrate(&context, &mut writers) => hydrated,
    };

    match hydrated {
        Ok(summary) => info!(
            "Hydrated {} nodes, {} endpoints and {} gateways, removed {} stale objects",
            summary.nodes, summary.endpoints, summary.gateways, summary.stale
        ),
        Err(error) => {
            match &error {
                HydrateError::Interrupted => info!("{error}"),
                _ => error!("Hydration failed! {error}"),
            }

            db_cancel.cancel();
            lifecycle.transition(SupervisorState::Stopped);

            return error.exit_status();
        }
    }

    lifecycle.transition(SupervisorState::Running);

    let tasks_cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let Writers { nodes, pods, services } = writers;

    let (node_events, node_triggers) = mpsc::unbounded();
    tasks.spawn(watch_kind(
        client.global_api::<Node>(),
        nodes,
        tasks_cancel.clone(),
        Backoff::default(),
        move |event| {
            if node_needs_reconcile(&event) {
                trigger(&node_events, &event);
            }
        },
    ));

    let (endpoint_events, endpoint_triggers) = mpsc::unbounded();
    tasks.spawn(watch_kind(
        client.global_api::<Pod>(),
        pods,
        tasks_cancel.clone(),
        Backoff::default(),
        move |event| {
            if !uses_host_network(event.object()) {
                trigger(&endpoint_events, &event);
            }
        },
    ));

    let (service_events, service_triggers) = mpsc::unbounded();
    tasks.spawn(watch_kind(
        client.global_api::<Service>(),
        services,
        tasks_cancel.clone(),
        Backoff::default(),
        move |event| trigger(&service_events, &event),
    ));

    let (_, policies) = reflector::store::<NetworkPolicy>();
    tasks.spawn(watch_kind(
        client.global_api::<NetworkPolicy>(),
        policies,
        tasks_cancel.clone(),
        Backoff::default(),
        observe_policy,
    ));

    let nodes = Controller::for_stream(node_triggers, context.nodes.clone())
        .reconcile_on(requests.nodes)
        .graceful_shutdown_on(tasks_cancel.clone().cancelled_owned())
        .run(reconcile_node, reconcile_error, context.clone());
    tasks.spawn(drive(nodes, queues.nodes.clone(), context.clone(), cleanup_node));

    let endpoints = Controller::for_stream(endpoint_triggers, context.pods.clone())
        .reconcile_on(requests.endpoints)
        .graceful_shutdown_on(tasks_cancel.clone().cancelled_owned())
        .run(reconcile_endpoint, reconcile_error, context.clone());
    tasks.spawn(drive(endpoints, queues.endpoints.clone(), context.clone(), cleanup_endpoint));

    let services = Controller::for_stream(service_triggers, context.services.clone())
        .reconcile_on(requests.services)
        .reconcile_all_on(requests.all_services)
        .graceful_shutdown_on(tasks_cancel.clone().cancelled_owned())
        .run(reconcile_service, reconcile_error, context.clone());
    tasks.spawn(drive(services, queues.services.clone(), context.clone(), cleanup_service));

    let failure = db.failure_token();
    let status = tokio::select! {
        _ = shutdown.cancelled() => {
            info!("Shutdown requested!");
            ExitStatus::Clean
        }
        _ = failure.cancelled() => {
            error!("The northbound database stayed unreachable, shutting down!");
            ExitStatus::DatabaseLost
        }
    };

    lifecycle.transition(SupervisorState::Draining);

    tasks_cancel.cancel();
    let drained = tokio::time::timeout(DEFAULT_DRAIN_DEADLINE, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!("Control plane task ended abnormally! {error}");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!("Reconciles didn't drain within {DEFAULT_DRAIN_DEADLINE:?}, abandoning them!");
        tasks.shutdown().await;
    }

    db_cancel.cancel();
    db.close(DEFAULT_DRAIN_DEADLINE).await;

    lifecycle.transition(SupervisorState::Stopped);

    status
}

/// Hands the object behind `event` to its controller. Deleted objects are
/// already gone from the store, so the controller reports them as missing.
fn trigger<K: Resource + Clone>(events: &UnboundedSender<Result<K, watcher::Error>>, event: &ObjectEvent<K>) {
    if let Err(error) = events.unbounded_send(Ok(event.object().clone())) {
        debug!("{} controller is gone, dropping event! {error}", pretty_type_name::<K>());
    }
}

/// Consumes the results of one controller. Objects missing from the store
/// were deleted and get `cleanup`, requeued through `retries` while it fails.
async fn drive<K, S, C, F>(results: S, retries: Requests<K>, context: Arc<ReconcilerContext>, cleanup: C)
where
    K: Resource + 'static,
    K::DynamicType: Default + Send,
    S: Stream<Item = ControllerResult<K>>,
    C: Fn(String, Arc<ReconcilerContext>) -> F,
    F: Future<Output = Result<Action, ReconcilerError>>,
{
    let kind = pretty_type_name::<K>();
    let mut results = pin!(results);

    info!("{kind} controller started");

    while let Some(result) = results.next().await {
        match result {
            Ok((object, action)) => debug!("Reconciled {kind} '{}' ({action:?})", object.name),
            Err(controller::Error::ObjectNotFound(object)) => {
                let key = object_key(object.namespace.as_deref(), &object.name);

                match cleanup(key.clone(), context.clone()).await {
                    Ok(_) => (),
                    Err(error) if error.is_cancelled() => debug!("Cleanup of {kind} '{key}' cancelled"),
                    Err(error) => {
                        warn!("Cleanup of {kind} '{key}' failed, retrying in {CLEANUP_RETRY:?}! {error}");

                        let mut missing = ObjectRef::<K>::new(&object.name);
                        if let Some(namespace) = object.namespace.as_deref() {
                            missing = missing.within(namespace);
                        }
                        retry_later(retries.clone(), missing);
                    }
                }
            }
            Err(controller::Error::ReconcilerFailed(error, object)) if error.is_cancelled() => {
                debug!("Reconcile of {kind} '{}' cancelled", object.name)
            }
            Err(controller::Error::ReconcilerFailed(error, object)) => {
                warn!("{kind} '{}' reconciliation failed! {error}", object.name)
            }
            Err(controller::Error::QueueError(error)) => warn!("{kind} controller queue failed! {error}"),
        }
    }

    info!("{kind} controller stopped");
}

fn retry_later<K>(retries: Requests<K>, object: ObjectRef<K>)
where
    K: Resource + 'static,
    K::DynamicType: Send,
{
    tokio::spawn(async move {
        tokio::time::sleep(CLEANUP_RETRY).await;
        request(&retries, object);
    });
}

/// Only host subnet and gateway role changes concern the node reconciler.
pub fn node_needs_reconcile(event: &ObjectEvent<Node>) -> bool {
    match event {
        ObjectEvent::Updated { old, new } => [HOST_SUBNET_ANNOTATION, L3_GATEWAY_ANNOTATION]
            .iter()
            .any(|key| old.annotations().get(*key) != new.annotations().get(*key)),
        ObjectEvent::Added(_) | ObjectEvent::Deleted(_) => true,
    }
}

/// Rebuilds the in-memory state from the persisted annotations, then removes
/// database objects nothing owns anymore.
pub async fn hydrate(context: &ReconcilerContext, writers: &mut Writers) -> Result<HydrateSummary, HydrateError> {
    let nodes = context.orchestrator.list_nodes().await?;
    let pods = context.orchestrator.list_pods().await?;
    let services = context.orchestrator.list_services().await?;

    writers.nodes.apply_watcher_event(&Event::Restarted(nodes.clone()));
    writers.pods.apply_watcher_event(&Event::Restarted(pods.clone()));
    writers.services.apply_watcher_event(&Event::Restarted(services.clone()));

    for entity in cluster_entities() {
        context.db.ensure(entity).await?;
    }

    let mut summary = HydrateSummary {
        nodes: reserve_host_subnets(context, &nodes).await?,
        gateways: seed_gateways(context, &nodes).await,
        ..Default::default()
    };
    summary.endpoints = reserve_endpoints(context, &pods).await?;
    summary.stale = sweep_topology(context, &nodes).await? + sweep_vips(context, &services).await?;

    Ok(summary)
}

async fn reserve_host_subnets(context: &ReconcilerContext, nodes: &[Node]) -> Result<usize, HydrateError> {
    let mut space = context.address_space.lock().await;
    let mut reserved = 0;

    for node in nodes {
        let name = node.name_any();
        let Some(raw) = node.annotations().get(HOST_SUBNET_ANNOTATION) else {
            continue;
        };

        let subnet = match parse_host_subnet(raw) {
            Ok(subnet) => subnet,
            Err(error) => {
                warn!("Node '{name}' will get a new host subnet! {error}");
                continue;
            }
        };

        match space.reserve_host_subnet(&name, subnet) {
            Ok(_) => reserved += 1,
            Err(error @ AllocationsError::SubnetConflict { .. }) => return Err(error.into()),
            Err(error) => warn!("Node '{name}' will get a new host subnet! {error}"),
        }
    }

    Ok(reserved)
}

async fn seed_gateways(context: &ReconcilerContext, nodes: &[Node]) -> usize {
    let mut seeded = BTreeMap::new();

    for node in nodes {
        let name = node.name_any();
        let Some(host_subnet) = context.address_space.host_subnet(&name).await else {
            continue;
        };

        let annotation = match gateway_annotation(node) {
            Ok(Some(annotation)) => annotation,
            Ok(None) => continue,
            Err(error) => {
                warn!("{error}");
                continue;
            }
        };

        match desired_topology(&name, host_subnet, annotation, context).await {
            Ok(topology) => {
                seeded.insert(name, topology);
            }
            Err(error) => warn!("Skipping gateway of '{name}' node! {error}"),
        }
    }

    let count = seeded.len();
    context.gateways.lock().await.extend(seeded);

    count
}

async fn reserve_endpoints(context: &ReconcilerContext, pods: &[Pod]) -> Result<usize, HydrateError> {
    let attached = context
        .db
        .list(EntityKind::LogicalSwitchPort)
        .await?
        .into_iter()
        .filter_map(|entity| match entity {
            Entity::LogicalSwitchPort(port) => Some(port.name),
            _ => None,
        })
        .collect::<BTreeSet<_>>();
    let mut reserved = 0;

    for pod in pods {
        if uses_host_network(pod) || is_finished(pod) {
            continue;
        }

        let Some(node) = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) else {
            continue;
        };
        let Some(network) = published_network(pod) else {
            continue;
        };

        let key = key_of(pod);
        let port = endpoint_port(&pod.namespace().unwrap_or_default(), &pod.name_any());
        let result = context
            .address_space
            .lock()
            .await
            .reserve_address(node, &port, network.ip());

        match result {
            Ok(address) => {
                let record = EndpointRecord::from_pod(pod, node, address, attached.contains(&port));
                context.endpoints.insert(&key, record).await;
                reserved += 1;
            }
            Err(error @ AllocationsError::AddressConflict(_)) => return Err(error.into()),
            Err(error) => warn!("Endpoint '{key}' will be readdressed! {error}"),
        }
    }

    Ok(reserved)
}

/// Node switches, gateway routers, cluster routes and endpoint ports left
/// behind by objects that are gone.
async fn sweep_topology(context: &ReconcilerContext, nodes: &[Node]) -> Result<usize, HydrateError> {
    let current = nodes
        .iter()
        .map(|node| ovn_node_name(&node.name_any()))
        .collect::<BTreeSet<_>>();
    let (gateway_nodes, gateway_subnets) = {
        let gateways = context.gateways.lock().await;
        (
            gateways.values().map(|gateway| gateway.node.clone()).collect::<BTreeSet<_>>(),
            gateways.values().map(|gateway| gateway.host_subnet).collect::<BTreeSet<Ipv4Net>>(),
        )
    };

    let mut stale = Vec::new();

    for entity in context.db.list(EntityKind::LogicalSwitch).await? {
        let Entity::LogicalSwitch(switch) = entity else { continue };
        let Some(node) = switch.external_ids.get(NODE_EXTERNAL_ID) else {
            continue;
        };

        if switch.name != external_switch(node) && !current.contains(node) {
            info!("Removing switch of vanished '{node}' node");
            stale.extend(NodeTopology::teardown_keys(node));
        }
    }

    for entity in context.db.list(EntityKind::LogicalRouter).await? {
        let Entity::LogicalRouter(router) = entity else { continue };
        let Some(node) = router.external_ids.get(NODE_EXTERNAL_ID) else {
            continue;
        };

        if !gateway_nodes.contains(node) {
            info!("Removing gateway router of '{node}' node");
            stale.extend(GatewayTopology::teardown_keys(node, None));
        }
    }

    for entity in context.db.list(EntityKind::StaticRoute).await? {
        let Entity::StaticRoute(route) = &entity else { continue };

        if route.router == CLUSTER_ROUTER
            && route.policy == RoutePolicy::SrcIp
            && !gateway_subnets.contains(&route.prefix)
        {
            stale.push(entity.key());
        }
    }

    let mut removed = delete_all(context, &stale).await?;

    // ports of removed switches are gone already
    let mut ports = Vec::new();
    for entity in context.db.list(EntityKind::LogicalSwitchPort).await? {
        let Entity::LogicalSwitchPort(port) = &entity else { continue };
        let (Some(namespace), Some(pod)) = (
            port.external_ids.get(NAMESPACE_EXTERNAL_ID),
            port.external_ids.get(POD_EXTERNAL_ID),
        ) else {
            continue;
        };

        if context.endpoints.get(&format!("{namespace}/{pod}")).await.is_none() {
            debug!("Removing port of vanished '{namespace}/{pod}' endpoint");
            ports.push(entity.key());
        }
    }

    removed += delete_all(context, &ports).await?;

    Ok(removed)
}

/// Drops VIPs no current service wants and starts tracking the rest.
async fn sweep_vips(context: &ReconcilerContext, services: &[Service]) -> Result<usize, HydrateError> {
    let mut desired = BTreeSet::new();

    for service in services {
        let vips = desired_vips(service, context).await.into_keys().collect::<BTreeSet<_>>();
        if vips.is_empty() {
            continue;
        }

        desired.extend(vips.iter().cloned());
        context.service_vips.lock().await.insert(key_of(service), vips);
    }

    let stale = context
        .db
        .list(EntityKind::LoadBalancerVip)
        .await?
        .iter()
        .map(Entity::key)
        .filter(|key| !desired.contains(key))
        .collect::<Vec<_>>();

    delete_all(context, &stale).await
}

async fn delete_all(context: &ReconcilerContext, keys: &[EntityKey]) -> Result<usize, HydrateError> {
    let mut removed = 0;

    for key in keys {
        if context.db.delete(key).await? {
            removed += 1;
        }
    }

    Ok(removed)
}
