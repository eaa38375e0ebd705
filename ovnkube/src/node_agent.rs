use std::time::Duration;

use ipnet::Ipv4Net;
use kube::ResourceExt;
use log::{debug, info, warn};
use ovnkube_core::{
    config::{
        external_ids::ExternalIds,
        gateway::GatewaySettings,
        ovn_auth::{OvnDbAuth, PublishError},
    },
    exec::CommandRunner,
    kubernetes::annotations::{parse_host_subnet, GatewayAnnotation, HOST_SUBNET_ANNOTATION, L3_GATEWAY_ANNOTATION},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{Orchestrator, OrchestratorError};

pub const HOST_SUBNET_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// OVS external id naming the local chassis.
const SYSTEM_ID_EXTERNAL_ID: &str = "system-id";

#[derive(Debug, Error)]
pub enum NodeAgentError {
    #[error("Couldn't publish the database settings! {}", .0)]
    Publish(#[from] PublishError),
    #[error("Couldn't reach the Kubernetes API! {}", .0)]
    Orchestrator(#[from] OrchestratorError),
    #[error("Node '{}' isn't registered in the cluster!", .0)]
    NodeMissing(String),
}

/// Node side of the system: wires the local OVS to the databases, advertises
/// the gateway role and waits for the node's host subnet.
pub struct NodeAgent<'a> {
    pub node: &'a str,
    pub north: &'a OvnDbAuth,
    pub south: &'a OvnDbAuth,
    pub gateway: Option<&'a GatewaySettings>,
    pub orchestrator: &'a dyn Orchestrator,
    pub external_ids: &'a dyn ExternalIds,
    pub commands: &'a dyn CommandRunner,
}

impl NodeAgent<'_> {
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), NodeAgentError> {
        self.north.publish(self.external_ids, self.commands).await?;
        self.south.publish(self.external_ids, self.commands).await?;
        self.advertise_gateway().await?;

        let Some(host_subnet) = self.wait_for_host_subnet(HOST_SUBNET_POLL_INTERVAL, &shutdown).await? else {
            return Ok(());
        };

        info!("Node '{}' is ready with {host_subnet} host subnet!", self.node);

        shutdown.cancelled().await;

        info!("Node agent of '{}' stopped", self.node);

        Ok(())
    }

    /// Writes the gateway annotation, or removes it when the node isn't a
    /// gateway (anymore).
    pub async fn advertise_gateway(&self) -> Result<(), NodeAgentError> {
        let node = self
            .orchestrator
            .get_node(self.node)
            .await?
            .ok_or_else(|| NodeAgentError::NodeMissing(self.node.to_owned()))?;

        let desired = match self.gateway {
            Some(settings) => {
                let chassis = self.external_ids.get(SYSTEM_ID_EXTERNAL_ID).await;
                if chassis.is_none() {
                    warn!("OVS has no {SYSTEM_ID_EXTERNAL_ID} external id, the gateway router won't be pinned!");
                }

                Some(GatewayAnnotation::from_settings(settings, chassis).to_string())
            }
            None => None,
        };

        if node.annotations().get(L3_GATEWAY_ANNOTATION) == desired.as_ref() {
            debug!("Gateway role of '{}' is up to date", self.node);
            return Ok(());
        }

        self.orchestrator
            .annotate_node(self.node, None, L3_GATEWAY_ANNOTATION, desired.as_deref())
            .await?;

        match desired {
            Some(value) => info!("Advertised '{}' as gateway ({value})", self.node),
            None => info!("Revoked the gateway role of '{}'", self.node),
        }

        Ok(())
    }

    /// Polls until the control plane annotated the node. `None` if `shutdown`
    /// fired first.
    pub async fn wait_for_host_subnet(
        &self,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Option<Ipv4Net>, NodeAgentError> {
        loop {
            let node = self
                .orchestrator
                .get_node(self.node)
                .await?
                .ok_or_else(|| NodeAgentError::NodeMissing(self.node.to_owned()))?;

            if let Some(raw) = node.annotations().get(HOST_SUBNET_ANNOTATION) {
                match parse_host_subnet(raw) {
                    Ok(subnet) => return Ok(Some(subnet)),
                    Err(error) => debug!("Waiting for a valid host subnet on '{}'... {error}", self.node),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(interval) => (),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use k8s_openapi::api::core::v1::Node;
    use kube::core::ObjectMeta;
    use maplit::btreemap;
    use ovnkube_core::{
        config::{
            external_ids::InMemoryExternalIds,
            gateway::{GatewayMode, GatewaySettings},
            ovn_auth::{OvnDbAuth, OvnDirection, RawOvnAuth},
        },
        exec::SystemCommands,
        kubernetes::annotations::{HOST_SUBNET_ANNOTATION, L3_GATEWAY_ANNOTATION},
    };
    use tokio_util::sync::CancellationToken;

    use crate::orchestrator::{fake::FakeOrchestrator, Orchestrator};

    use super::{NodeAgent, NodeAgentError};

    fn auth(direction: OvnDirection, address: &str) -> OvnDbAuth {
        let raw = RawOvnAuth {
            address: Some(address.to_owned()),
            ..Default::default()
        };

        OvnDbAuth::parse(direction, &raw).unwrap()
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

    fn settings() -> GatewaySettings {
        GatewaySettings {
            mode: GatewayMode::Shared,
            interface: "eth1".to_owned(),
            address: "192.168.1.10/24".parse().unwrap(),
            next_hop: "192.168.1.1".parse().unwrap(),
            vlan_id: Some(20),
        }
    }

    #[tokio::test]
    async fn gateway_role_is_advertised_and_revoked() {
        let orchestrator = FakeOrchestrator::default();
        orchestrator.add_node(node("worker-1"));
        let external_ids = InMemoryExternalIds::with_values(btreemap! {
            "system-id".to_owned() => "chassis-1".to_owned(),
        });
        let north = auth(OvnDirection::North, "tcp:10.0.0.5:6641");
        let south = auth(OvnDirection::South, "tcp:10.0.0.5:6642");
        let settings = settings();

        let mut agent = NodeAgent {
            node: "worker-1",
            north: &north,
            south: &south,
            gateway: Some(&settings),
            orchestrator: &orchestrator,
            external_ids: &external_ids,
            commands: &SystemCommands,
        };

        agent.advertise_gateway().await.unwrap();

        let annotations = orchestrator.node("worker-1").unwrap().metadata.annotations.unwrap();
        assert_eq!(
            annotations[L3_GATEWAY_ANNOTATION],
            "mode=shared,interface=eth1,ip-address=192.168.1.10/24,next-hop=192.168.1.1,vlan-id=20,chassis=chassis-1"
        );

        agent.gateway = None;
        agent.advertise_gateway().await.unwrap();

        let annotations = orchestrator.node("worker-1").unwrap().metadata.annotations.unwrap();
        assert!(!annotations.contains_key(L3_GATEWAY_ANNOTATION));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_publishes_and_waits_for_its_subnet() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        orchestrator.add_node(node("worker-1"));
        let external_ids = InMemoryExternalIds::default();
        let north = auth(OvnDirection::North, "tcp:10.0.0.5:6641");
        let south = auth(OvnDirection::South, "tcp:10.0.0.5:6642");

        let agent = NodeAgent {
            node: "worker-1",
            north: &north,
            south: &south,
            gateway: None,
            orchestrator: orchestrator.as_ref(),
            external_ids: &external_ids,
            commands: &SystemCommands,
        };
        let shutdown = CancellationToken::new();

        let annotate = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            orchestrator
                .annotate_node("worker-1", None, HOST_SUBNET_ANNOTATION, Some("10.0.4.0/24"))
                .await
                .unwrap();
        };
        let (subnet, _) = tokio::join!(agent.wait_for_host_subnet(Duration::from_secs(1), &shutdown), annotate);

        assert_eq!(subnet.unwrap(), Some("10.0.4.0/24".parse().unwrap()));

        shutdown.cancel();
        agent.run(shutdown.clone()).await.unwrap();

        let published = external_ids.snapshot();
        assert_eq!(published["ovn-nb"], "tcp:10.0.0.5:6641");
        assert_eq!(published["ovn-remote"], "tcp:10.0.0.5:6642");
    }

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let orchestrator = FakeOrchestrator::default();
        let external_ids = InMemoryExternalIds::default();
        let north = auth(OvnDirection::North, "tcp:10.0.0.5:6641");
        let south = auth(OvnDirection::South, "tcp:10.0.0.5:6642");

        let agent = NodeAgent {
            node: "ghost",
            north: &north,
            south: &south,
            gateway: None,
            orchestrator: &orchestrator,
            external_ids: &external_ids,
            commands: &SystemCommands,
        };

        assert!(matches!(
            agent.advertise_gateway().await,
            Err(NodeAgentError::NodeMissing(_))
        ));
    }
}
