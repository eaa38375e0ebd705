use std::{
    collections::{BTreeMap, HashMap},
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use log::debug;

use crate::{
    config::ovn_auth::OvnDbAuth,
    exec::{run_command, CommandError},
};

use super::{
    entities::{
        BindingTarget, Entity, EntityKey, EntityKind, LoadBalancer, LoadBalancerBinding,
        LoadBalancerVip, LogicalRouter, LogicalRouterPort, LogicalSwitch, LogicalSwitchPort, Nat,
        NatKind, Protocol, RoutePolicy, StaticRoute,
    },
    ovsdb_json::{parse_table, OvsdbJsonError, Row},
    NorthboundTransport, TransportError,
};

pub const OVN_NBCTL_COMMAND: &str = "ovn-nbctl";
pub const DEFAULT_NBCTL_TIMEOUT: Duration = Duration::from_secs(15);

const SWITCH_COLUMNS: &[&str] = &["_uuid", "name", "other_config", "external_ids", "ports"];
const SWITCH_PORT_COLUMNS: &[&str] = &[
    "_uuid",
    "name",
    "type",
    "addresses",
    "port_security",
    "options",
    "tag",
    "external_ids",
];
const ROUTER_COLUMNS: &[&str] = &["_uuid", "name", "options", "external_ids", "ports"];
const ROUTER_PORT_COLUMNS: &[&str] = &["_uuid", "name", "mac", "networks", "peer"];
const ROUTE_COLUMNS: &[&str] = &["_uuid", "ip_prefix", "nexthop", "output_port", "policy"];
const NAT_COLUMNS: &[&str] = &["_uuid", "type", "external_ip", "logical_ip"];
const LOAD_BALANCER_COLUMNS: &[&str] = &["_uuid", "name", "protocol", "external_ids", "vips"];

/// Talks to the northbound database through `ovn-nbctl`. Every write is a
/// single nbctl invocation, i.e. a single database transaction.
pub struct NbctlTransport {
    program: String,
    connection: Vec<String>,
    timeout: Duration,
}

impl NbctlTransport {
    pub fn new(auth: &OvnDbAuth, timeout: Duration) -> Self {
        Self {
            program: OVN_NBCTL_COMMAND.to_owned(),
            connection: auth.ctl_args(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, TransportError> {
        let mut full = vec![format!("--timeout={}", self.timeout.as_secs().max(1))];
        full.extend(self.connection.iter().cloned());
        full.extend(args);

        // nbctl gives up on its own first; this only catches a wedged process
        run_command(&self.program, &full, self.timeout + Duration::from_secs(1))
            .await
            .map_err(classify)
    }

    async fn query(&self, columns: &[&str], command: Vec<String>) -> Result<Vec<Row>, TransportError> {
        let mut args = vec![
            "--format=json".to_owned(),
            format!("--columns={}", columns.join(",")),
        ];
        args.extend(command);

        Ok(parse_table(&self.run(args).await?)?)
    }

    async fn list_table(&self, table: &str, columns: &[&str]) -> Result<Vec<Row>, TransportError> {
        self.query(columns, vec!["list".to_owned(), table.to_owned()]).await
    }

    async fn find_by_name(
        &self,
        table: &str,
        columns: &[&str],
        name: &str,
    ) -> Result<Option<Row>, TransportError> {
        let rows = self
            .query(
                columns,
                vec![
                    "find".to_owned(),
                    table.to_owned(),
                    format!("name={}", quote(name)),
                ],
            )
            .await?;

        Ok(rows.into_iter().next())
    }

    async fn rows_by_uuid(
        &self,
        table: &str,
        columns: &[&str],
        uuids: Vec<String>,
    ) -> Result<Vec<Row>, TransportError> {
        if uuids.is_empty() {
            return Ok(vec![]);
        }

        let mut command = vec!["list".to_owned(), table.to_owned()];
        command.extend(uuids);

        self.query(columns, command).await
    }

    /// Name of the switch or router whose `column` holds `uuid`.
    async fn owner_of(&self, table: &str, column: &str, uuid: &str) -> Result<Option<String>, TransportError> {
        let rows = self
            .query(
                &["name"],
                vec![
                    "find".to_owned(),
                    table.to_owned(),
                    format!("{column}{{>=}}{uuid}"),
                ],
            )
            .await?;

        rows.first().map(|row| row.string("name")).transpose().map_err(Into::into)
    }

    async fn router_children(
        &self,
        router: &str,
        column: &str,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<Row>, TransportError> {
        let Some(row) = self.find_by_name("logical_router", &[column], router).await? else {
            return Ok(vec![]);
        };

        self.rows_by_uuid(table, columns, row.uuids(column)?).await
    }

    async fn load_balancer_exists(&self, name: &str) -> Result<bool, TransportError> {
        Ok(self
            .find_by_name("load_balancer", &["_uuid"], name)
            .await?
            .is_some())
    }

    async fn fetch_binding(
        &self,
        load_balancer: &str,
        target: &BindingTarget,
    ) -> Result<Option<Entity>, TransportError> {
        let Some(lb) = self.find_by_name("load_balancer", &["_uuid"], load_balancer).await? else {
            return Ok(None);
        };
        let uuid = lb.uuid("_uuid")?;

        let (table, name) = binding_table(target);
        let Some(row) = self.find_by_name(table, &["load_balancer"], name).await? else {
            return Ok(None);
        };

        if !row.uuids("load_balancer")?.contains(&uuid) {
            return Ok(None);
        }

        Ok(Some(
            LoadBalancerBinding {
                load_balancer: load_balancer.to_owned(),
                target: target.clone(),
            }
            .into(),
        ))
    }

    /// Maps child row uuids to the name of the switch/router holding them.
    async fn owners(
        &self,
        table: &str,
        column: &str,
    ) -> Result<HashMap<String, String>, TransportError> {
        let mut owners = HashMap::new();

        for row in self.list_table(table, &["name", column]).await? {
            let name = row.string("name")?;

            for uuid in row.uuids(column)? {
                owners.insert(uuid, name.clone());
            }
        }

        Ok(owners)
    }

    async fn list_children(
        &self,
        owner_table: &str,
        owner_column: &str,
        table: &str,
        columns: &[&str],
        convert: impl Fn(&Row, String) -> Result<Option<Entity>, TransportError>,
    ) -> Result<Vec<Entity>, TransportError> {
        let owners = self.owners(owner_table, owner_column).await?;
        let mut entities = Vec::new();

        for row in self.list_table(table, columns).await? {
            // rows nobody refers to get garbage collected by the database
            let Some(owner) = owners.get(&row.uuid("_uuid")?) else {
                continue;
            };

            if let Some(entity) = convert(&row, owner.clone())? {
                entities.push(entity);
            }
        }

        Ok(entities)
    }
}

#[async_trait]
impl NorthboundTransport for NbctlTransport {
    async fn fetch(&self, key: &EntityKey) -> Result<Option<Entity>, TransportError> {
        match key {
            EntityKey::LogicalSwitch(name) => self
                .find_by_name("logical_switch", SWITCH_COLUMNS, name)
                .await?
                .map(|row| switch_from_row(&row))
                .transpose(),
            EntityKey::LogicalSwitchPort(name) => {
                let Some(row) = self
                    .find_by_name("logical_switch_port", SWITCH_PORT_COLUMNS, name)
                    .await?
                else {
                    return Ok(None);
                };

                let Some(switch) = self.owner_of("logical_switch", "ports", &row.uuid("_uuid")?).await? else {
                    return Ok(None);
                };

                switch_port_from_row(&row, switch).map(Some)
            }
            EntityKey::LogicalRouter(name) => self
                .find_by_name("logical_router", ROUTER_COLUMNS, name)
                .await?
                .map(|row| router_from_row(&row))
                .transpose(),
            EntityKey::LogicalRouterPort(name) => {
                let Some(row) = self
                    .find_by_name("logical_router_port", ROUTER_PORT_COLUMNS, name)
                    .await?
                else {
                    return Ok(None);
                };

                let Some(router) = self.owner_of("logical_router", "ports", &row.uuid("_uuid")?).await? else {
                    return Ok(None);
                };

                router_port_from_row(&row, router).map(Some)
            }
            EntityKey::StaticRoute { router, .. } => {
                for row in self
                    .router_children(router, "static_routes", "logical_router_static_route", ROUTE_COLUMNS)
                    .await?
                {
                    let route = route_from_row(&row, router.clone())?;

                    if &route.key() == key {
                        return Ok(Some(route));
                    }
                }

                Ok(None)
            }
            EntityKey::Nat { router, .. } => {
                for row in self.router_children(router, "nat", "nat", NAT_COLUMNS).await? {
                    match nat_from_row(&row, router.clone())? {
                        Some(nat) if &nat.key() == key => return Ok(Some(nat)),
                        _ => continue,
                    }
                }

                Ok(None)
            }
            EntityKey::LoadBalancer(name) => self
                .find_by_name("load_balancer", LOAD_BALANCER_COLUMNS, name)
                .await?
                .map(|row| load_balancer_from_row(&row))
                .transpose(),
            EntityKey::LoadBalancerVip { load_balancer, vip } => {
                let Some(row) = self
                    .find_by_name("load_balancer", LOAD_BALANCER_COLUMNS, load_balancer)
                    .await?
                else {
                    return Ok(None);
                };

                Ok(vips_from_row(&row)?
                    .into_iter()
                    .find(|entry| &entry.vip == vip)
                    .map(Entity::from))
            }
            EntityKey::LoadBalancerBinding {
                load_balancer,
                target,
            } => self.fetch_binding(load_balancer, target).await,
        }
    }

    async fn apply(&self, entity: &Entity) -> Result<(), TransportError> {
        let args = match entity {
            Entity::LoadBalancer(lb) => {
                if self.load_balancer_exists(&lb.name).await? {
                    apply_args(entity)
                } else {
                    create_load_balancer_args(lb)
                }
            }
            _ => apply_args(entity),
        };

        debug!("Applying {}", entity.key());

        self.run(args).await.map(|_| ())
    }

    async fn remove(&self, key: &EntityKey) -> Result<(), TransportError> {
        debug!("Removing {key}");

        self.run(remove_args(key)).await.map(|_| ())
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Entity>, TransportError> {
        match kind {
            EntityKind::LogicalSwitch => self
                .list_table("logical_switch", SWITCH_COLUMNS)
                .await?
                .iter()
                .map(switch_from_row)
                .collect(),
            EntityKind::LogicalSwitchPort => {
                self.list_children(
                    "logical_switch",
                    "ports",
                    "logical_switch_port",
                    SWITCH_PORT_COLUMNS,
                    |row, switch| switch_port_from_row(row, switch).map(Some),
                )
                .await
            }
            EntityKind::LogicalRouter => self
                .list_table("logical_router", ROUTER_COLUMNS)
                .await?
                .iter()
                .map(router_from_row)
                .collect(),
            EntityKind::LogicalRouterPort => {
                self.list_children(
                    "logical_router",
                    "ports",
                    "logical_router_port",
                    ROUTER_PORT_COLUMNS,
                    |row, router| router_port_from_row(row, router).map(Some),
                )
                .await
            }
            EntityKind::StaticRoute => {
                self.list_children(
                    "logical_router",
                    "static_routes",
                    "logical_router_static_route",
                    ROUTE_COLUMNS,
                    |row, router| route_from_row(row, router).map(Some),
                )
                .await
            }
            EntityKind::Nat => {
                self.list_children("logical_router", "nat", "nat", NAT_COLUMNS, nat_from_row)
                    .await
            }
            EntityKind::LoadBalancer => self
                .list_table("load_balancer", LOAD_BALANCER_COLUMNS)
                .await?
                .iter()
                .map(load_balancer_from_row)
                .collect(),
            EntityKind::LoadBalancerVip => {
                let mut entities = Vec::new();

                for row in self.list_table("load_balancer", LOAD_BALANCER_COLUMNS).await? {
                    entities.extend(vips_from_row(&row)?.into_iter().map(Entity::from));
                }

                Ok(entities)
            }
            EntityKind::LoadBalancerBinding => {
                let names = self
                    .list_table("load_balancer", &["_uuid", "name"])
                    .await?
                    .iter()
                    .map(|row| Ok((row.uuid("_uuid")?, row.string("name")?)))
                    .collect::<Result<HashMap<_, _>, OvsdbJsonError>>()?;

                let mut entities = Vec::new();

                for (table, target) in [
                    ("logical_switch", BindingTarget::Switch as fn(String) -> BindingTarget),
                    ("logical_router", BindingTarget::Router),
                ] {
                    for row in self.list_table(table, &["name", "load_balancer"]).await? {
                        let owner = row.string("name")?;

                        for uuid in row.uuids("load_balancer")? {
                            if let Some(load_balancer) = names.get(&uuid) {
                                entities.push(
                                    LoadBalancerBinding {
                                        load_balancer: load_balancer.clone(),
                                        target: target(owner.clone()),
                                    }
                                    .into(),
                                );
                            }
                        }
                    }
                }

                Ok(entities)
            }
        }
    }
}

impl From<OvsdbJsonError> for TransportError {
    fn from(value: OvsdbJsonError) -> Self {
        TransportError::Permanent(value.to_string())
    }
}

/// Failures that go away by themselves if we just wait a bit.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "database connection failed",
    "timed out",
    "timeout",
    "transaction error",
    "try again",
    "lock",
];

pub fn classify(error: CommandError) -> TransportError {
    match &error {
        CommandError::TimedOut(..) => TransportError::Transient(error.to_string()),
        CommandError::Spawn(..) => TransportError::Permanent(error.to_string()),
        CommandError::Failed { stderr, .. } => {
            let stderr = stderr.to_lowercase();

            if TRANSIENT_MARKERS.iter().any(|marker| stderr.contains(marker)) {
                TransportError::Transient(error.to_string())
            } else {
                TransportError::Permanent(error.to_string())
            }
        }
    }
}

/// OVSDB string literal.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// OVSDB map literal, e.g. `{"subnet"="10.0.0.0/24"}`.
fn map_literal(map: &BTreeMap<String, String>) -> String {
    let pairs = map
        .iter()
        .map(|(key, value)| format!("{}={}", quote(key), quote(value)))
        .collect::<Vec<_>>();

    format!("{{{}}}", pairs.join(","))
}

fn command(parts: &[&str]) -> Vec<String> {
    let mut args = vec!["--".to_owned()];
    args.extend(parts.iter().map(|part| (*part).to_owned()));
    args
}

fn binding_table(target: &BindingTarget) -> (&'static str, &str) {
    match target {
        BindingTarget::Switch(name) => ("logical_switch", name),
        BindingTarget::Router(name) => ("logical_router", name),
    }
}

fn create_load_balancer_args(lb: &LoadBalancer) -> Vec<String> {
    command(&[
        "create",
        "load_balancer",
        &format!("name={}", quote(&lb.name)),
        &format!("protocol={}", lb.protocol),
        &format!("external_ids={}", map_literal(&lb.external_ids)),
    ])
}

/// nbctl arguments rewriting the database object to exactly `entity`.
pub fn apply_args(entity: &Entity) -> Vec<String> {
    match entity {
        Entity::LogicalSwitch(switch) => [
            command(&["--may-exist", "ls-add", &switch.name]),
            command(&[
                "set",
                "logical_switch",
                &switch.name,
                &format!("other_config={}", map_literal(&switch.other_config)),
                &format!("external_ids={}", map_literal(&switch.external_ids)),
            ]),
        ]
        .concat(),
        Entity::LogicalSwitchPort(port) => {
            let mut addresses = vec!["lsp-set-addresses", port.name.as_str()];
            addresses.extend(port.addresses.iter().map(String::as_str));

            let mut security = vec!["lsp-set-port-security", port.name.as_str()];
            security.extend(port.port_security.iter().map(String::as_str));

            [
                command(&["--may-exist", "lsp-add", &port.switch, &port.name]),
                command(&addresses),
                command(&security),
                command(&[
                    "set",
                    "logical_switch_port",
                    &port.name,
                    &format!("type={}", quote(&port.port_type)),
                    &format!("options={}", map_literal(&port.options)),
                    &format!(
                        "tag={}",
                        port.tag.map(|tag| tag.to_string()).unwrap_or_else(|| "[]".to_owned())
                    ),
                    &format!("external_ids={}", map_literal(&port.external_ids)),
                ]),
            ]
            .concat()
        }
        Entity::LogicalRouter(router) => [
            command(&["--may-exist", "lr-add", &router.name]),
            command(&[
                "set",
                "logical_router",
                &router.name,
                &format!("options={}", map_literal(&router.options)),
                &format!("external_ids={}", map_literal(&router.external_ids)),
            ]),
        ]
        .concat(),
        Entity::LogicalRouterPort(port) => {
            let networks = port
                .networks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            let peer = port.peer.as_ref().map(|peer| format!("peer={peer}"));

            let mut add = vec!["lrp-add", port.router.as_str(), port.name.as_str(), port.mac.as_str()];
            add.extend(networks.iter().map(String::as_str));
            add.extend(peer.as_deref());

            [
                command(&["--if-exists", "lrp-del", &port.name]),
                command(&add),
            ]
            .concat()
        }
        Entity::StaticRoute(route) => {
            let policy = format!("--policy={}", route.policy.as_str());
            let prefix = route.prefix.to_string();
            let next_hop = route.next_hop.to_string();

            let mut add = vec![
                policy.as_str(),
                "lr-route-add",
                route.router.as_str(),
                prefix.as_str(),
                next_hop.as_str(),
            ];
            add.extend(route.output_port.as_deref());

            [
                command(&["--if-exists", &policy, "lr-route-del", &route.router, &prefix]),
                command(&add),
            ]
            .concat()
        }
        Entity::Nat(nat) => {
            let logical_ip = nat.logical_ip.to_string();

            [
                command(&["--if-exists", "lr-nat-del", &nat.router, nat.kind.as_str(), &logical_ip]),
                command(&[
                    "lr-nat-add",
                    &nat.router,
                    nat.kind.as_str(),
                    &nat.external_ip.to_string(),
                    &logical_ip,
                ]),
            ]
            .concat()
        }
        Entity::LoadBalancer(lb) => command(&[
            "set",
            "load_balancer",
            &lb.name,
            &format!("protocol={}", lb.protocol),
            &format!("external_ids={}", map_literal(&lb.external_ids)),
        ]),
        Entity::LoadBalancerVip(vip) => command(&[
            "set",
            "load_balancer",
            &vip.load_balancer,
            &format!("vips:{}={}", quote(&vip.vip.to_string()), quote(&vip.backends_string())),
        ]),
        Entity::LoadBalancerBinding(binding) => match &binding.target {
            BindingTarget::Switch(switch) => {
                command(&["--may-exist", "ls-lb-add", switch, &binding.load_balancer])
            }
            BindingTarget::Router(router) => {
                command(&["--may-exist", "lr-lb-add", router, &binding.load_balancer])
            }
        },
    }
}

/// nbctl arguments removing `key`; removing something absent succeeds.
pub fn remove_args(key: &EntityKey) -> Vec<String> {
    match key {
        EntityKey::LogicalSwitch(name) => command(&["--if-exists", "ls-del", name]),
        EntityKey::LogicalSwitchPort(name) => command(&["--if-exists", "lsp-del", name]),
        EntityKey::LogicalRouter(name) => command(&["--if-exists", "lr-del", name]),
        EntityKey::LogicalRouterPort(name) => command(&["--if-exists", "lrp-del", name]),
        EntityKey::StaticRoute {
            router,
            policy,
            prefix,
        } => command(&[
            "--if-exists",
            &format!("--policy={}", policy.as_str()),
            "lr-route-del",
            router,
            &prefix.to_string(),
        ]),
        EntityKey::Nat {
            router,
            kind,
            logical_ip,
        } => command(&[
            "--if-exists",
            "lr-nat-del",
            router,
            kind.as_str(),
            &logical_ip.to_string(),
        ]),
        EntityKey::LoadBalancer(name) => command(&["--if-exists", "lb-del", name]),
        EntityKey::LoadBalancerVip { load_balancer, vip } => command(&[
            "--if-exists",
            "remove",
            "load_balancer",
            load_balancer,
            "vips",
            &quote(&vip.to_string()),
        ]),
        EntityKey::LoadBalancerBinding {
            load_balancer,
            target,
        } => match target {
            BindingTarget::Switch(switch) => {
                command(&["--if-exists", "ls-lb-del", switch, load_balancer])
            }
            BindingTarget::Router(router) => {
                command(&["--if-exists", "lr-lb-del", router, load_balancer])
            }
        },
    }
}

fn invalid(column: &str, value: &str) -> TransportError {
    TransportError::Permanent(format!("Unexpected {column} value '{value}' in the database!"))
}

/// `10.0.0.0/24`, or a bare address meaning a host route.
fn parse_net(column: &str, value: &str) -> Result<Ipv4Net, TransportError> {
    value
        .parse::<Ipv4Net>()
        .or_else(|_| value.parse::<Ipv4Addr>().map(Ipv4Net::from))
        .map_err(|_| invalid(column, value))
}

fn switch_from_row(row: &Row) -> Result<Entity, TransportError> {
    Ok(LogicalSwitch {
        name: row.string("name")?,
        other_config: row.map("other_config")?,
        external_ids: row.map("external_ids")?,
    }
    .into())
}

fn switch_port_from_row(row: &Row, switch: String) -> Result<Entity, TransportError> {
    Ok(LogicalSwitchPort {
        name: row.string("name")?,
        switch,
        port_type: row.string("type")?,
        addresses: row.strings("addresses")?,
        port_security: row.strings("port_security")?,
        options: row.map("options")?,
        tag: row
            .optional_string("tag")?
            .map(|tag| tag.parse().map_err(|_| invalid("tag", &tag)))
            .transpose()?,
        external_ids: row.map("external_ids")?,
    }
    .into())
}

fn router_from_row(row: &Row) -> Result<Entity, TransportError> {
    Ok(LogicalRouter {
        name: row.string("name")?,
        options: row.map("options")?,
        external_ids: row.map("external_ids")?,
    }
    .into())
}

fn router_port_from_row(row: &Row, router: String) -> Result<Entity, TransportError> {
    let networks = row
        .strings("networks")?
        .iter()
        .map(|network| parse_net("networks", network))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LogicalRouterPort {
        name: row.string("name")?,
        router,
        mac: row.string("mac")?,
        networks,
        peer: row.optional_string("peer")?,
    }
    .into())
}

fn route_from_row(row: &Row, router: String) -> Result<Entity, TransportError> {
    let policy = match row.optional_string("policy")?.as_deref() {
        None | Some("dst-ip") => RoutePolicy::DstIp,
        Some("src-ip") => RoutePolicy::SrcIp,
        Some(other) => return Err(invalid("policy", other)),
    };
    let next_hop = row.string("nexthop")?;

    Ok(StaticRoute {
        router,
        policy,
        prefix: parse_net("ip_prefix", &row.string("ip_prefix")?)?,
        next_hop: next_hop.parse().map_err(|_| invalid("nexthop", &next_hop))?,
        output_port: row.optional_string("output_port")?,
    }
    .into())
}

/// Only SNAT rules are ours, anything else is skipped.
fn nat_from_row(row: &Row, router: String) -> Result<Option<Entity>, TransportError> {
    if row.string("type")? != NatKind::Snat.as_str() {
        return Ok(None);
    }

    let external_ip = row.string("external_ip")?;

    Ok(Some(
        Nat {
            router,
            kind: NatKind::Snat,
            external_ip: external_ip
                .parse()
                .map_err(|_| invalid("external_ip", &external_ip))?,
            logical_ip: parse_net("logical_ip", &row.string("logical_ip")?)?,
        }
        .into(),
    ))
}

fn load_balancer_from_row(row: &Row) -> Result<Entity, TransportError> {
    let protocol = match row.optional_string("protocol")?.as_deref() {
        None | Some("tcp") => Protocol::Tcp,
        Some("udp") => Protocol::Udp,
        Some(other) => return Err(invalid("protocol", other)),
    };

    Ok(LoadBalancer {
        name: row.string("name")?,
        protocol,
        external_ids: row.map("external_ids")?,
    }
    .into())
}

/// IPv4 `ip:port` VIPs of the load balancer row. Entries in other formats
/// weren't written by us and are left alone.
fn vips_from_row(row: &Row) -> Result<Vec<LoadBalancerVip>, TransportError> {
    let name = row.string("name")?;
    let mut vips = Vec::new();

    for (vip, backends) in row.map("vips")? {
        let Ok(vip) = vip.parse::<SocketAddrV4>() else {
            debug!("Skipping foreign VIP '{vip}' on '{name}'");
            continue;
        };

        let backends = backends
            .split(',')
            .map(str::trim)
            .filter(|backend| !backend.is_empty())
            .map(|backend| backend.parse::<SocketAddrV4>().map_err(|_| invalid("vips", backend)))
            .collect::<Result<Vec<_>, _>>()?;

        vips.push(LoadBalancerVip::new(name.clone(), vip, backends));
    }

    Ok(vips)
}
