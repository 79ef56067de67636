use std::collections::HashMap;

use petgraph::{prelude::DiGraph, stable_graph::NodeIndex, Direction::Outgoing};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    config::{DnsLabel, DnsName},
    error::{Result, SynthError},
    stack::{Environment, Export, Stack},
    template::{fns, LogicalId},
};

pub const STACK_NAME: &str = "service-mesh";

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct MeshSpec {
    pub name: DnsLabel,
    #[serde(default)]
    pub egress_filter: EgressFilter,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EgressFilter {
    #[default]
    DropAll,
    AllowAll,
}

#[derive(Debug, Clone)]
pub struct MeshHandle {
    pub name: String,
    pub name_export: Export,
    pub arn: Export,
}

pub struct ServiceMeshContext;

impl ServiceMeshContext {
    pub fn synth(spec: &MeshSpec, env: Environment) -> Result<(Stack, MeshHandle)> {
        let mut stack = Stack::new(STACK_NAME, env, "App Mesh service mesh");
        let mesh = stack.add_resource(
            "Mesh",
            "AWS::AppMesh::Mesh",
            json!({
                "MeshName": spec.name,
                "Spec": { "EgressFilter": { "Type": spec.egress_filter } },
            }),
        )?;
        let name_export = stack.export(&mesh, Some("MeshName"));
        let arn = stack.export(&mesh, Some("Arn"));
        info!(mesh = %spec.name, "declared service mesh");
        Ok((
            stack,
            MeshHandle {
                name: spec.name.to_string(),
                name_export,
                arn,
            },
        ))
    }
}

/// A virtual service some other stack declared, usable as a node backend or a
/// gateway route target.
#[derive(Debug, Clone)]
pub struct VirtualServiceHandle {
    pub name: String,
    pub export: Export,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthProtocol {
    #[default]
    Tcp,
    Http,
}

/// Active health check the proxies run against a virtual node's listener.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct NodeHealthCheck {
    #[serde(default)]
    pub protocol: HealthProtocol,
    /// http only, a missing leading '/' is added
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u32,
}

impl Default for NodeHealthCheck {
    fn default() -> Self {
        Self {
            protocol: HealthProtocol::default(),
            path: None,
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
            interval_secs: default_interval_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_threshold() -> u32 {
    2
}

fn default_interval_secs() -> u32 {
    5
}

fn default_timeout_secs() -> u32 {
    2
}

impl NodeHealthCheck {
    fn properties(&self, port: u16) -> Result<Value> {
        for (what, value) in [
            ("healthy_threshold", self.healthy_threshold),
            ("unhealthy_threshold", self.unhealthy_threshold),
        ] {
            if !(2..=10).contains(&value) {
                return Err(SynthError::validation(format!(
                    "{what} must be between 2 and 10, got {value}"
                )));
            }
        }
        if !(5..=300).contains(&self.interval_secs) {
            return Err(SynthError::validation(format!(
                "health check interval must be between 5 and 300 seconds, got {}",
                self.interval_secs
            )));
        }
        if !(2..=60).contains(&self.timeout_secs) {
            return Err(SynthError::validation(format!(
                "health check timeout must be between 2 and 60 seconds, got {}",
                self.timeout_secs
            )));
        }

        let mut check = json!({
            "HealthyThreshold": self.healthy_threshold,
            "IntervalMillis": self.interval_secs * 1000,
            "Port": port,
            "Protocol": self.protocol,
            "TimeoutMillis": self.timeout_secs * 1000,
            "UnhealthyThreshold": self.unhealthy_threshold,
        });
        match (self.protocol, &self.path) {
            (HealthProtocol::Http, path) => {
                let path = path.as_deref().unwrap_or("/");
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{path}")
                };
                check["Path"] = path.into();
            }
            (HealthProtocol::Tcp, Some(path)) => {
                return Err(SynthError::validation(format!(
                    "tcp health checks take no path, got {path:?}"
                )));
            }
            (HealthProtocol::Tcp, None) => {}
        }
        Ok(check)
    }
}

/// A deployable backend as the mesh sees it, found through Cloud Map.
#[derive(Debug, Clone)]
pub struct VirtualNode {
    pub name: String,
    pub port: u16,
    pub health_check: NodeHealthCheck,
    pub namespace: DnsName,
    pub service_name: DnsLabel,
    pub backends: Vec<VirtualServiceHandle>,
}

impl VirtualNode {
    /// `discovery` is the Cloud Map service in the same stack; the node is only
    /// created once that exists.
    pub fn declare(
        &self,
        stack: &mut Stack,
        mesh: &MeshHandle,
        discovery: &LogicalId,
    ) -> Result<LogicalId> {
        let mesh_name = stack.import(&mesh.name_export);
        let backends: Vec<Value> = self
            .backends
            .iter()
            .map(|backend| {
                json!({
                    "VirtualService": { "VirtualServiceName": stack.import(&backend.export) }
                })
            })
            .collect();
        let mut spec = json!({
            "Listeners": [{
                "HealthCheck": self.health_check.properties(self.port)?,
                "PortMapping": { "Port": self.port, "Protocol": "http" },
            }],
            "Logging": { "AccessLog": { "File": { "Path": "/dev/stdout" } } },
            "ServiceDiscovery": {
                "AWSCloudMap": {
                    "NamespaceName": self.namespace,
                    "ServiceName": self.service_name,
                }
            },
        });
        if !backends.is_empty() {
            spec["Backends"] = Value::Array(backends);
        }
        let id = stack.add_resource(
            "VirtualNode",
            "AWS::AppMesh::VirtualNode",
            json!({
                "MeshName": mesh_name,
                "Spec": spec,
                "VirtualNodeName": self.name,
            }),
        )?;
        stack.add_depends_on(&id, discovery);
        Ok(id)
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::Node {
            name: self.name.clone(),
            backends: self.backends.iter().map(|b| b.name.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualRouter {
    pub name: String,
    pub port: u16,
}

impl VirtualRouter {
    pub fn declare(&self, stack: &mut Stack, mesh: &MeshHandle) -> Result<LogicalId> {
        let mesh_name = stack.import(&mesh.name_export);
        stack.add_resource(
            "VirtualRouter",
            "AWS::AppMesh::VirtualRouter",
            json!({
                "MeshName": mesh_name,
                "Spec": {
                    "Listeners": [{ "PortMapping": { "Port": self.port, "Protocol": "http" } }]
                },
                "VirtualRouterName": self.name,
            }),
        )
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::Router {
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeightedTarget {
    pub node_name: String,
    pub node: LogicalId,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub router_name: String,
    pub prefix: String,
    pub targets: Vec<WeightedTarget>,
}

impl Route {
    pub fn declare(
        &self,
        stack: &mut Stack,
        mesh: &MeshHandle,
        router: &LogicalId,
    ) -> Result<LogicalId> {
        let mesh_name = stack.import(&mesh.name_export);
        let targets: Vec<Value> = self
            .targets
            .iter()
            .map(|t| {
                json!({
                    "VirtualNode": fns::get_att(&t.node, "VirtualNodeName"),
                    "Weight": t.weight,
                })
            })
            .collect();
        stack.add_resource(
            "Route",
            "AWS::AppMesh::Route",
            json!({
                "MeshName": mesh_name,
                "RouteName": self.name,
                "Spec": {
                    "HttpRoute": {
                        "Action": { "WeightedTargets": targets },
                        "Match": { "Prefix": self.prefix },
                    }
                },
                "VirtualRouterName": fns::get_att(router, "VirtualRouterName"),
            }),
        )
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::Route {
            router: self.router_name.clone(),
            name: self.name.clone(),
            targets: self
                .targets
                .iter()
                .map(|t| (t.node_name.clone(), t.weight))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualService {
    pub name: String,
    pub router_name: String,
}

impl VirtualService {
    /// Declares the service and exports its name so other stacks can route to it.
    pub fn declare(
        &self,
        stack: &mut Stack,
        mesh: &MeshHandle,
        router: &LogicalId,
    ) -> Result<VirtualServiceHandle> {
        let mesh_name = stack.import(&mesh.name_export);
        let id = stack.add_resource(
            "VirtualService",
            "AWS::AppMesh::VirtualService",
            json!({
                "MeshName": mesh_name,
                "Spec": {
                    "Provider": {
                        "VirtualRouter": {
                            "VirtualRouterName": fns::get_att(router, "VirtualRouterName")
                        }
                    }
                },
                "VirtualServiceName": self.name,
            }),
        )?;
        Ok(VirtualServiceHandle {
            name: self.name.clone(),
            export: stack.export(&id, Some("VirtualServiceName")),
        })
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::Service {
            name: self.name.clone(),
            router: self.router_name.clone(),
        }
    }
}

/// The mesh's door for traffic from outside.
#[derive(Debug, Clone)]
pub struct VirtualGateway {
    pub name: String,
    pub port: u16,
    pub health_check: NodeHealthCheck,
}

impl VirtualGateway {
    pub fn declare(&self, stack: &mut Stack, mesh: &MeshHandle) -> Result<LogicalId> {
        let mesh_name = stack.import(&mesh.name_export);
        stack.add_resource(
            "VirtualGateway",
            "AWS::AppMesh::VirtualGateway",
            json!({
                "MeshName": mesh_name,
                "Spec": {
                    "Listeners": [{
                        "HealthCheck": self.health_check.properties(self.port)?,
                        "PortMapping": { "Port": self.port, "Protocol": "http" },
                    }],
                    "Logging": { "AccessLog": { "File": { "Path": "/dev/stdout" } } },
                },
                "VirtualGatewayName": self.name,
            }),
        )
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::Gateway {
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayRoute {
    pub name: String,
    pub gateway_name: String,
    pub prefix: String,
    pub target: VirtualServiceHandle,
}

impl GatewayRoute {
    pub fn declare(
        &self,
        stack: &mut Stack,
        mesh: &MeshHandle,
        gateway: &LogicalId,
    ) -> Result<LogicalId> {
        let mesh_name = stack.import(&mesh.name_export);
        let target = stack.import(&self.target.export);
        stack.add_resource(
            &format!("GatewayRoute-{}", self.name),
            "AWS::AppMesh::GatewayRoute",
            json!({
                "GatewayRouteName": self.name,
                "MeshName": mesh_name,
                "Spec": {
                    "HttpRoute": {
                        "Action": {
                            "Target": { "VirtualService": { "VirtualServiceName": target } }
                        },
                        "Match": { "Prefix": self.prefix },
                    }
                },
                "VirtualGatewayName": fns::get_att(gateway, "VirtualGatewayName"),
            }),
        )
    }

    pub fn entry(&self) -> MeshEntry {
        MeshEntry::GatewayRoute {
            gateway: self.gateway_name.clone(),
            name: self.name.clone(),
            service: self.target.name.clone(),
        }
    }
}

/// Name level summary of one mesh declaration, whichever stack it lives in.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MeshEntry {
    Node {
        name: String,
        backends: Vec<String>,
    },
    Router {
        name: String,
    },
    Route {
        router: String,
        name: String,
        targets: Vec<(String, u32)>,
    },
    Service {
        name: String,
        router: String,
    },
    Gateway {
        name: String,
    },
    GatewayRoute {
        gateway: String,
        name: String,
        service: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MeshObject {
    Node(String),
    Router(String),
    Route { router: String, name: String },
    Service(String),
    Gateway(String),
    GatewayRoute { gateway: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeshEdge {
    /// parent to child, router to route or gateway to gateway route
    Owns,
    /// route to node, with weight
    Target(u32),
    /// virtual service to the router providing it
    Provider,
    /// node to a virtual service it calls, or gateway route to its target
    Calls,
}

/// Every mesh object in the app and how they refer to each other.
pub struct MeshGraph {
    graph: DiGraph<MeshObject, MeshEdge>,
    idxes: HashMap<MeshObject, NodeIndex>,
}

impl MeshGraph {
    /// Fails on duplicate names and on references to objects that were never declared.
    pub fn build(entries: &[MeshEntry]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut idxes = HashMap::new();

        for entry in entries {
            let object = match entry {
                MeshEntry::Node { name, .. } => MeshObject::Node(name.clone()),
                MeshEntry::Router { name } => MeshObject::Router(name.clone()),
                MeshEntry::Route { router, name, .. } => MeshObject::Route {
                    router: router.clone(),
                    name: name.clone(),
                },
                MeshEntry::Service { name, .. } => MeshObject::Service(name.clone()),
                MeshEntry::Gateway { name } => MeshObject::Gateway(name.clone()),
                MeshEntry::GatewayRoute { gateway, name, .. } => MeshObject::GatewayRoute {
                    gateway: gateway.clone(),
                    name: name.clone(),
                },
            };
            if idxes.contains_key(&object) {
                return Err(SynthError::routing(format!("{object:?} is declared twice")));
            }
            let idx = graph.add_node(object.clone());
            idxes.insert(object, idx);
        }

        let mut mesh = Self { graph, idxes };
        for entry in entries {
            match entry {
                MeshEntry::Node { name, backends } => {
                    let node = mesh.idx(MeshObject::Node(name.clone()), "")?;
                    for backend in backends {
                        let service = mesh.idx(
                            MeshObject::Service(backend.clone()),
                            &format!("backend of virtual node {name}"),
                        )?;
                        mesh.graph.add_edge(node, service, MeshEdge::Calls);
                    }
                }
                MeshEntry::Route {
                    router,
                    name,
                    targets,
                } => {
                    let route = mesh.idx(
                        MeshObject::Route {
                            router: router.clone(),
                            name: name.clone(),
                        },
                        "",
                    )?;
                    let parent = mesh.idx(
                        MeshObject::Router(router.clone()),
                        &format!("owner of route {name}"),
                    )?;
                    mesh.graph.add_edge(parent, route, MeshEdge::Owns);
                    for (node, weight) in targets {
                        let target = mesh.idx(
                            MeshObject::Node(node.clone()),
                            &format!("target of route {name}"),
                        )?;
                        mesh.graph.add_edge(route, target, MeshEdge::Target(*weight));
                    }
                }
                MeshEntry::Service { name, router } => {
                    let service = mesh.idx(MeshObject::Service(name.clone()), "")?;
                    let provider = mesh.idx(
                        MeshObject::Router(router.clone()),
                        &format!("provider of virtual service {name}"),
                    )?;
                    mesh.graph.add_edge(service, provider, MeshEdge::Provider);
                }
                MeshEntry::GatewayRoute {
                    gateway,
                    name,
                    service,
                } => {
                    let route = mesh.idx(
                        MeshObject::GatewayRoute {
                            gateway: gateway.clone(),
                            name: name.clone(),
                        },
                        "",
                    )?;
                    let parent = mesh.idx(
                        MeshObject::Gateway(gateway.clone()),
                        &format!("owner of gateway route {name}"),
                    )?;
                    let target = mesh.idx(
                        MeshObject::Service(service.clone()),
                        &format!("target of gateway route {name}"),
                    )?;
                    mesh.graph.add_edge(parent, route, MeshEdge::Owns);
                    mesh.graph.add_edge(route, target, MeshEdge::Calls);
                }
                MeshEntry::Router { .. } | MeshEntry::Gateway { .. } => {}
            }
        }
        Ok(mesh)
    }

    fn idx(&self, object: MeshObject, role: &str) -> Result<NodeIndex> {
        self.idxes.get(&object).copied().ok_or_else(|| {
            SynthError::routing(format!("{role} refers to undeclared {object:?}"))
        })
    }

    /// Check what can only be seen with every object in place.
    pub fn validate(&self) -> Result<()> {
        for idx in self.graph.node_indices() {
            let object = &self.graph[idx];
            match object {
                MeshObject::Route { name, .. } => {
                    let weights: Vec<u32> = self
                        .graph
                        .edges_directed(idx, Outgoing)
                        .filter_map(|e| match e.weight() {
                            MeshEdge::Target(w) => Some(*w),
                            _ => None,
                        })
                        .collect();
                    if weights.is_empty() {
                        return Err(SynthError::routing(format!("route {name} has no targets")));
                    }
                    let total: u32 = weights.iter().sum();
                    if total != 100 {
                        return Err(SynthError::routing(format!(
                            "weights of route {name} add up to {total}, expected 100"
                        )));
                    }
                }
                MeshObject::Router(name) => {
                    let routes = self
                        .graph
                        .edges_directed(idx, Outgoing)
                        .filter(|e| *e.weight() == MeshEdge::Owns)
                        .count();
                    if routes == 0 {
                        return Err(SynthError::routing(format!(
                            "virtual router {name} has no routes"
                        )));
                    }
                }
                MeshObject::Service(name) => {
                    let providers = self
                        .graph
                        .edges_directed(idx, Outgoing)
                        .filter(|e| *e.weight() == MeshEdge::Provider)
                        .count();
                    if providers != 1 {
                        return Err(SynthError::routing(format!(
                            "virtual service {name} has {providers} providers, expected 1"
                        )));
                    }
                }
                MeshObject::Node(_) | MeshObject::Gateway(_) | MeshObject::GatewayRoute { .. } => {
                }
            }
            debug!(?object, "mesh object ok");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}
