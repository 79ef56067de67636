use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use petgraph::{algo::toposort, prelude::DiGraph, stable_graph::NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{AppName, DeploySpec},
    error::{Result, SynthError},
    gateway::{GatewayContext, IngressGatewayStack},
    mesh::{MeshEntry, MeshGraph, ServiceMeshContext, VirtualServiceHandle},
    namespace::DiscoveryNamespace,
    network::NetworkContext,
    registry::{ContainerRegistry, RegistryHandle},
    service::{ServiceContext, ServiceSpec, ServiceStack},
    stack::{Environment, Stack, StackArtifact},
};

/// What was built and how to tag the images.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BuildInfo {
    /// handed to application containers as `DEPLOY_HASH`
    pub deploy_hash: String,
    pub image_tag: String,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl Format {
    fn extension(self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yaml => "yaml",
        }
    }
}

/// All stacks of one deployment, not yet checked as a whole.
pub struct App {
    stacks: Vec<Stack>,
    mesh_entries: Vec<MeshEntry>,
}

impl App {
    pub fn from_spec(spec: &DeploySpec, env: Environment, build: &BuildInfo) -> Result<Self> {
        let network = NetworkContext::resolve(&spec.network, &spec.networks)?;
        let mut stacks = Vec::new();

        let registry = match &spec.registry {
            Some(registry) => {
                let (stack, handle) = ContainerRegistry::synth(registry, env.clone())?;
                stacks.push(stack);
                handle
            }
            None => RegistryHandle::default(),
        };
        let namespace = match &spec.namespace {
            Some(namespace) => {
                let (stack, handle) = DiscoveryNamespace::synth(namespace, &network, env.clone())?;
                stacks.push(stack);
                Some(handle)
            }
            None => None,
        };
        let mesh = match &spec.mesh {
            Some(mesh) => {
                let (stack, handle) = ServiceMeshContext::synth(mesh, env.clone())?;
                stacks.push(stack);
                Some(handle)
            }
            None => None,
        };
        for stack in stacks.iter_mut() {
            stack.add_tags(&spec.tags);
        }

        let mut mesh_entries = Vec::new();
        let mut virtual_services: BTreeMap<AppName, VirtualServiceHandle> = BTreeMap::new();
        for name in service_order(&spec.services)? {
            let service = &spec.services[&name];
            let upstreams = service
                .upstreams
                .iter()
                .map(|upstream| {
                    virtual_services.get(upstream).cloned().ok_or_else(|| {
                        SynthError::dependency(format!(
                            "upstream {upstream} of {name} has no virtual service"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let ctx = ServiceContext {
                env: &env,
                network: &network,
                registry: &registry,
                namespace: namespace.as_ref(),
                mesh: mesh.as_ref(),
                upstreams,
                tags: &spec.tags,
            };
            let out = ServiceStack::synth(&name, service, build, &ctx)?;
            if let Some(virtual_service) = out.virtual_service {
                virtual_services.insert(name.clone(), virtual_service);
            }
            mesh_entries.extend(out.mesh_entries);
            stacks.push(out.stack);
        }

        if let Some(gateway) = &spec.gateway {
            let mesh = mesh.as_ref().ok_or_else(|| {
                SynthError::validation(format!(
                    "gateway {} needs a [mesh] to route into",
                    gateway.name
                ))
            })?;
            if spec.services.contains_key(&gateway.name) {
                return Err(SynthError::validation(format!(
                    "gateway {} has the same name as a service",
                    gateway.name
                )));
            }
            let targets = gateway
                .routes
                .iter()
                .filter_map(|route| {
                    virtual_services
                        .get(&route.service)
                        .map(|handle| (route.service.clone(), handle.clone()))
                })
                .collect();
            let ctx = GatewayContext {
                env: &env,
                network: &network,
                mesh,
                targets,
                tags: &spec.tags,
            };
            let out = IngressGatewayStack::synth(gateway, &ctx)?;
            mesh_entries.extend(out.mesh_entries);
            stacks.push(out.stack);
        }

        info!(
            network = %network.name,
            stacks = stacks.len(),
            services = spec.services.len(),
            "composed app"
        );
        Ok(Self {
            stacks,
            mesh_entries,
        })
    }

    /// In the order they were synthesized.
    pub fn stack_names(&self) -> impl Iterator<Item = &str> {
        self.stacks.iter().map(Stack::name)
    }

    /// Check the mesh as a whole and order the stacks for deployment.
    pub fn synth(self) -> Result<CloudAssembly> {
        let mesh = MeshGraph::build(&self.mesh_entries)?;
        mesh.validate()?;
        debug!(objects = mesh.len(), "mesh routing validated");

        let artifacts: Vec<StackArtifact> =
            self.stacks.into_iter().map(Stack::into_artifact).collect();

        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut idxes: HashMap<String, NodeIndex> = HashMap::new();
        for artifact in &artifacts {
            let idx = graph.add_node(artifact.name.clone());
            if idxes.insert(artifact.name.clone(), idx).is_some() {
                return Err(SynthError::dependency(format!(
                    "stack {} is declared twice",
                    artifact.name
                )));
            }
        }
        for artifact in &artifacts {
            for dependency in &artifact.dependencies {
                let from = idxes.get(dependency).ok_or_else(|| {
                    SynthError::dependency(format!(
                        "stack {} depends on {dependency}, which is not part of the app",
                        artifact.name
                    ))
                })?;
                graph.add_edge(*from, idxes[&artifact.name], ());
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            SynthError::dependency(format!(
                "stack dependency cycle through {}",
                graph[cycle.node_id()]
            ))
        })?;

        let mut by_name: HashMap<String, StackArtifact> = artifacts
            .into_iter()
            .map(|artifact| (artifact.name.clone(), artifact))
            .collect();
        let stacks = order
            .into_iter()
            .filter_map(|idx| by_name.remove(&graph[idx]))
            .collect();
        Ok(CloudAssembly { stacks })
    }
}

/// Services ordered so that every upstream comes before the services calling it.
fn service_order(services: &BTreeMap<AppName, ServiceSpec>) -> Result<Vec<AppName>> {
    let mut graph: DiGraph<&AppName, ()> = DiGraph::new();
    let idxes: HashMap<&AppName, NodeIndex> = services
        .keys()
        .map(|name| (name, graph.add_node(name)))
        .collect();

    for (name, service) in services {
        for upstream in &service.upstreams {
            let from = idxes.get(upstream).ok_or_else(|| {
                SynthError::dependency(format!("service {name} calls unknown service {upstream}"))
            })?;
            if !services[upstream].mesh {
                return Err(SynthError::dependency(format!(
                    "service {name} calls {upstream}, which is not in the mesh"
                )));
            }
            graph.add_edge(*from, idxes[name], ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        SynthError::dependency(format!(
            "service dependency cycle through {}",
            graph[cycle.node_id()]
        ))
    })?;
    Ok(order.into_iter().map(|idx| graph[idx].clone()).collect())
}

/// Finished templates in deploy order.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudAssembly {
    pub stacks: Vec<StackArtifact>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub stacks: Vec<ManifestStack>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ManifestStack {
    pub name: String,
    pub template_file: String,
    /// `aws://<account>/<region>`
    pub environment: String,
    pub dependencies: Vec<String>,
}

impl CloudAssembly {
    pub const MANIFEST_FILE: &'static str = "manifest.json";
    const MANIFEST_VERSION: &'static str = "1";

    pub fn stack(&self, name: &str) -> Option<&StackArtifact> {
        self.stacks.iter().find(|stack| stack.name == name)
    }

    pub fn template_file(stack: &StackArtifact, format: Format) -> String {
        format!("{}.template.{}", stack.name, format.extension())
    }

    pub fn manifest(&self, format: Format) -> Manifest {
        Manifest {
            version: Self::MANIFEST_VERSION.to_string(),
            stacks: self
                .stacks
                .iter()
                .map(|stack| ManifestStack {
                    name: stack.name.clone(),
                    template_file: Self::template_file(stack, format),
                    environment: format!("aws://{}/{}", stack.env.account, stack.env.region),
                    dependencies: stack.dependencies.clone(),
                })
                .collect(),
        }
    }

    /// Write one template per stack plus the manifest into `dir`, creating it if
    /// needed. Returns the paths written.
    pub fn write(&self, dir: &Path, format: Format) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for stack in &self.stacks {
            let path = dir.join(Self::template_file(stack, format));
            let file = BufWriter::new(File::create(&path)?);
            match format {
                Format::Json => serde_json::to_writer_pretty(file, &stack.template)?,
                Format::Yaml => serde_yaml::to_writer(file, &stack.template)?,
            }
            debug!(path = %path.display(), "wrote template");
            written.push(path);
        }
        let path = dir.join(Self::MANIFEST_FILE);
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &self.manifest(format))?;
        written.push(path);
        info!(dir = %dir.display(), stacks = self.stacks.len(), "wrote cloud assembly");
        Ok(written)
    }
}
