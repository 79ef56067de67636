use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    app::BuildInfo,
    config::{AppName, DnsLabel},
    ecs::{
        declare_cluster, declare_log_group, ContainerCondition, ContainerSpec, FargateService,
        HealthCheck, HealthCheckTiming, LogConfiguration, PortMapping, ProxyConfiguration,
        TaskDefinition, TaskShape, Ulimit, APPMESH_ENVOY_POLICY, ENVOY_ADMIN_PORT,
        ENVOY_CONTAINER, ENVOY_IMAGE, ENVOY_UID, PROXY_EGRESS_PORT, PROXY_INGRESS_PORT,
        XRAY_CONTAINER, XRAY_IMAGE, XRAY_PORT, XRAY_WRITE_POLICY,
    },
    error::{Result, SynthError},
    loadbalancer::{PublicLoadBalancer, TargetHealthCheck},
    mesh::{
        MeshEntry, MeshHandle, NodeHealthCheck, Route, VirtualNode, VirtualRouter,
        VirtualService, VirtualServiceHandle, WeightedTarget,
    },
    namespace::{DiscoveryRecord, NamespaceHandle},
    network::{NetworkContext, SecurityGroup},
    registry::{image_uri, RegistryHandle, RepositorySpec},
    stack::{Environment, Stack},
    template::{fns, RemovalPolicy},
};

pub const APP_CONTAINER: &str = "app";
const DESIRED_COUNT: u32 = 1;
const ENVOY_MEMORY: u32 = 128;
const ENVOY_NOFILE: u32 = 15000;

/// Environment variables every application container gets; configuration may not
/// override them.
const RESERVED_ENV: &[&str] = &["DEPLOY_HASH", "GENERATE_SOURCEMAP"];

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ServiceSpec {
    /// Registered in the discovery namespace and used for the virtual service name.
    pub short_name: DnsLabel,
    /// Ports the application listens on. The first serves traffic, any others are
    /// auxiliary (health, admin) and only opened in the security group.
    pub ports: Vec<u16>,
    /// Port the mesh routes to, defaults to the first port.
    #[serde(default)]
    pub mesh_port: Option<u16>,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// Hard memory limit of the application container alone.
    #[serde(default = "default_container_memory")]
    pub container_memory: u32,
    /// Join the service mesh: proxy sidecar, virtual node, router, route, service.
    #[serde(default = "default_true")]
    pub mesh: bool,
    /// Run an X-Ray daemon sidecar.
    #[serde(default)]
    pub tracing: bool,
    /// Applications this one calls through the mesh.
    #[serde(default)]
    pub upstreams: Vec<AppName>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub generate_sourcemap: bool,
    /// Put a public load balancer in front of the service.
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerSpec>,
    #[serde(default)]
    pub node_health_check: NodeHealthCheck,
    #[serde(default)]
    pub proxy: ProxySpec,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

impl ServiceSpec {
    pub fn mesh_port(&self) -> Option<u16> {
        self.mesh_port.or_else(|| self.ports.first().copied())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct LoadBalancerSpec {
    /// defaults to `<app>-alb`
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_lb_health_check_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub health_check_port: Option<u16>,
    #[serde(default)]
    pub health_check_interval_secs: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct ProxySpec {
    #[serde(default = "default_envoy_image")]
    pub image: String,
    /// Destinations the proxy must not intercept, on top of the metadata addresses.
    #[serde(default)]
    pub egress_ignored_ips: Vec<String>,
    #[serde(default = "HealthCheckTiming::sidecar")]
    pub health_check: HealthCheckTiming,
}

impl Default for ProxySpec {
    fn default() -> Self {
        Self {
            image: default_envoy_image(),
            egress_ignored_ips: Vec::new(),
            health_check: HealthCheckTiming::sidecar(),
        }
    }
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    1024
}

fn default_container_memory() -> u32 {
    768
}

fn default_true() -> bool {
    true
}

fn default_listener_port() -> u16 {
    80
}

fn default_lb_health_check_path() -> String {
    "/".to_string()
}

fn default_envoy_image() -> String {
    ENVOY_IMAGE.to_string()
}

fn default_log_retention_days() -> u32 {
    7
}

/// Read-only handles from stacks synthesized earlier.
#[derive(Debug, Clone)]
pub struct ServiceContext<'a> {
    pub env: &'a Environment,
    pub network: &'a NetworkContext,
    pub registry: &'a RegistryHandle,
    pub namespace: Option<&'a NamespaceHandle>,
    pub mesh: Option<&'a MeshHandle>,
    /// virtual services of `ServiceSpec::upstreams`, same order
    pub upstreams: Vec<VirtualServiceHandle>,
    pub tags: &'a BTreeMap<String, String>,
}

pub struct ServiceStackOutput {
    pub stack: Stack,
    pub virtual_service: Option<VirtualServiceHandle>,
    pub mesh_entries: Vec<MeshEntry>,
}

pub fn stack_name(app: &AppName) -> String {
    format!("{app}-service")
}

pub struct ServiceStack;

impl ServiceStack {
    pub fn synth(
        name: &AppName,
        spec: &ServiceSpec,
        build: &BuildInfo,
        ctx: &ServiceContext,
    ) -> Result<ServiceStackOutput> {
        let mesh_port = Self::validate(name, spec, ctx)?;
        let mut stack = Stack::new(
            stack_name(name),
            ctx.env.clone(),
            &format!("Runtime service for {name}"),
        );
        stack.add_tags(ctx.tags);

        // image repository, shared if the registry has one for us
        let repository = match ctx.registry.repository(name.as_str()) {
            Some(export) => stack.import(export),
            None => {
                let repo = RepositorySpec {
                    name: name.to_string(),
                    max_image_count: 1,
                    removal_policy: RemovalPolicy::Destroy,
                };
                fns::reference(&repo.declare(&mut stack, &format!("Repository-{name}"))?)
            }
        };

        let cluster = declare_cluster(&mut stack, name.as_str())?;
        let log_group = declare_log_group(
            &mut stack,
            name.as_str(),
            spec.log_retention_days,
            RemovalPolicy::Destroy,
        )?;

        let mut task = TaskDefinition::new(
            name.as_str(),
            TaskShape {
                cpu: spec.cpu,
                memory: spec.memory,
            },
        );

        let mut app = ContainerSpec {
            name: APP_CONTAINER.to_string(),
            image: image_uri(repository, &build.image_tag),
            essential: true,
            memory: Some(spec.container_memory),
            port_mappings: spec.ports.iter().map(|p| PortMapping::tcp(*p)).collect(),
            log_configuration: Some(LogConfiguration::awslogs(
                &log_group,
                &ctx.env.region,
                name.as_str(),
            )),
            ..Default::default()
        }
        .env("DEPLOY_HASH", build.deploy_hash.clone())
        .env("GENERATE_SOURCEMAP", spec.generate_sourcemap.to_string());
        for (key, value) in &spec.environment {
            app = app.env(key, value.clone());
        }

        if let (Some(mesh), Some(port)) = (ctx.mesh, mesh_port) {
            let envoy = ContainerSpec {
                name: ENVOY_CONTAINER.to_string(),
                image: spec.proxy.image.clone().into(),
                essential: false,
                memory: Some(ENVOY_MEMORY),
                user: Some(ENVOY_UID.to_string()),
                port_mappings: vec![PortMapping::tcp(ENVOY_ADMIN_PORT)],
                log_configuration: Some(LogConfiguration::awslogs(
                    &log_group,
                    &ctx.env.region,
                    &format!("{name}-envoy"),
                )),
                health_check: Some(HealthCheck::envoy_live(&spec.proxy.health_check, false)?),
                ulimits: vec![Ulimit::nofile(ENVOY_NOFILE)],
                ..Default::default()
            }
            .env("ENVOY_LOG_LEVEL", "info")
            .env(
                "APPMESH_VIRTUAL_NODE_NAME",
                format!("mesh/{}/virtualNode/{name}", mesh.name),
            )
            .env("AWS_REGION", ctx.env.region.clone());

            // no app traffic before the proxy is up
            app.depends_on(ENVOY_CONTAINER, ContainerCondition::Healthy);
            task.set_proxy(ProxyConfiguration::new(
                ENVOY_CONTAINER,
                vec![port],
                &spec.proxy.egress_ignored_ips,
            ));
            task.add_task_role_policy(APPMESH_ENVOY_POLICY);
            task.add_container(envoy)?;
        }

        if spec.tracing {
            let xray = ContainerSpec {
                name: XRAY_CONTAINER.to_string(),
                image: XRAY_IMAGE.into(),
                essential: false,
                cpu: Some(32),
                memory: Some(256),
                memory_reservation: Some(256),
                port_mappings: vec![PortMapping::udp(XRAY_PORT)],
                log_configuration: Some(LogConfiguration::awslogs(
                    &log_group,
                    &ctx.env.region,
                    &format!("{name}-xray"),
                )),
                ..Default::default()
            };
            task.add_task_role_policy(XRAY_WRITE_POLICY);
            task.add_container(xray)?;
        }
        task.add_container(app)?;
        let task = task.declare(&mut stack)?;

        let mut security_group =
            SecurityGroup::new(format!("{name}-sg"), format!("Tasks of {name}"));
        for (i, port) in spec.ports.iter().enumerate() {
            let description = if i == 0 {
                format!("allow access to {name}")
            } else {
                format!("allow health check to {name}")
            };
            security_group = security_group.allow_tcp(*port, description);
        }
        let security_group = security_group.declare(&mut stack, "EcsSg", ctx.network)?;

        let record = DiscoveryRecord::new(spec.short_name.clone());
        let discovery = match ctx.namespace {
            Some(namespace) => Some(record.declare(&mut stack, namespace)?),
            None => None,
        };

        let load_balancer = match &spec.load_balancer {
            Some(lb) => Some(
                PublicLoadBalancer {
                    name: lb.name.clone().unwrap_or_else(|| format!("{name}-alb")),
                    listener_port: lb.listener_port,
                    container_name: APP_CONTAINER.to_string(),
                    container_port: spec.ports[0],
                    health_check: TargetHealthCheck {
                        path: lb.health_check_path.clone(),
                        port: lb.health_check_port,
                        interval_secs: lb.health_check_interval_secs,
                    },
                }
                .declare(&mut stack, ctx.network)?,
            ),
            None => None,
        };

        FargateService {
            name: name.to_string(),
            desired_count: DESIRED_COUNT,
            cluster,
            task_definition: task.id,
            security_groups: vec![security_group],
            discovery: discovery.clone(),
            load_balancer,
        }
        .declare(&mut stack, ctx.network)?;

        let mut mesh_entries = Vec::new();
        let mut virtual_service = None;
        if let (Some(mesh), Some(namespace), Some(discovery), Some(port)) =
            (ctx.mesh, ctx.namespace, &discovery, mesh_port)
        {
            let node = VirtualNode {
                name: name.to_string(),
                port,
                health_check: spec.node_health_check.clone(),
                namespace: namespace.name.clone(),
                service_name: spec.short_name.clone(),
                backends: ctx.upstreams.clone(),
            };
            let node_id = node.declare(&mut stack, mesh, discovery)?;

            let router = VirtualRouter {
                name: format!("{name}-router"),
                port,
            };
            let router_id = router.declare(&mut stack, mesh)?;

            let route = Route {
                name: format!("{name}-route"),
                router_name: router.name.clone(),
                prefix: "/".to_string(),
                targets: vec![WeightedTarget {
                    node_name: node.name.clone(),
                    node: node_id,
                    weight: 100,
                }],
            };
            route.declare(&mut stack, mesh, &router_id)?;

            let service = VirtualService {
                name: record.fqdn(namespace),
                router_name: router.name.clone(),
            };
            virtual_service = Some(service.declare(&mut stack, mesh, &router_id)?);

            mesh_entries = vec![node.entry(), router.entry(), route.entry(), service.entry()];
        }

        info!(
            service = %name,
            mesh = virtual_service.is_some(),
            public = spec.load_balancer.is_some(),
            resources = stack.template().resources.len(),
            "synthesized service stack"
        );
        Ok(ServiceStackOutput {
            stack,
            virtual_service,
            mesh_entries,
        })
    }

    /// Returns the mesh port when the service joins the mesh.
    fn validate(name: &AppName, spec: &ServiceSpec, ctx: &ServiceContext) -> Result<Option<u16>> {
        if spec.ports.is_empty() {
            return Err(SynthError::validation(format!(
                "service {name} declares no ports"
            )));
        }
        if let Some(reserved) = spec
            .environment
            .keys()
            .find(|k| RESERVED_ENV.contains(&k.as_str()))
        {
            return Err(SynthError::validation(format!(
                "service {name} may not set {reserved}, it is managed by the deployment"
            )));
        }
        if ctx.upstreams.len() != spec.upstreams.len() {
            return Err(SynthError::dependency(format!(
                "service {name} expected {} upstream handles, got {}",
                spec.upstreams.len(),
                ctx.upstreams.len()
            )));
        }
        if !spec.mesh {
            if !spec.upstreams.is_empty() {
                return Err(SynthError::validation(format!(
                    "service {name} has upstreams but is not in the mesh, nothing would route them"
                )));
            }
            return Ok(None);
        }
        if ctx.mesh.is_none() {
            return Err(SynthError::validation(format!(
                "service {name} joins the mesh but no [mesh] is configured"
            )));
        }
        if ctx.namespace.is_none() {
            return Err(SynthError::validation(format!(
                "service {name} joins the mesh but no [namespace] is configured for discovery"
            )));
        }
        if let Some(port) = spec
            .ports
            .iter()
            .find(|p| [ENVOY_ADMIN_PORT, PROXY_INGRESS_PORT, PROXY_EGRESS_PORT].contains(*p))
        {
            return Err(SynthError::validation(format!(
                "port {port} of service {name} is taken by the envoy proxy"
            )));
        }
        let port = spec.mesh_port().unwrap_or_default();
        if !spec.ports.contains(&port) {
            return Err(SynthError::validation(format!(
                "mesh port {port} of service {name} is not one of its ports"
            )));
        }
        Ok(Some(port))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        ecs::METADATA_ADDRESSES,
        mesh::{MeshSpec, ServiceMeshContext},
        namespace::{DiscoveryNamespace, NamespaceSpec},
        network::{Lookups, NetworkLookup},
        registry::{ContainerRegistry, RegistrySpec},
        template::Template,
    };

    struct Parts {
        env: Environment,
        network: NetworkContext,
        registry: RegistryHandle,
        namespace: NamespaceHandle,
        mesh: MeshHandle,
        tags: BTreeMap<String, String>,
    }

    fn parts(namespace: &str, mesh: &str) -> Parts {
        let env = Environment::new("123456789012", "ap-northeast-1");
        let lookups: Lookups = [(
            "my-vpc".to_string(),
            NetworkLookup {
                vpc_id: "vpc-1".into(),
                private_subnets: vec!["subnet-1".into(), "subnet-2".into()],
                public_subnets: vec!["subnet-3".into()],
            },
        )]
        .into();
        let network = NetworkContext::resolve("my-vpc", &lookups).unwrap();
        let (_, namespace) = DiscoveryNamespace::synth(
            &NamespaceSpec {
                name: namespace.parse().unwrap(),
            },
            &network,
            env.clone(),
        )
        .unwrap();
        let (_, mesh) = ServiceMeshContext::synth(
            &MeshSpec {
                name: mesh.parse().unwrap(),
                egress_filter: Default::default(),
            },
            env.clone(),
        )
        .unwrap();
        Parts {
            env,
            network,
            registry: RegistryHandle::default(),
            namespace,
            mesh,
            tags: BTreeMap::new(),
        }
    }

    fn ctx(parts: &Parts) -> ServiceContext<'_> {
        ServiceContext {
            env: &parts.env,
            network: &parts.network,
            registry: &parts.registry,
            namespace: Some(&parts.namespace),
            mesh: Some(&parts.mesh),
            upstreams: vec![],
            tags: &parts.tags,
        }
    }

    fn build() -> BuildInfo {
        BuildInfo {
            deploy_hash: "0123abc".into(),
            image_tag: "latest".into(),
        }
    }

    fn spec(short_name: &str, ports: &[u16]) -> ServiceSpec {
        let toml = format!("short_name = {short_name:?}\nports = {ports:?}\n");
        toml::from_str(&toml).unwrap()
    }

    fn only<'a>(template: &'a Template, kind: &'a str) -> &'a Value {
        let found: Vec<_> = template.resources_of_type(kind).collect();
        assert_eq!(found.len(), 1, "expected exactly one {kind}");
        let (_, resource) = found[0];
        &resource.properties
    }

    fn container<'a>(template: &'a Template, name: &str) -> Option<&'a Value> {
        only(template, "AWS::ECS::TaskDefinition")["ContainerDefinitions"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["Name"] == name)
    }

    #[test]
    fn end_to_end_svc_a() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let out = ServiceStack::synth(&name, &spec("a", &[8080]), &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();

        assert_eq!(only(template, "AWS::ECS::Cluster")["ClusterName"], "svc-a");
        assert_eq!(only(template, "AWS::ECS::TaskDefinition")["Family"], "svc-a");
        assert_eq!(only(template, "AWS::ECS::Service")["ServiceName"], "svc-a");
        let record = only(template, "AWS::ServiceDiscovery::Service");
        assert_eq!(record["Name"], "a");
        assert_eq!(
            record["NamespaceId"],
            json!({ "Fn::ImportValue": parts.namespace.id.name })
        );
        assert_eq!(
            only(template, "AWS::AppMesh::VirtualService")["VirtualServiceName"],
            "a.internal.example"
        );
        assert_eq!(out.virtual_service.unwrap().name, "a.internal.example");
        assert_eq!(
            only(template, "AWS::AppMesh::VirtualNode")["Spec"]["ServiceDiscovery"]["AWSCloudMap"],
            json!({ "NamespaceName": "internal.example", "ServiceName": "a" })
        );
    }

    #[test]
    fn mesh_objects_route_everything_to_the_node() {
        let parts = parts("morningcode.internal-jp", "morningcode-mesh");
        let name: AppName = "mtaji-test-app-mesh-be".parse().unwrap();
        let out =
            ServiceStack::synth(&name, &spec("be", &[9080, 39080]), &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();

        let (node_id, node) = template
            .resources_of_type("AWS::AppMesh::VirtualNode")
            .next()
            .unwrap();
        assert_eq!(template.resources_of_type("AWS::AppMesh::VirtualNode").count(), 1);
        assert_eq!(node.properties["Spec"]["Listeners"][0]["PortMapping"]["Port"], 9080);
        assert_eq!(
            node.properties["MeshName"],
            json!({ "Fn::ImportValue": parts.mesh.name_export.name })
        );

        let router = only(template, "AWS::AppMesh::VirtualRouter");
        assert_eq!(router["VirtualRouterName"], "mtaji-test-app-mesh-be-router");

        let route = only(template, "AWS::AppMesh::Route");
        let targets = route["Spec"]["HttpRoute"]["Action"]["WeightedTargets"]
            .as_array()
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0]["Weight"], 100);
        assert_eq!(
            targets[0]["VirtualNode"],
            json!({ "Fn::GetAtt": [node_id, "VirtualNodeName"] })
        );

        assert_eq!(
            only(template, "AWS::AppMesh::VirtualService")["VirtualServiceName"],
            "be.morningcode.internal-jp"
        );
        assert_eq!(out.mesh_entries.len(), 4);
    }

    #[test]
    fn security_group_opens_only_service_ports() {
        let parts = parts("internal.example", "example-mesh");
        for (app, ports) in [("backend", vec![9080u16, 39080]), ("frontend", vec![3000])] {
            let name: AppName = app.parse().unwrap();
            let out = ServiceStack::synth(&name, &spec("x", &ports), &build(), &ctx(&parts)).unwrap();
            let template = out.stack.template();
            let group_name = json!(format!("{app}-sg"));
            let groups: Vec<_> = template
                .find(
                    "AWS::EC2::SecurityGroup",
                    "GroupName",
                    &group_name,
                )
                .collect();
            assert_eq!(groups.len(), 1);
            let opened: Vec<u16> = groups[0].1.properties["SecurityGroupIngress"]
                .as_array()
                .unwrap()
                .iter()
                .map(|rule| {
                    assert_eq!(rule["FromPort"], rule["ToPort"]);
                    rule["FromPort"].as_u64().unwrap() as u16
                })
                .collect();
            assert_eq!(opened, ports);
        }
    }

    #[test]
    fn proxy_sidecar_gates_the_app() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let out = ServiceStack::synth(&name, &spec("a", &[3000]), &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();

        let task = only(template, "AWS::ECS::TaskDefinition");
        let ignored = task["ProxyConfiguration"]["ProxyConfigurationProperties"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["Name"] == "EgressIgnoredIPs")
            .unwrap()["Value"]
            .as_str()
            .unwrap()
            .to_string();
        for address in METADATA_ADDRESSES {
            assert!(ignored.split(',').any(|ip| ip == address), "{ignored}");
        }

        let envoy = container(template, "envoy").unwrap();
        assert_eq!(envoy["User"], "1337");
        assert_eq!(envoy["HealthCheck"]["Retries"], 5);
        assert_eq!(envoy["HealthCheck"]["StartPeriod"], 30);
        assert!(envoy["Environment"]
            .as_array()
            .unwrap()
            .contains(&json!({ "Name": "APPMESH_VIRTUAL_NODE_NAME", "Value": "mesh/example-mesh/virtualNode/svc-a" })));

        let app = container(template, APP_CONTAINER).unwrap();
        assert_eq!(
            app["DependsOn"],
            json!([{ "Condition": "HEALTHY", "ContainerName": "envoy" }])
        );
        assert!(app["Environment"]
            .as_array()
            .unwrap()
            .contains(&json!({ "Name": "DEPLOY_HASH", "Value": "0123abc" })));
        assert!(app["Environment"]
            .as_array()
            .unwrap()
            .contains(&json!({ "Name": "GENERATE_SOURCEMAP", "Value": "false" })));
    }

    #[test]
    fn extra_egress_ignores_keep_the_metadata_addresses() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut spec = spec("a", &[3000]);
        spec.proxy.egress_ignored_ips = vec!["10.0.0.2".into()];
        let out = ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)).unwrap();
        let task = only(out.stack.template(), "AWS::ECS::TaskDefinition");
        let props = task["ProxyConfiguration"]["ProxyConfigurationProperties"]
            .as_array()
            .unwrap();
        let ignored = props
            .iter()
            .find(|p| p["Name"] == "EgressIgnoredIPs")
            .unwrap();
        assert_eq!(ignored["Value"], "169.254.170.2,169.254.169.254,10.0.0.2");
    }

    #[test]
    fn tracing_adds_the_daemon() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut spec = spec("a", &[9080]);
        spec.tracing = true;
        spec.memory = 2048;
        let out = ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();

        let xray = container(template, "xray-daemon").unwrap();
        assert_eq!(
            xray["PortMappings"],
            json!([{ "ContainerPort": 2000, "Protocol": "udp" }])
        );
        let roles: Vec<_> = template.resources_of_type("AWS::IAM::Role").collect();
        let policies: Vec<String> = roles
            .iter()
            .flat_map(|(_, r)| r.properties["ManagedPolicyArns"].as_array().cloned().unwrap_or_default())
            .map(|arn| arn.to_string())
            .collect();
        assert!(policies.iter().any(|p| p.contains("AWSXRayDaemonWriteAccess")));
        assert!(policies.iter().any(|p| p.contains("AWSAppMeshEnvoyAccess")));
    }

    #[test]
    fn sidecars_must_fit_in_the_task() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut spec = spec("a", &[9080]);
        spec.tracing = true;
        assert!(matches!(
            ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)),
            Err(SynthError::Validation(_))
        ));
    }

    #[test]
    fn upstreams_become_node_backends() {
        let parts = parts("internal.example", "example-mesh");
        let be: AppName = "backend".parse().unwrap();
        let backend =
            ServiceStack::synth(&be, &spec("be", &[9080]), &build(), &ctx(&parts)).unwrap();
        let upstream = backend.virtual_service.unwrap();

        let fe: AppName = "frontend".parse().unwrap();
        let mut fe_spec = spec("fe", &[3000]);
        fe_spec.upstreams = vec![be];
        let mut fe_ctx = ctx(&parts);
        fe_ctx.upstreams = vec![upstream.clone()];
        let out = ServiceStack::synth(&fe, &fe_spec, &build(), &fe_ctx).unwrap();

        let node = only(out.stack.template(), "AWS::AppMesh::VirtualNode");
        assert_eq!(
            node["Spec"]["Backends"],
            json!([{ "VirtualService": { "VirtualServiceName": { "Fn::ImportValue": upstream.export.name } } }])
        );
        assert!(out.stack.dependencies().any(|d| d == "backend-service"));
        assert_eq!(
            out.mesh_entries[0],
            MeshEntry::Node {
                name: "frontend".into(),
                backends: vec!["be.internal.example".into()],
            }
        );
    }

    #[test]
    fn public_services_get_a_load_balancer_and_a_registration() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "mtaji-test-app-mesh-fe".parse().unwrap();
        let mut spec = spec("fe", &[3000]);
        spec.load_balancer = Some(LoadBalancerSpec {
            name: None,
            listener_port: 80,
            health_check_path: "/api/healthz".into(),
            health_check_port: None,
            health_check_interval_secs: None,
        });
        let out = ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();

        assert_eq!(
            only(template, "AWS::ElasticLoadBalancingV2::LoadBalancer")["Name"],
            "mtaji-test-app-mesh-fe-alb"
        );
        assert_eq!(
            only(template, "AWS::ElasticLoadBalancingV2::TargetGroup")["HealthCheckPath"],
            "/api/healthz"
        );
        let (_, service) = template.resources_of_type("AWS::ECS::Service").next().unwrap();
        assert_eq!(service.properties["LoadBalancers"][0]["ContainerPort"], 3000);
        assert_eq!(service.properties["ServiceRegistries"].as_array().unwrap().len(), 1);
        assert_eq!(service.depends_on.len(), 1);
    }

    #[test]
    fn services_outside_the_mesh_have_no_proxy() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut spec = spec("a", &[9080]);
        spec.mesh = false;
        let out = ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)).unwrap();
        let template = out.stack.template();
        assert!(container(template, "envoy").is_none());
        assert!(only(template, "AWS::ECS::TaskDefinition")
            .get("ProxyConfiguration")
            .is_none());
        assert_eq!(template.resources_of_type("AWS::AppMesh::VirtualNode").count(), 0);
        assert!(out.virtual_service.is_none());
        // still discoverable
        assert_eq!(
            template
                .resources_of_type("AWS::ServiceDiscovery::Service")
                .count(),
            1
        );

        spec.upstreams = vec!["other".parse().unwrap()];
        let mut with_upstream = ctx(&parts);
        with_upstream.upstreams = vec![out_of_band_handle()];
        assert!(ServiceStack::synth(&name, &spec, &build(), &with_upstream).is_err());
    }

    fn out_of_band_handle() -> VirtualServiceHandle {
        let mut stack = Stack::new("other-service", Environment::new("1", "r"), "test");
        let id = stack
            .add_resource("VirtualService", "AWS::AppMesh::VirtualService", json!({}))
            .unwrap();
        VirtualServiceHandle {
            name: "o.internal.example".into(),
            export: stack.export(&id, Some("VirtualServiceName")),
        }
    }

    #[test]
    fn mesh_without_namespace_is_a_configuration_error() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut no_namespace = ctx(&parts);
        no_namespace.namespace = None;
        assert!(ServiceStack::synth(&name, &spec("a", &[9080]), &build(), &no_namespace).is_err());
    }

    #[test]
    fn registry_repositories_are_reused() {
        let mut parts = parts("internal.example", "example-mesh");
        let (_, registry) = ContainerRegistry::synth(
            &RegistrySpec {
                repositories: vec!["svc-a".parse().unwrap()],
                max_image_count: 1,
                removal_policy: RemovalPolicy::Retain,
            },
            parts.env.clone(),
        )
        .unwrap();
        let name: AppName = "svc-a".parse().unwrap();

        let own = ServiceStack::synth(&name, &spec("a", &[9080]), &build(), &ctx(&parts)).unwrap();
        assert_eq!(
            own.stack.template().resources_of_type("AWS::ECR::Repository").count(),
            1
        );

        parts.registry = registry;
        let shared = ServiceStack::synth(&name, &spec("a", &[9080]), &build(), &ctx(&parts)).unwrap();
        assert_eq!(
            shared
                .stack
                .template()
                .resources_of_type("AWS::ECR::Repository")
                .count(),
            0
        );
        assert!(shared
            .stack
            .dependencies()
            .any(|d| d == crate::registry::STACK_NAME));
        let app = container(shared.stack.template(), APP_CONTAINER).unwrap();
        assert!(app["Image"].to_string().contains("Fn::ImportValue"));
    }

    #[test]
    fn reserved_environment_cannot_be_overridden() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let mut spec = spec("a", &[9080]);
        spec.environment
            .insert("DEPLOY_HASH".into(), "nope".into());
        assert!(ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)).is_err());
    }

    #[test]
    fn oversized_container_memory_is_an_error() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        let spec: ServiceSpec =
            toml::from_str("short_name = \"a\"\nports = [9080]\ncontainer_memory = 4294967295\n")
                .unwrap();
        assert!(matches!(
            ServiceStack::synth(&name, &spec, &build(), &ctx(&parts)),
            Err(SynthError::Validation(_))
        ));
    }

    #[test]
    fn envoy_ports_are_off_limits_in_the_mesh() {
        let parts = parts("internal.example", "example-mesh");
        let name: AppName = "svc-a".parse().unwrap();
        for port in [9901, 15000, 15001] {
            let err = ServiceStack::synth(&name, &spec("a", &[port]), &build(), &ctx(&parts))
                .err()
                .unwrap();
            assert!(matches!(err, SynthError::Validation(msg) if msg.contains("envoy")));
        }

        let mut outside = spec("a", &[9901]);
        outside.mesh = false;
        assert!(ServiceStack::synth(&name, &outside, &build(), &ctx(&parts)).is_ok());
    }
}
