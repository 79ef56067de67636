use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::AppName,
    ecs::{
        declare_cluster, declare_log_group, ContainerSpec, FargateService, HealthCheck,
        HealthCheckTiming, LogConfiguration, PortMapping, TaskDefinition, TaskShape, Ulimit,
        APPMESH_ENVOY_POLICY, CLOUDWATCH_AGENT_POLICY, ENVOY_ADMIN_PORT, ENVOY_IMAGE, ENVOY_UID,
    },
    error::{Result, SynthError},
    loadbalancer::{PublicLoadBalancer, TargetHealthCheck},
    mesh::{
        GatewayRoute, HealthProtocol, MeshEntry, MeshHandle, NodeHealthCheck, VirtualGateway,
        VirtualServiceHandle,
    },
    network::{NetworkContext, SecurityGroup},
    stack::{Environment, Stack},
    template::RemovalPolicy,
};

const GATEWAY_NOFILE: u32 = 1024000;
const GATEWAY_CPU: u32 = 208;
const GATEWAY_MEMORY: u32 = 320;
const GATEWAY_LOG_RETENTION_DAYS: u32 = 7;

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct GatewaySpec {
    /// cluster, task family, service and container name
    pub name: AppName,
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    #[serde(default = "default_load_balancer_name")]
    pub load_balancer_name: String,
    /// path the gateway listener health check requests
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub routes: Vec<GatewayRouteSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct GatewayRouteSpec {
    pub service: AppName,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_listener_port() -> u16 {
    8080
}

fn default_load_balancer_name() -> String {
    "envoy-ingress-gateway-alb".to_string()
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

pub fn stack_name(gateway: &AppName) -> String {
    format!("{gateway}-gateway")
}

pub struct GatewayContext<'a> {
    pub env: &'a Environment,
    pub network: &'a NetworkContext,
    pub mesh: &'a MeshHandle,
    /// virtual service of every application a route targets
    pub targets: BTreeMap<AppName, VirtualServiceHandle>,
    pub tags: &'a BTreeMap<String, String>,
}

pub struct GatewayStackOutput {
    pub stack: Stack,
    pub mesh_entries: Vec<MeshEntry>,
}

pub struct IngressGatewayStack;

impl IngressGatewayStack {
    pub fn synth(spec: &GatewaySpec, ctx: &GatewayContext) -> Result<GatewayStackOutput> {
        let name = &spec.name;
        if spec.listener_port == ENVOY_ADMIN_PORT {
            return Err(SynthError::validation(format!(
                "gateway {name} cannot listen on the envoy admin port {ENVOY_ADMIN_PORT}"
            )));
        }
        let mut stack = Stack::new(
            stack_name(name),
            ctx.env.clone(),
            &format!("Ingress gateway {name}"),
        );
        stack.add_tags(ctx.tags);

        let virtual_gateway = VirtualGateway {
            name: name.to_string(),
            port: spec.listener_port,
            health_check: NodeHealthCheck {
                protocol: HealthProtocol::Http,
                path: Some(spec.health_check_path.clone()),
                ..Default::default()
            },
        };
        let gateway_id = virtual_gateway.declare(&mut stack, ctx.mesh)?;
        let mut mesh_entries = vec![virtual_gateway.entry()];

        for route in &spec.routes {
            if !route.prefix.starts_with('/') {
                return Err(SynthError::routing(format!(
                    "gateway {name} route prefix {:?} must start with '/'",
                    route.prefix
                )));
            }
            let target = ctx.targets.get(&route.service).ok_or_else(|| {
                SynthError::routing(format!(
                    "gateway {name} routes to {}, which is not a mesh service",
                    route.service
                ))
            })?;
            let gateway_route = GatewayRoute {
                name: format!("{name}-{}", route.service),
                gateway_name: virtual_gateway.name.clone(),
                prefix: route.prefix.clone(),
                target: target.clone(),
            };
            gateway_route.declare(&mut stack, ctx.mesh, &gateway_id)?;
            mesh_entries.push(gateway_route.entry());
        }

        let cluster = declare_cluster(&mut stack, name.as_str())?;
        let log_group = declare_log_group(
            &mut stack,
            name.as_str(),
            GATEWAY_LOG_RETENTION_DAYS,
            RemovalPolicy::Destroy,
        )?;

        let mut task = TaskDefinition::new(
            name.as_str(),
            TaskShape {
                cpu: 256,
                memory: 512,
            },
        );
        let envoy = ContainerSpec {
            name: name.to_string(),
            image: ENVOY_IMAGE.into(),
            essential: true,
            cpu: Some(GATEWAY_CPU),
            memory: Some(GATEWAY_MEMORY),
            user: Some(ENVOY_UID.to_string()),
            port_mappings: vec![
                PortMapping::tcp(spec.listener_port),
                PortMapping::tcp(ENVOY_ADMIN_PORT),
            ],
            log_configuration: Some(LogConfiguration::awslogs(
                &log_group,
                &ctx.env.region,
                name.as_str(),
            )),
            health_check: Some(HealthCheck::envoy_live(&HealthCheckTiming::gateway(), true)?),
            ulimits: vec![Ulimit::nofile(GATEWAY_NOFILE)],
            ..Default::default()
        }
        .env("ENVOY_LOG_LEVEL", "info")
        .env(
            "APPMESH_VIRTUAL_NODE_NAME",
            format!("mesh/{}/virtualGateway/{name}", ctx.mesh.name),
        )
        .env("AWS_REGION", ctx.env.region.clone());
        task.add_container(envoy)?;
        task.add_task_role_policy(APPMESH_ENVOY_POLICY);
        task.add_task_role_policy(CLOUDWATCH_AGENT_POLICY);
        let task = task.declare(&mut stack)?;

        let security_group = SecurityGroup::new(format!("{name}-sg"), format!("Gateway {name}"))
            .allow_tcp(spec.listener_port, format!("allow access to {name}"))
            .allow_tcp(ENVOY_ADMIN_PORT, format!("allow health check to {name}"))
            .declare(&mut stack, "EcsSg", ctx.network)?;

        let load_balancer = PublicLoadBalancer {
            name: spec.load_balancer_name.clone(),
            listener_port: 80,
            container_name: name.to_string(),
            container_port: spec.listener_port,
            health_check: TargetHealthCheck {
                path: "/server_info".to_string(),
                port: Some(ENVOY_ADMIN_PORT),
                interval_secs: Some(10),
            },
        }
        .declare(&mut stack, ctx.network)?;

        FargateService {
            name: name.to_string(),
            desired_count: 1,
            cluster,
            task_definition: task.id,
            security_groups: vec![security_group],
            discovery: None,
            load_balancer: Some(load_balancer),
        }
        .declare(&mut stack, ctx.network)?;

        info!(gateway = %name, routes = spec.routes.len(), "synthesized gateway stack");
        Ok(GatewayStackOutput {
            stack,
            mesh_entries,
        })
    }
}
