use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{Result, SynthError},
    network::{group_id, NetworkContext},
    stack::Stack,
    template::{fns, LogicalId, RemovalPolicy},
};

pub const ENVOY_IMAGE: &str = "public.ecr.aws/appmesh/aws-appmesh-envoy:v1.24.0.0-prod";
pub const ENVOY_CONTAINER: &str = "envoy";
pub const ENVOY_ADMIN_PORT: u16 = 9901;
pub const ENVOY_UID: u32 = 1337;
pub const PROXY_INGRESS_PORT: u16 = 15000;
pub const PROXY_EGRESS_PORT: u16 = 15001;
pub const XRAY_IMAGE: &str = "amazon/aws-xray-daemon:3.x";
pub const XRAY_CONTAINER: &str = "xray-daemon";
pub const XRAY_PORT: u16 = 2000;

/// Task metadata/credentials endpoint and instance metadata service. Traffic to these
/// must never be captured by the proxy.
pub const METADATA_ADDRESSES: [&str; 2] = ["169.254.170.2", "169.254.169.254"];

pub const APPMESH_ENVOY_POLICY: &str = "AWSAppMeshEnvoyAccess";
pub const XRAY_WRITE_POLICY: &str = "AWSXRayDaemonWriteAccess";
pub const CLOUDWATCH_AGENT_POLICY: &str = "CloudWatchAgentServerPolicy";
const EXECUTION_POLICY: &str = "service-role/AmazonECSTaskExecutionRolePolicy";

#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    pub protocol: Protocol,
}

impl PortMapping {
    /// awsvpc mode requires host and container port to match
    pub fn tcp(port: u16) -> Self {
        Self {
            container_port: port,
            host_port: Some(port),
            protocol: Protocol::Tcp,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            container_port: port,
            host_port: None,
            protocol: Protocol::Udp,
        }
    }
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct KeyValuePair {
    pub name: String,
    pub value: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfiguration {
    pub log_driver: &'static str,
    pub options: serde_json::Map<String, Value>,
}

impl LogConfiguration {
    pub fn awslogs(log_group: &LogicalId, region: &str, stream_prefix: &str) -> Self {
        let mut options = serde_json::Map::new();
        options.insert("awslogs-group".into(), fns::reference(log_group));
        options.insert("awslogs-region".into(), region.into());
        options.insert("awslogs-stream-prefix".into(), stream_prefix.into());
        Self {
            log_driver: "awslogs",
            options,
        }
    }
}

/// Container health check timings. The command itself is fixed by whoever builds
/// the container.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct HealthCheckTiming {
    pub start_period_secs: u32,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
}

impl HealthCheckTiming {
    pub fn sidecar() -> Self {
        Self {
            start_period_secs: 30,
            interval_secs: 5,
            timeout_secs: 2,
            retries: 5,
        }
    }

    pub fn gateway() -> Self {
        Self {
            start_period_secs: 10,
            interval_secs: 5,
            timeout_secs: 2,
            retries: 3,
        }
    }
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheck {
    pub command: Vec<String>,
    pub interval: u32,
    pub timeout: u32,
    pub retries: u32,
    pub start_period: u32,
}

impl HealthCheck {
    /// Polls the proxy admin endpoint until it reports `LIVE`.
    pub fn envoy_live(timing: &HealthCheckTiming, exit_on_failure: bool) -> Result<Self> {
        let mut probe = format!(
            "curl -s http://localhost:{ENVOY_ADMIN_PORT}/server_info | grep state | grep -q LIVE"
        );
        if exit_on_failure {
            probe.push_str(" || exit 1");
        }
        Self::shell(probe, timing)
    }

    pub fn shell(command: String, timing: &HealthCheckTiming) -> Result<Self> {
        // limits imposed by ecs
        if !(5..=300).contains(&timing.interval_secs) {
            return Err(SynthError::validation(format!(
                "container health check interval must be 5..=300 seconds, got {}",
                timing.interval_secs
            )));
        }
        if !(2..=60).contains(&timing.timeout_secs) {
            return Err(SynthError::validation(format!(
                "container health check timeout must be 2..=60 seconds, got {}",
                timing.timeout_secs
            )));
        }
        if !(1..=10).contains(&timing.retries) {
            return Err(SynthError::validation(format!(
                "container health check retries must be 1..=10, got {}",
                timing.retries
            )));
        }
        if timing.start_period_secs > 300 {
            return Err(SynthError::validation(format!(
                "container health check start period must be <= 300 seconds, got {}",
                timing.start_period_secs
            )));
        }
        Ok(Self {
            command: vec!["CMD-SHELL".into(), command],
            interval: timing.interval_secs,
            timeout: timing.timeout_secs,
            retries: timing.retries,
            start_period: timing.start_period_secs,
        })
    }
}

#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerCondition {
    Healthy,
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDependency {
    pub container_name: String,
    pub condition: ContainerCondition,
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Ulimit {
    pub name: &'static str,
    pub soft_limit: u32,
    pub hard_limit: u32,
}

impl Ulimit {
    pub fn nofile(limit: u32) -> Self {
        Self {
            name: "nofile",
            soft_limit: limit,
            hard_limit: limit,
        }
    }
}

/// One container definition in a task. Serializes straight into
/// `ContainerDefinitions`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: Value,
    pub essential: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<KeyValuePair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_configuration: Option<LogConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ContainerDependency>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ulimits: Vec<Ulimit>,
}

impl ContainerSpec {
    pub fn env(mut self, name: &str, value: impl Into<String>) -> Self {
        self.environment.push(KeyValuePair {
            name: name.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn depends_on(&mut self, container: &str, condition: ContainerCondition) {
        self.depends_on.push(ContainerDependency {
            container_name: container.to_string(),
            condition,
        });
    }
}

/// Sends the task's traffic through the mesh proxy.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProxyConfiguration {
    pub container_name: String,
    pub app_ports: Vec<u16>,
    egress_ignored_ips: Vec<String>,
}

impl ProxyConfiguration {
    /// The metadata addresses are always ignored, `extra_ignored_ips` come on top.
    pub fn new(container_name: &str, app_ports: Vec<u16>, extra_ignored_ips: &[String]) -> Self {
        let mut egress_ignored_ips: Vec<String> =
            METADATA_ADDRESSES.iter().map(|ip| ip.to_string()).collect();
        for ip in extra_ignored_ips {
            if !egress_ignored_ips.contains(ip) {
                egress_ignored_ips.push(ip.clone());
            }
        }
        Self {
            container_name: container_name.to_string(),
            app_ports,
            egress_ignored_ips,
        }
    }

    pub fn egress_ignored_ips(&self) -> &[String] {
        &self.egress_ignored_ips
    }

    fn properties(&self) -> Value {
        let join = |items: Vec<String>| items.join(",");
        let props = [
            ("AppPorts", join(self.app_ports.iter().map(u16::to_string).collect())),
            ("EgressIgnoredIPs", join(self.egress_ignored_ips.clone())),
            ("IgnoredUID", ENVOY_UID.to_string()),
            ("ProxyEgressPort", PROXY_EGRESS_PORT.to_string()),
            ("ProxyIngressPort", PROXY_INGRESS_PORT.to_string()),
        ];
        json!({
            "ContainerName": self.container_name,
            "ProxyConfigurationProperties": props
                .iter()
                .map(|(name, value)| json!({ "Name": name, "Value": value }))
                .collect::<Vec<_>>(),
            "Type": "APPMESH",
        })
    }
}

/// Fargate cpu units and memory in MiB for a whole task.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TaskShape {
    pub cpu: u32,
    pub memory: u32,
}

impl TaskShape {
    /// Fargate only runs a fixed set of cpu/memory combinations.
    fn validate(&self) -> Result<()> {
        let memory_ok = match self.cpu {
            256 => [512, 1024, 2048].contains(&self.memory),
            512 => (1024..=4096).contains(&self.memory) && self.memory % 1024 == 0,
            1024 => (2048..=8192).contains(&self.memory) && self.memory % 1024 == 0,
            2048 => (4096..=16384).contains(&self.memory) && self.memory % 1024 == 0,
            4096 => (8192..=30720).contains(&self.memory) && self.memory % 1024 == 0,
            _ => {
                return Err(SynthError::validation(format!(
                    "{} is not a fargate cpu size",
                    self.cpu
                )))
            }
        };
        if !memory_ok {
            return Err(SynthError::validation(format!(
                "{} MiB is not a valid memory size for {} cpu units",
                self.memory, self.cpu
            )));
        }
        Ok(())
    }
}

/// A task definition under construction. Exactly one container is essential: the
/// application. Sidecars are added around it.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    family: String,
    shape: TaskShape,
    containers: Vec<ContainerSpec>,
    proxy: Option<ProxyConfiguration>,
    task_role_policies: Vec<&'static str>,
}

#[derive(Debug, Clone)]
pub struct TaskDefinitionHandle {
    pub id: LogicalId,
    pub task_role: LogicalId,
    pub execution_role: LogicalId,
}

impl TaskDefinition {
    pub fn new(family: impl Into<String>, shape: TaskShape) -> Self {
        Self {
            family: family.into(),
            shape,
            containers: Vec::new(),
            proxy: None,
            task_role_policies: Vec::new(),
        }
    }

    pub fn add_container(&mut self, container: ContainerSpec) -> Result<()> {
        if self.container(&container.name).is_some() {
            return Err(SynthError::validation(format!(
                "task {} already has a container named {}",
                self.family, container.name
            )));
        }
        self.containers.push(container);
        Ok(())
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn set_proxy(&mut self, proxy: ProxyConfiguration) {
        self.proxy = Some(proxy);
    }

    pub fn add_task_role_policy(&mut self, policy: &'static str) {
        if !self.task_role_policies.contains(&policy) {
            self.task_role_policies.push(policy);
        }
    }

    fn validate(&self) -> Result<()> {
        self.shape.validate()?;
        let essential = self.containers.iter().filter(|c| c.essential).count();
        if essential != 1 {
            return Err(SynthError::validation(format!(
                "task {} has {essential} essential containers, expected exactly 1",
                self.family
            )));
        }
        let mut total_memory: u32 = 0;
        for container in &self.containers {
            for dep in &container.depends_on {
                if self.container(&dep.container_name).is_none() {
                    return Err(SynthError::validation(format!(
                        "container {} depends on unknown container {}",
                        container.name, dep.container_name
                    )));
                }
            }
            if container.port_mappings.iter().any(|p| p.container_port == 0) {
                return Err(SynthError::validation(format!(
                    "container {} maps port 0",
                    container.name
                )));
            }
            total_memory = total_memory
                .checked_add(container.memory.unwrap_or(0))
                .ok_or_else(|| {
                    SynthError::validation(format!(
                        "container memory of task {} does not fit in a u32",
                        self.family
                    ))
                })?;
        }
        if total_memory > self.shape.memory {
            return Err(SynthError::validation(format!(
                "containers of task {} ask for {total_memory} MiB but the task has {}",
                self.family, self.shape.memory
            )));
        }
        if let Some(proxy) = &self.proxy {
            if self.container(&proxy.container_name).is_none() {
                return Err(SynthError::validation(format!(
                    "proxy configuration names missing container {}",
                    proxy.container_name
                )));
            }
        }
        Ok(())
    }

    /// Declares the task and execution roles and the task definition itself.
    pub fn declare(&self, stack: &mut Stack) -> Result<TaskDefinitionHandle> {
        self.validate()?;

        let task_policies: Vec<Value> = self
            .task_role_policies
            .iter()
            .map(|p| fns::managed_policy_arn(p))
            .collect();
        let mut task_role_props = assume_role_by_tasks();
        if !task_policies.is_empty() {
            task_role_props["ManagedPolicyArns"] = Value::Array(task_policies);
        }
        let task_role = stack.add_resource("TaskRole", "AWS::IAM::Role", task_role_props)?;

        let mut execution_role_props = assume_role_by_tasks();
        execution_role_props["ManagedPolicyArns"] =
            json!([fns::managed_policy_arn(EXECUTION_POLICY)]);
        let execution_role =
            stack.add_resource("ExecutionRole", "AWS::IAM::Role", execution_role_props)?;

        let mut props = json!({
            "ContainerDefinitions": self.containers,
            "Cpu": self.shape.cpu.to_string(),
            "ExecutionRoleArn": fns::get_att(&execution_role, "Arn"),
            "Family": self.family,
            "Memory": self.shape.memory.to_string(),
            "NetworkMode": "awsvpc",
            "RequiresCompatibilities": ["FARGATE"],
            "TaskRoleArn": fns::get_att(&task_role, "Arn"),
        });
        if let Some(proxy) = &self.proxy {
            props["ProxyConfiguration"] = proxy.properties();
        }
        let id = stack.add_resource(
            &format!("TaskDefinition-{}", self.family),
            "AWS::ECS::TaskDefinition",
            props,
        )?;
        Ok(TaskDefinitionHandle {
            id,
            task_role,
            execution_role,
        })
    }
}

fn assume_role_by_tasks() -> Value {
    json!({
        "AssumeRolePolicyDocument": {
            "Statement": [{
                "Action": "sts:AssumeRole",
                "Effect": "Allow",
                "Principal": { "Service": "ecs-tasks.amazonaws.com" },
            }],
            "Version": "2012-10-17",
        }
    })
}

pub fn declare_cluster(stack: &mut Stack, name: &str) -> Result<LogicalId> {
    stack.add_resource(
        &format!("EcsCluster-{name}"),
        "AWS::ECS::Cluster",
        json!({
            "ClusterName": name,
            "ClusterSettings": [{ "Name": "containerInsights", "Value": "enabled" }],
        }),
    )
}

pub fn declare_log_group(
    stack: &mut Stack,
    name: &str,
    retention_days: u32,
    removal_policy: RemovalPolicy,
) -> Result<LogicalId> {
    // the values cloudwatch accepts for RetentionInDays
    const RETENTION_DAYS: &[u32] = &[
        1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557,
        2922, 3288, 3653,
    ];
    if !RETENTION_DAYS.contains(&retention_days) {
        return Err(SynthError::validation(format!(
            "log retention of {retention_days} days is not supported"
        )));
    }
    let id = stack.add_resource(
        "LogGroup",
        "AWS::Logs::LogGroup",
        json!({
            "LogGroupName": name,
            "RetentionInDays": retention_days,
        }),
    )?;
    stack.set_removal_policy(&id, removal_policy);
    Ok(id)
}

/// How a load balancer forwards to the runtime service.
#[derive(Debug, Clone)]
pub struct LoadBalancerTarget {
    pub target_group: LogicalId,
    pub listener: LogicalId,
    pub container_name: String,
    pub container_port: u16,
}

/// The long running service keeping `desired_count` copies of a task alive.
#[derive(Debug, Clone)]
pub struct FargateService {
    pub name: String,
    pub desired_count: u32,
    pub cluster: LogicalId,
    pub task_definition: LogicalId,
    pub security_groups: Vec<LogicalId>,
    /// cloud map service to register tasks in
    pub discovery: Option<LogicalId>,
    pub load_balancer: Option<LoadBalancerTarget>,
}

impl FargateService {
    pub fn declare(&self, stack: &mut Stack, network: &NetworkContext) -> Result<LogicalId> {
        let mut props = json!({
            "Cluster": fns::reference(&self.cluster),
            "DeploymentConfiguration": {
                "MaximumPercent": 200,
                "MinimumHealthyPercent": 50,
            },
            "DesiredCount": self.desired_count,
            "EnableECSManagedTags": false,
            "LaunchType": "FARGATE",
            "NetworkConfiguration": {
                "AwsvpcConfiguration": {
                    "AssignPublicIp": "DISABLED",
                    "SecurityGroups": self.security_groups.iter().map(group_id).collect::<Vec<_>>(),
                    "Subnets": network.private_subnets,
                }
            },
            "ServiceName": self.name,
            "TaskDefinition": fns::reference(&self.task_definition),
        });
        if let Some(discovery) = &self.discovery {
            props["ServiceRegistries"] = json!([{ "RegistryArn": fns::get_att(discovery, "Arn") }]);
        }
        if let Some(lb) = &self.load_balancer {
            props["HealthCheckGracePeriodSeconds"] = 60.into();
            props["LoadBalancers"] = json!([{
                "ContainerName": lb.container_name,
                "ContainerPort": lb.container_port,
                "TargetGroupArn": fns::reference(&lb.target_group),
            }]);
        }
        let id = stack.add_resource("EcsService", "AWS::ECS::Service", props)?;
        if let Some(lb) = &self.load_balancer {
            // the target group must be attached to a listener before the service uses it
            stack.add_depends_on(&id, &lb.listener);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::Environment;

    fn app(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "app:latest".into(),
            essential: true,
            memory: Some(768),
            port_mappings: vec![PortMapping::tcp(9080)],
            ..Default::default()
        }
    }

    #[test]
    fn proxy_always_ignores_metadata_addresses() {
        let proxy = ProxyConfiguration::new("envoy", vec![9080], &[]);
        assert_eq!(proxy.egress_ignored_ips(), METADATA_ADDRESSES);

        let proxy = ProxyConfiguration::new(
            "envoy",
            vec![9080],
            &["10.0.0.2".to_string(), "169.254.169.254".to_string()],
        );
        assert_eq!(
            proxy.egress_ignored_ips(),
            ["169.254.170.2", "169.254.169.254", "10.0.0.2"]
        );
    }

    #[test]
    fn proxy_properties_are_name_value_pairs() {
        let props = ProxyConfiguration::new("envoy", vec![3000], &[]).properties();
        assert_eq!(props["Type"], "APPMESH");
        let find = |name: &str| {
            props["ProxyConfigurationProperties"]
                .as_array()
                .unwrap()
                .iter()
                .find(|p| p["Name"] == name)
                .map(|p| p["Value"].clone())
                .unwrap()
        };
        assert_eq!(find("AppPorts"), "3000");
        assert_eq!(find("ProxyIngressPort"), "15000");
        assert_eq!(find("ProxyEgressPort"), "15001");
        assert_eq!(find("IgnoredUID"), "1337");
        assert_eq!(find("EgressIgnoredIPs"), "169.254.170.2,169.254.169.254");
    }

    #[test]
    fn envoy_health_check_probes_for_live() {
        let check = HealthCheck::envoy_live(&HealthCheckTiming::sidecar(), false).unwrap();
        assert_eq!(check.command[0], "CMD-SHELL");
        assert_eq!(
            check.command[1],
            "curl -s http://localhost:9901/server_info | grep state | grep -q LIVE"
        );
        assert_eq!((check.start_period, check.interval, check.timeout, check.retries), (30, 5, 2, 5));

        let check = HealthCheck::envoy_live(&HealthCheckTiming::gateway(), true).unwrap();
        assert!(check.command[1].ends_with("|| exit 1"));
    }

    #[test]
    fn health_check_timing_limits() {
        let mut timing = HealthCheckTiming::sidecar();
        timing.retries = 0;
        assert!(HealthCheck::shell("true".into(), &timing).is_err());
    }

    #[test]
    fn task_definition_serializes_containers() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        let mut task = TaskDefinition::new("svc-a", TaskShape { cpu: 256, memory: 1024 });
        task.add_container(app("Container").env("DEPLOY_HASH", "abc")).unwrap();
        task.add_task_role_policy(XRAY_WRITE_POLICY);
        task.add_task_role_policy(XRAY_WRITE_POLICY);
        let handle = task.declare(&mut stack).unwrap();

        let props = &stack.resource(&handle.id).unwrap().properties;
        assert_eq!(props["Family"], "svc-a");
        assert_eq!(props["Cpu"], "256");
        assert_eq!(props["Memory"], "1024");
        let container = &props["ContainerDefinitions"][0];
        assert_eq!(container["Name"], "Container");
        assert_eq!(container["Essential"], true);
        assert_eq!(container["PortMappings"][0]["ContainerPort"], 9080);
        assert_eq!(container["PortMappings"][0]["Protocol"], "tcp");
        assert_eq!(container["Environment"][0]["Name"], "DEPLOY_HASH");
        assert!(container.get("HealthCheck").is_none());
        assert!(props.get("ProxyConfiguration").is_none());

        let role = &stack.resource(&handle.task_role).unwrap().properties;
        assert_eq!(role["ManagedPolicyArns"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn exactly_one_essential_container() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        let mut task = TaskDefinition::new("svc-a", TaskShape { cpu: 256, memory: 1024 });
        task.add_container(app("a")).unwrap();
        let mut second = app("b");
        second.memory = Some(128);
        task.add_container(second).unwrap();
        assert!(task.declare(&mut stack).is_err());
    }

    #[test]
    fn dependencies_must_name_real_containers() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        let mut task = TaskDefinition::new("svc-a", TaskShape { cpu: 256, memory: 1024 });
        let mut container = app("a");
        container.depends_on("envoy", ContainerCondition::Healthy);
        task.add_container(container).unwrap();
        assert!(task.declare(&mut stack).is_err());
    }

    #[test]
    fn memory_must_fit_the_task() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        let mut task = TaskDefinition::new("svc-a", TaskShape { cpu: 256, memory: 512 });
        task.add_container(app("a")).unwrap();
        assert!(task.declare(&mut stack).is_err());
    }

    #[test]
    fn memory_sum_overflow_is_an_error() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        let mut task = TaskDefinition::new("svc-a", TaskShape { cpu: 256, memory: 1024 });
        let mut big = app("a");
        big.memory = Some(u32::MAX);
        task.add_container(big).unwrap();
        let mut sidecar = app("b");
        sidecar.essential = false;
        sidecar.memory = Some(128);
        task.add_container(sidecar).unwrap();
        assert!(matches!(
            task.declare(&mut stack),
            Err(SynthError::Validation(msg)) if msg.contains("u32")
        ));
    }

    #[test]
    fn fargate_shapes() {
        assert!(TaskShape { cpu: 256, memory: 1024 }.validate().is_ok());
        assert!(TaskShape { cpu: 256, memory: 4096 }.validate().is_err());
        assert!(TaskShape { cpu: 300, memory: 1024 }.validate().is_err());
        assert!(TaskShape { cpu: 1024, memory: 3072 }.validate().is_ok());
    }

    #[test]
    fn log_group_retention_must_be_supported() {
        let mut stack = Stack::new("s", Environment::new("1", "r"), "test");
        assert!(declare_log_group(&mut stack, "svc-a", 6, RemovalPolicy::Destroy).is_err());
        let id = declare_log_group(&mut stack, "svc-a", 7, RemovalPolicy::Destroy).unwrap();
        assert_eq!(stack.resource(&id).unwrap().properties["RetentionInDays"], 7);
    }
}
