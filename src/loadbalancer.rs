use serde_json::json;

use crate::{
    ecs::LoadBalancerTarget,
    error::{Result, SynthError},
    network::{group_id, NetworkContext, SecurityGroup},
    stack::Stack,
    template::fns,
};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetHealthCheck {
    pub path: String,
    /// defaults to the traffic port
    pub port: Option<u16>,
    pub interval_secs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct PublicLoadBalancer {
    pub name: String,
    pub listener_port: u16,
    pub container_name: String,
    pub container_port: u16,
    pub health_check: TargetHealthCheck,
}

impl PublicLoadBalancer {
    pub fn declare(&self, stack: &mut Stack, network: &NetworkContext) -> Result<LoadBalancerTarget> {
        // elbv2 limits
        if self.name.is_empty() || self.name.len() > 32 {
            return Err(SynthError::validation(format!(
                "load balancer name {:?} must be 1 to 32 characters",
                self.name
            )));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(SynthError::validation(format!(
                "load balancer health check path {:?} must start with '/'",
                self.health_check.path
            )));
        }
        if let Some(interval) = self.health_check.interval_secs {
            if !(5..=300).contains(&interval) {
                return Err(SynthError::validation(format!(
                    "load balancer health check interval must be 5..=300 seconds, got {interval}"
                )));
            }
        }

        let security_group = SecurityGroup::new(
            format!("{}-sg", self.name),
            format!("Load balancer {}", self.name),
        )
        .allow_tcp(self.listener_port, "allow http from anywhere")
        .declare(stack, "LoadBalancerSg", network)?;

        let load_balancer = stack.add_resource(
            "LoadBalancer",
            "AWS::ElasticLoadBalancingV2::LoadBalancer",
            json!({
                "LoadBalancerAttributes": [
                    { "Key": "deletion_protection.enabled", "Value": "false" }
                ],
                "Name": self.name,
                "Scheme": "internet-facing",
                "SecurityGroups": [group_id(&security_group)],
                "Subnets": network.public_subnets()?,
                "Type": "application",
            }),
        )?;

        let mut target_group_props = json!({
            "HealthCheckPath": self.health_check.path,
            "HealthCheckProtocol": "HTTP",
            "Port": self.container_port,
            "Protocol": "HTTP",
            "TargetType": "ip",
            "VpcId": network.vpc_id,
        });
        if let Some(port) = self.health_check.port {
            target_group_props["HealthCheckPort"] = port.to_string().into();
        }
        if let Some(interval) = self.health_check.interval_secs {
            target_group_props["HealthCheckIntervalSeconds"] = interval.into();
        }
        let target_group = stack.add_resource(
            "TargetGroup",
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            target_group_props,
        )?;

        let listener = stack.add_resource(
            "Listener",
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "DefaultActions": [{
                    "TargetGroupArn": fns::reference(&target_group),
                    "Type": "forward",
                }],
                "LoadBalancerArn": fns::reference(&load_balancer),
                "Port": self.listener_port,
                "Protocol": "HTTP",
            }),
        )?;

        let dns = stack.export(&load_balancer, Some("DNSName"));
        tracing::debug!(export = %dns.name, "load balancer dns name exported");

        Ok(LoadBalancerTarget {
            target_group,
            listener,
            container_name: self.container_name.clone(),
            container_port: self.container_port,
        })
    }
}
