use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    error::{Result, SynthError},
    stack::Stack,
    template::{fns, LogicalId},
};

/// Context values for one existing VPC.
#[derive(Serialize, Deserialize, Debug, Eq, PartialEq, Clone)]
pub struct NetworkLookup {
    pub vpc_id: String,
    #[serde(default)]
    pub private_subnets: Vec<String>,
    #[serde(default)]
    pub public_subnets: Vec<String>,
}

/// Known networks, keyed by name.
pub type Lookups = BTreeMap<String, NetworkLookup>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NetworkContext {
    pub name: String,
    pub vpc_id: String,
    pub private_subnets: Vec<String>,
    pub public_subnets: Vec<String>,
}

impl NetworkContext {
    pub fn resolve(name: &str, lookups: &Lookups) -> Result<Self> {
        let found = lookups
            .get(name)
            .ok_or_else(|| SynthError::UnresolvedNetwork(name.to_string()))?;
        if !found.vpc_id.starts_with("vpc-") {
            return Err(SynthError::validation(format!(
                "network {name}: {:?} is not a vpc id",
                found.vpc_id
            )));
        }
        if found.private_subnets.is_empty() {
            return Err(SynthError::validation(format!(
                "network {name} has no private subnets to run tasks in"
            )));
        }
        if let Some(bad) = found
            .private_subnets
            .iter()
            .chain(&found.public_subnets)
            .find(|s| !s.starts_with("subnet-"))
        {
            return Err(SynthError::validation(format!(
                "network {name}: {bad:?} is not a subnet id"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            vpc_id: found.vpc_id.clone(),
            private_subnets: found.private_subnets.clone(),
            public_subnets: found.public_subnets.clone(),
        })
    }

    /// Subnets for internet facing load balancers.
    pub fn public_subnets(&self) -> Result<&[String]> {
        if self.public_subnets.is_empty() {
            return Err(SynthError::validation(format!(
                "network {} has no public subnets for a public load balancer",
                self.name
            )));
        }
        Ok(&self.public_subnets)
    }
}

/// A security group that admits tcp from anywhere on an explicit list of ports and
/// lets everything out.
#[derive(Debug, Clone)]
pub struct SecurityGroup {
    name: String,
    description: String,
    ingress: Vec<(u16, String)>,
}

impl SecurityGroup {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ingress: Vec::new(),
        }
    }

    pub fn allow_tcp(mut self, port: u16, description: impl Into<String>) -> Self {
        self.ingress.push((port, description.into()));
        self
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ingress.iter().map(|(port, _)| *port)
    }

    pub fn declare(
        &self,
        stack: &mut Stack,
        path: &str,
        network: &NetworkContext,
    ) -> Result<LogicalId> {
        let mut seen = Vec::new();
        for port in self.ports() {
            if port == 0 {
                return Err(SynthError::validation(format!(
                    "security group {}: port 0 is not a valid ingress port",
                    self.name
                )));
            }
            if seen.contains(&port) {
                return Err(SynthError::validation(format!(
                    "security group {}: port {port} listed twice",
                    self.name
                )));
            }
            seen.push(port);
        }

        let ingress: Vec<Value> = self
            .ingress
            .iter()
            .map(|(port, description)| {
                json!({
                    "CidrIp": "0.0.0.0/0",
                    "Description": description,
                    "FromPort": port,
                    "IpProtocol": "tcp",
                    "ToPort": port,
                })
            })
            .collect();
        stack.add_resource(
            path,
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": self.description,
                "GroupName": self.name,
                "SecurityGroupEgress": [{
                    "CidrIp": "0.0.0.0/0",
                    "Description": "Allow all outbound traffic by default",
                    "IpProtocol": "-1",
                }],
                "SecurityGroupIngress": ingress,
                "VpcId": network.vpc_id,
            }),
        )
    }
}

/// `GroupId` of a security group declared in the same stack.
pub fn group_id(id: &LogicalId) -> Value {
    fns::get_att(id, "GroupId")
}
