use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    config::{DnsLabel, DnsName},
    error::Result,
    network::NetworkContext,
    stack::{Environment, Export, Stack},
    template::LogicalId,
};

pub const STACK_NAME: &str = "discovery-namespace";

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct NamespaceSpec {
    /// dns suffix, e.g. `morningcode.internal-jp`
    pub name: DnsName,
}

/// What dependents need to register into the namespace.
#[derive(Debug, Clone)]
pub struct NamespaceHandle {
    pub name: DnsName,
    pub id: Export,
    pub arn: Export,
}

pub struct DiscoveryNamespace;

impl DiscoveryNamespace {
    pub fn synth(
        spec: &NamespaceSpec,
        network: &NetworkContext,
        env: Environment,
    ) -> Result<(Stack, NamespaceHandle)> {
        let mut stack = Stack::new(STACK_NAME, env, "Private DNS namespace for service discovery");
        let ns = stack.add_resource(
            "Namespace",
            "AWS::ServiceDiscovery::PrivateDnsNamespace",
            json!({
                "Name": spec.name,
                "Vpc": network.vpc_id,
            }),
        )?;
        let id = stack.export(&ns, Some("Id"));
        let arn = stack.export(&ns, Some("Arn"));
        info!(namespace = %spec.name, network = %network.name, "declared discovery namespace");
        Ok((
            stack,
            NamespaceHandle {
                name: spec.name.clone(),
                id,
                arn,
            },
        ))
    }
}

/// A Cloud Map service: the name a runtime service's tasks register under.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveryRecord {
    pub short_name: DnsLabel,
    pub ttl_secs: u32,
}

impl DiscoveryRecord {
    pub const DEFAULT_TTL_SECS: u32 = 30;

    pub fn new(short_name: DnsLabel) -> Self {
        Self {
            short_name,
            ttl_secs: Self::DEFAULT_TTL_SECS,
        }
    }

    /// Declares `A` and `AAAA` records. Tasks are associated through the runtime
    /// service's `ServiceRegistries`.
    pub fn declare(&self, stack: &mut Stack, namespace: &NamespaceHandle) -> Result<LogicalId> {
        let namespace_id = stack.import(&namespace.id);
        stack.add_resource(
            "Service",
            "AWS::ServiceDiscovery::Service",
            json!({
                "DnsConfig": {
                    "DnsRecords": [
                        { "TTL": self.ttl_secs, "Type": "A" },
                        { "TTL": self.ttl_secs, "Type": "AAAA" },
                    ],
                    "NamespaceId": namespace_id,
                    "RoutingPolicy": "MULTIVALUE",
                },
                "HealthCheckCustomConfig": { "FailureThreshold": 1 },
                "Name": self.short_name,
                "NamespaceId": namespace_id,
            }),
        )
    }

    pub fn fqdn(&self, namespace: &NamespaceHandle) -> String {
        namespace.name.qualify(&self.short_name)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::network::{Lookups, NetworkLookup};

    fn network() -> NetworkContext {
        let lookups: Lookups = [(
            "my-vpc".to_string(),
            NetworkLookup {
                vpc_id: "vpc-1".into(),
                private_subnets: vec!["subnet-1".into()],
                public_subnets: vec![],
            },
        )]
        .into();
        NetworkContext::resolve("my-vpc", &lookups).unwrap()
    }

    fn spec() -> NamespaceSpec {
        NamespaceSpec {
            name: "morningcode.internal-jp".parse().unwrap(),
        }
    }

    #[test]
    fn exactly_one_namespace_bound_to_the_network() {
        let (stack, handle) =
            DiscoveryNamespace::synth(&spec(), &network(), Environment::new("1", "r")).unwrap();
        let namespaces: Vec<_> = stack
            .template()
            .resources_of_type("AWS::ServiceDiscovery::PrivateDnsNamespace")
            .collect();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].1.properties["Name"], "morningcode.internal-jp");
        assert_eq!(namespaces[0].1.properties["Vpc"], "vpc-1");
        assert_eq!(handle.id.stack, STACK_NAME);
    }

    #[test]
    fn record_imports_the_namespace() {
        let (_, handle) =
            DiscoveryNamespace::synth(&spec(), &network(), Environment::new("1", "r")).unwrap();
        let mut stack = Stack::new("backend", Environment::new("1", "r"), "test");
        let record = DiscoveryRecord::new("be".parse().unwrap());
        let id = record.declare(&mut stack, &handle).unwrap();

        let props = &stack.resource(&id).unwrap().properties;
        assert_eq!(props["Name"], "be");
        assert_eq!(props["NamespaceId"], json!({ "Fn::ImportValue": handle.id.name }));
        assert_eq!(props["DnsConfig"]["DnsRecords"][0]["TTL"], 30);
        assert_eq!(props["DnsConfig"]["DnsRecords"][1]["Type"], "AAAA");
        assert_eq!(stack.dependencies().collect::<Vec<_>>(), [STACK_NAME]);
        assert_eq!(record.fqdn(&handle), "be.morningcode.internal-jp");
    }
}
