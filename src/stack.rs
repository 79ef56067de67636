use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::{Result, SynthError},
    template::{fns, ExportName, LogicalId, Output, RemovalPolicy, Resource, Tag, Template},
};

/// Resource types that accept a `Tags: [{Key, Value}]` property.
const TAGGABLE: &[&str] = &[
    "AWS::AppMesh::GatewayRoute",
    "AWS::AppMesh::Mesh",
    "AWS::AppMesh::Route",
    "AWS::AppMesh::VirtualGateway",
    "AWS::AppMesh::VirtualNode",
    "AWS::AppMesh::VirtualRouter",
    "AWS::AppMesh::VirtualService",
    "AWS::EC2::SecurityGroup",
    "AWS::ECR::Repository",
    "AWS::ECS::Cluster",
    "AWS::ECS::Service",
    "AWS::ECS::TaskDefinition",
    "AWS::ElasticLoadBalancingV2::LoadBalancer",
    "AWS::ElasticLoadBalancingV2::TargetGroup",
    "AWS::IAM::Role",
    "AWS::Logs::LogGroup",
    "AWS::ServiceDiscovery::PrivateDnsNamespace",
    "AWS::ServiceDiscovery::Service",
];

/// Account and region a stack is deployed to.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

impl Environment {
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

/// A value one stack publishes for other stacks to read. Inside the producing stack
/// it resolves to the local `Ref`/`Fn::GetAtt`, everywhere else to `Fn::ImportValue`.
#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub stack: String,
    pub name: String,
    local: Value,
}

/// A template under construction. Owns everything it declares; other stacks are only
/// ever seen through [`Export`]s.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    env: Environment,
    template: Template,
    tags: BTreeMap<String, String>,
    dependencies: BTreeSet<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>, env: Environment, description: &str) -> Self {
        Self {
            name: name.into(),
            env,
            template: Template::new(Some(description.to_string())),
            tags: BTreeMap::new(),
            dependencies: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn add_tags(&mut self, tags: &BTreeMap<String, String>) {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn logical_id(&self, path: &str) -> LogicalId {
        LogicalId::derive(&self.name, path)
    }

    /// Declare a resource at `path`, rejecting a second declaration at the same path.
    pub fn add_resource(&mut self, path: &str, kind: &str, properties: Value) -> Result<LogicalId> {
        let id = self.logical_id(path);
        if self.template.resources.contains_key(&id) {
            return Err(SynthError::DuplicateResource {
                stack: self.name.clone(),
                id: id.to_string(),
            });
        }
        debug!(stack = %self.name, %id, kind, "declaring resource");
        self.template
            .resources
            .insert(id.clone(), Resource::new(kind, properties));
        Ok(id)
    }

    pub fn resource(&self, id: &LogicalId) -> Option<&Resource> {
        self.template.resources.get(id)
    }

    /// # Panics
    ///
    /// Panics if `id` was not declared in this stack.
    pub fn set_removal_policy(&mut self, id: &LogicalId, policy: RemovalPolicy) {
        let resource = self.resource_mut(id);
        resource.deletion_policy = Some(policy.into());
        resource.update_replace_policy = Some(policy.into());
    }

    /// # Panics
    ///
    /// Panics if either resource was not declared in this stack.
    pub fn add_depends_on(&mut self, id: &LogicalId, on: &LogicalId) {
        assert!(
            self.template.resources.contains_key(on),
            "dependency target {on} not in stack {}",
            self.name
        );
        let resource = self.resource_mut(id);
        if !resource.depends_on.contains(on) {
            resource.depends_on.push(on.clone());
        }
    }

    fn resource_mut(&mut self, id: &LogicalId) -> &mut Resource {
        let name = &self.name;
        self.template
            .resources
            .get_mut(id)
            .unwrap_or_else(|| panic!("resource {id} not in stack {name}"))
    }

    /// Publish `Ref` (or `Fn::GetAtt` when `attribute` is given) of a local resource.
    pub fn export(&mut self, id: &LogicalId, attribute: Option<&str>) -> Export {
        let (local, output_key) = match attribute {
            Some(attr) => (fns::get_att(id, attr), format!("Export{id}{attr}")),
            None => (fns::reference(id), format!("Export{id}Ref")),
        };
        let output_key: String = output_key
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        let name = format!("{}:{}", self.name, output_key);
        self.template.outputs.insert(
            output_key,
            Output {
                value: local.clone(),
                export: Some(ExportName { name: name.clone() }),
            },
        );
        Export {
            stack: self.name.clone(),
            name,
            local,
        }
    }

    /// Read an export, recording a deploy-order dependency on its stack.
    pub fn import(&mut self, export: &Export) -> Value {
        if export.stack == self.name {
            return export.local.clone();
        }
        self.add_dependency(&export.stack);
        fns::import_value(&export.name)
    }

    /// Order this stack after `stack` without importing anything from it.
    pub fn add_dependency(&mut self, stack: &str) {
        if stack != self.name {
            self.dependencies.insert(stack.to_string());
        }
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(String::as_str)
    }

    /// Apply stack tags and hand out the finished template.
    pub fn into_artifact(self) -> StackArtifact {
        let Stack {
            name,
            env,
            mut template,
            tags,
            dependencies,
        } = self;
        let tags: Vec<Tag> = tags
            .into_iter()
            .map(|(key, value)| Tag { key, value })
            .collect();
        if !tags.is_empty() {
            for resource in template.resources.values_mut() {
                if !TAGGABLE.contains(&resource.kind.as_str()) {
                    continue;
                }
                if let Value::Object(props) = &mut resource.properties {
                    let existing = props
                        .entry("Tags")
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(existing) = existing {
                        for tag in &tags {
                            existing.push(serde_json::json!({ "Key": tag.key, "Value": tag.value }));
                        }
                    }
                }
            }
        }
        StackArtifact {
            name,
            env,
            template,
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

/// A synthesized stack: the finished template plus what it must be deployed after.
#[derive(Debug, Clone, PartialEq)]
pub struct StackArtifact {
    pub name: String,
    pub env: Environment,
    pub template: Template,
    pub dependencies: Vec<String>,
}
