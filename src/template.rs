use std::{
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

const FORMAT_VERSION: &str = "2010-09-09";

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: &'static str,
    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<LogicalId, Resource>,
    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: Option<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            description,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Every resource of the given CloudFormation type, in logical id order.
    pub fn resources_of_type<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = (&'a LogicalId, &'a Resource)> + 'a {
        self.resources.iter().filter(move |(_, r)| r.kind == kind)
    }

    /// Resources of `kind` whose top level property `key` equals `value`.
    pub fn find<'a>(
        &'a self,
        kind: &'a str,
        key: &'a str,
        value: &'a Value,
    ) -> impl Iterator<Item = (&'a LogicalId, &'a Resource)> + 'a {
        self.resources_of_type(kind)
            .filter(move |(_, r)| r.properties.get(key) == Some(value))
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub kind: String,
    pub properties: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<LogicalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,
}

impl Resource {
    pub fn new(kind: &str, properties: Value) -> Self {
        Self {
            kind: kind.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportName>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExportName {
    #[serde(rename = "Name")]
    pub name: String,
}

/// What happens to a resource when its stack is deleted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Retain,
    Destroy,
}

#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeletionPolicy {
    Retain,
    Delete,
}

impl From<RemovalPolicy> for DeletionPolicy {
    fn from(policy: RemovalPolicy) -> Self {
        match policy {
            RemovalPolicy::Retain => DeletionPolicy::Retain,
            RemovalPolicy::Destroy => DeletionPolicy::Delete,
        }
    }
}

#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// Template-unique resource name. Derived from the construct path so that it stays
/// stable across syntheses, with a short hash suffix to keep distinct paths distinct
/// after non-alphanumerics are stripped.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn derive(stack: &str, path: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stack.as_bytes());
        hasher.update(b"/");
        hasher.update(path.as_bytes());
        let hash: [u8; 32] = hasher.finalize().into();
        let suffix: String = hash.iter().take(4).map(|b| format!("{:02X}", b)).collect();

        let mut readable = String::new();
        let mut upper_next = true;
        for c in path.chars() {
            if c.is_ascii_alphanumeric() {
                if upper_next {
                    readable.push(c.to_ascii_uppercase());
                } else {
                    readable.push(c);
                }
                upper_next = false;
            } else {
                upper_next = true;
            }
        }
        if !readable.starts_with(|c: char| c.is_ascii_alphabetic()) {
            readable.insert(0, 'R');
        }
        // cloudformation caps logical ids at 255 characters
        readable.truncate(255 - suffix.len());
        Self(readable + &suffix)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LogicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for LogicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LogicalId({})", self.0)
    }
}

/// Intrinsic functions.
pub mod fns {
    use serde_json::{json, Value};

    use super::LogicalId;

    pub fn reference(id: &LogicalId) -> Value {
        json!({ "Ref": id })
    }

    pub fn pseudo(name: &str) -> Value {
        json!({ "Ref": format!("AWS::{name}") })
    }

    pub fn get_att(id: &LogicalId, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [id, attribute] })
    }

    pub fn import_value(export_name: &str) -> Value {
        json!({ "Fn::ImportValue": export_name })
    }

    pub fn join(separator: &str, parts: Vec<Value>) -> Value {
        json!({ "Fn::Join": [separator, parts] })
    }

    pub fn sub(template: String) -> Value {
        json!({ "Fn::Sub": template })
    }

    /// arn of an aws managed iam policy, partition aware
    pub fn managed_policy_arn(name: &str) -> Value {
        join(
            "",
            vec![
                "arn:".into(),
                pseudo("Partition"),
                format!(":iam::aws:policy/{name}").into(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn logical_ids_are_stable_and_readable() {
        let a = LogicalId::derive("backend", "EcsCluster-svc-a");
        let b = LogicalId::derive("backend", "EcsCluster-svc-a");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("EcsClusterSvcA"), "{a}");
        assert_eq!(a.as_str().len(), "EcsClusterSvcA".len() + 8);
        assert!(a.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn paths_that_collapse_to_the_same_text_still_differ() {
        let a = LogicalId::derive("s", "Repo-ab");
        let b = LogicalId::derive("s", "Repo-a-b");
        assert_ne!(a, b);
        let other_stack = LogicalId::derive("t", "Repo-ab");
        assert_ne!(a, other_stack);
    }

    #[test]
    fn logical_ids_start_with_a_letter() {
        let id = LogicalId::derive("s", "9080-listener");
        assert!(id.as_str().starts_with('R'));
    }

    #[test]
    fn template_serializes_cloudformation_keys() {
        let mut template = Template::new(Some("test".into()));
        let id = LogicalId::derive("s", "Bucket");
        let mut resource = Resource::new("AWS::S3::Bucket", json!({ "BucketName": "b" }));
        resource.deletion_policy = Some(RemovalPolicy::Retain.into());
        template.resources.insert(id.clone(), resource);

        let js = serde_json::to_value(&template).unwrap();
        assert_eq!(js["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(js["Resources"][id.as_str()]["Type"], "AWS::S3::Bucket");
        assert_eq!(js["Resources"][id.as_str()]["DeletionPolicy"], "Retain");
        assert!(js["Resources"][id.as_str()].get("DependsOn").is_none());
        assert!(js.get("Outputs").is_none());
    }

    #[test]
    fn find_matches_on_property() {
        let mut template = Template::new(None);
        template.resources.insert(
            LogicalId::derive("s", "A"),
            Resource::new("AWS::ECS::Cluster", json!({ "ClusterName": "a" })),
        );
        template.resources.insert(
            LogicalId::derive("s", "B"),
            Resource::new("AWS::ECS::Cluster", json!({ "ClusterName": "b" })),
        );
        assert_eq!(
            template
                .find("AWS::ECS::Cluster", "ClusterName", &json!("b"))
                .count(),
            1
        );
        assert_eq!(template.resources_of_type("AWS::ECS::Cluster").count(), 2);
    }

    #[test]
    fn managed_policy_arns_use_the_partition() {
        assert_eq!(
            fns::managed_policy_arn("AWSAppMeshEnvoyAccess"),
            json!({ "Fn::Join": ["", [
                "arn:",
                { "Ref": "AWS::Partition" },
                ":iam::aws:policy/AWSAppMeshEnvoyAccess"
            ]]})
        );
    }

    #[test]
    fn sub_keeps_placeholders_verbatim() {
        assert_eq!(
            fns::sub("${AWS::StackName}-logs".into()),
            json!({ "Fn::Sub": "${AWS::StackName}-logs" })
        );
    }
}
