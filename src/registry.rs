use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{
    config::AppName,
    error::{Result, SynthError},
    stack::{Environment, Export, Stack},
    template::{fns, LogicalId, RemovalPolicy},
};

pub const STACK_NAME: &str = "container-registry";

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct RegistrySpec {
    pub repositories: Vec<AppName>,
    /// Only the newest this many images are kept.
    #[serde(default = "default_max_image_count")]
    pub max_image_count: u32,
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

fn default_max_image_count() -> u32 {
    1
}

/// One repository declaration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RepositorySpec {
    pub name: String,
    pub max_image_count: u32,
    pub removal_policy: RemovalPolicy,
}

impl RepositorySpec {
    pub fn declare(&self, stack: &mut Stack, path: &str) -> Result<LogicalId> {
        if self.max_image_count == 0 {
            return Err(SynthError::validation(format!(
                "repository {}: max_image_count must be at least 1",
                self.name
            )));
        }
        let id = stack.add_resource(
            path,
            "AWS::ECR::Repository",
            json!({
                "ImageScanningConfiguration": { "ScanOnPush": true },
                "LifecyclePolicy": { "LifecyclePolicyText": self.lifecycle_policy() },
                "RepositoryName": self.name,
            }),
        )?;
        stack.set_removal_policy(&id, self.removal_policy);
        Ok(id)
    }

    /// Expire everything but the newest `max_image_count` images.
    fn lifecycle_policy(&self) -> String {
        json!({
            "rules": [{
                "rulePriority": 1,
                "selection": {
                    "tagStatus": "any",
                    "countType": "imageCountMoreThan",
                    "countNumber": self.max_image_count,
                },
                "action": { "type": "expire" },
            }]
        })
        .to_string()
    }
}

/// Repositories another stack can pull from.
#[derive(Debug, Clone, Default)]
pub struct RegistryHandle {
    pub repositories: BTreeMap<String, Export>,
}

impl RegistryHandle {
    pub fn contains(&self, name: &str) -> bool {
        self.repositories.contains_key(name)
    }

    pub fn repository(&self, name: &str) -> Option<&Export> {
        self.repositories.get(name)
    }
}

pub struct ContainerRegistry;

impl ContainerRegistry {
    pub fn synth(spec: &RegistrySpec, env: Environment) -> Result<(Stack, RegistryHandle)> {
        let mut stack = Stack::new(STACK_NAME, env, "Container image repositories");
        let mut repositories: BTreeMap<String, Export> = BTreeMap::new();
        for name in &spec.repositories {
            if repositories.contains_key(name.as_str()) {
                return Err(SynthError::validation(format!(
                    "repository {name} is listed twice"
                )));
            }
            let repo = RepositorySpec {
                name: name.to_string(),
                max_image_count: spec.max_image_count,
                removal_policy: spec.removal_policy,
            };
            let id = repo.declare(&mut stack, &format!("Repository-{name}"))?;
            stack.export(&id, Some("Arn"));
            repositories.insert(name.to_string(), stack.export(&id, None));
        }
        info!(count = repositories.len(), "declared container repositories");
        Ok((stack, RegistryHandle { repositories }))
    }
}

/// Image uri for `repository:tag` in the deploying account.
pub fn image_uri(repository: serde_json::Value, tag: &str) -> serde_json::Value {
    fns::join(
        "",
        vec![
            fns::pseudo("AccountId"),
            ".dkr.ecr.".into(),
            fns::pseudo("Region"),
            ".".into(),
            fns::pseudo("URLSuffix"),
            "/".into(),
            repository,
            format!(":{tag}").into(),
        ],
    )
}
