use std::{
    collections::BTreeMap,
    fmt::{Debug, Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::{
    app::{BuildInfo, Format},
    error::{Result, SynthError},
    gateway::GatewaySpec,
    mesh::MeshSpec,
    namespace::NamespaceSpec,
    network::Lookups,
    registry::RegistrySpec,
    service::ServiceSpec,
    stack::Environment,
};

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "Synthesize CloudFormation templates for an App Mesh on ECS Fargate")]
pub struct Opts {
    /// Path to the deployment description
    #[clap(short, long, env = "MESHSYNTH_CONFIG", default_value = "meshsynth.toml")]
    pub config: PathBuf,

    /// Account to deploy to.
    #[clap(long, env = "CDK_DEPLOY_ACCOUNT")]
    pub account: Option<String>,

    /// Region to deploy to.
    #[clap(long, env = "CDK_DEPLOY_REGION")]
    pub region: Option<String>,

    /// Name of the existing network to deploy into, overrides `network` in the
    /// deployment description.
    #[clap(long, env = "MESHSYNTH_NETWORK")]
    pub network: Option<String>,

    /// Build identifier handed to containers as DEPLOY_HASH.
    #[clap(long, env = "GIT_SHA1")]
    pub deploy_hash: Option<String>,

    /// Tag of the application images to run.
    #[clap(long, env = "MESHSYNTH_IMAGE_TAG", default_value = "latest")]
    pub image_tag: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write every stack template and a manifest to the output directory.
    Synth {
        #[clap(short, long, env = "MESHSYNTH_OUT", default_value = "cdk.out")]
        out: PathBuf,

        #[clap(long, value_enum, default_value = "json")]
        format: Format,
    },
    /// Print stack names in deploy order.
    List,
}

impl Opts {
    pub fn environment(&self) -> Result<Environment> {
        let account = self
            .account
            .clone()
            .ok_or(SynthError::MissingEnv("CDK_DEPLOY_ACCOUNT"))?;
        let region = self
            .region
            .clone()
            .ok_or(SynthError::MissingEnv("CDK_DEPLOY_REGION"))?;
        Ok(Environment::new(account, region))
    }

    pub fn build_info(&self) -> Result<BuildInfo> {
        let deploy_hash = self
            .deploy_hash
            .clone()
            .ok_or(SynthError::MissingEnv("GIT_SHA1"))?;
        Ok(BuildInfo {
            deploy_hash,
            image_tag: self.image_tag.clone(),
        })
    }
}

/// The whole deployment, as read from toml.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeploySpec {
    /// Name of the existing network everything runs in, looked up in `networks`.
    pub network: String,
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub networks: Lookups,
    #[serde(default)]
    pub registry: Option<RegistrySpec>,
    #[serde(default)]
    pub namespace: Option<NamespaceSpec>,
    #[serde(default)]
    pub mesh: Option<MeshSpec>,
    #[serde(default)]
    pub services: BTreeMap<AppName, ServiceSpec>,
    #[serde(default)]
    pub gateway: Option<GatewaySpec>,
}

impl DeploySpec {
    /// read a deployment description from a file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::read_to_string(path).with_context(|| {
            format!("failed to read deployment file at {}", path.to_string_lossy())
        })?;
        let spec = Self::from_toml(&file)
            .with_context(|| format!("failed to parse {}", path.to_string_lossy()))?;
        Ok(spec)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        Ok(toml::from_str(toml)?)
    }
}

fn default_tags() -> BTreeMap<String, String> {
    [("ServiceName".to_string(), "morningcode".to_string())].into()
}

/// Name of a deployable application. Used verbatim as the cluster name, task family,
/// service name and repository name, so it has to satisfy the strictest of those:
///   contain between 1 and 63 characters
///   contain only lowercase alphanumeric characters or '-'
///   start with a letter
///   end with an alphanumeric character
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppName(String);

impl AppName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for AppName {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        check_label(s, "application name")?;
        ensure(
            s.starts_with(|c: char| c.is_ascii_lowercase()),
            format!("application name {s:?} must start with a letter"),
        )?;
        Ok(Self(s.to_string()))
    }
}

/// A single DNS label, such as the short name a service registers under.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DnsLabel(String);

impl DnsLabel {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl FromStr for DnsLabel {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        check_label(s, "dns label")?;
        Ok(Self(s.to_string()))
    }
}

/// A dotted DNS name of at least two labels, e.g. a private namespace.
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DnsName(String);

impl DnsName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// `<label>.<self>`
    pub fn qualify(&self, label: &DnsLabel) -> String {
        format!("{}.{}", label.as_str(), self.0)
    }
}

impl FromStr for DnsName {
    type Err = SynthError;

    fn from_str(s: &str) -> Result<Self> {
        ensure(s.len() <= 253, format!("dns name {s:?} is longer than 253 characters"))?;
        let labels: Vec<&str> = s.split('.').collect();
        ensure(
            labels.len() >= 2,
            format!("dns name {s:?} must have at least two labels"),
        )?;
        for label in labels {
            check_label(label, "dns label")?;
        }
        Ok(Self(s.to_string()))
    }
}

fn ensure(condition: bool, message: String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(SynthError::Validation(message))
    }
}

fn check_label(s: &str, what: &str) -> Result<()> {
    ensure(!s.is_empty(), format!("{what} cannot be an empty string"))?;
    ensure(s.len() <= 63, format!("{what} {s:?} must be <= 63 characters"))?;
    ensure(
        s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
        format!("{what} {s:?} must contain only lowercase alphanumeric characters or '-'"),
    )?;
    ensure(
        !s.starts_with('-') && !s.ends_with('-'),
        format!("{what} {s:?} must start and end with an alphanumeric character"),
    )
}

macro_rules! string_newtype_impls {
    ($($t:ty),*) => {$(
        impl TryFrom<String> for $t {
            type Error = SynthError;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$t> for String {
            fn from(n: $t) -> String {
                n.0
            }
        }

        impl Display for $t {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Debug for $t {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )*};
}

string_newtype_impls!(AppName, DnsLabel, DnsName);
