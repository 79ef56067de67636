use thiserror::Error;

/// Everything that can go wrong while synthesizing. There is no runtime error path,
/// any of these aborts template generation.
#[derive(Error, Debug)]
pub enum SynthError {
    #[error("network {0:?} could not be resolved, add it to the [networks] lookups")]
    UnresolvedNetwork(String),
    #[error("required environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("mesh routing error: {0}")]
    Routing(String),
    #[error("stack {stack} already declares a resource with logical id {id}")]
    DuplicateResource { stack: String, id: String },
    #[error("stack dependency error: {0}")]
    Dependency(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SynthError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }
}

pub type Result<T, E = SynthError> = std::result::Result<T, E>;
