// Pipeline Models
// Compiled pipeline definition consumed by the executor

use crate::error::{ExecutorError, ExecutorResult};
use crate::pipeline::ruleset::Ruleset;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the synthetic first step hosting pre-flight logs
pub const INIT_NAME: &str = "init";

/// The unit of execution backing a step, a service or a secret origin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Unique id derived from build, role and name
    pub id: String,
    pub name: String,
    /// Server-assigned number of the step or service
    #[serde(default)]
    pub number: i64,
    pub image: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Secret references: source secret name to target env var
    #[serde(default)]
    pub secrets: Vec<StepSecret>,
    #[serde(default)]
    pub ruleset: Ruleset,
    /// Detached containers are started but never awaited
    #[serde(default)]
    pub detach: bool,
    #[serde(default)]
    pub pull: String,
    #[serde(default)]
    pub exit_code: i32,
}

impl Container {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn is_init(&self) -> bool {
        self.name == INIT_NAME
    }

    /// Reject containers the runtime could never run
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.id.trim().is_empty() {
            return Err(ExecutorError::setup(format!(
                "container {} has no id",
                self.name
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ExecutorError::setup(format!(
                "container {} has no name",
                self.id
            )));
        }
        if self.image.trim().is_empty() {
            return Err(ExecutorError::setup(format!(
                "container {} has no image",
                self.name
            )));
        }
        Ok(())
    }
}

/// Secret reference declared on a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSecret {
    pub source: String,
    pub target: String,
}

/// A named group of steps with optional dependencies on other stages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Independent stages ignore the overall build status
    #[serde(default)]
    pub independent: bool,
    #[serde(default)]
    pub steps: Vec<Container>,
}

/// When a secret value is pulled from the build server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretPull {
    #[default]
    BuildStart,
    StepStart,
}

/// Secret declared by the pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    /// Path of the secret on the server, e.g. `octocat/hello/token`
    pub key: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    /// One of `org`, `repo` or `shared`
    #[serde(rename = "type", default = "default_secret_type")]
    pub kind: String,
    /// Plugin container producing the secret, absent for key/value secrets
    #[serde(default)]
    pub origin: Option<Container>,
    #[serde(default)]
    pub pull: SecretPull,
}

fn default_engine() -> String {
    "native".to_string()
}

fn default_secret_type() -> String {
    "repo".to_string()
}

impl Secret {
    pub fn is_plugin(&self) -> bool {
        self.origin.is_some()
    }
}

/// Immutable compiled pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub steps: Vec<Container>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub services: Vec<Container>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

impl Pipeline {
    /// Load a compiled pipeline from YAML
    pub fn from_yaml(source: &str) -> ExecutorResult<Self> {
        serde_yaml::from_str(source)
            .map_err(|e| ExecutorError::setup(format!("invalid pipeline yaml: {}", e)))
    }

    /// Load a compiled pipeline from JSON
    pub fn from_json(source: &str) -> ExecutorResult<Self> {
        serde_json::from_str(source)
            .map_err(|e| ExecutorError::setup(format!("invalid pipeline json: {}", e)))
    }

    /// The init container: the first `init` step, or the first step of the `init` stage
    pub fn init_container(&self) -> Option<&Container> {
        if let Some(init) = self.steps.iter().find(|s| s.is_init()) {
            return Some(init);
        }

        self.stages
            .iter()
            .find(|s| s.name == INIT_NAME)
            .and_then(|s| s.steps.first())
    }

    /// Stages other than the init stage
    pub fn runnable_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.name != INIT_NAME)
    }

    /// Every image a build would run: steps, stage steps, services and secret origins
    pub fn images(&self) -> Vec<&str> {
        let steps = self.steps.iter();
        let stage_steps = self.stages.iter().flat_map(|s| s.steps.iter());
        let services = self.services.iter();
        let origins = self.secrets.iter().filter_map(|s| s.origin.as_ref());

        steps
            .chain(stage_steps)
            .chain(services)
            .chain(origins)
            .filter(|c| !c.is_init())
            .map(|c| c.image.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r##"
id: octocat_hello_1
steps:
  - id: step_octocat_hello_1_init
    name: init
    number: 1
    image: "#init"
  - id: step_octocat_hello_1_echo
    name: echo
    number: 2
    image: alpine:latest
    commands: ["echo hello"]
    secrets:
      - source: token
        target: api_token
services:
  - id: service_octocat_hello_1_redis
    name: redis
    number: 1
    image: redis:7
secrets:
  - name: token
    key: octocat/hello/token
  - name: vault
    key: octocat/vault
    type: org
    pull: step_start
    origin:
      id: secret_octocat_hello_1_vault
      name: vault
      image: target/secret-vault:latest
"##;

    #[test]
    fn test_pipeline_from_yaml() {
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();

        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.services.len(), 1);
        assert_eq!(pipeline.secrets[0].kind, "repo");
        assert_eq!(pipeline.secrets[0].engine, "native");
        assert_eq!(pipeline.secrets[0].pull, SecretPull::BuildStart);
        assert_eq!(pipeline.secrets[1].pull, SecretPull::StepStart);
        assert!(pipeline.secrets[1].is_plugin());
        assert_eq!(pipeline.steps[1].secrets[0].target, "api_token");
    }

    #[test]
    fn test_init_container_from_steps_or_stage() {
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        assert_eq!(pipeline.init_container().unwrap().name, "init");

        let staged = Pipeline {
            stages: vec![Stage {
                name: INIT_NAME.to_string(),
                steps: vec![Container::new("step_init", "init", "#init")],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(staged.init_container().unwrap().id, "step_init");
        assert!(Pipeline::default().init_container().is_none());
    }

    #[test]
    fn test_images_skip_init() {
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();
        let images = pipeline.images();
        assert_eq!(
            images,
            vec!["alpine:latest", "redis:7", "target/secret-vault:latest"]
        );
    }

    #[test]
    fn test_container_validate() {
        assert!(Container::new("id", "name", "alpine").validate().is_ok());
        assert!(Container::new("id", "name", " ").validate().is_err());
        assert!(Container::new("", "name", "alpine").validate().is_err());
    }

    #[test]
    fn test_invalid_yaml_is_setup_error() {
        let err = Pipeline::from_yaml("steps: [").unwrap_err();
        assert!(matches!(err, ExecutorError::Setup(_)));
    }
}
