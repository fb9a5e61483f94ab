// Server Records
// Build, step/service, log and secret records exchanged with the build server

use crate::pipeline::Container;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment key carrying the stage a step belongs to
pub const STEP_STAGE_KEY: &str = "CI_STEP_STAGE";

/// Exit code recorded for containers that never reported completion
pub const KILLED_EXIT_CODE: i32 = 137;

/// Current unix timestamp in seconds
pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

/// Lifecycle status shared by builds, steps and services
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Canceled,
    Killed,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
            Status::Canceled => "canceled",
            Status::Killed => "killed",
            Status::Skipped => "skipped",
        }
    }

    /// Statuses that cancellation must never overwrite
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Error | Status::Failure | Status::Killed | Status::Success | Status::Skipped
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository owning a build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub org: String,
    pub name: String,
    #[serde(default)]
    pub branch: String,
    /// Trusted repositories may run privileged images
    #[serde(default)]
    pub trusted: bool,
    /// Build timeout override in minutes
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Repo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.name)
    }
}

/// One pipeline execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub number: i64,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub error: String,
    /// Triggering event, e.g. `push` or `pull_request`
    pub event: String,
    #[serde(default)]
    pub event_action: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub distribution: String,
}

impl Build {
    /// Event in `event:action` form when an action is present
    pub fn full_event(&self) -> String {
        if self.event_action.is_empty() {
            self.event.clone()
        } else {
            format!("{}:{}", self.event, self.event_action)
        }
    }
}

/// Server-visible projection of a step or service container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub build_id: i64,
    pub number: i64,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    pub image: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub started: i64,
    #[serde(default)]
    pub finished: i64,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub distribution: String,
}

impl Record {
    /// Build a pending record for a container, reading the stage from its environment
    pub fn from_container(build: &Build, ctn: &Container) -> Self {
        Self {
            id: 0,
            build_id: build.id,
            number: ctn.number,
            name: ctn.name.clone(),
            stage: ctn
                .environment
                .get(STEP_STAGE_KEY)
                .cloned()
                .unwrap_or_default(),
            image: ctn.image.clone(),
            status: Status::Pending,
            error: String::new(),
            exit_code: 0,
            started: 0,
            finished: 0,
            host: build.host.clone(),
            runtime: build.runtime.clone(),
            distribution: build.distribution.clone(),
        }
    }
}

/// Append-only log attached to one step or service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub id: i64,
    pub build_id: i64,
    /// Number of the owning step or service
    pub number: i64,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Log {
    pub fn new(build_id: i64, number: i64) -> Self {
        Self {
            id: 0,
            build_id,
            number,
            data: Vec::new(),
        }
    }

    pub fn append_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Replace every occurrence of the given secret values with `***`
    pub fn mask_data(&mut self, secrets: &[String]) {
        self.data = mask_bytes(&self.data, secrets);
    }
}

/// File a step produced, held in object storage and indexed by the build server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub build_id: i64,
    /// Server id of the step that produced the file
    pub step_id: i64,
    pub file_name: String,
    pub object_path: String,
    /// Size in bytes
    pub file_size: u64,
    #[serde(default)]
    pub created: i64,
}

/// Test results reported by one step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub id: i64,
    pub build_id: i64,
    pub step_id: i64,
    #[serde(default)]
    pub created: i64,
}

/// File attached to a test report, such as a junit document or a screenshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestAttachment {
    pub id: i64,
    pub test_report_id: i64,
    pub file_name: String,
    pub object_path: String,
    pub file_size: u64,
    #[serde(default)]
    pub created: i64,
}

/// Mask secret values in arbitrary output
pub fn mask_bytes(data: &[u8], secrets: &[String]) -> Vec<u8> {
    if secrets.is_empty() || data.is_empty() {
        return data.to_vec();
    }

    let mut text = String::from_utf8_lossy(data).into_owned();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        if text.contains(secret.as_str()) {
            text = text.replace(secret.as_str(), "***");
        }
    }
    text.into_bytes()
}

/// Resolved secret value returned by the build server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretValue {
    pub name: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub team: String,
    pub value: String,
    /// Image prefixes allowed to receive the secret
    #[serde(default)]
    pub images: Vec<String>,
    /// Events (or `event:action` pairs) allowed to receive the secret
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_true")]
    pub allow_command: bool,
}

fn default_true() -> bool {
    true
}
