// Build Server Client
// Persistence capabilities the executor consumes

use crate::records::{
    Artifact, Build, Log, Record, Repo, SecretValue, TestAttachment, TestReport,
};

use thiserror::Error;

/// Result alias for build server calls
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors reported by the build server client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("build server unreachable: {0}")]
    Unreachable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Persistence capability set of the build server
#[async_trait::async_trait]
pub trait BuildClient: Send + Sync {
    async fn update_build(&self, repo: &Repo, build: &Build) -> ClientResult<Build>;

    async fn update_step(&self, repo: &Repo, build: &Build, step: &Record) -> ClientResult<Record>;

    async fn update_service(
        &self,
        repo: &Repo,
        build: &Build,
        service: &Record,
    ) -> ClientResult<Record>;

    async fn get_step_log(&self, repo: &Repo, build: &Build, number: i64) -> ClientResult<Log>;

    async fn update_step_log(&self, repo: &Repo, build: &Build, log: &Log) -> ClientResult<()>;

    async fn get_service_log(&self, repo: &Repo, build: &Build, number: i64)
        -> ClientResult<Log>;

    async fn update_service_log(&self, repo: &Repo, build: &Build, log: &Log)
        -> ClientResult<()>;

    /// Look up a secret by engine, type, org, repo-or-team and key name
    async fn get_secret(
        &self,
        engine: &str,
        kind: &str,
        org: &str,
        name: &str,
        key: &str,
    ) -> ClientResult<SecretValue>;

    async fn create_artifact(
        &self,
        repo: &Repo,
        build: &Build,
        artifact: &Artifact,
    ) -> ClientResult<Artifact>;

    async fn create_test_report(
        &self,
        repo: &Repo,
        build: &Build,
        report: &TestReport,
    ) -> ClientResult<TestReport>;

    async fn create_test_attachment(
        &self,
        repo: &Repo,
        build: &Build,
        attachment: &TestAttachment,
    ) -> ClientResult<TestAttachment>;
}
