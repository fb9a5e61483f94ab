// Container Environment
// Build, repo and step metadata injected into every container

use crate::config::ExecutorConfig;
use crate::pipeline::Container;
use crate::records::{Build, Record, Repo, STEP_STAGE_KEY};

use std::collections::HashMap;

/// Environment key holding the build event
pub const BUILD_EVENT_KEY: &str = "CI_BUILD_EVENT";

/// Environment key holding the build event action
pub const BUILD_EVENT_ACTION_KEY: &str = "CI_BUILD_EVENT_ACTION";

/// Keys secret access control and substitution rely on when a container's
/// environment is otherwise cleared
pub const PRESERVED_KEYS: &[&str] = &[BUILD_EVENT_KEY, BUILD_EVENT_ACTION_KEY];

/// Environment describing the build and the worker running it
pub fn build_environment(build: &Build, repo: &Repo, config: &ExecutorConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert("CI".to_string(), "true".to_string());
    env.insert("CI_BUILD_NUMBER".to_string(), build.number.to_string());
    env.insert(BUILD_EVENT_KEY.to_string(), build.event.clone());
    env.insert(BUILD_EVENT_ACTION_KEY.to_string(), build.event_action.clone());
    env.insert("CI_BUILD_BRANCH".to_string(), build.branch.clone());
    env.insert("CI_BUILD_COMMIT".to_string(), build.commit.clone());
    env.insert("CI_BUILD_STATUS".to_string(), build.status.to_string());
    env.insert("CI_BUILD_STARTED".to_string(), build.started.to_string());
    env.insert("CI_REPO_ORG".to_string(), repo.org.clone());
    env.insert("CI_REPO_NAME".to_string(), repo.name.clone());
    env.insert("CI_REPO_FULL_NAME".to_string(), repo.full_name());
    env.insert("CI_REPO_BRANCH".to_string(), repo.branch.clone());
    env.insert("CI_REPO_TRUSTED".to_string(), repo.trusted.to_string());
    env.insert("CI_HOST".to_string(), config.hostname.clone());
    env.insert("CI_RUNTIME".to_string(), build.runtime.clone());
    env.insert("CI_DISTRIBUTION".to_string(), config.distribution.clone());
    env.insert("CI_VERSION".to_string(), config.version.clone());

    env
}

/// Environment describing a single step or service
pub fn step_environment(record: &Record) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert("CI_STEP_NAME".to_string(), record.name.clone());
    env.insert("CI_STEP_NUMBER".to_string(), record.number.to_string());
    env.insert("CI_STEP_IMAGE".to_string(), record.image.clone());
    env.insert("CI_STEP_STATUS".to_string(), record.status.to_string());
    if !record.stage.is_empty() {
        env.insert(STEP_STAGE_KEY.to_string(), record.stage.clone());
    }

    env
}

/// Merge build and step metadata into the container, overriding declared values
pub fn merge(
    ctn: &mut Container,
    build: &Build,
    repo: &Repo,
    record: &Record,
    config: &ExecutorConfig,
) {
    ctn.environment.extend(build_environment(build, repo, config));
    ctn.environment.extend(step_environment(record));
}
