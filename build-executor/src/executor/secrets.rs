// Secret Manager
// Resolves, injects and lazily loads secret values into container environments

use crate::environment::{BUILD_EVENT_ACTION_KEY, BUILD_EVENT_KEY, PRESERVED_KEYS};
use crate::error::{ExecutorError, ExecutorResult, SecretError};
use crate::executor::{Executor, Role};
use crate::pipeline::{Container, Secret, SecretPull};
use crate::records::{SecretValue, Status};
use crate::runtime::DRIVER_KUBERNETES;

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SECRET_ORG: &str = "org";
const SECRET_REPO: &str = "repo";
const SECRET_SHARED: &str = "shared";

/// Engines secrets may be stored in
const ENGINES: &[&str] = &["native", "vault"];

/// Server coordinates of a secret: org, repo or team, and key name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPath {
    pub org: String,
    pub name: String,
    pub key: String,
}

/// Parse a secret's key into the coordinates the build server expects.
///
/// `org` keys are `org/key` with an implicit org when no `/` is present,
/// `repo` keys are `org/repo/key` with an implicit org and repo, and
/// `shared` keys are always `org/team/key`.
pub fn parse_secret_key(secret: &Secret, org: &str, repo: &str) -> Result<SecretPath, SecretError> {
    if !ENGINES.iter().any(|e| e.eq_ignore_ascii_case(&secret.engine)) {
        return Err(invalid(secret, format!("invalid engine {}", secret.engine)));
    }

    let key = secret.key.as_str();

    match secret.kind.as_str() {
        SECRET_ORG => {
            let Some((key_org, name)) = key.split_once('/') else {
                return Ok(path(org, "*", key));
            };
            if name.is_empty() {
                return Err(invalid(secret, "missing key name"));
            }
            if !key_org.eq_ignore_ascii_case(org) {
                return Err(invalid(secret, format!("org {} does not match {}", key_org, org)));
            }
            Ok(path(key_org, "*", name))
        }
        SECRET_REPO => {
            if !key.contains('/') {
                return Ok(path(org, repo, key));
            }
            let parts: Vec<&str> = key.splitn(3, '/').collect();
            let [key_org, key_repo, name] = parts.as_slice() else {
                return Err(invalid(secret, "repo secrets need an org/repo/key path"));
            };
            if name.is_empty() {
                return Err(invalid(secret, "missing key name"));
            }
            if !key_org.eq_ignore_ascii_case(org) {
                return Err(invalid(secret, format!("org {} does not match {}", key_org, org)));
            }
            if !key_repo.eq_ignore_ascii_case(repo) {
                return Err(invalid(secret, format!("repo {} does not match {}", key_repo, repo)));
            }
            Ok(path(key_org, key_repo, name))
        }
        SECRET_SHARED => {
            let parts: Vec<&str> = key.splitn(3, '/').collect();
            match parts.as_slice() {
                [key_org, team, name] if !key_org.is_empty() && !team.is_empty() && !name.is_empty() => {
                    Ok(path(key_org, team, name))
                }
                _ => Err(invalid(secret, "shared secrets need an org/team/key path")),
            }
        }
        other => Err(SecretError::UnrecognizedType(other.to_string())),
    }
}

fn path(org: &str, name: &str, key: &str) -> SecretPath {
    SecretPath {
        org: org.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    }
}

fn invalid(secret: &Secret, reason: impl Into<String>) -> SecretError {
    SecretError::InvalidKey {
        key: secret.key.clone(),
        reason: reason.into(),
    }
}

/// Whether a resolved secret may be handed to the container.
///
/// The container image must start with one of the secret's non-empty image
/// prefixes, the build event must be allowed, and containers running commands
/// only receive secrets that allow it.
pub fn secret_matches(secret: &SecretValue, ctn: &Container) -> bool {
    let image_allowed = secret
        .images
        .iter()
        .any(|image| !image.is_empty() && ctn.image.starts_with(image.as_str()));
    if !image_allowed {
        return false;
    }

    let event = ctn
        .environment
        .get(BUILD_EVENT_KEY)
        .map(String::as_str)
        .unwrap_or_default();
    let action = ctn
        .environment
        .get(BUILD_EVENT_ACTION_KEY)
        .map(String::as_str)
        .unwrap_or_default();

    let event_allowed = secret.events.iter().any(|allowed| match allowed.split_once(':') {
        Some((allowed_event, allowed_action)) => allowed_event == event && allowed_action == action,
        None => allowed == event,
    });
    if event.is_empty() || !event_allowed {
        return false;
    }

    ctn.commands.is_empty() || secret.allow_command
}

/// Write every referenced secret that passes access control into the
/// container environment under its upper-cased target name
pub fn inject_secrets(ctn: &mut Container, secrets: &HashMap<String, SecretValue>) {
    let references = ctn.secrets.clone();

    for reference in references {
        let Some(secret) = secrets.get(&reference.source) else {
            continue;
        };

        if secret_matches(secret, ctn) {
            ctn.environment
                .insert(reference.target.to_uppercase(), secret.value.clone());
        } else {
            debug!(secret = %reference.source, container = %ctn.name, "secret not allowed for container");
        }
    }
}

/// Escape literal `\n` sequences so substitution leaves them intact.
///
/// Values already carrying an escaped sequence are left alone, so applying
/// this twice is the same as applying it once.
pub fn escape_newline_secrets(secrets: &mut HashMap<String, SecretValue>) {
    for secret in secrets.values_mut() {
        if !secret.value.contains("\\\\n") {
            secret.value = secret.value.replace("\\n", "\\\\n");
        }
    }
}

impl Executor {
    /// Resolve a declared secret from the build server
    pub(crate) async fn pull_secret(&self, secret: &Secret) -> ExecutorResult<SecretValue> {
        let path = parse_secret_key(secret, &self.repo.org, &self.repo.name)?;

        debug!(secret = %secret.name, kind = %secret.kind, org = %path.org, "pulling secret");

        let value = self
            .client
            .get_secret(&secret.engine, &secret.kind, &path.org, &path.name, &path.key)
            .await
            .map_err(|source| SecretError::Retrieve {
                kind: secret.kind.clone(),
                key: secret.key.clone(),
                source,
            })?;

        Ok(value)
    }

    /// Run every plugin-backed secret's origin container to completion.
    ///
    /// Output streams into the init log. A non-zero exit fails the secret
    /// phase and, unless the origin may continue, the build.
    pub(crate) async fn exec_secrets(self: &Arc<Self>, token: &CancellationToken) -> ExecutorResult<()> {
        let origins: Vec<&Container> = self
            .pipeline
            .secrets
            .iter()
            .filter_map(|secret| secret.origin.as_ref())
            .collect();

        if origins.is_empty() {
            return Ok(());
        }

        for origin in origins {
            info!(secret = %origin.name, "executing secret plugin");

            let exit_code = self.exec_container(Role::Secret, token, origin).await?;
            if exit_code != 0 {
                if !origin.ruleset.continue_on_failure {
                    self.set_status(Status::Failure);
                }
                return Err(ExecutorError::ContainerExit {
                    name: origin.name.clone(),
                    code: exit_code,
                });
            }
        }

        self.upload_build().await
    }

    /// Resolve the step-start secrets a step references just before it runs.
    ///
    /// The secrets are injected and substituted on a clone of the container
    /// holding only the keys substitution needs; only the resulting secret
    /// entries are copied back so the real container is substituted once.
    pub(crate) async fn load_lazy_secrets(&self, step: &Container) -> ExecutorResult<()> {
        let lazy: Vec<&Secret> = self
            .pipeline
            .secrets
            .iter()
            .filter(|secret| secret.pull == SecretPull::StepStart && !secret.is_plugin())
            .filter(|secret| step.secrets.iter().any(|r| r.source == secret.name))
            .collect();

        if lazy.is_empty() {
            return Ok(());
        }

        if self.runtime.driver() == DRIVER_KUBERNETES {
            warn!(step = %step.name, "step start secrets are not supported on kubernetes");

            let notice = format!(
                "unable to pull secrets {} at step start: not supported by the {} runtime\n",
                lazy.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", "),
                DRIVER_KUBERNETES,
            );
            self.logs
                .update(&step.id, |log| log.append_data(notice.as_bytes()));
            self.upload_log(Role::Step, &step.id).await;
            return Ok(());
        }

        let mut values = HashMap::new();
        for secret in lazy {
            let value = self
                .pull_secret(secret)
                .await
                .map_err(|e| e.context(format!("unable to load secrets for step {}", step.name)))?;
            values.insert(secret.name.clone(), value);
        }
        escape_newline_secrets(&mut values);

        let mut ctn = self.prepared(step);

        let mut scratch = ctn.clone();
        scratch
            .environment
            .retain(|key, _| PRESERVED_KEYS.contains(&key.as_str()));
        inject_secrets(&mut scratch, &values);
        scratch.substitute();

        for reference in &step.secrets {
            let target = reference.target.to_uppercase();
            if !values.contains_key(&reference.source) {
                continue;
            }
            if let Some(value) = scratch.environment.get(&target) {
                ctn.environment.insert(target, value.clone());
            }
        }

        self.containers.store(ctn.id.clone(), ctn);
        self.secrets.lock().extend(values);
        Ok(())
    }
}
