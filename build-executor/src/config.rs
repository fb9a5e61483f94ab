// Executor Configuration
// Constructor options for a build execution session

use crate::records::Repo;

use std::time::Duration;

/// Configuration for the build executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Hostname of the worker running the build
    pub hostname: String,
    /// Worker version injected into container environments
    pub version: String,
    /// Distribution the worker runs builds on
    pub distribution: String,
    /// Maximum bytes stored per log (0 = unlimited)
    pub max_log_size: usize,
    /// Maximum bytes of a single artifact or test attachment (0 = unlimited)
    pub file_size_limit: u64,
    /// Maximum bytes of artifacts and attachments across the build (0 = unlimited)
    pub build_file_size_limit: u64,
    /// Grace period for trailing log output once the build context is cancelled
    pub log_streaming_timeout: Duration,
    /// How often buffered container output is uploaded
    pub flush_interval: Duration,
    /// Image patterns only trusted repositories may run
    pub privileged_images: Vec<String>,
    /// Fail builds of untrusted repositories using privileged images
    pub enforce_trusted_repos: bool,
    /// Default bound for create/plan/assemble/exec
    pub build_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            distribution: "linux".to_string(),
            max_log_size: 0,
            file_size_limit: 0,
            build_file_size_limit: 0,
            log_streaming_timeout: Duration::from_secs(5 * 60),
            flush_interval: Duration::from_secs(1),
            privileged_images: Vec::new(),
            enforce_trusted_repos: false,
            build_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl ExecutorConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `WORKER_HOSTNAME`: Hostname reported on builds and records
    /// - `WORKER_VERSION`: Version injected into containers
    /// - `WORKER_DISTRIBUTION`: Distribution reported on builds
    /// - `WORKER_MAX_LOG_SIZE`: Maximum log size in bytes
    /// - `WORKER_FILE_SIZE_LIMIT`: Maximum size of one uploaded file in bytes
    /// - `WORKER_BUILD_FILE_SIZE_LIMIT`: Maximum total size of a build's files in bytes
    /// - `WORKER_LOG_STREAMING_TIMEOUT`: Log draining grace period in seconds
    /// - `WORKER_BUILD_TIMEOUT`: Default build timeout in minutes
    /// - `WORKER_PRIVILEGED_IMAGES`: Comma-separated privileged image patterns
    /// - `WORKER_ENFORCE_TRUSTED_REPOS`: Enforce trusted repos for privileged images
    ///
    /// Unset or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let hostname = std::env::var("WORKER_HOSTNAME").unwrap_or(defaults.hostname);
        let version = std::env::var("WORKER_VERSION").unwrap_or(defaults.version);
        let distribution = std::env::var("WORKER_DISTRIBUTION").unwrap_or(defaults.distribution);

        let max_log_size = std::env::var("WORKER_MAX_LOG_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.max_log_size);

        let file_size_limit = std::env::var("WORKER_FILE_SIZE_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.file_size_limit);

        let build_file_size_limit = std::env::var("WORKER_BUILD_FILE_SIZE_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.build_file_size_limit);

        let log_streaming_timeout = std::env::var("WORKER_LOG_STREAMING_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.log_streaming_timeout);

        let build_timeout = std::env::var("WORKER_BUILD_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(defaults.build_timeout);

        let privileged_images = std::env::var("WORKER_PRIVILEGED_IMAGES")
            .map(|s| parse_list(&s))
            .unwrap_or(defaults.privileged_images);

        let enforce_trusted_repos = std::env::var("WORKER_ENFORCE_TRUSTED_REPOS")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.enforce_trusted_repos);

        Self {
            hostname,
            version,
            distribution,
            max_log_size,
            file_size_limit,
            build_file_size_limit,
            log_streaming_timeout,
            flush_interval: defaults.flush_interval,
            privileged_images,
            enforce_trusted_repos,
            build_timeout,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_max_log_size(mut self, max: usize) -> Self {
        self.max_log_size = max;
        self
    }

    pub fn with_file_size_limit(mut self, limit: u64) -> Self {
        self.file_size_limit = limit;
        self
    }

    pub fn with_build_file_size_limit(mut self, limit: u64) -> Self {
        self.build_file_size_limit = limit;
        self
    }

    pub fn with_log_streaming_timeout(mut self, timeout: Duration) -> Self {
        self.log_streaming_timeout = timeout;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        // a zero period would spin the flush timer
        self.flush_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_privileged_images(mut self, patterns: Vec<String>) -> Self {
        self.privileged_images = patterns;
        self
    }

    pub fn with_enforce_trusted_repos(mut self, enforce: bool) -> Self {
        self.enforce_trusted_repos = enforce;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    /// Build timeout, honoring a repository override
    pub fn build_timeout_for(&self, repo: &Repo) -> Duration {
        match repo.timeout {
            Some(minutes) if minutes > 0 => Duration::from_secs(minutes * 60),
            _ => self.build_timeout,
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
