//! Per-branch deployment supervision.
//!
//! Every repository branch gets a stable host port for the lifetime of the
//! daemon. A deploy replaces whatever container currently holds that port
//! and succeeds once the new container's output matches a success pattern.

pub mod ports;
pub mod progress;
pub mod runner;
pub mod runtime;
pub mod status;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One logical deployable unit: a branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeployKey {
    pub repo: String,
    pub branch: String,
}

impl DeployKey {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Deterministic container name for this key, e.g. `app_main`.
    ///
    /// Docker only accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]*`, so anything else
    /// (branch slashes in particular) is mapped to `-`.
    pub fn container_name(&self) -> String {
        let raw = format!("{}_{}", self.repo, self.branch);
        let mut name: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            name.insert(0, 'b');
        }
        name
    }
}

impl std::fmt::Display for DeployKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repo, self.branch)
    }
}

/// One deployment request as received over the API.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployRequest {
    pub repo: String,
    pub branch: String,
    /// Image to run, as accepted by `docker run`.
    pub image: String,
}

impl DeployRequest {
    pub fn key(&self) -> DeployKey {
        DeployKey::new(&self.repo, &self.branch)
    }
}

/// Supervisor-wide options, fixed at construction.
#[derive(Debug)]
pub struct DeployOptions {
    /// Starting port to be scanned for free ports.
    pub lower_port: u16,
    /// The exposed port in the Dockerfile to be mapped externally.
    pub source_port: u16,
    /// Base URL for the docker container. Probably localhost or your
    /// Docker machine IP.
    pub base_url: String,
    /// Patterns that indicate the container has started up correctly.
    pub success_patterns: Vec<Regex>,
}

/// A resolved deployment. The container keeps running after this is
/// returned; the record itself is transient.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: Uuid,
    pub key: DeployKey,
    pub container: String,
    pub port: u16,
    pub endpoint: String,
    pub started_at: DateTime<Utc>,
}

/// The only result shape surfaced to callers: `{exitCode, targetUrl}` on
/// success, `{exitCode, message}` on failure.
#[derive(Debug, Serialize)]
pub struct DeployReport {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "targetUrl", skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeployReport {
    pub fn success(target_url: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            target_url: Some(target_url.into()),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            target_url: None,
            message: Some(message.into()),
        }
    }
}
