//! Language worker descriptions.
//!
//! A description names the executable for a language runtime and the
//! platforms it supports. Validation happens once, before any spawn, so an
//! unsupported OS, architecture or runtime version fails immediately with the
//! dimension named in the error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{HostError, Result};

const OS_PLACEHOLDER: &str = "{os}";
const ARCHITECTURE_PLACEHOLDER: &str = "{architecture}";
const VERSION_PLACEHOLDER: &str = "{version}";
const MAX_PROCESS_COUNT: usize = 10;

/// Operating system and architecture the host runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// The platform of the running host, in worker-description naming.
    #[must_use]
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "x64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(os, architecture)
    }

    /// A specific platform.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }
}

/// How to start a worker for one language runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerDescription {
    /// Runtime name, e.g. `node` or `python`.
    pub language: String,
    /// Script extensions this worker handles.
    pub extensions: Vec<String>,
    /// Executable that hosts the worker, e.g. `node`.
    pub default_executable_path: String,
    /// Worker entry point passed to the executable. May contain
    /// `{os}`, `{architecture}` and `{version}` placeholders.
    pub default_worker_path: Option<String>,
    /// Base directory for relative worker paths.
    pub worker_directory: Option<PathBuf>,
    /// Arguments placed before the worker path.
    pub arguments: Vec<String>,
    /// Arguments placed after the worker path.
    pub worker_arguments: Vec<String>,
    /// Supported operating systems; empty means any.
    pub supported_operating_systems: Vec<String>,
    /// Supported architectures; empty means any.
    pub supported_architectures: Vec<String>,
    /// Supported runtime versions; empty means any.
    pub supported_runtime_versions: Vec<String>,
    /// Version used when none is requested.
    pub default_runtime_version: Option<String>,
    /// Extracts the comparable part of a requested version, e.g. `^\d+`.
    pub sanitize_runtime_version_regex: Option<String>,
    /// Extra environment variables for the worker process.
    pub environment: HashMap<String, String>,
    /// How many processes to run for this runtime.
    pub processes: WorkerProcessCount,
}

/// Number of worker processes per runtime and the pause between their starts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerProcessCount {
    pub process_count: usize,
    #[serde(with = "crate::config::serde_duration_millis")]
    pub process_startup_interval: Duration,
}

impl Default for WorkerProcessCount {
    fn default() -> Self {
        Self {
            process_count: 1,
            process_startup_interval: Duration::from_secs(10),
        }
    }
}

impl WorkerDescription {
    /// Fills defaults, checks required fields and validates the platform.
    ///
    /// On success the worker path has its placeholders substituted and the
    /// resolved runtime version is stored in `default_runtime_version`.
    pub fn apply_defaults_and_validate(
        &mut self,
        platform: &Platform,
        requested_version: Option<&str>,
    ) -> Result<()> {
        if self.language.trim().is_empty() {
            return Err(HostError::Config(
                "worker description language cannot be empty".into(),
            ));
        }
        if self.extensions.is_empty() {
            return Err(HostError::Config(format!(
                "worker description for {} has no extensions",
                self.language
            )));
        }
        if self.default_executable_path.trim().is_empty() {
            return Err(HostError::Config(format!(
                "worker description for {} has no executable path",
                self.language
            )));
        }

        if !(1..=MAX_PROCESS_COUNT).contains(&self.processes.process_count) {
            return Err(HostError::Config(format!(
                "process count for {} must be between 1 and {MAX_PROCESS_COUNT}, got {}",
                self.language, self.processes.process_count
            )));
        }

        self.validate_dimension(
            "OS",
            &platform.os,
            &self.supported_operating_systems,
        )?;
        self.validate_dimension(
            "Architecture",
            &platform.architecture,
            &self.supported_architectures,
        )?;

        let version = self.resolve_runtime_version(requested_version)?;
        if let Some(version) = &version {
            self.validate_dimension("Version", version, &self.supported_runtime_versions)?;
        }

        if let Some(path) = &self.default_worker_path {
            let resolved = substitute_placeholders(path, platform, version.as_deref());
            let resolved = match &self.worker_directory {
                Some(dir) if Path::new(&resolved).is_relative() => {
                    dir.join(&resolved).to_string_lossy().into_owned()
                }
                _ => resolved,
            };
            debug!(language = %self.language, worker_path = %resolved, "Resolved worker path");
            self.default_worker_path = Some(resolved);
        }
        self.default_runtime_version = version;

        Ok(())
    }

    /// Returns true if this worker handles files with `extension`.
    #[must_use]
    pub fn handles_extension(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.');
        self.extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    fn resolve_runtime_version(&self, requested: Option<&str>) -> Result<Option<String>> {
        let Some(version) = requested
            .filter(|v| !v.trim().is_empty())
            .map(str::to_owned)
            .or_else(|| self.default_runtime_version.clone())
        else {
            return Ok(None);
        };

        let Some(pattern) = &self.sanitize_runtime_version_regex else {
            return Ok(Some(version));
        };
        let regex = Regex::new(pattern).map_err(|e| {
            HostError::Config(format!(
                "invalid runtime version regex for {}: {e}",
                self.language
            ))
        })?;
        Ok(Some(
            regex
                .find(&version)
                .map_or(version.clone(), |m| m.as_str().to_owned()),
        ))
    }

    fn validate_dimension(&self, dimension: &str, value: &str, supported: &[String]) -> Result<()> {
        if supported.is_empty() || supported.iter().any(|s| s.eq_ignore_ascii_case(value)) {
            return Ok(());
        }
        let message = format!(
            "{dimension} {value} is not supported for language {}",
            self.language
        );
        error!(language = %self.language, dimension, value, "Unsupported worker platform");
        Err(HostError::UnsupportedPlatform(message))
    }
}

fn substitute_placeholders(path: &str, platform: &Platform, version: Option<&str>) -> String {
    let mut resolved = path
        .replace(OS_PLACEHOLDER, &platform.os)
        .replace(ARCHITECTURE_PLACEHOLDER, &platform.architecture);
    if let Some(version) = version {
        resolved = resolved.replace(VERSION_PLACEHOLDER, version);
    }
    resolved
}
