//! Configuration types for the worker host.

use std::collections::HashMap;
use std::time::Duration;

use nimbus_proto::rpc::{BindingInfo, RpcFunctionMetadata};
use serde::Deserialize;

use crate::backoff::{BackoffPolicy, RetryPolicy};
use crate::process::WorkerDescription;

/// Host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Event stream server configuration.
    pub rpc: RpcConfig,
    /// Worker channel timeouts.
    pub channel: ChannelConfig,
    /// Worker process lifecycle.
    pub process: ProcessConfig,
    /// Placeholder (pre-warmed) mode.
    pub placeholder: PlaceholderConfig,
    /// Host heartbeat.
    pub heartbeat: HeartbeatConfig,
    /// Language worker descriptions.
    pub workers: Vec<WorkerDescription>,
    /// Functions loaded onto workers of their runtime.
    pub functions: Vec<FunctionConfig>,
    /// Root of the function application, sent to workers on init.
    pub function_app_directory: String,
}

impl HostConfig {
    /// Returns the description for `runtime`, if configured.
    #[must_use]
    pub fn worker(&self, runtime: &str) -> Option<&WorkerDescription> {
        self.workers
            .iter()
            .find(|w| w.language.eq_ignore_ascii_case(runtime))
    }

    /// Returns the function metadata configured for `runtime`.
    #[must_use]
    pub fn functions_for(&self, runtime: &str) -> Vec<RpcFunctionMetadata> {
        self.functions
            .iter()
            .filter(|f| f.runtime.eq_ignore_ascii_case(runtime))
            .map(FunctionConfig::to_metadata)
            .collect()
    }
}

/// Event stream server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Address workers connect to.
    pub host: String,
    /// Port to listen on. Zero picks a free port.
    pub port: u16,
    /// Largest frame accepted or sent.
    pub max_message_length: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            max_message_length: nimbus_proto::DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

/// Worker channel timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Deadline for the init handshake.
    #[serde(with = "serde_duration_millis")]
    pub init_timeout: Duration,
    /// Deadline for all function load responses.
    #[serde(with = "serde_duration_millis")]
    pub load_timeout: Duration,
    /// Default deadline for an invocation without its own.
    #[serde(with = "serde_duration_millis")]
    pub invocation_timeout: Duration,
    /// How long a cancelled invocation may still complete.
    #[serde(with = "serde_duration_millis")]
    pub cancel_grace_period: Duration,
    /// Grace period sent with `WorkerTerminate`.
    #[serde(with = "serde_duration_millis")]
    pub terminate_grace_period: Duration,
    /// Deadline for an environment reload.
    #[serde(with = "serde_duration_millis")]
    pub env_reload_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            load_timeout: Duration::from_secs(60),
            invocation_timeout: Duration::from_secs(300),
            cancel_grace_period: Duration::from_secs(1),
            terminate_grace_period: Duration::from_secs(5),
            env_reload_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker process lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Restarts allowed per runtime before it is marked unavailable.
    pub max_restart_attempts: u32,
    /// Retry schedule for failed spawns.
    pub spawn_retry: RetryPolicy,
    /// Time allowed for all workers to stop on shutdown.
    #[serde(with = "serde_duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 5,
            spawn_retry: RetryPolicy::new(
                BackoffPolicy::exponential(Duration::from_millis(500), Duration::from_secs(5)),
                3,
            ),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Placeholder mode: workers start before the application is known and are
/// specialised later.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfig {
    pub enabled: bool,
    /// Runtimes to pre-warm.
    pub runtimes: Vec<String>,
}

/// Host heartbeat written to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    #[serde(with = "serde_duration_millis")]
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(10),
        }
    }
}

/// A function to load onto workers of its runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub name: String,
    /// Defaults to the name.
    pub function_id: Option<String>,
    pub runtime: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    /// Binding name to binding.
    pub bindings: HashMap<String, BindingConfig>,
}

/// A trigger or input/output binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    /// `in`, `out` or `inout`.
    pub direction: String,
}

impl FunctionConfig {
    /// Converts to the wire metadata.
    #[must_use]
    pub fn to_metadata(&self) -> RpcFunctionMetadata {
        let bindings = self
            .bindings
            .iter()
            .map(|(name, binding)| {
                let direction = match binding.direction.to_ascii_lowercase().as_str() {
                    "out" => nimbus_proto::rpc::binding_info::Direction::Out,
                    "inout" => nimbus_proto::rpc::binding_info::Direction::Inout,
                    _ => nimbus_proto::rpc::binding_info::Direction::In,
                };
                let info = BindingInfo {
                    r#type: binding.kind.clone(),
                    direction: direction.into(),
                    ..Default::default()
                };
                (name.clone(), info)
            })
            .collect();

        RpcFunctionMetadata {
            name: self.name.clone(),
            function_id: self.function_id.clone().unwrap_or_else(|| self.name.clone()),
            directory: self.directory.clone(),
            script_file: self.script_file.clone(),
            entry_point: self.entry_point.clone(),
            language: self.runtime.clone(),
            bindings,
            ..Default::default()
        }
    }
}

/// Serde helper for Duration as milliseconds.
pub(crate) mod serde_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
