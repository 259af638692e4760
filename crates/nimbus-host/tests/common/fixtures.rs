//! Test fixtures for host integration tests.

use std::time::Duration;

use nimbus_host::config::FunctionConfig;
use nimbus_host::{
    BackoffPolicy, ChannelConfig, HostConfig, InvocationInput, ProcessConfig, RetryPolicy,
    WorkerDescription,
};

/// A Node worker description with no platform restrictions.
pub fn node_worker() -> WorkerDescription {
    WorkerDescription {
        language: "node".into(),
        extensions: vec![".js".into()],
        default_executable_path: "node".into(),
        default_worker_path: Some("worker.js".into()),
        ..Default::default()
    }
}

/// A function named `name` for `runtime`.
pub fn function(name: &str, runtime: &str) -> FunctionConfig {
    FunctionConfig {
        name: name.into(),
        runtime: runtime.into(),
        script_file: format!("{name}/index.js"),
        ..Default::default()
    }
}

/// Short timeouts so failures surface quickly.
pub fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        init_timeout: Duration::from_secs(2),
        load_timeout: Duration::from_secs(2),
        invocation_timeout: Duration::from_secs(5),
        cancel_grace_period: Duration::from_millis(50),
        terminate_grace_period: Duration::from_millis(50),
        env_reload_timeout: Duration::from_secs(2),
    }
}

/// Node worker with function `F`, fast timeouts and two restarts.
pub fn host_config() -> HostConfig {
    HostConfig {
        channel: fast_channel(),
        process: ProcessConfig {
            max_restart_attempts: 2,
            spawn_retry: RetryPolicy::new(
                BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(50)),
                3,
            ),
            shutdown_timeout: Duration::from_secs(1),
        },
        workers: vec![node_worker()],
        functions: vec![function("F", "node")],
        ..Default::default()
    }
}

/// Invocation of `F` with one string input.
pub fn echo(value: &str) -> InvocationInput {
    InvocationInput::new("F").with_input("req", value)
}
