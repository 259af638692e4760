//! Worker process command lines.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use super::description::WorkerDescription;
use crate::pair::WorkerId;

/// Connection arguments the host appends to every worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub host: String,
    pub port: u16,
    pub worker_id: WorkerId,
    pub request_id: String,
    pub max_message_length: usize,
}

/// A fully resolved worker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    /// Builds `<exe> <arguments> <worker path> <worker arguments> <host args>`.
    #[must_use]
    pub fn build(description: &WorkerDescription, worker: &WorkerArgs) -> Self {
        let mut args = description.arguments.clone();
        if let Some(path) = &description.default_worker_path {
            args.push(path.clone());
        }
        args.extend(description.worker_arguments.iter().cloned());
        args.extend([
            "--host".to_owned(),
            worker.host.clone(),
            "--port".to_owned(),
            worker.port.to_string(),
            "--workerId".to_owned(),
            worker.worker_id.to_string(),
            "--requestId".to_owned(),
            worker.request_id.clone(),
            "--grpcMaxMessageLength".to_owned(),
            worker.max_message_length.to_string(),
        ]);

        Self {
            program: description.default_executable_path.clone(),
            args,
            working_dir: description.worker_directory.clone(),
            env: description.environment.clone(),
        }
    }

    /// Creates a tokio command with piped output and no stdin.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command
    }

    /// File name of the executable, used in exit messages.
    #[must_use]
    pub fn executable_name(&self) -> &str {
        std::path::Path::new(&self.program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.program)
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
