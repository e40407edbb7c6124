use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use log::info;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid worker program {path:?}: {reason}")]
    InvalidProgram { path: PathBuf, reason: &'static str },
    #[error("worker directory {path:?} is not usable: {source}")]
    WorkingDir { path: PathBuf, source: io::Error },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
}

/// A fully resolved worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Creates OS processes. Returns the pid of the spawned process.
pub trait ProcessHost: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> Result<u32, LaunchError>;
}

/// Spawns real processes and lets them run detached.
///
/// The child handle is dropped right away; tokio reaps it once it exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessHost;

impl ProcessHost for OsProcessHost {
    fn spawn(&self, command: &LaunchCommand) -> Result<u32, LaunchError> {
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                command: command.to_string(),
                source,
            })?;
        Ok(child.id().unwrap_or_default())
    }
}

/// Starts worker instances from a program path.
#[derive(Clone)]
pub struct WorkerLauncher {
    host: Arc<dyn ProcessHost>,
    prefix: Vec<String>,
}

impl WorkerLauncher {
    /// `prefix` is prepended to the program's file name, e.g. `["java", "-jar"]`.
    /// With an empty prefix the program is executed directly.
    pub fn new(host: Arc<dyn ProcessHost>, prefix: Vec<String>) -> Self {
        Self { host, prefix }
    }

    pub fn with_os_host(prefix: Vec<String>) -> Self {
        Self::new(Arc::new(OsProcessHost), prefix)
    }

    pub fn command_for(&self, program: &Path) -> Result<LaunchCommand, LaunchError> {
        let file_name = program
            .file_name()
            .ok_or_else(|| LaunchError::InvalidProgram {
                path: program.to_path_buf(),
                reason: "path has no file name",
            })?;
        let dir = match program.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let working_dir = dir
            .canonicalize()
            .map_err(|source| LaunchError::WorkingDir { path: dir, source })?;

        let command = match self.prefix.split_first() {
            Some((head, rest)) => {
                let mut args = rest.to_vec();
                args.push(file_name.to_string_lossy().into_owned());
                LaunchCommand {
                    program: PathBuf::from(head),
                    args,
                    working_dir,
                }
            }
            None => LaunchCommand {
                program: working_dir.join(file_name),
                args: Vec::new(),
                working_dir,
            },
        };
        Ok(command)
    }

    pub fn launch(&self, program: &Path) -> Result<u32, LaunchError> {
        let command = self.command_for(program)?;
        info!(
            "Launching worker instance : {command} (in {})",
            command.working_dir.display()
        );
        self.host.spawn(&command)
    }
}
