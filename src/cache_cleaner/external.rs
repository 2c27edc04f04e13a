use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

use super::errors::{CategoryCleanupFailure, ToolError};
use super::inventory::package_footprint;
use super::scanner::measure_tree;
use super::types::{CacheEntry, Footprint};
use crate::config::EngineConfig;
use crate::ops::KeyedGate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        ToolCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn prefixed(self, prefix: &[&str]) -> Self {
        let mut parts: Vec<String> = prefix.iter().map(|p| p.to_string()).collect();
        parts.push(self.program);
        parts.extend(self.args);
        let program = parts.remove(0);
        ToolCommand {
            program,
            args: parts,
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How host commands must be launched from this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Running inside a flatpak sandbox: host tools go through `flatpak-spawn --host`.
    pub sandboxed: bool,
    /// Not root and elevation allowed: privileged commands go through `pkexec`.
    pub elevate: bool,
}

impl HostEnvironment {
    pub fn detect(config: &EngineConfig) -> Self {
        HostEnvironment {
            sandboxed: Path::new("/.flatpak-info").exists(),
            elevate: config.allow_elevation && !is_root(),
        }
    }

    pub fn command(&self, program: &str, args: &[&str], privileged: bool) -> ToolCommand {
        let mut command = ToolCommand::new(program, args);
        if privileged && self.elevate {
            command = command.prefixed(&["pkexec"]);
        }
        if self.sandboxed {
            command = command.prefixed(&["flatpak-spawn", "--host"]);
        }
        command
    }
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Launches external commands. Swapped for a fake in tests.
pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ToolError>>;
}

#[derive(Debug, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run<'a>(&'a self, command: &'a ToolCommand) -> BoxFuture<'a, Result<ToolOutput, ToolError>> {
        async move {
            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args);
            // Dropping the future on timeout must not leave the child behind.
            cmd.kill_on_drop(true);
            let output = cmd.output().await.map_err(|source| ToolError::Spawn {
                command: command.to_string(),
                source,
            })?;
            Ok(ToolOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        .boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExit {
    pub command: String,
    pub code: Option<i32>,
    pub success: bool,
}

/// What is left of one affected entry after the command(s) ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Residual {
    pub path: PathBuf,
    /// Bytes that disappeared relative to the scanned size.
    pub reclaimed: u64,
    pub still_present: bool,
}

/// Effect of running a category's command(s) on the entries it covers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub exits: Vec<ToolExit>,
    pub failure: Option<CategoryCleanupFailure>,
    pub residuals: Vec<Residual>,
    pub bytes_reclaimed_estimate: u64,
}

impl ToolInvocation {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Runs package-manager style maintenance commands with a timeout, one
/// invocation per distinct command line at a time.
pub struct ExternalToolInvoker {
    runner: Arc<dyn ToolRunner>,
    gate: KeyedGate,
    timeout: Duration,
}

impl ExternalToolInvoker {
    pub fn new(runner: Arc<dyn ToolRunner>, timeout: Duration) -> Self {
        ExternalToolInvoker {
            runner,
            gate: KeyedGate::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run_gated(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        let key = command.to_string();
        let _turn = self.gate.enter(&key).await;
        log::debug!("running `{}`", key);
        match timeout(self.timeout, self.runner.run(command)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("`{}` timed out after {:?}", key, self.timeout);
                Err(ToolError::TimedOut {
                    command: key,
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Runs an inventory command and returns its stdout; a non-zero exit is an error.
    pub async fn inventory(&self, command: &ToolCommand) -> Result<String, ToolError> {
        let output = self.run_gated(command).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(ToolError::Failed {
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    pub async fn invoke(&self, command: &ToolCommand, affected: &[CacheEntry]) -> ToolInvocation {
        self.invoke_all(std::slice::from_ref(command), affected, Footprint::Path)
            .await
    }

    /// Runs every command in order, then measures what is left of `affected`.
    /// The first failure is kept; later commands still run.
    pub async fn invoke_all(
        &self,
        commands: &[ToolCommand],
        affected: &[CacheEntry],
        footprint: Footprint,
    ) -> ToolInvocation {
        let mut invocation = ToolInvocation::default();
        for command in commands {
            let outcome = match self.run_gated(command).await {
                Ok(output) if output.success() => {
                    invocation.exits.push(ToolExit {
                        command: command.to_string(),
                        code: output.code,
                        success: true,
                    });
                    Ok(())
                }
                Ok(output) => {
                    invocation.exits.push(ToolExit {
                        command: command.to_string(),
                        code: output.code,
                        success: false,
                    });
                    Err(ToolError::Failed {
                        command: command.to_string(),
                        code: output.code,
                        stderr: output.stderr.trim().to_string(),
                    })
                }
                Err(err) => Err(err),
            };
            if let Err(err) = outcome {
                log::warn!("category command failed: {}", err);
                if invocation.failure.is_none() {
                    invocation.failure = Some(err.into());
                }
            }
        }

        let entries = affected.to_vec();
        let residuals =
            tokio::task::spawn_blocking(move || residual_savings(&entries, footprint))
                .await
                .unwrap_or_default();
        invocation.bytes_reclaimed_estimate = residuals.iter().map(|r| r.reclaimed).sum();
        invocation.residuals = residuals;
        invocation
    }
}

fn residual_savings(entries: &[CacheEntry], footprint: Footprint) -> Vec<Residual> {
    entries
        .iter()
        .map(|entry| {
            let (remaining, still_present) = match std::fs::symlink_metadata(&entry.path) {
                // dpkg drops the list with the package; while it exists so do the files.
                Ok(_) if footprint == Footprint::PackageFiles => {
                    (package_footprint(&entry.path), true)
                }
                Ok(md) if md.is_dir() => (measure_tree(&entry.path).size, true),
                Ok(md) => (md.len(), true),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (0, false),
                Err(_) => (entry.size, true),
            };
            Residual {
                path: entry.path.clone(),
                reclaimed: entry.size.saturating_sub(remaining),
                still_present,
            }
        })
        .collect()
}
