use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, Pid, ProcessesToUpdate, System};
use tokio::{process::Command, sync::oneshot};

use crate::{
    config::models::ExecSpec,
    ports::process::{
        LaunchedProcess, ModuleLauncher, ProcessError, ProcessTable, ProcessUsage, SourceFetcher,
    },
};

/// Output of a launched module, relative to its working directory
pub const MODULE_LOG_FILE: &str = "log.log";

/// Process table lookups through `sysinfo`. Each call refreshes only the asked pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProcessTable;

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self
    }
}

fn refresh_one(system: &mut System, pid: Pid) {
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
}

#[async_trait]
impl ProcessTable for SysinfoProcessTable {
    async fn is_running(&self, pid: u32) -> bool {
        tokio::task::spawn_blocking(move || {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();
            refresh_one(&mut system, pid);
            system.process(pid).is_some()
        })
        .await
        .unwrap_or(false)
    }

    async fn usage(&self, pid: u32) -> Option<ProcessUsage> {
        let pid_key = Pid::from_u32(pid);
        let mut system = tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            refresh_one(&mut system, pid_key);
            system
        })
        .await
        .ok()?;
        system.process(pid_key)?;

        // cpu usage is a delta between two refreshes
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        let system = tokio::task::spawn_blocking(move || {
            refresh_one(&mut system, pid_key);
            system
        })
        .await
        .ok()?;

        system.process(pid_key).map(|process| ProcessUsage {
            pid,
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

/// Directory a module runs in: its `bin`, or the hub's working directory.
pub fn working_dir(exec: &ExecSpec) -> PathBuf {
    if exec.bin.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(&exec.bin)
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Runs `main` through the platform shell inside the module's working directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellLauncher;

impl ShellLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ModuleLauncher for ShellLauncher {
    async fn launch(&self, name: &str, exec: &ExecSpec) -> Result<LaunchedProcess, ProcessError> {
        let dir = working_dir(exec);
        let log_path = dir.join(MODULE_LOG_FILE);
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| ProcessError::Launch(format!("{}: {e}", log_path.display())))?
            .into_std()
            .await;
        let log_err = log.try_clone()?;

        let mut child = shell(&exec.main)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| ProcessError::Launch(format!("'{}': {e}", exec.main)))?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Launch(format!("'{}' exited immediately", exec.main)))?;
        tracing::info!(module = %name, pid, "Launched '{}' in {}", exec.main, dir.display());

        let (tx, rx) = oneshot::channel();
        let module = name.to_string();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(module = %module, "Failed to wait for pid {}: {}", pid, e);
                    None
                }
            };
            tracing::info!(module = %module, pid, "Process exited with {:?}", code);
            let _ = tx.send(code);
        });

        Ok(LaunchedProcess {
            pid,
            exited: Some(rx),
        })
    }
}

/// Fetches remote module sources with git into `mods_dir/<name>`.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    mods_dir: PathBuf,
}

impl GitFetcher {
    pub fn new(mods_dir: impl Into<PathBuf>) -> Self {
        Self {
            mods_dir: mods_dir.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<(), ProcessError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ProcessError::Fetch(format!("git {}: {e}", args.join(" "))))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProcessError::Fetch(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn fetch(&self, name: &str, exec: &ExecSpec) -> Result<PathBuf, ProcessError> {
        tokio::fs::create_dir_all(&self.mods_dir).await?;
        let checkout = self.mods_dir.join(name);

        if tokio::fs::try_exists(checkout.join(".git")).await? {
            tracing::info!(module = %name, "Updating checkout in {}", checkout.display());
            self.git(&checkout, &["pull", "--ff-only"]).await?;
        } else {
            tracing::info!(module = %name, "Cloning {} into {}", exec.src, checkout.display());
            self.git(&self.mods_dir, &["clone", &exec.src, name]).await?;
        }
        Ok(checkout)
    }
}
