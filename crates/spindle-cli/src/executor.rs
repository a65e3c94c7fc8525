//! Task execution for `spindle worker`.
//!
//! A lease is handed to a child process: the program configured for its
//! task name gets the lease JSON on stdin and answers with its exit code.
//! Prep and pull commands may also print one JSON [`PullRowReport`] per line
//! on stdout for the rows they handled; any other stdout line is logged.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use spindle_core::api::PullRowReport;
use spindle_core::domain::Lease;

/// EX_TEMPFAIL: the backend the task needs is unreachable.
pub const EXIT_RESOURCE_LOST: i32 = 75;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed(String),
    /// The task was not run; it goes back to its queue.
    ResourceLost,
}

/// What a finished command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: Outcome,
    /// Restore rows the command reported on.
    pub rows: Vec<PullRowReport>,
}

impl From<Outcome> for Execution {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            rows: Vec::new(),
        }
    }
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, lease: &Lease) -> Execution;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskCommand>,
}

/// Runs one configured command per task name.
///
/// ```toml
/// [tasks.copy]
/// program = "/usr/local/bin/archive-copy"
/// args = ["--verify"]
/// env = { HSI_RETRIES = "3" }
/// ```
pub struct CommandExecutor {
    config: ExecConfig,
}

impl CommandExecutor {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read exec config {}", path.display()))?;
        let config: ExecConfig =
            toml::from_str(&raw).with_context(|| format!("parse exec config {}", path.display()))?;
        Ok(Self::new(config))
    }

    pub fn handles(&self, task: &str) -> bool {
        self.config.tasks.contains_key(task)
    }

    async fn run(
        &self,
        command: &TaskCommand,
        lease: &Lease,
    ) -> Result<(Option<i32>, Vec<PullRowReport>)> {
        let input = serde_json::to_vec(lease).context("encode lease")?;
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {}", command.program))?;

        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A command that ignores its input may exit before reading it.
            match stdin.write_all(&input).await {
                Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.context("write lease to stdin")?;
        let output = output.context("wait for child")?;

        let rows = row_reports(&String::from_utf8_lossy(&output.stdout), &command.program);
        Ok((output.status.code(), rows))
    }
}

fn row_reports(stdout: &str, program: &str) -> Vec<PullRowReport> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(report) => Some(report),
            Err(_) => {
                debug!(%program, line, "command output");
                None
            }
        })
        .collect()
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute(&self, lease: &Lease) -> Execution {
        let Some(command) = self.config.tasks.get(lease.task.as_str()) else {
            return Outcome::Failed(format!("no command configured for task {}", lease.task)).into();
        };
        let (code, rows) = match self.run(command, lease).await {
            Ok(finished) => finished,
            Err(err) => {
                warn!(task = %lease.task, error = %err, "command failed to run");
                return Outcome::Failed(format!("{err:#}")).into();
            }
        };
        let outcome = match code {
            Some(0) => Outcome::Success,
            Some(EXIT_RESOURCE_LOST) => {
                debug!(task = %lease.task, "command reported resource lost");
                Outcome::ResourceLost
            }
            Some(code) => Outcome::Failed(format!("{} exited with {code}", command.program)),
            None => Outcome::Failed(format!("{} killed by signal", command.program)),
        };
        Execution { outcome, rows }
    }
}
