//! Executor boundary: how claimed items actually get worked.
//!
//! The download/upload/scrape implementations live outside this crate; the
//! worker loop only sees [`Executor`]. [`CommandExecutor`] adapts an
//! external program to that interface: the item lands in a scratch
//! directory as `item.json`, the program runs there, and `result.json`
//! (if written) becomes the stage payload.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Stage, WorkItem};

/// Exit code an executor command uses to signal "try again later"
/// (sysexits EX_TEMPFAIL).
const EXIT_TEMPFAIL: i32 = 75;

/// Why an execution attempt produced no payload.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecError {
    /// Worth retrying after a backoff (network trouble, rate limits).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Retrying cannot help; the item should be reported failed.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// This worker cannot handle the item at all; release the lease so
    /// another worker may pick it up.
    #[error("unclaimable: {0}")]
    Unclaimable(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Perform the stage's work for one item. A payload of `None` still
    /// counts as success. Implementations should not panic; the worker
    /// loop contains panics regardless.
    async fn execute(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError>;
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ExecutorFile {
    executor: ExecutorSpec,
}

/// Declarative description of an executor command.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSpec {
    /// Program to run for each item.
    pub command: PathBuf,

    /// Wall-clock budget per item, after which the attempt counts as
    /// transient (a stuck browser session, a hung transfer).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Parent directory for per-item scratch dirs. Defaults to the
    /// system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    600
}

impl ExecutorSpec {
    /// Load an executor spec from a TOML file with an `[executor]` table.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read executor spec {}: {e}", path.display())))?;
        let file: ExecutorFile = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("bad executor spec {}: {e}", path.display())))?;
        Ok(file.executor)
    }

    fn scratch_base(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("fetchq"))
    }
}

/// Runs an external command per item.
pub struct CommandExecutor {
    spec: ExecutorSpec,
    stage: Stage,
}

impl CommandExecutor {
    pub fn new(spec: ExecutorSpec, stage: Stage) -> Self {
        Self { spec, stage }
    }

    async fn run_command(
        &self,
        dir: &Path,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError> {
        // Resolve relative command paths against the process CWD, not the
        // scratch dir. Command::new + current_dir resolves relative paths
        // after chdir, which would look in the scratch dir instead.
        let command = if self.spec.command.is_relative() {
            std::env::current_dir()
                .map_err(|e| ExecError::Transient(format!("cannot resolve cwd: {e}")))?
                .join(&self.spec.command)
        } else {
            self.spec.command.clone()
        };

        debug!(
            item_id = %item.id,
            command = %command.display(),
            dir = %dir.display(),
            "running executor command"
        );

        let mut cmd = Command::new(&command);
        cmd.current_dir(dir)
            .env("FETCHQ_WORK_DIR", dir)
            .env("FETCHQ_ITEM_ID", &item.id)
            .env("FETCHQ_STAGE", self.stage.as_str())
            // A timed-out attempt must not leave the child running.
            .kill_on_drop(true);

        let status = match tokio::time::timeout(
            Duration::from_secs(self.spec.timeout_secs),
            cmd.status(),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                // Spawn failure (missing binary, permissions) is a property
                // of this worker, not of the item; let another worker try.
                return Err(ExecError::Unclaimable(format!(
                    "cannot run {}: {e}",
                    command.display()
                )));
            }
            Err(_) => {
                return Err(ExecError::Transient(format!(
                    "timed out after {}s",
                    self.spec.timeout_secs
                )));
            }
        };

        match status.code() {
            Some(0) => {
                let result_path = dir.join("result.json");
                match tokio::fs::read_to_string(&result_path).await {
                    Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                        ExecError::Permanent(format!("bad result.json: {e}"))
                    }),
                    Err(_) => Ok(None),
                }
            }
            Some(EXIT_TEMPFAIL) => Err(ExecError::Transient("command reported tempfail".into())),
            Some(code) => Err(ExecError::Permanent(format!("command exited with {code}"))),
            None => Err(ExecError::Transient("command killed by signal".into())),
        }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
    ) -> std::result::Result<Option<serde_json::Value>, ExecError> {
        let dir = self.spec.scratch_base().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ExecError::Transient(format!("cannot create scratch dir: {e}")))?;

        let item_json = serde_json::to_string_pretty(item)
            .map_err(|e| ExecError::Permanent(format!("serialize work item: {e}")))?;
        if let Err(e) = tokio::fs::write(dir.join("item.json"), item_json).await {
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(ExecError::Transient(format!("cannot write item.json: {e}")));
        }

        let result = self.run_command(&dir, item).await;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(dir = %dir.display(), "scratch cleanup failed: {e}");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parses_with_defaults() {
        let spec: ExecutorFile = toml::from_str(
            r#"
            [executor]
            command = "/usr/local/bin/fetch-book"
            "#,
        )
        .unwrap();
        assert_eq!(spec.executor.command, PathBuf::from("/usr/local/bin/fetch-book"));
        assert_eq!(spec.executor.timeout_secs, 600);
        assert!(spec.executor.scratch_dir.is_none());
    }

    #[test]
    fn spec_parses_overrides() {
        let spec: ExecutorFile = toml::from_str(
            r#"
            [executor]
            command = "scripts/upload.sh"
            timeout_secs = 120
            scratch_dir = "/var/tmp/fetchq"
            "#,
        )
        .unwrap();
        assert_eq!(spec.executor.timeout_secs, 120);
        assert_eq!(
            spec.executor.scratch_dir,
            Some(PathBuf::from("/var/tmp/fetchq"))
        );
    }
}
