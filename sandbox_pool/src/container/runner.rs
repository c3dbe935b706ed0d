use crate::{Error, Result};
use async_trait::async_trait;

/// Runs the container engine CLI. Swapped for a scripted fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CmdOutput>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The engine reported that the referenced container/image does not exist.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_ascii_lowercase();
        stderr.contains("no such container")
            || stderr.contains("no such object")
            || stderr.contains("no such image")
    }
}

pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(program = %program, cmd = ?args.first()))]
    async fn run(&self, program: &str, args: &[String]) -> Result<CmdOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.kill_on_drop(false);
        let out = cmd
            .output()
            .await
            .map_err(|e| Error::backend("spawn command", e))?;
        Ok(CmdOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }
}
