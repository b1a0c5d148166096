//! Process Runner.
//!
//! Each test runs as a child of the orchestrator's own process, via the
//! configured shell, with upload/download as local file copies relative to
//! a working directory. No isolation; the fastest path for local iteration.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{ArtifactBundle, ArtifactRef, Environment, TestCase};
use crate::runner::{RunOutcome, Runner, RunnerError, RunnerResult};

pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new(shell: String) -> Self {
        Self { shell }
    }

    fn working_dir(&self, env: &Environment) -> PathBuf {
        std::env::temp_dir().join("marshal").join(&env.env_id)
    }

    async fn script_path(&self, env: &Environment, test: &TestCase) -> PathBuf {
        self.working_dir(env).join(format!("{}.sh", test.test_id))
    }

    /// Sends SIGTERM (by shelling out to `kill`, matching this runner's
    /// subprocess-oriented style elsewhere) and gives the child `grace` to
    /// exit on its own before escalating to SIGKILL.
    async fn graceful_then_forced_kill(child: &mut tokio::process::Child, grace: Duration) {
        if let Some(pid) = child.id() {
            let _ = tokio::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn prepare(&self, env: &Environment, test: &TestCase) -> RunnerResult<()> {
        let dir = self.working_dir(env);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        let path = self.script_path(env, test).await;
        tokio::fs::write(&path, &test.script)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&path)
                .await
                .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?
                .permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&path, perms)
                .await
                .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        env: &Environment,
        test: &TestCase,
        timeout: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        let path = self.script_path(env, test).await;
        let mut command = tokio::process::Command::new(&self.shell);
        command.arg(&path).current_dir(self.working_dir(env));
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                Self::graceful_then_forced_kill(&mut child, grace).await;
                stdout_task.abort();
                stderr_task.abort();
                Ok(RunOutcome::Cancelled)
            }
            result = tokio::time::timeout(timeout, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = stdout_task.await.unwrap_or_default();
                        let stderr = stderr_task.await.unwrap_or_default();
                        Ok(RunOutcome::Finished {
                            exit_code: status.code().unwrap_or(-1),
                            stdout: String::from_utf8_lossy(&stdout).to_string(),
                            stderr: String::from_utf8_lossy(&stderr).to_string(),
                            artifacts: ArtifactBundle::default(),
                        })
                    }
                    Ok(Err(e)) => Err(RunnerError::ExecFailed(e.to_string())),
                    Err(_) => {
                        // Timeout elapsed: SIGTERM, then SIGKILL if the
                        // process hasn't exited within `grace` (§4.4 point 3,
                        // the graceful-then-forced stop contract).
                        Self::graceful_then_forced_kill(&mut child, grace).await;
                        stdout_task.abort();
                        stderr_task.abort();
                        Ok(RunOutcome::TimedOut { artifacts: ArtifactBundle::default() })
                    }
                }
            }
        }
    }

    async fn collect_artifacts(&self, env: &Environment, test: &TestCase) -> RunnerResult<ArtifactBundle> {
        let artifact_dir = self.working_dir(env).join(format!("{}-artifacts", test.test_id));
        let mut artifacts = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&artifact_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                    use sha2::{Digest, Sha256};
                    let hash = Sha256::digest(&bytes);
                    artifacts.push(ArtifactRef {
                        name: entry.file_name().to_string_lossy().to_string(),
                        content_hash_or_uri: format!("sha256:{hash:x}"),
                    });
                }
            }
        }
        Ok(ArtifactBundle { artifacts })
    }

    async fn reset(&self, env: &Environment) -> RunnerResult<bool> {
        let dir = self.working_dir(env);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("process runner failed to clean {}: {e}", dir.display());
                return Ok(false);
            }
        }
        Ok(true)
    }
}
