//! VM Runner.
//!
//! Boots (or revert-snapshots) a VM image driven by an external
//! `driver_command` (e.g. a qemu/firecracker wrapper script).
//! `Mutex<HashMap<String, Arc<OnceCell<String>>>>` tracks in-flight
//! snapshot boots so two concurrent allocations of the same image don't
//! race each other into booting it twice.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{ArtifactBundle, Environment, TestCase};
use crate::runner::{RunOutcome, Runner, RunnerError, RunnerResult};

#[derive(Clone)]
struct BootInfo {
    ssh_target: String,
}

pub struct VmRunner {
    /// External command that boots/reverts/destroys a snapshot; invoked as
    /// `{driver_command} boot <image> <env_id>`, `... revert <env_id>`,
    /// `... destroy <env_id>`. `boot`/`revert` print an SSH target
    /// (`user@host`) on stdout once the guest is reachable.
    driver_command: String,
    image: String,
    boots: Mutex<HashMap<String, Arc<OnceCell<BootInfo>>>>,
}

impl VmRunner {
    pub fn new(driver_command: String, image: String) -> Self {
        Self {
            driver_command,
            image,
            boots: Mutex::new(HashMap::new()),
        }
    }

    async fn run_driver(&self, args: &[&str]) -> RunnerResult<String> {
        let output = tokio::process::Command::new(&self.driver_command)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(RunnerError::ExecFailed(format!(
                "driver command {args:?} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn boot_info(&self, env_id: &str) -> RunnerResult<BootInfo> {
        let cell = {
            let mut boots = self.boots.lock().await;
            boots.entry(env_id.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };
        cell.get_or_try_init(|| async {
            let ssh_target = self.run_driver(&["boot", &self.image, env_id]).await?;
            Ok::<_, RunnerError>(BootInfo { ssh_target })
        })
        .await
        .cloned()
    }

    async fn ssh_exec(&self, ssh_target: &str, script: &str, timeout: Duration) -> RunnerResult<(i32, String, String)> {
        let mut command = tokio::process::Command::new("ssh");
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ConnectTimeout=30")
            .arg(ssh_target)
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| RunnerError::ExecFailed("timed out waiting for ssh".to_string()))?
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

#[async_trait]
impl Runner for VmRunner {
    async fn prepare(&self, env: &Environment, test: &TestCase) -> RunnerResult<()> {
        let boot = self.boot_info(&env.env_id).await?;
        let local = std::env::temp_dir().join(format!("marshal-{}-{}.sh", env.env_id, test.test_id));
        tokio::fs::write(&local, &test.script)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        let status = tokio::process::Command::new("scp")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&local)
            .arg(format!("{}:/tmp/run.sh", boot.ssh_target))
            .status()
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        let _ = tokio::fs::remove_file(&local).await;
        if !status.success() {
            return Err(RunnerError::PrepareFailed(env.env_id.clone(), "scp upload failed".to_string()));
        }
        self.ssh_exec(&boot.ssh_target, "chmod +x /tmp/run.sh", Duration::from_secs(30))
            .await
            .map(|_| ())
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))
    }

    async fn execute(
        &self,
        env: &Environment,
        _test: &TestCase,
        timeout: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        let boot = self.boot_info(&env.env_id).await?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(RunOutcome::Cancelled),
            result = self.ssh_exec(&boot.ssh_target, "/tmp/run.sh", timeout) => {
                match result {
                    Ok((exit_code, stdout, stderr)) => Ok(RunOutcome::Finished {
                        exit_code,
                        stdout,
                        stderr,
                        artifacts: ArtifactBundle::default(),
                    }),
                    Err(e) if e.to_string().contains("timed out") => {
                        tokio::time::sleep(grace).await;
                        Ok(RunOutcome::TimedOut { artifacts: ArtifactBundle::default() })
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn collect_artifacts(&self, env: &Environment, _test: &TestCase) -> RunnerResult<ArtifactBundle> {
        let Some(boot) = self.boots.lock().await.get(&env.env_id).and_then(|c| c.get().cloned()) else {
            return Ok(ArtifactBundle::default());
        };
        let local_dir: PathBuf = std::env::temp_dir().join(format!("marshal-{}-artifacts", env.env_id));
        let _ = tokio::fs::create_dir_all(&local_dir).await;
        let status = tokio::process::Command::new("scp")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-r")
            .arg(format!("{}:/tmp/artifacts/.", boot.ssh_target))
            .arg(&local_dir)
            .status()
            .await;
        let mut artifacts = Vec::new();
        if status.map(|s| s.success()).unwrap_or(false) {
            if let Ok(mut entries) = tokio::fs::read_dir(&local_dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                        use sha2::{Digest, Sha256};
                        let hash = Sha256::digest(&bytes);
                        artifacts.push(crate::model::ArtifactRef {
                            name: entry.file_name().to_string_lossy().to_string(),
                            content_hash_or_uri: format!("sha256:{hash:x}"),
                        });
                    }
                }
            }
        }
        Ok(ArtifactBundle { artifacts })
    }

    async fn reset(&self, env: &Environment) -> RunnerResult<bool> {
        let mut boots = self.boots.lock().await;
        boots.remove(&env.env_id);
        drop(boots);
        match self.run_driver(&["revert", &env.env_id]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("vm revert failed for {}: {e}", env.env_id);
                Ok(false)
            }
        }
    }
}
