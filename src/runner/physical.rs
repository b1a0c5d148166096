//! Physical Runner.
//!
//! Primary transport is system `ssh`/`scp` with per-command transient
//! connections; the secondary path power-cycles a board the orchestrator
//! already owns and falls back to a serial console for early-boot output
//! when the network transport is down.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{ArtifactBundle, Environment, FailureClass, TestCase};
use crate::runner::{RunOutcome, Runner, RunnerError, RunnerResult};

/// Abstracts board power control — implementations shell out to whatever
/// PDU/relay/IPMI tool the lab uses. The command template is supplied
/// per-call since each board in the pool carries its own
/// `power_control_command` in `Environment::metadata`.
#[async_trait]
pub trait PowerController: Send + Sync {
    async fn power_cycle(&self, board_id: &str, command_template: Option<&str>) -> RunnerResult<()>;
}

/// Runs the board's configured `power_control_command` template, replacing
/// `{action}` — the default implementation for `PhysicalEnvironmentConfig`.
pub struct CommandPowerController;

#[async_trait]
impl PowerController for CommandPowerController {
    async fn power_cycle(&self, board_id: &str, command_template: Option<&str>) -> RunnerResult<()> {
        let Some(template) = command_template else {
            return Ok(()); // no power control configured: best-effort reset via SSH only
        };
        let command = template.replace("{action}", "cycle");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .status()
            .await
            .map_err(|e| RunnerError::ResetFailed(format!("power control for {board_id}: {e}")))?;
        if !status.success() {
            return Err(RunnerError::ResetFailed(format!(
                "power control command exited with {status} for {board_id}"
            )));
        }
        Ok(())
    }
}

pub struct PhysicalRunner {
    /// Fallbacks used when an individual environment's metadata omits the
    /// field; set from the first configured `[[environments]]` physical
    /// entry so a single-board lab can configure everything once.
    default_ssh_target: Option<String>,
    default_ssh_key_path: Option<String>,
    default_serial_console: Option<String>,
    default_power_command: Option<String>,
    power: Box<dyn PowerController>,
}

impl PhysicalRunner {
    pub fn new(
        default_ssh_target: Option<String>,
        default_ssh_key_path: Option<String>,
        default_serial_console: Option<String>,
        default_power_command: Option<String>,
        power: Box<dyn PowerController>,
    ) -> Self {
        Self {
            default_ssh_target,
            default_ssh_key_path,
            default_serial_console,
            default_power_command,
            power,
        }
    }

    fn ssh_opts(&self, env: &Environment) -> Vec<String> {
        let mut opts = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=30".to_string(),
        ];
        let key = env.metadata.ssh_key_path.as_ref().or(self.default_ssh_key_path.as_ref());
        if let Some(key) = key {
            opts.push("-i".to_string());
            opts.push(shellexpand::tilde(key).into_owned());
        }
        opts
    }

    fn target(&self, env: &Environment) -> RunnerResult<String> {
        env.metadata
            .ip
            .clone()
            .or_else(|| self.default_ssh_target.clone())
            .ok_or_else(|| RunnerError::ExecFailed(format!("no SSH target configured for {}", env.env_id)))
    }

    fn serial_console<'a>(&'a self, env: &'a Environment) -> Option<&'a str> {
        env.metadata
            .serial_console
            .as_deref()
            .or(self.default_serial_console.as_deref())
    }

    async fn ssh_exec(&self, env: &Environment, target: &str, script: &str, timeout: Duration) -> RunnerResult<(i32, String, String)> {
        let mut command = tokio::process::Command::new("ssh");
        command.args(self.ssh_opts(env)).arg(target).arg(script);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| RunnerError::ExecFailed("ssh timed out".to_string()))?
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    /// Reads from the configured serial console when SSH is unreachable,
    /// scanning for a kernel-panic marker per §4.4's crash-detection
    /// contract. Best-effort: boards without `serial_console` configured
    /// simply can't surface this signal.
    async fn read_serial_for_panic(&self, env: &Environment) -> Option<FailureClass> {
        let console = self.serial_console(env)?;
        let (host, port) = console.split_once(':')?;
        let port: u16 = port.parse().ok()?;
        let stream = tokio::time::timeout(Duration::from_secs(5), tokio::net::TcpStream::connect((host, port)))
            .await
            .ok()?
            .ok()?;
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 8192];
        let mut stream = stream;
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .ok()?
            .ok()?;
        let text = String::from_utf8_lossy(&buf[..n]);
        if text.contains("Kernel panic") {
            Some(FailureClass::KernelPanic)
        } else {
            None
        }
    }
}

#[async_trait]
impl Runner for PhysicalRunner {
    async fn prepare(&self, env: &Environment, test: &TestCase) -> RunnerResult<()> {
        let target = self.target(env)?;
        let local = std::env::temp_dir().join(format!("marshal-{}-{}.sh", env.env_id, test.test_id));
        tokio::fs::write(&local, &test.script)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        let mut scp = tokio::process::Command::new("scp");
        scp.args(self.ssh_opts(env)).arg(&local).arg(format!("{target}:/tmp/run.sh"));
        let status = scp
            .status()
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        let _ = tokio::fs::remove_file(&local).await;
        if !status.success() {
            return Err(RunnerError::PrepareFailed(env.env_id.clone(), "scp upload failed".to_string()));
        }
        self.ssh_exec(env, &target, "chmod +x /tmp/run.sh", Duration::from_secs(30))
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
        let target = self.target(env)?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(RunOutcome::Cancelled),
            result = self.ssh_exec(env, &target, "/tmp/run.sh", timeout) => {
                match result {
                    Ok((exit_code, stdout, stderr)) => Ok(RunOutcome::Finished {
                        exit_code,
                        stdout,
                        stderr,
                        artifacts: ArtifactBundle::default(),
                    }),
                    Err(_) => {
                        // SSH unreachable mid-run: check serial for a panic
                        // marker before declaring a generic env failure.
                        if let Some(failure_class) = self.read_serial_for_panic(env).await {
                            Ok(RunOutcome::EnvironmentFailure {
                                failure_class,
                                detail: "kernel panic observed on serial console".to_string(),
                            })
                        } else {
                            tokio::time::sleep(grace).await;
                            Ok(RunOutcome::EnvironmentFailure {
                                failure_class: FailureClass::EnvFailure,
                                detail: "ssh transport lost during execution".to_string(),
                            })
                        }
                    }
                }
            }
        }
    }

    async fn collect_artifacts(&self, env: &Environment, _test: &TestCase) -> RunnerResult<ArtifactBundle> {
        let Ok(target) = self.target(env) else {
            return Ok(ArtifactBundle::default());
        };
        let local_dir = std::env::temp_dir().join(format!("marshal-{}-artifacts", env.env_id));
        let _ = tokio::fs::create_dir_all(&local_dir).await;
        let mut scp = tokio::process::Command::new("scp");
        scp.args(self.ssh_opts(env))
            .arg("-r")
            .arg(format!("{target}:/tmp/artifacts/."))
            .arg(&local_dir);
        let mut artifacts = Vec::new();
        if scp.status().await.map(|s| s.success()).unwrap_or(false) {
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
        let template = env
            .metadata
            .power_control_command
            .as_deref()
            .or(self.default_power_command.as_deref());
        match self.power.power_cycle(&env.env_id, template).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("power-cycle reset failed for {}: {e}", env.env_id);
                Ok(false)
            }
        }
    }
}
