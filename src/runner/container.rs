//! Container Runner.
//!
//! One container per environment, commands run via `docker exec`,
//! upload/download via tar archives through the Docker API. A fresh
//! container per attempt means `reset` (the CLEANUP transition) can
//! simply destroy-and-recreate rather than needing in-container cleanup
//! logic, preserving the network-restriction guarantee between runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::model::{ArtifactBundle, Environment, TestCase};
use crate::runner::{RunOutcome, Runner, RunnerError, RunnerResult};

pub struct ContainerRunner {
    docker: Docker,
    image: String,
    network_mode: String,
    /// Maps `env_id -> currently-running container id`, populated by
    /// `prepare` and torn down by `reset`.
    containers: Mutex<HashMap<String, String>>,
}

impl ContainerRunner {
    pub fn new(docker: Docker, image: String, network_mode: String) -> Self {
        Self {
            docker,
            image,
            network_mode,
            containers: Mutex::new(HashMap::new()),
        }
    }

    async fn container_id(&self, env: &Environment) -> RunnerResult<String> {
        self.containers
            .lock()
            .await
            .get(&env.env_id)
            .cloned()
            .ok_or_else(|| RunnerError::ExecFailed(format!("no container prepared for {}", env.env_id)))
    }
}

#[async_trait]
impl Runner for ContainerRunner {
    async fn prepare(&self, env: &Environment, test: &TestCase) -> RunnerResult<()> {
        let name = format!("marshal-{}-{}", env.env_id, test.test_id);
        let host_config = bollard::models::HostConfig {
            network_mode: Some(self.network_mode.clone()),
            memory: Some((env.capacity.memory_mb * 1024 * 1024) as i64),
            cpu_period: Some(100_000),
            cpu_quota: Some((env.capacity.cpu as i64) * 100_000),
            ..Default::default()
        };
        let config = ContainerConfig {
            image: Some(self.image.clone()),
            host_config: Some(host_config),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            tty: Some(true),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;

        let tar_data = {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_size(test.script.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "run.sh", test.script.as_slice())
                .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;
            builder
                .into_inner()
                .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?
        };
        self.docker
            .upload_to_container(
                &response.id,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                tar_data.into(),
            )
            .await
            .map_err(|e| RunnerError::PrepareFailed(env.env_id.clone(), e.to_string()))?;

        self.containers.lock().await.insert(env.env_id.clone(), response.id);
        Ok(())
    }

    async fn execute(
        &self,
        env: &Environment,
        _test: &TestCase,
        timeout: Duration,
        grace: Duration,
        cancel: CancellationToken,
    ) -> RunnerResult<RunOutcome> {
        let container_id = self.container_id(env).await?;
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), "/run.sh".to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&container_id, exec_options)
            .await
            .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;

        let run = async {
            let output = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } = output {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
                        Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                        _ => {}
                    }
                }
            }
            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| RunnerError::ExecFailed(e.to_string()))?;
            Ok::<_, RunnerError>((inspect.exit_code.unwrap_or(-1) as i32, stdout, stderr))
        };

        tokio::select! {
            _ = cancel.cancelled() => Ok(RunOutcome::Cancelled),
            result = tokio::time::timeout(timeout, run) => {
                match result {
                    Ok(Ok((exit_code, stdout, stderr))) => Ok(RunOutcome::Finished {
                        exit_code,
                        stdout,
                        stderr,
                        artifacts: ArtifactBundle::default(),
                    }),
                    Ok(Err(e)) => Err(e),
                    Err(_) => {
                        tokio::time::sleep(grace).await;
                        Ok(RunOutcome::TimedOut { artifacts: ArtifactBundle::default() })
                    }
                }
            }
        }
    }

    async fn collect_artifacts(&self, env: &Environment, _test: &TestCase) -> RunnerResult<ArtifactBundle> {
        let container_id = self.container_id(env).await?;
        let mut stream = self.docker.download_from_container(
            &container_id,
            Some(bollard::container::DownloadFromContainerOptions {
                path: "/artifacts".to_string(),
            }),
        );
        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => tar_data.extend_from_slice(&bytes),
                Err(_) => return Ok(ArtifactBundle::default()), // /artifacts never created: not an error
            }
        }
        let mut artifacts = Vec::new();
        let mut archive = tar::Archive::new(tar_data.as_slice());
        if let Ok(entries) = archive.entries() {
            for mut entry in entries.flatten() {
                let Ok(path) = entry.header().path().map(|p| p.to_string_lossy().to_string()) else {
                    continue;
                };
                use sha2::{Digest, Sha256};
                use std::io::Read;
                let mut hasher = Sha256::new();
                let mut buf = [0u8; 8192];
                loop {
                    let n = entry
                        .read(&mut buf)
                        .map_err(|e| RunnerError::ExecFailed(format!("reading artifact {path}: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                artifacts.push(crate::model::ArtifactRef {
                    name: path,
                    content_hash_or_uri: format!("sha256:{:x}", hasher.finalize()),
                });
            }
        }
        Ok(ArtifactBundle { artifacts })
    }

    async fn reset(&self, env: &Environment) -> RunnerResult<bool> {
        let Some(container_id) = self.containers.lock().await.remove(&env.env_id) else {
            return Ok(true);
        };
        match self
            .docker
            .remove_container(
                &container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("failed to remove container {container_id} for {}: {e}", env.env_id);
                Ok(false)
            }
        }
    }
}
