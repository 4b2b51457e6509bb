// Docker-backed sandbox runtime using Bollard

use crate::error::SandboxError;
use crate::sandbox::{
    append_capped, split_path, ExecOutput, Sandbox, SandboxRuntime, SandboxSpec, WORK_DIR,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Fork bombs stop here
const PIDS_LIMIT: i64 = 128;

/// Docker-based sandbox runtime
///
/// **Sandbox rules:**
/// 1. One long-lived container per sandbox, kept alive by an idle process
/// 2. Network disabled, memory (and swap) capped, CPU share capped
/// 3. Files are injected through the archive upload API, never through a shell
/// 4. Every exec runs under a hard wall-clock deadline
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Engine(format!("Failed to connect to Docker daemon: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::Engine(format!("Docker daemon did not answer ping: {}", e)))?;

        Ok(Self { docker })
    }
}

/// Build a single-file tar archive for `upload_to_container`
pub fn build_archive(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut archive);
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, content)?;
        builder.finish()?;
    }
    Ok(archive)
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    /// **Image Cache Health Check:**
    /// - Verifies image exists locally before the pool warms up
    /// - Pulls synchronously if missing
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| SandboxError::Engine(format!("Failed to pull image '{}': {}", image, e)))?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }

    #[instrument(skip(self, spec), fields(language = %spec.language, image = %spec.image))]
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError> {
        let name = format!("judge-{}-{}", spec.language, uuid::Uuid::new_v4());
        let creation_error = |e: bollard::errors::Error| SandboxError::Creation {
            image: spec.image.clone(),
            message: e.to_string(),
        };

        let mut labels = HashMap::new();
        labels.insert("judge.language".to_string(), spec.language.clone());

        let config = Config {
            image: Some(spec.image.clone()),
            // Keep container alive; work happens through exec
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            entrypoint: Some(vec![]),
            working_dir: Some(WORK_DIR.to_string()),
            network_disabled: Some(true), // SECURITY: No network access
            tty: Some(false),
            labels: Some(labels),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_limit_bytes),
                memory_swap: Some(spec.memory_limit_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(creation_error)?;

        let sandbox = Sandbox {
            id: container.id,
            name,
        };

        if let Err(e) = self
            .docker
            .start_container(&sandbox.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.destroy(&sandbox).await;
            return Err(creation_error(e));
        }

        debug!(sandbox = %sandbox.name, "Sandbox started");
        Ok(sandbox)
    }

    async fn write_file(
        &self,
        sandbox: &Sandbox,
        path: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        let write_error = |message: String| SandboxError::FileWrite {
            path: path.to_string(),
            message,
        };

        let (dir, file_name) =
            split_path(path).ok_or_else(|| write_error("path must name a file".to_string()))?;

        let archive = build_archive(file_name, content.as_bytes())
            .map_err(|e| write_error(format!("failed to build archive: {}", e)))?;

        let options = UploadToContainerOptions {
            path: dir.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(&sandbox.id, Some(options), Bytes::from(archive))
            .await
            .map_err(|e| write_error(e.to_string()))
    }

    #[instrument(
        skip(self, sandbox, command, timeout),
        fields(sandbox = %sandbox.name, timeout_ms = timeout.as_millis() as u64)
    )]
    async fn exec(
        &self,
        sandbox: &Sandbox,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORK_DIR.to_string()),
            ..Default::default()
        };

        let exec = self.docker.create_exec(&sandbox.id, exec_config).await?;

        let start_time = Instant::now();

        let execution_future = async {
            let started = self
                .docker
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: false,
                        ..Default::default()
                    }),
                )
                .await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            // Bollard strips the 8-byte frame headers and tags each frame
            if let StartExecResults::Attached { mut output, .. } = started {
                while let Some(frame) = output.next().await {
                    match frame? {
                        LogOutput::StdOut { message } => append_capped(&mut stdout, &message),
                        LogOutput::StdErr { message } => append_capped(&mut stderr, &message),
                        _ => {}
                    }
                }
            } else {
                return Err(SandboxError::Exec("exec started detached".to_string()));
            }

            let inspect = self.docker.inspect_exec(&exec.id).await?;

            Ok::<_, SandboxError>((stdout, stderr, inspect.exit_code))
        };

        // HARD TIMEOUT: the program is untrusted and may never yield
        let (stdout, stderr, exit_code) = tokio::time::timeout(timeout, execution_future)
            .await
            .map_err(|_| SandboxError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })??;

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        debug!(elapsed_ms, exit_code = ?exit_code, "Exec finished");

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            elapsed_ms,
        })
    }

    async fn destroy(&self, sandbox: &Sandbox) {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(&sandbox.id, Some(remove_options))
            .await
        {
            Ok(()) => debug!(sandbox = %sandbox.name, "Sandbox removed"),
            Err(e) if is_not_found(&e) => debug!(sandbox = %sandbox.name, "Sandbox already gone"),
            Err(e) => warn!(sandbox = %sandbox.name, error = %e, "Failed to remove sandbox"),
        }
    }
}
