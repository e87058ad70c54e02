//! Docker-backed preprocessing tool.
//!
//! Each invocation runs in its own container named after the job, with the
//! converted volume, the subjects directory and the license file bind
//! mounted. Nothing is shared between concurrent invocations except the
//! subjects directory, where every job writes under its own subject id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use neurochron_config::{PreprocessorConfig, TemplateContext};
use neurochron_core::JobId;
use neurochron_core::cancel::CancelSignal;
use neurochron_core::collaborator::{PreprocessError, Preprocessor, ToolInvocation};
use tracing::{debug, info, warn};

const CONTAINER_INPUT_DIR: &str = "/input";
const CONTAINER_SUBJECTS_DIR: &str = "/subjects";
const CONTAINER_LICENSE_PATH: &str = "/usr/local/freesurfer/license.txt";
const LOG_TAIL_CHARS: usize = 1000;
const STOP_GRACE_SECS: i64 = 10;

/// Marker file the tool writes when a reconstruction completes.
pub fn expected_output(subjects_dir: &Path, subject_id: &str) -> PathBuf {
    subjects_dir.join(subject_id).join("mri").join("brain.mgz")
}

/// Container settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPlan {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub binds: Vec<String>,
}

/// Runs the preprocessing tool in a local Docker container.
pub struct DockerPreprocessor {
    docker: Docker,
    image: String,
    command: Vec<String>,
    subjects_dir: PathBuf,
}

impl DockerPreprocessor {
    /// Connect to the local Docker daemon.
    pub fn new(config: &PreprocessorConfig) -> Result<Self, PreprocessError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| PreprocessError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(docker, config))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, config: &PreprocessorConfig) -> Self {
        Self {
            docker,
            image: config.image.clone(),
            command: config.command.clone(),
            subjects_dir: config.subjects_dir.clone(),
        }
    }

    pub fn container_name(job_id: &JobId) -> String {
        format!("neurochron-preprocess-{job_id}")
    }

    /// Build the container settings for `invocation`.
    pub fn plan(&self, invocation: &ToolInvocation) -> Result<ContainerPlan, PreprocessError> {
        let volume = Path::new(&invocation.volume_ref);
        let (Some(input_dir), Some(file_name)) = (volume.parent(), volume.file_name()) else {
            return Err(PreprocessError::NoOutput(format!(
                "input volume path {} has no file name",
                invocation.volume_ref
            )));
        };
        let container_input = format!("{CONTAINER_INPUT_DIR}/{}", file_name.to_string_lossy());

        let ctx = TemplateContext::new()
            .input(container_input)
            .subject(invocation.subject_id.as_str())
            .output_dir(CONTAINER_SUBJECTS_DIR)
            .job_id(invocation.job_id.to_string());

        Ok(ContainerPlan {
            name: Self::container_name(&invocation.job_id),
            image: self.image.clone(),
            cmd: ctx.interpolate_vec(&self.command),
            env: vec![
                format!("SUBJECTS_DIR={CONTAINER_SUBJECTS_DIR}"),
                format!("FS_LICENSE={CONTAINER_LICENSE_PATH}"),
            ],
            binds: vec![
                format!("{}:{CONTAINER_INPUT_DIR}:ro", input_dir.display()),
                format!("{}:{CONTAINER_SUBJECTS_DIR}:rw", self.subjects_dir.display()),
                format!(
                    "{}:{CONTAINER_LICENSE_PATH}:ro",
                    invocation.license_ref.display()
                ),
            ],
        })
    }

    async fn pull_image(&self) {
        info!(image = %self.image, "Pulling image");
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn start(&self, plan: &ContainerPlan) -> Result<(), PreprocessError> {
        let config = Config {
            image: Some(plan.image.clone()),
            cmd: Some(plan.cmd.clone()),
            env: Some(plan.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(plan.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: plan.name.clone(),
            platform: None,
        };

        info!(container = %plan.name, "Creating container");
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                PreprocessError::Unavailable(format!("failed to create container: {e}"))
            })?;

        info!(container = %plan.name, cmd = ?plan.cmd, "Starting container");
        self.docker
            .start_container(&plan.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| PreprocessError::Unavailable(format!("failed to start container: {e}")))
    }

    /// Wait for the container to stop and return its exit code.
    async fn wait_exit(&self, name: &str) -> Result<i64, PreprocessError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as a wait error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(PreprocessError::Unavailable(format!(
                "failed waiting for container: {e}"
            ))),
            None => Err(PreprocessError::Unavailable(
                "container wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn log_tail(&self, name: &str) -> String {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "200".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(container = %name, error = %e, "Log stream error");
                    break;
                }
            }
        }
        tail_chars(&output, LOG_TAIL_CHARS).to_string()
    }

    /// Stop and remove the container. Missing containers are not an error.
    async fn discard_container(&self, name: &str) {
        if let Err(e) = self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            debug!(container = %name, error = %e, "Stop container");
        }
        self.remove_container(name).await;
    }

    async fn remove_container(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            debug!(container = %name, error = %e, "Remove container");
        }
    }

    async fn discard_partial_output(&self, subject_id: &str) {
        let dir = self.subjects_dir.join(subject_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!(path = %dir.display(), "Discarded partial tool output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to discard partial output"),
        }
    }
}

#[async_trait]
impl Preprocessor for DockerPreprocessor {
    async fn run_external_tool(
        &self,
        invocation: &ToolInvocation,
        mut cancel: CancelSignal,
    ) -> Result<String, PreprocessError> {
        if tokio::fs::metadata(&invocation.license_ref).await.is_err() {
            return Err(PreprocessError::LicenseMissing(
                invocation.license_ref.display().to_string(),
            ));
        }
        if tokio::fs::metadata(&invocation.volume_ref).await.is_err() {
            return Err(PreprocessError::NoOutput(format!(
                "input volume {} is missing",
                invocation.volume_ref
            )));
        }

        let plan = self.plan(invocation)?;

        // A previous holder of this job may have left a container or a
        // half-written subject behind; the tool refuses to reuse either.
        self.remove_container(&plan.name).await;
        self.discard_partial_output(&invocation.subject_id).await;

        // The pull counts against the same deadline as the run.
        let deadline = tokio::time::Instant::now() + invocation.timeout;
        tokio::select! {
            _ = self.pull_image() => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Err(PreprocessError::Timeout(invocation.timeout));
            }
            _ = cancel.cancelled() => return Err(PreprocessError::Cancelled),
        }
        self.start(&plan).await?;

        let outcome = tokio::select! {
            exit = self.wait_exit(&plan.name) => exit,
            _ = tokio::time::sleep_until(deadline) => Err(PreprocessError::Timeout(invocation.timeout)),
            _ = cancel.cancelled() => Err(PreprocessError::Cancelled),
        };

        match outcome {
            Ok(0) => {
                self.remove_container(&plan.name).await;
                let marker = expected_output(&self.subjects_dir, &invocation.subject_id);
                if tokio::fs::metadata(&marker).await.is_err() {
                    return Err(PreprocessError::NoOutput(format!(
                        "tool exited cleanly but {} is missing",
                        marker.display()
                    )));
                }
                let output_dir = self.subjects_dir.join(&invocation.subject_id);
                info!(job_id = %invocation.job_id, output = %output_dir.display(), "Preprocessing finished");
                Ok(output_dir.display().to_string())
            }
            Ok(exit_code) => {
                let message = self.log_tail(&plan.name).await;
                self.remove_container(&plan.name).await;
                warn!(job_id = %invocation.job_id, exit_code, "Preprocessing tool failed");
                Err(PreprocessError::ToolFailed { exit_code, message })
            }
            Err(e @ (PreprocessError::Timeout(_) | PreprocessError::Cancelled)) => {
                warn!(job_id = %invocation.job_id, reason = %e, "Stopping preprocessing tool");
                self.discard_container(&plan.name).await;
                self.discard_partial_output(&invocation.subject_id).await;
                Err(e)
            }
            Err(e) => {
                self.remove_container(&plan.name).await;
                Err(e)
            }
        }
    }
}

/// The last `max` characters of `s`.
pub fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
