//! Subprocess-backed converter and predictor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use neurochron_config::{ConverterConfig, PredictorConfig, TemplateContext};
use neurochron_core::collaborator::{
    ConvertError, ConvertRequest, Converter, PredictError, Predictor,
};
use neurochron_core::job::Prediction;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::docker::tail_chars;

const STDERR_TAIL_CHARS: usize = 1000;

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Run `program args` to completion. The child is killed if `timeout`
/// elapses or the returned future is dropped.
pub async fn run_command(
    program: &str,
    args: &[String],
    working_dir: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    debug!(program, ?args, "Spawning subprocess");
    let child = cmd.spawn()?;
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| CommandError::TimedOut(timeout))??;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Converts uploads by running an external command such as dcm2niix.
///
/// The command must write `<output_dir>/<job_id>.nii`, exposed to the
/// argument template as `${output}`.
pub struct CommandConverter {
    command: String,
    args: Vec<String>,
    min_output_bytes: u64,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            min_output_bytes: config.min_output_bytes,
            timeout: config.timeout,
        }
    }

    pub fn output_path(request: &ConvertRequest) -> PathBuf {
        request.output_dir.join(format!("{}.nii", request.job_id))
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, request: &ConvertRequest) -> Result<String, ConvertError> {
        match tokio::fs::metadata(&request.raw_file_ref).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConvertError::Io(format!(
                    "input {} not found",
                    request.raw_file_ref
                )));
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let output = Self::output_path(request);
        let ctx = TemplateContext::new()
            .input(request.raw_file_ref.as_str())
            .output(output.display().to_string())
            .output_dir(request.output_dir.display().to_string())
            .job_id(request.job_id.to_string())
            .populate_env();
        let args = ctx.interpolate_vec(&self.args);

        let result = match run_command(&self.command, &args, None, self.timeout).await {
            Ok(result) => result,
            Err(CommandError::Spawn(e)) => {
                return Err(ConvertError::Io(format!(
                    "failed to run {}: {e}",
                    self.command
                )));
            }
            Err(CommandError::TimedOut(t)) => {
                return Err(ConvertError::Io(format!(
                    "{} did not finish within {t:?}",
                    self.command
                )));
            }
        };
        if !result.success() {
            return Err(ConvertError::InvalidFormat(format!(
                "{} exited with {:?}: {}",
                self.command,
                result.exit_code,
                tail_chars(result.stderr.trim(), STDERR_TAIL_CHARS)
            )));
        }

        let size = match tokio::fs::metadata(&output).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(ConvertError::InvalidFormat(format!(
                    "converter produced no volume at {}",
                    output.display()
                )));
            }
        };
        if size < self.min_output_bytes {
            return Err(ConvertError::InvalidFormat(format!(
                "converted volume is suspiciously small ({size} bytes)"
            )));
        }

        info!(job_id = %request.job_id, output = %output.display(), size, "Converted upload");
        Ok(output.display().to_string())
    }
}

/// Runs the age model as a subprocess.
///
/// The command prints either a bare number or a JSON object
/// `{"predicted_age": 81.5, "explanation": "/path/to/saliency.nii"}` on
/// its last non-empty stdout line.
pub struct CommandPredictor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ModelOutput {
    predicted_age: f64,
    #[serde(default)]
    explanation: Option<String>,
}

impl CommandPredictor {
    pub fn new(config: &PredictorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: config.timeout,
        }
    }
}

/// Parse the model's stdout into a prediction.
pub fn parse_prediction(stdout: &str) -> Result<Prediction, PredictError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| PredictError::InvalidOutput("model printed nothing".to_string()))?;

    let prediction = if line.starts_with('{') {
        let output: ModelOutput = serde_json::from_str(line)
            .map_err(|e| PredictError::InvalidOutput(format!("malformed model output: {e}")))?;
        Prediction {
            predicted_age: output.predicted_age,
            explanation_ref: output.explanation,
        }
    } else {
        let predicted_age = line
            .parse::<f64>()
            .map_err(|_| PredictError::InvalidOutput(format!("not a number: {line}")))?;
        Prediction {
            predicted_age,
            explanation_ref: None,
        }
    };

    if !prediction.predicted_age.is_finite() || prediction.predicted_age <= 0.0 {
        return Err(PredictError::InvalidOutput(format!(
            "predicted age {} is out of range",
            prediction.predicted_age
        )));
    }
    Ok(prediction)
}

#[async_trait]
impl Predictor for CommandPredictor {
    async fn predict(&self, output_dir_ref: &str) -> Result<Prediction, PredictError> {
        let ctx = TemplateContext::new()
            .input(output_dir_ref)
            .output_dir(output_dir_ref)
            .populate_env();
        let args = ctx.interpolate_vec(&self.args);

        let result = run_command(&self.command, &args, None, self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::Spawn(e) => {
                    PredictError::Inference(format!("failed to run {}: {e}", self.command))
                }
                CommandError::TimedOut(t) => {
                    PredictError::Inference(format!("model did not finish within {t:?}"))
                }
            })?;
        if !result.success() {
            warn!(exit_code = ?result.exit_code, "Model process failed");
            return Err(PredictError::Inference(format!(
                "model exited with {:?}: {}",
                result.exit_code,
                tail_chars(result.stderr.trim(), STDERR_TAIL_CHARS)
            )));
        }
        parse_prediction(&result.stdout)
    }
}
