//! Processing through an external program

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tetires_session::{Measurement, ProcessingBackend, ProcessingError, ProcessingResponse};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ProcessingConfig;

/// Longest stderr excerpt carried into an error message
const STDERR_EXCERPT: usize = 300;

/// Runs the configured program once per batch
///
/// Samples go to stdin one per line; the JSON envelope is read from stdout.
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// `None` when no program is configured
    pub fn from_config(config: &ProcessingConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone(), config.timeout()))
    }

    async fn run(&self, samples: &[String]) -> Result<String, ProcessingError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProcessingError::Unavailable(format!("{}: {}", self.program.display(), e))
            })?;

        let mut input = String::with_capacity(samples.len() * 16);
        for sample in samples {
            input.push_str(sample);
            input.push('\n');
        }

        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                // A program that exits without reading everything is judged by its output
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(error = %e, "Processing program did not read all samples");
                }
            }
            child.wait_with_output().await
        };

        // Dropping the exchange on timeout kills the child
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                ProcessingError::Failed(format!(
                    "processing timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| ProcessingError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ProcessingError::Failed(if excerpt.is_empty() {
                format!("processing program exited with {}", output.status)
            } else {
                excerpt
            }));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| ProcessingError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ProcessingBackend for CommandProcessor {
    async fn process(&self, samples: Vec<String>) -> Result<Measurement, ProcessingError> {
        debug!(program = %self.program.display(), samples = samples.len(), "Running processing program");
        let stdout = self.run(&samples).await?;
        ProcessingResponse::from_json(&stdout, samples.len())?.into_result()
    }
}

/// Used when no processing program is configured; every batch fails
pub struct UnconfiguredProcessor;

#[async_trait]
impl ProcessingBackend for UnconfiguredProcessor {
    async fn process(&self, _samples: Vec<String>) -> Result<Measurement, ProcessingError> {
        Err(ProcessingError::Unavailable(
            "no processing program configured".to_string(),
        ))
    }
}
