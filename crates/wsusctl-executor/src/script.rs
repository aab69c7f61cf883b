//! Script executor: runs `<scripts dir>/<name>.ps1` out of process.
//!
//! Parameters travel as a single `-ParametersJson '<json>'` argument; the
//! script answers with JSON on stdout and reports failures on stderr with a
//! non-zero exit code.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use wsusctl_core::config::{WsusConfig, expand_path};
use wsusctl_core::error::{Result, WsusError, classify_script_failure};
use wsusctl_core::traits::executor::OperationExecutor;
use wsusctl_core::types::{OperationOutput, OperationParams};

/// Longest stderr excerpt carried into an error message.
const MAX_STDERR: usize = 2000;

pub struct ScriptExecutor {
    directory: PathBuf,
    shell: String,
    shell_args: Vec<String>,
    timeout: Duration,
}

impl ScriptExecutor {
    pub fn new(
        directory: impl Into<PathBuf>,
        shell: impl Into<String>,
        shell_args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory: directory.into(),
            shell: shell.into(),
            shell_args,
            timeout,
        }
    }

    pub fn from_config(config: &WsusConfig) -> Self {
        Self::new(
            expand_path(&config.scripts.directory),
            config.scripts.shell.clone(),
            config.scripts.shell_args.clone(),
            Duration::from_secs(config.operations.operation_timeout_secs),
        )
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Resolve an operation name to its script file.
    pub fn script_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WsusError::Validation(format!(
                "Invalid operation name '{name}'"
            )));
        }
        let path = self.directory.join(format!("{name}.ps1"));
        if !path.is_file() {
            return Err(WsusError::NotFound(format!(
                "Script not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl OperationExecutor for ScriptExecutor {
    async fn run(
        &self,
        name: &str,
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput> {
        let script = self.script_path(name)?;
        let params_json = serde_json::to_string(params)?;

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.args(&self.shell_args)
            .arg(&script)
            .arg("-ParametersJson")
            .arg(&params_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = tokio::time::Instant::now();
        tracing::debug!("▶️ Running script '{}'", script.display());

        let child = cmd.spawn().map_err(|e| {
            WsusError::Unavailable(format!("Failed to launch '{}': {e}", self.shell))
        })?;

        // Dropping the output future kills the child.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WsusError::Cancelled),
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(out) => out?,
                Err(_) => {
                    return Err(WsusError::Timeout(format!(
                        "'{name}' exceeded {}s",
                        self.timeout.as_secs_f64()
                    )));
                }
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(
            "◀️ Script '{}' exited with {:?} in {:.1}s",
            name,
            output.status.code(),
            start.elapsed().as_secs_f64()
        );

        if !output.status.success() {
            let excerpt = if stderr.trim().is_empty() {
                stdout.to_string()
            } else {
                truncate(&stderr, MAX_STDERR)
            };
            return Err(classify_script_failure(
                output.status.code().unwrap_or(-1),
                &excerpt,
            ));
        }

        let mut parsed = parse_stdout(&stdout);
        parsed.messages.extend(
            stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
        Ok(parsed)
    }
}

/// Whole stdout as JSON, or informational lines followed by a final JSON
/// line, or plain text.
fn parse_stdout(stdout: &str) -> OperationOutput {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return OperationOutput::default();
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return OperationOutput::new(value);
    }

    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    if let Some((last, rest)) = lines.split_last()
        && let Ok(value) = serde_json::from_str(last.trim())
    {
        return OperationOutput {
            data: value,
            messages: rest.iter().map(|l| l.trim().to_string()).collect(),
        };
    }
    OperationOutput::new(serde_json::Value::String(trimmed.to_string()))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &s[..end])
}
