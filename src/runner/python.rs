use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use super::{disallowed_modules, ensure_not_empty, Runner, RunnerInput, RunnerKind, RunnerResult};
use crate::config::{ResourceLimits, RunnerConfig};
use crate::error::ExecError;

static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^import\s+(.+)$").expect("import pattern is valid"));
static FROM_IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^from\s+(\S+)\s+import\b").expect("from pattern is valid"));

const SCRIPT_NAME: &str = "main.py";
const READ_CHUNK: usize = 8 * 1024;

/// Runs Python source in an interpreter subprocess.
///
/// Before anything is spawned the source is scanned for `import` statements
/// and rejected if it names a module outside the allow-list. The scan is
/// textual, so it is a filter rather than a security boundary: dynamic imports
/// such as `__import__` are not caught.
///
/// Each invocation gets its own temporary directory holding the script; it is
/// removed when the invocation ends, whichever way it ends.
#[derive(Debug, Clone)]
pub struct PythonRunner {
    python_bin: PathBuf,
    allowed_libraries: Vec<String>,
}

impl PythonRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            allowed_libraries: config.allowed_python_libraries.clone(),
        }
    }

    async fn run(
        &self,
        content: &str,
        input: Option<RunnerInput<'_>>,
        limits: &ResourceLimits,
    ) -> Result<RunnerResult, ExecError> {
        ensure_not_empty(content)?;

        let imports = extract_imports(content);
        let rejected = disallowed_modules(
            imports.iter().map(String::as_str),
            &self.allowed_libraries,
        );
        if !rejected.is_empty() {
            return Err(ExecError::UnauthorizedImports(rejected));
        }

        let workdir = tempfile::Builder::new()
            .prefix("artifact-py-")
            .tempdir()
            .map_err(|e| ExecError::RunnerFault(format!("Failed to create work dir: {}", e)))?;
        let script = workdir.path().join(SCRIPT_NAME);
        tokio::fs::write(&script, content).await?;

        let stdin = input.and_then(|i| i.stdin()).map(str::to_owned);
        let child = self.spawn(&script, workdir.path(), stdin.is_some())?;

        tracing::debug!(
            script = %script.display(),
            timeout_ms = limits.max_execution_time_ms,
            "Python process started"
        );

        match tokio::time::timeout(
            limits.execution_timeout(),
            drive(child, stdin, limits.max_output_bytes),
        )
        .await
        {
            Ok(result) => result,
            // Dropping the timed-out future drops the child, which kills it.
            Err(_) => Err(ExecError::ResourceExceeded(format!(
                "Execution timed out after {}ms",
                limits.max_execution_time_ms
            ))),
        }
    }

    fn spawn(&self, script: &Path, workdir: &Path, pipe_stdin: bool) -> Result<Child, ExecError> {
        Command::new(&self.python_bin)
            // Isolated mode: no user site-packages, no PYTHON* env vars
            .arg("-I")
            .arg("-B")
            .arg(script)
            .current_dir(workdir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecError::RunnerFault(format!(
                    "Failed to start {}: {}",
                    self.python_bin.display(),
                    e
                ))
            })
    }
}

#[async_trait]
impl Runner for PythonRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Python
    }

    async fn execute(
        &self,
        content: &str,
        input: Option<RunnerInput<'_>>,
        limits: &ResourceLimits,
    ) -> RunnerResult {
        let started = Instant::now();
        let result = match self.run(content, input, limits).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "Python execution failed");
                RunnerResult::from_error(&e)
            }
        };
        result.with_cpu_time(started.elapsed().as_millis() as u64)
    }
}

/// Feeds stdin, streams stdout against the byte cap and waits for exit.
async fn drive(
    mut child: Child,
    stdin: Option<String>,
    max_output: usize,
) -> Result<RunnerResult, ExecError> {
    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A program that never reads stdin must not stall the runner.
        tokio::spawn(async move {
            let _ = pipe.write_all(text.as_bytes()).await;
        });
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::RunnerFault("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::RunnerFault("stderr was not captured".to_string()))?;
    let stderr_task = tokio::spawn(read_capped(stderr, max_output));

    let mut out = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if out.len() + n > max_output {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stderr_task.abort();
            tracing::warn!(max_output, "Python output limit exceeded, process killed");
            return Err(ExecError::ResourceExceeded(format!(
                "Output size limit exceeded ({} bytes)",
                max_output
            )));
        }
        out.extend_from_slice(&buf[..n]);
    }

    let status = child.wait().await?;
    let err = stderr_task.await.unwrap_or_default();

    let stdout = String::from_utf8_lossy(&out).into_owned();
    let stderr = String::from_utf8_lossy(&err).into_owned();
    let exit_code = status.code();
    let success = exit_code == Some(0);

    let error = if success {
        None
    } else if !stderr.trim().is_empty() {
        Some(stderr.trim_end().to_string())
    } else {
        match exit_code {
            Some(code) => Some(format!("Process exited with code {}", code)),
            None => Some("Process terminated by signal".to_string()),
        }
    };

    tracing::debug!(exit_code = ?exit_code, stdout_bytes = out.len(), "Python process exited");

    Ok(RunnerResult {
        success,
        output: if stdout.is_empty() {
            None
        } else {
            Some(stdout.clone())
        },
        error,
        exit_code,
        stdout,
        stderr,
        ..Default::default()
    })
}

/// Reads a stream to the end, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    while let Ok(n) = reader.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    kept
}

/// Top-level module names named by `import` / `from ... import` statements.
///
/// Relative imports (`from . import x`) are skipped. Submodule paths are
/// truncated to their root, so `os.path` yields `os`.
pub fn extract_imports(content: &str) -> Vec<String> {
    let mut modules = Vec::new();
    for line in content.lines() {
        let code = line.split('#').next().unwrap_or("");
        for statement in code.split(';') {
            let statement = statement.trim();
            if let Some(caps) = FROM_IMPORT_RE.captures(statement) {
                let path = &caps[1];
                if !path.starts_with('.') {
                    modules.push(root_module(path).to_string());
                }
            } else if let Some(caps) = IMPORT_RE.captures(statement) {
                for clause in caps[1].split(',') {
                    if let Some(path) = clause.split_whitespace().next() {
                        modules.push(root_module(path.trim_matches(['(', ')'])).to_string());
                    }
                }
            }
        }
    }
    modules
}

fn root_module(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_and_from_imports() {
        let src = "import os\nfrom collections import deque\nprint('x')";
        assert_eq!(extract_imports(src), vec!["os", "collections"]);
    }

    #[test]
    fn truncates_submodules_and_aliases() {
        let src = "import os.path as p, json\nfrom xml.etree import ElementTree";
        assert_eq!(extract_imports(src), vec!["os", "json", "xml"]);
    }

    #[test]
    fn handles_indentation_semicolons_and_comments() {
        let src = "def f():\n    import math; import sys  # import socket\n";
        assert_eq!(extract_imports(src), vec!["math", "sys"]);
    }

    #[test]
    fn skips_relative_imports() {
        assert!(extract_imports("from . import sibling\nfrom ..pkg import x").is_empty());
    }

    #[test]
    fn ignores_identifiers_that_merely_contain_import() {
        assert!(extract_imports("important = 1\nprint(important)").is_empty());
    }
}
