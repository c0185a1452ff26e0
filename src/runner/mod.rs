//! Per-language runners for code artifacts.
//!
//! Every runner implements [`Runner`] and turns one piece of source text into
//! a [`RunnerResult`]. Runners never return errors: every failure, from an
//! unauthorized import to a spawn failure, comes back as `success = false`
//! with `error` populated.
//!
//! # Variants
//!
//! - [`PythonRunner`]: interpreter subprocess with import allow-list, output cap
//!   and hard timeout
//! - [`JavaScriptRunner`]: in-process QuickJS sandbox with restricted globals;
//!   registered twice, once for JavaScript and once with type erasure for
//!   TypeScript
//! - [`HtmlRunner`], [`ReactRunner`]: static validators, no execution

pub mod html;
pub mod javascript;
pub mod python;
pub mod react;
mod transpile;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ResourceLimits;
use crate::error::ExecError;

pub use html::HtmlRunner;
pub use javascript::JavaScriptRunner;
pub use python::PythonRunner;
pub use react::ReactRunner;

/// Registry key for a runner variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Python,
    JavaScript,
    TypeScript,
    Html,
    React,
}

impl RunnerKind {
    pub const ALL: [RunnerKind; 5] = [
        RunnerKind::Python,
        RunnerKind::JavaScript,
        RunnerKind::TypeScript,
        RunnerKind::Html,
        RunnerKind::React,
    ];

    /// Exact match on an artifact type such as `python-script`.
    pub fn from_artifact_type(artifact_type: &str) -> Option<Self> {
        match artifact_type {
            "python-script" | "python" => Some(RunnerKind::Python),
            "javascript-snippet" | "javascript" => Some(RunnerKind::JavaScript),
            "typescript-snippet" | "typescript" => Some(RunnerKind::TypeScript),
            "html-page" | "html" => Some(RunnerKind::Html),
            "react-component" | "react" => Some(RunnerKind::React),
            _ => None,
        }
    }

    /// Fallback match on an artifact language.
    pub fn from_language(language: &str) -> Option<Self> {
        match language {
            "python" | "py" => Some(RunnerKind::Python),
            "javascript" | "js" => Some(RunnerKind::JavaScript),
            "typescript" | "ts" => Some(RunnerKind::TypeScript),
            "html" => Some(RunnerKind::Html),
            "jsx" | "tsx" | "react" => Some(RunnerKind::React),
            _ => None,
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Python => write!(f, "python"),
            RunnerKind::JavaScript => write!(f, "javascript"),
            RunnerKind::TypeScript => write!(f, "typescript"),
            RunnerKind::Html => write!(f, "html"),
            RunnerKind::React => write!(f, "react"),
        }
    }
}

/// Approximate resource consumption of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Wall-clock milliseconds spent in the runner
    pub cpu_time: u64,
    /// Bytes of memory; not measured by any runner today, always 0
    pub memory: u64,
}

/// Input forwarded from the execution request.
#[derive(Debug, Clone, Copy)]
pub struct RunnerInput<'a> {
    pub value: &'a serde_json::Value,
}

impl<'a> RunnerInput<'a> {
    pub fn new(value: &'a serde_json::Value) -> Self {
        Self { value }
    }

    /// Text to pipe to the program's standard input, if any.
    pub fn stdin(&self) -> Option<&'a str> {
        self.value.get("stdin").and_then(|v| v.as_str())
    }
}

/// Normalized outcome of one runner invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunnerResult {
    /// A failed result carrying `err` in both `error` and `stderr`.
    pub fn from_error(err: &ExecError) -> Self {
        let message = err.to_string();
        Self {
            success: false,
            output: None,
            stderr: message.clone(),
            error: Some(message),
            ..Default::default()
        }
    }

    /// A successful static validation with optional warnings.
    pub fn validated(message: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            output: Some(message.into()),
            exit_code: Some(0),
            warnings,
            ..Default::default()
        }
    }

    pub fn with_cpu_time(mut self, millis: u64) -> Self {
        self.resource_usage = Some(ResourceUsage {
            cpu_time: millis,
            memory: 0,
        });
        self
    }
}

/// A language runner.
#[async_trait]
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    async fn execute(
        &self,
        content: &str,
        input: Option<RunnerInput<'_>>,
        limits: &ResourceLimits,
    ) -> RunnerResult;
}

/// Rejects empty or whitespace-only source before any execution attempt.
pub(crate) fn ensure_not_empty(content: &str) -> Result<(), ExecError> {
    if content.trim().is_empty() {
        return Err(ExecError::Validation("Code content cannot be empty".to_string()));
    }
    Ok(())
}

/// Collects the modules outside `allowed`, comparing top-level names only.
/// Keeps first-seen order and drops duplicates.
pub(crate) fn disallowed_modules<'a, I>(modules: I, allowed: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut rejected: Vec<String> = Vec::new();
    for module in modules {
        if module.is_empty() || allowed.iter().any(|a| a == module) {
            continue;
        }
        if !rejected.iter().any(|r| r == module) {
            rejected.push(module.to_string());
        }
    }
    rejected
}
