use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{ensure_not_empty, Runner, RunnerInput, RunnerKind, RunnerResult};
use crate::config::ResourceLimits;
use crate::error::ExecError;

static EVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\beval\s*\(").expect("eval pattern is valid"));
static FUNCTION_CTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bFunction\s*\(").expect("Function pattern is valid"));
static REACT_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(import\s[^;]*from\s*['"]react['"]|require\(\s*['"]react['"]\s*\))"#)
        .expect("react import pattern is valid")
});
static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(^\s*export\s|\bmodule\.exports\b)").expect("export pattern is valid")
});

/// Statically validates a React component.
///
/// Dynamic code construction (`eval`, the `Function` constructor) fails
/// validation outright; structural problems are reported as warnings.
#[derive(Debug, Clone, Default)]
pub struct ReactRunner;

impl ReactRunner {
    pub fn new() -> Self {
        Self
    }

    /// Returns warnings, or the violation that rejects the component.
    pub fn audit(content: &str) -> Result<Vec<String>, ExecError> {
        ensure_not_empty(content)?;

        if EVAL_RE.is_match(content) {
            return Err(ExecError::SandboxViolation("use of eval() is not allowed".to_string()));
        }
        if FUNCTION_CTOR_RE.is_match(content) {
            return Err(ExecError::SandboxViolation(
                "use of the Function constructor is not allowed".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        if !REACT_IMPORT_RE.is_match(content) {
            warnings.push("Component does not import React".to_string());
        }
        if !EXPORT_RE.is_match(content) {
            warnings.push("Component has no export".to_string());
        }
        if content.contains("dangerouslySetInnerHTML") {
            warnings.push("Potentially unsafe pattern detected: dangerouslySetInnerHTML".to_string());
        }
        Ok(warnings)
    }
}

#[async_trait]
impl Runner for ReactRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::React
    }

    async fn execute(
        &self,
        content: &str,
        _input: Option<RunnerInput<'_>>,
        _limits: &ResourceLimits,
    ) -> RunnerResult {
        let result = match Self::audit(content) {
            Ok(warnings) => RunnerResult::validated("React component validated successfully", warnings),
            Err(e) => {
                tracing::info!(error = %e, "React component rejected");
                RunnerResult::from_error(&e)
            }
        };
        result.with_cpu_time(0)
    }
}
