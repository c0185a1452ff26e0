use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::{ensure_not_empty, Runner, RunnerInput, RunnerKind, RunnerResult};
use crate::config::ResourceLimits;

/// Patterns that are reported but do not fail validation.
static UNSAFE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)<script\b", "inline <script> element"),
        (r"(?i)javascript\s*:", "javascript: URL"),
        (r#"(?i)\son[a-z]+\s*=\s*["']?"#, "inline event handler attribute"),
        (r"(?i)<iframe\b", "embedded <iframe>"),
        (r"(?i)<(object|embed)\b", "plugin content (<object>/<embed>)"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("html pattern is valid"), label))
    .collect()
});

/// Validates HTML without rendering it.
///
/// There is no DOM on the server, so "running" HTML means auditing it: the
/// content must be non-empty, and unsafe constructs are surfaced as warnings.
#[derive(Debug, Clone, Default)]
pub struct HtmlRunner;

impl HtmlRunner {
    pub fn new() -> Self {
        Self
    }

    /// Warnings for every unsafe pattern present in `content`.
    pub fn audit(content: &str) -> Vec<String> {
        UNSAFE_PATTERNS
            .iter()
            .filter(|(re, _)| re.is_match(content))
            .map(|(_, label)| format!("Potentially unsafe pattern detected: {}", label))
            .collect()
    }
}

#[async_trait]
impl Runner for HtmlRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Html
    }

    async fn execute(
        &self,
        content: &str,
        _input: Option<RunnerInput<'_>>,
        _limits: &ResourceLimits,
    ) -> RunnerResult {
        if let Err(e) = ensure_not_empty(content) {
            return RunnerResult::from_error(&e).with_cpu_time(0);
        }

        let warnings = Self::audit(content);
        if !warnings.is_empty() {
            tracing::debug!(count = warnings.len(), "HTML validated with warnings");
        }
        RunnerResult::validated("HTML validated successfully", warnings).with_cpu_time(0)
    }
}
