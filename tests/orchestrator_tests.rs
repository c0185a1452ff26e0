//! Orchestrator dispatch: runner selection, limit resolution, validators and
//! fault containment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use artifact_runner::artifact::ArtifactSnapshot;
use artifact_runner::config::{ResourceLimits, ResourceLimitsOverride, RunnerConfig};
use artifact_runner::orchestrator::{
    ExecuteRequest, LocalOrchestratorClient, Orchestrator, OrchestratorClient, ResultStatus,
    TransportError,
};
use artifact_runner::runner::{
    HtmlRunner, Runner, RunnerInput, RunnerKind, RunnerResult,
};

fn orchestrator() -> Orchestrator {
    Orchestrator::from_config(&RunnerConfig::default(), ResourceLimits::default())
}

struct PanickingRunner;

#[async_trait]
impl Runner for PanickingRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Python
    }

    async fn execute(
        &self,
        _content: &str,
        _input: Option<RunnerInput<'_>>,
        _limits: &ResourceLimits,
    ) -> RunnerResult {
        panic!("runner blew up")
    }
}

/// Sleeps for the artifact's configured time limit, then reports it.
struct LimitEchoRunner;

#[async_trait]
impl Runner for LimitEchoRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Html
    }

    async fn execute(
        &self,
        _content: &str,
        _input: Option<RunnerInput<'_>>,
        limits: &ResourceLimits,
    ) -> RunnerResult {
        tokio::time::sleep(limits.execution_timeout()).await;
        RunnerResult {
            success: true,
            output: Some(limits.max_execution_time_ms.to_string()),
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn test_html_script_is_a_warning_not_a_failure() {
    let artifact = ArtifactSnapshot::new("html-page", "html", "<div><script>alert(1)</script></div>");
    let result = orchestrator().execute(Uuid::new_v4(), &artifact, None).await;

    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.output.as_deref(), Some("HTML validated successfully"));
    assert_eq!(result.exit_code, Some(0));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.starts_with("Potentially unsafe pattern detected") && w.contains("script")));
}

#[tokio::test]
async fn test_react_eval_fails_validation() {
    let artifact = ArtifactSnapshot::new(
        "react-component",
        "jsx",
        "import React from 'react';\nexport default () => <p>{eval('1')}</p>;",
    );
    let result = orchestrator().execute(Uuid::new_v4(), &artifact, None).await;

    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.error.unwrap().contains("eval()"));
}

#[tokio::test]
async fn test_react_warnings_are_carried() {
    let artifact = ArtifactSnapshot::new(
        "react-component",
        "jsx",
        "function Card() { return <div dangerouslySetInnerHTML={{__html: x}} />; }",
    );
    let result = orchestrator().execute(Uuid::new_v4(), &artifact, None).await;

    assert!(result.is_success());
    assert_eq!(result.output.as_deref(), Some("React component validated successfully"));
    assert_eq!(result.warnings.len(), 3);
}

#[tokio::test]
async fn test_language_is_used_when_type_is_unknown() {
    let artifact = ArtifactSnapshot::new("snippet", "javascript", "console.log('via language')");
    let result = orchestrator().execute(Uuid::new_v4(), &artifact, None).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.stdout, "via language");
}

#[tokio::test]
async fn test_type_wins_over_language() {
    // The type says HTML, so the JavaScript is only audited, never run.
    let artifact = ArtifactSnapshot::new("html-page", "javascript", "console.log('ran')");
    let result = orchestrator().execute(Uuid::new_v4(), &artifact, None).await;

    assert!(result.is_success());
    assert!(result.stdout.is_empty());
    assert_eq!(result.output.as_deref(), Some("HTML validated successfully"));
}

#[tokio::test]
async fn test_typescript_routes_to_type_erasing_runner() {
    let ts = ArtifactSnapshot::new("typescript-snippet", "typescript", "const n: number = 2;\nconsole.log(n * 2)");
    let result = orchestrator().execute(Uuid::new_v4(), &ts, None).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.stdout, "4");

    let js = ArtifactSnapshot::new("javascript-snippet", "javascript", "console.log(\"save as PDF\")");
    let result = orchestrator().execute(Uuid::new_v4(), &js, None).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.stdout, "save as PDF");
}

#[tokio::test]
async fn test_unknown_artifact_gets_no_runner_error() {
    let artifact = ArtifactSnapshot::new("spreadsheet", "cobol", "MOVE 1 TO X.");
    let id = Uuid::new_v4();
    let result = orchestrator().execute(id, &artifact, None).await;

    assert_eq!(result.execution_id, id);
    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.error.unwrap().contains("No runner available"));
}

#[tokio::test]
async fn test_missing_runner_in_partial_registry() {
    let orchestrator =
        Orchestrator::new(ResourceLimits::default()).with_runner(Arc::new(HtmlRunner::new()));
    let artifact = ArtifactSnapshot::new("python-script", "python", "print(1)");
    let result = orchestrator.execute(Uuid::new_v4(), &artifact, None).await;

    assert_eq!(result.status, ResultStatus::Error);
    assert!(result.error.unwrap().contains("No runner available"));
}

#[tokio::test]
async fn test_runner_panic_becomes_error_result() {
    let orchestrator =
        Orchestrator::new(ResourceLimits::default()).with_runner(Arc::new(PanickingRunner));
    let artifact = ArtifactSnapshot::new("python-script", "python", "print(1)");
    let result = orchestrator.execute(Uuid::new_v4(), &artifact, None).await;

    assert_eq!(result.status, ResultStatus::Error);
    let error = result.error.unwrap();
    assert!(error.contains("python runner failed"), "{}", error);
}

#[tokio::test]
async fn test_artifact_limits_override_defaults() {
    let orchestrator =
        Orchestrator::new(ResourceLimits::default()).with_runner(Arc::new(LimitEchoRunner));
    let artifact = ArtifactSnapshot::new("html-page", "html", "<p>").with_limits(
        ResourceLimitsOverride {
            max_execution_time_ms: Some(120),
            ..Default::default()
        },
    );

    let result = orchestrator.execute(Uuid::new_v4(), &artifact, None).await;
    assert_eq!(result.output.as_deref(), Some("120"));
    assert!(result.duration >= 120);
}

#[tokio::test]
async fn test_local_client_applies_transport_timeout() {
    let orchestrator = Arc::new(
        Orchestrator::new(ResourceLimits::default()).with_runner(Arc::new(LimitEchoRunner)),
    );
    let client = LocalOrchestratorClient::new(orchestrator);
    let request = ExecuteRequest {
        execution_id: Uuid::new_v4(),
        artifact: ArtifactSnapshot::new("html-page", "html", "<p>").with_limits(
            ResourceLimitsOverride {
                max_execution_time_ms: Some(5_000),
                ..Default::default()
            },
        ),
        input: None,
    };

    let started = Instant::now();
    let err = client
        .execute(&request, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
    assert!(err.is_time_based());
    assert!(started.elapsed() < Duration::from_secs(2));
}
