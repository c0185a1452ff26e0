use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::server::ApiEnvelope;
use super::{ExecuteRequest, ExecutionResult, Orchestrator};

/// Failure between the queue and the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Connection aborted: {0}")]
    ConnectionAborted(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Orchestrator returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Invalid orchestrator response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Whether the failure signature points at a time-based abort. Such
    /// failures end an execution as TIMEOUT rather than FAILED.
    pub fn is_time_based(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::ConnectionAborted(_) => true,
            TransportError::Connection(msg) | TransportError::Remote { message: msg, .. } => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("timeout") || msg.contains("timed out")
            }
            TransportError::Decode(_) => false,
        }
    }
}

/// Transport used by the queue to reach the orchestrator.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, TransportError>;
}

/// Calls `POST {base}/execute` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOrchestratorClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpOrchestratorClient {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/execute", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OrchestratorClient for HttpOrchestratorClient {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, TransportError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status();
        let envelope: ApiEnvelope<ExecutionResult> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Decode(e.to_string())
            }
        })?;

        match envelope {
            ApiEnvelope {
                success: true,
                data: Some(result),
                ..
            } => Ok(result),
            ApiEnvelope {
                error: Some(error), ..
            } => Err(TransportError::Remote {
                status: status.as_u16(),
                message: format!("{} ({})", error.message, error.code),
            }),
            _ => Err(TransportError::Decode(format!(
                "response with status {} carried neither data nor error",
                status
            ))),
        }
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout(timeout);
    }
    if is_aborted(&err) {
        return TransportError::ConnectionAborted(err.to_string());
    }
    TransportError::Connection(err.to_string())
}

/// Walks the source chain looking for an aborted or reset socket.
fn is_aborted(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
            ) {
                return true;
            }
        }
        source = e.source();
    }
    false
}

/// Calls an in-process orchestrator, bounded by the same timeout the HTTP
/// client would apply.
#[derive(Clone)]
pub struct LocalOrchestratorClient {
    orchestrator: Arc<Orchestrator>,
}

impl LocalOrchestratorClient {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl OrchestratorClient for LocalOrchestratorClient {
    async fn execute(
        &self,
        request: &ExecuteRequest,
        timeout: Duration,
    ) -> Result<ExecutionResult, TransportError> {
        tokio::time::timeout(
            timeout,
            self.orchestrator.execute(
                request.execution_id,
                &request.artifact,
                request.input.as_ref(),
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_based_classification() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_time_based());
        assert!(TransportError::ConnectionAborted("reset".to_string()).is_time_based());
        assert!(TransportError::Remote {
            status: 504,
            message: "Upstream Timeout".to_string()
        }
        .is_time_based());
        assert!(!TransportError::Connection("connection refused".to_string()).is_time_based());
        assert!(!TransportError::Decode("bad json".to_string()).is_time_based());
    }

    #[test]
    fn endpoint_is_derived_from_base_url() {
        let client = HttpOrchestratorClient::new("http://127.0.0.1:8080/").unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:8080/execute");
    }

    #[test]
    fn io_abort_in_source_chain_is_detected() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_aborted(&io));
        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert!(!is_aborted(&other));
    }
}
