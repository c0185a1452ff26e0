use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_EXECUTION_TIME_MS: u64 = 30_000;
pub const DEFAULT_MAX_MEMORY_MB: u64 = 512;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Extra time the queue grants the transport on top of the runner's own limit,
/// so that a runner-side timeout is reported before the transport gives up.
pub const DEFAULT_TRANSPORT_GRACE_MS: u64 = 5_000;

/// Ceilings bounding one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget in milliseconds
    #[serde(rename = "maxExecutionTime")]
    pub max_execution_time_ms: u64,
    /// Memory ceiling in megabytes
    #[serde(rename = "maxMemory")]
    pub max_memory_mb: u64,
    /// Maximum bytes of captured stdout
    #[serde(rename = "maxOutputSize")]
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: DEFAULT_MAX_EXECUTION_TIME_MS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ResourceLimits {
    /// Limits with the timeout given in whole seconds, as accepted on the CLI.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.max_execution_time_ms = secs.saturating_mul(1000);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }

    pub fn max_memory_bytes(&self) -> usize {
        usize::try_from(self.max_memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    /// Apply a per-artifact override on top of these limits.
    pub fn merged(&self, overrides: Option<&ResourceLimitsOverride>) -> Self {
        let Some(o) = overrides else {
            return *self;
        };
        Self {
            max_execution_time_ms: o.max_execution_time_ms.unwrap_or(self.max_execution_time_ms),
            max_memory_mb: o.max_memory_mb.unwrap_or(self.max_memory_mb),
            max_output_bytes: o.max_output_bytes.unwrap_or(self.max_output_bytes),
        }
    }
}

/// Partial limits carried in `artifact.metadata.resourceLimits`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsOverride {
    #[serde(rename = "maxExecutionTime", skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,
    #[serde(rename = "maxMemory", skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(rename = "maxOutputSize", skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,
}

/// Per-language runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interpreter used by the Python runner
    pub python_bin: PathBuf,
    /// Top-level Python modules code may import
    pub allowed_python_libraries: Vec<String>,
    /// Modules JavaScript code may `require`
    pub allowed_node_modules: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            python_bin: PathBuf::from("python3"),
            allowed_python_libraries: [
                "math",
                "random",
                "datetime",
                "json",
                "re",
                "collections",
                "itertools",
                "functools",
                "string",
                "statistics",
                "decimal",
                "fractions",
                "typing",
                "dataclasses",
                "enum",
                "heapq",
                "bisect",
                "copy",
                "time",
                "numpy",
                "pandas",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_node_modules: vec!["assert".to_string(), "util".to_string()],
        }
    }
}

impl RunnerConfig {
    pub fn with_python_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.python_bin = bin.into();
        self
    }

    pub fn with_python_libraries(mut self, libs: Vec<String>) -> Self {
        self.allowed_python_libraries = libs;
        self
    }

    pub fn with_node_modules(mut self, modules: Vec<String>) -> Self {
        self.allowed_node_modules = modules;
        self
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Base URL of the orchestrator's HTTP endpoint
    pub orchestrator_url: String,
    /// Added to each execution's time limit to bound the transport call
    pub transport_grace_ms: u64,
    /// How long shutdown waits for the queue to drain
    pub drain_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: "http://127.0.0.1:8080".to_string(),
            transport_grace_ms: DEFAULT_TRANSPORT_GRACE_MS,
            drain_timeout_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn transport_grace(&self) -> Duration {
        Duration::from_millis(self.transport_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn with_drain_timeout_secs(mut self, secs: u64) -> Self {
        self.drain_timeout_ms = secs.saturating_mul(1000);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    pub limits: ResourceLimits,
    pub runners: RunnerConfig,
    pub queue: QueueConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            limits: ResourceLimits::default(),
            runners: RunnerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            queue: QueueConfig {
                orchestrator_url: format!("http://{}", loopback_of(listen_addr)),
                ..QueueConfig::default()
            },
            ..Default::default()
        }
    }
}

/// The address a local client should dial to reach a server bound to `addr`.
fn loopback_of(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    }
}
