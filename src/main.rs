use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use artifact_runner::api::CreateExecutionRequest;
use artifact_runner::artifact::ArtifactSnapshot;
use artifact_runner::config::{ResourceLimits, RunnerConfig, ServiceConfig};
use artifact_runner::execution::Execution;
use artifact_runner::orchestrator::server::ApiEnvelope;
use artifact_runner::orchestrator::{ExecutionResult, Orchestrator};
use artifact_runner::service::Service;
use artifact_runner::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "artifact-runner")]
#[command(version)]
#[command(about = "Queued, sandboxed execution of code artifacts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator and queue API
    Serve(ServeArgs),

    /// Execute a file once, in process, without the queue
    Run {
        #[command(flatten)]
        artifact: ArtifactArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Submit a file to a running server's queue
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        artifact: ArtifactArgs,

        /// Poll until the execution reaches a terminal status
        #[arg(long)]
        wait: bool,
    },

    /// Show one execution
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// The execution ID (UUID)
        execution_id: Uuid,
    },

    /// List all executions
    List {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Cancel a queued execution
    Cancel {
        #[command(flatten)]
        client: ClientArgs,

        /// The execution ID (UUID)
        execution_id: Uuid,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Orchestrator base URL used by the queue (defaults to this server)
    #[arg(long)]
    orchestrator_url: Option<String>,

    /// Default per-execution time limit in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Default memory ceiling in MB
    #[arg(long, default_value = "512")]
    max_memory_mb: u64,

    /// Default cap on captured output in bytes
    #[arg(long, default_value = "1048576")]
    max_output_bytes: usize,

    /// Python interpreter
    #[arg(long, default_value = "python3")]
    python_bin: PathBuf,

    /// Importable Python modules (comma-separated, replaces the default list)
    #[arg(long, value_delimiter = ',')]
    allow_python: Option<Vec<String>>,

    /// Requirable Node modules (comma-separated, replaces the default list)
    #[arg(long, value_delimiter = ',')]
    allow_node: Option<Vec<String>>,

    /// Seconds to wait for the queue to drain on shutdown
    #[arg(long, default_value = "30")]
    drain_timeout_secs: u64,
}

// =============================================================================
// Artifact and Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ArtifactArgs {
    /// Source file to execute
    file: PathBuf,

    /// Artifact type (inferred from the file extension when omitted)
    #[arg(long = "type")]
    artifact_type: Option<String>,

    /// Artifact language (inferred from the file extension when omitted)
    #[arg(long)]
    language: Option<String>,

    /// JSON input passed to the artifact
    #[arg(long)]
    input: Option<String>,

    /// Time limit in seconds for this artifact
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ExecutionListOutput<'a> {
    executions: &'a [Execution],
    total_count: usize,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Artifact type and language for a file extension.
fn infer_kind(path: &Path) -> Option<(&'static str, &'static str)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "py" => Some(("python-script", "python")),
        "js" | "mjs" | "cjs" => Some(("javascript-snippet", "javascript")),
        "ts" => Some(("typescript-snippet", "typescript")),
        "html" | "htm" => Some(("html-page", "html")),
        "jsx" => Some(("react-component", "jsx")),
        "tsx" => Some(("react-component", "tsx")),
        _ => None,
    }
}

async fn load_artifact(
    args: &ArtifactArgs,
) -> Result<(ArtifactSnapshot, Option<serde_json::Value>), Box<dyn std::error::Error>> {
    let content = tokio::fs::read_to_string(&args.file).await?;
    let inferred = infer_kind(&args.file);

    let artifact_type = args
        .artifact_type
        .clone()
        .or_else(|| inferred.map(|(t, _)| t.to_string()))
        .ok_or("cannot infer artifact type from extension, pass --type")?;
    let language = args
        .language
        .clone()
        .or_else(|| inferred.map(|(_, l)| l.to_string()))
        .ok_or("cannot infer language from extension, pass --language")?;

    let mut artifact = ArtifactSnapshot::new(artifact_type, language, content);
    if let Some(name) = args.file.file_name().and_then(|n| n.to_str()) {
        artifact = artifact.with_id(name);
    }
    if let Some(secs) = args.timeout_secs {
        artifact = artifact.with_limits(artifact_runner::config::ResourceLimitsOverride {
            max_execution_time_ms: Some(secs.saturating_mul(1000)),
            ..Default::default()
        });
    }

    let input = match &args.input {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    Ok((artifact, input))
}

fn print_block(label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    println!("{}:", label);
    for line in text.lines() {
        println!("  {}", line);
    }
}

fn print_execution(execution: &Execution) {
    println!("Execution ID:    {}", execution.id);
    println!("Status:          {}", execution.status);
    if let Some(artifact_id) = &execution.artifact_id {
        println!("Artifact:        {}", artifact_id);
    }
    if let Some(exit_code) = execution.exit_code {
        println!("Exit Code:       {}", exit_code);
    }
    if let Some(duration) = execution.duration {
        println!("Duration:        {}ms", duration);
    }
    for warning in &execution.warnings {
        println!("Warning:         {}", warning);
    }
    print_block("Output", execution.output.as_deref().unwrap_or_default());
    print_block("Stderr", execution.stderr.as_deref().unwrap_or_default());
    print_block("Error", execution.error.as_deref().unwrap_or_default());
}

/// Unwrap an API envelope, exiting on an error response.
async fn read_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let envelope: ApiEnvelope<T> = response.json().await?;
    match envelope {
        ApiEnvelope {
            success: true,
            data: Some(data),
            ..
        } => Ok(data),
        ApiEnvelope {
            error: Some(error), ..
        } => {
            eprintln!("Error: {} ({})", error.message, error.code);
            std::process::exit(1);
        }
        _ => Err("server returned an empty response".into()),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("info");

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let mut config = ServiceConfig::new(listen_addr);
    config.limits = ResourceLimits::default()
        .with_timeout_secs(args.timeout_secs)
        .with_max_memory_mb(args.max_memory_mb)
        .with_max_output_bytes(args.max_output_bytes);

    let mut runners = RunnerConfig::default().with_python_bin(args.python_bin);
    if let Some(libs) = args.allow_python {
        runners = runners.with_python_libraries(libs);
    }
    if let Some(modules) = args.allow_node {
        runners = runners.with_node_modules(modules);
    }
    config.runners = runners;
    config.queue = config.queue.with_drain_timeout_secs(args.drain_timeout_secs);
    if let Some(url) = args.orchestrator_url {
        config.queue.orchestrator_url = url;
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        orchestrator_url = %config.queue.orchestrator_url,
        timeout_ms = config.limits.max_execution_time_ms,
        "Starting artifact runner"
    );

    let shutdown = install_shutdown_handler()?;
    Service::new(config)?.run(shutdown).await
}

async fn handle_run(
    args: ArtifactArgs,
    output_format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    let (artifact, input) = load_artifact(&args).await?;
    let orchestrator = Arc::new(Orchestrator::from_config(
        &RunnerConfig::default(),
        ResourceLimits::default(),
    ));
    let result: ExecutionResult = orchestrator
        .execute(Uuid::new_v4(), &artifact, input.as_ref())
        .await;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Table => {
            println!(
                "Status:          {}",
                if result.is_success() { "success" } else { "error" }
            );
            if let Some(exit_code) = result.exit_code {
                println!("Exit Code:       {}", exit_code);
            }
            println!("Duration:        {}ms", result.duration);
            for warning in &result.warnings {
                println!("Warning:         {}", warning);
            }
            print_block("Stdout", &result.stdout);
            print_block("Stderr", &result.stderr);
            if result.is_success() {
                print_block("Output", result.output.as_deref().unwrap_or_default());
            } else {
                print_block("Error", result.error.as_deref().unwrap_or_default());
            }
        }
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_submit(
    client: ClientArgs,
    args: ArtifactArgs,
    wait: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (artifact, input) = load_artifact(&args).await?;
    let http = reqwest::Client::new();
    let base = client.addr.trim_end_matches('/');

    let response = http
        .post(format!("{}/api/executions", base))
        .json(&CreateExecutionRequest {
            artifact,
            input,
            user_id: None,
        })
        .send()
        .await?;
    let mut execution: Execution = read_envelope(response).await?;

    if wait {
        while !execution.status.is_terminal() {
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            let response = http
                .get(format!("{}/api/executions/{}", base, execution.id))
                .send()
                .await?;
            execution = read_envelope(response).await?;
        }
    }

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&execution)?),
        OutputFormat::Table if wait => print_execution(&execution),
        OutputFormat::Table => {
            println!("Execution queued");
            println!("Execution ID: {}", execution.id);
        }
    }
    Ok(())
}

async fn handle_status(
    client: ClientArgs,
    execution_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .get(format!(
            "{}/api/executions/{}",
            client.addr.trim_end_matches('/'),
            execution_id
        ))
        .send()
        .await?;
    let execution: Execution = read_envelope(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&execution)?),
        OutputFormat::Table => print_execution(&execution),
    }
    Ok(())
}

async fn handle_list(client: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .get(format!("{}/api/executions", client.addr.trim_end_matches('/')))
        .send()
        .await?;
    let executions: Vec<Execution> = read_envelope(response).await?;

    match client.output {
        OutputFormat::Json => {
            let output = ExecutionListOutput {
                executions: &executions,
                total_count: executions.len(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if executions.is_empty() {
                println!("No executions found.");
            } else {
                println!("{:<38} {:<10} {:<8} ARTIFACT", "EXECUTION ID", "STATUS", "EXIT");
                println!("{}", "-".repeat(78));
                for execution in &executions {
                    let exit = execution
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<38} {:<10} {:<8} {}",
                        execution.id,
                        execution.status.to_string(),
                        exit,
                        execution.artifact_id.as_deref().unwrap_or("-")
                    );
                }
                println!("\nTotal: {} executions", executions.len());
            }
        }
    }
    Ok(())
}

async fn handle_cancel(
    client: ClientArgs,
    execution_id: Uuid,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = reqwest::Client::new()
        .post(format!(
            "{}/api/executions/{}/cancel",
            client.addr.trim_end_matches('/'),
            execution_id
        ))
        .send()
        .await?;
    let execution: Execution = read_envelope(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&execution)?),
        OutputFormat::Table => println!("Execution {} cancelled", execution.id),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_server(serve_args).await,
        Commands::Run { artifact, output } => handle_run(artifact, output).await,
        Commands::Submit {
            client,
            artifact,
            wait,
        } => handle_submit(client, artifact, wait).await,
        Commands::Status {
            client,
            execution_id,
        } => handle_status(client, execution_id).await,
        Commands::List { client } => handle_list(client).await,
        Commands::Cancel {
            client,
            execution_id,
        } => handle_cancel(client, execution_id).await,
    }
}
