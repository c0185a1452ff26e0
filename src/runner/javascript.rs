//! JavaScript/TypeScript runner using rquickjs

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rquickjs::{Context, Ctx, Function, Runtime as QjsRuntime, Value};

use super::transpile::{prepare_script, referenced_modules, root_module, Dialect};
use super::{disallowed_modules, ensure_not_empty, Runner, RunnerInput, RunnerKind, RunnerResult};
use crate::config::{ResourceLimits, RunnerConfig};
use crate::error::ExecError;

/// Slack on top of the in-sandbox deadline before the async side gives up.
const BACKSTOP_SLACK: Duration = Duration::from_secs(1);

const PRELUDE: &str = r#"
(function (emit, allowed) {
  const fmt = (v) => {
    if (typeof v === 'string') return v;
    if (v === undefined) return 'undefined';
    if (typeof v === 'function') return '[Function' + (v.name ? ': ' + v.name : ' (anonymous)') + ']';
    if (v instanceof Error) return v.name + ': ' + v.message;
    try {
      const s = JSON.stringify(v);
      return s === undefined ? String(v) : s;
    } catch (_) {
      return String(v);
    }
  };
  const line = (args) => args.map(fmt).join(' ');

  const assert = (cond, msg) => { if (!cond) throw new Error(msg || 'Assertion failed'); };
  assert.ok = assert;
  assert.equal = (a, b, msg) => { if (a != b) throw new Error(msg || fmt(a) + ' == ' + fmt(b)); };
  assert.strictEqual = (a, b, msg) => { if (a !== b) throw new Error(msg || fmt(a) + ' === ' + fmt(b)); };
  assert.deepStrictEqual = (a, b, msg) => {
    if (JSON.stringify(a) !== JSON.stringify(b)) throw new Error(msg || fmt(a) + ' deepStrictEqual ' + fmt(b));
  };
  const shims = {
    assert: Object.freeze(assert),
    util: Object.freeze({ format: (...a) => line(a), inspect: (v) => fmt(v) }),
  };

  const rootOf = (spec) => {
    const s = spec.startsWith('node:') ? spec.slice(5) : spec;
    const parts = s.split('/');
    return s.startsWith('@') ? parts.slice(0, 2).join('/') : parts[0];
  };

  globalThis.console = Object.freeze({
    log: (...a) => emit('log', line(a)),
    info: (...a) => emit('info', line(a)),
    debug: (...a) => emit('debug', line(a)),
    warn: (...a) => emit('warn', line(a)),
    error: (...a) => emit('error', line(a)),
  });
  globalThis.require = function require(name) {
    const root = rootOf(String(name));
    if (!allowed.includes(root)) throw new Error("Module '" + name + "' is not allowed");
    if (!(root in shims)) throw new Error("Module '" + name + "' is not available in the sandbox");
    return shims[root];
  };
  globalThis.process = Object.freeze({
    env: Object.freeze({}),
    argv: Object.freeze([]),
    platform: 'sandbox',
  });
})(__emit, __allowed);
delete globalThis.__emit;
delete globalThis.__allowed;
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

#[derive(Debug, Clone)]
struct ConsoleLine {
    stream: Stream,
    is_error: bool,
    text: String,
}

/// Console lines kept on the host side, bounded by the output cap.
#[derive(Debug, Default)]
struct Capture {
    lines: Vec<ConsoleLine>,
    bytes: usize,
}

#[derive(Debug, Default)]
struct SandboxOutcome {
    lines: Vec<ConsoleLine>,
    returned: Option<String>,
    exception: Option<String>,
    timed_out: bool,
    output_exceeded: bool,
}

/// Runs JavaScript (and lightly-typed TypeScript) in a fresh QuickJS runtime.
///
/// The sandbox exposes captured `console` methods, an allow-listed `require`,
/// a frozen `process` with an empty `env`, and the request input as `input`.
/// There is no filesystem, network or timer access. Console output is
/// bounded by `max_output_bytes`.
#[derive(Debug, Clone)]
pub struct JavaScriptRunner {
    allowed_modules: Vec<String>,
    dialect: Dialect,
}

impl JavaScriptRunner {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            allowed_modules: config.allowed_node_modules.clone(),
            dialect: Dialect::JavaScript,
        }
    }

    /// Same sandbox, with type annotations erased before evaluation.
    pub fn typescript(config: &RunnerConfig) -> Self {
        Self {
            dialect: Dialect::TypeScript,
            ..Self::new(config)
        }
    }

    async fn run(
        &self,
        content: &str,
        input: Option<RunnerInput<'_>>,
        limits: &ResourceLimits,
    ) -> Result<RunnerResult, ExecError> {
        ensure_not_empty(content)?;

        let specifiers = referenced_modules(content);
        let rejected = disallowed_modules(
            specifiers.iter().map(|s| root_module(s)),
            &self.allowed_modules,
        );
        if !rejected.is_empty() {
            return Err(ExecError::UnauthorizedImports(rejected));
        }

        let script = prepare_script(content, self.dialect);
        let input_json = match input {
            Some(i) => serde_json::to_string(i.value)
                .map_err(|e| ExecError::RunnerFault(format!("Failed to encode input: {}", e)))?,
            None => "null".to_string(),
        };
        let allowed_json = serde_json::to_string(&self.allowed_modules)
            .map_err(|e| ExecError::RunnerFault(format!("Failed to encode allow-list: {}", e)))?;

        let budget = limits.execution_timeout();
        let memory = limits.max_memory_bytes();
        let max_output = limits.max_output_bytes;

        let outcome = tokio::time::timeout(
            budget + BACKSTOP_SLACK,
            tokio::task::spawn_blocking(move || {
                evaluate(&script, &input_json, &allowed_json, budget, memory, max_output)
            }),
        )
        .await
        .map_err(|_| timeout_error(limits))?
        .map_err(|e| ExecError::RunnerFault(format!("Sandbox task failed: {}", e)))??;

        if outcome.output_exceeded {
            tracing::warn!(max_output, "JavaScript output limit exceeded, evaluation interrupted");
            return Err(ExecError::ResourceExceeded(format!(
                "Output size limit exceeded ({} bytes)",
                max_output
            )));
        }
        if outcome.timed_out {
            return Err(timeout_error(limits));
        }
        Ok(into_result(outcome))
    }
}

#[async_trait]
impl Runner for JavaScriptRunner {
    fn kind(&self) -> RunnerKind {
        match self.dialect {
            Dialect::JavaScript => RunnerKind::JavaScript,
            Dialect::TypeScript => RunnerKind::TypeScript,
        }
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
                tracing::warn!(error = %e, "JavaScript execution failed");
                let mut result = RunnerResult::from_error(&e);
                // Source rejected before evaluation never produced an exit status.
                if !matches!(e, ExecError::Validation(_) | ExecError::UnauthorizedImports(_)) {
                    result.exit_code = Some(1);
                }
                result
            }
        };
        result.with_cpu_time(started.elapsed().as_millis() as u64)
    }
}

fn timeout_error(limits: &ResourceLimits) -> ExecError {
    ExecError::ResourceExceeded(format!(
        "Execution timed out after {}ms",
        limits.max_execution_time_ms
    ))
}

fn into_result(outcome: SandboxOutcome) -> RunnerResult {
    let join = |stream: Stream| {
        outcome
            .lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };
    let stdout = join(Stream::Out);
    let stderr = join(Stream::Err);
    let console_errors: Vec<&str> = outcome
        .lines
        .iter()
        .filter(|l| l.is_error)
        .map(|l| l.text.as_str())
        .collect();

    let mut output = stdout.clone();
    if let Some(returned) = outcome.returned {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&returned);
    }

    let error = match outcome.exception {
        Some(exception) => Some(exception),
        None if !console_errors.is_empty() => Some(console_errors.join("\n")),
        None => None,
    };
    let success = error.is_none();

    RunnerResult {
        success,
        output: if output.is_empty() { None } else { Some(output) },
        error,
        exit_code: Some(if success { 0 } else { 1 }),
        stdout,
        stderr,
        ..Default::default()
    }
}

/// Evaluates `script` in a new runtime. Blocking; call from a blocking task.
///
/// Evaluation is interrupted once the deadline passes or the console output
/// exceeds `max_output` bytes.
fn evaluate(
    script: &str,
    input_json: &str,
    allowed_json: &str,
    budget: Duration,
    memory_limit: usize,
    max_output: usize,
) -> Result<SandboxOutcome, ExecError> {
    let runtime = QjsRuntime::new()
        .map_err(|e| ExecError::RunnerFault(format!("Failed to create runtime: {}", e)))?;
    runtime.set_memory_limit(memory_limit);

    let timed_out = Arc::new(AtomicBool::new(false));
    let output_exceeded = Arc::new(AtomicBool::new(false));
    let deadline = Instant::now() + budget;
    let flag = timed_out.clone();
    let overflow = output_exceeded.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        if overflow.load(Ordering::SeqCst) {
            true
        } else if Instant::now() >= deadline {
            flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    })));

    let context = Context::full(&runtime)
        .map_err(|e| ExecError::RunnerFault(format!("Failed to create context: {}", e)))?;

    let capture = Rc::new(RefCell::new(Capture::default()));
    let sink = OutputSink {
        capture: capture.clone(),
        max_output,
        exceeded: output_exceeded.clone(),
    };

    let (returned, exception) = context.with(|ctx| -> Result<_, ExecError> {
        install_globals(&ctx, sink, input_json, allowed_json)?;

        match ctx.eval::<Value, _>(script) {
            Ok(value) => Ok((format_value(&ctx, value), None)),
            Err(rquickjs::Error::Exception) => Ok((None, Some(describe_exception(&ctx)))),
            Err(e) => Ok((None, Some(e.to_string()))),
        }
    })?;

    let lines = std::mem::take(&mut capture.borrow_mut().lines);
    Ok(SandboxOutcome {
        lines,
        returned,
        exception,
        timed_out: timed_out.load(Ordering::SeqCst),
        output_exceeded: output_exceeded.load(Ordering::SeqCst),
    })
}

/// Host side of `console`. Lines past the cap are dropped and the overflow
/// flag makes the interrupt handler stop evaluation.
struct OutputSink {
    capture: Rc<RefCell<Capture>>,
    max_output: usize,
    exceeded: Arc<AtomicBool>,
}

impl OutputSink {
    fn push(&self, stream: Stream, is_error: bool, text: String) {
        if self.exceeded.load(Ordering::SeqCst) {
            return;
        }
        let mut capture = self.capture.borrow_mut();
        capture.bytes = capture.bytes.saturating_add(text.len() + 1);
        if capture.bytes > self.max_output {
            self.exceeded.store(true, Ordering::SeqCst);
            return;
        }
        capture.lines.push(ConsoleLine {
            stream,
            is_error,
            text,
        });
    }
}

fn install_globals<'js>(
    ctx: &Ctx<'js>,
    sink: OutputSink,
    input_json: &str,
    allowed_json: &str,
) -> Result<(), ExecError> {
    let fault = |what: &str, e: rquickjs::Error| {
        ExecError::RunnerFault(format!("Failed to install {}: {}", what, e))
    };
    let globals = ctx.globals();

    let emit = Function::new(ctx.clone(), move |level: String, text: String| {
        let (stream, is_error) = match level.as_str() {
            "warn" => (Stream::Err, false),
            "error" => (Stream::Err, true),
            _ => (Stream::Out, false),
        };
        sink.push(stream, is_error, text);
    })
    .map_err(|e| fault("console", e))?;
    globals.set("__emit", emit).map_err(|e| fault("console", e))?;

    let allowed = ctx
        .json_parse(allowed_json)
        .map_err(|e| fault("module allow-list", e))?;
    globals
        .set("__allowed", allowed)
        .map_err(|e| fault("module allow-list", e))?;

    let input = ctx.json_parse(input_json).map_err(|e| fault("input", e))?;
    globals.set("input", input).map_err(|e| fault("input", e))?;

    ctx.eval::<(), _>(PRELUDE).map_err(|e| fault("sandbox prelude", e))?;
    Ok(())
}

/// Renders a completion value for output; `undefined` yields nothing.
fn format_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Option<String> {
    if value.is_undefined() {
        return None;
    }
    if let Some(s) = value.as_string() {
        return s.to_string().ok();
    }
    ctx.json_stringify(value)
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
}

fn describe_exception(ctx: &Ctx<'_>) -> String {
    let caught = ctx.catch();
    if let Some(exception) = caught.as_exception() {
        let message = exception.message().unwrap_or_default();
        let name: Option<String> = exception.get("name").ok();
        return match name {
            Some(name) if !name.is_empty() => format!("{}: {}", name, message),
            _ => message,
        };
    }
    if let Some(s) = caught.as_string() {
        if let Ok(s) = s.to_string() {
            return s;
        }
    }
    ctx.json_stringify(caught)
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Unknown error".to_string())
}
