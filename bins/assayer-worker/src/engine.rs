/// Execution Engine - Runs One Candidate Program Once
///
/// **Core Responsibility:**
/// Launch a candidate program with a JSON payload on stdin and capture its raw
/// outcome: stdout, stderr, exit code, duration and best-effort resource usage.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (which interpreter, pipes, timeouts, cleanup)
/// - Engine does NOT know expected outputs or scoring rules
/// - Engine never returns an error: every failure, including its own, becomes
///   a classified `ExecutionOutcome`
///
/// **Process Rules:**
/// 1. Interpreter is chosen solely by the declared language
/// 2. stdin is written from a separate task and closed, stdout/stderr are
///    drained concurrently with the wait so full pipes cannot deadlock
/// 3. On timeout the whole process group is killed and reaped
/// 4. A run abandoned midway (e.g. the worker is cancelled) still kills the
///    process group when its future is dropped

use crate::config::LanguageConfigManager;
use assayer_common::types::{ErrorType, Language, ResourceUsage};
use serde_json::Value;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Safety limit to keep pathological payloads away from the candidate
const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long pipes may keep draining once the process itself has exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Raw result of a single harness invocation.
///
/// `success`, `error_type == None` and `exit_code == 0` always agree.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub resources: ResourceUsage,
}

impl ExecutionOutcome {
    /// Outcome for a failure that happened before or around the candidate process.
    fn infrastructure(error_type: ErrorType, message: String, duration: Duration) -> Self {
        Self {
            success: false,
            error_type: Some(error_type),
            error_message: Some(message.clone()),
            duration,
            stdout: String::new(),
            stderr: message,
            exit_code: -1,
            resources: ResourceUsage::default(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

/// Subprocess-based execution engine
pub struct ProcessEngine {
    languages: LanguageConfigManager,
}

impl ProcessEngine {
    pub fn new(languages: LanguageConfigManager) -> Self {
        Self { languages }
    }

    pub fn languages(&self) -> &LanguageConfigManager {
        &self.languages
    }

    /// Run `path` once with `input` serialized to stdin.
    ///
    /// Never fails: spawn errors, oversized input and unsupported languages are
    /// all reported through the returned outcome.
    #[tracing::instrument(skip(self, input), fields(language = %language, path = %path.display()))]
    pub async fn run(
        &self,
        path: &Path,
        language: Language,
        input: &Value,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let start = Instant::now();

        let payload = match serde_json::to_vec(input) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionOutcome::infrastructure(
                    ErrorType::UnknownError,
                    format!("Failed to serialize input payload: {}", e),
                    start.elapsed(),
                )
            }
        };
        if payload.len() > MAX_INPUT_BYTES {
            return ExecutionOutcome::infrastructure(
                ErrorType::UnknownError,
                format!("Input payload exceeds maximum size of {} bytes", MAX_INPUT_BYTES),
                start.elapsed(),
            );
        }

        let exec = match self.languages.get_config(&language) {
            Some(exec) => exec,
            None => {
                return ExecutionOutcome::infrastructure(
                    ErrorType::CompilationError,
                    format!("Unsupported language: {}", language),
                    start.elapsed(),
                )
            }
        };

        if !path.exists() {
            return ExecutionOutcome::infrastructure(
                ErrorType::UnknownError,
                format!("Candidate program not found: {}", path.display()),
                start.elapsed(),
            );
        }

        let mut cmd = Command::new(&exec.command);
        cmd.args(&exec.args)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %exec.command, error = %e, "Failed to launch interpreter");
                return ExecutionOutcome::infrastructure(
                    ErrorType::UnknownError,
                    format!("Failed to launch '{}': {}", exec.command, e),
                    start.elapsed(),
                );
            }
        };
        let pid = child.id();
        let mut group = GroupGuard::new(pid);

        let stdin = child.stdin.take();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The candidate may exit without reading; a broken pipe is not our failure.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout_buf = PipeBuffer::default();
        let stderr_buf = PipeBuffer::default();
        let mut stdout_reader = tokio::spawn(read_pipe(child.stdout.take(), stdout_buf.clone()));
        let mut stderr_reader = tokio::spawn(read_pipe(child.stderr.take(), stderr_buf.clone()));
        let sampler = ResourceSampler::spawn(pid);

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let resources = sampler.finish().await;

        let outcome = match waited {
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f64(), "Execution timed out - killing process group");
                kill_process_tree(&mut child, pid).await;
                writer.abort();
                stdout_reader.abort();
                stderr_reader.abort();

                let message = format!("Execution timed out after {} seconds", timeout.as_secs());
                ExecutionOutcome {
                    success: false,
                    error_type: Some(ErrorType::TimeoutError),
                    error_message: Some(message.clone()),
                    duration: timeout,
                    stdout: String::new(),
                    stderr: message,
                    exit_code: -1,
                    resources: ResourceUsage::default(),
                }
            }
            Ok(Err(e)) => {
                kill_process_tree(&mut child, pid).await;
                writer.abort();
                stdout_reader.abort();
                stderr_reader.abort();
                ExecutionOutcome::infrastructure(
                    ErrorType::UnknownError,
                    format!("Failed to wait for candidate process: {}", e),
                    start.elapsed(),
                )
            }
            Ok(Ok(status)) => {
                writer.abort();
                let (stdout, stdout_complete) = drain(&mut stdout_reader, &stdout_buf).await;
                let (stderr, stderr_complete) = drain(&mut stderr_reader, &stderr_buf).await;
                if !(stdout_complete && stderr_complete) {
                    // Something the candidate spawned still holds the pipes open.
                    warn!("Output pipes still open after exit - killing process group");
                    kill_process_tree(&mut child, pid).await;
                }

                let exit_code = exit_code_of(status);
                let duration = start.elapsed();
                debug!(exit_code, duration_ms = duration.as_millis() as u64, "Candidate exited");

                if exit_code == 0 {
                    ExecutionOutcome {
                        success: true,
                        error_type: None,
                        error_message: None,
                        duration,
                        stdout,
                        stderr,
                        exit_code,
                        resources,
                    }
                } else {
                    let error_type = classify_error(language, &stderr);
                    let error_message = if stderr.trim().is_empty() { None } else { Some(stderr.clone()) };
                    ExecutionOutcome {
                        success: false,
                        error_type: Some(error_type),
                        error_message,
                        duration,
                        stdout,
                        stderr,
                        exit_code,
                        resources,
                    }
                }
            }
        };
        group.disarm();
        outcome
    }
}

/// Bytes read from one pipe so far, shared with the reader task.
#[derive(Clone, Default)]
struct PipeBuffer(Arc<Mutex<Vec<u8>>>);

impl PipeBuffer {
    async fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().await).into_owned()
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, sink: PipeBuffer) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.0.lock().await.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!(error = %e, "Pipe read ended with error");
                break;
            }
        }
    }
}

/// Wait for a reader to hit EOF, up to the drain grace period. Whatever was
/// read before the deadline is kept; the flag says whether EOF was reached.
async fn drain(reader: &mut JoinHandle<()>, buf: &PipeBuffer) -> (String, bool) {
    let complete = match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut *reader).await {
        Ok(_) => true,
        Err(_) => {
            reader.abort();
            false
        }
    };
    (buf.text().await, complete)
}

/// Kills the candidate's process group if a run is dropped before it finishes.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.take() {
            // Drop cannot await, so this one kill is synchronous.
            let group = format!("-{}", pid);
            let status = std::process::Command::new("kill")
                .args(["-KILL", "--", group.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(_) => debug!(pid, "Killed process group of abandoned run"),
                Err(e) => debug!(error = %e, "Process group kill unavailable"),
            }
        }
    }
}

/// Kill the candidate's process group (unix) and the direct child, then reap it.
async fn kill_process_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let group = format!("-{}", pid);
        let status = Command::new("kill")
            .args(["-KILL", "--", group.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            debug!(error = %e, "Process group kill unavailable");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already gone");
    }
    let _ = child.wait().await;
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Polls `/proc` for the candidate's CPU time and resident memory until stopped.
struct ResourceSampler {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<ResourceUsage>,
}

impl ResourceSampler {
    fn spawn(pid: Option<u32>) -> Self {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut usage = ResourceUsage::default();
            let pid = match pid {
                Some(pid) => pid,
                None => return usage,
            };
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => match sample_process(pid) {
                        Some(sample) => {
                            usage.cpu_time = usage.cpu_time.max(sample.cpu_time);
                            usage.memory_usage = sample.memory_usage;
                            usage.peak_memory_usage = usage
                                .peak_memory_usage
                                .max(sample.peak_memory_usage)
                                .max(sample.memory_usage);
                        }
                        None => break,
                    },
                }
            }
            usage
        });
        Self { stop, handle }
    }

    async fn finish(self) -> ResourceUsage {
        let _ = self.stop.send(());
        self.handle.await.unwrap_or_default()
    }
}

#[cfg(target_os = "linux")]
fn sample_process(pid: u32) -> Option<ResourceUsage> {
    // Kernel clock ticks per second; 100 on every mainstream Linux configuration.
    const CLOCK_TICKS: f64 = 100.0;

    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the parenthesised command name start at field 3 (state).
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: f64 = fields.get(11)?.parse().ok()?;
    let stime: f64 = fields.get(12)?.parse().ok()?;

    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let kb = |key: &str| -> f64 {
        status
            .lines()
            .find(|line| line.starts_with(key))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    Some(ResourceUsage {
        cpu_time: (utime + stime) / CLOCK_TICKS,
        memory_usage: kb("VmRSS:") / 1024.0,
        peak_memory_usage: kb("VmHWM:") / 1024.0,
    })
}

#[cfg(not(target_os = "linux"))]
fn sample_process(_pid: u32) -> Option<ResourceUsage> {
    None
}

/// Ordered stderr keyword rules: a rule matches when every needle is present.
type Rule = (&'static [&'static str], ErrorType);

const PYTHON_RULES: &[Rule] = &[
    (&["syntaxerror"], ErrorType::SyntaxError),
    (&["indentationerror"], ErrorType::SyntaxError),
    (&["modulenotfounderror"], ErrorType::ImportError),
    (&["importerror"], ErrorType::ImportError),
    (&["no module named"], ErrorType::ImportError),
    (&["nameerror"], ErrorType::NameError),
    (&["is not defined"], ErrorType::NameError),
    (&["typeerror"], ErrorType::TypeError),
    (&["valueerror"], ErrorType::ValueError),
    (&["keyerror"], ErrorType::KeyError),
    (&["indexerror"], ErrorType::IndexError),
    (&["attributeerror"], ErrorType::AttributeError),
];

const JAVASCRIPT_RULES: &[Rule] = &[
    (&["referenceerror"], ErrorType::ReferenceError),
    (&["is not defined"], ErrorType::ReferenceError),
    (&["typeerror"], ErrorType::TypeError),
    (&["syntaxerror"], ErrorType::SyntaxError),
    (&["import", "not found"], ErrorType::ImportError),
    (&["cannot find module"], ErrorType::ImportError),
];

const GO_RULES: &[Rule] = &[
    (&["compilation error"], ErrorType::CompilationError),
    (&["undefined"], ErrorType::NameError),
    (&["syntax error"], ErrorType::SyntaxError),
    (&["imported and not used"], ErrorType::ImportError),
    (&["cannot find package"], ErrorType::ImportError),
    (&["no required module provides package"], ErrorType::ImportError),
    (&["cannot use"], ErrorType::TypeError),
    (&["mismatched types"], ErrorType::TypeError),
    (&["type", "error"], ErrorType::TypeError),
];

/// Classify a non-zero exit from its stderr text. Pure function of (language, text).
pub fn classify_error(language: Language, stderr: &str) -> ErrorType {
    let text = stderr.to_lowercase();
    if text.trim().is_empty() {
        return ErrorType::RuntimeError;
    }
    let rules = match language {
        Language::Python => PYTHON_RULES,
        Language::JavaScript => JAVASCRIPT_RULES,
        Language::Go => GO_RULES,
    };
    rules
        .iter()
        .find(|(needles, _)| needles.iter().all(|needle| text.contains(needle)))
        .map(|(_, error_type)| *error_type)
        .unwrap_or(ErrorType::RuntimeError)
}

/// Pull the one informative line out of a long error dump.
///
/// Prefers the first line containing `error:`; otherwise the last line that is
/// not part of a traceback frame.
pub fn extract_key_error(message: &str) -> String {
    let lines: Vec<&str> = message
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return String::new();
    }

    if let Some(line) = lines.iter().find(|line| line.to_lowercase().contains("error:")) {
        return line.trim().to_string();
    }

    lines
        .iter()
        .rev()
        .find(|line| !(line.starts_with("  File \"") || line.starts_with("    ")))
        .unwrap_or(&lines[lines.len() - 1])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_javascript() {
        assert_eq!(
            classify_error(Language::JavaScript, "ReferenceError: foo is not defined"),
            ErrorType::ReferenceError
        );
        assert_eq!(
            classify_error(Language::JavaScript, "TypeError: Cannot read properties of undefined"),
            ErrorType::TypeError
        );
        assert_eq!(
            classify_error(Language::JavaScript, "SyntaxError: Unexpected token '}'"),
            ErrorType::SyntaxError
        );
        assert_eq!(
            classify_error(Language::JavaScript, "Error: Cannot find module 'lodash'"),
            ErrorType::ImportError
        );
        assert_eq!(
            classify_error(Language::JavaScript, "Error: boom"),
            ErrorType::RuntimeError
        );
    }

    #[test]
    fn test_classify_go() {
        assert_eq!(
            classify_error(Language::Go, "./Solution.go:5:2: undefined: foo"),
            ErrorType::NameError
        );
        assert_eq!(
            classify_error(Language::Go, "./Solution.go:3:1: syntax error: unexpected }"),
            ErrorType::SyntaxError
        );
        assert_eq!(
            classify_error(Language::Go, "./Solution.go:4:2: \"os\" imported and not used"),
            ErrorType::ImportError
        );
        assert_eq!(
            classify_error(Language::Go, "cannot use x (variable of type int) as string value"),
            ErrorType::TypeError
        );
        assert_eq!(
            classify_error(Language::Go, "panic: runtime error: index out of range [3] with length 2"),
            ErrorType::RuntimeError
        );
    }

    #[test]
    fn test_classify_python() {
        let traceback = "Traceback (most recent call last):\n  File \"Solution.py\", line 3, in <module>\n    print(x)\nNameError: name 'x' is not defined";
        assert_eq!(classify_error(Language::Python, traceback), ErrorType::NameError);
        assert_eq!(
            classify_error(Language::Python, "ModuleNotFoundError: No module named 'numpy'"),
            ErrorType::ImportError
        );
        assert_eq!(
            classify_error(Language::Python, "KeyError: 'ward'"),
            ErrorType::KeyError
        );
        assert_eq!(
            classify_error(Language::Python, "  File \"x.py\", line 1\nSyntaxError: invalid syntax"),
            ErrorType::SyntaxError
        );
    }

    #[test]
    fn test_classify_empty_stderr() {
        assert_eq!(classify_error(Language::Python, ""), ErrorType::RuntimeError);
        assert_eq!(classify_error(Language::Go, "   \n"), ErrorType::RuntimeError);
    }

    #[test]
    fn test_extract_key_error_picks_informative_line() {
        let msg = "# command-line-arguments\n./Solution.go:5:2: undefined: foo\n";
        assert_eq!(extract_key_error(msg), "./Solution.go:5:2: undefined: foo");

        let msg = "warning\nTypeError: x is not a function\n    at main (Solution.js:3:5)";
        assert_eq!(extract_key_error(msg), "TypeError: x is not a function");
    }

    #[test]
    fn test_extract_key_error_skips_traceback_frames() {
        let traceback = "Traceback (most recent call last):\n  File \"Solution.py\", line 3, in <module>\n    main()\nZeroDivisionError: division by zero";
        assert_eq!(extract_key_error(traceback), "ZeroDivisionError: division by zero");
        assert_eq!(extract_key_error(""), "");
        assert_eq!(extract_key_error("\n\n  \n"), "");
    }
}
