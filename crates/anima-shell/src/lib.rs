#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-shell** – Restricted command runner for the Anima runtime.
//!
//! Used by the "shell" action type and the `/shell/execute` endpoint.
//! Commands must tokenize cleanly, start with a whitelisted program, use
//! only that program's allowed flags, and keep every path argument inside
//! the configured allowed directory. Anything else is rejected before a
//! process is spawned. Accepted commands run with no shell interpretation
//! under a per-command timeout, with output truncated to a configured cap.
//!
//! Every validation failure, successful run and runtime error is recorded
//! as an episode (`shell.rejected` / `shell.executed` / `shell.error`) and
//! counted in stats persisted atomically to `shell_stats.json`.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_store::EpisodicStore;
use anima_types::Outcome;

/// Characters that reject a command outright: pipes, redirects, background,
/// separators, backticks and command substitution.
const DANGEROUS_SEQUENCES: [&str; 7] = ["|", ">", "<", "&", ";", "`", "$("];

struct CommandRule {
    flags: &'static [&'static str],
    timeout_secs: u64,
}

/// Flags that consume the following token as their value.
const VALUED_FLAGS: [&str; 4] = ["-n", "-maxdepth", "-name", "-type"];

/// Commands that take path arguments subject to containment checks.
const FILE_COMMANDS: [&str; 8] = ["ls", "cat", "head", "tail", "find", "grep", "wc", "du"];

static ALLOWED_COMMANDS: Lazy<HashMap<&'static str, CommandRule>> = Lazy::new(|| {
    HashMap::from([
        ("ls", CommandRule { flags: &["-la", "-lh", "-1", "-a", "-l", "-h"], timeout_secs: 5 }),
        ("cat", CommandRule { flags: &[], timeout_secs: 5 }),
        ("head", CommandRule { flags: &["-n"], timeout_secs: 5 }),
        ("tail", CommandRule { flags: &["-n"], timeout_secs: 5 }),
        ("wc", CommandRule { flags: &["-l", "-w", "-c"], timeout_secs: 5 }),
        ("du", CommandRule { flags: &["-sh", "-h", "-s"], timeout_secs: 10 }),
        ("find", CommandRule { flags: &["-name", "-type", "-maxdepth"], timeout_secs: 10 }),
        ("grep", CommandRule { flags: &["-i", "-r", "-n", "-l"], timeout_secs: 10 }),
        ("date", CommandRule { flags: &[], timeout_secs: 2 }),
        ("pwd", CommandRule { flags: &[], timeout_secs: 2 }),
        ("whoami", CommandRule { flags: &[], timeout_secs: 2 }),
        ("echo", CommandRule { flags: &[], timeout_secs: 2 }),
    ])
});

/// Structured result of an execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellResult {
    /// Whether the command ran to completion.
    pub success: bool,
    /// Captured stdout, truncated.
    pub stdout: String,
    /// Captured stderr (or the failure cause), truncated.
    pub stderr: String,
    /// Process exit code; -1 when the process never completed.
    pub exit_code: i32,
    /// Wall time of the run in milliseconds.
    pub execution_time_ms: u64,
    /// Rejection or runtime failure summary, when not successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShellResult {
    fn rejected(reason: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: reason.to_string(),
            exit_code: -1,
            execution_time_ms: 0,
            error: Some(format!("rejected: {reason}")),
        }
    }
}

/// Persisted execution counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellStats {
    /// Commands that ran to completion.
    pub total_executed: u64,
    /// Commands refused by validation.
    pub total_rejected: u64,
    /// Commands that failed at runtime.
    pub total_errors: u64,
}

/// The restricted command runner.
#[derive(Debug)]
pub struct ShellExecutor {
    allowed_dir: PathBuf,
    stats_path: PathBuf,
    max_output: usize,
    stats: Mutex<ShellStats>,
}

/// Normalize `.` and `..` components without touching the filesystem, so
/// containment holds for paths that do not exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

impl ShellExecutor {
    /// Create an executor confined to `allowed_dir`, persisting stats under
    /// `memory_dir`, truncating captured output at `max_output` characters.
    pub fn new(allowed_dir: &Path, memory_dir: &Path, max_output: usize) -> Self {
        let allowed_dir = allowed_dir
            .canonicalize()
            .unwrap_or_else(|_| normalize(allowed_dir));
        let stats_path = memory_dir.join("shell_stats.json");
        let stats = load_json_or_default(&stats_path);
        info!(allowed_dir = %allowed_dir.display(), "shell executor initialised");
        Self { allowed_dir, stats_path, max_output, stats: Mutex::new(stats) }
    }

    fn save_stats(&self) {
        let stats = *self.stats.lock();
        if let Err(e) = atomic_write_json(&self.stats_path, &stats) {
            error!(error = %e, "failed to persist shell stats");
        }
    }

    /// Validate a command against the whitelist without running it.
    /// `Err` carries the human-readable rejection reason.
    pub fn validate_command(&self, cmd: &str) -> Result<(), String> {
        if cmd.trim().is_empty() {
            return Err("empty command".to_string());
        }
        for seq in DANGEROUS_SEQUENCES {
            if cmd.contains(seq) {
                return Err(format!("disallowed character '{seq}' detected"));
            }
        }

        let tokens = shell_words::split(cmd).map_err(|e| format!("failed to parse command: {e}"))?;
        let Some((command, args)) = tokens.split_first() else {
            return Err("no tokens after parsing".to_string());
        };

        let Some(rule) = ALLOWED_COMMANDS.get(command.as_str()) else {
            return Err(format!("command '{command}' not in whitelist"));
        };

        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if arg.starts_with('-') {
                if !rule.flags.contains(&arg.as_str()) {
                    return Err(format!("argument '{arg}' not allowed for '{command}'"));
                }
                // Skip the value of value-taking flags.
                i += if VALUED_FLAGS.contains(&arg.as_str()) { 2 } else { 1 };
                continue;
            }
            if FILE_COMMANDS.contains(&command.as_str()) {
                let candidate = Path::new(arg);
                let resolved = if candidate.is_absolute() {
                    normalize(candidate)
                } else {
                    normalize(&self.allowed_dir.join(candidate))
                };
                if !resolved.starts_with(&self.allowed_dir) {
                    return Err(format!("path '{arg}' is outside allowed directory"));
                }
            }
            i += 1;
        }
        Ok(())
    }

    /// Run a previously validated command. No shell is involved; the
    /// program runs directly with the allowed directory as its working
    /// directory, bounded by the per-command timeout.
    pub async fn execute(&self, cmd: &str) -> ShellResult {
        let tokens = match shell_words::split(cmd) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            _ => return ShellResult::rejected("empty command"),
        };
        let timeout = ALLOWED_COMMANDS
            .get(tokens[0].as_str())
            .map(|r| Duration::from_secs(r.timeout_secs))
            .unwrap_or(Duration::from_secs(5));

        let start = Instant::now();
        let mut command = tokio::process::Command::new(&tokens[0]);
        command
            .args(&tokens[1..])
            .current_dir(&self.allowed_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellResult {
                    success: false,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit_code: -1,
                    execution_time_ms: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                stdout.truncate(self.max_output);
                stderr.truncate(self.max_output);
                ShellResult {
                    success: true,
                    stdout,
                    stderr,
                    exit_code: output.status.code().unwrap_or(-1),
                    execution_time_ms: start.elapsed().as_millis() as u64,
                    error: None,
                }
            }
            Ok(Err(e)) => ShellResult {
                success: false,
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: -1,
                execution_time_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
            Err(_) => ShellResult {
                success: false,
                stdout: String::new(),
                stderr: format!("command timeout ({}s)", timeout.as_secs()),
                exit_code: -1,
                execution_time_ms: timeout.as_millis() as u64,
                error: Some("timeout".to_string()),
            },
        }
    }

    /// Validate, run, and record the attempt in episodic memory and the
    /// persisted stats.
    pub async fn execute_safe(&self, cmd: &str, episodic: &EpisodicStore) -> ShellResult {
        if let Err(reason) = self.validate_command(cmd) {
            self.stats.lock().total_rejected += 1;
            self.save_stats();

            let short: String = cmd.chars().take(200).collect();
            episodic
                .add_episode(
                    "shell.rejected",
                    &format!("Command rejected: {short}. Reason: {reason}"),
                    Outcome::Failure,
                    Some(json!({"command": cmd, "reason": reason})),
                )
                .await;
            warn!(command = %short, reason, "shell command rejected");
            return ShellResult::rejected(&reason);
        }

        let result = self.execute(cmd).await;

        if result.success {
            self.stats.lock().total_executed += 1;
            self.save_stats();

            let head: String = result.stdout.chars().take(500).collect();
            episodic
                .add_episode(
                    "shell.executed",
                    &format!("Command: {cmd}\nOutput:\n{head}"),
                    Outcome::Success,
                    Some(json!({
                        "command": cmd,
                        "exit_code": result.exit_code,
                        "execution_time_ms": result.execution_time_ms,
                    })),
                )
                .await;
            info!(command = cmd, exit_code = result.exit_code, "shell command executed");
        } else {
            self.stats.lock().total_errors += 1;
            self.save_stats();

            let short: String = cmd.chars().take(200).collect();
            let cause: String = result.stderr.chars().take(200).collect();
            episodic
                .add_episode(
                    "shell.error",
                    &format!("Command failed: {short}\nError: {cause}"),
                    Outcome::Failure,
                    Some(json!({"command": cmd, "stderr": result.stderr})),
                )
                .await;
            error!(command = %short, stderr = %cause, "shell command error");
        }

        result
    }

    /// Current counters.
    pub fn stats(&self) -> ShellStats {
        *self.stats.lock()
    }

    /// The whitelisted program names.
    pub fn allowed_commands(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = ALLOWED_COMMANDS.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// The directory all path arguments are confined to.
    pub fn allowed_dir(&self) -> &Path {
        &self.allowed_dir
    }
}
