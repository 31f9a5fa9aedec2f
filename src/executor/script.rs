use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ForkEnvironment;

/// A short user-provided script, executed through the shell by default or
/// through the interpreter of a fork environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub content: String,
    /// Positional parameters made available to the script.
    pub parameters: Vec<String>,
}

impl Script {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Stable digest of the script text, used to key static-selection caches.
    pub fn digest(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.content.hash(&mut hasher);
        self.parameters.hash(&mut hasher);
        hasher.finish()
    }
}

/// Outcome of one script execution.
#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Execution-level failure (spawn error, kill, walltime), as opposed to
    /// the script exiting non-zero.
    pub error: Option<String>,
}

impl ScriptResult {
    pub fn error_occurred(&self) -> bool {
        self.error.is_some() || self.exit_code != Some(0)
    }

    /// Human-readable failure summary for result attribution.
    pub fn failure_message(&self) -> String {
        if let Some(err) = &self.error {
            err.clone()
        } else if !self.stderr.is_empty() {
            self.stderr.trim_end().to_string()
        } else {
            format!("exit code: {:?}", self.exit_code)
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            error: Some(error.into()),
        }
    }
}

/// Shared script interpreter. Non-forked tasks run every pipeline stage
/// through one handler instance; forked tasks get a fresh handler carrying
/// the fork environment.
#[derive(Debug, Clone, Default)]
pub struct ScriptHandler {
    /// Bindings exported to every script as environment variables.
    bindings: HashMap<String, String>,
    fork: Option<ForkEnvironment>,
}

impl ScriptHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forked(fork: ForkEnvironment) -> Self {
        Self {
            bindings: HashMap::new(),
            fork: Some(fork),
        }
    }

    pub fn add_binding(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bindings.insert(key.into(), value.into());
    }

    pub fn add_bindings<'a>(&mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) {
        for (k, v) in vars {
            self.bindings.insert(k.clone(), v.clone());
        }
    }

    /// Executes one script, bounded by an optional walltime and interruptible
    /// through the cancellation token. Killing drops the child process.
    pub async fn handle(
        &self,
        script: &Script,
        walltime: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ScriptResult {
        let interpreter = self
            .fork
            .as_ref()
            .and_then(|f| f.interpreter.clone())
            .unwrap_or_else(|| "sh".to_string());

        let mut cmd = Command::new(&interpreter);
        if let Some(fork) = &self.fork {
            cmd.args(&fork.interpreter_args);
            for (k, v) in &fork.env {
                cmd.env(k, v);
            }
            if let Some(dir) = &fork.working_dir {
                cmd.current_dir(dir);
            }
        }
        cmd.arg("-c").arg(&script.content);
        // Positional parameters: $0 then $1..$n.
        cmd.arg(&interpreter).args(&script.parameters);
        cmd.envs(&self.bindings);
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ScriptResult::failed(format!("failed to spawn {interpreter}: {e}")),
        };

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            out = &mut wait => out,
            _ = cancel.cancelled() => {
                return ScriptResult::failed("killed");
            }
            _ = sleep_or_forever(walltime) => {
                return ScriptResult::failed("walltime exceeded");
            }
        };

        match output {
            Ok(output) => ScriptResult {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code(),
                error: None,
            },
            Err(e) => ScriptResult::failed(format!("script wait failed: {e}")),
        }
    }
}

async fn sleep_or_forever(walltime: Option<Duration>) {
    match walltime {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
