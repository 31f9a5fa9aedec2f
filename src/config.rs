use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Fork environment for tasks executed in a spawned child process.
///
/// Forking is an isolation concern, not a semantic one: a forked task must
/// produce the same result shape as an in-process one.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForkEnvironment {
    /// Interpreter binary used to run the task body (defaults to `sh`).
    pub interpreter: Option<String>,
    /// Extra flags passed to the interpreter before the script.
    pub interpreter_args: Vec<String>,
    /// Additional environment variables set in the child process.
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    pub working_dir: Option<PathBuf>,
}

impl ForkEnvironment {
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

/// Resource manager tunables.
#[derive(Debug, Clone)]
pub struct RmConfig {
    /// Upper bound on one dynamic selection-script evaluation. A timeout
    /// excludes the candidate node, it never fails the whole selection.
    pub selection_script_timeout: Duration,
    /// How long a node may miss heartbeats before being considered DOWN.
    pub node_timeout: Duration,
}

impl Default for RmConfig {
    fn default() -> Self {
        Self {
            selection_script_timeout: Duration::from_secs(20),
            node_timeout: Duration::from_secs(60),
        }
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay before a task in WAITING_ON_ERROR is requeued as PENDING.
    pub task_restart_delay: Duration,
    /// Added jitter on the restart delay, 0..=jitter.
    pub task_restart_jitter: Duration,
    /// Window of finished-job history loaded at recovery. `None` loads all.
    pub finished_job_retention: Option<Duration>,
    /// Capacity of the scheduling loop's command channel.
    pub command_queue_depth: usize,
    /// Hard cap on one task body's execution time. `None` means unbounded.
    pub task_walltime: Option<Duration>,
    pub rm: RmConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_restart_delay: Duration::from_secs(5),
            task_restart_jitter: Duration::from_secs(1),
            finished_job_retention: None,
            command_queue_depth: 1024,
            task_walltime: None,
            rm: RmConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.task_restart_delay = delay;
        self
    }

    pub fn with_retention(mut self, window: Duration) -> Self {
        self.finished_job_retention = Some(window);
        self
    }
}
