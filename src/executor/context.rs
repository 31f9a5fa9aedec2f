use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ForkEnvironment;
use crate::error::{Result, SchedulerError};
use crate::executor::script::Script;
use crate::scheduler::job::JobId;
use crate::scheduler::task::{ExecutableContainer, FlowAction, TaskId};

/// Variable names injected into every task's execution context.
pub mod context_vars {
    pub const JOB_ID: &str = "GS_JOB_ID";
    pub const JOB_NAME: &str = "GS_JOB_NAME";
    pub const TASK_ID: &str = "GS_TASK_ID";
    pub const TASK_NAME: &str = "GS_TASK_NAME";
    pub const ITERATION: &str = "GS_ITERATION";
    pub const REPLICATION: &str = "GS_REPLICATION";
}

/// Everything the executor needs to run one task activation. Built by the
/// scheduling loop; retries rebuild it fresh.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub job_name: String,
    pub task_id: TaskId,
    pub task_name: String,
    pub iteration_index: u32,
    pub replication_index: u32,
    /// Statically declared task variables, the base of the merge.
    pub variables: HashMap<String, String>,
    pub executable: ExecutableContainer,
    pub fork_environment: Option<ForkEnvironment>,
    pub pre_script: Option<Script>,
    pub post_script: Option<Script>,
    pub flow_script: Option<Script>,
    /// Results of direct parents, in declared dependency order. Later
    /// parents override earlier ones when variables are merged.
    pub previous_results: Vec<TaskResultData>,
    /// Already-decrypted third-party credentials, bound to the scripts as
    /// `GS_CRED_<name>`.
    pub credentials: HashMap<String, String>,
    /// Task-name resolution table for flow-script targets.
    pub flow_targets: HashMap<String, TaskId>,
    pub walltime: Option<Duration>,
}

impl TaskContext {
    /// Synthetic variables describing this activation.
    pub fn context_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(context_vars::JOB_ID.to_string(), self.job_id.to_string());
        vars.insert(context_vars::JOB_NAME.to_string(), self.job_name.clone());
        vars.insert(context_vars::TASK_ID.to_string(), self.task_id.to_string());
        vars.insert(context_vars::TASK_NAME.to_string(), self.task_name.clone());
        vars.insert(
            context_vars::ITERATION.to_string(),
            self.iteration_index.to_string(),
        );
        vars.insert(
            context_vars::REPLICATION.to_string(),
            self.replication_index.to_string(),
        );
        vars
    }

    /// Substitutes the iteration/replication macro tokens in one argument.
    pub fn substitute_macros(&self, arg: &str) -> String {
        arg.replace("$IT", &self.iteration_index.to_string())
            .replace("$REP", &self.replication_index.to_string())
    }
}

/// Captured output streams of one task run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Result of one task activation.
///
/// Exactly one of `value`/`exception` is set. The killed variant carries no
/// flow action and no propagated variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultData {
    pub task_id: TaskId,
    value: Option<String>,
    exception: Option<String>,
    pub logs: TaskLogs,
    pub duration: Duration,
    /// JSON-serialized merged variable map, visible to all dependents.
    pub propagated_variables: Option<String>,
    pub flow_action: Option<FlowAction>,
    killed: bool,
}

impl TaskResultData {
    pub fn with_value(task_id: TaskId, value: impl Into<String>, duration: Duration) -> Self {
        Self {
            task_id,
            value: Some(value.into()),
            exception: None,
            logs: TaskLogs::default(),
            duration,
            propagated_variables: None,
            flow_action: None,
            killed: false,
        }
    }

    pub fn with_exception(
        task_id: TaskId,
        exception: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            task_id,
            value: None,
            exception: Some(exception.into()),
            logs: TaskLogs::default(),
            duration,
            propagated_variables: None,
            flow_action: None,
            killed: false,
        }
    }

    /// The designated result for an externally killed task.
    pub fn killed(task_id: TaskId) -> Self {
        Self {
            task_id,
            value: None,
            exception: Some("task has been killed".to_string()),
            logs: TaskLogs::default(),
            duration: Duration::ZERO,
            propagated_variables: None,
            flow_action: None,
            killed: false,
        }
        .mark_killed()
    }

    fn mark_killed(mut self) -> Self {
        self.killed = true;
        self
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn had_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn was_killed(&self) -> bool {
        self.killed
    }

    /// Replaces the recorded outcome with an exception, dropping any value.
    pub fn set_exception(&mut self, exception: impl Into<String>) {
        self.value = None;
        self.exception = Some(exception.into());
    }

    pub fn set_propagated_variables(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        self.propagated_variables = Some(serialize_variable_map(vars)?);
        Ok(())
    }

    pub fn propagated_variable_map(&self) -> Result<HashMap<String, String>> {
        match &self.propagated_variables {
            Some(raw) => deserialize_variable_map(raw),
            None => Ok(HashMap::new()),
        }
    }
}

pub fn serialize_variable_map(vars: &HashMap<String, String>) -> Result<String> {
    serde_json::to_string(vars)
        .map_err(|e| SchedulerError::Internal(format!("could not serialize variables: {e}")))
}

pub fn deserialize_variable_map(raw: &str) -> Result<HashMap<String, String>> {
    serde_json::from_str(raw)
        .map_err(|e| SchedulerError::Internal(format!("could not deserialize variables: {e}")))
}
