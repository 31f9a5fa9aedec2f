//! Task execution pipeline.
//!
//! One task activation runs a strictly ordered pipeline: variable merge,
//! pre-script, dataspace copy-in, body, dataspace copy-out, post-script,
//! flow-script. Each stage's failure is captured into the task result
//! rather than propagated past the pipeline boundary.
//!
//! Forked tasks run their scripts through an interpreter carrying the task's
//! fork environment; non-forked tasks share the scheduler-side handler.
//! Both modes produce an identical result shape.

pub mod context;
pub mod script;

use std::collections::HashMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::executor::context::{TaskContext, TaskLogs, TaskResultData};
use crate::executor::script::{Script, ScriptHandler, ScriptResult};
use crate::scheduler::task::{ExecutableContainer, FlowAction, TaskId};

/// Scoped-resource boundary around the task body. Failures are reported as
/// part of the task result, never silently swallowed.
pub trait Dataspace: Send + Sync {
    fn copy_input_data_to_scratch(&self) -> Result<()>;
    fn copy_scratch_data_to_output(&self) -> Result<()>;
}

/// Executes one task's script pipeline and produces its result.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutor;

impl TaskExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Runs the pipeline once. Retries re-invoke this with a fresh context.
    ///
    /// The kill token is observed at stage boundaries and inside running
    /// scripts; a killed task yields the designated killed result and skips
    /// every remaining stage, flow-script included.
    pub async fn execute(
        &self,
        context: TaskContext,
        dataspace: Option<&dyn Dataspace>,
        cancel: &CancellationToken,
    ) -> TaskResultData {
        let task_id = context.task_id;

        // Stage 1: variable merge. Declared variables first, synthetic
        // context variables next, then propagated variables from each parent
        // in declared dependency order (later parents override).
        let mut variables = context.variables.clone();
        variables.extend(context.context_variables());
        for previous in &context.previous_results {
            match previous.propagated_variable_map() {
                Ok(propagated) => variables.extend(propagated),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Could not deserialize propagated variables");
                    return TaskResultData::with_exception(
                        task_id,
                        format!("could not deserialize variables: {e}"),
                        std::time::Duration::ZERO,
                    );
                }
            }
        }

        let handler = self.create_handler(&context, &variables);
        let mut logs = TaskLogs::default();

        if cancel.is_cancelled() {
            return TaskResultData::killed(task_id);
        }

        // Stages 2-6: pre-script, dataspace in, body, dataspace out,
        // post-script. The first failure aborts the rest of this block but
        // the flow script still runs with the failure as context.
        let started = Instant::now();
        let body_outcome = self
            .run_scripts(&context, &handler, dataspace, cancel, &mut logs)
            .await;
        let duration = started.elapsed();

        if cancel.is_cancelled() {
            return TaskResultData::killed(task_id);
        }

        let mut result = match body_outcome {
            Ok(value) => TaskResultData::with_value(task_id, value, duration),
            Err(message) => TaskResultData::with_exception(task_id, message, duration),
        };

        // Stage 7: flow script, regardless of prior failure. Its own failure
        // overwrites the outcome and the action reverts to the default.
        if let Some(flow_script) = &context.flow_script {
            let flow = handler.handle(flow_script, None, cancel).await;
            if cancel.is_cancelled() {
                return TaskResultData::killed(task_id);
            }
            append_logs(&mut logs, &flow);
            if flow.error_occurred() {
                tracing::warn!(task_id = %task_id, "Flow script failed");
                result.set_exception(format!("flow script failed: {}", flow.failure_message()));
                result.flow_action = Some(FlowAction::default_action());
            } else {
                match parse_flow_action(&flow.stdout, &context.flow_targets) {
                    Ok(action) => result.flow_action = Some(action),
                    Err(message) => {
                        tracing::warn!(task_id = %task_id, message, "Unparseable flow action");
                        result.set_exception(format!("flow script failed: {message}"));
                        result.flow_action = Some(FlowAction::default_action());
                    }
                }
            }
        }

        if let Err(e) = result.set_propagated_variables(&variables) {
            result.set_exception(format!("could not serialize variables: {e}"));
        }
        result.logs = logs;
        result
    }

    fn create_handler(
        &self,
        context: &TaskContext,
        variables: &HashMap<String, String>,
    ) -> ScriptHandler {
        let mut handler = match &context.fork_environment {
            Some(fork) => ScriptHandler::forked(fork.clone()),
            None => ScriptHandler::new(),
        };
        handler.add_bindings(variables.iter());
        for (name, secret) in &context.credentials {
            handler.add_binding(format!("GS_CRED_{name}"), secret);
        }
        handler
    }

    /// Pre-script through post-script. Returns the body's value on success,
    /// or the first failure message.
    async fn run_scripts(
        &self,
        context: &TaskContext,
        handler: &ScriptHandler,
        dataspace: Option<&dyn Dataspace>,
        cancel: &CancellationToken,
        logs: &mut TaskLogs,
    ) -> std::result::Result<String, String> {
        if let Some(pre) = &context.pre_script {
            let pre_result = handler.handle(pre, None, cancel).await;
            append_logs(logs, &pre_result);
            if pre_result.error_occurred() {
                return Err(format!(
                    "failed to execute pre script: {}",
                    pre_result.failure_message()
                ));
            }
        }

        if let Some(ds) = dataspace {
            if let Err(e) = ds.copy_input_data_to_scratch() {
                return Err(format!("failed to copy input data: {e}"));
            }
        }

        let body = self.instantiate_body(context);
        let body_result = handler.handle(&body, context.walltime, cancel).await;
        append_logs(logs, &body_result);
        if body_result.error_occurred() {
            return Err(format!(
                "failed to execute task: {}",
                body_result.failure_message()
            ));
        }

        if let Some(ds) = dataspace {
            if let Err(e) = ds.copy_scratch_data_to_output() {
                return Err(format!("failed to copy output data: {e}"));
            }
        }

        if let Some(post) = &context.post_script {
            let post_result = handler.handle(post, None, cancel).await;
            append_logs(logs, &post_result);
            if post_result.error_occurred() {
                return Err(format!(
                    "failed to execute post script: {}",
                    post_result.failure_message()
                ));
            }
        }

        Ok(body_result.stdout)
    }

    /// Builds the body script from the executable container, substituting
    /// iteration/replication macros in native arguments.
    fn instantiate_body(&self, context: &TaskContext) -> Script {
        match &context.executable {
            ExecutableContainer::Script { script } => {
                let parameters = script
                    .parameters
                    .iter()
                    .map(|p| context.substitute_macros(p))
                    .collect();
                Script::new(script.content.clone()).with_parameters(parameters)
            }
            ExecutableContainer::Native { command, args } => {
                let mut content = command.clone();
                for arg in args {
                    content.push(' ');
                    content.push_str(&context.substitute_macros(arg));
                }
                Script::new(content)
            }
        }
    }
}

fn append_logs(logs: &mut TaskLogs, result: &ScriptResult) {
    logs.stdout.push_str(&result.stdout);
    logs.stderr.push_str(&result.stderr);
}

/// Parses the flow action emitted on the flow script's last stdout line.
///
/// Accepted forms: `continue`, `loop <task-name>`, `replicate <n>`,
/// `if <task-name>`.
fn parse_flow_action(
    stdout: &str,
    targets: &HashMap<String, TaskId>,
) -> std::result::Result<FlowAction, String> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let mut words = line.split_whitespace();
    match (words.next(), words.next()) {
        (Some("continue") | None, _) => Ok(FlowAction::Continue),
        (Some("loop"), Some(name)) => targets
            .get(name)
            .map(|&target| FlowAction::Loop { target })
            .ok_or_else(|| format!("unknown loop target: {name}")),
        (Some("replicate"), Some(runs)) => runs
            .parse()
            .map(|runs| FlowAction::Replicate { runs })
            .map_err(|_| format!("invalid replication count: {runs}")),
        (Some("if"), Some(name)) => targets
            .get(name)
            .map(|&chosen| FlowAction::IfBranch { chosen })
            .ok_or_else(|| format!("unknown branch target: {name}")),
        _ => Err(format!("unrecognized flow action: {line}")),
    }
}
