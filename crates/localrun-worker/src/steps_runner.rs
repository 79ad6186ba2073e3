// Step execution. `RunContext` drives a step only through the `StepRunner`
// contract; `DefaultStepRunner` runs scripts in the job container and expands
// local composite actions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use localrun_common::constants::PATH_VARIABLE;
use localrun_common::VarUtil;
use localrun_sdk::{ExecContext, Executor, StringUtil};

use crate::container::FileEntry;
use crate::expressions::ExpressionEvaluator;
use crate::model::{Action, Step, StepType};
use crate::run_context::RunContext;

/// `PATH` used when neither the job nor the image provides one.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const ACTION_MANIFESTS: [&str; 2] = ["action.yml", "action.yaml"];

/// What the orchestrator needs from a step implementation.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Evaluate the step's `if:` against the current job state.
    fn is_enabled(&self, rc: &RunContext, step: &Step) -> Result<bool>;

    /// Build the step environment into `rc.step_env` and return an evaluator
    /// that sees it.
    async fn setup_env(
        &self,
        rc: &mut RunContext,
        step: &Step,
        ctx: &ExecContext,
    ) -> Result<Arc<dyn ExpressionEvaluator>>;

    /// The step body.
    fn executor(&self, step: Arc<Step>) -> Executor<RunContext>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStepRunner;

#[async_trait]
impl StepRunner for DefaultStepRunner {
    fn is_enabled(&self, rc: &RunContext, step: &Step) -> Result<bool> {
        let condition = step.if_expr.value();
        rc.new_step_expression_evaluator()
            .evaluate_bool(condition)
            .with_context(|| format!("Error in if-expression: \"if: {}\"", condition))
    }

    async fn setup_env(
        &self,
        rc: &mut RunContext,
        step: &Step,
        ctx: &ExecContext,
    ) -> Result<Arc<dyn ExpressionEvaluator>> {
        let job_env = rc.get_env().clone();
        let container_env = rc
            .run()
            .job()
            .container()
            .map(|c| c.env.clone())
            .unwrap_or_default();
        let mut env = VarUtil::merge_env([&job_env, &container_env, &step.env]);

        let container = rc.container()?;
        container.update_from_image_env(ctx, &mut env).await?;

        let path = env.get(PATH_VARIABLE).cloned().unwrap_or_default();
        let mut path = if path.is_empty() {
            DEFAULT_PATH.to_string()
        } else {
            path
        };
        if !rc.extra_path.is_empty() {
            path = format!("{}:{}", rc.extra_path.join(":"), path);
        }
        env.insert(PATH_VARIABLE.to_string(), path);

        rc.with_github_env(&mut env);
        for (name, value) in &rc.inputs {
            env.insert(input_variable(name), value.clone());
        }

        rc.step_env = env;
        let evaluator = rc.new_step_expression_evaluator();
        for value in rc.step_env.values_mut() {
            if value.contains("${{") {
                *value = evaluator.interpolate(value);
            }
        }
        tracing::debug!(target: "step", "setupEnv => {} variables", rc.step_env.len());

        Ok(rc.new_step_expression_evaluator())
    }

    fn executor(&self, step: Arc<Step>) -> Executor<RunContext> {
        Executor::unit(move |rc: &mut RunContext, ctx: &ExecContext| {
            let step = step.clone();
            async move {
                match step.step_type() {
                    StepType::Run => run_script(rc, &step, ctx).await,
                    StepType::UsesActionLocal => run_local_action(rc, &step, ctx).await,
                    StepType::UsesActionRemote => {
                        if rc.github_context().is_local_checkout(&step) {
                            tracing::debug!(target: "step", "Skipping local repository checkout");
                            return Ok(());
                        }
                        bail!("remote action '{}' is not supported", step.uses)
                    }
                    StepType::UsesDockerUrl => bail!("docker action '{}' is not supported", step.uses),
                    StepType::Invalid => bail!(
                        "invalid step '{}': exactly one of 'run' or 'uses' must be set",
                        step
                    ),
                }
            }
            .boxed()
        })
    }
}

/// `INPUT_<NAME>` with spaces as underscores, as actions expect.
fn input_variable(name: &str) -> String {
    format!("INPUT_{}", name.replace(' ', "_").to_uppercase())
}

async fn run_script(rc: &mut RunContext, step: &Step, ctx: &ExecContext) -> Result<()> {
    let evaluator = rc.expression_evaluator();
    let script = evaluator.interpolate(&step.run);
    let workdir = evaluator.interpolate(&step.working_directory);
    let shell = evaluator.interpolate(&step.shell);

    let container = rc.container()?;
    let script_path = format!("{}/workflow/{}", rc.act_path(), script_name(&step.id));
    let (command, needs_file) = shell_command(&shell, &script, &script_path)?;
    if needs_file {
        container
            .copy(ctx, rc.act_path(), &[FileEntry::new(format!("workflow/{}", script_name(&step.id)), 0o755, script)])
            .await?;
    }
    container.exec(ctx, &command, &rc.step_env, "", &workdir).await
}

fn script_name(step_id: &str) -> String {
    let sanitized: String = step_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("step-{sanitized}")
}

/// The command line for `script` under `shell`.
///
/// Known shells take the script inline. A custom shell template receives the
/// path of a staged script file in place of `{0}`; the returned flag says
/// whether that file must be written first.
fn shell_command(shell: &str, script: &str, script_path: &str) -> Result<(Vec<String>, bool)> {
    let inline = |program: &str, flags: &[&str]| -> Vec<String> {
        std::iter::once(program)
            .chain(flags.iter().copied())
            .chain(std::iter::once(script))
            .map(str::to_string)
            .collect()
    };

    let command = match shell.trim() {
        "" | "sh" => inline("sh", &["-e", "-c"]),
        "bash" => inline("bash", &["--noprofile", "--norc", "-e", "-o", "pipefail", "-c"]),
        "python" => inline("python", &["-c"]),
        "pwsh" => inline("pwsh", &["-command"]),
        "powershell" => inline("powershell", &["-command"]),
        custom => {
            let words = StringUtil::split_shell_words(custom)
                .with_context(|| format!("Invalid shell '{}'", custom))?;
            if words.iter().any(|w| w.contains("{0}")) {
                let words = words.iter().map(|w| w.replace("{0}", script_path)).collect();
                return Ok((words, true));
            }
            words.into_iter().chain(std::iter::once(script.to_string())).collect()
        }
    };
    Ok((command, false))
}

fn find_manifest(dir: &Path) -> Result<PathBuf> {
    ACTION_MANIFESTS
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .with_context(|| format!("Can't find 'action.yml' or 'action.yaml' under '{}'", dir.display()))
}

async fn run_local_action(rc: &mut RunContext, step: &Step, ctx: &ExecContext) -> Result<()> {
    let relative = step.uses.trim_start_matches("./").trim_end_matches('/');
    let action_dir = rc.config().workdir.join(relative);
    let action = Action::load(&find_manifest(&action_dir)?)?;
    if !action.is_composite() {
        bail!("unsupported action runtime '{}' in '{}'", action.runs.using, step.uses);
    }

    let action_path = if rc.is_local() {
        action_dir.to_string_lossy().into_owned()
    } else {
        format!("{}/{}", rc.config().container_workdir().trim_end_matches('/'), relative)
    };
    let inputs = action_inputs(rc.expression_evaluator().as_ref(), step, &action);
    let outputs = action.outputs.clone();

    let mut child = rc.composite_child(step, action, action_path, inputs)?;
    let composite = child.composite_executor();
    let result = composite.run(&mut child, ctx).await;

    let evaluator = child.new_step_expression_evaluator();
    for (name, output) in outputs {
        let value = evaluator.interpolate(&output.value);
        rc.set_output(&name, value);
    }
    result
}

/// Interpolated `with:` values, falling back to declared defaults.
fn action_inputs(evaluator: &dyn ExpressionEvaluator, step: &Step, action: &Action) -> HashMap<String, String> {
    let mut inputs: HashMap<String, String> = step
        .with
        .iter()
        .map(|(name, value)| (name.clone(), evaluator.interpolate(value)))
        .collect();
    for (name, input) in &action.inputs {
        if inputs.contains_key(name) {
            continue;
        }
        match input.default {
            Some(ref default) => {
                inputs.insert(name.clone(), evaluator.interpolate(default));
            }
            None if input.required => {
                tracing::warn!(target: "step", "Input required and not supplied: {}", name);
            }
            None => {}
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::{ContextEvaluator, ExpressionContext};
    use crate::model::ActionInput;

    #[test]
    fn test_shell_commands() {
        let (cmd, file) = shell_command("", "echo hi", "/s").unwrap();
        assert_eq!(cmd, vec!["sh", "-e", "-c", "echo hi"]);
        assert!(!file);

        let (cmd, _) = shell_command("bash", "echo hi", "/s").unwrap();
        assert_eq!(cmd[0], "bash");
        assert_eq!(cmd.last().unwrap(), "echo hi");

        let (cmd, file) = shell_command("perl {0}", "print 1", "/act/workflow/step-1").unwrap();
        assert_eq!(cmd, vec!["perl", "/act/workflow/step-1"]);
        assert!(file);

        let (cmd, file) = shell_command("node -e", "1", "/s").unwrap();
        assert_eq!(cmd, vec!["node", "-e", "1"]);
        assert!(!file);

        assert!(shell_command("bash \"oops", "x", "/s").is_err());
    }

    #[test]
    fn test_input_variable() {
        assert_eq!(input_variable("who"), "INPUT_WHO");
        assert_eq!(input_variable("my input"), "INPUT_MY_INPUT");
    }

    #[test]
    fn test_script_name_is_file_safe() {
        assert_eq!(script_name("build/1"), "step-build_1");
    }

    #[test]
    fn test_action_inputs_defaults() {
        let evaluator = ContextEvaluator::new(ExpressionContext {
            data: serde_json::json!({"env": {"NAME": "octo"}}),
            ..ExpressionContext::default()
        });
        let mut action: Action = serde_yaml::from_str("runs:\n  using: composite\n").unwrap();
        action.inputs.insert(
            "greeting".into(),
            ActionInput {
                default: Some("hello".into()),
                ..ActionInput::default()
            },
        );
        action.inputs.insert(
            "who".into(),
            ActionInput {
                default: Some("nobody".into()),
                ..ActionInput::default()
            },
        );
        let step = Step {
            uses: "./greet".into(),
            with: [("who".to_string(), "${{ env.NAME }}".to_string())].into_iter().collect(),
            ..Step::default()
        };

        let inputs = action_inputs(&evaluator, &step, &action);
        assert_eq!(inputs["who"], "octo");
        assert_eq!(inputs["greeting"], "hello");
    }

    #[test]
    fn test_find_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_manifest(dir.path()).is_err());
        std::fs::write(dir.path().join("action.yaml"), "runs:\n  using: composite\n").unwrap();
        assert!(find_manifest(dir.path()).unwrap().ends_with("action.yaml"));
    }
}
