// Job orchestration.
//
// A `RunContext` runs one job: it resolves the job's image, owns the job
// container through Start → Stop → Close, layers the job environment,
// sequences steps through the `StepRunner` contract and expands composite
// actions into child contexts. Everything fixed for the whole job lives in
// the shared, immutable `JobScope`; each nesting level gets its own mutable
// step state.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::FutureExt;
use localrun_common::constants::{
    container as sandbox, defaults, file_commands, variables, COMPOSITE_ACTIONS_MAX_DEPTH,
    CONTAINER_NAME_PREFIX, LOCAL_RUN_MARKER, PATH_VARIABLE, SELF_HOSTED_IMAGE,
};
use localrun_common::{Config, ConfigurationError, SecretMasker, StepStatus, Tracing, VarUtil};
use localrun_sdk::{ExecContext, Executor, PipelineError, StringUtil, TraceWriter};
use once_cell::sync::OnceCell;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::container::{
    env_list, Container, ContainerDriver, ContainerError, FileEntry, HostContainer,
    NewContainerInput,
};
use crate::expressions::{
    DefaultEvaluatorFactory, EvaluatorFactory, ExpressionContext, ExpressionEvaluator,
};
use crate::github_context::{ContextSources, GithubContext, GithubEnvSources};
use crate::model::{Action, Run, Step};
use crate::naming::create_container_name;
use crate::steps_context::{steps_to_value, JobContext, MappableOutput, StepResult};
use crate::steps_runner::{DefaultStepRunner, StepRunner};

/// Where the job container is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    #[default]
    NotStarted,
    Started,
    Stopped,
    Closed,
}

/// Job-wide state shared by a `RunContext` and every composite scope
/// derived from it. Read-only once the job starts.
pub struct JobScope {
    config: Arc<Config>,
    run: Arc<Run>,
    matrix: Map<String, Value>,
    event_json: String,
    driver: Arc<dyn ContainerDriver>,
    step_runner: Arc<dyn StepRunner>,
    evaluators: Arc<dyn EvaluatorFactory>,
    masker: SecretMasker,
    cancel: CancellationToken,
    github: OnceCell<GithubContext>,
}

impl JobScope {
    pub fn new(config: Arc<Config>, run: Arc<Run>, driver: Arc<dyn ContainerDriver>) -> Self {
        let masker = SecretMasker::from_values(config.secrets.values());
        Self {
            config,
            run,
            matrix: Map::new(),
            event_json: "{}".to_string(),
            driver,
            step_runner: Arc::new(DefaultStepRunner),
            evaluators: Arc::new(DefaultEvaluatorFactory),
            masker,
            cancel: CancellationToken::new(),
            github: OnceCell::new(),
        }
    }

    pub fn with_matrix(mut self, matrix: Map<String, Value>) -> Self {
        self.matrix = matrix;
        self
    }

    /// The trigger payload staged as `event.json`.
    pub fn with_event_json(mut self, event_json: impl Into<String>) -> Self {
        self.event_json = event_json.into();
        self
    }

    pub fn with_step_runner(mut self, runner: Arc<dyn StepRunner>) -> Self {
        self.step_runner = runner;
        self
    }

    pub fn with_evaluator_factory(mut self, factory: Arc<dyn EvaluatorFactory>) -> Self {
        self.evaluators = factory;
        self
    }

    /// Token observed by the `cancelled()` status function.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn masker(&self) -> &SecretMasker {
        &self.masker
    }
}

/// What a composite scope remembers about the step that expanded it.
#[derive(Debug, Clone)]
struct ParentScope {
    job_status: StepStatus,
    step_id: String,
}

/// One job execution, or one composite-action expansion within it.
pub struct RunContext {
    scope: Arc<JobScope>,
    name: String,
    env: Option<HashMap<String, String>>,
    pub extra_path: Vec<String>,
    pub current_step: String,
    pub step_results: HashMap<String, StepResult>,
    /// Environment of the step currently running.
    pub step_env: HashMap<String, String>,
    /// Saved state per step id, read back from the state file.
    pub step_state: HashMap<String, HashMap<String, String>>,
    pub output_mappings: HashMap<MappableOutput, MappableOutput>,
    pub inputs: HashMap<String, String>,
    context_data: Map<String, Value>,
    expr_eval: Arc<dyn ExpressionEvaluator>,
    job_container: Option<Arc<dyn Container>>,
    container_state: ContainerState,
    parent: Option<Arc<ParentScope>>,
    composite: Option<Arc<Action>>,
    action_path: String,
    local: bool,
    act_path: String,
    workspace: String,
    depth: usize,
    job_outputs: HashMap<String, String>,
}

impl fmt::Display for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope.run.workflow.name, self.name)
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("name", &self.name)
            .field("current_step", &self.current_step)
            .field("container_state", &self.container_state)
            .field("local", &self.local)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn new(scope: Arc<JobScope>) -> Self {
        let placeholder = scope.evaluators.create(ExpressionContext::default());
        let mut rc = Self {
            name: scope.run.job_name().to_string(),
            workspace: scope.config.container_workdir(),
            scope,
            env: None,
            extra_path: Vec::new(),
            current_step: String::new(),
            step_results: HashMap::new(),
            step_env: HashMap::new(),
            step_state: HashMap::new(),
            output_mappings: HashMap::new(),
            inputs: HashMap::new(),
            context_data: Map::new(),
            expr_eval: placeholder,
            job_container: None,
            container_state: ContainerState::NotStarted,
            parent: None,
            composite: None,
            action_path: String::new(),
            local: false,
            act_path: sandbox::DEFAULT_ACT_PATH.to_string(),
            depth: 0,
            job_outputs: HashMap::new(),
        };
        rc.get_env();
        rc.expr_eval = rc.new_expression_evaluator();
        rc
    }

    /// Free-form context data. A `github` entry, as a JSON object or a
    /// serialized string, replaces the computed provider context.
    pub fn with_context_data(mut self, data: Map<String, Value>) -> Self {
        self.context_data = data;
        self.expr_eval = self.new_expression_evaluator();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.scope.config
    }

    pub fn run(&self) -> &Run {
        &self.scope.run
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Scratch directory for event, env, path, output and state files.
    pub fn act_path(&self) -> &str {
        &self.act_path
    }

    pub fn container_state(&self) -> ContainerState {
        self.container_state
    }

    pub fn job_outputs(&self) -> &HashMap<String, String> {
        &self.job_outputs
    }

    pub fn container(&self) -> Result<Arc<dyn Container>> {
        self.job_container
            .clone()
            .context("job container has not been started")
    }

    /// The evaluator the current step was set up with.
    pub fn expression_evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        self.expr_eval.clone()
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    /// The job environment: config env, then workflow env, then job env,
    /// plus the local-run marker. Computed once.
    pub fn get_env(&mut self) -> &HashMap<String, String> {
        self.env_mut()
    }

    fn env_mut(&mut self) -> &mut HashMap<String, String> {
        if self.env.is_none() {
            self.env = Some(self.compose_env());
        }
        self.env.get_or_insert_with(HashMap::new)
    }

    fn compose_env(&self) -> HashMap<String, String> {
        let run = &self.scope.run;
        let mut env = VarUtil::merge_env([
            &self.scope.config.env,
            &run.workflow.env,
            run.job().environment(),
        ]);
        env.insert(LOCAL_RUN_MARKER.to_string(), "true".to_string());
        env
    }

    fn job_env(&self) -> HashMap<String, String> {
        match self.env {
            Some(ref env) => env.clone(),
            None => self.compose_env(),
        }
    }

    /// Binds and named-volume mounts for the job container.
    pub fn get_binds_and_mounts(&self) -> (Vec<String>, HashMap<String, String>) {
        let config = &self.scope.config;
        let name = self.job_container_name();

        let mut binds = vec![format!(
            "{}:{}",
            config.daemon_socket(),
            sandbox::DAEMON_SOCKET_TARGET
        )];
        let mut mounts = HashMap::from([
            (sandbox::TOOLCACHE_VOLUME.to_string(), sandbox::TOOLCACHE_PATH.to_string()),
            (format!("{name}-env"), sandbox::DEFAULT_ACT_PATH.to_string()),
        ]);

        if config.bind_workdir {
            binds.push(format!(
                "{}:{}{}",
                config.workdir.display(),
                config.container_workdir(),
                bind_modifiers()
            ));
        } else {
            mounts.insert(name, config.container_workdir());
        }
        (binds, mounts)
    }

    /// Project the provider context into `env`.
    pub fn with_github_env(&self, env: &mut HashMap<String, String>) {
        let labels: Vec<String> = self
            .scope
            .run
            .job()
            .runs_on()
            .iter()
            .map(|label| self.expr_eval.interpolate(label))
            .collect();
        self.github_context().with_github_env(
            env,
            &GithubEnvSources {
                config: &self.scope.config,
                act_path: &self.act_path,
                job_name: &self.scope.run.job_id,
                runner_labels: &labels,
            },
        );
    }

    // -----------------------------------------------------------------------
    // Contexts and expressions
    // -----------------------------------------------------------------------

    /// The provider context for the current step.
    ///
    /// The job-wide part is computed once; event path, workspace and action
    /// fields follow the scope asking.
    pub fn github_context(&self) -> GithubContext {
        let scope = &self.scope;
        let sources = ContextSources {
            config: &scope.config,
            workflow_name: &scope.run.workflow.name,
            job_id: &scope.run.job_id,
            act_path: &self.act_path,
            event_json: &scope.event_json,
            current_step: "",
            action_path: "",
            action_ref: "",
            action_repository: "",
        };
        if let Some(base) = self.base_context() {
            return GithubContext::build(&sources, Some(&base));
        }

        let mut ghc = scope.github.get_or_init(|| GithubContext::build(&sources, None)).clone();
        ghc.event_path = format!("{}/{}", self.act_path, file_commands::EVENT);
        ghc.workspace = self.workspace.clone();
        ghc.action = self.current_step.clone();
        ghc.action_path = self.action_path.clone();
        ghc
    }

    fn base_context(&self) -> Option<String> {
        match self.context_data.get("github") {
            Some(Value::String(raw)) => Some(raw.clone()),
            Some(value @ Value::Object(_)) => Some(value.to_string()),
            _ => None,
        }
    }

    /// `failure` once any step of this scope, or the scope that expanded
    /// it, has failed.
    pub fn job_context(&self) -> JobContext {
        let mut job = JobContext::from_results(&self.step_results);
        if matches!(self.parent.as_deref(), Some(p) if p.job_status.is_failure()) {
            job.status = StepStatus::Failure;
        }
        job
    }

    pub fn steps_context(&self) -> &HashMap<String, StepResult> {
        &self.step_results
    }

    fn expression_context(&self, env: &HashMap<String, String>) -> ExpressionContext {
        let mut data = self.context_data.clone();
        data.insert("github".to_string(), self.github_context().to_value());
        data.insert("env".to_string(), string_object(env));
        data.insert("matrix".to_string(), Value::Object(self.scope.matrix.clone()));
        data.insert("steps".to_string(), steps_to_value(&self.step_results));
        data.insert(
            "job".to_string(),
            serde_json::to_value(self.job_context()).unwrap_or(Value::Null),
        );
        data.insert("inputs".to_string(), string_object(&self.inputs));
        data.insert("secrets".to_string(), string_object(&self.scope.config.secrets));

        let runner: HashMap<String, String> = [
            ("os", variables::RUNNER_OS),
            ("arch", variables::RUNNER_ARCH),
            ("temp", variables::RUNNER_TEMP),
            ("tool_cache", variables::RUNNER_TOOL_CACHE),
        ]
        .into_iter()
        .filter_map(|(key, var)| env.get(var).map(|v| (key.to_string(), v.clone())))
        .collect();
        data.insert("runner".to_string(), string_object(&runner));

        ExpressionContext {
            data: Value::Object(data),
            cancel: self.scope.cancel.clone(),
        }
    }

    /// An evaluator over the job environment.
    pub fn new_expression_evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        let env = self.job_env();
        self.scope.evaluators.create(self.expression_context(&env))
    }

    /// An evaluator over the current step's environment.
    pub fn new_step_expression_evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        if self.step_env.is_empty() {
            return self.new_expression_evaluator();
        }
        self.scope.evaluators.create(self.expression_context(&self.step_env))
    }

    // -----------------------------------------------------------------------
    // Platform, credentials and container options
    // -----------------------------------------------------------------------

    /// The image the job runs in: the job container's image, else the first
    /// runner label with a configured platform. Empty when unresolved.
    pub fn platform_image(&self) -> String {
        let job = self.scope.run.job();
        if let Some(container) = job.container() {
            return self.expr_eval.interpolate(&container.image);
        }

        let labels = job.runs_on();
        if labels.is_empty() {
            tracing::error!(target: "job", "'runs-on' key not defined in {}", self);
        }
        labels
            .iter()
            .map(|label| self.expr_eval.interpolate(label).to_lowercase())
            .find_map(|platform| self.scope.config.platforms.get(&platform).cloned())
            .unwrap_or_default()
    }

    /// `--hostname`/`-h` from the container options, or empty.
    pub fn hostname(&self) -> String {
        let Some(container) = self.scope.run.job().container() else {
            return String::new();
        };
        let words = match StringUtil::split_shell_words(&container.options) {
            Ok(words) => words,
            Err(_) => {
                tracing::warn!(target: "job", "Cannot parse container options: {}", container.options);
                return String::new();
            }
        };

        let mut words = words.into_iter();
        while let Some(word) = words.next() {
            if let Some(value) = word.strip_prefix("--hostname=") {
                return value.to_string();
            }
            if word == "--hostname" || word == "-h" {
                return words.next().unwrap_or_default();
            }
            if let Some(value) = word.strip_prefix("-h").filter(|v| !v.is_empty() && !word.starts_with("--")) {
                return value.to_string();
            }
        }
        String::new()
    }

    /// Registry credentials for the job image.
    ///
    /// `DOCKER_USERNAME`/`DOCKER_PASSWORD` secrets apply when the container
    /// declares no credentials. Declared credentials need exactly `username`
    /// and `password`, and both must interpolate to non-empty values.
    pub fn handle_credentials(&self) -> Result<(String, String), ConfigurationError> {
        let secrets = &self.scope.config.secrets;
        let fallback = (
            secrets.get(variables::DOCKER_USERNAME).cloned().unwrap_or_default(),
            secrets.get(variables::DOCKER_PASSWORD).cloned().unwrap_or_default(),
        );

        let Some(credentials) = self.scope.run.job().container().and_then(|c| c.credentials.as_ref())
        else {
            return Ok(fallback);
        };
        if credentials.len() != 2 {
            return Err(ConfigurationError::InvalidCredentialCount);
        }

        let raw = |key: &str| credentials.get(key).cloned().unwrap_or_default();
        let username = self.expr_eval.interpolate(&raw("username"));
        if username.is_empty() {
            return Err(ConfigurationError::CredentialInterpolation { field: "username" });
        }
        let password = self.expr_eval.interpolate(&raw("password"));
        if password.is_empty() {
            return Err(ConfigurationError::CredentialInterpolation { field: "password" });
        }
        if raw("username").is_empty() || raw("password").is_empty() {
            return Err(ConfigurationError::EmptyCredentials);
        }

        self.scope.masker.add_value(&password);
        Ok((username, password))
    }

    /// Deterministic name of the job container and its volumes.
    pub fn job_container_name(&self) -> String {
        create_container_name(&[CONTAINER_NAME_PREFIX, &self.to_string()])
    }

    /// The `path` input of the first step that checks out this repository
    /// at this ref, unless remote checkouts are forced.
    pub fn local_checkout_path(&self) -> Option<String> {
        if self.scope.config.force_remote_checkout {
            return None;
        }
        let ghc = self.github_context();
        self.scope
            .run
            .job()
            .steps
            .iter()
            .find(|step| ghc.is_local_checkout(step))
            .map(|step| step.with.get("path").cloned().unwrap_or_default())
    }

    fn output_writer(&self) -> Arc<dyn TraceWriter> {
        Arc::new(Tracing::new(
            self.name.clone(),
            self.scope.masker.clone(),
            self.scope.config.log_output,
        ))
    }

    // -----------------------------------------------------------------------
    // Container lifecycle
    // -----------------------------------------------------------------------

    /// Resolve the image and bring the sandbox up, staging the workspace and
    /// the file-command files.
    pub fn start_job_container() -> Executor<RunContext> {
        Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
            async move {
                let image = rc.platform_image();
                if image == SELF_HOSTED_IMAGE {
                    rc.start_host()?;
                } else {
                    rc.start_container(image)?;
                }
                let pipeline = rc.start_pipeline();
                pipeline.run(rc, ctx).await
            }
            .boxed()
        })
    }

    fn start_container(&mut self, image: String) -> Result<()> {
        let hostname = self.hostname();
        let (username, password) = self
            .handle_credentials()
            .context("failed to handle credentials")?;

        tracing::info!(target: "job", "Start image={}", image);
        let config = self.scope.config.clone();
        let (binds, mounts) = self.get_binds_and_mounts();
        let seed = HashMap::from([
            (variables::RUNNER_TOOL_CACHE.to_string(), defaults::CONTAINER_TOOL_CACHE.to_string()),
            (variables::RUNNER_OS.to_string(), defaults::CONTAINER_OS.to_string()),
            (variables::RUNNER_TEMP.to_string(), defaults::CONTAINER_TEMP.to_string()),
        ]);

        let container = self.scope.driver.new_container(NewContainerInput {
            image,
            username,
            password,
            entrypoint: sandbox::KEEPALIVE_ENTRYPOINT.iter().map(|s| s.to_string()).collect(),
            cmd: Vec::new(),
            working_dir: config.container_workdir(),
            env: env_list(&seed),
            binds,
            mounts,
            name: self.job_container_name(),
            network_mode: sandbox::NETWORK_MODE.to_string(),
            privileged: config.privileged,
            userns_mode: config.userns_mode.clone(),
            platform: config.container_architecture.clone(),
            hostname,
            allocate_terminal: config.allocate_terminal,
            output: Some(self.output_writer()),
        });
        self.job_container = Some(container);
        Ok(())
    }

    fn start_host(&mut self) -> Result<()> {
        let config = self.scope.config.clone();
        let cache_dir = config.action_cache_dir();
        let misc_dir = cache_dir.join(uuid::Uuid::new_v4().simple().to_string());
        let root = if config.bind_workdir {
            config.workdir.clone()
        } else {
            misc_dir.join("hostexecutor")
        };

        let host = HostContainer::create(root.clone(), misc_dir, self.output_writer())?;
        tracing::info!(target: "job", "Running on the host in {}", root.display());

        self.local = true;
        self.act_path = host.act_path().to_string_lossy().into_owned();
        self.workspace = root.to_string_lossy().into_owned();

        let tool_cache = cache_dir.join("tool_cache").to_string_lossy().into_owned();
        let temp = host.temp_dir().to_string_lossy().into_owned();
        let env = self.env_mut();
        env.insert(variables::RUNNER_TOOL_CACHE.to_string(), tool_cache);
        env.insert(variables::RUNNER_OS.to_string(), VarUtil::os().to_string());
        env.insert(variables::RUNNER_ARCH.to_string(), VarUtil::os_architecture().to_string());
        env.insert(variables::RUNNER_TEMP.to_string(), temp);
        for (key, value) in VarUtil::process_env() {
            env.entry(key).or_insert(value);
        }

        self.job_container = Some(Arc::new(host));
        Ok(())
    }

    fn start_pipeline(&self) -> Executor<RunContext> {
        let (copy_to, copy_workspace) = match self.local_checkout_path() {
            Some(path) if !self.scope.config.bind_workdir => (join_path(&self.workspace, &path), true),
            _ => (String::new(), false),
        };

        let copy_workspace = Executor::unit(move |rc: &mut RunContext, ctx: &ExecContext| {
            let copy_to = copy_to.clone();
            async move {
                let config = rc.scope.config.clone();
                rc.container()?
                    .copy_dir(ctx, &copy_to, &config.workdir, config.use_gitignore)
                    .await
            }
            .boxed()
        })
        .if_bool(copy_workspace);

        let stage_files = Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
            async move {
                let files = [
                    FileEntry::new(file_commands::EVENT, 0o644, rc.scope.event_json.clone()),
                    FileEntry::new(file_commands::ENV, 0o666, ""),
                    FileEntry::new(file_commands::PATH, 0o666, ""),
                ];
                rc.container()?
                    .copy(ctx, &format!("{}/", rc.act_path), &files)
                    .await
            }
            .boxed()
        });

        let mark_started = Executor::unit(|rc: &mut RunContext, _ctx: &ExecContext| {
            async move {
                rc.container_state = ContainerState::Started;
                Ok(())
            }
            .boxed()
        });

        if self.local {
            return Executor::sequence([mark_started, copy_workspace, stage_files]);
        }

        Executor::sequence([
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move {
                    let force = rc.scope.config.force_pull;
                    rc.container()?.pull(ctx, force).await
                }
                .boxed()
            }),
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move { rc.remove_job_container(ctx).await }.boxed()
            }),
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move {
                    let config = rc.scope.config.clone();
                    rc.container()?
                        .create(ctx, &config.container_cap_add, &config.container_cap_drop)
                        .await
                }
                .boxed()
            }),
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move { rc.container()?.start(ctx, false).await }.boxed()
            }),
            mark_started,
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move {
                    let container = rc.container()?;
                    container.update_from_image_env(ctx, rc.env_mut()).await?;
                    container
                        .update_from_env(ctx, sandbox::ETC_ENVIRONMENT, rc.env_mut())
                        .await
                }
                .boxed()
            }),
            Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
                async move {
                    let command: Vec<String> = ["mkdir", "-m", "0777", "-p", rc.act_path.as_str()]
                        .iter()
                        .map(|s| s.to_string())
                        .collect();
                    let env = rc.job_env();
                    rc.container()?.exec(ctx, &command, &env, "root", "").await
                }
                .boxed()
            }),
            copy_workspace,
            stage_files,
        ])
    }

    /// Remove the container and, outside host mode, its volumes. Does
    /// nothing when containers are reused.
    pub fn stop_job_container() -> Executor<RunContext> {
        Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
            async move {
                rc.remove_job_container(ctx).await?;
                if rc.job_container.is_some() {
                    rc.container_state = ContainerState::Stopped;
                }
                Ok(())
            }
            .boxed()
        })
    }

    async fn remove_job_container(&mut self, ctx: &ExecContext) -> Result<()> {
        let Some(container) = self.job_container.clone() else {
            return Ok(());
        };
        if self.scope.config.reuse_containers {
            return Ok(());
        }

        container.remove(ctx).await?;
        if !self.local {
            let name = self.job_container_name();
            self.remove_volume(ctx, &name).await;
            self.remove_volume(ctx, &format!("{name}-env")).await;
        }
        Ok(())
    }

    async fn remove_volume(&self, ctx: &ExecContext, name: &str) {
        match self.scope.driver.remove_volume(ctx, name, false).await {
            Ok(()) => tracing::debug!(target: "job", "Removed volume {}", name),
            Err(e) if ContainerError::is_not_found(&e) => {
                tracing::debug!(target: "job", "Volume {} already removed", name)
            }
            Err(e) => tracing::warn!(target: "job", "Failed to remove volume {}: {:#}", name, e),
        }
    }

    /// Release the container handle. Nothing to do without one.
    pub fn close_job_container() -> Executor<RunContext> {
        Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
            async move {
                let Some(container) = rc.job_container.clone() else {
                    return Ok(());
                };
                container.close(ctx).await?;
                rc.container_state = ContainerState::Closed;
                Ok(())
            }
            .boxed()
        })
    }

    // -----------------------------------------------------------------------
    // Pipelines
    // -----------------------------------------------------------------------

    /// The whole job: start, steps, outputs, then teardown. Skipped when the
    /// job's `if:` is false or no image matches its runner labels.
    pub fn executor(&self) -> Executor<RunContext> {
        let mut units = vec![
            Executor::unit(|rc: &mut RunContext, _ctx: &ExecContext| {
                async move {
                    if !rc.scope.matrix.is_empty() {
                        let matrix = Value::Object(rc.scope.matrix.clone());
                        tracing::info!(target: "job", "Matrix: {}", matrix);
                    }
                    Ok(())
                }
                .boxed()
            }),
            Self::start_job_container(),
        ];
        units.extend(
            with_positional_ids(self.scope.run.job().steps.clone())
                .into_iter()
                .map(Self::step_executor),
        );

        Executor::sequence(units)
            .finally(Self::interpolate_outputs())
            .finally(Self::teardown())
            .when(|rc: &RunContext, _ctx: &ExecContext| match rc.is_enabled() {
                Ok(enabled) => enabled,
                Err(e) => {
                    tracing::error!(target: "job", "Error in if: expression: {:#}", e);
                    false
                }
            })
    }

    fn teardown() -> Executor<RunContext> {
        Executor::unit(|rc: &mut RunContext, ctx: &ExecContext| {
            async move {
                if rc.job_container.is_none() {
                    return Ok(());
                }
                if rc.scope.config.auto_remove {
                    tracing::info!(target: "job", "Cleaning up container for job {}", rc.name);
                    let stop = Self::stop_job_container();
                    if let Err(e) = stop.run(rc, ctx).await {
                        tracing::error!(target: "job", "Error while cleaning container: {:#}", e);
                    }
                }
                let close = Self::close_job_container();
                if let Err(e) = close.run(rc, ctx).await {
                    tracing::error!(target: "job", "Error while closing container: {:#}", e);
                }
                Ok(())
            }
            .boxed()
        })
    }

    /// Whether the job should run at all.
    pub fn is_enabled(&self) -> Result<bool> {
        let job = self.scope.run.job();
        let condition = job.if_expr.value();
        let run_job = self
            .expr_eval
            .evaluate_bool(condition)
            .map_err(|e| anyhow!("Error in if-expression: \"if: {}\" ({:#})", condition, e))?;
        if !run_job {
            tracing::debug!(target: "job", "Skipping job '{}' due to '{}'", self.name, condition);
            return Ok(false);
        }

        if self.platform_image().is_empty() {
            let labels: Vec<String> = job
                .runs_on()
                .iter()
                .map(|label| self.expr_eval.interpolate(label))
                .collect();
            for label in &labels {
                tracing::info!(
                    target: "job",
                    "Skipping unsupported platform -- Try running with `-P {}=...`",
                    label
                );
            }
            tracing::warn!(target: "job", "{}", ConfigurationError::MissingPlatform { labels });
            return Ok(false);
        }
        Ok(true)
    }

    /// Interpolate the job's declared outputs.
    pub fn interpolate_outputs() -> Executor<RunContext> {
        Executor::unit(|rc: &mut RunContext, _ctx: &ExecContext| {
            async move {
                let evaluator = rc.new_expression_evaluator();
                let outputs = rc.scope.run.job().outputs.clone();
                for (name, value) in outputs {
                    let interpolated = evaluator.interpolate(&value);
                    rc.job_outputs.insert(name, interpolated);
                }
                Ok(())
            }
            .boxed()
        })
    }

    /// Run one step: evaluate its condition, set up its environment, run its
    /// body and collect what it wrote to the file-command files.
    pub fn step_executor(step: Step) -> Executor<RunContext> {
        let step = Arc::new(step);
        Executor::unit(move |rc: &mut RunContext, ctx: &ExecContext| {
            let step = step.clone();
            async move { rc.run_step(step, ctx).await }.boxed()
        })
    }

    async fn run_step(&mut self, step: Arc<Step>, ctx: &ExecContext) -> Result<()> {
        let runner = self.scope.step_runner.clone();
        self.current_step = step.id.clone();
        self.step_env.clear();
        self.step_results.insert(step.id.clone(), StepResult::pending());

        let enabled = match runner.is_enabled(self, &step) {
            Ok(enabled) => enabled,
            Err(e) => {
                self.settle_current(StepStatus::Failure);
                return Err(e);
            }
        };
        if !enabled {
            tracing::debug!(target: "step", "Skipping step '{}' due to '{}'", step, step.if_expr.value());
            self.settle_current(StepStatus::Skipped);
            return Ok(());
        }

        self.expr_eval = runner.setup_env(self, &step, ctx).await?;
        tracing::info!(target: "step", "Run {}", step);

        let output_file = format!("{}/{}", self.act_path, file_commands::OUTPUT);
        let state_file = format!("{}/{}", self.act_path, file_commands::STATE);
        self.step_env.insert(variables::GITHUB_OUTPUT.to_string(), output_file.clone());
        self.step_env.insert(variables::GITHUB_STATE.to_string(), state_file.clone());

        let container = self.container()?;
        let reset = [
            FileEntry::new(file_commands::OUTPUT, 0o666, ""),
            FileEntry::new(file_commands::STATE, 0o666, ""),
        ];
        if let Err(e) = container.copy(ctx, &self.act_path, &reset).await {
            tracing::debug!(target: "step", "Failed to reset file commands: {:#}", e);
        }

        let body = runner.executor(step.clone());
        let result = match body.run(self, ctx).await {
            Ok(()) => {
                tracing::info!(target: "step", "Success - {}", step);
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "step", "Failure - {}: {:#}", step, e);
                if let Some(current) = self.step_results.get_mut(&step.id) {
                    current.outcome = StepStatus::Failure;
                    current.conclusion = if step.continue_on_error {
                        StepStatus::Success
                    } else {
                        StepStatus::Failure
                    };
                }
                if step.continue_on_error {
                    tracing::info!(target: "step", "Failed but continue next step");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        };

        let mut outputs = HashMap::new();
        container.update_from_env(ctx, &output_file, &mut outputs).await?;
        let mut outputs: Vec<(String, String)> = outputs.into_iter().collect();
        outputs.sort();
        for (name, value) in outputs {
            self.set_output(&name, value);
        }

        if let Err(e) = self.apply_file_commands(&container, ctx, &state_file).await {
            tracing::warn!(target: "step", "Failed to read file commands of {}: {:#}", step, e);
        }
        result
    }

    fn settle_current(&mut self, status: StepStatus) {
        if let Some(current) = self.step_results.get_mut(&self.current_step) {
            current.settle(status);
        }
    }

    /// Fold `envs.txt` into the job env, `paths.txt` into `extra_path` and
    /// the state file into the step's saved state.
    async fn apply_file_commands(
        &mut self,
        container: &Arc<dyn Container>,
        ctx: &ExecContext,
        state_file: &str,
    ) -> Result<()> {
        let env_file = format!("{}/{}", self.act_path, file_commands::ENV);
        container.update_from_env(ctx, &env_file, self.env_mut()).await?;

        let mut probe = HashMap::from([(
            variables::GITHUB_PATH.to_string(),
            format!("{}/{}", self.act_path, file_commands::PATH),
        )]);
        container.update_from_path(ctx, &mut probe).await?;
        if let Some(added) = probe.get(PATH_VARIABLE) {
            for entry in added.split(':').rev().filter(|e| !e.is_empty()) {
                if !self.extra_path.iter().any(|p| p == entry) {
                    self.extra_path.insert(0, entry.to_string());
                }
            }
        }

        let mut state = HashMap::new();
        container.update_from_env(ctx, state_file, &mut state).await?;
        if !state.is_empty() {
            self.step_state.insert(self.current_step.clone(), state);
        }
        Ok(())
    }

    /// Publish an output of the current step, following any mapping to
    /// another step's output.
    pub fn set_output(&mut self, name: &str, value: String) {
        let key = MappableOutput::new(self.current_step.clone(), name);
        let target = self
            .output_mappings
            .get(&key)
            .cloned()
            .unwrap_or(key);

        match self.step_results.get_mut(&target.step_id) {
            Some(result) => {
                result.outputs.insert(target.output_name, value);
            }
            None => tracing::info!(
                target: "step",
                "Ignoring output '{}' for unknown step '{}'",
                target.output_name,
                target.step_id
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Composite actions
    // -----------------------------------------------------------------------

    /// A scope for running `action`'s steps on behalf of `step`.
    ///
    /// The child shares the job scope and container, starts with empty step
    /// results and sees the invoking step's interpolated env plus `inputs`.
    pub fn composite_child(
        &self,
        step: &Step,
        action: Action,
        action_path: String,
        inputs: HashMap<String, String>,
    ) -> Result<RunContext> {
        if self.depth >= COMPOSITE_ACTIONS_MAX_DEPTH {
            bail!(
                "exceeded max depth {} for composite actions while running '{}'",
                COMPOSITE_ACTIONS_MAX_DEPTH,
                step
            );
        }

        let env: HashMap<String, String> = VarUtil::merge_env([&self.job_env(), &step.env])
            .into_iter()
            .map(|(key, value)| {
                let value = self.expr_eval.interpolate(&value);
                (key, value)
            })
            .collect();

        let mut context_data = Map::new();
        if let Some(github) = self.context_data.get("github") {
            context_data.insert("github".to_string(), github.clone());
        }

        let mut child = RunContext {
            scope: self.scope.clone(),
            name: self.name.clone(),
            env: Some(env),
            extra_path: self.extra_path.clone(),
            current_step: String::new(),
            step_results: HashMap::new(),
            step_env: HashMap::new(),
            step_state: HashMap::new(),
            output_mappings: HashMap::new(),
            inputs,
            context_data,
            expr_eval: self.expr_eval.clone(),
            job_container: self.job_container.clone(),
            container_state: self.container_state,
            parent: Some(Arc::new(ParentScope {
                job_status: self.job_context().status,
                step_id: self.current_step.clone(),
            })),
            composite: Some(Arc::new(action)),
            action_path,
            local: self.local,
            act_path: self.act_path.clone(),
            workspace: self.workspace.clone(),
            depth: self.depth + 1,
            job_outputs: HashMap::new(),
        };
        child.expr_eval = child.new_expression_evaluator();
        tracing::debug!(
            target: "step",
            "Expanding composite action for step '{}' at depth {}",
            child.parent.as_deref().map(|p| p.step_id.as_str()).unwrap_or_default(),
            child.depth
        );
        Ok(child)
    }

    /// Run every step of the composite action. A failed or cancelled step is
    /// recorded and the next step still runs; the last recorded error is the
    /// result.
    pub fn composite_executor(&self) -> Executor<RunContext> {
        let steps = self
            .composite
            .as_ref()
            .map(|action| action.runs.steps.clone())
            .unwrap_or_default();
        let units: Arc<Vec<Executor<RunContext>>> = Arc::new(
            with_positional_ids(steps)
                .into_iter()
                .map(Self::step_executor)
                .collect(),
        );

        Executor::unit(move |rc: &mut RunContext, ctx: &ExecContext| {
            let units = units.clone();
            async move {
                let ctx = ctx.with_job_error_container();
                for unit in units.iter() {
                    match unit.run(rc, &ctx).await {
                        Err(e) => {
                            tracing::error!(target: "step", "{:#}", e);
                            ctx.set_job_error(e);
                        }
                        Ok(()) if ctx.is_cancelled() => {
                            tracing::error!(target: "step", "{}", PipelineError::Cancelled);
                            ctx.set_job_error(PipelineError::Cancelled.into());
                        }
                        Ok(()) => {}
                    }
                }
                match ctx.take_job_error() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            .boxed()
        })
    }
}

/// Give every step without an id its index.
fn with_positional_ids(steps: Vec<Step>) -> Vec<Step> {
    steps
        .into_iter()
        .enumerate()
        .map(|(i, mut step)| {
            if step.id.is_empty() {
                step.id = i.to_string();
            }
            step
        })
        .collect()
}

fn string_object(map: &HashMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn join_path(base: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches("./").trim_matches('/');
    if rel.is_empty() || rel == "." {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

/// Mount modifier for the workdir bind.
fn bind_modifiers() -> &'static str {
    if selinux_enabled() {
        ":z"
    } else if cfg!(target_os = "macos") {
        ":delegated"
    } else {
        ""
    }
}

fn selinux_enabled() -> bool {
    cfg!(target_os = "linux") && Path::new("/sys/fs/selinux/enforce").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::{MockContainer, MockDriver, MockFs};
    use crate::model::Workflow;
    use std::path::PathBuf;

    const WORKFLOW: &str = r#"
name: CI
env:
  LEVEL: workflow
  WF: "1"
jobs:
  build:
    runs-on: ubuntu-latest
    env:
      LEVEL: job
    outputs:
      greeting: ${{ steps.hello.outputs.greeting }}
    steps:
      - id: hello
        run: echo hello
      - id: second
        run: echo second
"#;

    struct Fixture {
        rc: RunContext,
        container: Arc<MockContainer>,
        driver: Arc<MockDriver>,
    }

    fn fixture(yaml: &str, configure: impl FnOnce(&mut Config)) -> Fixture {
        fixture_with(yaml, configure, |scope| scope)
    }

    fn fixture_with(
        yaml: &str,
        configure: impl FnOnce(&mut Config),
        customize: impl FnOnce(JobScope) -> JobScope,
    ) -> Fixture {
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let run = Run::new(workflow, "build").unwrap();
        let mut config = Config {
            workdir: PathBuf::from("/work/project"),
            ..Config::default()
        };
        config.add_platform("ubuntu-latest", "node:16");
        configure(&mut config);

        let container = Arc::new(MockContainer::new());
        let driver = Arc::new(MockDriver::new(container.clone()));
        let scope = customize(JobScope::new(Arc::new(config), Arc::new(run), driver.clone()));
        Fixture {
            rc: RunContext::new(Arc::new(scope)),
            container,
            driver,
        }
    }

    fn script(command: &[String]) -> &str {
        command.last().map(String::as_str).unwrap_or_default()
    }

    /// Scripts containing `outputs` write two outputs; `fail` exits non-zero.
    fn scripted(fs_env: &HashMap<String, String>, command: &[String], fs: &MockFs) -> Result<()> {
        let script = script(command);
        if script.contains("outputs") {
            fs.lock().insert(fs_env["GITHUB_OUTPUT"].clone(), "a=1\nb=2\n".into());
        }
        if script.contains("hello") {
            fs.lock().insert(fs_env["GITHUB_OUTPUT"].clone(), "greeting=hi\n".into());
        }
        if script.contains("fail") {
            bail!("exit code 1");
        }
        Ok(())
    }

    fn script_hook(container: &MockContainer) {
        container.on_exec(Arc::new(
            |command: &[String], env: &HashMap<String, String>, fs: &MockFs| -> Result<()> {
                scripted(env, command, fs)
            },
        ));
    }

    async fn run_job(rc: &mut RunContext) -> Result<()> {
        let executor = rc.executor();
        executor.run(rc, &ExecContext::default()).await
    }

    fn execs(container: &MockContainer) -> Vec<String> {
        container
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("exec sh"))
            .collect()
    }

    #[test]
    fn test_get_env_layers_and_marker() {
        let mut f = fixture(WORKFLOW, |config| {
            config.env.insert("LEVEL".into(), "global".into());
            config.env.insert("G".into(), "g".into());
        });
        let env = f.rc.get_env().clone();
        assert_eq!(env["LEVEL"], "job");
        assert_eq!(env["WF"], "1");
        assert_eq!(env["G"], "g");
        assert_eq!(env[LOCAL_RUN_MARKER], "true");
        assert_eq!(f.rc.get_env(), &env);
    }

    #[test]
    fn test_binds_and_mounts() {
        let f = fixture(WORKFLOW, |_| {});
        let name = f.rc.job_container_name();
        let (binds, mounts) = f.rc.get_binds_and_mounts();
        assert_eq!(binds, vec!["/var/run/docker.sock:/var/run/docker.sock"]);
        assert_eq!(mounts["act-toolcache"], "/toolcache");
        assert_eq!(mounts[&format!("{name}-env")], "/var/run/act");
        assert_eq!(mounts[&name], "/work/project");

        let f = fixture(WORKFLOW, |config| {
            config.bind_workdir = true;
            config.container_daemon_socket = "/run/podman.sock".into();
        });
        let (binds, mounts) = f.rc.get_binds_and_mounts();
        assert_eq!(binds[0], "/run/podman.sock:/var/run/docker.sock");
        assert!(binds[1].starts_with("/work/project:/work/project"));
        assert_eq!(mounts.len(), 2);
    }

    #[tokio::test]
    async fn test_start_order() {
        let mut f = fixture(WORKFLOW, |_| {});
        f.container.put_file("/etc/environment", "LANG=C.UTF-8\n");
        f.container.set_image_env("IMAGE_VAR", "x");
        let name = f.rc.job_container_name();

        let start = RunContext::start_job_container();
        start.run(&mut f.rc, &ExecContext::default()).await.unwrap();

        assert_eq!(
            f.container.ops(),
            vec![
                format!("new_container {name}"),
                "pull force=false".to_string(),
                "remove".to_string(),
                format!("volume_rm {name} force=false"),
                format!("volume_rm {name}-env force=false"),
                "create add= drop=".to_string(),
                "start attach=false".to_string(),
                "update_from_image_env".to_string(),
                "exec mkdir -m 0777 -p /var/run/act user=root".to_string(),
                "copy /var/run/act/ workflow/event.json:644,workflow/envs.txt:666,workflow/paths.txt:666"
                    .to_string(),
            ]
        );
        assert_eq!(f.rc.container_state(), ContainerState::Started);
        let env = f.rc.get_env();
        assert_eq!(env["LANG"], "C.UTF-8");
        assert_eq!(env["IMAGE_VAR"], "x");

        let input = &f.driver.inputs()[0];
        assert_eq!(input.image, "node:16");
        assert_eq!(input.entrypoint, vec!["/usr/bin/tail", "-f", "/dev/null"]);
        assert!(input.env.contains(&"RUNNER_OS=Linux".to_string()));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut f = fixture(WORKFLOW, |_| {});
        let ctx = ExecContext::default();
        RunContext::start_job_container().run(&mut f.rc, &ctx).await.unwrap();
        f.driver.add_volume(&f.rc.job_container_name());

        let stop = RunContext::stop_job_container();
        stop.run(&mut f.rc, &ctx).await.unwrap();
        stop.run(&mut f.rc, &ctx).await.unwrap();
        assert!(!f.driver.has_volume(&f.rc.job_container_name()));
        assert_eq!(f.rc.container_state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn test_volume_failure_does_not_block_sibling() {
        let mut f = fixture(WORKFLOW, |_| {});
        let ctx = ExecContext::default();
        RunContext::start_job_container().run(&mut f.rc, &ctx).await.unwrap();
        f.driver.fail_volume_removal("daemon unavailable");

        RunContext::stop_job_container().run(&mut f.rc, &ctx).await.unwrap();
        let name = f.rc.job_container_name();
        let ops = f.container.ops();
        assert_eq!(ops[ops.len() - 2], format!("volume_rm {name} force=false"));
        assert_eq!(ops[ops.len() - 1], format!("volume_rm {name}-env force=false"));
    }

    #[tokio::test]
    async fn test_reuse_keeps_container() {
        let mut f = fixture(WORKFLOW, |config| config.reuse_containers = true);
        let ctx = ExecContext::default();
        RunContext::start_job_container().run(&mut f.rc, &ctx).await.unwrap();
        RunContext::stop_job_container().run(&mut f.rc, &ctx).await.unwrap();
        assert!(!f.container.ops().iter().any(|op| op == "remove" || op.starts_with("volume_rm")));
    }

    #[tokio::test]
    async fn test_close_without_container() {
        let mut f = fixture(WORKFLOW, |_| {});
        RunContext::close_job_container()
            .run(&mut f.rc, &ExecContext::default())
            .await
            .unwrap();
        assert_eq!(f.rc.container_state(), ContainerState::NotStarted);
        assert!(f.container.ops().is_empty());
    }

    #[tokio::test]
    async fn test_job_runs_steps_and_interpolates_outputs() {
        let mut f = fixture(WORKFLOW, |_| {});
        script_hook(&f.container);
        run_job(&mut f.rc).await.unwrap();

        assert_eq!(execs(&f.container).len(), 2);
        assert_eq!(f.rc.steps_context()["hello"].outputs["greeting"], "hi");
        assert_eq!(f.rc.job_outputs()["greeting"], "hi");
        assert_eq!(f.container.ops().last().unwrap(), "close");
        assert_eq!(f.rc.container_state(), ContainerState::Closed);

        let env = &f.container.exec_envs()[1];
        assert_eq!(env["GITHUB_OUTPUT"], "/var/run/act/workflow/outputcmd.txt");
        assert_eq!(env["GITHUB_JOB"], "build");
        assert_eq!(env["CI"], "true");
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - id: flaky
        run: fail here
        continue-on-error: true
      - id: after
        run: echo after
"#;
        let mut f = fixture(yaml, |_| {});
        script_hook(&f.container);
        run_job(&mut f.rc).await.unwrap();

        let flaky = &f.rc.steps_context()["flaky"];
        assert_eq!(flaky.outcome, StepStatus::Failure);
        assert_eq!(flaky.conclusion, StepStatus::Success);
        assert_eq!(f.rc.steps_context()["after"].conclusion, StepStatus::Success);
        assert_eq!(execs(&f.container).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_halts_and_tears_down() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - id: broken
        run: fail with outputs
      - id: never
        run: echo never
"#;
        let mut f = fixture(yaml, |config| config.auto_remove = true);
        script_hook(&f.container);
        assert!(run_job(&mut f.rc).await.is_err());

        let broken = &f.rc.steps_context()["broken"];
        assert_eq!(broken.conclusion, StepStatus::Failure);
        assert_eq!(broken.outputs["a"], "1");
        assert_eq!(broken.outputs["b"], "2");
        assert!(!f.rc.steps_context().contains_key("never"));
        assert_eq!(execs(&f.container).len(), 1);

        let ops = f.container.ops();
        let tail: Vec<&str> = ops.iter().rev().take(4).rev().map(String::as_str).collect();
        assert_eq!(tail[0], "remove");
        assert!(tail[1].starts_with("volume_rm"));
        assert!(tail[2].starts_with("volume_rm"));
        assert_eq!(tail[3], "close");
    }

    #[tokio::test]
    async fn test_start_failure_skips_steps_but_closes() {
        let mut f = fixture(WORKFLOW, |_| {});
        f.container.fail_on("create", "no space left");
        let err = run_job(&mut f.rc).await.unwrap_err();
        assert!(format!("{:#}", err).contains("no space left"));
        assert!(execs(&f.container).is_empty());
        assert_eq!(f.container.ops().last().unwrap(), "close");
    }

    #[tokio::test]
    async fn test_file_commands_feed_later_steps() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - id: setup
        run: echo setup
      - id: use
        run: echo use
"#;
        let mut f = fixture(yaml, |_| {});
        f.container.on_exec(Arc::new(|command: &[String], env: &HashMap<String, String>, fs: &MockFs| -> Result<()> {
            if script(command) == "echo setup" {
                let mut fs = fs.lock();
                fs.insert(env["GITHUB_ENV"].clone(), "TOOL=ready\n".into());
                fs.insert(env["GITHUB_PATH"].clone(), "/opt/tool/bin\n".into());
                fs.insert(env["GITHUB_STATE"].clone(), "pid=42\n".into());
            }
            Ok(())
        }));
        run_job(&mut f.rc).await.unwrap();

        let env = &f.container.exec_envs()[2];
        assert_eq!(env["TOOL"], "ready");
        assert!(env["PATH"].starts_with("/opt/tool/bin:"));
        assert_eq!(f.rc.step_state["setup"]["pid"], "42");
        assert_eq!(f.rc.extra_path, vec!["/opt/tool/bin"]);
    }

    #[tokio::test]
    async fn test_skips_unmapped_platform() {
        let yaml = "name: CI\njobs:\n  build:\n    runs-on: [windows-latest]\n    steps:\n      - run: echo\n";
        let mut f = fixture(yaml, |_| {});
        run_job(&mut f.rc).await.unwrap();
        assert!(f.container.ops().is_empty());
        assert!(!f.rc.is_enabled().unwrap());
    }

    #[tokio::test]
    async fn test_job_if_false_skips() {
        let yaml = "name: CI\njobs:\n  build:\n    runs-on: ubuntu-latest\n    if: ${{ false }}\n    steps:\n      - run: echo\n";
        let mut f = fixture(yaml, |_| {});
        run_job(&mut f.rc).await.unwrap();
        assert!(f.container.ops().is_empty());
    }

    #[tokio::test]
    async fn test_step_if_false_is_skipped() {
        let yaml = r#"
name: CI
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - id: skipped
        if: env.MISSING == 'yes'
        run: echo skipped
"#;
        let mut f = fixture(yaml, |_| {});
        run_job(&mut f.rc).await.unwrap();
        let skipped = &f.rc.steps_context()["skipped"];
        assert_eq!(skipped.outcome, StepStatus::Skipped);
        assert_eq!(skipped.conclusion, StepStatus::Skipped);
        assert!(execs(&f.container).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut f = fixture(WORKFLOW, |_| {});
        let ctx = ExecContext::default();
        ctx.cancel_token().cancel();
        let executor = f.rc.executor();
        let err = executor.run(&mut f.rc, &ctx).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Cancelled)));
        assert!(f.container.ops().is_empty());
    }

    fn with_container(block: &str) -> String {
        format!("name: CI\njobs:\n  build:\n    runs-on: ubuntu-latest\n    container:\n{block}    steps: []\n")
    }

    #[test]
    fn test_credentials() {
        let f = fixture(&with_container("      image: node:16\n"), |config| {
            config.secrets.insert("DOCKER_USERNAME".into(), "legacy".into());
            config.secrets.insert("DOCKER_PASSWORD".into(), "secret".into());
        });
        assert_eq!(f.rc.handle_credentials().unwrap(), ("legacy".into(), "secret".into()));

        let f = fixture(
            &with_container("      image: node:16\n      credentials:\n        username: u\n"),
            |_| {},
        );
        assert_eq!(
            f.rc.handle_credentials().unwrap_err(),
            ConfigurationError::InvalidCredentialCount
        );

        let f = fixture(
            &with_container(
                "      image: node:16\n      credentials:\n        username: u\n        password: ${{ secrets.MISSING }}\n",
            ),
            |_| {},
        );
        assert_eq!(
            f.rc.handle_credentials().unwrap_err(),
            ConfigurationError::CredentialInterpolation { field: "password" }
        );

        let f = fixture(
            &with_container(
                "      image: node:16\n      credentials:\n        username: ${{ secrets.USER }}\n        password: p4ss\n",
            ),
            |config| {
                config.secrets.insert("USER".into(), "octo".into());
            },
        );
        assert_eq!(f.rc.handle_credentials().unwrap(), ("octo".into(), "p4ss".into()));
        assert_eq!(f.rc.scope.masker().mask_secrets("p4ss"), "***");
    }

    #[test]
    fn test_hostname() {
        let hostname = |options: &str| {
            fixture(&with_container(&format!("      image: node:16\n      options: {options}\n")), |_| {})
                .rc
                .hostname()
        };
        assert_eq!(hostname("--cpus 2 --hostname box"), "box");
        assert_eq!(hostname("-h box"), "box");
        assert_eq!(hostname("--hostname=box"), "box");
        assert_eq!(hostname("--cpus 2"), "");
        assert_eq!(hostname("--hostname \"box"), "");
        assert_eq!(fixture(WORKFLOW, |_| {}).rc.hostname(), "");
    }

    #[test]
    fn test_platform_image() {
        let f = fixture(WORKFLOW, |_| {});
        assert_eq!(f.rc.platform_image(), "node:16");

        let f = fixture(&with_container("      image: alpine:3\n"), |_| {});
        assert_eq!(f.rc.platform_image(), "alpine:3");

        let yaml = "name: CI\njobs:\n  build:\n    runs-on: [self-hosted, Ubuntu-Latest]\n    steps: []\n";
        assert_eq!(fixture(yaml, |_| {}).rc.platform_image(), "node:16");
    }

    #[test]
    fn test_matrix_runs_on_resolves_image_os() {
        let yaml = "name: CI\njobs:\n  build:\n    runs-on: ${{ matrix.os }}\n    steps: []\n";
        let mut matrix = Map::new();
        matrix.insert("os".into(), Value::String("ubuntu-22.04".into()));
        let f = fixture_with(
            yaml,
            |config| config.add_platform("ubuntu-22.04", "node:16"),
            move |scope| scope.with_matrix(matrix),
        );
        assert_eq!(f.rc.platform_image(), "node:16");

        let mut env = HashMap::new();
        f.rc.with_github_env(&mut env);
        assert_eq!(env["ImageOS"], "ubuntu22");
    }

    #[test]
    fn test_set_output_follows_mapping() {
        let mut f = fixture(WORKFLOW, |_| {});
        f.rc.step_results.insert("a".into(), StepResult::pending());
        f.rc.step_results.insert("b".into(), StepResult::pending());
        f.rc.current_step = "a".into();
        f.rc.output_mappings
            .insert(MappableOutput::new("a", "raw"), MappableOutput::new("b", "mapped"));

        f.rc.set_output("raw", "1".into());
        f.rc.set_output("plain", "2".into());
        assert_eq!(f.rc.step_results["b"].outputs["mapped"], "1");
        assert_eq!(f.rc.step_results["a"].outputs["plain"], "2");
        assert!(!f.rc.step_results["a"].outputs.contains_key("raw"));
    }

    fn composite(steps: &str) -> Action {
        serde_yaml::from_str(&format!("runs:\n  using: composite\n  steps:\n{steps}")).unwrap()
    }

    #[tokio::test]
    async fn test_composite_records_error_and_continues() {
        let mut f = fixture(WORKFLOW, |_| {});
        script_hook(&f.container);
        let ctx = ExecContext::default();
        RunContext::start_job_container().run(&mut f.rc, &ctx).await.unwrap();

        let action = composite(
            "    - run: fail first\n    - run: echo ${{ inputs.who }}\n      if: always()\n",
        );
        let inputs = HashMap::from([("who".to_string(), "octo".to_string())]);
        let step = Step {
            id: "outer".into(),
            uses: "./greet".into(),
            ..Step::default()
        };
        let mut child = f
            .rc
            .composite_child(&step, action, "/work/project/greet".into(), inputs)
            .unwrap();
        let executor = child.composite_executor();
        let err = executor.run(&mut child, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("exit code 1"));

        assert_eq!(child.steps_context()["0"].conclusion, StepStatus::Failure);
        assert_eq!(child.steps_context()["1"].conclusion, StepStatus::Success);
        assert!(execs(&f.container).iter().any(|op| op.contains("echo octo")));
        assert!(f.rc.steps_context().is_empty());
        assert_eq!(child.github_context().action_path, "/work/project/greet");
    }

    #[test]
    fn test_composite_depth_limit() {
        let f = fixture(WORKFLOW, |_| {});
        let step = Step {
            uses: "./nested".into(),
            ..Step::default()
        };
        let mut rc = f.rc.composite_child(&step, Action::default(), String::new(), HashMap::new()).unwrap();
        for _ in 1..COMPOSITE_ACTIONS_MAX_DEPTH {
            rc = rc.composite_child(&step, Action::default(), String::new(), HashMap::new()).unwrap();
        }
        let err = rc
            .composite_child(&step, Action::default(), String::new(), HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("exceeded max depth"));
    }

    #[test]
    fn test_base_context_replaces_defaults() {
        let f = fixture(WORKFLOW, |_| {});
        let mut data = Map::new();
        data.insert("github".into(), serde_json::json!({"repository": "octo/base", "sha": "abc"}));
        let rc = f.rc.with_context_data(data);
        let ghc = rc.github_context();
        assert_eq!(ghc.repository, "octo/base");
        assert_eq!(ghc.sha, "abc");
        assert!(ghc.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_host_mode_start_and_cleanup() {
        let cache = tempfile::tempdir().unwrap();
        let yaml = "name: CI\njobs:\n  build:\n    runs-on: local\n    steps: []\n";
        let mut f = fixture(yaml, |config| {
            config.add_platform("local", SELF_HOSTED_IMAGE);
            config.action_cache_dir = Some(cache.path().to_path_buf());
        });
        let ctx = ExecContext::default();
        RunContext::start_job_container().run(&mut f.rc, &ctx).await.unwrap();

        assert!(f.rc.is_local());
        let act = PathBuf::from(f.rc.act_path());
        assert!(act.join("workflow/event.json").is_file());
        assert!(act.join("workflow/envs.txt").is_file());
        let env = f.rc.get_env();
        assert_eq!(env[variables::RUNNER_OS], VarUtil::os());
        assert!(env.contains_key(variables::RUNNER_TEMP));

        RunContext::stop_job_container().run(&mut f.rc, &ctx).await.unwrap();
        assert!(!act.exists());
        assert!(f.container.ops().is_empty());
    }

    struct RecordingRunner(Arc<parking_lot::Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl StepRunner for RecordingRunner {
        fn is_enabled(&self, _rc: &RunContext, _step: &Step) -> Result<bool> {
            Ok(true)
        }

        async fn setup_env(
            &self,
            rc: &mut RunContext,
            _step: &Step,
            _ctx: &ExecContext,
        ) -> Result<Arc<dyn ExpressionEvaluator>> {
            Ok(rc.new_expression_evaluator())
        }

        fn executor(&self, step: Arc<Step>) -> Executor<RunContext> {
            let seen = self.0.clone();
            Executor::unit(move |rc: &mut RunContext, _ctx: &ExecContext| {
                let seen = seen.clone();
                let step = step.clone();
                async move {
                    let os = rc.expression_evaluator().interpolate("${{ matrix.os }}");
                    seen.lock().push(format!("{}:{}", step.id, os));
                    Ok(())
                }
                .boxed()
            })
        }
    }

    #[derive(Default)]
    struct CountingFactory(std::sync::atomic::AtomicUsize);

    impl EvaluatorFactory for CountingFactory {
        fn create(&self, context: ExpressionContext) -> Arc<dyn ExpressionEvaluator> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            DefaultEvaluatorFactory.create(context)
        }
    }

    #[tokio::test]
    async fn test_pluggable_runner_factory_and_matrix() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let factory = Arc::new(CountingFactory::default());
        let mut matrix = Map::new();
        matrix.insert("os".into(), Value::String("bookworm".into()));

        let runner = RecordingRunner(seen.clone());
        let counting = factory.clone();
        let mut f = fixture_with(WORKFLOW, |_| {}, move |scope| {
            scope
                .with_matrix(matrix)
                .with_step_runner(Arc::new(runner))
                .with_evaluator_factory(counting)
        });
        run_job(&mut f.rc).await.unwrap();

        assert_eq!(*seen.lock(), vec!["hello:bookworm", "second:bookworm"]);
        assert!(factory.0.load(std::sync::atomic::Ordering::SeqCst) > 0);
        assert!(execs(&f.container).is_empty());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/work", ""), "/work");
        assert_eq!(join_path("/work/", "./src"), "/work/src");
    }
}
